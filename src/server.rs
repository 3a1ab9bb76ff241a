//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/ask` | Ask a question (`{query, page_ids?}`) |
//! | `GET`  | `/v1/ask` | The caller's recent questions, newest first |
//! | `GET`  | `/v1/ask/{id}` | One of the caller's questions |
//! | `POST` | `/v1/imports` | Import pages (`{pages: [{title, body}]}`) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Authentication
//!
//! An upstream auth layer is trusted to set `x-pagewise-user` to the
//! authenticated principal. Requests without it get `401`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "no_matching_pages", "message": "No pages matched your question.", "ask_request_id": "..." } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 |
//! | `empty_question` | 400 |
//! | `unauthorized` | 401 |
//! | `not_found` | 404 |
//! | `no_matching_pages` | 404 |
//! | `rate_limited` | 429, with `Retry-After` |
//! | `unexpected` / `internal` | 500 |
//! | `api_error` | 502 |

use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use chrono::{DateTime, Utc};
use pagewise_core::models::{AskErrorCode, AskRequest, AskStatus, PageRef};

use crate::app::Services;
use crate::ask::AskRejection;
use crate::embed_worker;
use crate::import::{import_pages, ImportError, ImportItem};
use crate::reconcile;
use crate::settings::{LiveSettings, SettingsSource};
use crate::throttle::{retry_after_secs, Admission, ThrottleScope};

/// Header carrying the authenticated user id.
pub const USER_HEADER: &str = "x-pagewise-user";

const PRUNE_INTERVAL_SECS: u64 = 300;

pub fn build_router(services: Services) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/ask", post(handle_ask).get(handle_history))
        .route("/v1/ask/{id}", get(handle_get_ask))
        .route("/v1/imports", post(handle_import))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(services)
}

/// Start the API with its background tasks: the embed worker and its
/// backfill sweep, the settings watcher, the reconciliation sweep, and
/// throttle pruning.
pub async fn run_server(settings: Arc<LiveSettings>) -> anyhow::Result<()> {
    let config = settings.current();
    let services = Services::open(settings.clone()).await?;

    let (events, _worker) = embed_worker::spawn(
        services.store.clone(),
        services.embedder.clone(),
        config.embedding.batch_size,
        config.embedding.queue_capacity,
    );
    let services = services.with_events(events);
    embed_worker::spawn_sweeper(
        services.store.clone(),
        services.embedder.clone(),
        services.settings.clone(),
    );

    settings.spawn_watcher();
    reconcile::spawn_reconciler(services.store.clone(), services.settings.clone());

    let throttle = services.throttle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            throttle.prune();
        }
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    serve_with_listener(listener, services).await
}

/// Serve on an already-bound listener until the process exits.
pub async fn serve_with_listener(
    listener: tokio::net::TcpListener,
    services: Services,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "pagewise listening");
    axum::serve(listener, build_router(services)).await?;
    Ok(())
}

// ============ Principal ============

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Principal(v.to_string()))
            .ok_or_else(|| AppError {
                status: StatusCode::UNAUTHORIZED,
                code: "unauthorized".to_string(),
                message: format!("missing {} header", USER_HEADER),
                ask_request_id: None,
                retry_after: None,
            })
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ask_request_id: Option<String>,
}

/// Application error rendered as the JSON error envelope.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    ask_request_id: Option<String>,
    retry_after: Option<Duration>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                ask_request_id: self.ask_request_id,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs(retry_after).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
        ask_request_id: None,
        retry_after: None,
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    error(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "request failed");
    error(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error")
}

fn rate_limited(retry_after: Duration) -> AppError {
    AppError {
        retry_after: Some(retry_after),
        ..error(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "rate limit exceeded")
    }
}

fn ask_failure_status(code: AskErrorCode) -> StatusCode {
    match code {
        AskErrorCode::EmptyQuestion => StatusCode::BAD_REQUEST,
        AskErrorCode::NoMatchingPages => StatusCode::NOT_FOUND,
        AskErrorCode::ApiError => StatusCode::BAD_GATEWAY,
        AskErrorCode::Unexpected => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /v1/ask ============

#[derive(Deserialize)]
struct AskBody {
    query: String,
    #[serde(default)]
    page_ids: Vec<String>,
}

#[derive(Serialize)]
struct AskResponse {
    id: String,
    status: AskStatus,
    answer: Option<String>,
    pages: Vec<PageRef>,
}

async fn handle_ask(
    State(services): State<Services>,
    Principal(user): Principal,
    body: Result<Json<AskBody>, JsonRejection>,
) -> Result<Json<AskResponse>, AppError> {
    let Json(body) = body.map_err(|e| bad_request(e.body_text()))?;

    let outcome = services
        .asker
        .submit(&user, &body.query, &body.page_ids)
        .await
        .map_err(|e| match e {
            AskRejection::QueryTooLong { .. } => bad_request(e.to_string()),
            AskRejection::RateLimited { retry_after } => rate_limited(retry_after),
            AskRejection::Storage(err) => internal(err),
        })?;

    if let Some(failure) = outcome.failure {
        return Err(AppError {
            ask_request_id: Some(outcome.request.id),
            ..error(
                ask_failure_status(failure.code),
                failure.code.as_str(),
                failure.message,
            )
        });
    }

    Ok(Json(AskResponse {
        id: outcome.request.id,
        status: outcome.request.status,
        answer: outcome.request.answer,
        pages: outcome.pages,
    }))
}

// ============ GET /v1/ask, GET /v1/ask/{id} ============

#[derive(Serialize)]
struct AskRequestView {
    id: String,
    query: String,
    status: AskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<AskErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'static str>,
    answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pages: Option<Vec<PageRef>>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl AskRequestView {
    fn new(request: AskRequest, pages: Option<Vec<PageRef>>) -> Self {
        Self {
            error_message: request.error.map(|c| c.label()),
            id: request.id,
            query: request.query,
            status: request.status,
            error: request.error,
            answer: request.answer,
            pages,
            created_at: request.created_at,
            resolved_at: request.resolved_at,
        }
    }
}

#[derive(Serialize)]
struct HistoryResponse {
    requests: Vec<AskRequestView>,
}

async fn handle_history(
    State(services): State<Services>,
    Principal(user): Principal,
) -> Result<Json<HistoryResponse>, AppError> {
    let limit = services.settings.current().ask.history_limit;
    let requests = services
        .store
        .list_ask_requests(&user, limit)
        .await
        .map_err(internal)?;
    Ok(Json(HistoryResponse {
        requests: requests
            .into_iter()
            .map(|r| AskRequestView::new(r, None))
            .collect(),
    }))
}

async fn handle_get_ask(
    State(services): State<Services>,
    Principal(user): Principal,
    Path(id): Path<String>,
) -> Result<Json<AskRequestView>, AppError> {
    let request = services
        .store
        .get_ask_request(&id)
        .await
        .map_err(internal)?
        .filter(|r| r.user_id == user)
        .ok_or_else(|| not_found(format!("ask request not found: {}", id)))?;

    let pages = services
        .store
        .get_pages(&request.page_ids)
        .await
        .map_err(internal)?;
    let refs = pages.iter().map(PageRef::from).collect();
    Ok(Json(AskRequestView::new(request, Some(refs))))
}

// ============ POST /v1/imports ============

#[derive(Deserialize)]
struct ImportBody {
    pages: Vec<ImportItem>,
}

#[derive(Serialize)]
struct ImportResponse {
    pages: Vec<PageRef>,
}

async fn handle_import(
    State(services): State<Services>,
    Principal(user): Principal,
    body: Result<Json<ImportBody>, JsonRejection>,
) -> Result<(StatusCode, Json<ImportResponse>), AppError> {
    let Json(body) = body.map_err(|e| bad_request(e.body_text()))?;
    if body.pages.is_empty() {
        return Err(bad_request("pages must not be empty"));
    }

    if let Admission::Deny { retry_after } = services.throttle.admit(&user, ThrottleScope::Import) {
        return Err(rate_limited(retry_after));
    }

    let pages = import_pages(
        services.store.as_ref(),
        services.events.as_ref(),
        &user,
        &body.pages,
    )
    .await
    .map_err(|e| match e {
        ImportError::EmptyTitle(_) => bad_request(e.to_string()),
        ImportError::Store(err) => internal(err),
    })?;

    Ok((
        StatusCode::CREATED,
        Json(ImportResponse {
            pages: pages.iter().map(PageRef::from).collect(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_status_mapping() {
        assert_eq!(ask_failure_status(AskErrorCode::EmptyQuestion), StatusCode::BAD_REQUEST);
        assert_eq!(ask_failure_status(AskErrorCode::ApiError), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let response = rate_limited(Duration::from_millis(1500)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }
}
