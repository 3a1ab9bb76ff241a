//! The ask orchestrator.
//!
//! [`Asker::submit`] takes a question from admission to a terminal record:
//!
//! 1. blank question: record it and fail it with `empty_question`
//! 2. throttle (`ask` scope): over budget is rejected with no record
//! 3. create the `pending` record
//! 4. resolve and lazily validate the user's provider key
//! 5. select pages (explicit ids or semantic ranking)
//! 6. build the three-block prompt
//! 7. one bounded `generate` call
//! 8. finalize `ok` or `failed/<code>`
//!
//! Steps 4-8 run on a spawned task, so a caller that goes away does not
//! cancel an in-flight provider call and the record still gets finalized.
//! Every failure after step 3 ends in a terminal record; nothing escapes as
//! an unhandled error.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use pagewise_core::models::{
    AskErrorCode, AskRequest, Page, PageRef, Resolution, QUERY_MAX_CHARS,
};
use pagewise_core::prompt;
use pagewise_core::store::Store;

use crate::keys::{redact, KeyError, KeyResolver};
use crate::retriever::{RetrievalError, Retriever};
use crate::settings::SettingsSource;
use crate::throttle::{retry_after_secs, Admission, Throttle, ThrottleScope};

/// A question refused before any record was created.
#[derive(Debug, thiserror::Error)]
pub enum AskRejection {
    #[error("query is {len} characters; the limit is {max}")]
    QueryTooLong { len: usize, max: usize },
    #[error("too many questions; retry in {}s", retry_after_secs(*.retry_after))]
    RateLimited { retry_after: Duration },
    #[error("could not record the question: {0}")]
    Storage(anyhow::Error),
}

/// Why a recorded question failed, with a message safe to show the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskFailure {
    pub code: AskErrorCode,
    pub message: String,
}

impl AskFailure {
    fn new(code: AskErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn labelled(code: AskErrorCode) -> Self {
        Self::new(code, code.label())
    }
}

/// Result of a recorded question.
#[derive(Debug, Clone)]
pub struct AskOutcome {
    /// The request as finalized.
    pub request: AskRequest,
    /// Pages that grounded the answer. Empty on failure.
    pub pages: Vec<PageRef>,
    pub failure: Option<AskFailure>,
}

/// Rejects queries over [`QUERY_MAX_CHARS`] characters.
pub fn validate_query(query: &str) -> Result<(), AskRejection> {
    let len = query.chars().count();
    if len > QUERY_MAX_CHARS {
        return Err(AskRejection::QueryTooLong {
            len,
            max: QUERY_MAX_CHARS,
        });
    }
    Ok(())
}

pub struct Asker {
    store: Arc<dyn Store>,
    throttle: Arc<Throttle>,
    keys: Arc<KeyResolver>,
    retriever: Arc<Retriever>,
    settings: Arc<dyn SettingsSource>,
}

type Processed = (Resolution, Vec<Page>, Option<AskFailure>);

impl Asker {
    pub fn new(
        store: Arc<dyn Store>,
        throttle: Arc<Throttle>,
        keys: Arc<KeyResolver>,
        retriever: Arc<Retriever>,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            store,
            throttle,
            keys,
            retriever,
            settings,
        }
    }

    /// Answer `query` for `user_id`, optionally grounded on explicit pages.
    pub async fn submit(
        self: &Arc<Self>,
        user_id: &str,
        query: &str,
        page_ids: &[String],
    ) -> Result<AskOutcome, AskRejection> {
        validate_query(query)?;

        if query.trim().is_empty() {
            let request = AskRequest::pending(user_id, query);
            self.store
                .create_ask_request(&request)
                .await
                .map_err(AskRejection::Storage)?;
            let failure = AskFailure::labelled(AskErrorCode::EmptyQuestion);
            return Ok(self
                .finalize(request, Resolution::Failed(failure.code), Vec::new(), Some(failure))
                .await);
        }

        if let Admission::Deny { retry_after } = self.throttle.admit(user_id, ThrottleScope::Ask) {
            tracing::info!(user = user_id, "ask rate limited");
            return Err(AskRejection::RateLimited { retry_after });
        }

        let request = AskRequest::pending(user_id, query);
        self.store
            .create_ask_request(&request)
            .await
            .map_err(AskRejection::Storage)?;
        tracing::info!(user = user_id, ask_id = %request.id, "ask accepted");

        let this = Arc::clone(self);
        let task_request = request.clone();
        let page_ids = page_ids.to_vec();
        let handle = tokio::spawn(async move {
            let (resolution, pages, failure) = this.process(&task_request, &page_ids).await;
            this.finalize(task_request, resolution, pages, failure).await
        });

        match handle.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(ask_id = %request.id, error = %e, "ask task aborted");
                let failure = AskFailure::labelled(AskErrorCode::Unexpected);
                Ok(self
                    .finalize(request, Resolution::Failed(failure.code), Vec::new(), Some(failure))
                    .await)
            }
        }
    }

    async fn process(&self, request: &AskRequest, page_ids: &[String]) -> Processed {
        let (credential, provider) = match self.keys.select(&request.user_id).await {
            Ok(selected) => selected,
            Err(KeyError::Store(e)) => {
                tracing::error!(ask_id = %request.id, error = %e, "key lookup failed");
                return failed(AskFailure::labelled(AskErrorCode::Unexpected));
            }
            Err(e) => {
                tracing::info!(ask_id = %request.id, error = %e, "no usable provider key");
                return failed(AskFailure::new(AskErrorCode::ApiError, e.to_string()));
            }
        };

        let pages = match self
            .retriever
            .select(&request.query, page_ids, &request.user_id, Some(provider.as_ref()))
            .await
        {
            Ok(pages) => pages,
            Err(RetrievalError::Store(e)) => {
                tracing::error!(ask_id = %request.id, error = %e, "page retrieval failed");
                return failed(AskFailure::labelled(AskErrorCode::Unexpected));
            }
            Err(e) => {
                let message = redact(&e.to_string(), &credential.secret);
                tracing::warn!(ask_id = %request.id, provider = %credential.provider, error = %message, "question embedding failed");
                return failed(AskFailure::new(AskErrorCode::ApiError, message));
            }
        };

        if pages.is_empty() {
            return failed(AskFailure::labelled(AskErrorCode::NoMatchingPages));
        }

        let prompt = prompt::build(&request.query, &pages);
        let timeout_secs = self.settings.current().providers.timeout_secs;

        match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            provider.generate(&prompt.messages),
        )
        .await
        {
            Ok(Ok(answer)) => {
                let used = pages.iter().map(|p| p.id.clone()).collect();
                (
                    Resolution::Answered {
                        answer,
                        page_ids: used,
                    },
                    pages,
                    None,
                )
            }
            Ok(Err(e)) => {
                let message = redact(&e.to_string(), &credential.secret);
                tracing::warn!(ask_id = %request.id, provider = %credential.provider, error = %message, "generation failed");
                failed(AskFailure::new(AskErrorCode::ApiError, message))
            }
            Err(_) => {
                tracing::warn!(ask_id = %request.id, provider = %credential.provider, timeout_secs, "generation timed out");
                failed(AskFailure::new(
                    AskErrorCode::ApiError,
                    format!("{} did not answer within {}s", credential.provider, timeout_secs),
                ))
            }
        }
    }

    /// Write the terminal state. If another writer (the reconciliation
    /// sweep) got there first, its state is returned instead.
    async fn finalize(
        &self,
        mut request: AskRequest,
        resolution: Resolution,
        pages: Vec<Page>,
        failure: Option<AskFailure>,
    ) -> AskOutcome {
        let at = Utc::now();
        match self
            .store
            .finalize_ask_request(&request.id, &resolution, at)
            .await
        {
            Ok(true) => {
                request.resolve(resolution, at);
                tracing::info!(
                    ask_id = %request.id,
                    status = request.status.as_str(),
                    error = request.error.map(|c| c.as_str()).unwrap_or(""),
                    "ask finalized"
                );
                AskOutcome {
                    request,
                    pages: pages.iter().map(PageRef::from).collect(),
                    failure,
                }
            }
            Ok(false) => {
                tracing::warn!(ask_id = %request.id, "ask already finalized elsewhere");
                let id = request.id.clone();
                let current = self
                    .store
                    .get_ask_request(&id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(request);
                let failure = current.error.map(AskFailure::labelled);
                let pages = if current.error.is_none() {
                    pages.iter().map(PageRef::from).collect()
                } else {
                    Vec::new()
                };
                AskOutcome {
                    request: current,
                    pages,
                    failure,
                }
            }
            Err(e) => {
                // The record stays pending; the reconciliation sweep fails it later.
                tracing::error!(ask_id = %request.id, error = %e, "could not finalize ask");
                let failure = AskFailure::labelled(AskErrorCode::Unexpected);
                request.resolve(Resolution::Failed(failure.code), at);
                AskOutcome {
                    request,
                    pages: Vec::new(),
                    failure: Some(failure),
                }
            }
        }
    }
}

fn failed(failure: AskFailure) -> Processed {
    (Resolution::Failed(failure.code), Vec::new(), Some(failure))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_query_limit() {
        assert!(validate_query(&"a".repeat(QUERY_MAX_CHARS)).is_ok());
        let err = validate_query(&"a".repeat(QUERY_MAX_CHARS + 1)).unwrap_err();
        assert!(matches!(err, AskRejection::QueryTooLong { len: 10_001, max: 10_000 }));
    }

    #[test]
    fn test_validate_query_counts_chars_not_bytes() {
        assert!(validate_query(&"é".repeat(QUERY_MAX_CHARS)).is_ok());
    }

    #[test]
    fn test_rate_limited_message_rounds_up() {
        let err = AskRejection::RateLimited {
            retry_after: Duration::from_millis(300),
        };
        assert_eq!(err.to_string(), "too many questions; retry in 1s");

        let err = AskRejection::RateLimited {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "too many questions; retry in 2s");
    }
}
