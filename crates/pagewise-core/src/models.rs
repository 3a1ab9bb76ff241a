//! Core data models used throughout Pagewise.
//!
//! These types represent the pages, embeddings, credentials, and ask
//! requests that flow through the question-answering pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum accepted question length, in characters.
pub const QUERY_MAX_CHARS: usize = 10_000;

// ============ Providers ============

/// Stable identifier of a supported AI provider.
///
/// The string forms (`openai`, `anthropic`, `google`) are part of the
/// external contract and are persisted; they must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Google,
}

impl ProviderId {
    /// Default preference order used when a user has not configured one.
    pub const DEFAULT_ORDER: [ProviderId; 3] =
        [ProviderId::OpenAi, ProviderId::Anthropic, ProviderId::Google];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Google => "google",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a provider identifier is not one of the supported values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown AI provider '{0}' (expected openai, anthropic, or google)")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderId {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderId::OpenAi),
            "anthropic" => Ok(ProviderId::Anthropic),
            "google" => Ok(ProviderId::Google),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

/// A user's stored credential for one provider.
///
/// The secret is opaque to Pagewise. `Debug` never prints it.
#[derive(Clone)]
pub struct ProviderCredential {
    pub user_id: String,
    pub provider: ProviderId,
    pub secret: String,
    /// When the credential was last exercised against the vendor.
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Outcome of the last validation; `None` if never validated.
    pub last_validation_ok: Option<bool>,
}

impl ProviderCredential {
    pub fn new(user_id: impl Into<String>, provider: ProviderId, secret: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            provider,
            secret: secret.into(),
            last_validated_at: None,
            last_validation_ok: None,
        }
    }

    /// True if the last validation attempt failed.
    pub fn failed_last_validation(&self) -> bool {
        self.last_validation_ok == Some(false)
    }
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredential")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("secret", &"<redacted>")
            .field("last_validated_at", &self.last_validated_at)
            .field("last_validation_ok", &self.last_validation_ok)
            .finish()
    }
}

// ============ Pages ============

/// A page from the user's corpus, as supplied by the page storage layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub id: String,
    /// Public identifier exposed to API clients.
    pub external_id: String,
    pub owner_id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Page {
    /// Text fed to the embedding model for this page.
    pub fn embedding_text(&self) -> String {
        format!("{}\n\n{}", self.title, self.body)
    }
}

/// Page reference returned alongside an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRef {
    pub external_id: String,
    pub title: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

impl From<&Page> for PageRef {
    fn from(page: &Page) -> Self {
        Self {
            external_id: page.external_id.clone(),
            title: page.title.clone(),
            created: page.created_at,
            modified: page.modified_at,
            updated: page.updated_at,
        }
    }
}

/// Cached embedding vector for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageEmbedding {
    pub page_id: String,
    pub vector: Vec<f32>,
    /// Embedding model that produced `vector`.
    pub model: String,
    pub dims: usize,
    /// SHA-256 of the text that was embedded.
    pub content_hash: String,
    pub computed_at: DateTime<Utc>,
}

// ============ Ask requests ============

/// Lifecycle state of an [`AskRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskStatus {
    Pending,
    Ok,
    Failed,
}

impl AskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AskStatus::Pending => "pending",
            AskStatus::Ok => "ok",
            AskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AskStatus::Pending),
            "ok" => Some(AskStatus::Ok),
            "failed" => Some(AskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AskStatus::Pending)
    }
}

/// Fixed error taxonomy recorded on failed ask requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskErrorCode {
    EmptyQuestion,
    NoMatchingPages,
    ApiError,
    Unexpected,
}

impl AskErrorCode {
    pub const ALL: [AskErrorCode; 4] = [
        AskErrorCode::EmptyQuestion,
        AskErrorCode::NoMatchingPages,
        AskErrorCode::ApiError,
        AskErrorCode::Unexpected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AskErrorCode::EmptyQuestion => "empty_question",
            AskErrorCode::NoMatchingPages => "no_matching_pages",
            AskErrorCode::ApiError => "api_error",
            AskErrorCode::Unexpected => "unexpected",
        }
    }

    /// Parses a stored code. Unrecognized codes normalize to `Unexpected`.
    pub fn normalize(code: &str) -> Self {
        match code {
            "empty_question" => AskErrorCode::EmptyQuestion,
            "no_matching_pages" => AskErrorCode::NoMatchingPages,
            "api_error" => AskErrorCode::ApiError,
            _ => AskErrorCode::Unexpected,
        }
    }

    /// Human-readable label shown to users.
    pub fn label(&self) -> &'static str {
        match self {
            AskErrorCode::EmptyQuestion => "Please enter a question.",
            AskErrorCode::NoMatchingPages => "No pages matched your question.",
            AskErrorCode::ApiError => "The AI provider could not answer this question.",
            AskErrorCode::Unexpected => "An unexpected error occurred.",
        }
    }
}

impl fmt::Display for AskErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a raw error code to its user-facing label.
///
/// Never panics: any code outside the taxonomy gets the `unexpected` label.
pub fn ask_request_error_map(code: &str) -> &'static str {
    AskErrorCode::normalize(code).label()
}

/// How a pending ask request is resolved. Encodes the status/answer/error
/// invariants by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Answered { answer: String, page_ids: Vec<String> },
    Failed(AskErrorCode),
}

/// One user-submitted question and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AskRequest {
    pub id: String,
    pub user_id: String,
    pub query: String,
    pub status: AskStatus,
    pub error: Option<AskErrorCode>,
    pub answer: Option<String>,
    /// Pages actually used to ground the answer.
    pub page_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AskRequest {
    /// A fresh request in the `pending` state.
    pub fn pending(user_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            query: query.into(),
            status: AskStatus::Pending,
            error: None,
            answer: None,
            page_ids: Vec::new(),
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Applies `resolution` to a pending request.
    ///
    /// Returns `false` and leaves the request untouched if it is already
    /// terminal.
    pub fn resolve(&mut self, resolution: Resolution, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match resolution {
            Resolution::Answered { answer, page_ids } => {
                self.status = AskStatus::Ok;
                self.answer = Some(answer);
                self.error = None;
                self.page_ids = page_ids;
            }
            Resolution::Failed(code) => {
                self.status = AskStatus::Failed;
                self.error = Some(code);
                self.answer = None;
            }
        }
        self.resolved_at = Some(at);
        true
    }
}
