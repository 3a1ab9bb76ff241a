//! AI provider registry and the capability abstraction.
//!
//! Every vendor is reached through [`AiProvider`], which exposes the two
//! capabilities the ask pipeline needs (`generate` and `embed`) plus a
//! cheap `validate` call used to check a credential. One implementation
//! exists per [`ProviderId`]:
//!
//! | Provider | Chat endpoint | Embeddings |
//! |----------|---------------|------------|
//! | `openai` | `POST /v1/chat/completions` | `POST /v1/embeddings` |
//! | `anthropic` | `POST /v1/messages` | not offered |
//! | `google` | `POST /v1beta/models/{model}:generateContent` | `POST /v1beta/models/{model}:embedContent` |
//!
//! Code outside this module never matches on the provider identity; it asks
//! a [`ProviderFactory`] for an instance and talks to the trait.
//!
//! Calls are made exactly once. Retrying a generation would duplicate
//! vendor-side cost and side effects, so callers get the first error.

mod anthropic;
mod google;
mod openai;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use pagewise_core::models::ProviderId;
use pagewise_core::prompt::Message;

use crate::config::ProvidersConfig;

// ============ Registry ============

/// Static capability metadata for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: ProviderId,
    pub display_name: &'static str,
    /// Whether the vendor offers an embeddings endpoint.
    pub supports_embeddings: bool,
}

const REGISTRY: [ProviderInfo; 3] = [
    ProviderInfo {
        id: ProviderId::OpenAi,
        display_name: "OpenAI",
        supports_embeddings: true,
    },
    ProviderInfo {
        id: ProviderId::Anthropic,
        display_name: "Anthropic",
        supports_embeddings: false,
    },
    ProviderInfo {
        id: ProviderId::Google,
        display_name: "Google Gemini",
        supports_embeddings: true,
    },
];

/// All supported providers, in default preference order.
pub fn registry() -> &'static [ProviderInfo] {
    &REGISTRY
}

pub fn info(id: ProviderId) -> &'static ProviderInfo {
    match id {
        ProviderId::OpenAi => &REGISTRY[0],
        ProviderId::Anthropic => &REGISTRY[1],
        ProviderId::Google => &REGISTRY[2],
    }
}

// ============ Errors ============

/// Failure talking to a provider.
///
/// `Display` output is safe to log and to return to users: it never contains
/// the credential, and vendor response bodies are truncated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: ProviderId,
        capability: &'static str,
    },
    #[error("{provider} rejected the credential: {details}")]
    Authentication { provider: ProviderId, details: String },
    #[error("{provider} rate limit or quota exceeded")]
    RateLimited { provider: ProviderId },
    #[error("{provider} request timed out")]
    Timeout { provider: ProviderId },
    #[error("{provider} returned HTTP {status}: {details}")]
    Http {
        provider: ProviderId,
        status: u16,
        details: String,
    },
    #[error("could not reach {provider}: {details}")]
    Transport { provider: ProviderId, details: String },
    #[error("{provider} returned an unexpected response: {details}")]
    MalformedResponse { provider: ProviderId, details: String },
}

impl ProviderError {
    /// Vendor-supplied details, if any.
    pub fn details(&self) -> String {
        match self {
            ProviderError::Authentication { details, .. }
            | ProviderError::Http { details, .. }
            | ProviderError::Transport { details, .. }
            | ProviderError::MalformedResponse { details, .. } => details.clone(),
            other => other.to_string(),
        }
    }
}

const DETAIL_LIMIT: usize = 300;

/// First [`DETAIL_LIMIT`] characters of a vendor response body.
pub(crate) fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= DETAIL_LIMIT {
        trimmed.to_string()
    } else {
        let mut out: String = trimmed.chars().take(DETAIL_LIMIT).collect();
        out.push('…');
        out
    }
}

/// Sends a request and decodes a JSON body, mapping failures onto
/// [`ProviderError`]. The request is sent once.
pub(crate) async fn send_json(
    provider: ProviderId,
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, ProviderError> {
    let response = request.send().await.map_err(|e| transport_error(provider, e))?;
    let status = response.status();

    if status.is_success() {
        return response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ProviderError::MalformedResponse {
                provider,
                details: e.without_url().to_string(),
            });
    }

    let body = response.text().await.unwrap_or_default();
    Err(status_error(provider, status.as_u16(), &body))
}

pub(crate) fn status_error(provider: ProviderId, status: u16, body: &str) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Authentication {
            provider,
            details: snippet(body),
        },
        429 => ProviderError::RateLimited { provider },
        408 | 504 => ProviderError::Timeout { provider },
        _ => ProviderError::Http {
            provider,
            status,
            details: snippet(body),
        },
    }
}

fn transport_error(provider: ProviderId, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout { provider }
    } else {
        // Drop the URL: some vendors accept keys as query parameters.
        ProviderError::Transport {
            provider,
            details: err.without_url().to_string(),
        }
    }
}

pub(crate) fn malformed(provider: ProviderId, details: impl Into<String>) -> ProviderError {
    ProviderError::MalformedResponse {
        provider,
        details: details.into(),
    }
}

/// Reads a JSON array of numbers as an embedding vector.
pub(crate) fn parse_vector(
    provider: ProviderId,
    value: Option<&serde_json::Value>,
) -> Result<Vec<f32>, ProviderError> {
    let values = value
        .and_then(|v| v.as_array())
        .ok_or_else(|| malformed(provider, "missing embedding array"))?;
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| malformed(provider, "non-numeric embedding component"))
        })
        .collect()
}

// ============ Capability trait ============

/// A provider instance bound to one credential.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Model used by [`AiProvider::generate`].
    fn chat_model(&self) -> &str;

    /// Model used by [`AiProvider::embed`], or `None` if unsupported.
    fn embedding_model(&self) -> Option<&str>;

    /// Produce an answer for a role-tagged message sequence.
    async fn generate(&self, messages: &[Message]) -> Result<String, ProviderError>;

    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Exercise the credential with a cheap authenticated call.
    async fn validate(&self) -> Result<(), ProviderError>;
}

/// Builds provider instances for a `(provider, secret)` pair.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, provider: ProviderId, secret: &str) -> Result<Arc<dyn AiProvider>, ProviderError>;
}

/// Factory for the real HTTP-backed providers.
pub struct HttpProviderFactory {
    config: ProvidersConfig,
    client: reqwest::Client,
}

impl HttpProviderFactory {
    pub fn new(config: &ProvidersConfig) -> anyhow::Result<Self> {
        // The per-call bound is applied by the orchestrator; this is a backstop
        // for validate/embed calls made outside it.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, provider: ProviderId, secret: &str) -> Result<Arc<dyn AiProvider>, ProviderError> {
        if secret.trim().is_empty() {
            return Err(ProviderError::Authentication {
                provider,
                details: "empty credential".to_string(),
            });
        }
        let client = self.client.clone();
        let provider: Arc<dyn AiProvider> = match provider {
            ProviderId::OpenAi => Arc::new(OpenAiProvider::new(client, &self.config, secret)),
            ProviderId::Anthropic => Arc::new(AnthropicProvider::new(client, &self.config, secret)),
            ProviderId::Google => Arc::new(GoogleProvider::new(client, &self.config, secret)),
        };
        Ok(provider)
    }
}
