use async_trait::async_trait;

use pagewise_core::models::ProviderId;
use pagewise_core::prompt::{Message, Role};

use super::{malformed, send_json, AiProvider, ProviderError};
use crate::config::ProvidersConfig;

const ID: ProviderId = ProviderId::Anthropic;
const API_VERSION: &str = "2023-06-01";

/// Fixed user turn placed before the assistant context block. The Messages
/// API requires the conversation to open with a user turn; this text is
/// constant and never carries page content.
const CONTEXT_LEAD_IN: &str = "Retrieve the pages relevant to my next question.";

/// Anthropic Messages API. No embeddings endpoint.
pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client, config: &ProvidersConfig, api_key: &str) -> Self {
        Self {
            client,
            base_url: config.anthropic_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.anthropic_model.clone(),
            max_output_tokens: config.max_output_tokens,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }
}

/// Splits the system message out and maps the rest onto Messages API turns.
fn to_wire(messages: &[Message]) -> (String, Vec<serde_json::Value>) {
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for message in messages {
        match message.role {
            Role::System => system.push(message.content.as_str()),
            Role::Assistant => {
                if turns.is_empty() {
                    turns.push(serde_json::json!({ "role": "user", "content": CONTEXT_LEAD_IN }));
                }
                turns.push(serde_json::json!({ "role": "assistant", "content": message.content }));
            }
            Role::User => {
                turns.push(serde_json::json!({ "role": "user", "content": message.content }));
            }
        }
    }
    (system.join("\n\n"), turns)
}

fn parse_message(json: &serde_json::Value) -> Result<String, ProviderError> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| malformed(ID, "missing content array"))?;
    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        return Err(malformed(ID, "no text content in response"));
    }
    Ok(text)
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn id(&self) -> ProviderId {
        ID
    }

    fn chat_model(&self) -> &str {
        &self.model
    }

    fn embedding_model(&self) -> Option<&str> {
        None
    }

    async fn generate(&self, messages: &[Message]) -> Result<String, ProviderError> {
        let (system, turns) = to_wire(messages);
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_output_tokens,
            "system": system,
            "messages": turns,
        });
        let json = send_json(ID, self.request(reqwest::Method::POST, "/v1/messages").json(&body)).await?;
        parse_message(&json)
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: ID,
            capability: "embeddings",
        })
    }

    async fn validate(&self) -> Result<(), ProviderError> {
        send_json(ID, self.request(reqwest::Method::GET, "/v1/models"))
            .await
            .map(|_| ())
    }
}
