use async_trait::async_trait;

use pagewise_core::models::ProviderId;
use pagewise_core::prompt::{Message, Role};

use super::{malformed, parse_vector, send_json, AiProvider, ProviderError};
use crate::config::ProvidersConfig;

const ID: ProviderId = ProviderId::Google;

/// Google Gemini `generateContent` + `embedContent`.
///
/// The key travels in the `x-goog-api-key` header, never in the URL.
pub struct GoogleProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
    max_output_tokens: u32,
}

impl GoogleProvider {
    pub fn new(client: reqwest::Client, config: &ProvidersConfig, api_key: &str) -> Self {
        Self {
            client,
            base_url: config.google_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.google_model.clone(),
            embedding_model: config.google_embedding_model.clone(),
            max_output_tokens: config.max_output_tokens,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-goog-api-key", &self.api_key)
    }
}

fn to_wire(messages: &[Message], max_output_tokens: u32) -> serde_json::Value {
    let system: Vec<serde_json::Value> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| serde_json::json!({ "text": m.content }))
        .collect();
    let contents: Vec<serde_json::Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = if m.role == Role::Assistant { "model" } else { "user" };
            serde_json::json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();
    serde_json::json!({
        "systemInstruction": { "parts": system },
        "contents": contents,
        "generationConfig": { "maxOutputTokens": max_output_tokens },
    })
}

fn parse_candidate(json: &serde_json::Value) -> Result<String, ProviderError> {
    let parts = json
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .ok_or_else(|| malformed(ID, "missing candidates[0].content.parts"))?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        return Err(malformed(ID, "no text in candidate"));
    }
    Ok(text)
}

#[async_trait]
impl AiProvider for GoogleProvider {
    fn id(&self) -> ProviderId {
        ID
    }

    fn chat_model(&self) -> &str {
        &self.model
    }

    fn embedding_model(&self) -> Option<&str> {
        Some(&self.embedding_model)
    }

    async fn generate(&self, messages: &[Message]) -> Result<String, ProviderError> {
        let path = format!("/v1beta/models/{}:generateContent", self.model);
        let body = to_wire(messages, self.max_output_tokens);
        let json = send_json(ID, self.request(reqwest::Method::POST, &path).json(&body)).await?;
        parse_candidate(&json)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let path = format!("/v1beta/models/{}:embedContent", self.embedding_model);
        let body = serde_json::json!({
            "model": format!("models/{}", self.embedding_model),
            "content": { "parts": [{ "text": text }] },
        });
        let json = send_json(ID, self.request(reqwest::Method::POST, &path).json(&body)).await?;
        parse_vector(ID, json.get("embedding").and_then(|e| e.get("values")))
    }

    async fn validate(&self) -> Result<(), ProviderError> {
        send_json(ID, self.request(reqwest::Method::GET, "/v1beta/models"))
            .await
            .map(|_| ())
    }
}
