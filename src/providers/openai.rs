use async_trait::async_trait;

use pagewise_core::models::ProviderId;
use pagewise_core::prompt::Message;

use super::{malformed, parse_vector, send_json, AiProvider, ProviderError};
use crate::config::ProvidersConfig;

const ID: ProviderId = ProviderId::OpenAi;

/// OpenAI chat completions + embeddings.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
    max_output_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, config: &ProvidersConfig, api_key: &str) -> Self {
        Self {
            client,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.openai_model.clone(),
            embedding_model: config.openai_embedding_model.clone(),
            max_output_tokens: config.max_output_tokens,
        }
    }

    /// Embed a batch of texts in one call. Results follow input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": texts,
        });
        let json = send_json(
            ID,
            self.client
                .post(format!("{}/v1/embeddings", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;
        parse_embeddings(&json, texts.len())
    }
}

fn parse_embeddings(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| malformed(ID, "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, parse_vector(ID, item.get("embedding"))?));
    }
    if indexed.len() != expected {
        return Err(malformed(
            ID,
            format!("expected {} embeddings, got {}", expected, indexed.len()),
        ));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_completion(json: &serde_json::Value) -> Result<String, ProviderError> {
    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| malformed(ID, "missing choices[0].message.content"))?;
    if content.trim().is_empty() {
        return Err(malformed(ID, "empty completion"));
    }
    Ok(content.to_string())
}

#[async_trait]
impl AiProvider for OpenAiProvider {
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
        let wire: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        let body = serde_json::json!({
            "model": self.model,
            "messages": wire,
            "max_tokens": self.max_output_tokens,
        });
        let json = send_json(
            ID,
            self.client
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;
        parse_completion(&json)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| malformed(ID, "empty embedding response"))
    }

    async fn validate(&self) -> Result<(), ProviderError> {
        send_json(
            ID,
            self.client
                .get(format!("{}/v1/models", self.base_url))
                .bearer_auth(&self.api_key),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_completion() {
        let json = json!({"choices": [{"message": {"role": "assistant", "content": "30 days."}}]});
        assert_eq!(parse_completion(&json).unwrap(), "30 days.");
        assert!(parse_completion(&json!({"choices": []})).is_err());
        let blank = json!({"choices": [{"message": {"content": "  "}}]});
        assert!(parse_completion(&blank).is_err());
    }

    #[test]
    fn test_parse_embeddings_orders_by_index() {
        let json = json!({"data": [
            {"index": 1, "embedding": [0.0, 1.0]},
            {"index": 0, "embedding": [1.0, 0.0]}
        ]});
        let vecs = parse_embeddings(&json, 2).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_embeddings(&json, 3).is_err());
    }
}
