//! Corpus embedders.
//!
//! The corpus embedder produces the vectors stored in the embedding cache
//! and is the fallback for embedding questions when the user's resolved
//! provider has no compatible embedding model.
//!
//! | `embedding.provider` | Embedder | Model |
//! |----------------------|----------|-------|
//! | `local` (default) | [`HashEmbedder`] | `local-hash-v1` |
//! | `openai` | [`OpenAiEmbedder`] | `embedding.model` or `providers.openai_embedding_model` |
//! | `fastembed` | `FastEmbedder` (feature `local-embeddings-fastembed`) | `embedding.model` or `all-minilm-l6-v2` |
//!
//! # Retry Strategy
//!
//! Background embedding (the embed worker and `embed pending`) goes through
//! [`Embedder::embed_texts`]. With [`OpenAiEmbedder`] that retries transient
//! failures with exponential backoff (1s, 2s, 4s, ... capped at 32s):
//! rate limits, timeouts, transport errors, and 5xx responses are retried,
//! any other 4xx fails immediately. Question embedding on the ask path goes
//! through [`Embedder::embed_query`], which never retries.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use pagewise_core::embedding::hash_embed;

use crate::config::{EmbeddingConfig, ProvidersConfig};
use crate::providers::{OpenAiProvider, ProviderError};

/// Produces embedding vectors for page text and questions.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded alongside stored vectors.
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    /// Embed a batch of texts. Output order follows input order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed one question.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_texts(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }
}

// ============ Local hash embedder ============

/// Deterministic feature-hashing embedder. Needs no network and no model.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        pagewise_core::embedding::HASH_EMBED_MODEL
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dims)).collect())
    }
}

// ============ OpenAI embedder ============

/// Corpus embedder backed by the OpenAI embeddings endpoint.
///
/// Uses the operator's `OPENAI_API_KEY`, not any user's credential.
pub struct OpenAiEmbedder {
    provider: OpenAiProvider,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, providers: &ProvidersConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let model = config.model_name(providers);
        let mut providers = providers.clone();
        providers.openai_embedding_model = model.clone();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            provider: OpenAiProvider::new(client, &providers, &api_key),
            model,
            dims: config.dims,
            max_retries: config.max_retries,
        })
    }
}

fn is_transient(err: &ProviderError) -> bool {
    match err {
        ProviderError::RateLimited { .. }
        | ProviderError::Timeout { .. }
        | ProviderError::Transport { .. } => true,
        ProviderError::Http { status, .. } => *status >= 500,
        _ => false,
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.provider.embed_batch(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if is_transient(&e) => {
                    tracing::debug!(attempt, error = %e, "embedding batch failed; retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        match last_err {
            Some(e) => Err(anyhow::Error::new(e).context("Embedding failed after retries")),
            None => bail!("Embedding failed after retries"),
        }
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        use crate::providers::AiProvider;
        Ok(self.provider.embed(text).await?)
    }
}

// ============ fastembed ============

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::FastEmbedder;

#[cfg(feature = "local-embeddings-fastembed")]
mod local {
    use super::*;

    /// Offline embedder running an ONNX model through fastembed.
    ///
    /// The model is downloaded on first use and loaded once.
    pub struct FastEmbedder {
        model_name: String,
        dims: usize,
        batch_size: usize,
        model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
    }

    impl FastEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
            let (model_id, dims) = fastembed_model(&model_name)?;
            let model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(model_id).with_show_download_progress(false),
            )
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

            Ok(Self {
                model_name,
                dims,
                batch_size: config.batch_size,
                model: Arc::new(std::sync::Mutex::new(model)),
            })
        }
    }

    fn fastembed_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
        match name {
            "all-minilm-l6-v2" => Ok((fastembed::EmbeddingModel::AllMiniLML6V2, 384)),
            "bge-small-en-v1.5" => Ok((fastembed::EmbeddingModel::BGESmallENV15, 384)),
            "bge-base-en-v1.5" => Ok((fastembed::EmbeddingModel::BGEBaseENV15, 768)),
            "nomic-embed-text-v1.5" => Ok((fastembed::EmbeddingModel::NomicEmbedTextV15, 768)),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
                other
            ),
        }
    }

    #[async_trait]
    impl Embedder for FastEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let model = self.model.clone();
            let texts = texts.to_vec();
            let batch_size = self.batch_size;

            tokio::task::spawn_blocking(move || {
                let mut model = model
                    .lock()
                    .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
                model
                    .embed(texts, Some(batch_size))
                    .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
            })
            .await?
        }
    }
}

/// Create the corpus embedder named by `embedding.provider`.
///
/// # Errors
///
/// Fails for unknown providers, a missing `OPENAI_API_KEY`, or `fastembed`
/// without the `local-embeddings-fastembed` feature.
pub fn create_embedder(
    config: &EmbeddingConfig,
    providers: &ProvidersConfig,
) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(HashEmbedder::new(config.dims))),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config, providers)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "fastembed" => Ok(Arc::new(local::FastEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "fastembed" => bail!("The fastembed embedder requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagewise_core::embedding::{cosine_similarity, HASH_EMBED_MODEL};

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let texts = vec!["refund policy".to_string(), "refund policy".to_string()];
        let vecs = embedder.embed_texts(&texts).await.unwrap();
        assert_eq!(vecs[0], vecs[1]);
        assert_eq!(vecs[0].len(), 64);
        assert_eq!(embedder.model_name(), HASH_EMBED_MODEL);
    }

    #[tokio::test]
    async fn test_hash_embedder_query_matches_related_text() {
        let embedder = HashEmbedder::new(256);
        let q = embedder.embed_query("What is our refund policy?").await.unwrap();
        let related = embedder
            .embed_query("Refunds\n\nOur refund policy allows returns within 30 days.")
            .await
            .unwrap();
        let unrelated = embedder
            .embed_query("Office plants\n\nWater the ferns on Mondays.")
            .await
            .unwrap();
        assert!(cosine_similarity(&q, &related) > cosine_similarity(&q, &unrelated));
    }

    #[test]
    fn test_create_embedder_local_default() {
        let config = EmbeddingConfig::default();
        let embedder = create_embedder(&config, &ProvidersConfig::default()).unwrap();
        assert_eq!(embedder.model_name(), HASH_EMBED_MODEL);
        assert_eq!(embedder.dims(), 1536);
    }

    #[test]
    fn test_create_embedder_unknown() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..Default::default()
        };
        assert!(create_embedder(&config, &ProvidersConfig::default()).is_err());
    }

    #[test]
    fn test_transient_classification() {
        let p = pagewise_core::models::ProviderId::OpenAi;
        assert!(is_transient(&ProviderError::RateLimited { provider: p }));
        assert!(is_transient(&ProviderError::Http {
            provider: p,
            status: 503,
            details: String::new()
        }));
        assert!(!is_transient(&ProviderError::Authentication {
            provider: p,
            details: String::new()
        }));
    }
}
