//! Page selection for a question.
//!
//! Two modes:
//!
//! - **Explicit**: the caller names pages by external id. Ids the user cannot
//!   read, or that do not exist, are dropped silently; order follows the
//!   caller's list and duplicates are removed.
//! - **Semantic**: the question is embedded and ranked by cosine similarity
//!   against cached page embeddings produced by the same model. Pages
//!   without a compatible cached vector are not candidates.
//!
//! Both modes are capped at `retrieval.max_pages`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use pagewise_core::embedding::{rank_by_similarity, ScoredPage};
use pagewise_core::models::Page;
use pagewise_core::store::Store;

use crate::embedding::Embedder;
use crate::providers::{self, AiProvider, ProviderError};
use crate::settings::SettingsSource;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// The resolved provider failed to embed the question.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The corpus embedder failed to embed the question.
    #[error("question embedding failed: {0}")]
    Embedding(anyhow::Error),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct Retriever {
    store: Arc<dyn Store>,
    settings: Arc<dyn SettingsSource>,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn Store>,
        settings: Arc<dyn SettingsSource>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            store,
            settings,
            embedder,
        }
    }

    /// Pages to ground `question` for `user_id`.
    ///
    /// `explicit_ids` selects explicit mode when non-empty. `provider` is the
    /// user's resolved provider; it embeds the question only when its
    /// embedding model is the one the corpus was embedded with.
    pub async fn select(
        &self,
        question: &str,
        explicit_ids: &[String],
        user_id: &str,
        provider: Option<&dyn AiProvider>,
    ) -> Result<Vec<Page>, RetrievalError> {
        let retrieval = self.settings.current().retrieval.clone();

        if !explicit_ids.is_empty() {
            let mut seen = HashSet::new();
            let unique: Vec<String> = explicit_ids
                .iter()
                .filter(|id| seen.insert(id.as_str()))
                .cloned()
                .collect();
            let mut pages = self.store.get_accessible_pages(user_id, &unique).await?;
            pages.truncate(retrieval.max_pages);
            return Ok(pages);
        }

        let candidates = self.store.list_accessible_page_ids(user_id).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = self.embed_question(question, provider).await?;
        let embeddings = self.store.get_embeddings(&candidates).await?;
        let ranked = rank_by_similarity(
            &query_vec,
            self.embedder.model_name(),
            embeddings.values(),
            retrieval.min_similarity,
        );

        let k = retrieval.top_k.min(retrieval.max_pages);
        let shortlist = with_ties(ranked, k);
        let ids: Vec<String> = shortlist.iter().map(|s| s.page_id.clone()).collect();
        let scores: HashMap<String, f32> = shortlist
            .into_iter()
            .map(|s| (s.page_id, s.similarity))
            .collect();

        let mut pages = self.store.get_pages(&ids).await?;
        pages.sort_by(|a, b| {
            let sa = scores.get(&a.id).copied().unwrap_or(f32::MIN);
            let sb = scores.get(&b.id).copied().unwrap_or(f32::MIN);
            sb.partial_cmp(&sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.modified_at.cmp(&a.modified_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        pages.truncate(k);

        tracing::debug!(
            user = user_id,
            candidates = candidates.len(),
            selected = pages.len(),
            "semantic retrieval"
        );
        Ok(pages)
    }

    async fn embed_question(
        &self,
        question: &str,
        provider: Option<&dyn AiProvider>,
    ) -> Result<Vec<f32>, RetrievalError> {
        if let Some(provider) = provider {
            if providers::info(provider.id()).supports_embeddings
                && provider.embedding_model() == Some(self.embedder.model_name())
            {
                return Ok(provider.embed(question).await?);
            }
        }
        self.embedder
            .embed_query(question)
            .await
            .map_err(RetrievalError::Embedding)
    }
}

/// The first `k` entries of `ranked` plus any that tie with the k-th score.
fn with_ties(mut ranked: Vec<ScoredPage>, k: usize) -> Vec<ScoredPage> {
    if k == 0 {
        return Vec::new();
    }
    if ranked.len() > k {
        let cutoff = ranked[k - 1].similarity;
        let keep = ranked
            .iter()
            .position(|s| s.similarity < cutoff)
            .unwrap_or(ranked.len());
        ranked.truncate(keep);
    }
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::HashEmbedder;
    use crate::settings::LiveSettings;
    use async_trait::async_trait;
    use chrono::Utc;
    use pagewise_core::embedding::HASH_EMBED_MODEL;
    use pagewise_core::models::{PageEmbedding, ProviderId};
    use pagewise_core::prompt::Message;
    use pagewise_core::store::memory::InMemoryStore;

    /// Claims the corpus embedding model but cannot actually embed.
    struct NoEmbedProvider {
        id: ProviderId,
    }

    #[async_trait]
    impl AiProvider for NoEmbedProvider {
        fn id(&self) -> ProviderId {
            self.id
        }
        fn chat_model(&self) -> &str {
            "fake"
        }
        fn embedding_model(&self) -> Option<&str> {
            Some(HASH_EMBED_MODEL)
        }
        async fn generate(&self, _messages: &[Message]) -> Result<String, ProviderError> {
            Ok(String::new())
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::Unsupported {
                provider: self.id,
                capability: "embeddings",
            })
        }
        async fn validate(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn page(id: &str, body: &str) -> Page {
        let now = Utc::now();
        Page {
            id: id.to_string(),
            external_id: format!("ext-{id}"),
            owner_id: "alice".to_string(),
            title: "Refund policy".to_string(),
            body: body.to_string(),
            created_at: now,
            modified_at: now,
            updated_at: None,
        }
    }

    async fn retriever_with(pages: &[(Page, bool)]) -> Retriever {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(HashEmbedder::new(32));
        for (page, embedded) in pages {
            store.upsert_page(page).await.unwrap();
            if *embedded {
                let vector = embedder.embed_query(&page.embedding_text()).await.unwrap();
                store
                    .upsert_embedding(&PageEmbedding {
                        page_id: page.id.clone(),
                        dims: vector.len(),
                        vector,
                        model: HASH_EMBED_MODEL.to_string(),
                        content_hash: String::new(),
                        computed_at: Utc::now(),
                    })
                    .await
                    .unwrap();
            }
        }
        let mut config = Config::default();
        config.retrieval.min_similarity = -1.0;
        Retriever::new(store, Arc::new(LiveSettings::fixed(config)), embedder)
    }

    #[tokio::test]
    async fn test_page_without_embedding_is_never_a_candidate() {
        let retriever = retriever_with(&[
            (page("a", "Refunds within 30 days."), true),
            (page("b", "Refunds within 30 days."), false),
        ])
        .await;

        let pages = retriever
            .select("What is our refund policy?", &[], "alice", None)
            .await
            .unwrap();
        let ids: Vec<&str> = pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_provider_without_embeddings_uses_corpus_embedder() {
        let retriever = retriever_with(&[(page("a", "Refunds within 30 days."), true)]).await;

        let anthropic = NoEmbedProvider {
            id: ProviderId::Anthropic,
        };
        let pages = retriever
            .select("refund policy", &[], "alice", Some(&anthropic))
            .await
            .unwrap();
        assert_eq!(pages.len(), 1);

        // OpenAI advertises embeddings, so its embed call is used and its error surfaces.
        let openai = NoEmbedProvider {
            id: ProviderId::OpenAi,
        };
        let err = retriever
            .select("refund policy", &[], "alice", Some(&openai))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Provider(_)));
    }

    fn scored(id: &str, similarity: f32) -> ScoredPage {
        ScoredPage {
            page_id: id.to_string(),
            similarity,
        }
    }

    #[test]
    fn test_with_ties_keeps_equal_scores_at_cutoff() {
        let ranked = vec![scored("a", 0.9), scored("b", 0.5), scored("c", 0.5), scored("d", 0.1)];
        let kept = with_ties(ranked, 2);
        let ids: Vec<&str> = kept.iter().map(|s| s.page_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_with_ties_short_list() {
        assert_eq!(with_ties(vec![scored("a", 0.3)], 5).len(), 1);
        assert!(with_ties(vec![scored("a", 0.3)], 0).is_empty());
    }
}
