//! Background maintenance of the embedding cache.
//!
//! Page writes publish a [`PageEvent`] on a bounded channel; the worker
//! consumes events and keeps each page's cached vector in step with its
//! `title + body`. A page whose content hash and model match its stored
//! embedding is left alone. The ask path only reads the cache.
//!
//! [`EmbedWorker::embed_pending`] and [`EmbedWorker::rebuild`] back the
//! `embed pending` / `embed rebuild` commands. A running server also calls
//! `embed_pending` every `embedding.sweep_interval_secs` through
//! [`spawn_sweeper`], so events dropped from a full queue are recovered.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;

use pagewise_core::embedding::content_hash;
use pagewise_core::models::{Page, PageEmbedding};
use pagewise_core::store::Store;

use crate::embedding::Embedder;
use crate::settings::SettingsSource;

/// A change to the page corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    Changed(String),
    Deleted(String),
}

/// Publishing side of the page event channel.
#[derive(Clone)]
pub struct PageEvents {
    tx: mpsc::Sender<PageEvent>,
}

impl PageEvents {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PageEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Publish without waiting. A full or closed queue drops the event;
    /// the next backfill sweep picks up anything missed.
    pub fn publish(&self, event: PageEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!(error = %e, "page event dropped");
        }
    }
}

/// Counters from a backfill run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmbedStats {
    pub pending: usize,
    pub embedded: usize,
    pub failed: usize,
}

pub struct EmbedWorker {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl EmbedWorker {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            store,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    fn is_current(&self, existing: Option<&PageEmbedding>, hash: &str) -> bool {
        existing.is_some_and(|e| {
            e.model == self.embedder.model_name()
                && e.dims == self.embedder.dims()
                && e.content_hash == hash
        })
    }

    fn to_embedding(&self, page_id: &str, vector: Vec<f32>, hash: String) -> PageEmbedding {
        PageEmbedding {
            page_id: page_id.to_string(),
            dims: vector.len(),
            vector,
            model: self.embedder.model_name().to_string(),
            content_hash: hash,
            computed_at: Utc::now(),
        }
    }

    /// Bring one page's embedding up to date. Returns `true` if a new
    /// vector was computed.
    pub async fn refresh_page(&self, page_id: &str) -> Result<bool> {
        let Some(page) = self.store.get_page(page_id).await? else {
            // Deleted between the event and now.
            self.store.delete_embedding(page_id).await?;
            return Ok(false);
        };

        let text = page.embedding_text();
        let hash = content_hash(&text);
        let existing = self.store.get_embeddings(&[page.id.clone()]).await?;
        if self.is_current(existing.get(&page.id), &hash) {
            return Ok(false);
        }

        let vector = self
            .embedder
            .embed_texts(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;
        self.store
            .upsert_embedding(&self.to_embedding(&page.id, vector, hash))
            .await?;
        tracing::debug!(page_id = %page.id, "page embedding refreshed");
        Ok(true)
    }

    /// Consume events until every sender is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<PageEvent>) {
        while let Some(event) = rx.recv().await {
            let result = match &event {
                PageEvent::Changed(id) => self.refresh_page(id).await.map(|_| ()),
                PageEvent::Deleted(id) => self.store.delete_embedding(id).await,
            };
            if let Err(e) = result {
                tracing::warn!(?event, error = %e, "embedding refresh failed");
            }
        }
        tracing::debug!("page event channel closed; embed worker stopping");
    }

    /// Embed every page whose cached vector is missing or stale.
    pub async fn embed_pending(&self, limit: Option<usize>) -> Result<EmbedStats> {
        let ids = self.store.list_page_ids().await?;
        let existing = self.store.get_embeddings(&ids).await?;
        let pages = self.store.get_pages(&ids).await?;

        let mut pending: Vec<(Page, String)> = pages
            .into_iter()
            .filter_map(|page| {
                let hash = content_hash(&page.embedding_text());
                if self.is_current(existing.get(&page.id), &hash) {
                    None
                } else {
                    Some((page, hash))
                }
            })
            .collect();
        if let Some(limit) = limit {
            pending.truncate(limit);
        }

        self.embed_all(pending).await
    }

    /// Drop every cached vector and recompute the whole corpus.
    pub async fn rebuild(&self) -> Result<EmbedStats> {
        let cleared = self.store.clear_embeddings().await?;
        tracing::info!(cleared, "embedding cache cleared");
        self.embed_pending(None).await
    }

    async fn embed_all(&self, pending: Vec<(Page, String)>) -> Result<EmbedStats> {
        let mut stats = EmbedStats {
            pending: pending.len(),
            ..Default::default()
        };

        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|(p, _)| p.embedding_text()).collect();
            match self.embedder.embed_texts(&texts).await {
                Ok(vectors) => {
                    for ((page, hash), vector) in batch.iter().zip(vectors) {
                        self.store
                            .upsert_embedding(&self.to_embedding(&page.id, vector, hash.clone()))
                            .await?;
                        stats.embedded += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, batch = batch.len(), "embedding batch failed");
                    stats.failed += batch.len();
                }
            }
        }
        Ok(stats)
    }
}

/// Start the worker on its own task and return the publishing handle.
pub fn spawn(
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    queue_capacity: usize,
) -> (PageEvents, tokio::task::JoinHandle<()>) {
    let (events, rx) = PageEvents::channel(queue_capacity);
    let worker = EmbedWorker::new(store, embedder, batch_size);
    (events, tokio::spawn(worker.run(rx)))
}

/// Run [`EmbedWorker::embed_pending`] every `embedding.sweep_interval_secs`.
pub fn spawn_sweeper(
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    settings: Arc<dyn SettingsSource>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let embedding = settings.current().embedding.clone();
            tokio::time::sleep(std::time::Duration::from_secs(
                embedding.sweep_interval_secs.max(1),
            ))
            .await;
            let worker = EmbedWorker::new(store.clone(), embedder.clone(), embedding.batch_size);
            match worker.embed_pending(None).await {
                Ok(stats) if stats.pending == 0 => {}
                Ok(stats) => tracing::info!(
                    embedded = stats.embedded,
                    failed = stats.failed,
                    "embedding backfill sweep"
                ),
                Err(e) => tracing::error!(error = %e, "embedding backfill sweep failed"),
            }
        }
    })
}
