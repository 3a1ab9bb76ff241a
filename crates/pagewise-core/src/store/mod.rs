//! Storage abstraction for Pagewise.
//!
//! [`Store`] covers the page corpus (read side plus the minimal writes the
//! import path needs), the embedding cache, and ask request records.
//! [`SecretStore`] is the opaque credential store. Both are `Send + Sync`
//! so they can be shared across tokio tasks behind an `Arc`.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::{AskRequest, Page, PageEmbedding, ProviderCredential, ProviderId, Resolution};

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_page`](Store::upsert_page) | Insert or replace a page |
/// | [`grant_access`](Store::grant_access) | Share a page with another user |
/// | [`delete_page`](Store::delete_page) | Delete a page and its embedding |
/// | [`get_accessible_pages`](Store::get_accessible_pages) | Resolve external ids a user may read |
/// | [`list_accessible_page_ids`](Store::list_accessible_page_ids) | Every page id a user may read |
/// | [`get_embeddings`](Store::get_embeddings) | Bulk embedding cache lookup |
/// | [`upsert_embedding`](Store::upsert_embedding) | Replace a page's embedding |
/// | [`finalize_ask_request`](Store::finalize_ask_request) | Write-once pending → terminal |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace a page, keyed by `page.id`.
    async fn upsert_page(&self, page: &Page) -> Result<()>;

    /// Allow `user_id` to read `page_id` in addition to its owner.
    async fn grant_access(&self, page_id: &str, user_id: &str) -> Result<()>;

    /// Delete a page together with its embedding. Returns whether it existed.
    async fn delete_page(&self, page_id: &str) -> Result<bool>;

    /// Fetch a page by internal id, without access checks.
    async fn get_page(&self, page_id: &str) -> Result<Option<Page>>;

    /// Fetch pages by internal id, without access checks. Missing ids are skipped.
    async fn get_pages(&self, page_ids: &[String]) -> Result<Vec<Page>>;

    /// Resolve `external_ids` to pages `user_id` may read.
    ///
    /// Unknown or inaccessible ids are dropped. Order follows `external_ids`.
    async fn get_accessible_pages(&self, user_id: &str, external_ids: &[String])
        -> Result<Vec<Page>>;

    /// Internal ids of every page `user_id` may read.
    async fn list_accessible_page_ids(&self, user_id: &str) -> Result<Vec<String>>;

    /// Internal ids of every page in the corpus.
    async fn list_page_ids(&self) -> Result<Vec<String>>;

    /// Bulk lookup of cached embeddings. Pages without one are absent from the map.
    async fn get_embeddings(&self, page_ids: &[String]) -> Result<HashMap<String, PageEmbedding>>;

    /// Store an embedding, replacing any previous vector for the page.
    async fn upsert_embedding(&self, embedding: &PageEmbedding) -> Result<()>;

    /// Remove a page's embedding if present.
    async fn delete_embedding(&self, page_id: &str) -> Result<()>;

    /// Remove every cached embedding. Returns how many were removed.
    async fn clear_embeddings(&self) -> Result<u64>;

    /// Persist a new ask request.
    async fn create_ask_request(&self, request: &AskRequest) -> Result<()>;

    /// Move a pending request to its terminal state.
    ///
    /// Returns `false` (and changes nothing) if the request is missing or
    /// already terminal.
    async fn finalize_ask_request(
        &self,
        id: &str,
        resolution: &Resolution,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_ask_request(&self, id: &str) -> Result<Option<AskRequest>>;

    /// A user's requests, newest first.
    async fn list_ask_requests(&self, user_id: &str, limit: usize) -> Result<Vec<AskRequest>>;

    /// Requests still `pending` that were created before `created_before`.
    async fn list_stale_pending(&self, created_before: DateTime<Utc>) -> Result<Vec<AskRequest>>;
}

/// Opaque per-user credential storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Every credential stored for `user_id`, in no particular order.
    async fn list_credentials(&self, user_id: &str) -> Result<Vec<ProviderCredential>>;

    /// Insert or replace the credential for `(user_id, provider)`.
    ///
    /// Replacing a secret resets its validation state.
    async fn put_credential(&self, credential: &ProviderCredential) -> Result<()>;

    /// Record the outcome of exercising a credential against its vendor.
    async fn record_validation(
        &self,
        user_id: &str,
        provider: ProviderId,
        ok: bool,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// The user's explicit provider order, if configured.
    async fn provider_preference(&self, user_id: &str) -> Result<Option<Vec<ProviderId>>>;

    async fn set_provider_preference(&self, user_id: &str, order: &[ProviderId]) -> Result<()>;
}
