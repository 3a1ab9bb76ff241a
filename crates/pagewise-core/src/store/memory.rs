//! In-memory [`Store`] and [`SecretStore`] for tests and embedded use.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Nothing is persisted.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{AskRequest, AskStatus, Page, PageEmbedding, ProviderCredential, ProviderId, Resolution};

use super::{SecretStore, Store};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    pages: RwLock<HashMap<String, Page>>,
    /// page id → users granted read access (owners are implicit).
    grants: RwLock<HashMap<String, HashSet<String>>>,
    embeddings: RwLock<HashMap<String, PageEmbedding>>,
    asks: RwLock<HashMap<String, AskRequest>>,
    credentials: RwLock<HashMap<(String, ProviderId), ProviderCredential>>,
    preferences: RwLock<HashMap<String, Vec<ProviderId>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn can_read(&self, page: &Page, user_id: &str) -> Result<bool> {
        if page.owner_id == user_id {
            return Ok(true);
        }
        Ok(read(&self.grants)?
            .get(&page.id)
            .is_some_and(|users| users.contains(user_id)))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_page(&self, page: &Page) -> Result<()> {
        write(&self.pages)?.insert(page.id.clone(), page.clone());
        Ok(())
    }

    async fn grant_access(&self, page_id: &str, user_id: &str) -> Result<()> {
        write(&self.grants)?
            .entry(page_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        Ok(())
    }

    async fn delete_page(&self, page_id: &str) -> Result<bool> {
        let existed = write(&self.pages)?.remove(page_id).is_some();
        write(&self.grants)?.remove(page_id);
        write(&self.embeddings)?.remove(page_id);
        Ok(existed)
    }

    async fn get_page(&self, page_id: &str) -> Result<Option<Page>> {
        Ok(read(&self.pages)?.get(page_id).cloned())
    }

    async fn get_pages(&self, page_ids: &[String]) -> Result<Vec<Page>> {
        let pages = read(&self.pages)?;
        Ok(page_ids.iter().filter_map(|id| pages.get(id).cloned()).collect())
    }

    async fn get_accessible_pages(
        &self,
        user_id: &str,
        external_ids: &[String],
    ) -> Result<Vec<Page>> {
        let pages = read(&self.pages)?;
        let mut out = Vec::new();
        for ext in external_ids {
            if let Some(page) = pages.values().find(|p| &p.external_id == ext) {
                if self.can_read(page, user_id)? {
                    out.push(page.clone());
                }
            }
        }
        Ok(out)
    }

    async fn list_accessible_page_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let pages = read(&self.pages)?;
        let mut ids = Vec::new();
        for page in pages.values() {
            if self.can_read(page, user_id)? {
                ids.push(page.id.clone());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn list_page_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = read(&self.pages)?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_embeddings(&self, page_ids: &[String]) -> Result<HashMap<String, PageEmbedding>> {
        let embeddings = read(&self.embeddings)?;
        Ok(page_ids
            .iter()
            .filter_map(|id| embeddings.get(id).map(|e| (id.clone(), e.clone())))
            .collect())
    }

    async fn upsert_embedding(&self, embedding: &PageEmbedding) -> Result<()> {
        write(&self.embeddings)?.insert(embedding.page_id.clone(), embedding.clone());
        Ok(())
    }

    async fn delete_embedding(&self, page_id: &str) -> Result<()> {
        write(&self.embeddings)?.remove(page_id);
        Ok(())
    }

    async fn clear_embeddings(&self) -> Result<u64> {
        let mut embeddings = write(&self.embeddings)?;
        let count = embeddings.len() as u64;
        embeddings.clear();
        Ok(count)
    }

    async fn create_ask_request(&self, request: &AskRequest) -> Result<()> {
        write(&self.asks)?.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn finalize_ask_request(
        &self,
        id: &str,
        resolution: &Resolution,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut asks = write(&self.asks)?;
        Ok(match asks.get_mut(id) {
            Some(request) => request.resolve(resolution.clone(), at),
            None => false,
        })
    }

    async fn get_ask_request(&self, id: &str) -> Result<Option<AskRequest>> {
        Ok(read(&self.asks)?.get(id).cloned())
    }

    async fn list_ask_requests(&self, user_id: &str, limit: usize) -> Result<Vec<AskRequest>> {
        let mut requests: Vec<AskRequest> = read(&self.asks)?
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        requests.truncate(limit);
        Ok(requests)
    }

    async fn list_stale_pending(&self, created_before: DateTime<Utc>) -> Result<Vec<AskRequest>> {
        Ok(read(&self.asks)?
            .values()
            .filter(|r| r.status == AskStatus::Pending && r.created_at < created_before)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SecretStore for InMemoryStore {
    async fn list_credentials(&self, user_id: &str) -> Result<Vec<ProviderCredential>> {
        Ok(read(&self.credentials)?
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn put_credential(&self, credential: &ProviderCredential) -> Result<()> {
        let mut stored = credential.clone();
        stored.last_validated_at = None;
        stored.last_validation_ok = None;
        write(&self.credentials)?.insert((stored.user_id.clone(), stored.provider), stored);
        Ok(())
    }

    async fn record_validation(
        &self,
        user_id: &str,
        provider: ProviderId,
        ok: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(cred) = write(&self.credentials)?.get_mut(&(user_id.to_string(), provider)) {
            cred.last_validated_at = Some(at);
            cred.last_validation_ok = Some(ok);
        }
        Ok(())
    }

    async fn provider_preference(&self, user_id: &str) -> Result<Option<Vec<ProviderId>>> {
        Ok(read(&self.preferences)?.get(user_id).cloned())
    }

    async fn set_provider_preference(&self, user_id: &str, order: &[ProviderId]) -> Result<()> {
        write(&self.preferences)?.insert(user_id.to_string(), order.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AskErrorCode;

    fn page(id: &str, owner: &str) -> Page {
        let now = Utc::now();
        Page {
            id: id.to_string(),
            external_id: format!("ext-{}", id),
            owner_id: owner.to_string(),
            title: id.to_string(),
            body: String::new(),
            created_at: now,
            modified_at: now,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_accessible_pages_respects_owner_and_grants() {
        let store = InMemoryStore::new();
        store.upsert_page(&page("a", "alice")).await.unwrap();
        store.upsert_page(&page("b", "bob")).await.unwrap();
        store.upsert_page(&page("c", "bob")).await.unwrap();
        store.grant_access("c", "alice").await.unwrap();

        let ids = vec!["ext-c".to_string(), "ext-b".to_string(), "ext-a".to_string(), "nope".to_string()];
        let pages = store.get_accessible_pages("alice", &ids).await.unwrap();
        let got: Vec<&str> = pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(got, vec!["c", "a"]);

        assert_eq!(
            store.list_accessible_page_ids("alice").await.unwrap(),
            vec!["a".to_string(), "c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_page_cascades_embedding() {
        let store = InMemoryStore::new();
        store.upsert_page(&page("a", "alice")).await.unwrap();
        store
            .upsert_embedding(&PageEmbedding {
                page_id: "a".into(),
                vector: vec![1.0],
                model: "m".into(),
                dims: 1,
                content_hash: "h".into(),
                computed_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(store.delete_page("a").await.unwrap());
        assert!(store.get_embeddings(&["a".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_is_write_once() {
        let store = InMemoryStore::new();
        let req = AskRequest::pending("alice", "q");
        store.create_ask_request(&req).await.unwrap();
        let now = Utc::now();
        assert!(store
            .finalize_ask_request(&req.id, &Resolution::Failed(AskErrorCode::ApiError), now)
            .await
            .unwrap());
        assert!(!store
            .finalize_ask_request(
                &req.id,
                &Resolution::Answered { answer: "late".into(), page_ids: vec![] },
                now
            )
            .await
            .unwrap());
        let stored = store.get_ask_request(&req.id).await.unwrap().unwrap();
        assert_eq!(stored.error, Some(AskErrorCode::ApiError));
        assert!(stored.answer.is_none());
    }

    #[tokio::test]
    async fn test_put_credential_resets_validation() {
        let store = InMemoryStore::new();
        let cred = ProviderCredential::new("alice", ProviderId::Google, "k1");
        store.put_credential(&cred).await.unwrap();
        store
            .record_validation("alice", ProviderId::Google, false, Utc::now())
            .await
            .unwrap();
        assert!(store.list_credentials("alice").await.unwrap()[0].failed_last_validation());

        store
            .put_credential(&ProviderCredential::new("alice", ProviderId::Google, "k2"))
            .await
            .unwrap();
        let creds = store.list_credentials("alice").await.unwrap();
        assert_eq!(creds[0].last_validation_ok, None);
        assert_eq!(creds[0].secret, "k2");
    }
}
