//! Page import.
//!
//! The page corpus is normally managed elsewhere; this is the minimal write
//! path used by `POST /v1/imports` and `pages add`. Each imported page is
//! owned by the importing user and announced to the embed worker.

use chrono::Utc;
use serde::Deserialize;

use pagewise_core::models::Page;
use pagewise_core::store::Store;

use crate::embed_worker::{PageEvent, PageEvents};

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("page {0} has an empty title")]
    EmptyTitle(usize),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// One page to import.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportItem {
    pub title: String,
    pub body: String,
}

/// Create pages owned by `owner_id`. Returns them in input order.
///
/// Blank titles are rejected before anything is written.
pub async fn import_pages(
    store: &dyn Store,
    events: Option<&PageEvents>,
    owner_id: &str,
    items: &[ImportItem],
) -> Result<Vec<Page>, ImportError> {
    if let Some(i) = items.iter().position(|item| item.title.trim().is_empty()) {
        return Err(ImportError::EmptyTitle(i + 1));
    }

    let mut created = Vec::with_capacity(items.len());
    for item in items {
        let now = Utc::now();
        let page = Page {
            id: uuid::Uuid::new_v4().to_string(),
            external_id: uuid::Uuid::new_v4().simple().to_string(),
            owner_id: owner_id.to_string(),
            title: item.title.trim().to_string(),
            body: item.body.clone(),
            created_at: now,
            modified_at: now,
            updated_at: None,
        };
        store.upsert_page(&page).await?;
        if let Some(events) = events {
            events.publish(PageEvent::Changed(page.id.clone()));
        }
        created.push(page);
    }

    tracing::info!(user = owner_id, count = created.len(), "pages imported");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagewise_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn test_import_creates_owned_pages_and_events() {
        let store = InMemoryStore::new();
        let (events, mut rx) = PageEvents::channel(4);
        let items = vec![ImportItem {
            title: " Refunds ".to_string(),
            body: "30 days.".to_string(),
        }];

        let pages = import_pages(&store, Some(&events), "alice", &items).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].title, "Refunds");
        assert_eq!(pages[0].owner_id, "alice");

        let visible = store
            .get_accessible_pages("alice", &[pages[0].external_id.clone()])
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(rx.recv().await, Some(PageEvent::Changed(pages[0].id.clone())));
    }

    #[tokio::test]
    async fn test_blank_title_writes_nothing() {
        let store = InMemoryStore::new();
        let items = vec![
            ImportItem {
                title: "ok".to_string(),
                body: String::new(),
            },
            ImportItem {
                title: "  ".to_string(),
                body: String::new(),
            },
        ];
        let err = import_pages(&store, None, "alice", &items).await.unwrap_err();
        assert!(matches!(err, ImportError::EmptyTitle(2)));
        assert!(store.list_page_ids().await.unwrap().is_empty());
    }
}
