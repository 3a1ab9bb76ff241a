//! SQLite-backed [`Store`] and [`SecretStore`].
//!
//! Timestamps are stored as Unix milliseconds, vectors as little-endian f32
//! BLOBs. Foreign keys are enforced, so deleting a page removes its grants
//! and cached embedding. Finalizing an ask request is a conditional
//! `UPDATE ... WHERE status = 'pending'`, which makes it write-once.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

use pagewise_core::embedding::{blob_to_vec, vec_to_blob};
use pagewise_core::models::{
    AskErrorCode, AskRequest, AskStatus, Page, PageEmbedding, ProviderCredential, ProviderId,
    Resolution,
};
use pagewise_core::store::{SecretStore, Store};

/// Bound parameters per `IN (...)` query.
const IN_BATCH: usize = 500;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn attach_page_ids(&self, requests: &mut [AskRequest]) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = requests.iter().map(|r| r.id.clone()).collect();
        let mut by_request: HashMap<String, Vec<String>> = HashMap::new();
        for batch in ids.chunks(IN_BATCH) {
            let sql = format!(
                "SELECT ask_request_id, page_id FROM ask_request_pages \
                 WHERE ask_request_id IN ({}) ORDER BY ask_request_id, position",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                by_request
                    .entry(row.get("ask_request_id"))
                    .or_default()
                    .push(row.get("page_id"));
            }
        }
        for request in requests.iter_mut() {
            request.page_ids = by_request.remove(&request.id).unwrap_or_default();
        }
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_page(row: &SqliteRow) -> Page {
    Page {
        id: row.get("id"),
        external_id: row.get("external_id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        body: row.get("body"),
        created_at: from_millis(row.get("created_at")),
        modified_at: from_millis(row.get("modified_at")),
        updated_at: row.get::<Option<i64>, _>("updated_at").map(from_millis),
    }
}

fn row_to_ask(row: &SqliteRow) -> Result<AskRequest> {
    let status: String = row.get("status");
    Ok(AskRequest {
        id: row.get("id"),
        user_id: row.get("user_id"),
        query: row.get("query"),
        status: AskStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown ask request status: {}", status))?,
        error: row
            .get::<Option<String>, _>("error")
            .map(|code| AskErrorCode::normalize(&code)),
        answer: row.get("answer"),
        page_ids: Vec::new(),
        created_at: from_millis(row.get("created_at")),
        resolved_at: row.get::<Option<i64>, _>("resolved_at").map(from_millis),
    })
}

fn row_to_credential(row: &SqliteRow) -> Result<ProviderCredential> {
    let provider: String = row.get("provider");
    Ok(ProviderCredential {
        user_id: row.get("user_id"),
        provider: ProviderId::from_str(&provider)?,
        secret: row.get("secret"),
        last_validated_at: row
            .get::<Option<i64>, _>("last_validated_at")
            .map(from_millis),
        last_validation_ok: row
            .get::<Option<i64>, _>("last_validation_ok")
            .map(|v| v != 0),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_page(&self, page: &Page) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pages (id, external_id, owner_id, title, body,
                               created_at, modified_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                external_id = excluded.external_id,
                owner_id = excluded.owner_id,
                title = excluded.title,
                body = excluded.body,
                modified_at = excluded.modified_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&page.id)
        .bind(&page.external_id)
        .bind(&page.owner_id)
        .bind(&page.title)
        .bind(&page.body)
        .bind(to_millis(page.created_at))
        .bind(to_millis(page.modified_at))
        .bind(page.updated_at.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn grant_access(&self, page_id: &str, user_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO page_access (page_id, user_id) VALUES (?, ?)")
            .bind(page_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_page(&self, page_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pages WHERE id = ?")
            .bind(page_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_page(&self, page_id: &str) -> Result<Option<Page>> {
        let row = sqlx::query("SELECT * FROM pages WHERE id = ?")
            .bind(page_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_page))
    }

    async fn get_pages(&self, page_ids: &[String]) -> Result<Vec<Page>> {
        let mut by_id = HashMap::new();
        for batch in page_ids.chunks(IN_BATCH) {
            let sql = format!(
                "SELECT * FROM pages WHERE id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                let page = row_to_page(&row);
                by_id.insert(page.id.clone(), page);
            }
        }
        Ok(page_ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn get_accessible_pages(
        &self,
        user_id: &str,
        external_ids: &[String],
    ) -> Result<Vec<Page>> {
        let mut by_external = HashMap::new();
        for batch in external_ids.chunks(IN_BATCH) {
            let sql = format!(
                r#"
                SELECT p.* FROM pages p
                WHERE p.external_id IN ({})
                  AND (p.owner_id = ?
                       OR EXISTS (SELECT 1 FROM page_access a
                                  WHERE a.page_id = p.id AND a.user_id = ?))
                "#,
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            query = query.bind(user_id).bind(user_id);
            for row in query.fetch_all(&self.pool).await? {
                let page = row_to_page(&row);
                by_external.insert(page.external_id.clone(), page);
            }
        }
        Ok(external_ids
            .iter()
            .filter_map(|id| by_external.remove(id))
            .collect())
    }

    async fn list_accessible_page_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM pages WHERE owner_id = ?
            UNION
            SELECT page_id FROM page_access WHERE user_id = ?
            ORDER BY 1
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn list_page_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM pages ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn get_embeddings(&self, page_ids: &[String]) -> Result<HashMap<String, PageEmbedding>> {
        let mut out = HashMap::new();
        for batch in page_ids.chunks(IN_BATCH) {
            let sql = format!(
                "SELECT page_id, model, dims, content_hash, embedding, computed_at \
                 FROM page_embeddings WHERE page_id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                let blob: Vec<u8> = row.get("embedding");
                let dims: i64 = row.get("dims");
                let embedding = PageEmbedding {
                    page_id: row.get("page_id"),
                    vector: blob_to_vec(&blob),
                    model: row.get("model"),
                    dims: dims as usize,
                    content_hash: row.get("content_hash"),
                    computed_at: from_millis(row.get("computed_at")),
                };
                out.insert(embedding.page_id.clone(), embedding);
            }
        }
        Ok(out)
    }

    async fn upsert_embedding(&self, embedding: &PageEmbedding) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO page_embeddings (page_id, model, dims, content_hash, embedding, computed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(page_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                content_hash = excluded.content_hash,
                embedding = excluded.embedding,
                computed_at = excluded.computed_at
            "#,
        )
        .bind(&embedding.page_id)
        .bind(&embedding.model)
        .bind(embedding.dims as i64)
        .bind(&embedding.content_hash)
        .bind(vec_to_blob(&embedding.vector))
        .bind(to_millis(embedding.computed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_embedding(&self, page_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM page_embeddings WHERE page_id = ?")
            .bind(page_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_embeddings(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM page_embeddings")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn create_ask_request(&self, request: &AskRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ask_requests (id, user_id, query, status, error, answer, created_at, resolved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(&request.user_id)
        .bind(&request.query)
        .bind(request.status.as_str())
        .bind(request.error.map(|c| c.as_str()))
        .bind(&request.answer)
        .bind(to_millis(request.created_at))
        .bind(request.resolved_at.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_ask_request(
        &self,
        id: &str,
        resolution: &Resolution,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let (status, error, answer, page_ids): (AskStatus, Option<AskErrorCode>, Option<&str>, &[String]) =
            match resolution {
                Resolution::Answered { answer, page_ids } => {
                    (AskStatus::Ok, None, Some(answer.as_str()), page_ids.as_slice())
                }
                Resolution::Failed(code) => (AskStatus::Failed, Some(*code), None, &[] as &[String]),
            };

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE ask_requests
            SET status = ?, error = ?, answer = ?, resolved_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(error.map(|c| c.as_str()))
        .bind(answer)
        .bind(to_millis(at))
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for (position, page_id) in page_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO ask_request_pages (ask_request_id, position, page_id) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(position as i64)
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn get_ask_request(&self, id: &str) -> Result<Option<AskRequest>> {
        let row = sqlx::query("SELECT * FROM ask_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut requests = vec![row_to_ask(&row)?];
        self.attach_page_ids(&mut requests).await?;
        Ok(requests.pop())
    }

    async fn list_ask_requests(&self, user_id: &str, limit: usize) -> Result<Vec<AskRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ask_requests
            WHERE user_id = ?
            ORDER BY created_at DESC, id
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut requests = rows.iter().map(row_to_ask).collect::<Result<Vec<_>>>()?;
        self.attach_page_ids(&mut requests).await?;
        Ok(requests)
    }

    async fn list_stale_pending(&self, created_before: DateTime<Utc>) -> Result<Vec<AskRequest>> {
        let rows = sqlx::query(
            "SELECT * FROM ask_requests WHERE status = 'pending' AND created_at < ? ORDER BY created_at",
        )
        .bind(to_millis(created_before))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_ask).collect()
    }
}

#[async_trait]
impl SecretStore for SqliteStore {
    async fn list_credentials(&self, user_id: &str) -> Result<Vec<ProviderCredential>> {
        let rows = sqlx::query("SELECT * FROM provider_credentials WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_credential).collect()
    }

    async fn put_credential(&self, credential: &ProviderCredential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_credentials (user_id, provider, secret, last_validated_at, last_validation_ok)
            VALUES (?, ?, ?, NULL, NULL)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                secret = excluded.secret,
                last_validated_at = NULL,
                last_validation_ok = NULL
            "#,
        )
        .bind(&credential.user_id)
        .bind(credential.provider.as_str())
        .bind(&credential.secret)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_validation(
        &self,
        user_id: &str,
        provider: ProviderId,
        ok: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE provider_credentials
            SET last_validated_at = ?, last_validation_ok = ?
            WHERE user_id = ? AND provider = ?
            "#,
        )
        .bind(to_millis(at))
        .bind(ok as i64)
        .bind(user_id)
        .bind(provider.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn provider_preference(&self, user_id: &str) -> Result<Option<Vec<ProviderId>>> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT providers FROM provider_preferences WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        let order = stored
            .split(',')
            .filter(|s| !s.is_empty())
            .map(ProviderId::from_str)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Some(order))
    }

    async fn set_provider_preference(&self, user_id: &str, order: &[ProviderId]) -> Result<()> {
        let joined = order
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",");
        sqlx::query(
            r#"
            INSERT INTO provider_preferences (user_id, providers) VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET providers = excluded.providers
            "#,
        )
        .bind(user_id)
        .bind(joined)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("test.sqlite")).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn page(id: &str, owner: &str) -> Page {
        let now = from_millis(Utc::now().timestamp_millis());
        Page {
            id: id.to_string(),
            external_id: format!("ext-{id}"),
            owner_id: owner.to_string(),
            title: format!("Title {id}"),
            body: format!("Body {id}"),
            created_at: now,
            modified_at: now,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_page_roundtrip_and_access() {
        let (_tmp, store) = store().await;
        let p1 = page("p1", "alice");
        store.upsert_page(&p1).await.unwrap();
        store.upsert_page(&page("p2", "bob")).await.unwrap();
        store.grant_access("p2", "alice").await.unwrap();
        store.upsert_page(&page("p3", "bob")).await.unwrap();

        assert_eq!(store.get_page("p1").await.unwrap(), Some(p1));

        let ids = vec!["ext-p3".to_string(), "ext-p2".to_string(), "ext-nope".to_string(), "ext-p1".to_string()];
        let visible: Vec<String> = store
            .get_accessible_pages("alice", &ids)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(visible, vec!["p2", "p1"]);

        assert_eq!(store.list_accessible_page_ids("alice").await.unwrap(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_delete_page_cascades_embedding() {
        let (_tmp, store) = store().await;
        store.upsert_page(&page("p1", "alice")).await.unwrap();
        store
            .upsert_embedding(&PageEmbedding {
                page_id: "p1".to_string(),
                vector: vec![0.5, -0.25],
                model: "m".to_string(),
                dims: 2,
                content_hash: "h".to_string(),
                computed_at: Utc::now(),
            })
            .await
            .unwrap();
        let cached = store.get_embeddings(&["p1".to_string()]).await.unwrap();
        assert_eq!(cached["p1"].vector, vec![0.5, -0.25]);

        assert!(store.delete_page("p1").await.unwrap());
        assert!(store.get_embeddings(&["p1".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_is_write_once_and_keeps_pages() {
        let (_tmp, store) = store().await;
        let request = AskRequest::pending("alice", "q");
        store.create_ask_request(&request).await.unwrap();

        let answered = Resolution::Answered {
            answer: "a".to_string(),
            page_ids: vec!["p2".to_string(), "p1".to_string()],
        };
        assert!(store.finalize_ask_request(&request.id, &answered, Utc::now()).await.unwrap());
        assert!(!store
            .finalize_ask_request(&request.id, &Resolution::Failed(AskErrorCode::ApiError), Utc::now())
            .await
            .unwrap());

        let stored = store.get_ask_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AskStatus::Ok);
        assert_eq!(stored.answer.as_deref(), Some("a"));
        assert_eq!(stored.error, None);
        assert_eq!(stored.page_ids, vec!["p2", "p1"]);
        assert!(stored.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_error_code_normalizes() {
        let (_tmp, store) = store().await;
        let request = AskRequest::pending("alice", "q");
        store.create_ask_request(&request).await.unwrap();
        sqlx::query("UPDATE ask_requests SET status = 'failed', error = 'legacy_code' WHERE id = ?")
            .bind(&request.id)
            .execute(store.pool())
            .await
            .unwrap();
        let stored = store.get_ask_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.error, Some(AskErrorCode::Unexpected));
    }

    #[tokio::test]
    async fn test_history_newest_first_and_stale_pending() {
        let (_tmp, store) = store().await;
        let mut older = AskRequest::pending("alice", "first");
        older.created_at = Utc::now() - chrono::Duration::seconds(900);
        let newer = AskRequest::pending("alice", "second");
        store.create_ask_request(&older).await.unwrap();
        store.create_ask_request(&newer).await.unwrap();
        store.create_ask_request(&AskRequest::pending("bob", "other")).await.unwrap();

        let history = store.list_ask_requests("alice", 10).await.unwrap();
        let queries: Vec<&str> = history.iter().map(|r| r.query.as_str()).collect();
        assert_eq!(queries, vec!["second", "first"]);

        let stale = store
            .list_stale_pending(Utc::now() - chrono::Duration::seconds(300))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, older.id);
    }

    #[tokio::test]
    async fn test_credentials_and_preferences() {
        let (_tmp, store) = store().await;
        let cred = ProviderCredential::new("alice", ProviderId::Anthropic, "sk-ant");
        store.put_credential(&cred).await.unwrap();
        store
            .record_validation("alice", ProviderId::Anthropic, false, Utc::now())
            .await
            .unwrap();
        let listed = store.list_credentials("alice").await.unwrap();
        assert!(listed[0].failed_last_validation());

        // Replacing the secret resets validation state.
        store.put_credential(&cred).await.unwrap();
        let listed = store.list_credentials("alice").await.unwrap();
        assert_eq!(listed[0].last_validation_ok, None);
        assert_eq!(listed[0].secret, "sk-ant");

        assert_eq!(store.provider_preference("alice").await.unwrap(), None);
        store
            .set_provider_preference("alice", &[ProviderId::Google, ProviderId::OpenAi])
            .await
            .unwrap();
        assert_eq!(
            store.provider_preference("alice").await.unwrap(),
            Some(vec![ProviderId::Google, ProviderId::OpenAi])
        );
    }
}
