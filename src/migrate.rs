use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema if it does not exist. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Pages: the corpus. Timestamps are Unix milliseconds.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            id TEXT PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            updated_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_owner ON pages(owner_id)")
        .execute(pool)
        .await?;

    // Read grants beyond the owner.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS page_access (
            page_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            PRIMARY KEY (page_id, user_id),
            FOREIGN KEY (page_id) REFERENCES pages(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_page_access_user ON page_access(user_id)")
        .execute(pool)
        .await?;

    // Embedding cache: one vector per page, little-endian f32 BLOB.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS page_embeddings (
            page_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            computed_at INTEGER NOT NULL,
            FOREIGN KEY (page_id) REFERENCES pages(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ask_requests (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            query TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'ok', 'failed')),
            error TEXT,
            answer TEXT,
            created_at INTEGER NOT NULL,
            resolved_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ask_requests_user ON ask_requests(user_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ask_requests_status ON ask_requests(status, created_at)",
    )
    .execute(pool)
    .await?;

    // Pages that grounded an answer, in prompt order. Page ids are kept
    // even if the page is later deleted.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ask_request_pages (
            ask_request_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            page_id TEXT NOT NULL,
            PRIMARY KEY (ask_request_id, position),
            FOREIGN KEY (ask_request_id) REFERENCES ask_requests(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provider_credentials (
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            secret TEXT NOT NULL,
            last_validated_at INTEGER,
            last_validation_ok INTEGER,
            PRIMARY KEY (user_id, provider)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Comma-separated provider ids in preference order.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provider_preferences (
            user_id TEXT PRIMARY KEY,
            providers TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
