use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::error::Result;

/// Creates the schema on an existing pool. Safe to run repeatedly; the
/// pipeline runs this on open so a separate `init` is never required.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    // One row per unique content hash. The UNIQUE constraint on sha256 is the
    // claim that decides races between concurrent ingests of equal bytes.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sha256 TEXT NOT NULL UNIQUE,
            filename TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            source_system TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            state TEXT NOT NULL DEFAULT 'ingested',
            ingested_at INTEGER NOT NULL,
            extracted_at INTEGER,
            indexed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            document_id INTEGER NOT NULL,
            page_number INTEGER NOT NULL,
            text TEXT NOT NULL,
            method TEXT NOT NULL,
            extraction_error INTEGER NOT NULL DEFAULT 0,
            char_count INTEGER NOT NULL,
            PRIMARY KEY (document_id, page_number),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='pages_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE pages_fts USING fts5(
                document_id UNINDEXED,
                page_number UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS page_vectors (
            document_id INTEGER NOT NULL,
            page_number INTEGER NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            text_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (document_id, page_number),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS authorities (
            citation_key TEXT NOT NULL,
            source TEXT NOT NULL,
            raw_citations TEXT NOT NULL DEFAULT '[]',
            payload TEXT NOT NULL,
            fetched_at INTEGER NOT NULL,
            ttl_secs INTEGER NOT NULL,
            PRIMARY KEY (citation_key, source)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_state ON documents(state)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_system)")
        .execute(pool)
        .await?;

    Ok(())
}

/// `dkt init`: connect, create the schema, close.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    run(&pool).await?;
    pool.close().await;
    Ok(())
}
