use sqlx::Connection;
use std::path::Path;

use crate::db;
use crate::error::Result;

/// Create the index tables if they do not exist yet.
pub async fn run_migrations(path: &Path) -> Result<()> {
    let mut conn = db::connect(path).await?;

    // One row per indexed subcommand, scoped by collection.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS command_embeddings (
            collection TEXT NOT NULL,
            section_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            command TEXT NOT NULL,
            subcommand TEXT NOT NULL,
            description TEXT NOT NULL,
            schema_json TEXT NOT NULL,
            description_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, section_id)
        )
        "#,
    )
    .execute(&mut conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS validated_queries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            query_text TEXT NOT NULL,
            command TEXT NOT NULL,
            subcommand TEXT NOT NULL,
            confidence REAL NOT NULL,
            created_at TEXT NOT NULL,
            revision INTEGER NOT NULL,
            UNIQUE (query_text, command, subcommand)
        )
        "#,
    )
    .execute(&mut conn)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_validated_queries_text ON validated_queries(query_text)",
    )
    .execute(&mut conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS query_cache (
            model TEXT NOT NULL,
            query_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (model, query_hash)
        )
        "#,
    )
    .execute(&mut conn)
    .await?;

    conn.close().await?;
    Ok(())
}
