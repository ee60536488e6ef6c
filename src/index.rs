//! Persistent semantic index over the command catalog.
//!
//! [`EmbeddingStore`] keeps one embedding per subcommand in SQLite, plus
//! two side tables: operator-validated exact queries and a cache of query
//! vectors.
//!
//! # Rebuild
//!
//! Every record carries a `description_hash` over its identity, text,
//! schema and the provider's model name. [`EmbeddingStore::rebuild`] only
//! embeds records whose hash changed and reuses the stored vector for the
//! rest, then replaces the whole collection in one transaction, so
//! subcommands that disappeared from the configuration are purged.
//!
//! # Query
//!
//! 1. An exact match in the validated-query table wins outright and is
//!    returned as the single hit, scored with its stored confidence.
//! 2. Otherwise the query vector is taken from the cache (or embedded and
//!    cached) and every record is scored by cosine similarity.
//! 3. Results are sorted by descending score, ties keep catalog order.
//!
//! Each operation opens its own connection and closes it when done.

use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Connection, Row};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, hash_text, vec_to_blob, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{section_id, EmbeddingRecord, SearchHit, ValidatedQuery};

/// Counters reported by [`EmbeddingStore::rebuild`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub total: usize,
    /// Records sent to the provider.
    pub embedded: usize,
    /// Records whose stored vector was kept.
    pub reused: usize,
    /// Stale records dropped from the collection.
    pub removed: usize,
}

pub struct EmbeddingStore {
    path: PathBuf,
    collection: String,
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingStore {
    /// Open (creating if needed) the store at `path`.
    pub async fn open(
        path: &Path,
        collection: &str,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        migrate::run_migrations(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            collection: collection.to_string(),
            provider,
        })
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Replace the collection with `records`, embedding only changed ones.
    pub async fn rebuild(&self, records: &[EmbeddingRecord]) -> Result<RebuildStats> {
        let model = self.provider.model_name().to_string();

        let mut seen = HashSet::new();
        for r in records {
            if !seen.insert(r.section_id.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate section id '{}'",
                    r.section_id
                )));
            }
        }

        let mut conn = db::connect(&self.path).await?;

        let rows = sqlx::query(
            "SELECT section_id, description_hash, embedding FROM command_embeddings WHERE collection = ?",
        )
        .bind(&self.collection)
        .fetch_all(&mut conn)
        .await?;

        let mut existing: HashMap<String, (String, Vec<f32>)> = HashMap::new();
        for row in rows {
            let id: String = row.try_get("section_id")?;
            let hash: String = row.try_get("description_hash")?;
            let blob: Vec<u8> = row.try_get("embedding")?;
            existing.insert(id, (hash, blob_to_vec(&blob)));
        }

        let hashes: Vec<String> = records.iter().map(|r| record_hash(r, &model)).collect();

        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(records.len());
        let mut pending: Vec<usize> = Vec::new();
        for (i, record) in records.iter().enumerate() {
            match existing.get(&record.section_id) {
                Some((stored, vector)) if *stored == hashes[i] => vectors.push(Some(vector.clone())),
                _ => {
                    vectors.push(None);
                    pending.push(i);
                }
            }
        }

        if !pending.is_empty() {
            let texts: Vec<String> = pending
                .iter()
                .map(|&i| records[i].description.clone())
                .collect();
            let embedded = self.provider.embed(&texts).await?;
            if embedded.len() != texts.len() {
                return Err(Error::EmbeddingProvider(format!(
                    "expected {} vectors, got {}",
                    texts.len(),
                    embedded.len()
                )));
            }
            for (&i, vector) in pending.iter().zip(embedded) {
                vectors[i] = Some(vector);
            }
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = conn.begin().await?;
        sqlx::query("DELETE FROM command_embeddings WHERE collection = ?")
            .bind(&self.collection)
            .execute(&mut *tx)
            .await?;

        for (position, (record, vector)) in records.iter().zip(vectors).enumerate() {
            let vector = vector.unwrap_or_default();
            let schema_json = serde_json::to_string(&record.schema)
                .map_err(|e| Error::Store(format!("cannot encode schema: {}", e)))?;
            sqlx::query(
                r#"
                INSERT INTO command_embeddings
                    (collection, section_id, position, command, subcommand, description,
                     schema_json, description_hash, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&self.collection)
            .bind(&record.section_id)
            .bind(position as i64)
            .bind(&record.command)
            .bind(&record.subcommand)
            .bind(&record.description)
            .bind(schema_json)
            .bind(&hashes[position])
            .bind(vec_to_blob(&vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        conn.close().await?;

        let target: HashSet<&str> = records.iter().map(|r| r.section_id.as_str()).collect();
        let stats = RebuildStats {
            total: records.len(),
            embedded: pending.len(),
            reused: records.len() - pending.len(),
            removed: existing
                .keys()
                .filter(|k| !target.contains(k.as_str()))
                .count(),
        };
        tracing::info!(
            collection = %self.collection,
            total = stats.total,
            embedded = stats.embedded,
            reused = stats.reused,
            removed = stats.removed,
            "index rebuilt"
        );
        Ok(stats)
    }

    /// Every record in the collection, in catalog order.
    pub async fn all(&self) -> Result<Vec<EmbeddingRecord>> {
        let mut conn = db::connect(&self.path).await?;
        let rows = sqlx::query(
            r#"
            SELECT section_id, command, subcommand, description, schema_json,
                   description_hash, embedding
            FROM command_embeddings
            WHERE collection = ?
            ORDER BY position
            "#,
        )
        .bind(&self.collection)
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Rank stored records against `text`.
    pub async fn query(&self, text: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        if let Some(hit) = self.validated_hit(text).await? {
            return Ok(vec![hit]);
        }

        let query_vec = self.query_vector(text).await?;
        let records = self.all().await?;

        let mut hits: Vec<SearchHit> = records
            .into_iter()
            .map(|record| {
                let score = cosine_similarity(&query_vec, &record.embedding) as f64;
                SearchHit {
                    record,
                    score,
                    validated: false,
                }
            })
            .collect();

        // Stable sort keeps catalog order among equal scores.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn validated_hit(&self, text: &str) -> Result<Option<SearchHit>> {
        let mut conn = db::connect(&self.path).await?;
        let row = sqlx::query(
            r#"
            SELECT command, subcommand, confidence
            FROM validated_queries
            WHERE query_text = ?
            ORDER BY revision DESC
            LIMIT 1
            "#,
        )
        .bind(text)
        .fetch_optional(&mut conn)
        .await?;

        let Some(row) = row else {
            conn.close().await?;
            return Ok(None);
        };
        let command: String = row.try_get("command")?;
        let subcommand: String = row.try_get("subcommand")?;
        let confidence: f64 = row.try_get("confidence")?;

        let record_row = sqlx::query(
            r#"
            SELECT section_id, command, subcommand, description, schema_json,
                   description_hash, embedding
            FROM command_embeddings
            WHERE collection = ? AND section_id = ?
            "#,
        )
        .bind(&self.collection)
        .bind(section_id(&command, &subcommand))
        .fetch_optional(&mut conn)
        .await?;
        conn.close().await?;

        match record_row {
            Some(r) => Ok(Some(SearchHit {
                record: record_from_row(&r)?,
                score: confidence,
                validated: true,
            })),
            None => {
                tracing::warn!(
                    query = text,
                    target = %section_id(&command, &subcommand),
                    "validated query points at a command missing from the index"
                );
                Ok(None)
            }
        }
    }

    async fn query_vector(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.provider.model_name().to_string();
        let key = hash_text(text);

        let mut conn = db::connect(&self.path).await?;
        let cached = sqlx::query("SELECT embedding FROM query_cache WHERE model = ? AND query_hash = ?")
            .bind(&model)
            .bind(&key)
            .fetch_optional(&mut conn)
            .await?;
        if let Some(row) = cached {
            let blob: Vec<u8> = row.try_get("embedding")?;
            conn.close().await?;
            tracing::debug!("query vector cache hit");
            return Ok(blob_to_vec(&blob));
        }

        let vector = self
            .provider
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::EmbeddingProvider("provider returned no vector".into()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO query_cache (model, query_hash, embedding, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&model)
        .bind(&key)
        .bind(vec_to_blob(&vector))
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut conn)
        .await?;
        conn.close().await?;

        Ok(vector)
    }

    /// Drop every cached query vector. Returns the number removed.
    pub async fn clear_query_cache(&self) -> Result<u64> {
        let mut conn = db::connect(&self.path).await?;
        let result = sqlx::query("DELETE FROM query_cache")
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        Ok(result.rows_affected())
    }

    /// Insert or update the mapping `query_text → command.subcommand`.
    ///
    /// The most recent write for a given text is the one `query` returns.
    pub async fn add_validated_query(
        &self,
        query_text: &str,
        command: &str,
        subcommand: &str,
        confidence: f64,
    ) -> Result<ValidatedQuery> {
        if query_text.trim().is_empty() {
            return Err(Error::InvalidInput("query text must not be empty".into()));
        }
        if command.trim().is_empty() || subcommand.trim().is_empty() {
            return Err(Error::InvalidInput(
                "command and subcommand must not be empty".into(),
            ));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::InvalidInput(format!(
                "confidence must be in [0.0, 1.0], got {}",
                confidence
            )));
        }

        let created_at = chrono::Utc::now().to_rfc3339();
        let mut conn = db::connect(&self.path).await?;
        sqlx::query(
            r#"
            INSERT INTO validated_queries
                (query_text, command, subcommand, confidence, created_at, revision)
            VALUES (?, ?, ?, ?, ?,
                    (SELECT COALESCE(MAX(revision), 0) + 1 FROM validated_queries))
            ON CONFLICT (query_text, command, subcommand) DO UPDATE SET
                confidence = excluded.confidence,
                created_at = excluded.created_at,
                revision = excluded.revision
            "#,
        )
        .bind(query_text)
        .bind(command)
        .bind(subcommand)
        .bind(confidence)
        .bind(&created_at)
        .execute(&mut conn)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT id, query_text, command, subcommand, confidence, created_at
            FROM validated_queries
            WHERE query_text = ? AND command = ? AND subcommand = ?
            "#,
        )
        .bind(query_text)
        .bind(command)
        .bind(subcommand)
        .fetch_one(&mut conn)
        .await?;
        conn.close().await?;

        validated_from_row(&row)
    }

    /// Delete a validated query by id. Returns whether it existed.
    pub async fn remove_validated_query(&self, id: i64) -> Result<bool> {
        let mut conn = db::connect(&self.path).await?;
        let result = sqlx::query("DELETE FROM validated_queries WHERE id = ?")
            .bind(id)
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_all_validated_queries(&self) -> Result<Vec<ValidatedQuery>> {
        let mut conn = db::connect(&self.path).await?;
        let rows = sqlx::query(
            r#"
            SELECT id, query_text, command, subcommand, confidence, created_at
            FROM validated_queries
            ORDER BY id
            "#,
        )
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;

        rows.iter().map(validated_from_row).collect()
    }
}

/// Digest of every field that determines a record's vector.
pub fn record_hash(record: &EmbeddingRecord, model: &str) -> String {
    let payload = serde_json::json!({
        "section_id": record.section_id,
        "command": record.command,
        "subcommand": record.subcommand,
        "description": record.description,
        "schema": record.schema,
        "model": model,
    });
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EmbeddingRecord> {
    let schema_json: String = row.try_get("schema_json")?;
    let schema: Value = serde_json::from_str(&schema_json)
        .map_err(|e| Error::Store(format!("corrupt schema_json: {}", e)))?;
    let blob: Vec<u8> = row.try_get("embedding")?;
    Ok(EmbeddingRecord {
        section_id: row.try_get("section_id")?,
        command: row.try_get("command")?,
        subcommand: row.try_get("subcommand")?,
        description: row.try_get("description")?,
        schema,
        embedding: blob_to_vec(&blob),
        description_hash: row.try_get("description_hash")?,
    })
}

fn validated_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ValidatedQuery> {
    Ok(ValidatedQuery {
        id: row.try_get("id")?,
        query_text: row.try_get("query_text")?,
        command: row.try_get("command")?,
        subcommand: row.try_get("subcommand")?,
        confidence: row.try_get("confidence")?,
        created_at: row.try_get("created_at")?,
    })
}
