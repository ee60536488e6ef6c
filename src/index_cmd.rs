//! `cmdx index ...` commands.

use anyhow::{bail, Result};
use serde_json::json;
use std::sync::Arc;

use crate::catalog;
use crate::config::Config;
use crate::embedding::LazyProvider;
use crate::index::EmbeddingStore;
use crate::models::SearchHit;

/// Open the configured store.
///
/// The provider is built on first use, so commands that never embed do
/// not need a credential.
pub async fn open_store(config: &Config) -> Result<EmbeddingStore> {
    let provider = Arc::new(LazyProvider::new(&config.index));
    let store = EmbeddingStore::open(
        &config.index_path(),
        &config.index.collection_name,
        provider,
    )
    .await?;
    Ok(store)
}

pub async fn run_rebuild(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let records = catalog::build_records(config);
    let stats = store.rebuild(&records).await?;

    println!("index rebuild");
    println!("  store: {}", config.index_path().display());
    println!("  model: {}", store.provider().model_name());
    println!("  commands: {}", stats.total);
    println!("  embedded: {}", stats.embedded);
    println!("  unchanged: {}", stats.reused);
    println!("  removed: {}", stats.removed);
    Ok(())
}

pub async fn run_list(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let records = store.all().await?;
    let out: Vec<_> = records
        .iter()
        .map(|r| {
            json!({
                "section_id": r.section_id,
                "command": r.command,
                "subcommand": r.subcommand,
                "description": r.description,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

pub async fn run_query(config: &Config, text: &str, top_k: Option<usize>) -> Result<()> {
    let store = open_store(config).await?;
    let top_k = top_k.unwrap_or(config.index.top_k);
    let hits = store.query(text, top_k).await?;
    let threshold = config.index.min_confidence;
    let confident = catalog::confident_hits(&hits, threshold);

    if confident.is_empty() && !hits.is_empty() {
        tracing::warn!(threshold, "no result reached the minimum confidence");
    }

    let out: Vec<_> = hits.iter().map(|h| hit_json(h, threshold)).collect();
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn hit_json(hit: &SearchHit, threshold: f64) -> serde_json::Value {
    json!({
        "section_id": hit.record.section_id,
        "command": hit.record.command,
        "subcommand": hit.record.subcommand,
        "score": hit.score,
        "validated": hit.validated,
        "confident": hit.validated || hit.score >= threshold,
        "schema": hit.record.schema,
    })
}

pub async fn run_validated_add(
    config: &Config,
    query_text: &str,
    command: &str,
    subcommand: &str,
    confidence: f64,
) -> Result<()> {
    if config.find_subcommand(command, subcommand).is_none() {
        bail!("unknown command '{} {}'", command, subcommand);
    }
    let store = open_store(config).await?;
    let entry = store
        .add_validated_query(query_text, command, subcommand, confidence)
        .await?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

pub async fn run_validated_list(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let entries = store.get_all_validated_queries().await?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

pub async fn run_validated_remove(config: &Config, id: i64) -> Result<()> {
    let store = open_store(config).await?;
    if !store.remove_validated_query(id).await? {
        bail!("no validated query with id {}", id);
    }
    println!("Removed validated query {}.", id);
    Ok(())
}

pub async fn run_cache_clear(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let removed = store.clear_query_cache().await?;
    println!("Cleared {} cached query vector(s).", removed);
    Ok(())
}
