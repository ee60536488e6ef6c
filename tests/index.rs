//! Embedding store behaviour: incremental rebuilds, ranking, validated
//! queries and the query vector cache.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use command_harness::config::{IndexSettings, ProviderKind};
use command_harness::embedding::{create_provider, EmbeddingProvider};
use command_harness::index::EmbeddingStore;
use command_harness::models::EmbeddingRecord;
use command_harness::Error;

const KEYWORDS: [&str; 3] = ["bucket", "object", "user"];

/// Keyword-count vectors, so rankings in these tests are predictable.
#[derive(Default)]
struct KeywordProvider {
    calls: AtomicUsize,
    texts: AtomicUsize,
}

impl KeywordProvider {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
    fn texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordProvider {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    async fn embed(&self, texts: &[String]) -> command_harness::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                if t == "empty" {
                    return Vec::new();
                }
                let lower = t.to_lowercase();
                KEYWORDS
                    .iter()
                    .map(|k| lower.matches(k).count() as f32)
                    .collect()
            })
            .collect())
    }
}

fn record(cmd: &str, sub: &str, desc: &str) -> EmbeddingRecord {
    EmbeddingRecord::new(cmd, sub, desc.to_string(), json!({ "arguments": [] }))
}

fn catalog() -> Vec<EmbeddingRecord> {
    vec![
        record("storage", "list", "List every bucket"),
        record("storage", "get", "Download an object from a bucket"),
        record("users", "show", "Show a user profile"),
    ]
}

async fn open(tmp: &TempDir) -> (EmbeddingStore, Arc<KeywordProvider>) {
    let provider = Arc::new(KeywordProvider::default());
    let store = EmbeddingStore::open(
        &tmp.path().join("index.sqlite"),
        "command_descriptions",
        provider.clone(),
    )
    .await
    .unwrap();
    (store, provider)
}

#[tokio::test]
async fn test_rebuild_reuses_unchanged_vectors() {
    let tmp = TempDir::new().unwrap();
    let (store, provider) = open(&tmp).await;

    let first = store.rebuild(&catalog()).await.unwrap();
    assert_eq!(first.total, 3);
    assert_eq!(first.embedded, 3);
    assert_eq!(first.reused, 0);
    assert_eq!(provider.calls(), 1);
    let before = store.all().await.unwrap();

    let second = store.rebuild(&catalog()).await.unwrap();
    assert_eq!(second.embedded, 0);
    assert_eq!(second.reused, 3);
    assert_eq!(provider.calls(), 1, "unchanged catalog must not re-embed");

    let after = store.all().await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_rebuild_embeds_only_changed_and_purges_stale() {
    let tmp = TempDir::new().unwrap();
    let (store, provider) = open(&tmp).await;
    store.rebuild(&catalog()).await.unwrap();
    assert_eq!(provider.texts(), 3);

    let updated = vec![
        record("storage", "list", "List every bucket you own"),
        record("storage", "get", "Download an object from a bucket"),
    ];
    let stats = store.rebuild(&updated).await.unwrap();
    assert_eq!(stats.embedded, 1);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.removed, 1);
    assert_eq!(provider.texts(), 4);

    let ids: Vec<String> = store
        .all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.section_id)
        .collect();
    assert_eq!(ids, vec!["storage.list", "storage.get"]);
}

#[tokio::test]
async fn test_rebuild_rejects_duplicate_section_ids() {
    let tmp = TempDir::new().unwrap();
    let (store, provider) = open(&tmp).await;
    let dup = vec![record("a", "b", "one"), record("a", "b", "two")];
    assert!(matches!(
        store.rebuild(&dup).await.unwrap_err(),
        Error::InvalidInput(_)
    ));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_query_ranks_by_similarity() {
    let tmp = TempDir::new().unwrap();
    let (store, _provider) = open(&tmp).await;
    store.rebuild(&catalog()).await.unwrap();

    let hits = store.query("find the user", 3).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].record.section_id, "users.show");
    assert!((hits[0].score - 1.0).abs() < 1e-6);
    assert!(hits.iter().all(|h| !h.validated));

    let top = store.query("object", 1).await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].record.section_id, "storage.get");

    assert!(store.query("bucket", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_equal_scores_keep_catalog_order() {
    let tmp = TempDir::new().unwrap();
    let (store, _provider) = open(&tmp).await;
    store
        .rebuild(&[
            record("b", "second", "a user"),
            record("a", "first", "another user"),
            record("c", "third", "bucket"),
        ])
        .await
        .unwrap();

    let hits = store.query("user", 3).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.record.section_id.as_str()).collect();
    assert_eq!(ids, vec!["b.second", "a.first", "c.third"]);
}

#[tokio::test]
async fn test_empty_vectors_score_zero() {
    let tmp = TempDir::new().unwrap();
    let (store, _provider) = open(&tmp).await;
    store.rebuild(&catalog()).await.unwrap();

    let hits = store.query("empty", 3).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|h| h.score == 0.0));
}

#[tokio::test]
async fn test_validated_query_short_circuits_ranking() {
    let tmp = TempDir::new().unwrap();
    let (store, provider) = open(&tmp).await;
    store.rebuild(&catalog()).await.unwrap();
    let calls = provider.calls();

    let entry = store
        .add_validated_query("list buckets", "storage", "list", 0.95)
        .await
        .unwrap();
    assert_eq!(entry.command, "storage");

    let hits = store.query("list buckets", 3).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.section_id, "storage.list");
    assert_eq!(hits[0].score, 0.95);
    assert!(hits[0].validated);
    assert_eq!(provider.calls(), calls, "validated hits skip embedding");

    // Exact text only.
    let ranked = store.query("list buckets please", 3).await.unwrap();
    assert_eq!(ranked.len(), 3);
    assert!(ranked.iter().all(|h| !h.validated));
}

#[tokio::test]
async fn test_validated_query_upsert_and_latest_wins() {
    let tmp = TempDir::new().unwrap();
    let (store, _provider) = open(&tmp).await;
    store.rebuild(&catalog()).await.unwrap();

    let first = store
        .add_validated_query("who am i", "users", "show", 0.5)
        .await
        .unwrap();
    let again = store
        .add_validated_query("who am i", "users", "show", 0.8)
        .await
        .unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(again.confidence, 0.8);
    assert_eq!(store.get_all_validated_queries().await.unwrap().len(), 1);

    store
        .add_validated_query("who am i", "storage", "list", 0.7)
        .await
        .unwrap();
    let hits = store.query("who am i", 3).await.unwrap();
    assert_eq!(hits[0].record.section_id, "storage.list");
    assert_eq!(hits[0].score, 0.7);

    store
        .add_validated_query("who am i", "users", "show", 0.9)
        .await
        .unwrap();
    let hits = store.query("who am i", 3).await.unwrap();
    assert_eq!(hits[0].record.section_id, "users.show");
}

#[tokio::test]
async fn test_remove_validated_query() {
    let tmp = TempDir::new().unwrap();
    let (store, _provider) = open(&tmp).await;
    store.rebuild(&catalog()).await.unwrap();

    let entry = store
        .add_validated_query("list buckets", "storage", "list", 1.0)
        .await
        .unwrap();
    assert!(store.remove_validated_query(entry.id).await.unwrap());
    assert!(!store.remove_validated_query(entry.id).await.unwrap());
    assert!(store.get_all_validated_queries().await.unwrap().is_empty());

    let hits = store.query("list buckets", 3).await.unwrap();
    assert!(hits.iter().all(|h| !h.validated));
}

#[tokio::test]
async fn test_validated_query_input_checks() {
    let tmp = TempDir::new().unwrap();
    let (store, _provider) = open(&tmp).await;

    for confidence in [-0.1, 1.5] {
        let err = store
            .add_validated_query("q", "storage", "list", confidence)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
    assert!(matches!(
        store
            .add_validated_query("  ", "storage", "list", 0.5)
            .await
            .unwrap_err(),
        Error::InvalidInput(_)
    ));
}

#[tokio::test]
async fn test_stale_validated_query_falls_through() {
    let tmp = TempDir::new().unwrap();
    let (store, _provider) = open(&tmp).await;
    store.rebuild(&catalog()).await.unwrap();
    store
        .add_validated_query("show user", "users", "delete", 1.0)
        .await
        .unwrap();

    let hits = store.query("show user", 3).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert!(!hits[0].validated);
    assert_eq!(hits[0].record.section_id, "users.show");
}

#[tokio::test]
async fn test_query_vectors_are_cached() {
    let tmp = TempDir::new().unwrap();
    let (store, provider) = open(&tmp).await;
    store.rebuild(&catalog()).await.unwrap();
    let base = provider.calls();

    store.query("bucket", 3).await.unwrap();
    store.query("bucket", 3).await.unwrap();
    assert_eq!(provider.calls(), base + 1);

    assert_eq!(store.clear_query_cache().await.unwrap(), 1);
    assert_eq!(store.clear_query_cache().await.unwrap(), 0);

    store.query("bucket", 3).await.unwrap();
    assert_eq!(provider.calls(), base + 2);
}

#[tokio::test]
async fn test_store_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let (store, _) = open(&tmp).await;
        store.rebuild(&catalog()).await.unwrap();
    }
    let (store, provider) = open(&tmp).await;
    assert_eq!(store.all().await.unwrap().len(), 3);
    let stats = store.rebuild(&catalog()).await.unwrap();
    assert_eq!(stats.reused, 3);
    assert_eq!(provider.calls(), 0);
}

// ============ Remote provider against a mock embeddings API ============

#[derive(Clone, Default)]
struct EmbeddingsMock {
    bodies: Arc<Mutex<Vec<Value>>>,
    auth: Arc<Mutex<Vec<String>>>,
}

async fn embeddings(
    State(mock): State<EmbeddingsMock>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        mock.auth.lock().unwrap().push(auth.to_string());
    }
    let inputs: Vec<String> = body["input"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    mock.bodies.lock().unwrap().push(body);

    // Reverse order to check the provider sorts by index.
    let data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .rev()
        .map(|(i, text)| json!({ "index": i, "embedding": [text.len() as f64, 1.0] }))
        .collect();
    (StatusCode::OK, Json(json!({ "data": data })))
}

async fn spawn_embeddings_mock() -> (String, EmbeddingsMock) {
    let mock = EmbeddingsMock::default();
    let app = Router::new()
        .route("/v1/embeddings", post(embeddings))
        .with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/v1", addr), mock)
}

#[tokio::test]
async fn test_openai_provider_against_mock() {
    let (base, mock) = spawn_embeddings_mock().await;
    std::env::set_var("CMDX_TEST_EMBEDDINGS_KEY", "sk-test");

    let settings = IndexSettings {
        provider: ProviderKind::Openai,
        api_key_env: "CMDX_TEST_EMBEDDINGS_KEY".to_string(),
        api_base: Some(base),
        embedding_model: "mock-embed".to_string(),
        ..IndexSettings::default()
    };
    let provider = create_provider(&settings).unwrap();
    assert_eq!(provider.model_name(), "mock-embed");

    let texts = vec!["a".to_string(), "bbb".to_string()];
    let vectors = provider.embed(&texts).await.unwrap();
    assert_eq!(vectors, vec![vec![1.0, 1.0], vec![3.0, 1.0]]);

    // Served from the in-memory cache the second time.
    provider.embed(&texts).await.unwrap();
    let bodies = mock.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["model"], "mock-embed");
    assert_eq!(bodies[0]["input"], json!(["a", "bbb"]));
    assert_eq!(mock.auth.lock().unwrap()[0], "Bearer sk-test");
}

#[tokio::test]
async fn test_openai_provider_requires_key() {
    let settings = IndexSettings {
        provider: ProviderKind::Openai,
        api_key_env: "CMDX_TEST_UNSET_EMBEDDINGS_KEY".to_string(),
        ..IndexSettings::default()
    };
    assert!(matches!(
        create_provider(&settings).err(),
        Some(Error::EmbeddingProvider(_))
    ));
}

#[tokio::test]
async fn test_auto_provider_falls_back_to_hash() {
    let settings = IndexSettings {
        api_key_env: "CMDX_TEST_ABSENT_KEY".to_string(),
        ..IndexSettings::default()
    };
    let provider = create_provider(&settings).unwrap();
    assert_eq!(provider.model_name(), "hash-sha256");
    let v = provider.embed(&["x".to_string()]).await.unwrap();
    assert_eq!(v[0].len(), 64);
}
