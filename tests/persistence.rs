//! Snapshot persistence: the atomic JSON store, fingerprint hygiene,
//! restore semantics, and the close-time flush.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Days;
use keywheel::Dispatcher;
use keywheel::clock::{Clock, SystemClock};
use keywheel::config::{Config, ProviderKeys, Settings};
use keywheel::dispatch::{
    ByteStream, ChatMessage, CompletionParams, CompletionRequest, CompletionResponse,
    EmbeddingParams, EmbeddingResponse, LlmClient,
};
use keywheel::error::ProviderError;
use keywheel::usage::UsageManager;
use keywheel::usage::cooldown::UsageCounters;
use keywheel::usage::store::{JsonFileStore, KeySnapshot, PersistentStore, Snapshot, fingerprint};

fn pools(keys: &[&str]) -> Vec<ProviderKeys> {
    vec![ProviderKeys {
        provider: "openai".to_string(),
        keys: keys.iter().map(|k| k.to_string()).collect(),
    }]
}

fn manager(keys: &[&str]) -> UsageManager {
    UsageManager::new(&pools(keys), Settings::default(), Arc::new(SystemClock))
}

fn counters(calls: u64, prompt: u64, completion: u64) -> UsageCounters {
    UsageCounters {
        calls,
        prompt_tokens: prompt,
        completion_tokens: completion,
        cost_usd: 0.0,
    }
}

#[tokio::test]
async fn missing_file_loads_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("usage.json"));
    assert!(store.load().await.unwrap().is_none());
}

#[tokio::test]
async fn snapshot_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("nested/dir/usage.json"));

    let mut keys = HashMap::new();
    keys.insert(
        fingerprint("k1"),
        KeySnapshot {
            provider: "openai".to_string(),
            usage_today: counters(3, 120, 48),
            usage_total: counters(10, 900, 400),
        },
    );
    keys.insert(
        fingerprint("k2"),
        KeySnapshot {
            provider: "xai".to_string(),
            usage_today: counters(0, 0, 0),
            usage_total: counters(1, 7, 2),
        },
    );
    let snapshot = Snapshot {
        last_reset_date: Some(SystemClock.local_date()),
        keys,
    };

    store.save(&snapshot).await.unwrap();
    let loaded = store.load().await.unwrap().unwrap();
    assert_eq!(loaded, snapshot);
}

#[tokio::test]
async fn saved_file_never_contains_raw_key_material() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.json");
    let store = JsonFileStore::new(path.clone());

    let m = manager(&["sk-very-secret-key-material"]);
    m.record_success(&fingerprint("sk-very-secret-key-material"), "gpt-x", 5, 2);
    store.save(&m.snapshot()).await.unwrap();

    let raw = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(!raw.contains("sk-very-secret"));
    assert!(raw.contains(&fingerprint("sk-very-secret-key-material")));
}

#[tokio::test]
async fn corrupt_file_loads_none_instead_of_failing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.json");
    tokio::fs::write(&path, b"{not json").await.unwrap();

    let store = JsonFileStore::new(path);
    assert!(store.load().await.unwrap().is_none());
}

#[tokio::test]
async fn save_overwrites_previous_snapshot_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.json");
    let store = JsonFileStore::new(path.clone());

    let first = Snapshot {
        last_reset_date: Some(SystemClock.local_date()),
        keys: HashMap::from([(
            fingerprint("k1"),
            KeySnapshot {
                provider: "openai".to_string(),
                usage_today: counters(1, 1, 1),
                usage_total: counters(0, 0, 0),
            },
        )]),
    };
    store.save(&first).await.unwrap();

    let mut second = first.clone();
    second
        .keys
        .get_mut(&fingerprint("k1"))
        .unwrap()
        .usage_today = counters(2, 2, 2);
    store.save(&second).await.unwrap();

    let loaded = store.load().await.unwrap().unwrap();
    assert_eq!(loaded, second);
    // No temp-file droppings left behind.
    let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name());
    }
    assert_eq!(names, vec!["usage.json"]);
}

/// The store stages replacements at `<path>.tmp.<pid>`; tests below poke
/// that location to fake failure modes.
fn staging_path(path: &std::path::Path) -> std::path::PathBuf {
    path.with_extension(format!("tmp.{}", std::process::id()))
}

#[tokio::test]
async fn failed_save_leaves_previous_snapshot_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.json");
    let store = JsonFileStore::new(path.clone());

    let first = Snapshot {
        last_reset_date: Some(SystemClock.local_date()),
        keys: HashMap::from([(
            fingerprint("k1"),
            KeySnapshot {
                provider: "openai".to_string(),
                usage_today: counters(1, 10, 4),
                usage_total: counters(2, 20, 8),
            },
        )]),
    };
    store.save(&first).await.unwrap();
    let before = tokio::fs::read(&path).await.unwrap();

    // Occupy the staging location with a directory: the save cannot write
    // its replacement there and must fail without touching the real file.
    tokio::fs::create_dir(&staging_path(&path)).await.unwrap();

    let mut second = first.clone();
    second.keys.get_mut(&fingerprint("k1")).unwrap().usage_today = counters(9, 9, 9);
    assert!(store.save(&second).await.is_err());

    let after = tokio::fs::read(&path).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(store.load().await.unwrap().unwrap(), first);
}

#[tokio::test]
async fn stale_temp_file_from_interrupted_save_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.json");
    let store = JsonFileStore::new(path.clone());

    let first = Snapshot {
        last_reset_date: Some(SystemClock.local_date()),
        keys: HashMap::from([(
            fingerprint("k1"),
            KeySnapshot {
                provider: "openai".to_string(),
                usage_today: counters(4, 40, 16),
                usage_total: counters(0, 0, 0),
            },
        )]),
    };
    store.save(&first).await.unwrap();

    // A crash between staging and rename leaves a half-written temp file.
    tokio::fs::write(&staging_path(&path), b"{\"last_reset")
        .await
        .unwrap();

    // Loads ignore the leftover entirely.
    assert_eq!(store.load().await.unwrap().unwrap(), first);

    // The next save reuses the staging path and replaces cleanly.
    let mut second = first.clone();
    second.keys.get_mut(&fingerprint("k1")).unwrap().usage_total = counters(4, 40, 16);
    store.save(&second).await.unwrap();
    assert_eq!(store.load().await.unwrap().unwrap(), second);
}

#[tokio::test]
async fn restore_seeds_live_counters() {
    let m1 = manager(&["k1"]);
    m1.record_success(&fingerprint("k1"), "gpt-x", 10, 4);
    let snapshot = m1.snapshot();

    let m2 = manager(&["k1"]);
    m2.restore(&snapshot);

    assert_eq!(m1.usage_of(&fingerprint("k1")), m2.usage_of(&fingerprint("k1")));
    assert_eq!(m2.snapshot(), snapshot);
}

#[tokio::test]
async fn restore_ignores_keys_that_left_the_pool() {
    let snapshot = Snapshot {
        last_reset_date: Some(SystemClock.local_date()),
        keys: HashMap::from([(
            fingerprint("departed-key"),
            KeySnapshot {
                provider: "openai".to_string(),
                usage_today: counters(9, 9, 9),
                usage_total: counters(9, 9, 9),
            },
        )]),
    };

    let m = manager(&["k1"]);
    m.restore(&snapshot);
    let (today, total) = m.usage_of(&fingerprint("k1")).unwrap();
    assert_eq!(today.calls, 0);
    assert_eq!(total.calls, 0);
}

#[tokio::test]
async fn stale_snapshot_day_archives_on_next_reset() {
    let yesterday = SystemClock
        .local_date()
        .checked_sub_days(Days::new(1))
        .unwrap();
    let snapshot = Snapshot {
        last_reset_date: Some(yesterday),
        keys: HashMap::from([(
            fingerprint("k1"),
            KeySnapshot {
                provider: "openai".to_string(),
                usage_today: counters(3, 30, 12),
                usage_total: counters(7, 700, 300),
            },
        )]),
    };

    let m = manager(&["k1"]);
    m.restore(&snapshot);
    // The restored "today" belongs to a finished day; the reset folds it in.
    m.daily_reset_if_needed();

    let (today, total) = m.usage_of(&fingerprint("k1")).unwrap();
    assert_eq!(today.calls, 0);
    assert_eq!(total.calls, 10);
    assert_eq!(total.prompt_tokens, 730);
    assert_eq!(total.completion_tokens, 312);
    assert_eq!(m.snapshot().last_reset_date, Some(SystemClock.local_date()));
}

/// Minimal always-succeeds client for the flush test.
struct OkClient;

#[async_trait]
impl LlmClient for OkClient {
    async fn complete(
        &self,
        _provider: &str,
        model: &str,
        _key: &str,
        _params: &CompletionParams,
    ) -> Result<CompletionResponse, ProviderError> {
        Ok(CompletionResponse {
            content: "ok".to_string(),
            model: model.to_string(),
            provider: "openai".to_string(),
            prompt_tokens: 2,
            completion_tokens: 1,
            raw: serde_json::json!({}),
        })
    }

    async fn stream_complete(
        &self,
        _provider: &str,
        _model: &str,
        _key: &str,
        _params: &CompletionParams,
    ) -> Result<ByteStream, ProviderError> {
        Err(ProviderError::Other("not scripted".to_string()))
    }

    async fn embed(
        &self,
        _provider: &str,
        _model: &str,
        _key: &str,
        _params: &EmbeddingParams,
    ) -> Result<EmbeddingResponse, ProviderError> {
        Err(ProviderError::Other("not scripted".to_string()))
    }
}

#[tokio::test]
async fn dispatcher_close_flushes_final_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.json");

    let d = Dispatcher::builder(Config::new(pools(&["k1"])))
        .client(Arc::new(OkClient))
        .store(Arc::new(JsonFileStore::new(path.clone())))
        .build()
        .await;

    let request = CompletionRequest::new("openai/gpt-x", vec![ChatMessage::user("hi")]);
    assert!(d.acompletion(request).await.unwrap().is_some());
    d.close().await;

    let loaded = JsonFileStore::new(path).load().await.unwrap().unwrap();
    let key = loaded.keys.get(&fingerprint("k1")).unwrap();
    assert_eq!(key.usage_today.calls, 1);
    assert_eq!(key.usage_today.prompt_tokens, 2);
    assert_eq!(key.usage_today.completion_tokens, 1);
}
