use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::usage::cooldown::UsageCounters;

/// One-way key fingerprint: first 8 bytes of SHA-256, hex-encoded. Raw key
/// material never reaches the snapshot file.
pub fn fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}

/// Persisted usage for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeySnapshot {
    pub provider: String,
    pub usage_today: UsageCounters,
    pub usage_total: UsageCounters,
}

/// On-disk usage document, keyed by key fingerprint. Best-effort: the live
/// state is authoritative while the process runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_reset_date: Option<NaiveDate>,
    pub keys: HashMap<String, KeySnapshot>,
}

/// Snapshot storage capability. Implementations must make `save` atomic:
/// a crash mid-write leaves the previous document intact, never a torn one.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn load(&self) -> Result<Option<Snapshot>, std::io::Error>;
    async fn save(&self, snapshot: &Snapshot) -> Result<(), std::io::Error>;
}

/// Default store: one JSON document, written to a temp file and renamed
/// into place. The single snapshot-writer task serializes calls, so no
/// extra locking is needed here.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl PersistentStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Snapshot>, std::io::Error> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                // A corrupt snapshot must not brick startup; usage is best-effort.
                tracing::warn!(path = %self.path.display(), "discarding unreadable usage snapshot: {e}");
                Ok(None)
            }
        }
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), std::io::Error> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| std::io::Error::other(format!("snapshot serialization: {e}")))?;

        let tmp_path = self.path.with_extension(format!("tmp.{}", std::process::id()));
        tokio::fs::write(&tmp_path, &content).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(())
    }
}
