//! Durable mirror of cache entries, used to warm the in-memory cache after a restart.
//!
//! Each entry is stored as a small JSON envelope `{ "timestamp", "data" }`.
//! The mirror is opportunistic: the cache treats every read failure as a miss
//! and swallows write failures, so implementations only need to report errors
//! honestly, not recover from them.

use super::errors::MirrorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_PREFIX: &str = "stockroom_cache_";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Persisted form of a cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorEnvelope {
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl MirrorEnvelope {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            data,
        }
    }

    /// Whether the envelope is younger than `ttl` at `now`.
    ///
    /// Timestamps from the future (clock skew) count as fresh.
    pub fn is_fresh_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match (now - self.timestamp).to_std() {
            Ok(age) => age < ttl,
            Err(_) => true,
        }
    }
}

/// Pluggable backing store for mirrored entries.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<MirrorEnvelope>, MirrorError>;
    async fn put(&self, key: &str, envelope: &MirrorEnvelope) -> Result<(), MirrorError>;
    /// Drop the entry for `key`. Removing a missing entry is not an error.
    async fn remove(&self, key: &str) -> Result<(), MirrorError>;
}

/// In-process mirror. Keeps serialized text so a "restart" only shares bytes.
#[derive(Debug, Default)]
pub struct MemoryMirror {
    entries: DashMap<String, String>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw text for a key, bypassing serialization.
    pub fn insert_raw(&self, key: &str, text: impl Into<String>) {
        self.entries.insert(key.to_owned(), text.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[async_trait]
impl MirrorStore for MemoryMirror {
    async fn get(&self, key: &str) -> Result<Option<MirrorEnvelope>, MirrorError> {
        let Some(text) = self.entries.get(key).map(|t| t.clone()) else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| MirrorError::Malformed {
                key: key.to_owned(),
                source,
            })
    }

    async fn put(&self, key: &str, envelope: &MirrorEnvelope) -> Result<(), MirrorError> {
        let text = serde_json::to_string(envelope).map_err(|source| MirrorError::Malformed {
            key: key.to_owned(),
            source,
        })?;
        self.entries.insert(key.to_owned(), text);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), MirrorError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileMirror {
    dir: PathBuf,
    prefix: String,
}

impl FileMirror {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the entry for `key`. Characters outside `[A-Za-z0-9_-]` become `_`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}{safe}.json", self.prefix))
    }
}

#[async_trait]
impl MirrorStore for FileMirror {
    async fn get(&self, key: &str) -> Result<Option<MirrorEnvelope>, MirrorError> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(MirrorError::Io {
                    key: key.to_owned(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| MirrorError::Malformed {
                key: key.to_owned(),
                source,
            })
    }

    async fn put(&self, key: &str, envelope: &MirrorEnvelope) -> Result<(), MirrorError> {
        let io_err = |source| MirrorError::Io {
            key: key.to_owned(),
            source,
        };
        let bytes = serde_json::to_vec(envelope).map_err(|source| MirrorError::Malformed {
            key: key.to_owned(),
            source,
        })?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        // Write-then-rename so a concurrent reader never sees half a file.
        // Each write gets its own temp file; overlapping writers must not share one.
        let path = self.path_for(key);
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{}.{seq}.tmp", std::process::id()));
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), MirrorError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(MirrorError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_freshness() {
        let now = Utc::now();
        let env = MirrorEnvelope {
            timestamp: now - chrono::Duration::seconds(30),
            data: json!(null),
        };
        assert!(env.is_fresh_at(Duration::from_secs(60), now));
        assert!(!env.is_fresh_at(Duration::from_secs(30), now));
        assert!(!env.is_fresh_at(Duration::from_secs(10), now));
    }

    #[test]
    fn envelope_from_future_is_fresh() {
        let now = Utc::now();
        let env = MirrorEnvelope {
            timestamp: now + chrono::Duration::seconds(5),
            data: json!(1),
        };
        assert!(env.is_fresh_at(Duration::from_secs(1), now));
    }

    #[test]
    fn envelope_wire_format() {
        let env = MirrorEnvelope::new(json!([{"id": 1}]));
        let value = serde_json::to_value(&env).unwrap();
        assert!(value["timestamp"].is_string());
        assert_eq!(value["data"], json!([{"id": 1}]));
    }

    #[test]
    fn file_names_are_prefixed_and_sanitized() {
        let mirror = FileMirror::new("/tmp/m", "pre_");
        assert_eq!(
            mirror.path_for("orders_only"),
            PathBuf::from("/tmp/m/pre_orders_only.json")
        );
        assert_eq!(
            mirror.path_for("../etc/passwd"),
            PathBuf::from("/tmp/m/pre____etc_passwd.json")
        );
    }

    #[tokio::test]
    async fn memory_mirror_reports_corruption() {
        let mirror = MemoryMirror::new();
        mirror.insert_raw("k", "{not json");
        assert!(matches!(
            mirror.get("k").await,
            Err(MirrorError::Malformed { .. })
        ));
        assert!(mirror.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_mirror_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let env = MirrorEnvelope::new(json!({"orders": [1, 2]}));

        FileMirror::new(dir.path(), DEFAULT_PREFIX)
            .put("all_data", &env)
            .await
            .unwrap();

        let reopened = FileMirror::new(dir.path(), DEFAULT_PREFIX);
        assert_eq!(reopened.get("all_data").await.unwrap(), Some(env));
        assert!(reopened.get("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_mirror_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileMirror::new(dir.path(), DEFAULT_PREFIX);
        mirror.put("k", &MirrorEnvelope::new(json!(1))).await.unwrap();

        mirror.remove("k").await.unwrap();
        assert!(mirror.get("k").await.unwrap().is_none());
        mirror.remove("k").await.unwrap();
    }

    #[tokio::test]
    async fn overlapping_file_writes_leave_one_whole_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = std::sync::Arc::new(FileMirror::new(dir.path(), DEFAULT_PREFIX));

        let writes = (0..16).map(|i| {
            let mirror = mirror.clone();
            tokio::spawn(async move {
                let data = json!({ "writer": i, "pad": "x".repeat(64 * 1024) });
                mirror.put("k", &MirrorEnvelope::new(data)).await
            })
        });
        for write in futures::future::join_all(writes).await {
            write.unwrap().unwrap();
        }

        let stored = mirror.get("k").await.unwrap().unwrap();
        assert!(stored.data["writer"].is_u64());
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn file_mirror_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FileMirror::new(dir.path(), DEFAULT_PREFIX);
        std::fs::write(mirror.path_for("k"), b"garbage").unwrap();
        assert!(matches!(
            mirror.get("k").await,
            Err(MirrorError::Malformed { .. })
        ));
    }
}
