//! Record storage behind the trace store
//!
//! A cache holds one JSON record per key and forgets records that have not
//! been read or written within the sliding expiration window.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Key/value record storage with sliding expiration
pub trait TraceCache: Send + Sync {
    /// Read a record, refreshing its expiration
    fn get(&self, key: &str) -> CacheResult<Option<Value>>;

    /// Write a record, refreshing its expiration
    fn set(&self, key: &str, value: Value) -> CacheResult<()>;

    /// Drop a record
    fn remove(&self, key: &str) -> CacheResult<()>;

    /// Drop every expired record; returns how many were dropped
    fn purge_expired(&self) -> CacheResult<usize>;
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    last_access: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, expiration: Duration) -> bool {
        now.duration_since(self.last_access) >= expiration
    }
}

/// In-process cache; records are lost on restart
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    expiration: Duration,
}

impl MemoryCache {
    pub fn new(expiration: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            expiration,
        }
    }

    /// Number of records, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TraceCache for MemoryCache {
    fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let now = Instant::now();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now, self.expiration) => {
                entry.last_access = now;
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries
                .remove_if(key, |_, entry| entry.is_expired(now, self.expiration));
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: Value) -> CacheResult<()> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                last_access: Instant::now(),
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> CacheResult<usize> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_expired(now, self.expiration));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

/// Current record file format version
const FILE_VERSION: u32 = 1;

/// On-disk record
///
/// JSON format:
/// ```json
/// {
///   "version": 1,
///   "key": "trace.porch_light",
///   "last_access": "2026-01-01T00:00:00Z",
///   "data": [ ... ]
/// }
/// ```
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    key: String,
    last_access: DateTime<Utc>,
    data: Value,
}

/// Durable cache storing one JSON file per record
///
/// Writes go to a temporary file first and are renamed into place, so a crash
/// never leaves a half-written record behind.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
    expiration: Duration,
}

impl FileCache {
    /// Open (and create if needed) a cache directory
    pub fn new(dir: impl AsRef<Path>, expiration: Duration) -> CacheResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            debug!("Created trace storage directory: {:?}", dir);
        }

        Ok(Self { dir, expiration })
    }

    /// The directory records are stored in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| match c {
                '/' | '\\' => '_',
                c => c,
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    fn is_expired(&self, file: &CacheFile, now: DateTime<Utc>) -> bool {
        self.age(file, now) >= self.expiration
    }

    fn age(&self, file: &CacheFile, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(file.last_access)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn read_file(path: &Path) -> CacheResult<CacheFile> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write(&self, key: &str, data: Value, last_access: DateTime<Utc>) -> CacheResult<()> {
        let path = self.file_path(key);
        let temp_path = path.with_extension("json.tmp");

        let file = CacheFile {
            version: FILE_VERSION,
            key: key.to_string(),
            last_access,
            data,
        };
        let content = serde_json::to_string(&file)?;

        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

impl TraceCache for FileCache {
    fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let path = self.file_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let file = Self::read_file(&path)?;

        let now = Utc::now();
        if self.is_expired(&file, now) {
            debug!("Dropping expired trace record: {}", key);
            fs::remove_file(&path)?;
            return Ok(None);
        }

        // Reads slide the window too, but the file is only rewritten once
        // half of it has elapsed
        if self.age(&file, now) >= self.expiration / 2 {
            self.write(key, file.data.clone(), now)?;
        }
        Ok(Some(file.data))
    }

    fn set(&self, key: &str, value: Value) -> CacheResult<()> {
        self.write(key, value, Utc::now())
    }

    fn remove(&self, key: &str) -> CacheResult<()> {
        let path = self.file_path(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn purge_expired(&self) -> CacheResult<usize> {
        let now = Utc::now();
        let mut purged = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match Self::read_file(&path) {
                Ok(file) if self.is_expired(&file, now) => {
                    fs::remove_file(&path)?;
                    purged += 1;
                }
                Ok(_) => {}
                Err(e) => debug!("Skipping unreadable trace record {:?}: {}", path, e),
            }
        }

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test(start_paused = true)]
    async fn test_memory_cache_sliding_expiration() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache.set("logs.global", json!([1, 2])).unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        // Access slides the window forward
        assert_eq!(cache.get("logs.global").unwrap(), Some(json!([1, 2])));

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(cache.get("logs.global").unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("logs.global").unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_cache_purge() {
        let cache = MemoryCache::new(Duration::from_secs(10));
        cache.set("a", json!(1)).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.set("b", json!(2)).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_file_cache_round_trip() {
        let temp = TempDir::new().unwrap();
        let cache = FileCache::new(temp.path().join("traces"), Duration::from_secs(60)).unwrap();

        cache.set("trace.porch_light", json!({"n": 1})).unwrap();
        assert!(temp.path().join("traces/trace.porch_light.json").exists());

        // A second instance over the same directory sees the record
        let reopened = FileCache::new(cache.dir(), Duration::from_secs(60)).unwrap();
        assert_eq!(
            reopened.get("trace.porch_light").unwrap(),
            Some(json!({"n": 1}))
        );

        reopened.remove("trace.porch_light").unwrap();
        assert!(cache.get("trace.porch_light").unwrap().is_none());
    }

    #[test]
    fn test_file_cache_expired_record_is_dropped() {
        let temp = TempDir::new().unwrap();
        let cache = FileCache::new(temp.path(), Duration::from_secs(60)).unwrap();
        cache
            .write(
                "logs.error",
                json!([]),
                Utc::now() - chrono::Duration::seconds(120),
            )
            .unwrap();

        assert!(cache.get("logs.error").unwrap().is_none());
        assert!(!temp.path().join("logs.error.json").exists());
    }

    #[test]
    fn test_file_cache_read_refreshes_only_past_half_window() {
        let temp = TempDir::new().unwrap();
        let cache = FileCache::new(temp.path(), Duration::from_secs(60)).unwrap();
        let path = temp.path().join("logs.global.json");

        let recent = Utc::now() - chrono::Duration::seconds(10);
        cache.write("logs.global", json!([1]), recent).unwrap();
        assert!(cache.get("logs.global").unwrap().is_some());
        assert_eq!(FileCache::read_file(&path).unwrap().last_access, recent);

        let older = Utc::now() - chrono::Duration::seconds(40);
        cache.write("logs.global", json!([1]), older).unwrap();
        assert!(cache.get("logs.global").unwrap().is_some());
        assert!(FileCache::read_file(&path).unwrap().last_access > older);
    }

    #[test]
    fn test_file_cache_purge() {
        let temp = TempDir::new().unwrap();
        let cache = FileCache::new(temp.path(), Duration::from_secs(60)).unwrap();
        cache
            .write(
                "trace.old",
                json!([]),
                Utc::now() - chrono::Duration::seconds(120),
            )
            .unwrap();
        cache.set("trace.fresh", json!([])).unwrap();

        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert!(!temp.path().join("trace.old.json").exists());
        assert!(temp.path().join("trace.fresh.json").exists());
    }
}
