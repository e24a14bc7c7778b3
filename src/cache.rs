//! File-backed key/value cache with per-key expiration.
//!
//! Each entry lives in its own JSON file named after the SHA-1 of the
//! namespaced key. Writes go through a temp file and an atomic rename so a
//! reader never observes a half-written entry.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

/// TTL for cached user profiles.
pub const PROFILE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// TTL for cached per-mint review lists.
pub const REVIEWS_TTL: Duration = Duration::from_secs(5 * 60);
/// TTL for the derived filter summary.
pub const META_FILTERS_TTL: Duration = Duration::from_secs(12 * 60 * 60);
/// Freshness window used by the background metadata queue.
pub const METADATA_TTL: Duration = Duration::from_secs(30 * 60);
/// TTL for uptime lookups.
pub const UPTIME_TTL: Duration = Duration::from_secs(60);

/// Namespaced cache keys.
pub mod keys {
    pub const PREFIX: &str = "cashumints:";
    pub const MINTS: &str = "mints";
    pub const META_FILTERS: &str = "meta-filters";

    pub fn profile(pubkey: &str) -> String {
        format!("profile:{pubkey}")
    }

    pub fn reviews(mint_id: &str) -> String {
        format!("reviews:{mint_id}")
    }

    pub fn mint_info(mint_id: &str) -> String {
        format!("mint:{mint_id}:info")
    }

    pub fn uptime(url: &str) -> String {
        format!("uptime:{url}")
    }
}

#[derive(Serialize, Deserialize)]
struct CacheItem {
    key: String,
    value: Value,
    /// Milliseconds since the Unix epoch when the entry was written.
    timestamp: u64,
}

/// Persistent cache rooted at a directory.
#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
    default_ttl: Duration,
}

impl Cache {
    pub fn new(root: PathBuf, default_ttl: Duration) -> Self {
        Self { root, default_ttl }
    }

    /// Ensure the cache directory exists.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.dir())?;
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Read `key`, treating entries older than `max_age` (or the default TTL)
    /// as absent. Stale entries are removed; unreadable ones are ignored.
    pub fn get<T: DeserializeOwned>(&self, key: &str, max_age: Option<Duration>) -> Option<T> {
        let path = self.entry_path(key);
        let item = read_entry(&path, key)?;
        let ttl = max_age.unwrap_or(self.default_ttl);
        if is_expired(item.timestamp, ttl) {
            debug!(key, "cache entry expired");
            let _ = fs::remove_file(&path);
            return None;
        }
        serde_json::from_value(item.value).ok()
    }

    /// Age of the entry under `key`. Unlike [`Cache::get`] this never
    /// removes the entry, whatever its age.
    pub fn age(&self, key: &str) -> Option<Duration> {
        let item = read_entry(&self.entry_path(key), key)?;
        Some(Duration::from_millis(
            now_millis().saturating_sub(item.timestamp),
        ))
    }

    /// Store `value` under `key`, stamped with the current time.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with_timestamp(key, value, now_millis())
    }

    pub(crate) fn set_with_timestamp<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        timestamp: u64,
    ) -> Result<()> {
        let dir = self.dir();
        fs::create_dir_all(&dir)?;
        let item = CacheItem {
            key: format!("{}{key}", keys::PREFIX),
            value: serde_json::to_value(value)?,
            timestamp,
        };
        let tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer(&tmp, &item)?;
        tmp.persist(self.entry_path(key))
            .map_err(|e| anyhow!("persisting cache entry {key}: {e}"))?;
        Ok(())
    }

    /// Remove `key`, returning whether an entry existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }

    /// Delete every entry older than the default TTL or unreadable.
    pub fn purge_expired(&self) -> Result<usize> {
        let dir = self.dir();
        if !dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in walkdir::WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let stale = match read_item(entry.path()) {
                Some(item) => is_expired(item.timestamp, self.default_ttl),
                None => true,
            };
            if stale {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(keys::PREFIX.as_bytes());
        hasher.update(key.as_bytes());
        self.dir()
            .join(format!("{}.json", hex::encode(hasher.finalize())))
    }
}

fn read_item(path: &Path) -> Option<CacheItem> {
    serde_json::from_str(&fs::read_to_string(path).ok()?).ok()
}

/// Like [`read_item`], but logs entries that exist and fail to parse.
fn read_entry(path: &Path, key: &str) -> Option<CacheItem> {
    let data = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&data) {
        Ok(item) => Some(item),
        Err(e) => {
            warn!(key, "ignoring corrupt cache entry: {e}");
            None
        }
    }
}

fn is_expired(timestamp: u64, ttl: Duration) -> bool {
    now_millis().saturating_sub(timestamp) > ttl.as_millis() as u64
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
