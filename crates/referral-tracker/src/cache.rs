//! Per-account TTL cache for referral counts.
//!
//! The cache only speeds up the first paint. Reads treat anything unusable as
//! a miss and writes never fail loudly.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub count: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl CacheEntry {
    pub fn new(count: u64, timestamp: u64) -> Self {
        Self { count, timestamp }
    }

    pub fn is_fresh(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) < ttl_ms
    }
}

pub fn cache_key(account: &Address) -> String {
    format!("referral-count:0x{}", hex::encode(account))
}

pub trait CountCache: Send {
    fn get(&self, account: &Address) -> Option<CacheEntry>;
    fn set(&mut self, account: &Address, entry: CacheEntry);
    fn remove(&mut self, account: &Address);
}

#[derive(Clone, Debug, Default)]
pub struct MemoryCache {
    entries: BTreeMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CountCache for MemoryCache {
    fn get(&self, account: &Address) -> Option<CacheEntry> {
        self.entries.get(&cache_key(account)).copied()
    }

    fn set(&mut self, account: &Address, entry: CacheEntry) {
        self.entries.insert(cache_key(account), entry);
    }

    fn remove(&mut self, account: &Address) {
        self.entries.remove(&cache_key(account));
    }
}

/// All entries in one JSON object on disk, keyed by [`cache_key`]. Values are
/// parsed one by one so a single corrupt entry only hides itself.
#[derive(Clone, Debug)]
pub struct JsonFileCache {
    path: PathBuf,
}

impl JsonFileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> BTreeMap<String, serde_json::Value> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "ignoring unreadable cache file");
                BTreeMap::new()
            }
        }
    }

    fn store(&self, map: &BTreeMap<String, serde_json::Value>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(map)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)
    }
}

impl CountCache for JsonFileCache {
    fn get(&self, account: &Address) -> Option<CacheEntry> {
        let value = self.load().remove(&cache_key(account))?;
        match serde_json::from_value(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(account = %account, error = %e, "malformed cache entry treated as miss");
                None
            }
        }
    }

    fn set(&mut self, account: &Address, entry: CacheEntry) {
        let mut map = self.load();
        let value = match serde_json::to_value(entry) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to encode cache entry");
                return;
            }
        };
        map.insert(cache_key(account), value);
        if let Err(e) = self.store(&map) {
            warn!(path = %self.path.display(), error = %e, "failed to persist referral cache");
        }
    }

    fn remove(&mut self, account: &Address) {
        let mut map = self.load();
        if map.remove(&cache_key(account)).is_some() {
            if let Err(e) = self.store(&map) {
                warn!(path = %self.path.display(), error = %e, "failed to persist referral cache");
            }
        }
    }
}
