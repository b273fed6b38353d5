// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cache of raw feed documents keyed by feed URL.
//!
//! The cache is an optimization only. Read and write failures are logged and
//! reported to callers as a miss, so a broken backend degrades to plain
//! network fetching.

mod backend;

pub use backend::{CacheBackend, FileBackend, MemoryBackend};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::{SharedClock, SystemClock};
use crate::error::StorageError;

/// How long a fetched feed document stays fresh by default
pub const DEFAULT_CACHE_TTL: Duration = Duration::hours(1);

const KEY_PREFIX: &str = "feed_";

/// A cached feed document with its revalidation metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub data: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn validators(&self) -> Validators {
        Validators {
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
        }
    }
}

/// Values used for conditional revalidation of a cached document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Result of looking up a URL without evicting anything
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(CacheEntry),
    /// Past `expires_at`; only good for revalidation
    Stale(CacheEntry),
    Miss,
}

/// Aggregate cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
}

/// Feed document cache with per-entry expiry
#[derive(Clone)]
pub struct FeedCache {
    backend: Arc<dyn CacheBackend>,
    clock: SharedClock,
}

impl FeedCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_clock(backend, SystemClock::shared())
    }

    pub fn with_clock(backend: Arc<dyn CacheBackend>, clock: SharedClock) -> Self {
        Self { backend, clock }
    }

    /// In-memory cache, handy for tests and one-shot commands
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Return the entry for `url` if it is still fresh.
    ///
    /// Expired entries are removed on the way out.
    pub async fn get(&self, url: &str) -> Option<CacheEntry> {
        match self.lookup(url).await {
            Lookup::Fresh(entry) => Some(entry),
            Lookup::Stale(_) => {
                tracing::debug!(url = %url, "Evicting expired feed cache entry");
                if let Err(e) = self.backend.delete(&cache_key(url)).await {
                    tracing::warn!(url = %url, error = %e, "Failed to evict expired cache entry");
                }
                None
            }
            Lookup::Miss => None,
        }
    }

    /// Look up `url`, reporting stale entries instead of evicting them
    pub async fn lookup(&self, url: &str) -> Lookup {
        match self.read_entry(&cache_key(url)).await {
            Ok(Some(entry)) if entry.is_expired(self.clock.now()) => Lookup::Stale(entry),
            Ok(Some(entry)) => Lookup::Fresh(entry),
            Ok(None) => Lookup::Miss,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Feed cache read failed, treating as miss");
                Lookup::Miss
            }
        }
    }

    /// Store a feed document. Failures are logged, never returned.
    pub async fn set(&self, url: &str, data: &str, ttl: Duration, validators: Validators) {
        let cached_at = self.clock.now();
        let entry = CacheEntry {
            url: url.to_string(),
            data: data.to_string(),
            cached_at,
            expires_at: cached_at + ttl,
            etag: validators.etag,
            last_modified: validators.last_modified,
        };

        let result = match serde_json::to_vec(&entry) {
            Ok(bytes) => self.backend.write(&cache_key(url), &bytes).await,
            Err(e) => Err(StorageError::Serialize(e)),
        };

        if let Err(e) = result {
            tracing::warn!(url = %url, error = %e, "Feed cache write failed");
        }
    }

    pub async fn remove(&self, url: &str) -> Result<(), StorageError> {
        self.backend.delete(&cache_key(url)).await
    }

    /// Remove every cached feed document
    pub async fn clear(&self) -> Result<(), StorageError> {
        for key in self.feed_keys().await? {
            self.backend.delete(&key).await?;
        }
        Ok(())
    }

    /// Remove expired and unreadable entries, returning how many went
    pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
        let now = self.clock.now();
        let mut removed = 0;

        for key in self.feed_keys().await? {
            let expired = match self.read_entry(&key).await {
                Ok(Some(entry)) => entry.is_expired(now),
                Ok(None) => false,
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Dropping unreadable cache entry");
                    true
                }
            };

            if expired {
                self.backend.delete(&key).await?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, StorageError> {
        let mut stats = CacheStats::default();
        for key in self.feed_keys().await? {
            if let Ok(Some(entry)) = self.read_entry(&key).await {
                stats.total_entries += 1;
                stats.total_size_bytes += entry.data.len() as u64;
            }
        }
        Ok(stats)
    }

    async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let Some(bytes) = self.backend.read(key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    async fn feed_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .backend
            .keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(KEY_PREFIX))
            .collect())
    }
}

/// Backend key for a feed URL: a filename-safe digest of the URL
fn cache_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{KEY_PREFIX}{hex}")
}
