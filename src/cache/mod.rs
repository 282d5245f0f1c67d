//! In-memory response cache with per-category TTLs and single-flight
//! fetch de-duplication.
//!
//! The service is constructed once at startup and handed to the server
//! state; there is no module-level singleton. Each category is an
//! independent namespace with its own default TTL, entry map and
//! hit/miss counters. Expired entries are dropped lazily on read and by
//! a periodic sweep task.

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Cache namespaces. TTLs follow data volatility: job listings change on
/// every mutation, aggregate metrics tolerate longer staleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    Jobs,
    Metrics,
    UserConfig,
    ApiStatus,
    General,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 5] = [
        CacheCategory::Jobs,
        CacheCategory::Metrics,
        CacheCategory::UserConfig,
        CacheCategory::ApiStatus,
        CacheCategory::General,
    ];

    pub fn default_ttl(&self) -> Duration {
        match self {
            CacheCategory::Jobs => Duration::from_secs(5 * 60),
            CacheCategory::Metrics => Duration::from_secs(15 * 60),
            CacheCategory::UserConfig => Duration::from_secs(10 * 60),
            CacheCategory::ApiStatus => Duration::from_secs(2 * 60),
            CacheCategory::General => Duration::from_secs(10 * 60),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Jobs => "jobs",
            CacheCategory::Metrics => "metrics",
            CacheCategory::UserConfig => "user-config",
            CacheCategory::ApiStatus => "api-status",
            CacheCategory::General => "general",
        }
    }

    fn index(&self) -> usize {
        match self {
            CacheCategory::Jobs => 0,
            CacheCategory::Metrics => 1,
            CacheCategory::UserConfig => 2,
            CacheCategory::ApiStatus => 3,
            CacheCategory::General => 4,
        }
    }
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

type InFlightSender = broadcast::Sender<std::result::Result<Value, String>>;

#[derive(Default)]
struct CategoryStore {
    entries: DashMap<String, CacheEntry>,
    in_flight: AsyncMutex<HashMap<String, InFlightSender>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time counters for one category.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub category: &'static str,
    pub hit_count: u64,
    pub miss_count: u64,
    pub key_count: usize,
}

pub struct CacheService {
    stores: [CategoryStore; 5],
}

impl Default for CacheService {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheService {
    pub fn new() -> Self {
        Self {
            stores: Default::default(),
        }
    }

    fn store(&self, category: CacheCategory) -> &CategoryStore {
        &self.stores[category.index()]
    }

    /// Returns the cached value, or None on miss or expiry.
    pub fn get(&self, category: CacheCategory, key: &str) -> Option<Value> {
        let store = self.store(category);

        if let Some(entry) = store.entries.get(key) {
            if !entry.is_expired() {
                store.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }
        // Drop the expired entry outside the read guard
        store.entries.remove_if(key, |_, entry| entry.is_expired());
        store.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores a value, overwriting any previous one and resetting expiry.
    pub fn set(&self, category: CacheCategory, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or_else(|| category.default_ttl());
        self.store(category)
            .entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
    }

    /// Read-through fetch with single-flight de-duplication: while a fetch
    /// for (category, key) is in flight, concurrent callers await it and
    /// all receive the same result. A failed fetch propagates its error to
    /// every waiter and does not populate the cache.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        category: CacheCategory,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if let Some(value) = self.get(category, key) {
            return Ok(value);
        }

        let store = self.store(category);
        let mut waiter = None;
        {
            let mut in_flight = store.in_flight.lock().await;
            // Re-check under the lock: the previous leader may have just
            // populated the cache.
            if let Some(entry) = store.entries.get(key) {
                if !entry.is_expired() {
                    store.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.value.clone());
                }
            }
            match in_flight.get(key) {
                Some(tx) => waiter = Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(key.to_string(), tx);
                }
            }
        }

        if let Some(mut rx) = waiter {
            debug!("awaiting in-flight fetch for {}:{}", category.as_str(), key);
            return match rx.recv().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(anyhow!(message)),
                Err(_) => Err(anyhow!("in-flight fetch was dropped")),
            };
        }

        // This caller is the leader: run the fetch, publish the outcome,
        // and release the in-flight marker whether it succeeded or not.
        let result = fetch().await;

        if let Ok(value) = &result {
            self.set(category, key, value.clone(), ttl);
        }

        let shared = match &result {
            Ok(value) => Ok(value.clone()),
            Err(e) => Err(e.to_string()),
        };
        let tx = store.in_flight.lock().await.remove(key);
        if let Some(tx) = tx {
            let _ = tx.send(shared);
        }

        result
    }

    /// Removes one entry immediately.
    pub fn invalidate(&self, category: CacheCategory, key: &str) {
        self.store(category).entries.remove(key);
    }

    /// Removes every entry whose key contains the given substring.
    pub fn invalidate_matching(&self, category: CacheCategory, substring: &str) {
        self.store(category)
            .entries
            .retain(|key, _| !key.contains(substring));
    }

    /// Drops all entries of a category. Called by mutating operations so
    /// stale list/stat reads are never served after a write.
    pub fn invalidate_category(&self, category: CacheCategory) {
        self.store(category).entries.clear();
    }

    pub fn stats(&self, category: Option<CacheCategory>) -> Vec<CacheStatsSnapshot> {
        let categories: Vec<CacheCategory> = match category {
            Some(c) => vec![c],
            None => CacheCategory::ALL.to_vec(),
        };

        categories
            .into_iter()
            .map(|c| {
                let store = self.store(c);
                CacheStatsSnapshot {
                    category: c.as_str(),
                    hit_count: store.hits.load(Ordering::Relaxed),
                    miss_count: store.misses.load(Ordering::Relaxed),
                    key_count: store.entries.len(),
                }
            })
            .collect()
    }

    /// Removes expired entries from all categories. Returns how many were
    /// dropped.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        for category in CacheCategory::ALL {
            let store = self.store(category);
            let before = store.entries.len();
            store.entries.retain(|_, entry| !entry.is_expired());
            removed += before - store.entries.len();
        }
        removed
    }

    /// Periodic active sweep, run as a background task.
    pub async fn run_sweeper(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep_expired();
                    if removed > 0 {
                        info!("Cache sweep removed {} expired entries", removed);
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Cache sweeper shutting down");
                    break;
                }
            }
        }
    }
}
