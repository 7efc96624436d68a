//! Two-tier cache for discovery results.
//!
//! Provides:
//! - A concurrent in-process tier with per-entry access tracking
//! - Best-effort write-through to a durable tier, with promotion on read
//! - TTL expiry and effectiveness-based capacity eviction, run off the request path
//! - Hit/miss/eviction statistics

pub mod store;

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::model::DiscoveryResult;
use store::{DurableRecord, DurableStore};

const KEY_PREFIX: &str = "discovery";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub max_entries: usize,
    /// Soft ceiling on the summed payload size of the fast tier.
    pub max_bytes: usize,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(24 * 60 * 60),
            max_entries: 1_000,
            max_bytes: 64 * 1024 * 1024,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub paper_id: String,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(paper_id: &str, fingerprint: &str) -> Self {
        Self {
            paper_id: paper_id.to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }

    fn storage_key(&self) -> String {
        format!("{}{}", paper_prefix(&self.paper_id), self.fingerprint)
    }
}

fn paper_prefix(paper_id: &str) -> String {
    format!("{}:{}:", KEY_PREFIX, paper_id)
}

struct FastEntry {
    result: Arc<DiscoveryResult>,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    size_bytes: usize,
    access_count: AtomicU64,
    last_access_ms: AtomicI64,
}

impl FastEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access_ms.store(now.timestamp_millis(), Ordering::Relaxed);
    }

    fn idle(&self, now: DateTime<Utc>) -> Duration {
        let idle_ms = now.timestamp_millis() - self.last_access_ms.load(Ordering::Relaxed);
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    fn effectiveness(&self, now: DateTime<Utc>) -> f64 {
        effectiveness_score(
            self.access_count.load(Ordering::Relaxed),
            self.idle(now),
            self.size_bytes,
        )
    }
}

/// Eviction priority: higher stays longer. Rarely-read, long-idle, large
/// entries score lowest.
pub fn effectiveness_score(access_count: u64, idle: Duration, size_bytes: usize) -> f64 {
    let frequency = 1.0 + (access_count as f64).ln_1p();
    let recency = 1.0 / (1.0 + idle.as_secs_f64() / 3600.0);
    let size_penalty = 1.0 + size_bytes as f64 / (64.0 * 1024.0);
    frequency * recency / size_penalty
}

/// Point-in-time view of one fast-tier entry.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub paper_id: String,
    pub fingerprint: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_access: Option<DateTime<Utc>>,
    pub size_bytes: usize,
    pub effectiveness: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub durable_hits: u64,
    pub entry_count: usize,
    pub memory_estimate_bytes: usize,
    pub stores: u64,
    pub eviction_count: u64,
    pub expired_count: u64,
    pub invalidation_count: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    durable_hits: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

pub struct DiscoveryCache {
    fast: DashMap<CacheKey, Arc<FastEntry>>,
    durable: Option<Arc<dyn DurableStore>>,
    config: CacheConfig,
    bytes: AtomicUsize,
    counters: Counters,
    pressure: Arc<Notify>,
}

impl DiscoveryCache {
    pub fn new(config: CacheConfig, durable: Option<Arc<dyn DurableStore>>) -> Self {
        Self {
            fast: DashMap::new(),
            durable,
            config,
            bytes: AtomicUsize::new(0),
            counters: Counters::default(),
            pressure: Arc::new(Notify::new()),
        }
    }

    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(config, None)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fast tier first, then the durable tier (promoting a live hit).
    /// Durable read failures count as misses.
    pub async fn get(&self, paper_id: &str, fingerprint: &str) -> Option<DiscoveryResult> {
        let key = CacheKey::new(paper_id, fingerprint);
        let now = Utc::now();

        let cached = self.fast.get(&key).map(|e| Arc::clone(e.value()));
        if let Some(entry) = cached {
            if !entry.is_expired(now) {
                entry.touch(now);
                self.record_hit();
                tracing::debug!(paper_id, "Cache hit (memory)");
                return Some(entry.result.as_ref().clone());
            }
            if self.remove_if(&key, |e| e.is_expired(now)) {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(result) = self.get_durable(&key, now).await {
            self.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
            self.record_hit();
            tracing::debug!(paper_id, "Cache hit (durable), promoted");
            return Some(result);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("discovery_cache_misses_total").increment(1);
        tracing::debug!(paper_id, "Cache miss");
        None
    }

    async fn get_durable(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<DiscoveryResult> {
        let durable = self.durable.as_ref()?;
        let storage_key = key.storage_key();
        let record = match durable.get(&storage_key).await {
            Ok(Some(r)) => r,
            Ok(None) => return None,
            Err(e) => {
                self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %storage_key, error = %e, "Durable cache read failed, treating as miss");
                return None;
            }
        };
        if now >= record.expires_at {
            if let Err(e) = durable.delete(&storage_key).await {
                tracing::debug!(key = %storage_key, error = %e, "Failed to drop expired durable entry");
            }
            return None;
        }
        let result: DiscoveryResult = match serde_json::from_slice(&record.payload) {
            Ok(r) => r,
            Err(e) => {
                self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %storage_key, error = %e, "Corrupt durable cache entry");
                return None;
            }
        };
        self.insert_fast(
            key.clone(),
            Arc::new(result.clone()),
            now,
            record.expires_at,
            record.payload.len(),
        );
        Some(result)
    }

    /// Write to both tiers. Never fails: a durable write error is logged and
    /// the fast-tier entry still serves this process.
    pub async fn store(&self, paper_id: &str, fingerprint: &str, result: &DiscoveryResult, ttl: Duration) {
        let key = CacheKey::new(paper_id, fingerprint);
        let payload = match serde_json::to_vec(result) {
            Ok(p) => p,
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(paper_id, error = %e, "Failed to serialize discovery result, not caching");
                return;
            }
        };
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.insert_fast(key.clone(), Arc::new(result.clone()), now, expires_at, payload.len());
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(paper_id, size_bytes = payload.len(), ttl_secs = ttl.as_secs(), "Cache set");

        if let Some(durable) = &self.durable {
            let storage_key = key.storage_key();
            if let Err(e) = durable.put(&storage_key, DurableRecord { payload, expires_at }).await {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %storage_key, error = %e, "Durable cache write failed, continuing with memory tier");
            }
        }
    }

    fn insert_fast(
        &self,
        key: CacheKey,
        result: Arc<DiscoveryResult>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        size_bytes: usize,
    ) {
        let entry = Arc::new(FastEntry {
            result,
            cached_at: now,
            expires_at,
            size_bytes,
            access_count: AtomicU64::new(0),
            last_access_ms: AtomicI64::new(now.timestamp_millis()),
        });
        self.bytes.fetch_add(size_bytes, Ordering::Relaxed);
        if let Some(old) = self.fast.insert(key, entry) {
            self.bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
        if self.over_capacity() {
            self.pressure.notify_one();
        }
    }

    pub async fn invalidate(&self, paper_id: &str, fingerprint: &str) -> bool {
        let key = CacheKey::new(paper_id, fingerprint);
        let removed = self.remove_if(&key, |_| true);
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.delete(&key.storage_key()).await {
                tracing::warn!(paper_id, error = %e, "Durable cache delete failed");
            }
        }
        if removed {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every cached result for a paper, whatever configuration produced it.
    pub async fn invalidate_all(&self, paper_id: &str) -> usize {
        let keys: Vec<CacheKey> = self
            .fast
            .iter()
            .filter(|e| e.key().paper_id == paper_id)
            .map(|e| e.key().clone())
            .collect();
        let mut removed = keys.into_iter().filter(|k| self.remove_if(k, |_| true)).count();

        if let Some(durable) = &self.durable {
            match durable.delete_prefix(&paper_prefix(paper_id)).await {
                Ok(n) => removed = removed.max(n),
                Err(e) => tracing::warn!(paper_id, error = %e, "Durable cache prefix delete failed"),
            }
        }
        self.counters.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        tracing::info!(paper_id, removed, "Invalidated cached discoveries");
        removed
    }

    /// Remove expired fast-tier entries. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<CacheKey> = self
            .fast
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        let removed = expired
            .into_iter()
            .filter(|k| self.remove_if(k, |e| e.is_expired(now)))
            .count();
        if removed > 0 {
            self.counters.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Evict least-effective fast-tier entries until both the entry and byte
    /// limits hold. The durable tier keeps its copy.
    pub fn evict_to_capacity(&self) -> usize {
        if !self.over_capacity() {
            return 0;
        }
        let now = Utc::now();
        let mut ranked: Vec<(CacheKey, f64)> = self
            .fast
            .iter()
            .map(|e| (e.key().clone(), e.value().effectiveness(now)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut evicted = 0;
        for (key, _) in ranked {
            if !self.over_capacity() {
                break;
            }
            if self.remove_if(&key, |_| true) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            metrics::counter!("discovery_cache_evictions_total").increment(evicted as u64);
            tracing::debug!(evicted, "Evicted cache entries over capacity");
        }
        evicted
    }

    fn over_capacity(&self) -> bool {
        self.fast.len() > self.config.max_entries
            || self.bytes.load(Ordering::Relaxed) > self.config.max_bytes
    }

    fn remove_if(&self, key: &CacheKey, pred: impl FnOnce(&FastEntry) -> bool) -> bool {
        match self.fast.remove_if(key, |_, e| pred(e.as_ref())) {
            Some((_, entry)) => {
                self.bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Run TTL sweeps on an interval and capacity eviction whenever a store
    /// pushes the fast tier over its limits. Stops once the cache is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let pressure = Arc::clone(&self.pressure);
        let interval = self.config.sweep_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                let swept = tokio::select! {
                    _ = ticker.tick() => true,
                    _ = pressure.notified() => false,
                };
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                if swept {
                    cache.sweep_expired();
                }
                cache.evict_to_capacity();
            }
            tracing::debug!("Cache maintenance stopped");
        })
    }

    pub fn entries(&self) -> Vec<CacheEntryInfo> {
        let now = Utc::now();
        self.fast
            .iter()
            .map(|e| {
                let v = e.value();
                let accessed = v.access_count.load(Ordering::Relaxed);
                CacheEntryInfo {
                    paper_id: e.key().paper_id.clone(),
                    fingerprint: e.key().fingerprint.clone(),
                    cached_at: v.cached_at,
                    expires_at: v.expires_at,
                    access_count: accessed,
                    last_access: (accessed > 0)
                        .then(|| DateTime::from_timestamp_millis(v.last_access_ms.load(Ordering::Relaxed)))
                        .flatten(),
                    size_bytes: v.size_bytes,
                    effectiveness: v.effectiveness(now),
                }
            })
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let hits = c.hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            durable_hits: c.durable_hits.load(Ordering::Relaxed),
            entry_count: self.fast.len(),
            memory_estimate_bytes: self.bytes.load(Ordering::Relaxed),
            stores: c.stores.load(Ordering::Relaxed),
            eviction_count: c.evictions.load(Ordering::Relaxed),
            expired_count: c.expirations.load(Ordering::Relaxed),
            invalidation_count: c.invalidations.load(Ordering::Relaxed),
            read_errors: c.read_errors.load(Ordering::Relaxed),
            write_errors: c.write_errors.load(Ordering::Relaxed),
        }
    }

    fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("discovery_cache_hits_total").increment(1);
    }
}
