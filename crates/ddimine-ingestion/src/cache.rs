//! TTL cache of raw extractor results, keyed by (drug, source).
//!
//! Expiry is lazy: a stale entry is reported as a miss and evicted on the
//! lookup that finds it. Concurrent misses for one key are coalesced by
//! `get_or_fetch` so only one fetch reaches the extractor.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use ddimine_common::error::Result;
use ddimine_common::evidence::{canonical_drug_name, EvidenceSource, RawEvidenceEntry};

use crate::lock;

type CacheKey = (String, EvidenceSource);

fn cache_key(drug: &str, source: EvidenceSource) -> CacheKey {
    (canonical_drug_name(drug), source)
}

#[derive(Debug)]
struct CachedEntries {
    entries: Vec<RawEvidenceEntry>,
    stored_at: Instant,
    ttl: Duration,
}

impl CachedEntries {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Misses served by another caller's in-flight fetch.
    pub coalesced: u64,
    pub expired_evictions: u64,
    pub entries: usize,
}

/// How `get_or_fetch` produced its entries.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(Vec<RawEvidenceEntry>),
    Fetched(Vec<RawEvidenceEntry>),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn into_entries(self) -> Vec<RawEvidenceEntry> {
        match self {
            CacheLookup::Hit(e) | CacheLookup::Fetched(e) => e,
        }
    }
}

#[derive(Debug, Default)]
pub struct EvidenceCache {
    entries: Mutex<HashMap<CacheKey, CachedEntries>>,
    inflight: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    expired_evictions: AtomicU64,
}

impl EvidenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, drug: &str, source: EvidenceSource) -> Option<Vec<RawEvidenceEntry>> {
        let found = self.lookup(&cache_key(drug, source));
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store entries for `ttl`. A zero ttl stores nothing.
    pub fn put(&self, drug: &str, source: EvidenceSource, entries: Vec<RawEvidenceEntry>, ttl: Duration) {
        self.store(cache_key(drug, source), entries, ttl);
    }

    /// Return cached entries or run `fetch` exactly once per key among
    /// concurrent callers. Failed fetches are not cached.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        drug: &str,
        source: EvidenceSource,
        ttl: Duration,
        fetch: F,
    ) -> Result<CacheLookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<RawEvidenceEntry>>>,
    {
        if ttl.is_zero() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return fetch().await.map(CacheLookup::Fetched);
        }
        if let Some(hit) = self.get(drug, source) {
            debug!(drug, %source, "cache hit");
            return Ok(CacheLookup::Hit(hit));
        }

        let key = cache_key(drug, source);
        let slot = InflightSlot::join(&self.inflight, key.clone());
        let _permit = slot.gate.lock().await;

        // Another caller may have filled the slot while we waited.
        if let Some(hit) = self.lookup(&key) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(drug, %source, "cache miss coalesced with in-flight fetch");
            return Ok(CacheLookup::Hit(hit));
        }

        let entries = fetch().await?;
        self.store(key, entries.clone(), ttl);
        Ok(CacheLookup::Fetched(entries))
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Drop the entries of one drug across all sources.
    pub fn clear_for(&self, drug: &str) {
        let drug = canonical_drug_name(drug);
        lock(&self.entries).retain(|(d, _), _| *d != drug);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            expired_evictions: self.expired_evictions.load(Ordering::Relaxed),
            entries: lock(&self.entries).len(),
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<Vec<RawEvidenceEntry>> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(cached) if cached.is_fresh() => Some(cached.entries.clone()),
            Some(_) => {
                entries.remove(key);
                self.expired_evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: CacheKey, entries: Vec<RawEvidenceEntry>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        lock(&self.entries).insert(key, CachedEntries { entries, stored_at: Instant::now(), ttl });
    }
}

/// Membership in the waiter set of one key's gate. The gate is removed
/// from the map when its last member leaves, including on cancellation.
struct InflightSlot<'a> {
    map: &'a Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    key: CacheKey,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> InflightSlot<'a> {
    fn join(map: &'a Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>, key: CacheKey) -> Self {
        let gate = lock(map).entry(key.clone()).or_default().clone();
        Self { map, key, gate }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut map = lock(self.map);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.gate) <= 2 {
            if map.get(&self.key).is_some_and(|g| Arc::ptr_eq(g, &self.gate)) {
                map.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use ddimine_common::error::DdiError;

    fn entry(drug_b: &str) -> RawEvidenceEntry {
        RawEvidenceEntry::new(EvidenceSource::Regulatory, "warfarin", drug_b, "set-1", "excerpt")
    }

    #[test]
    fn test_put_then_get_is_hit() {
        let cache = EvidenceCache::new();
        cache.put("Warfarin", EvidenceSource::Regulatory, vec![entry("aspirin")], Duration::from_secs(60));
        assert_eq!(cache.get("warfarin", EvidenceSource::Regulatory).map(|e| e.len()), Some(1));
        assert!(cache.get("warfarin", EvidenceSource::Publication).is_none());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn test_expired_entry_is_miss_and_evicted() {
        let cache = EvidenceCache::new();
        cache.put("warfarin", EvidenceSource::Regulatory, vec![entry("aspirin")], Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("warfarin", EvidenceSource::Regulatory).is_none());
        let stats = cache.stats();
        assert_eq!(stats.expired_evictions, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_zero_ttl_disables_storage() {
        let cache = EvidenceCache::new();
        cache.put("warfarin", EvidenceSource::Regulatory, vec![entry("aspirin")], Duration::ZERO);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_clear_for_only_touches_one_drug() {
        let cache = EvidenceCache::new();
        let ttl = Duration::from_secs(60);
        cache.put("warfarin", EvidenceSource::Regulatory, vec![], ttl);
        cache.put("warfarin", EvidenceSource::Publication, vec![], ttl);
        cache.put("aspirin", EvidenceSource::Regulatory, vec![], ttl);
        cache.clear_for("WARFARIN");
        assert_eq!(cache.stats().entries, 1);
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let cache = Arc::new(EvidenceCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(60);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_fetch("warfarin", EvidenceSource::Regulatory, ttl, || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(vec![entry("aspirin")])
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            let lookup = task.await.unwrap().unwrap();
            assert_eq!(lookup.into_entries().len(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(lock(&cache.inflight).is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let cache = EvidenceCache::new();
        let ttl = Duration::from_secs(60);
        let err = cache
            .get_or_fetch("warfarin", EvidenceSource::Publication, ttl, || async {
                Err(DdiError::parse(EvidenceSource::Publication, "bad xml"))
            })
            .await;
        assert!(err.is_err());
        assert_eq!(cache.stats().entries, 0);

        let ok = cache
            .get_or_fetch("warfarin", EvidenceSource::Publication, ttl, || async { Ok(vec![]) })
            .await
            .unwrap();
        assert!(!ok.is_hit());
        let again = cache
            .get_or_fetch("warfarin", EvidenceSource::Publication, ttl, || async { Ok(vec![]) })
            .await
            .unwrap();
        assert!(again.is_hit());
    }
}
