//! The cache store.
//!
//! Holds cache entries keyed by fingerprint, the observer registry (subscriber
//! counts plus the fetch function each observed query was registered with),
//! and the reset generations. Every operation is synchronous and takes the
//! store lock only for its own duration, so no lock is ever held across an
//! `.await` or while subscriber callbacks run.

use chrono::{DateTime, Utc};
use folio_core::{Fingerprint, Pattern};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::entry::{CacheEntry, CacheStats, EntryPatch, QueryStatus};
use crate::fetcher::{QueryOptions, SharedQueryFn};
use crate::generation::{Generation, GenerationJournal};

#[derive(Debug, Clone, Default)]
struct StoredEntry {
    status: QueryStatus,
    data: Option<serde_json::Value>,
    error: Option<folio_core::FolioError>,
    last_updated_at: Option<DateTime<Utc>>,
    stale_after: Option<Duration>,
    invalidated: bool,
    /// Last time any field changed; drives eviction of never-successful entries.
    touched_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn apply(&mut self, patch: EntryPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(data) = patch.data {
            self.data = data;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(at) = patch.last_updated_at {
            self.last_updated_at = Some(at);
        }
        if let Some(stale_after) = patch.stale_after {
            self.stale_after = stale_after;
        }
        if let Some(invalidated) = patch.invalidated {
            self.invalidated = invalidated;
        }
        self.touched_at = Some(now);
    }

    fn view(&self, fingerprint: &Fingerprint, subscriber_count: usize) -> CacheEntry {
        CacheEntry {
            fingerprint: fingerprint.clone(),
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            last_updated_at: self.last_updated_at,
            subscriber_count,
            stale_after: self.stale_after,
            invalidated: self.invalidated,
        }
    }
}

/// Registration of an observed query.
#[derive(Clone)]
pub(crate) struct ObserverSlot {
    pub(crate) count: usize,
    pub(crate) fetcher: SharedQueryFn,
    pub(crate) options: QueryOptions,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<Fingerprint, StoredEntry>,
    observers: HashMap<Fingerprint, ObserverSlot>,
    generations: GenerationJournal,
    stats: CacheStats,
}

impl StoreInner {
    fn subscriber_count(&self, fingerprint: &Fingerprint) -> usize {
        self.observers.get(fingerprint).map_or(0, |slot| slot.count)
    }

    fn view(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.entries
            .get(fingerprint)
            .map(|entry| entry.view(fingerprint, self.subscriber_count(fingerprint)))
    }
}

/// In-memory store of cache entries.
#[derive(Default)]
pub struct CacheStore {
    inner: Mutex<StoreInner>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // Nothing panics while holding the lock, so a poisoned lock still
        // guards consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a snapshot of an entry.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.lock().view(fingerprint)
    }

    /// Apply a patch, creating an Idle entry first if none exists.
    ///
    /// Allowed with zero subscribers, which is how prefetching works.
    pub fn set(&self, fingerprint: &Fingerprint, patch: EntryPatch) -> CacheEntry {
        let now = Utc::now();
        let mut inner = self.lock();
        inner
            .entries
            .entry(fingerprint.clone())
            .or_default()
            .apply(patch, now);
        inner.stats.entry_count = inner.entries.len() as u64;
        inner
            .view(fingerprint)
            .unwrap_or_else(|| StoredEntry::default().view(fingerprint, 0))
    }

    /// Get an entry, creating it as Idle if absent.
    pub fn get_or_idle(&self, fingerprint: &Fingerprint) -> CacheEntry {
        let now = Utc::now();
        let mut inner = self.lock();
        if !inner.entries.contains_key(fingerprint) {
            inner.entries.insert(
                fingerprint.clone(),
                StoredEntry {
                    touched_at: Some(now),
                    ..StoredEntry::default()
                },
            );
            inner.stats.entry_count = inner.entries.len() as u64;
        }
        inner
            .view(fingerprint)
            .unwrap_or_else(|| StoredEntry::default().view(fingerprint, 0))
    }

    /// Remove an entry. Observers are kept; their next read sees no entry.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let count = inner.subscriber_count(fingerprint);
        let removed = inner.entries.remove(fingerprint)?;
        inner.stats.evictions += 1;
        inner.stats.entry_count = inner.entries.len() as u64;
        Some(removed.view(fingerprint, count))
    }

    /// Remove every entry of a resource and bump its generation.
    ///
    /// Returns the removed fingerprints.
    pub fn reset_by_prefix(&self, resource: &str) -> Vec<Fingerprint> {
        let mut inner = self.lock();
        inner.generations.bump(resource);
        let removed: Vec<Fingerprint> = inner
            .entries
            .keys()
            .filter(|fp| fp.is_resource(resource))
            .cloned()
            .collect();
        for fp in &removed {
            inner.entries.remove(fp);
        }
        inner.stats.evictions += removed.len() as u64;
        inner.stats.entry_count = inner.entries.len() as u64;
        removed
    }

    /// Mark every matching entry stale. Returns the matching fingerprints.
    pub fn mark_stale(&self, pattern: &Pattern) -> Vec<Fingerprint> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut marked = Vec::new();
        for (fp, entry) in inner.entries.iter_mut() {
            if pattern.matches(fp) {
                entry.apply(EntryPatch::stale(), now);
                marked.push(fp.clone());
            }
        }
        marked
    }

    /// Evict entries nobody observes that have not changed within `gc_after`.
    ///
    /// Loading entries are never evicted.
    pub fn sweep(&self, now: DateTime<Utc>, gc_after: Duration) -> Vec<Fingerprint> {
        let mut inner = self.lock();
        let expired: Vec<Fingerprint> = inner
            .entries
            .iter()
            .filter(|(fp, entry)| {
                if entry.status == QueryStatus::Loading || inner.subscriber_count(fp) > 0 {
                    return false;
                }
                let since = entry.last_updated_at.max(entry.touched_at);
                match since {
                    Some(at) => {
                        now.signed_duration_since(at)
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                            >= gc_after
                    }
                    None => true,
                }
            })
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &expired {
            inner.entries.remove(fp);
        }
        inner.stats.evictions += expired.len() as u64;
        inner.stats.entry_count = inner.entries.len() as u64;
        expired
    }

    /// Current generation of a resource.
    pub fn generation(&self, resource: &str) -> Generation {
        self.lock().generations.current(resource)
    }

    pub fn subscriber_count(&self, fingerprint: &Fingerprint) -> usize {
        self.lock().subscriber_count(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }

    pub(crate) fn record_hit(&self) {
        self.lock().stats.hits += 1;
    }

    pub(crate) fn record_miss(&self) {
        self.lock().stats.misses += 1;
    }

    pub(crate) fn record_fetch(&self) {
        self.lock().stats.fetches += 1;
    }

    pub(crate) fn record_dedup(&self) {
        self.lock().stats.deduplicated += 1;
    }

    /// Register an observer. The latest fetch function and options win.
    pub(crate) fn observe(
        &self,
        fingerprint: &Fingerprint,
        fetcher: SharedQueryFn,
        options: QueryOptions,
    ) -> usize {
        let mut inner = self.lock();
        let slot = inner
            .observers
            .entry(fingerprint.clone())
            .or_insert_with(|| ObserverSlot {
                count: 0,
                fetcher: fetcher.clone(),
                options: options.clone(),
            });
        slot.count += 1;
        slot.fetcher = fetcher;
        slot.options = options;
        slot.count
    }

    /// Drop one observer. The registration disappears with the last one.
    pub(crate) fn unobserve(&self, fingerprint: &Fingerprint) -> usize {
        let mut inner = self.lock();
        let Some(slot) = inner.observers.get_mut(fingerprint) else {
            return 0;
        };
        slot.count = slot.count.saturating_sub(1);
        let remaining = slot.count;
        if remaining == 0 {
            inner.observers.remove(fingerprint);
        }
        remaining
    }

    pub(crate) fn observer(&self, fingerprint: &Fingerprint) -> Option<ObserverSlot> {
        self.lock().observers.get(fingerprint).cloned()
    }

    /// Update the options of an observed query in place.
    pub(crate) fn update_observer_options<F>(&self, fingerprint: &Fingerprint, f: F)
    where
        F: FnOnce(&mut QueryOptions),
    {
        if let Some(slot) = self.lock().observers.get_mut(fingerprint) {
            f(&mut slot.options);
        }
    }

    /// Observed fingerprints matching a pattern.
    pub(crate) fn observed(&self, pattern: &Pattern) -> Vec<Fingerprint> {
        self.lock()
            .observers
            .keys()
            .filter(|fp| pattern.matches(fp))
            .cloned()
            .collect()
    }
}
