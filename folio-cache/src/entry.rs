//! Cache entries and the patches that change them.

use chrono::{DateTime, Utc};
use folio_core::{Fingerprint, FolioError};
use serde_json::Value;
use std::time::Duration;

/// Lifecycle status of a cached query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// Snapshot of one cache entry.
///
/// `subscriber_count` comes from the observer registry, which outlives the
/// entry itself: evicting an observed entry does not forget its observers.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<FolioError>,
    /// When data was last stored successfully.
    pub last_updated_at: Option<DateTime<Utc>>,
    pub subscriber_count: usize,
    pub stale_after: Option<Duration>,
    /// Set by invalidation, cleared by the next successful fetch.
    pub invalidated: bool,
}

impl CacheEntry {
    /// Whether the entry should be fetched again before being trusted.
    ///
    /// Idle and errored entries are always stale. Successful entries are stale
    /// once invalidated or once `stale_after` has elapsed since the last update.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.invalidated {
            return true;
        }
        match self.status {
            QueryStatus::Idle | QueryStatus::Error => true,
            QueryStatus::Loading => false,
            QueryStatus::Success => {
                let Some(updated) = self.last_updated_at else {
                    return true;
                };
                let stale_after = self.stale_after.unwrap_or(Duration::ZERO);
                let age = now
                    .signed_duration_since(updated)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                age >= stale_after
            }
        }
    }
}

/// Partial update applied by [`crate::CacheStore::set`].
///
/// `None` leaves a field unchanged; the nested options set or clear it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryPatch {
    pub status: Option<QueryStatus>,
    pub data: Option<Option<Value>>,
    pub error: Option<Option<FolioError>>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub stale_after: Option<Option<Duration>>,
    pub invalidated: Option<bool>,
}

impl EntryPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fetch has started. Existing data stays visible while loading.
    pub fn loading() -> Self {
        Self {
            status: Some(QueryStatus::Loading),
            ..Self::default()
        }
    }

    /// A fetch succeeded.
    pub fn success(data: Value, at: DateTime<Utc>, stale_after: Duration) -> Self {
        Self {
            status: Some(QueryStatus::Success),
            data: Some(Some(data)),
            error: Some(None),
            last_updated_at: Some(at),
            stale_after: Some(Some(stale_after)),
            invalidated: Some(false),
        }
    }

    /// A fetch failed terminally. Previous data is kept.
    pub fn failed(error: FolioError) -> Self {
        Self {
            status: Some(QueryStatus::Error),
            error: Some(Some(error)),
            ..Self::default()
        }
    }

    /// Mark the entry stale without touching its data.
    pub fn stale() -> Self {
        Self {
            invalidated: Some(true),
            ..Self::default()
        }
    }

    /// Settle back to Idle, e.g. when a fetch was abandoned.
    pub fn idle() -> Self {
        Self {
            status: Some(QueryStatus::Idle),
            ..Self::default()
        }
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from fresh cached data.
    pub hits: u64,
    /// Reads that needed a fetch.
    pub misses: u64,
    /// Fetches started.
    pub fetches: u64,
    /// Callers that joined an in-flight fetch instead of starting one.
    pub deduplicated: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Entries removed by sweeps and resets.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(status: QueryStatus) -> CacheEntry {
        CacheEntry {
            fingerprint: Fingerprint::bare("book").unwrap(),
            status,
            data: None,
            error: None,
            last_updated_at: None,
            subscriber_count: 0,
            stale_after: None,
            invalidated: false,
        }
    }

    #[test]
    fn test_idle_and_error_are_stale() {
        let now = Utc::now();
        assert!(entry(QueryStatus::Idle).is_stale(now));
        assert!(entry(QueryStatus::Error).is_stale(now));
        assert!(!entry(QueryStatus::Loading).is_stale(now));
    }

    #[test]
    fn test_success_staleness_window() {
        let now = Utc::now();
        let mut fresh = entry(QueryStatus::Success);
        fresh.data = Some(json!([]));
        fresh.last_updated_at = Some(now);
        fresh.stale_after = Some(Duration::from_secs(60));
        assert!(!fresh.is_stale(now));
        assert!(fresh.is_stale(now + chrono::Duration::seconds(61)));

        fresh.invalidated = true;
        assert!(fresh.is_stale(now));
    }

    #[test]
    fn test_zero_stale_after_is_immediately_stale() {
        let now = Utc::now();
        let mut e = entry(QueryStatus::Success);
        e.last_updated_at = Some(now);
        e.stale_after = Some(Duration::ZERO);
        assert!(e.is_stale(now));
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
