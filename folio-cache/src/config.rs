//! Query client configuration.

use std::time::Duration;

use crate::freshness::Freshness;
use crate::retry::RetryPolicy;

/// Configuration for a [`crate::QueryClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Freshness applied to queries that do not state their own.
    pub default_freshness: Freshness,
    /// Retry policy applied to queries that do not state their own.
    pub default_retry: RetryPolicy,
    /// How long an unobserved entry survives after its last update.
    pub gc_after: Duration,
    /// How often the sweeper evicts expired entries.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_freshness: Freshness::Consistent,
            default_retry: RetryPolicy::none(),
            gc_after: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve cached data for `stale_after` before refetching. Zero means
    /// Consistent.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.default_freshness = if stale_after.is_zero() {
            Freshness::Consistent
        } else {
            Freshness::best_effort(stale_after)
        };
        self
    }

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.default_freshness = freshness;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_gc_after(mut self, gc_after: Duration) -> Self {
        self.gc_after = gc_after;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}
