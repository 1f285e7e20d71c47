//! Freshness contracts for query reads.
//!
//! Callers state how stale a cached result may be before it must be fetched
//! again, and reads come back as [`QuerySnapshot`] values that carry the
//! status and age of the data alongside it.

use chrono::{DateTime, Utc};
use folio_core::FolioError;
use std::time::Duration;

use crate::entry::QueryStatus;

/// Staleness tolerance for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Cached data is served without refetching until it is older than
    /// `max_staleness`.
    BestEffort {
        /// Maximum acceptable age of cached data.
        max_staleness: Duration,
    },

    /// Cached data is stale as soon as it is stored: every new subscriber and
    /// every read-through triggers a fetch.
    #[default]
    Consistent,
}

impl Freshness {
    /// Create a BestEffort freshness with the given max staleness.
    pub fn best_effort(max_staleness: Duration) -> Self {
        Self::BestEffort { max_staleness }
    }

    /// Create a Consistent freshness requirement.
    pub fn consistent() -> Self {
        Self::Consistent
    }

    pub fn is_best_effort(&self) -> bool {
        matches!(self, Self::BestEffort { .. })
    }

    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent)
    }

    /// How long a stored result stays fresh. Zero for Consistent.
    pub fn stale_after(&self) -> Duration {
        match self {
            Self::BestEffort { max_staleness } => *max_staleness,
            Self::Consistent => Duration::ZERO,
        }
    }
}

/// Point-in-time view of a query, as seen by a subscriber.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
    status: QueryStatus,
    data: Option<T>,
    error: Option<FolioError>,
    last_updated_at: Option<DateTime<Utc>>,
    is_stale: bool,
}

impl<T> QuerySnapshot<T> {
    pub(crate) fn new(
        status: QueryStatus,
        data: Option<T>,
        error: Option<FolioError>,
        last_updated_at: Option<DateTime<Utc>>,
        is_stale: bool,
    ) -> Self {
        Self {
            status,
            data,
            error,
            last_updated_at,
            is_stale,
        }
    }

    /// Snapshot of a query that has no cache entry.
    pub fn idle() -> Self {
        Self::new(QueryStatus::Idle, None, None, None, true)
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Consume the snapshot and return the data, if any.
    pub fn into_data(self) -> Option<T> {
        self.data
    }

    pub fn error(&self) -> Option<&FolioError> {
        self.error.as_ref()
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated_at
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// Time since the data was last stored. Zero when nothing was stored.
    pub fn staleness(&self) -> Duration {
        let Some(at) = self.last_updated_at else {
            return Duration::ZERO;
        };
        Utc::now()
            .signed_duration_since(at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Map the data to a new type.
    pub fn map<U, F>(self, f: F) -> QuerySnapshot<U>
    where
        F: FnOnce(T) -> U,
    {
        QuerySnapshot {
            status: self.status,
            data: self.data.map(f),
            error: self.error,
            last_updated_at: self.last_updated_at,
            is_stale: self.is_stale,
        }
    }
}
