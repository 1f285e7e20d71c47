//! Reset generations for late-write protection.
//!
//! Every reset of a resource bumps its generation. A fetch remembers the
//! generation it started under; if the resource was reset before the fetch
//! settled, the result is not written back. Without this a slow fetch for the
//! previous account could repopulate the cache right after a sign-out.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A point in the reset history of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this generation was observed.
    pub observed_at: DateTime<Utc>,
}

impl Generation {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            observed_at: Utc::now(),
        }
    }

    /// The generation before any reset.
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }

    /// Check if this generation is newer than another.
    pub fn is_newer_than(&self, other: &Generation) -> bool {
        self.sequence > other.sequence
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::zero()
    }
}

/// Per-resource reset journal.
///
/// A single counter orders all resets; each resource remembers the counter
/// value of its last reset.
#[derive(Debug, Default)]
pub struct GenerationJournal {
    sequence: u64,
    resource_reset_at: HashMap<String, u64>,
}

impl GenerationJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation of a resource.
    pub fn current(&self, resource: &str) -> Generation {
        Generation::new(self.resource_reset_at.get(resource).copied().unwrap_or(0))
    }

    /// Record a reset of one resource.
    pub fn bump(&mut self, resource: &str) -> Generation {
        self.sequence += 1;
        self.resource_reset_at
            .insert(resource.to_string(), self.sequence);
        Generation::new(self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_resource_starts_at_zero() {
        let journal = GenerationJournal::new();
        assert_eq!(journal.current("book").sequence, 0);
    }

    #[test]
    fn test_bump_only_affects_one_resource() {
        let mut journal = GenerationJournal::new();
        let before_user = journal.current("user");
        let before_book = journal.current("book");

        journal.bump("user");

        assert!(journal.current("user").is_newer_than(&before_user));
        assert!(!journal.current("book").is_newer_than(&before_book));
    }

    #[test]
    fn test_generation_ordering() {
        let older = Generation::new(1);
        let newer = Generation::new(2);
        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));
        assert!(!older.is_newer_than(&Generation::new(1)));
    }
}
