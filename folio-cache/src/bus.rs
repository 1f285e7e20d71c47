//! Change notifications for cache entries.
//!
//! Subscribers register a [`Pattern`] and a callback. The bus snapshots the
//! matching callbacks under its lock and runs them after releasing it, so a
//! callback may freely subscribe, unsubscribe or read the cache.

use folio_core::{Fingerprint, Pattern};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Status or data changed.
    Updated,
    /// Marked stale.
    Invalidated,
    /// Evicted or reset.
    Removed,
}

/// A committed change to one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub fingerprint: Fingerprint,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(fingerprint: Fingerprint, kind: ChangeKind) -> Self {
        Self { fingerprint, kind }
    }

    pub fn updated(fingerprint: Fingerprint) -> Self {
        Self::new(fingerprint, ChangeKind::Updated)
    }

    pub fn invalidated(fingerprint: Fingerprint) -> Self {
        Self::new(fingerprint, ChangeKind::Invalidated)
    }

    pub fn removed(fingerprint: Fingerprint) -> Self {
        Self::new(fingerprint, ChangeKind::Removed)
    }
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct Listener {
    pattern: Pattern,
    callback: ChangeCallback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<u64, Listener>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pattern-based subscription registry.
#[derive(Clone, Default)]
pub struct InvalidationBus {
    registry: Arc<Mutex<Registry>>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every change matching `pattern`.
    ///
    /// The subscription lasts until [`Subscription::unsubscribe`] is called or
    /// the handle is dropped.
    pub fn subscribe<F>(&self, pattern: Pattern, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(
            id,
            Listener {
                pattern,
                callback: Arc::new(callback),
            },
        );
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver an event to every matching subscriber. Returns how many were called.
    pub fn notify(&self, event: &ChangeEvent) -> usize {
        let callbacks: Vec<ChangeCallback> = lock(&self.registry)
            .listeners
            .values()
            .filter(|listener| listener.pattern.matches(&event.fingerprint))
            .map(|listener| listener.callback.clone())
            .collect();
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }
}

impl fmt::Debug for InvalidationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle to a bus subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    /// Keep the subscription alive for the lifetime of the bus.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.remove(&self.id);
        }
    }
}
