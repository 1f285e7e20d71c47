//! The query client: fetch coordination over the cache store.
//!
//! At most one fetch runs per fingerprint. A fetch is a shared future that is
//! also spawned onto the runtime, so it settles into the store even when every
//! caller awaiting it goes away. Each fetch records the reset generation of
//! its resource when it starts; a settle after a newer reset is discarded.
//!
//! Lock order is in-flight table, then disabled set, then store. Callbacks and
//! notifications run with no lock held.

use chrono::{DateTime, Utc};
use folio_core::{
    Fingerprint, FolioError, FolioResult, IdentityCell, Notification, Pattern, SharedSink,
    TracingSink, ValidationError,
};
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared, TryFutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::{ChangeEvent, InvalidationBus, Subscription};
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, CacheStats, EntryPatch, QueryStatus};
use crate::fetcher::{ErrorCallback, QueryOptions, SharedQueryFn};
use crate::freshness::QuerySnapshot;
use crate::generation::Generation;
use crate::retry::with_retry;
use crate::store::{CacheStore, ObserverSlot};

type SharedFetch = Shared<BoxFuture<'static, FolioResult<Option<Value>>>>;

struct InFlight {
    id: u64,
    started_at: DateTime<Utc>,
    /// Set when the fingerprint is invalidated while this fetch runs.
    invalidated: bool,
    result: SharedFetch,
}

enum FetchStart {
    Joined(SharedFetch),
    Started(SharedFetch),
    Disabled,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn decode<T: DeserializeOwned>(
    fingerprint: &Fingerprint,
    data: Option<Value>,
) -> FolioResult<Option<T>> {
    data.map(|value| {
        serde_json::from_value(value).map_err(|err| {
            FolioError::from(ValidationError::Decode {
                fingerprint: fingerprint.to_string(),
                reason: err.to_string(),
            })
        })
    })
    .transpose()
}

struct ClientInner {
    config: CacheConfig,
    store: CacheStore,
    bus: InvalidationBus,
    in_flight: Mutex<HashMap<Fingerprint, InFlight>>,
    next_fetch_id: AtomicU64,
    disabled: Mutex<HashSet<String>>,
    identity: IdentityCell,
    sink: SharedSink,
}

impl ClientInner {
    fn is_enabled(&self, fingerprint: &Fingerprint, options: &QueryOptions) -> bool {
        options.enabled && !lock(&self.disabled).contains(fingerprint.resource_name())
    }

    /// Remove fetch `id` from the in-flight table. Returns whether it was
    /// invalidated while running.
    fn release_in_flight(
        in_flight: &mut HashMap<Fingerprint, InFlight>,
        fingerprint: &Fingerprint,
        id: u64,
    ) -> bool {
        if in_flight.get(fingerprint).is_some_and(|f| f.id == id) {
            return in_flight
                .remove(fingerprint)
                .is_some_and(|f| f.invalidated);
        }
        false
    }

    /// Record the outcome of a fetch. Runs exactly once per fetch.
    fn settle(
        &self,
        fingerprint: &Fingerprint,
        id: u64,
        generation: Generation,
        token: Option<&str>,
        options: &QueryOptions,
        result: FolioResult<Value>,
    ) -> FolioResult<Option<Value>> {
        let mut in_flight = lock(&self.in_flight);
        let invalidated = Self::release_in_flight(&mut in_flight, fingerprint, id);
        let superseded = self
            .store
            .generation(fingerprint.resource_name())
            .is_newer_than(&generation);

        match result {
            Ok(_) if superseded => {
                drop(in_flight);
                tracing::debug!(
                    fingerprint = %fingerprint,
                    generation = generation.sequence,
                    "discarding fetch result after reset",
                );
                Ok(None)
            }
            Ok(data) => {
                let mut patch =
                    EntryPatch::success(data.clone(), Utc::now(), options.freshness.stale_after());
                // Data requested before an invalidation is not fresh.
                patch.invalidated = Some(invalidated);
                self.store.set(fingerprint, patch);
                drop(in_flight);
                tracing::debug!(fingerprint = %fingerprint, invalidated, "fetch settled");
                self.bus.notify(&ChangeEvent::updated(fingerprint.clone()));
                Ok(Some(data))
            }
            Err(err) => {
                drop(in_flight);
                let err = err.classify(token.is_some());
                if superseded {
                    tracing::debug!(
                        fingerprint = %fingerprint,
                        error = %err,
                        "discarding fetch error after reset",
                    );
                    return Err(err);
                }
                self.store.set(fingerprint, EntryPatch::failed(err.clone()));
                tracing::debug!(fingerprint = %fingerprint, error = %err, "fetch failed");
                self.report(&err, token, options.on_error.as_ref());
                self.bus.notify(&ChangeEvent::updated(fingerprint.clone()));
                Err(err)
            }
        }
    }

    /// Route a terminal error: expiry signal, caller callback, then the sink.
    ///
    /// `token` is the token the failed request was sent with.
    fn report(&self, err: &FolioError, token: Option<&str>, on_error: Option<&ErrorCallback>) {
        if let (true, Some(token)) = (err.is_session_expired(), token) {
            self.identity.signal_expired(token);
        }
        if let Some(callback) = on_error {
            callback(err);
        }
        self.sink.notify(Notification::from_error(err));
    }

    fn notify_removed(&self, removed: Vec<Fingerprint>) {
        for fingerprint in removed {
            self.bus.notify(&ChangeEvent::removed(fingerprint));
        }
    }
}

/// Process-wide query client. Cheap to clone.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    pub fn new(config: CacheConfig, identity: IdentityCell, sink: SharedSink) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                store: CacheStore::new(),
                bus: InvalidationBus::new(),
                in_flight: Mutex::new(HashMap::new()),
                next_fetch_id: AtomicU64::new(0),
                disabled: Mutex::new(HashSet::new()),
                identity,
                sink,
            }),
        }
    }

    /// Client with default configuration, a fresh identity and a tracing sink.
    pub fn with_defaults() -> Self {
        Self::new(
            CacheConfig::default(),
            IdentityCell::new(),
            Arc::new(TracingSink),
        )
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> &IdentityCell {
        &self.inner.identity
    }

    pub fn sink(&self) -> &SharedSink {
        &self.inner.sink
    }

    /// Query options carrying the configured default freshness and retry policy.
    pub fn default_options(&self) -> QueryOptions {
        QueryOptions::new()
            .with_freshness(self.inner.config.default_freshness)
            .with_retry(self.inner.config.default_retry.clone())
    }

    /// Fetch `fingerprint` unless a fetch is already running, in which case
    /// its result is shared.
    ///
    /// A disabled query never calls `fetcher`: the cached data is returned and
    /// an absent entry is created as Idle.
    pub async fn ensure_fetched(
        &self,
        fingerprint: &Fingerprint,
        fetcher: SharedQueryFn,
        options: QueryOptions,
    ) -> FolioResult<Option<Value>> {
        let start = {
            let mut in_flight = lock(&self.inner.in_flight);
            if let Some(existing) = in_flight.get(fingerprint) {
                self.inner.store.record_dedup();
                tracing::debug!(
                    fingerprint = %fingerprint,
                    running_ms = Utc::now()
                        .signed_duration_since(existing.started_at)
                        .num_milliseconds(),
                    "joining in-flight fetch",
                );
                FetchStart::Joined(existing.result.clone())
            } else if !self.inner.is_enabled(fingerprint, &options) {
                FetchStart::Disabled
            } else {
                FetchStart::Started(self.begin_fetch(&mut in_flight, fingerprint, fetcher, options))
            }
        };

        match start {
            FetchStart::Joined(fetch) => fetch.await,
            FetchStart::Started(fetch) => {
                self.inner
                    .bus
                    .notify(&ChangeEvent::updated(fingerprint.clone()));
                tokio::spawn(fetch.clone());
                // A fetch that is ready on first poll settles and leaves the
                // in-flight table; concurrent callers must get to join it first.
                tokio::task::yield_now().await;
                fetch.await
            }
            FetchStart::Disabled => Ok(self.inner.store.get_or_idle(fingerprint).data),
        }
    }

    fn begin_fetch(
        &self,
        in_flight: &mut HashMap<Fingerprint, InFlight>,
        fingerprint: &Fingerprint,
        fetcher: SharedQueryFn,
        options: QueryOptions,
    ) -> SharedFetch {
        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let generation = self.inner.store.generation(fingerprint.resource_name());
        let token = self.inner.identity.auth_token();
        let token_present = token.is_some();
        self.inner.store.set(fingerprint, EntryPatch::loading());
        self.inner.store.record_fetch();
        tracing::debug!(fingerprint = %fingerprint, fetch_id = id, "starting fetch");

        let weak = Arc::downgrade(&self.inner);
        let fp = fingerprint.clone();
        let fetch = async move {
            let result = with_retry(&options.retry, fp.resource_name(), || {
                fetcher
                    .fetch(&fp)
                    .map_err(move |err| err.classify(token_present))
            })
            .await;
            match weak.upgrade() {
                Some(inner) => {
                    inner.settle(&fp, id, generation, token.as_deref(), &options, result)
                }
                None => result.map(Some),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(
            fingerprint.clone(),
            InFlight {
                id,
                started_at: Utc::now(),
                invalidated: false,
                result: fetch.clone(),
            },
        );
        fetch
    }

    /// Read-through typed query.
    ///
    /// Fresh cached data is returned without fetching; otherwise the query is
    /// fetched (or joined) and the result decoded into `T`.
    pub async fn query<T: DeserializeOwned>(
        &self,
        fingerprint: &Fingerprint,
        fetcher: SharedQueryFn,
        options: QueryOptions,
    ) -> FolioResult<Option<T>> {
        if let Some(entry) = self.inner.store.get(fingerprint) {
            if entry.status == QueryStatus::Success && !entry.is_stale(Utc::now()) {
                self.inner.store.record_hit();
                return decode(fingerprint, entry.data);
            }
        }
        self.inner.store.record_miss();
        let data = self.ensure_fetched(fingerprint, fetcher, options).await?;
        decode(fingerprint, data)
    }

    /// Refetch an observed query with the fetch function it was registered with.
    ///
    /// Unobserved queries are not fetched; their cached data is returned.
    pub async fn refetch(&self, fingerprint: &Fingerprint) -> FolioResult<Option<Value>> {
        match self.inner.store.observer(fingerprint) {
            Some(slot) => {
                self.ensure_fetched(fingerprint, slot.fetcher, slot.options)
                    .await
            }
            None => {
                tracing::debug!(fingerprint = %fingerprint, "refetch skipped, query not observed");
                Ok(self.inner.store.get(fingerprint).and_then(|entry| entry.data))
            }
        }
    }

    /// Typed view of the cached entry.
    pub fn snapshot<T: DeserializeOwned>(
        &self,
        fingerprint: &Fingerprint,
    ) -> FolioResult<QuerySnapshot<T>> {
        let Some(entry) = self.inner.store.get(fingerprint) else {
            return Ok(QuerySnapshot::idle());
        };
        let is_stale = entry.is_stale(Utc::now());
        let data = decode(fingerprint, entry.data)?;
        Ok(QuerySnapshot::new(
            entry.status,
            data,
            entry.error,
            entry.last_updated_at,
            is_stale,
        ))
    }

    /// Observe a query.
    ///
    /// Counts as a subscriber, registers `fetcher` and `options` for later
    /// refetches, and fetches when the entry is missing or stale.
    pub async fn watch(
        &self,
        fingerprint: &Fingerprint,
        fetcher: SharedQueryFn,
        options: QueryOptions,
    ) -> QueryObserver {
        let subscribers = self
            .inner
            .store
            .observe(fingerprint, fetcher.clone(), options.clone());
        let observer = QueryObserver {
            client: self.clone(),
            fingerprint: fingerprint.clone(),
        };
        tracing::debug!(fingerprint = %fingerprint, subscribers, "observer added");

        let needs_fetch = self
            .inner
            .store
            .get(fingerprint)
            .map_or(true, |entry| entry.is_stale(Utc::now()));
        if needs_fetch {
            // Failures are recorded on the entry and already reported.
            let _ = self.ensure_fetched(fingerprint, fetcher, options).await;
        }
        observer
    }

    /// Listen for changes to entries matching `pattern`. Does not count as a
    /// subscriber for eviction or refetch purposes.
    pub fn subscribe<F>(&self, pattern: Pattern, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(pattern, callback)
    }

    /// Tell listeners that `fingerprint` changed outside the client. Returns
    /// how many callbacks ran.
    pub fn notify(&self, fingerprint: &Fingerprint) -> usize {
        self.inner
            .bus
            .notify(&ChangeEvent::updated(fingerprint.clone()))
    }

    /// Mark matching entries stale and refetch the observed ones.
    ///
    /// A fetch already running for a matching entry is waited for and then
    /// followed by a new one, and its result is kept stale. Resolves after the
    /// refetches settle. Returns how many were refetched.
    pub async fn invalidate(&self, pattern: &Pattern) -> usize {
        let marked = {
            let mut in_flight = lock(&self.inner.in_flight);
            for (fingerprint, running) in in_flight.iter_mut() {
                if pattern.matches(fingerprint) {
                    running.invalidated = true;
                }
            }
            self.inner.store.mark_stale(pattern)
        };
        for fingerprint in &marked {
            self.inner
                .bus
                .notify(&ChangeEvent::invalidated(fingerprint.clone()));
        }
        let targets = self.observed_targets(pattern, |_| true);
        tracing::debug!(
            pattern = %pattern,
            marked = marked.len(),
            refetching = targets.len(),
            "invalidated",
        );
        let refetches = targets.iter().map(|(fingerprint, slot)| async move {
            let running = lock(&self.inner.in_flight)
                .get(fingerprint)
                .map(|f| f.result.clone());
            if let Some(running) = running {
                let _ = running.await;
            }
            self.ensure_fetched(fingerprint, slot.fetcher.clone(), slot.options.clone())
                .await
        });
        join_all(refetches).await;
        targets.len()
    }

    fn observed_targets<F>(&self, pattern: &Pattern, filter: F) -> Vec<(Fingerprint, ObserverSlot)>
    where
        F: Fn(Option<&CacheEntry>) -> bool,
    {
        self.inner
            .store
            .observed(pattern)
            .into_iter()
            .filter_map(|fp| self.inner.store.observer(&fp).map(|slot| (fp, slot)))
            .filter(|(fp, slot)| self.inner.is_enabled(fp, &slot.options))
            .filter(|(fp, _)| filter(self.inner.store.get(fp).as_ref()))
            .collect()
    }

    async fn refetch_targets(&self, targets: Vec<(Fingerprint, ObserverSlot)>) -> usize {
        let refetches = targets.iter().map(|(fingerprint, slot)| {
            self.ensure_fetched(fingerprint, slot.fetcher.clone(), slot.options.clone())
        });
        join_all(refetches).await;
        targets.len()
    }

    /// Write data directly, as a prefetch or after a mutation.
    pub fn set_query_data<T: Serialize>(&self, fingerprint: &Fingerprint, value: &T) -> FolioResult<()> {
        let data = serde_json::to_value(value).map_err(|err| ValidationError::Encode {
            fingerprint: fingerprint.to_string(),
            reason: err.to_string(),
        })?;
        self.set_query_value(fingerprint, data);
        Ok(())
    }

    /// Write a JSON value directly.
    pub fn set_query_value(&self, fingerprint: &Fingerprint, data: Value) {
        let freshness = self
            .inner
            .store
            .observer(fingerprint)
            .map_or(self.inner.config.default_freshness, |slot| slot.options.freshness);
        self.inner.store.set(
            fingerprint,
            EntryPatch::success(data, Utc::now(), freshness.stale_after()),
        );
        self.inner
            .bus
            .notify(&ChangeEvent::updated(fingerprint.clone()));
    }

    /// Evict every entry of `resource`, forget its running fetches and bump its
    /// generation so they cannot write back. Returns how many entries were evicted.
    pub fn reset_by_prefix(&self, resource: &str) -> usize {
        let removed = {
            let mut in_flight = lock(&self.inner.in_flight);
            in_flight.retain(|fp, _| !fp.is_resource(resource));
            self.inner.store.reset_by_prefix(resource)
        };
        let evicted = removed.len();
        tracing::info!(resource, evicted, "reset cached resource");
        self.inner.notify_removed(removed);
        evicted
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let removed = self.inner.store.remove(fingerprint)?;
        self.inner
            .bus
            .notify(&ChangeEvent::removed(fingerprint.clone()));
        Some(removed)
    }

    /// Gate every query of `resource`: no fetch starts until it is re-enabled.
    pub fn disable_resource(&self, resource: &str) {
        if lock(&self.inner.disabled).insert(resource.to_string()) {
            tracing::debug!(resource, "resource disabled");
        }
    }

    /// Lift the gate on `resource` and fetch its observed queries that are
    /// missing or stale. Returns how many were fetched.
    pub async fn enable_resource(&self, resource: &str) -> usize {
        if !lock(&self.inner.disabled).remove(resource) {
            return 0;
        }
        let now = Utc::now();
        let targets = self.observed_targets(&Pattern::resource(resource), |entry| {
            entry.map_or(true, |entry| entry.is_stale(now))
        });
        tracing::debug!(resource, refetching = targets.len(), "resource enabled");
        self.refetch_targets(targets).await
    }

    pub fn is_resource_enabled(&self, resource: &str) -> bool {
        !lock(&self.inner.disabled).contains(resource)
    }

    /// Evict unobserved entries older than the configured `gc_after`.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let evicted = self.inner.store.sweep(now, self.inner.config.gc_after);
        let count = evicted.len();
        if count > 0 {
            tracing::debug!(evicted = count, "swept expired entries");
        }
        self.inner.notify_removed(evicted);
        count
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.inner.store.get(fingerprint)
    }

    pub fn is_fetching(&self, fingerprint: &Fingerprint) -> bool {
        lock(&self.inner.in_flight).contains_key(fingerprint)
    }

    pub fn subscriber_count(&self, fingerprint: &Fingerprint) -> usize {
        self.inner.store.subscriber_count(fingerprint)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.store.stats()
    }

    pub(crate) fn report_error(
        &self,
        err: &FolioError,
        token: Option<&str>,
        on_error: Option<&ErrorCallback>,
    ) {
        self.inner.report(err, token, on_error);
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.store.len())
            .field("in_flight", &lock(&self.inner.in_flight).len())
            .finish()
    }
}

/// A counted subscription to one query. Dropping it releases the subscriber.
pub struct QueryObserver {
    client: QueryClient,
    fingerprint: Fingerprint,
}

impl QueryObserver {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn snapshot<T: DeserializeOwned>(&self) -> FolioResult<QuerySnapshot<T>> {
        self.client.snapshot(&self.fingerprint)
    }

    pub async fn refetch(&self) -> FolioResult<Option<Value>> {
        self.client.refetch(&self.fingerprint).await
    }

    /// Toggle the registered `enabled` option. Enabling does not fetch by itself.
    pub fn set_enabled(&self, enabled: bool) {
        self.client
            .inner
            .store
            .update_observer_options(&self.fingerprint, |options| options.enabled = enabled);
    }

    /// Listen for changes to this query only.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.client
            .subscribe(Pattern::exact(self.fingerprint.clone()), callback)
    }
}

impl fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        let remaining = self.client.inner.store.unobserve(&self.fingerprint);
        tracing::debug!(fingerprint = %self.fingerprint, remaining, "observer released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChangeKind;
    use crate::freshness::Freshness;
    use crate::retry::RetryPolicy;
    use folio_core::{ChannelSink, NotificationLevel};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn counting(calls: Arc<AtomicUsize>, value: Value) -> SharedQueryFn {
        Arc::new(move |_fp: Fingerprint| {
            let calls = calls.clone();
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, FolioError>(value)
            }
        })
    }

    fn books(approved: bool) -> Fingerprint {
        Fingerprint::builder("book")
            .param("isApproved", approved)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_call() {
        let client = QueryClient::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting(calls.clone(), json!([1, 2, 3]));
        let fp = books(false);

        let (a, b) = tokio::join!(
            client.ensure_fetched(&fp, fetcher.clone(), QueryOptions::default()),
            client.ensure_fetched(&fp, fetcher.clone(), QueryOptions::default()),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), Some(json!([1, 2, 3])));
        assert_eq!(b.unwrap(), Some(json!([1, 2, 3])));
        assert_eq!(client.stats().deduplicated, 1);
        assert!(!client.is_fetching(&fp));
    }

    #[tokio::test]
    async fn test_ready_fetches_share_one_call() {
        let client = QueryClient::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let ready: SharedQueryFn = Arc::new(move |_fp: Fingerprint| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, FolioError>(json!([1])) }
        });
        let fp = books(true);

        let (a, b) = tokio::join!(
            client.ensure_fetched(&fp, ready.clone(), QueryOptions::default()),
            client.ensure_fetched(&fp, ready.clone(), QueryOptions::default()),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), Some(json!([1])));
        assert_eq!(b.unwrap(), Some(json!([1])));
        assert_eq!(client.stats().deduplicated, 1);
    }

    #[tokio::test]
    async fn test_unauthorized_with_token_is_not_retried() {
        let identity = IdentityCell::new();
        identity.set_address(Some("0xabc".into()));
        identity.set_token(Some("token".into()));
        let client = QueryClient::new(CacheConfig::default(), identity, Arc::new(TracingSink));
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let unauthorized: SharedQueryFn = Arc::new(move |_fp: Fingerprint| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Err::<Value, _>(FolioError::http(401, None)) }
        });
        let options = QueryOptions::default().with_retry(
            RetryPolicy::attempts(3).with_initial_backoff(Duration::from_millis(1)),
        );

        let err = client
            .ensure_fetched(&Fingerprint::bare("user").unwrap(), unauthorized, options)
            .await
            .unwrap_err();

        assert!(err.is_session_expired());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn gated_on_second_call(calls: Arc<AtomicUsize>, gate: Arc<Notify>) -> SharedQueryFn {
        Arc::new(move |_fp: Fingerprint| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let gate = gate.clone();
            async move {
                if n == 2 {
                    gate.notified().await;
                }
                Ok::<_, FolioError>(json!(n))
            }
        })
    }

    #[tokio::test]
    async fn test_invalidate_during_fetch_refetches_after_it_settles() {
        let client = QueryClient::with_defaults();
        let fp = books(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let options =
            QueryOptions::default().with_freshness(Freshness::best_effort(Duration::from_secs(60)));
        let _observer = client
            .watch(&fp, gated_on_second_call(calls.clone(), gate.clone()), options)
            .await;

        let refetch = {
            let client = client.clone();
            let fp = fp.clone();
            tokio::spawn(async move { client.refetch(&fp).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(client.is_fetching(&fp));

        let invalidate = {
            let client = client.clone();
            tokio::spawn(async move { client.invalidate(&Pattern::resource("book")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_one();

        assert_eq!(invalidate.await.unwrap(), 1);
        assert_eq!(refetch.await.unwrap().unwrap(), Some(json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let entry = client.get(&fp).unwrap();
        assert_eq!(entry.data, Some(json!(3)));
        assert!(!entry.is_stale(Utc::now()));
    }

    #[tokio::test]
    async fn test_unobserved_fetch_invalidated_while_running_stays_stale() {
        let client = QueryClient::with_defaults();
        let fp = books(true);
        let calls = Arc::new(AtomicUsize::new(1));
        let gate = Arc::new(Notify::new());
        let options =
            QueryOptions::default().with_freshness(Freshness::best_effort(Duration::from_secs(60)));

        let fetch = {
            let client = client.clone();
            let fp = fp.clone();
            let fetcher = gated_on_second_call(calls.clone(), gate.clone());
            tokio::spawn(async move { client.ensure_fetched(&fp, fetcher, options).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(client.invalidate(&Pattern::resource("book")).await, 0);
        gate.notify_one();

        assert_eq!(fetch.await.unwrap().unwrap(), Some(json!(2)));
        let entry = client.get(&fp).unwrap();
        assert_eq!(entry.data, Some(json!(2)));
        assert!(entry.is_stale(Utc::now()));
    }

    #[tokio::test]
    async fn test_disabled_query_never_fetches() {
        let client = QueryClient::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = books(true);

        let data = client
            .ensure_fetched(
                &fp,
                counting(calls.clone(), json!([])),
                QueryOptions::default().with_enabled(false),
            )
            .await
            .unwrap();

        assert_eq!(data, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.get(&fp).unwrap().status, QueryStatus::Idle);
    }

    #[tokio::test]
    async fn test_failure_reaches_sink_once_and_keeps_data() {
        let (sink, mut rx) = ChannelSink::new();
        let client = QueryClient::new(CacheConfig::default(), IdentityCell::new(), Arc::new(sink));
        let fp = Fingerprint::bare("user").unwrap();
        client.set_query_value(&fp, json!({"name": "ada"}));

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let failing: SharedQueryFn = Arc::new(|_fp: Fingerprint| async {
            Err::<Value, _>(FolioError::http(500, Some(json!({"message": "boom"}))))
        });
        let options = QueryOptions::default().with_on_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let (a, b) = tokio::join!(
            client.ensure_fetched(&fp, failing.clone(), options.clone()),
            client.ensure_fetched(&fp, failing.clone(), options.clone()),
        );
        assert!(a.is_err() && b.is_err());
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.level, NotificationLevel::Error);
        assert_eq!(notification.message, "boom");
        assert!(rx.try_recv().is_err());

        let entry = client.get(&fp).unwrap();
        assert_eq!(entry.status, QueryStatus::Error);
        assert_eq!(entry.data, Some(json!({"name": "ada"})));
    }

    #[tokio::test]
    async fn test_unauthorized_with_token_signals_expiry() {
        let identity = IdentityCell::new();
        identity.set_address(Some("0xabc".into()));
        identity.set_token(Some("token".into()));
        let client = QueryClient::new(CacheConfig::default(), identity.clone(), Arc::new(TracingSink));
        let fp = Fingerprint::bare("user-counters").unwrap();
        let unauthorized: SharedQueryFn =
            Arc::new(|_fp: Fingerprint| async { Err::<Value, _>(FolioError::http(401, None)) });

        let err = client
            .ensure_fetched(&fp, unauthorized, QueryOptions::default())
            .await
            .unwrap_err();

        assert!(err.is_session_expired());
        tokio::time::timeout(Duration::from_millis(100), identity.expired())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reset_discards_late_result() {
        let client = QueryClient::with_defaults();
        let gate = Arc::new(Notify::new());
        let release = gate.clone();
        let slow: SharedQueryFn = Arc::new(move |_fp: Fingerprint| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok::<_, FolioError>(json!({"name": "previous account"}))
            }
        });
        let fp = Fingerprint::bare("user").unwrap();

        let task = {
            let client = client.clone();
            let fp = fp.clone();
            tokio::spawn(async move { client.ensure_fetched(&fp, slow, QueryOptions::default()).await })
        };
        while !client.is_fetching(&fp) {
            tokio::task::yield_now().await;
        }

        client.reset_by_prefix("user");
        release.notify_one();

        assert_eq!(task.await.unwrap().unwrap(), None);
        assert!(client.get(&fp).is_none());
    }

    #[tokio::test]
    async fn test_query_serves_fresh_data_from_cache() {
        let client = QueryClient::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting(calls.clone(), json!({"id": 7, "title": "Dune"}));
        let fp = Fingerprint::builder("book-detail").param("id", 7).build().unwrap();
        let options = QueryOptions::default()
            .with_freshness(crate::Freshness::best_effort(Duration::from_secs(60)));

        let first: Option<Value> = client.query(&fp, fetcher.clone(), options.clone()).await.unwrap();
        let second: Option<Value> = client.query(&fp, fetcher.clone(), options).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = client.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_decode_mismatch_is_validation_error() {
        let client = QueryClient::with_defaults();
        let fp = Fingerprint::bare("user").unwrap();
        client.set_query_value(&fp, json!("not a number"));

        let err = client.snapshot::<u64>(&fp).unwrap_err();
        assert!(matches!(err, FolioError::Validation(ValidationError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_disabled_resource_gates_fetch_until_enabled() {
        let client = QueryClient::with_defaults();
        client.disable_resource("user");
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = Fingerprint::bare("user").unwrap();

        let observer = client
            .watch(&fp, counting(calls.clone(), json!({"name": "ada"})), QueryOptions::default())
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(observer.snapshot::<Value>().unwrap().is_idle());

        assert_eq!(client.enable_resource("user").await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(observer.snapshot::<Value>().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_observer_drop_releases_subscriber() {
        let client = QueryClient::with_defaults();
        let fp = books(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = client
            .watch(&fp, counting(calls, json!([])), QueryOptions::default())
            .await;
        assert_eq!(client.subscriber_count(&fp), 1);
        drop(observer);
        assert_eq!(client.subscriber_count(&fp), 0);
    }

    #[test]
    fn test_notify_reaches_matching_listeners() {
        let client = QueryClient::with_defaults();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _sub = client.subscribe(Pattern::resource("book"), move |event| {
            assert_eq!(event.kind, ChangeKind::Updated);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(client.notify(&books(true)), 1);
        assert_eq!(client.notify(&Fingerprint::bare("user").unwrap()), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
