//! Folio Test Utilities
//!
//! Centralized test infrastructure for the Folio workspace:
//! - Mock wallet and auth API for session tests
//! - Recording notification sink
//! - Counting fetch functions and a small book catalog backend
//! - Proptest generators for fingerprints and parameters

pub use folio_cache::{QueryClient, QueryOptions, SharedQueryFn};
pub use folio_core::{
    Fingerprint, FolioError, FolioResult, IdentityCell, Notification, NotificationLevel,
    NotificationSink, Pattern,
};
pub use folio_session::{AuthApi, AuthToken, WalletAdapter, WalletEvent};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// MOCK WALLET
// ============================================================================

#[derive(Debug)]
struct WalletState {
    account: String,
    connected: bool,
    reject_connect: bool,
    reject_signatures: bool,
    fail_polls: bool,
    connect_calls: usize,
    sign_calls: usize,
}

/// In-memory wallet with a scriptable account.
#[derive(Debug)]
pub struct MockWallet {
    state: Mutex<WalletState>,
    events: broadcast::Sender<WalletEvent>,
}

impl MockWallet {
    /// A wallet whose selected account is `account`, not yet connected.
    pub fn new(account: impl Into<String>) -> Self {
        let (events, _rx) = broadcast::channel(16);
        Self {
            state: Mutex::new(WalletState {
                account: account.into(),
                connected: false,
                reject_connect: false,
                reject_signatures: false,
                fail_polls: false,
                connect_calls: 0,
                sign_calls: 0,
            }),
            events,
        }
    }

    /// A wallet already connected with `account`.
    pub fn connected(account: impl Into<String>) -> Self {
        let wallet = Self::new(account);
        lock(&wallet.state).connected = true;
        wallet
    }

    /// Switch accounts without emitting an event, as most wallets do.
    pub fn switch_account_silently(&self, account: impl Into<String>) {
        lock(&self.state).account = account.into();
    }

    /// Switch accounts and emit [`WalletEvent::AccountChanged`].
    pub fn switch_account(&self, account: impl Into<String>) {
        let account = account.into();
        lock(&self.state).account = account.clone();
        let _ = self.events.send(WalletEvent::AccountChanged {
            address: Some(account),
        });
    }

    /// Disconnect from the wallet side and emit [`WalletEvent::Disconnected`].
    pub fn disconnect_remotely(&self) {
        lock(&self.state).connected = false;
        let _ = self.events.send(WalletEvent::Disconnected);
    }

    pub fn reject_connect(&self, reject: bool) {
        lock(&self.state).reject_connect = reject;
    }

    pub fn reject_signatures(&self, reject: bool) {
        lock(&self.state).reject_signatures = reject;
    }

    pub fn fail_polls(&self, fail: bool) {
        lock(&self.state).fail_polls = fail;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn connect_calls(&self) -> usize {
        lock(&self.state).connect_calls
    }

    pub fn sign_calls(&self) -> usize {
        lock(&self.state).sign_calls
    }

    /// The signature this wallet produces for `message` under `account`.
    pub fn expected_signature(account: &str, message: &str) -> Vec<u8> {
        format!("signed:{account}:{message}").into_bytes()
    }
}

#[async_trait]
impl WalletAdapter for MockWallet {
    async fn address(&self) -> FolioResult<Option<String>> {
        let state = lock(&self.state);
        if state.fail_polls {
            return Err(FolioError::wallet("Wallet is not responding"));
        }
        Ok(state.connected.then(|| state.account.clone()))
    }

    async fn connect(&self) -> FolioResult<String> {
        let mut state = lock(&self.state);
        state.connect_calls += 1;
        if state.reject_connect {
            return Err(FolioError::wallet("User rejected the request"));
        }
        state.connected = true;
        Ok(state.account.clone())
    }

    async fn disconnect(&self) -> FolioResult<()> {
        lock(&self.state).connected = false;
        Ok(())
    }

    async fn sign_message(&self, message: &[u8]) -> FolioResult<Vec<u8>> {
        let mut state = lock(&self.state);
        if state.reject_signatures {
            return Err(FolioError::wallet("User rejected the request"));
        }
        state.sign_calls += 1;
        Ok(Self::expected_signature(
            &state.account,
            &String::from_utf8_lossy(message),
        ))
    }

    fn events(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// MOCK AUTH API
// ============================================================================

/// Auth backend that issues numbered tokens for valid mock signatures.
#[derive(Debug, Default)]
pub struct MockAuthApi {
    nonce_calls: AtomicUsize,
    verify_calls: AtomicUsize,
    reject_status: Mutex<Option<u16>>,
}

impl MockAuthApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every verification fail with `status`.
    pub fn reject_with(&self, status: Option<u16>) {
        *lock(&self.reject_status) = status;
    }

    pub fn nonce_calls(&self) -> usize {
        self.nonce_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    /// The token issued for the `n`th (one-based) verification of `address`.
    pub fn token_for(address: &str, n: usize) -> String {
        format!("token-{address}-{n}")
    }
}

#[async_trait]
impl AuthApi for MockAuthApi {
    async fn request_nonce(&self, address: &str) -> FolioResult<String> {
        let n = self.nonce_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("Sign in to Folio as {address}. Nonce: {n}"))
    }

    async fn verify(&self, address: &str, message: &str, signature: &[u8]) -> FolioResult<AuthToken> {
        let n = self.verify_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(status) = *lock(&self.reject_status) {
            return Err(FolioError::http(status, None));
        }
        if signature != MockWallet::expected_signature(address, message).as_slice() {
            return Err(FolioError::http(
                401,
                Some(serde_json::json!({"message": "Invalid signature"})),
            ));
        }
        Ok(AuthToken::new(Self::token_for(address, n))
            .with_expiry(Utc::now() + chrono::Duration::hours(1)))
    }
}

// ============================================================================
// RECORDING SINK
// ============================================================================

/// Notification sink that remembers everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    received: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.received).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.received)
            .iter()
            .map(|n| n.message.clone())
            .collect()
    }

    pub fn count(&self, level: NotificationLevel) -> usize {
        lock(&self.received)
            .iter()
            .filter(|n| n.level == level)
            .count()
    }

    pub fn clear(&self) {
        lock(&self.received).clear();
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        lock(&self.received).push(notification);
    }
}

// ============================================================================
// FETCHERS
// ============================================================================

#[derive(Debug)]
struct FetcherInner {
    calls: AtomicUsize,
    response: Mutex<FolioResult<Value>>,
    delay: Duration,
}

/// Fetch function returning a settable response and counting its calls.
#[derive(Debug, Clone)]
pub struct CountingFetcher {
    inner: Arc<FetcherInner>,
}

impl CountingFetcher {
    pub fn new(response: Value) -> Self {
        Self::with_delay(response, Duration::ZERO)
    }

    /// Respond after `delay`, long enough for concurrent callers to overlap.
    pub fn with_delay(response: Value, delay: Duration) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                calls: AtomicUsize::new(0),
                response: Mutex::new(Ok(response)),
                delay,
            }),
        }
    }

    pub fn failing(err: FolioError) -> Self {
        let fetcher = Self::new(Value::Null);
        fetcher.fail_with(err);
        fetcher
    }

    pub fn respond_with(&self, response: Value) {
        *lock(&self.inner.response) = Ok(response);
    }

    pub fn fail_with(&self, err: FolioError) {
        *lock(&self.inner.response) = Err(err);
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn shared(&self) -> SharedQueryFn {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl folio_cache::QueryFn for CountingFetcher {
    async fn fetch(&self, _fingerprint: &Fingerprint) -> FolioResult<Value> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if !self.inner.delay.is_zero() {
            tokio::time::sleep(self.inner.delay).await;
        }
        lock(&self.inner.response).clone()
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    pub fn arb_resource_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_.-]{0,15}"
    }

    pub fn arb_param_key() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9_]{0,11}"
    }

    /// Scalar and shallow nested JSON values.
    pub fn arb_param_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z0-9 ]{0,12}".prop_map(Value::from),
        ];
        leaf.prop_recursive(2, 8, 3, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..3).prop_map(Value::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..3)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    /// Parameter lists with unique keys.
    pub fn arb_params() -> impl Strategy<Value = Vec<(String, Value)>> {
        prop::collection::btree_map(arb_param_key(), arb_param_value(), 0..5)
            .prop_map(|map| map.into_iter().collect())
    }

    pub fn arb_fingerprint() -> impl Strategy<Value = Fingerprint> {
        (arb_resource_name(), arb_params()).prop_filter_map("valid fingerprint", |(resource, params)| {
            Fingerprint::new(resource, params).ok()
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use serde_json::json;

    /// Books served by [`BookCatalog`].
    pub fn sample_books() -> Vec<Value> {
        vec![
            json!({"id": 1, "title": "Dune", "author": "herbert", "isApproved": false}),
            json!({"id": 2, "title": "Foundation", "author": "asimov", "isApproved": false}),
            json!({"id": 3, "title": "Hyperion", "author": "simmons", "isApproved": false}),
            json!({"id": 4, "title": "Solaris", "author": "lem", "isApproved": true}),
        ]
    }

    /// A tiny book backend: filters by the `isApproved` parameter and lets
    /// tests approve books.
    #[derive(Debug, Clone)]
    pub struct BookCatalog {
        books: Arc<Mutex<Vec<Value>>>,
        calls: Arc<AtomicUsize>,
    }

    impl Default for BookCatalog {
        fn default() -> Self {
            Self::new(sample_books())
        }
    }

    impl BookCatalog {
        pub fn new(books: Vec<Value>) -> Self {
            Self {
                books: Arc::new(Mutex::new(books)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn approve(&self, id: u64) -> FolioResult<Value> {
            let mut books = lock(&self.books);
            let book = books
                .iter_mut()
                .find(|book| book["id"] == json!(id))
                .ok_or_else(|| FolioError::http(404, Some(json!({"message": "Book not found"}))))?;
            book["isApproved"] = json!(true);
            Ok(book.clone())
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn fetcher(&self) -> SharedQueryFn {
            let catalog = self.clone();
            Arc::new(move |fingerprint: Fingerprint| {
                let catalog = catalog.clone();
                async move {
                    catalog.calls.fetch_add(1, Ordering::SeqCst);
                    let approved = fingerprint.param("isApproved").cloned();
                    let books: Vec<Value> = lock(&catalog.books)
                        .iter()
                        .filter(|book| approved.as_ref().map_or(true, |a| &book["isApproved"] == a))
                        .cloned()
                        .collect();
                    Ok::<_, FolioError>(Value::from(books))
                }
            })
        }
    }

    pub fn books_fingerprint(approved: bool) -> Fingerprint {
        Fingerprint::builder("book")
            .param("isApproved", approved)
            .build()
            .unwrap_or_else(|err| panic!("book fingerprint: {err}"))
    }
}
