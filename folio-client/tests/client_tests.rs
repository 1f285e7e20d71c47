use folio_client::config::{CacheSection, FolioConfig, RetrySection, SessionSection};
use folio_client::resources::{self, BookFilter};
use folio_client::{ClientError, FolioClient};
use folio_core::{FolioError, NotificationLevel, SharedSink};
use folio_session::{MemorySessionStore, SessionState, WalletAdapter};
use folio_test_utils::{MockAuthApi, MockWallet, RecordingSink};
use std::sync::Arc;
use std::time::Duration;

// Nothing listens here; requests fail with a connection error.
const UNREACHABLE: &str = "http://127.0.0.1:1";

fn test_config() -> FolioConfig {
    FolioConfig {
        api_base_url: UNREACHABLE.to_string(),
        request_timeout_ms: 2_000,
        cache: CacheSection {
            stale_after_ms: 0,
            gc_after_ms: 60_000,
            sweep_interval_ms: 50,
        },
        retry: RetrySection {
            max_retries: 0,
            initial_ms: 10,
            max_ms: 100,
            multiplier: 2.0,
        },
        session: SessionSection {
            poll_interval_ms: 50,
            persistence_path: "unused.json".into(),
            token_ttl_secs: 3_600,
            reauthenticate_on_switch: true,
            user_scoped_resources: resources::USER_SCOPED.iter().map(|r| r.to_string()).collect(),
        },
    }
}

struct Harness {
    client: FolioClient,
    wallet: Arc<MockWallet>,
    auth: Arc<MockAuthApi>,
    sink: Arc<RecordingSink>,
}

fn harness() -> Harness {
    let wallet = Arc::new(MockWallet::new("0xa"));
    let auth = Arc::new(MockAuthApi::new());
    let sink = Arc::new(RecordingSink::new());
    let client = FolioClient::with_parts(
        test_config(),
        wallet.clone(),
        auth.clone(),
        Arc::new(MemorySessionStore::new()),
        sink.clone(),
    )
    .unwrap();
    Harness {
        client,
        wallet,
        auth,
        sink,
    }
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = test_config();
    config.session.poll_interval_ms = 0;
    let wallet: Arc<dyn WalletAdapter> = Arc::new(MockWallet::new("0xa"));
    let sink: SharedSink = Arc::new(RecordingSink::new());
    let result = FolioClient::new(config, wallet, sink);
    assert!(matches!(result, Err(ClientError::Config(_))));
}

#[tokio::test]
async fn test_file_backed_client_starts_anonymous() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.session.persistence_path = dir.path().join("session.json");
    let client = FolioClient::new(
        config,
        Arc::new(MockWallet::new("0xa")),
        Arc::new(RecordingSink::new()),
    )
    .unwrap();

    let tasks = client.start().await;
    assert_eq!(client.session().state(), SessionState::Anonymous);
    client.shutdown();
    tokio::time::timeout(Duration::from_secs(2), tasks.join())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_user_scoped_queries_gated_until_authenticated() {
    let h = harness();
    let queries = h.client.queries();
    assert!(!queries.is_resource_enabled(resources::USER));
    assert!(!queries.is_resource_enabled(resources::USER_COUNTERS));
    assert!(queries.is_resource_enabled(resources::BOOK));

    // Gated: served from the (empty) cache without touching the network.
    let user = h.client.marketplace().current_user().await.unwrap();
    assert!(user.is_none());
    let counters = h.client.marketplace().user_counters().await.unwrap();
    assert!(counters.is_none());
    assert_eq!(queries.stats().fetches, 0);

    h.client.session().connect().await.unwrap();
    let state = h.client.session().sign_in().await.unwrap();
    assert!(state.is_authenticated());
    assert_eq!(h.auth.verify_calls(), 1);
    assert_eq!(h.wallet.sign_calls(), 1);
    assert!(h.client.identity().has_token());
    assert!(queries.is_resource_enabled(resources::USER));
}

#[tokio::test]
async fn test_failed_request_surfaces_network_error() {
    let h = harness();
    let err = h
        .client
        .marketplace()
        .books(&BookFilter::approved(false))
        .await
        .unwrap_err();
    assert!(matches!(err, FolioError::Network { .. }));

    let key = resources::books_key(&BookFilter::approved(false)).unwrap();
    let entry = h.client.queries().get(&key).unwrap();
    assert_eq!(entry.error, Some(err));
    assert_eq!(h.sink.count(NotificationLevel::Error), 1);
}

#[tokio::test]
async fn test_failed_mutation_leaves_cache_untouched() {
    let h = harness();
    let key = resources::books_key(&BookFilter::approved(false)).unwrap();
    h.client
        .queries()
        .set_query_value(&key, serde_json::json!([{"id": 1, "title": "Dune", "author": "herbert", "isApproved": false}]));
    let before = h.client.queries().get(&key).unwrap();

    let err = h.client.marketplace().approve_book(1).await.unwrap_err();
    assert!(matches!(err, FolioError::Network { .. }));

    let after = h.client.queries().get(&key).unwrap();
    assert_eq!(after.data, before.data);
    assert_eq!(after.status, before.status);
    assert_eq!(h.sink.count(NotificationLevel::Error), 1);
    assert_eq!(h.sink.count(NotificationLevel::Success), 0);
}

#[tokio::test]
async fn test_shutdown_stops_background_tasks() {
    let h = harness();
    let tasks = h.client.start().await;
    h.client.shutdown();
    let evicted = tokio::time::timeout(Duration::from_secs(2), tasks.join())
        .await
        .unwrap();
    assert_eq!(evicted, 0);
}
