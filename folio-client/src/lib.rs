//! Folio Client - Assembled Client
//!
//! Wires the pieces of a running Folio client together:
//!
//! - [`config`]: TOML configuration (`--config <path>` or `FOLIO_CONFIG`)
//! - [`api_client`]: the reqwest resource layer and sign-in endpoints
//! - [`resources`]: the marketplace resource catalog
//! - [`telemetry`]: tracing subscriber setup
//!
//! [`FolioClient::new`] creates the identity cell, query client and session
//! binding once at startup; [`FolioClient::start`] restores the previous
//! session and spawns the address poller and eviction sweeper.

pub mod api_client;
pub mod config;
pub mod error;
pub mod resources;
pub mod telemetry;

pub use api_client::RestClient;
pub use config::{ConfigError, FolioConfig};
pub use error::ClientError;
pub use resources::Marketplace;
pub use telemetry::{init_tracing, TelemetryConfig};

use folio_cache::{spawn_sweeper, QueryClient};
use folio_core::{IdentityCell, SharedSink};
use folio_session::{AuthApi, FileSessionStore, SessionBinding, SessionStore, WalletAdapter};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handles of the background tasks spawned by [`FolioClient::start`].
#[derive(Debug)]
pub struct BackgroundTasks {
    pub session: JoinHandle<()>,
    /// Resolves to the number of entries evicted.
    pub sweeper: JoinHandle<u64>,
}

impl BackgroundTasks {
    /// Wait for both tasks after [`FolioClient::shutdown`].
    pub async fn join(self) -> u64 {
        if let Err(err) = self.session.await {
            tracing::warn!(error = %err, "session task ended abnormally");
        }
        match self.sweeper.await {
            Ok(evicted) => evicted,
            Err(err) => {
                tracing::warn!(error = %err, "sweeper task ended abnormally");
                0
            }
        }
    }
}

pub struct FolioClient {
    config: FolioConfig,
    queries: QueryClient,
    rest: RestClient,
    session: SessionBinding,
    marketplace: Marketplace,
    shutdown: watch::Sender<bool>,
}

impl FolioClient {
    /// Build a client that signs in against the configured API and persists
    /// session markers to `session.persistence_path`.
    pub fn new(
        config: FolioConfig,
        wallet: Arc<dyn WalletAdapter>,
        sink: SharedSink,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let identity = IdentityCell::new();
        let rest = RestClient::new(&config, identity.clone())?;
        let store = Arc::new(FileSessionStore::new(&config.session.persistence_path));
        let auth = Arc::new(rest.clone());
        Ok(Self::assemble(config, identity, rest, wallet, auth, store, sink))
    }

    /// Build a client with a custom auth API and session store.
    pub fn with_parts(
        config: FolioConfig,
        wallet: Arc<dyn WalletAdapter>,
        auth: Arc<dyn AuthApi>,
        store: Arc<dyn SessionStore>,
        sink: SharedSink,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let identity = IdentityCell::new();
        let rest = RestClient::new(&config, identity.clone())?;
        Ok(Self::assemble(config, identity, rest, wallet, auth, store, sink))
    }

    fn assemble(
        config: FolioConfig,
        identity: IdentityCell,
        rest: RestClient,
        wallet: Arc<dyn WalletAdapter>,
        auth: Arc<dyn AuthApi>,
        store: Arc<dyn SessionStore>,
        sink: SharedSink,
    ) -> Self {
        let queries = QueryClient::new(config.cache_config(), identity, sink);
        let session = SessionBinding::new(
            config.session_config(),
            queries.clone(),
            wallet,
            auth,
            store,
        );
        let marketplace = Marketplace::new(queries.clone(), rest.clone());
        let (shutdown, _rx) = watch::channel(false);
        Self {
            config,
            queries,
            rest,
            session,
            marketplace,
            shutdown,
        }
    }

    /// Restore the previous session, then spawn the address poller and the
    /// eviction sweeper.
    pub async fn start(&self) -> BackgroundTasks {
        let state = self.session.restore().await;
        tracing::info!(state = %state, "folio client started");
        BackgroundTasks {
            session: self.session.spawn(self.shutdown.subscribe()),
            sweeper: spawn_sweeper(self.queries.clone(), self.shutdown.subscribe()),
        }
    }

    /// Signal every background task to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn config(&self) -> &FolioConfig {
        &self.config
    }

    pub fn identity(&self) -> &IdentityCell {
        self.queries.identity()
    }

    pub fn queries(&self) -> &QueryClient {
        &self.queries
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn session(&self) -> &SessionBinding {
        &self.session
    }

    pub fn marketplace(&self) -> &Marketplace {
        &self.marketplace
    }
}
