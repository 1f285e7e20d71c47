//! Binding between the wallet identity and the query cache.
//!
//! The binding owns the session state machine. Every operation runs under one
//! async lock so sign-in, polling, wallet events and expiry never interleave.
//! Tearing a session down clears the identity, gates and evicts user-scoped
//! resources, clears the persisted token and tells the user why.

use chrono::{DateTime, Utc};
use folio_cache::QueryClient;
use folio_core::{FolioError, FolioResult, IdentityCell, Notification};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::auth::{AuthApi, AuthToken};
use crate::config::SessionConfig;
use crate::persistence::{PersistedSession, SessionStore, StoredToken};
use crate::state::{SessionEvent, SessionState, TeardownReason, TransitionError};
use crate::wallet::{WalletAdapter, WalletEvent};

/// Result of one wallet address poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged,
    /// The wallet switched accounts and the old session was torn down.
    Switched { address: String },
    Disconnected,
}

fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn transition_failure(err: TransitionError) -> FolioError {
    FolioError::wallet(err.to_string())
}

struct BindingInner {
    config: SessionConfig,
    client: QueryClient,
    wallet: Arc<dyn WalletAdapter>,
    auth: Arc<dyn AuthApi>,
    store: Arc<dyn SessionStore>,
    state: watch::Sender<SessionState>,
    ops: Mutex<()>,
}

/// Session/identity binding. Cheap to clone.
#[derive(Clone)]
pub struct SessionBinding {
    inner: Arc<BindingInner>,
}

impl SessionBinding {
    /// Create a binding in the Anonymous state. User-scoped resources are
    /// gated until a session is authenticated.
    pub fn new(
        config: SessionConfig,
        client: QueryClient,
        wallet: Arc<dyn WalletAdapter>,
        auth: Arc<dyn AuthApi>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        for resource in &config.user_scoped_resources {
            client.disable_resource(resource);
        }
        let (state, _rx) = watch::channel(SessionState::Anonymous);
        Self {
            inner: Arc::new(BindingInner {
                config,
                client,
                wallet,
                auth,
                store,
                state,
                ops: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> &IdentityCell {
        self.inner.client.identity()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    fn transition(&self, event: SessionEvent) -> Result<SessionState, TransitionError> {
        let current = self.state();
        let next = current.apply(&event)?;
        if next != current {
            tracing::info!(from = %current, to = %next, event = event.name(), "session transition");
        }
        self.inner.state.send_replace(next.clone());
        Ok(next)
    }

    fn surface<T>(&self, result: FolioResult<T>) -> FolioResult<T> {
        if let Err(err) = &result {
            self.inner.client.sink().notify(Notification::from_error(err));
        }
        result
    }

    fn persist<F>(&self, update: F)
    where
        F: FnOnce(&mut PersistedSession),
    {
        let mut session = match self.inner.store.load() {
            Ok(session) => session.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read session markers, starting fresh");
                PersistedSession::default()
            }
        };
        update(&mut session);
        if let Err(err) = self.inner.store.save(&session) {
            tracing::warn!(error = %err, "failed to persist session markers");
        }
    }

    async fn enable_user_scoped(&self) {
        for resource in &self.inner.config.user_scoped_resources {
            self.inner.client.enable_resource(resource).await;
        }
    }

    /// Restore the previous session once at startup.
    ///
    /// Reconnects the wallet if it was connected, adopts an unexpired token
    /// issued for the same address, and signs in otherwise. Failures are
    /// logged and leave the session Anonymous.
    pub async fn restore(&self) -> SessionState {
        let _guard = self.inner.ops.lock().await;
        let persisted = match self.inner.store.load() {
            Ok(persisted) => persisted.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read session markers");
                PersistedSession::default()
            }
        };
        if !persisted.was_connected {
            return self.state();
        }

        let address = match self.connect_wallet().await {
            Ok(address) => address,
            Err(err) => {
                tracing::warn!(error = %err, "silent wallet reconnect failed");
                self.abandon();
                return self.state();
            }
        };

        match persisted
            .auth_token
            .filter(|token| token.is_valid_for(&address, Utc::now()))
        {
            Some(stored) => {
                self.identity().set_token(Some(stored.token));
                match self.transition(SessionEvent::SignedIn {
                    address: address.clone(),
                }) {
                    Ok(_) => {
                        self.enable_user_scoped().await;
                        tracing::info!(address = %address, "restored persisted session");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "could not adopt persisted token");
                        self.abandon();
                    }
                }
            }
            None => {
                if let Err(err) = self.sign_in_locked().await {
                    tracing::warn!(error = %err, "sign-in during restore failed");
                    self.abandon();
                }
            }
        }
        self.state()
    }

    /// Quietly return to Anonymous without a teardown notification.
    fn abandon(&self) {
        if let Err(err) = self.transition(SessionEvent::SignedOut) {
            tracing::debug!(error = %err, "abandon on anonymous session");
        }
        self.identity().clear();
        self.persist(|session| {
            session.auth_token = None;
            session.was_connected = false;
        });
    }

    /// Connect the wallet and sign in.
    pub async fn connect(&self) -> FolioResult<SessionState> {
        let _guard = self.inner.ops.lock().await;
        let result = match self.state() {
            SessionState::Anonymous => match self.connect_wallet().await {
                Ok(_) => self.sign_in_locked().await,
                Err(err) => Err(err),
            },
            SessionState::Connected { .. } => self.sign_in_locked().await,
            state => Ok(state),
        };
        self.surface(result)
    }

    async fn connect_wallet(&self) -> FolioResult<String> {
        self.transition(SessionEvent::ConnectRequested)
            .map_err(transition_failure)?;
        match self.inner.wallet.connect().await {
            Ok(address) => {
                self.identity().set_address(Some(address.clone()));
                self.transition(SessionEvent::WalletConnected {
                    address: address.clone(),
                })
                .map_err(transition_failure)?;
                self.persist(|session| session.was_connected = true);
                Ok(address)
            }
            Err(err) => {
                if let Err(rejected) = self.transition(SessionEvent::ConnectFailed) {
                    tracing::debug!(error = %rejected, "connect failure after state change");
                }
                Err(err)
            }
        }
    }

    /// Run challenge/response sign-in for the connected address.
    pub async fn sign_in(&self) -> FolioResult<SessionState> {
        let _guard = self.inner.ops.lock().await;
        let result = self.sign_in_locked().await;
        self.surface(result)
    }

    async fn sign_in_locked(&self) -> FolioResult<SessionState> {
        let address = match self.state() {
            SessionState::Connected { address } => address,
            state @ SessionState::Authenticated { .. } => return Ok(state),
            SessionState::Anonymous | SessionState::Connecting => {
                return Err(FolioError::wallet("No wallet connected"))
            }
        };

        match self.challenge(&address).await {
            Ok(token) => {
                let expires_at = token
                    .expires_at
                    .unwrap_or_else(|| expiry_after(self.inner.config.token_ttl));
                self.identity().set_token(Some(token.token.clone()));
                let state = self
                    .transition(SessionEvent::SignedIn {
                        address: address.clone(),
                    })
                    .map_err(transition_failure)?;
                self.persist(|session| {
                    session.auth_token = Some(StoredToken {
                        token: token.token,
                        address: address.clone(),
                        expires_at,
                    });
                    session.was_connected = true;
                });
                self.enable_user_scoped().await;
                Ok(state)
            }
            Err(err) => {
                tracing::debug!(address = %address, error = %err, "sign-in failed");
                if let Err(rejected) = self.transition(SessionEvent::SignInFailed) {
                    tracing::debug!(error = %rejected, "sign-in failure after state change");
                }
                Err(err)
            }
        }
    }

    async fn challenge(&self, address: &str) -> FolioResult<AuthToken> {
        let message = self.inner.auth.request_nonce(address).await?;
        let signature = self.inner.wallet.sign_message(message.as_bytes()).await?;
        self.inner.auth.verify(address, &message, &signature).await
    }

    /// Sign out and disconnect the wallet. Returns whether a session ended.
    pub async fn sign_out(&self) -> bool {
        let _guard = self.inner.ops.lock().await;
        let ended = self.teardown(SessionEvent::SignedOut);
        if let Err(err) = self.inner.wallet.disconnect().await {
            tracing::warn!(error = %err, "wallet disconnect failed");
        }
        ended
    }

    /// End the current session for `event`. No-op when already Anonymous.
    fn teardown(&self, event: SessionEvent) -> bool {
        let Some(reason) = event.teardown_reason() else {
            return false;
        };
        let previous = self.state();
        if previous.is_anonymous() {
            return false;
        }
        if let Err(err) = self.transition(event) {
            tracing::debug!(error = %err, "teardown rejected");
            return false;
        }

        self.identity().clear();
        let mut evicted = 0;
        for resource in &self.inner.config.user_scoped_resources {
            self.inner.client.disable_resource(resource);
            evicted += self.inner.client.reset_by_prefix(resource);
        }
        self.persist(|session| {
            session.auth_token = None;
            session.was_connected = reason.keeps_wallet();
        });

        let notification = match reason {
            TeardownReason::SignedOut => Notification::info(reason.message()),
            _ => Notification::warning(reason.message()),
        };
        self.inner.client.sink().notify(notification);
        tracing::info!(reason = ?reason, previous = %previous, evicted, "session torn down");
        true
    }

    /// Compare the wallet's current address with the session's.
    ///
    /// Poll failures count as no change.
    pub async fn poll_once(&self) -> PollOutcome {
        let _guard = self.inner.ops.lock().await;
        let Some(current) = self.state().address().map(str::to_string) else {
            return PollOutcome::Unchanged;
        };
        match self.inner.wallet.address().await {
            Err(err) => {
                tracing::debug!(error = %err, "wallet poll failed");
                PollOutcome::Unchanged
            }
            Ok(Some(reported)) if reported == current => PollOutcome::Unchanged,
            Ok(Some(reported)) => self.switch_account(reported).await,
            Ok(None) => {
                self.teardown(SessionEvent::Disconnected);
                PollOutcome::Disconnected
            }
        }
    }

    async fn switch_account(&self, address: String) -> PollOutcome {
        self.teardown(SessionEvent::AccountChanged {
            address: Some(address.clone()),
        });
        if self.inner.config.reauthenticate_on_switch {
            let result = self.reauthenticate(&address).await;
            // Sign-in failures after a switch are the user's to see.
            let _ = self.surface(result);
        }
        PollOutcome::Switched { address }
    }

    async fn reauthenticate(&self, address: &str) -> FolioResult<SessionState> {
        self.transition(SessionEvent::ConnectRequested)
            .map_err(transition_failure)?;
        self.identity().set_address(Some(address.to_string()));
        self.transition(SessionEvent::WalletConnected {
            address: address.to_string(),
        })
        .map_err(transition_failure)?;
        self.persist(|session| session.was_connected = true);
        self.sign_in_locked().await
    }

    /// React to a wallet notification.
    pub async fn handle_event(&self, event: WalletEvent) {
        let _guard = self.inner.ops.lock().await;
        tracing::debug!(event = ?event, "wallet event");
        match event {
            WalletEvent::Disconnected | WalletEvent::AccountChanged { address: None } => {
                self.teardown(SessionEvent::Disconnected);
            }
            WalletEvent::AccountChanged {
                address: Some(address),
            } => {
                let state = self.state();
                if state.has_wallet() && state.address() != Some(address.as_str()) {
                    self.switch_account(address).await;
                }
            }
        }
    }

    /// End the authenticated session if `rejected` is still its token.
    pub async fn handle_expired(&self, rejected: &str) -> bool {
        let _guard = self.inner.ops.lock().await;
        if !self.state().is_authenticated()
            || self.identity().auth_token().as_deref() != Some(rejected)
        {
            tracing::debug!("expiry signal does not match the current session");
            return false;
        }
        self.teardown(SessionEvent::SessionExpired)
    }

    /// Drive polling, wallet events and expiry signals until `shutdown_rx`
    /// flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut events = self.inner.wallet.events();
        let mut events_open = true;
        let identity = self.identity().clone();

        tracing::info!(
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            reauthenticate_on_switch = self.inner.config.reauthenticate_on_switch,
            "session binding started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("session binding shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                received = events.recv(), if events_open => match received {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "wallet events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("wallet event stream closed");
                        events_open = false;
                    }
                },
                rejected = identity.expired() => {
                    self.handle_expired(&rejected).await;
                }
            }
        }
    }

    /// Spawn [`SessionBinding::run`] onto the runtime.
    pub fn spawn(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(shutdown_rx))
    }
}

impl std::fmt::Debug for SessionBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBinding")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}
