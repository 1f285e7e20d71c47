//! Folio Session - Wallet Identity Binding
//!
//! Tracks the external wallet address and the server-issued token bound to
//! it, and keeps the query cache consistent with them:
//!
//! - [`SessionState`]: the session state machine and its transition table
//! - [`SessionBinding`]: connect, challenge/response sign-in, sign-out,
//!   address polling and teardown on identity change
//! - [`WalletAdapter`] / [`AuthApi`] / [`SessionStore`]: the seams to the
//!   wallet, the auth endpoints and persisted markers
//!
//! Wallets do not reliably push silent account switches, so the binding polls
//! the wallet address every `poll_interval` in addition to handling events.

pub mod auth;
pub mod binding;
pub mod config;
pub mod persistence;
pub mod state;
pub mod wallet;

pub use auth::{AuthApi, AuthToken};
pub use binding::{PollOutcome, SessionBinding};
pub use config::{SessionConfig, DEFAULT_USER_SCOPED};
pub use persistence::{
    FileSessionStore, MemorySessionStore, PersistedSession, PersistenceError, SessionStore,
    StoredToken,
};
pub use state::{SessionEvent, SessionState, TeardownReason, TransitionError};
pub use wallet::{WalletAdapter, WalletEvent};
