//! Session state machine.
//!
//! [`SessionState::apply`] is the only place transitions are decided. The
//! binding feeds it events from user actions, wallet notifications, the
//! address poller and the session-expired signal.

use std::fmt;
use thiserror::Error;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No wallet connected.
    #[default]
    Anonymous,
    /// Waiting for the wallet to report an address.
    Connecting,
    /// Wallet connected, no auth token yet.
    Connected { address: String },
    /// Wallet connected and a token issued for its address.
    Authenticated { address: String },
}

impl SessionState {
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Connected { address } | Self::Authenticated { address } => Some(address),
            Self::Anonymous | Self::Connecting => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// Connected or authenticated.
    pub fn has_wallet(&self) -> bool {
        self.address().is_some()
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Connecting => "connecting",
            Self::Connected { .. } => "connected",
            Self::Authenticated { .. } => "authenticated",
        }
    }

    /// Compute the state that follows `event`.
    pub fn apply(&self, event: &SessionEvent) -> Result<SessionState, TransitionError> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self, event) {
            (S::Anonymous, E::ConnectRequested) => S::Connecting,

            (S::Connecting, E::WalletConnected { address }) => S::Connected {
                address: address.clone(),
            },
            (S::Connecting, E::ConnectFailed) => S::Anonymous,

            (S::Connected { address }, E::SignedIn { address: signed }) if signed == address => {
                S::Authenticated {
                    address: address.clone(),
                }
            }
            (S::Connected { address }, E::SignInFailed) => S::Connected {
                address: address.clone(),
            },

            (S::Connected { address } | S::Authenticated { address }, E::AccountChanged { address: reported })
                if reported.as_deref() != Some(address.as_str()) =>
            {
                S::Anonymous
            }
            (S::Authenticated { .. }, E::SessionExpired) => S::Anonymous,

            (S::Connecting | S::Connected { .. } | S::Authenticated { .. }, E::Disconnected | E::SignedOut) => {
                S::Anonymous
            }

            _ => {
                return Err(TransitionError::Invalid {
                    from: self.name(),
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address() {
            Some(address) => write!(f, "{}({})", self.name(), address),
            None => f.write_str(self.name()),
        }
    }
}

/// Inputs to the session state machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    ConnectRequested,
    WalletConnected { address: String },
    ConnectFailed,
    SignedIn { address: String },
    SignInFailed,
    /// The wallet reports a different account, or none.
    AccountChanged { address: Option<String> },
    Disconnected,
    SignedOut,
    SessionExpired,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectRequested => "connect_requested",
            Self::WalletConnected { .. } => "wallet_connected",
            Self::ConnectFailed => "connect_failed",
            Self::SignedIn { .. } => "signed_in",
            Self::SignInFailed => "sign_in_failed",
            Self::AccountChanged { .. } => "account_changed",
            Self::Disconnected => "disconnected",
            Self::SignedOut => "signed_out",
            Self::SessionExpired => "session_expired",
        }
    }

    /// Teardown reason, for events that end a session.
    pub fn teardown_reason(&self) -> Option<TeardownReason> {
        match self {
            Self::AccountChanged { .. } => Some(TeardownReason::AccountChanged),
            Self::Disconnected => Some(TeardownReason::Disconnected),
            Self::SignedOut => Some(TeardownReason::SignedOut),
            Self::SessionExpired => Some(TeardownReason::SessionExpired),
            _ => None,
        }
    }
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownReason {
    SignedOut,
    Disconnected,
    AccountChanged,
    SessionExpired,
}

impl TeardownReason {
    /// User-facing message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::SignedOut => "Signed out",
            Self::Disconnected => "Wallet disconnected",
            Self::AccountChanged => "Wallet account changed, signed out of the previous account",
            Self::SessionExpired => "Session expired, please sign in again",
        }
    }

    /// Whether the wallet should be reconnected on the next start.
    pub fn keeps_wallet(&self) -> bool {
        matches!(self, Self::AccountChanged | Self::SessionExpired)
    }
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid session transition from {from} on {event}")]
    Invalid {
        from: &'static str,
        event: &'static str,
    },
}
