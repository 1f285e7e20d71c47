//! Process-wide session identity.
//!
//! [`IdentityCell`] is the single owner of the [`SessionIdentity`]. The HTTP
//! layer reads the token from it, the session binding writes it, and the fetch
//! coordinator raises the "session expired" signal through it.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, Notify};

/// The externally-owned wallet address and the server-issued token bound to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub external_address: Option<String>,
    pub auth_token: Option<String>,
}

impl SessionIdentity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn has_token(&self) -> bool {
        self.auth_token.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.external_address.is_some()
    }
}

/// The token most recently rejected by the server, and its wakeup.
#[derive(Debug, Default)]
struct ExpirySignal {
    rejected: Mutex<Option<String>>,
    notify: Notify,
}

impl ExpirySignal {
    fn take(&self) -> Option<String> {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Shared handle to the session identity.
///
/// Cloning the cell shares the same identity. Changes are observable through
/// [`IdentityCell::subscribe`].
#[derive(Debug, Clone)]
pub struct IdentityCell {
    tx: Arc<watch::Sender<SessionIdentity>>,
    expired: Arc<ExpirySignal>,
}

impl IdentityCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionIdentity::anonymous());
        Self {
            tx: Arc::new(tx),
            expired: Arc::new(ExpirySignal::default()),
        }
    }

    pub fn snapshot(&self) -> SessionIdentity {
        self.tx.borrow().clone()
    }

    pub fn auth_token(&self) -> Option<String> {
        self.tx.borrow().auth_token.clone()
    }

    pub fn external_address(&self) -> Option<String> {
        self.tx.borrow().external_address.clone()
    }

    pub fn has_token(&self) -> bool {
        self.tx.borrow().has_token()
    }

    /// Record the address reported by the wallet. A token bound to a
    /// different address is dropped with it.
    pub fn set_address(&self, address: Option<String>) {
        self.tx.send_modify(|identity| {
            if identity.external_address != address {
                identity.auth_token = None;
            }
            identity.external_address = address;
        });
    }

    pub fn set_token(&self, token: Option<String>) {
        self.tx.send_modify(|identity| identity.auth_token = token);
    }

    /// Clear address and token together.
    pub fn clear(&self) {
        self.tx.send_replace(SessionIdentity::anonymous());
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionIdentity> {
        self.tx.subscribe()
    }

    /// Report that the server rejected `rejected`.
    ///
    /// Ignored unless `rejected` is still the held token. If nobody is waiting
    /// yet the signal is kept until the next [`IdentityCell::expired`] call.
    pub fn signal_expired(&self, rejected: &str) -> bool {
        if self.auth_token().as_deref() != Some(rejected) {
            tracing::debug!("ignoring expiry of a token no longer held");
            return false;
        }
        *self
            .expired
            .rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(rejected.to_string());
        self.expired.notify.notify_one();
        true
    }

    /// Wait until the server has rejected the token that is currently held.
    ///
    /// Returns the rejected token. Signals for a token that has since been
    /// replaced or cleared are dropped.
    pub async fn expired(&self) -> String {
        loop {
            self.expired.notify.notified().await;
            if let Some(rejected) = self.expired.take() {
                if self.auth_token().as_deref() == Some(rejected.as_str()) {
                    return rejected;
                }
                tracing::debug!("dropping expiry signal for a replaced token");
            }
        }
    }
}

impl Default for IdentityCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_cell_is_anonymous() {
        let cell = IdentityCell::new();
        assert_eq!(cell.snapshot(), SessionIdentity::anonymous());
        assert!(!cell.has_token());
    }

    #[test]
    fn test_address_change_drops_token() {
        let cell = IdentityCell::new();
        cell.set_address(Some("A".to_string()));
        cell.set_token(Some("token-a".to_string()));
        assert!(cell.has_token());

        cell.set_address(Some("A".to_string()));
        assert!(cell.has_token());

        cell.set_address(Some("B".to_string()));
        assert!(!cell.has_token());
        assert_eq!(cell.external_address().as_deref(), Some("B"));
    }

    #[test]
    fn test_clear_resets_both() {
        let cell = IdentityCell::new();
        cell.set_address(Some("A".to_string()));
        cell.set_token(Some("token".to_string()));
        cell.clear();
        assert_eq!(cell.snapshot(), SessionIdentity::anonymous());
    }

    #[test]
    fn test_clones_share_state() {
        let cell = IdentityCell::new();
        let other = cell.clone();
        other.set_address(Some("A".to_string()));
        assert_eq!(cell.external_address().as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_expired_signal_is_stored() {
        let cell = IdentityCell::new();
        cell.set_address(Some("A".to_string()));
        cell.set_token(Some("token-a".to_string()));
        assert!(cell.signal_expired("token-a"));
        let rejected = tokio::time::timeout(Duration::from_millis(100), cell.expired())
            .await
            .expect("stored signal should resolve immediately");
        assert_eq!(rejected, "token-a");
    }

    #[test]
    fn test_expiry_of_unheld_token_is_ignored() {
        let cell = IdentityCell::new();
        assert!(!cell.signal_expired("token-a"));
        cell.set_address(Some("A".to_string()));
        cell.set_token(Some("token-b".to_string()));
        assert!(!cell.signal_expired("token-a"));
    }

    #[tokio::test]
    async fn test_expiry_signal_dropped_after_token_replaced() {
        let cell = IdentityCell::new();
        cell.set_address(Some("A".to_string()));
        cell.set_token(Some("token-a".to_string()));
        assert!(cell.signal_expired("token-a"));

        cell.clear();
        cell.set_address(Some("A".to_string()));
        cell.set_token(Some("token-b".to_string()));

        let waited = tokio::time::timeout(Duration::from_millis(50), cell.expired()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let cell = IdentityCell::new();
        let mut rx = cell.subscribe();
        cell.set_address(Some("A".to_string()));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().external_address.as_deref(), Some("A"));
    }
}
