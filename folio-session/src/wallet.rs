//! The external wallet seam.

use async_trait::async_trait;
use folio_core::FolioResult;
use tokio::sync::broadcast;

/// Notifications pushed by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    Disconnected,
    /// The active account changed. `None` when the wallet locked itself.
    AccountChanged { address: Option<String> },
}

/// A user-controlled signing identity outside the trust boundary.
///
/// Failures are reported as [`folio_core::FolioError::Wallet`]. Wallets do not
/// reliably push silent account switches, so the binding also polls
/// [`WalletAdapter::address`].
#[async_trait]
pub trait WalletAdapter: Send + Sync {
    /// The currently selected address, if the wallet is connected.
    async fn address(&self) -> FolioResult<Option<String>>;

    /// Ask the wallet to connect and return the selected address.
    async fn connect(&self) -> FolioResult<String>;

    async fn disconnect(&self) -> FolioResult<()>;

    /// Sign `message` with the selected account.
    async fn sign_message(&self, message: &[u8]) -> FolioResult<Vec<u8>>;

    fn events(&self) -> broadcast::Receiver<WalletEvent>;
}
