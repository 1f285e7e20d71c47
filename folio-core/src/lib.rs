//! Folio Core - Value Types
//!
//! Query fingerprints, the error taxonomy, the shared session identity and the
//! notification seam. All other Folio crates depend on this.

pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod notify;

pub use error::{ErrorKind, FolioError, FolioResult, ValidationError};
pub use fingerprint::{Fingerprint, FingerprintBuilder, Pattern};
pub use identity::{IdentityCell, SessionIdentity};
pub use notify::{
    ChannelSink, Notification, NotificationLevel, NotificationSink, SharedSink, TracingSink,
};
