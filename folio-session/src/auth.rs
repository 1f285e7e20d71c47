//! The challenge/response sign-in seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use folio_core::FolioResult;
use serde::{Deserialize, Serialize};

/// Token issued by the server for a verified address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Server side of sign-in: issue a nonce message, then exchange its signature
/// for a token.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// The message the wallet must sign to prove control of `address`.
    async fn request_nonce(&self, address: &str) -> FolioResult<String>;

    async fn verify(&self, address: &str, message: &str, signature: &[u8]) -> FolioResult<AuthToken>;
}
