//! User-visible notifications.
//!
//! The sink is fire-and-forget: the core never waits on it and never learns
//! whether a notification was shown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::FolioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Warning, message)
    }

    /// Error notification for a terminal failure. Prefers the server's own
    /// message when the response body carried one.
    pub fn from_error(err: &FolioError) -> Self {
        let message = err
            .server_message()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        Self::new(NotificationLevel::Error, message)
    }
}

/// Destination for user-visible notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

pub type SharedSink = Arc<dyn NotificationSink>;

/// Sink that only writes notifications to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Error => {
                tracing::error!(text = %notification.message, "notification")
            }
            NotificationLevel::Warning => {
                tracing::warn!(text = %notification.message, "notification")
            }
            NotificationLevel::Info | NotificationLevel::Success => {
                tracing::info!(level = ?notification.level, text = %notification.message, "notification")
            }
        }
    }
}

/// Sink that forwards notifications to a channel, for a UI loop to drain.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: Notification) {
        // Receiver gone means nobody is displaying notifications anymore.
        let _ = self.tx.send(notification);
    }
}
