//! Session binding configuration.

use std::time::Duration;

/// Resources whose data belongs to the signed-in user.
pub const DEFAULT_USER_SCOPED: &[&str] = &["user", "user-counters"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How often the wallet address is polled for silent account switches.
    pub poll_interval: Duration,
    /// Lifetime assumed for tokens the server issues without an expiry.
    pub token_ttl: Duration,
    /// Sign in the new account right after an account-switch teardown.
    pub reauthenticate_on_switch: bool,
    /// Resources evicted on teardown and gated until authenticated.
    pub user_scoped_resources: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            token_ttl: Duration::from_secs(24 * 60 * 60),
            reauthenticate_on_switch: true,
            user_scoped_resources: DEFAULT_USER_SCOPED.iter().map(|r| r.to_string()).collect(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn with_reauthenticate_on_switch(mut self, enabled: bool) -> Self {
        self.reauthenticate_on_switch = enabled;
        self
    }

    pub fn with_user_scoped_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_scoped_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_user_scoped(&self, resource: &str) -> bool {
        self.user_scoped_resources.iter().any(|r| r == resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.reauthenticate_on_switch);
        assert!(config.is_user_scoped("user"));
        assert!(config.is_user_scoped("user-counters"));
        assert!(!config.is_user_scoped("book"));
    }
}
