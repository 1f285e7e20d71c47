//! Configuration loading for the Folio client.
//!
//! All fields are required unless explicitly marked optional. No defaults.

use folio_cache::{CacheConfig, RetryPolicy};
use folio_core::Fingerprint;
use folio_session::SessionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::resources::USER_SCOPED;

pub const CONFIG_ENV: &str = "FOLIO_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FolioConfig {
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    pub cache: CacheSection,
    pub retry: RetrySection,
    pub session: SessionSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    /// Zero means every read refetches.
    pub stale_after_ms: u64,
    pub gc_after_ms: u64,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSection {
    pub poll_interval_ms: u64,
    pub persistence_path: PathBuf,
    pub token_ttl_secs: u64,
    pub reauthenticate_on_switch: bool,
    pub user_scoped_resources: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or FOLIO_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl FolioConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: FolioConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self.api_base_url.trim();
        if base_url.is_empty() {
            return Err(invalid("api_base_url", "must not be empty"));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(invalid("api_base_url", "must start with http:// or https://"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be > 0"));
        }
        if self.cache.gc_after_ms == 0 {
            return Err(invalid("cache.gc_after_ms", "must be > 0"));
        }
        if self.cache.sweep_interval_ms == 0 {
            return Err(invalid("cache.sweep_interval_ms", "must be > 0"));
        }
        if self.retry.initial_ms == 0 {
            return Err(invalid("retry.initial_ms", "must be > 0"));
        }
        if self.retry.max_ms < self.retry.initial_ms {
            return Err(invalid("retry.max_ms", "must be >= retry.initial_ms"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be >= 1.0"));
        }
        if self.session.poll_interval_ms == 0 {
            return Err(invalid("session.poll_interval_ms", "must be > 0"));
        }
        if self.session.persistence_path.as_os_str().is_empty() {
            return Err(invalid("session.persistence_path", "must not be empty"));
        }
        if self.session.token_ttl_secs == 0 {
            return Err(invalid("session.token_ttl_secs", "must be > 0"));
        }
        for resource in &self.session.user_scoped_resources {
            if let Err(err) = Fingerprint::bare(resource.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "session.user_scoped_resources",
                    reason: err.to_string(),
                });
            }
        }
        if let Some(missing) = USER_SCOPED
            .iter()
            .find(|r| !self.session.user_scoped_resources.iter().any(|c| c.as_str() == **r))
        {
            return Err(ConfigError::InvalidValue {
                field: "session.user_scoped_resources",
                reason: format!("must include {}", missing),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::attempts(self.retry.max_retries)
            .with_initial_backoff(Duration::from_millis(self.retry.initial_ms))
            .with_max_backoff(Duration::from_millis(self.retry.max_ms))
            .with_multiplier(self.retry.multiplier)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .with_stale_after(Duration::from_millis(self.cache.stale_after_ms))
            .with_retry(self.retry_policy())
            .with_gc_after(Duration::from_millis(self.cache.gc_after_ms))
            .with_sweep_interval(Duration::from_millis(self.cache.sweep_interval_ms))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new()
            .with_poll_interval(Duration::from_millis(self.session.poll_interval_ms))
            .with_token_ttl(Duration::from_secs(self.session.token_ttl_secs))
            .with_reauthenticate_on_switch(self.session.reauthenticate_on_switch)
            .with_user_scoped_resources(self.session.user_scoped_resources.iter().cloned())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_cache::Freshness;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
api_base_url = "https://api.folio.test"
request_timeout_ms = 5000

[cache]
stale_after_ms = 30000
gc_after_ms = 300000
sweep_interval_ms = 60000

[retry]
max_retries = 2
initial_ms = 200
max_ms = 2000
multiplier = 2.0

[session]
poll_interval_ms = 1000
persistence_path = "tmp/folio-session.json"
token_ttl_secs = 86400
reauthenticate_on_switch = true
user_scoped_resources = ["user", "user-counters"]
"#;

    #[test]
    fn test_parse_sample() {
        let config = FolioConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(5));

        let cache = config.cache_config();
        assert_eq!(
            cache.default_freshness,
            Freshness::best_effort(Duration::from_secs(30))
        );
        assert_eq!(cache.default_retry.max_retries, 2);
        assert_eq!(cache.gc_after, Duration::from_secs(300));

        let session = config.session_config();
        assert_eq!(session.poll_interval, Duration::from_secs(1));
        assert!(session.is_user_scoped("user-counters"));
    }

    #[test]
    fn test_user_scoped_list_must_cover_catalog() {
        let contents = SAMPLE.replace(
            r#"user_scoped_resources = ["user", "user-counters"]"#,
            r#"user_scoped_resources = ["user"]"#,
        );
        let config = FolioConfig::from_toml_str(&contents).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "session.user_scoped_resources",
                ..
            }
        ));
        assert!(err.to_string().contains("user-counters"));
    }

    #[test]
    fn test_zero_stale_after_is_consistent() {
        let contents = SAMPLE.replace("stale_after_ms = 30000", "stale_after_ms = 0");
        let config = FolioConfig::from_toml_str(&contents).unwrap();
        assert!(config.cache_config().default_freshness.is_consistent());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let contents = format!("theme = \"dark\"\n{}", SAMPLE);
        let err = FolioConfig::from_toml_str(&contents).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_section_rejected() {
        let contents = SAMPLE.replace("[retry]", "[retry_policy]");
        assert!(FolioConfig::from_toml_str(&contents).is_err());
    }

    #[test]
    fn test_from_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("folio.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = FolioConfig::from_path(&path).unwrap();
        assert_eq!(config.api_base_url, "https://api.folio.test");

        let err = FolioConfig::from_path(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
