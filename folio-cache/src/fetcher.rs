//! Query functions and per-query options.

use async_trait::async_trait;
use folio_core::{Fingerprint, FolioError, FolioResult};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::freshness::Freshness;
use crate::retry::RetryPolicy;

/// Loads the data behind a fingerprint.
///
/// Implemented for any `Fn(Fingerprint) -> impl Future<Output = FolioResult<Value>>`,
/// so plain async closures can be used directly. Timeouts are the
/// implementation's responsibility.
#[async_trait]
pub trait QueryFn: Send + Sync {
    async fn fetch(&self, fingerprint: &Fingerprint) -> FolioResult<Value>;
}

#[async_trait]
impl<F, Fut> QueryFn for F
where
    F: Fn(Fingerprint) -> Fut + Send + Sync,
    Fut: Future<Output = FolioResult<Value>> + Send,
{
    async fn fetch(&self, fingerprint: &Fingerprint) -> FolioResult<Value> {
        (self)(fingerprint.clone()).await
    }
}

pub type SharedQueryFn = Arc<dyn QueryFn>;

/// Callback invoked with the classified error of a failed fetch.
pub type ErrorCallback = Arc<dyn Fn(&FolioError) + Send + Sync>;

/// Options attached to a query.
#[derive(Clone)]
pub struct QueryOptions {
    /// When false the query never fetches; reads return whatever is cached.
    pub enabled: bool,
    pub freshness: Freshness,
    pub retry: RetryPolicy,
    pub on_error: Option<ErrorCallback>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            freshness: Freshness::default(),
            retry: RetryPolicy::default(),
            on_error: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FolioError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("enabled", &self.enabled)
            .field("freshness", &self.freshness)
            .field("retry", &self.retry)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_is_a_query_fn() {
        let fetcher = |fp: Fingerprint| async move {
            Ok::<_, FolioError>(json!({ "resource": fp.resource_name() }))
        };
        let fp = Fingerprint::bare("user").unwrap();
        let value = fetcher.fetch(&fp).await.unwrap();
        assert_eq!(value, json!({ "resource": "user" }));
    }

    #[test]
    fn test_default_options() {
        let options = QueryOptions::default();
        assert!(options.enabled);
        assert!(options.freshness.is_consistent());
        assert_eq!(options.retry.max_retries, 0);
        assert!(options.on_error.is_none());
    }

    #[test]
    fn test_options_debug_hides_callback() {
        let options = QueryOptions::new().with_on_error(|_| {});
        let rendered = format!("{:?}", options);
        assert!(rendered.contains("on_error: true"));
    }
}
