//! Mutations: a side effect run once, then its declared cache effects.

use folio_core::{Fingerprint, FolioError, FolioResult, Notification, Pattern, ValidationError};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::client::QueryClient;
use crate::fetcher::ErrorCallback;

type UpdateFn<R> = Box<dyn FnOnce(&R) -> FolioResult<Value> + Send>;
type SuccessFn<R> = Box<dyn FnOnce(&R) + Send>;

/// Cache effects applied once a mutation's side effect settles.
pub struct MutationEffects<R> {
    invalidates: Vec<Pattern>,
    updates: Vec<(Fingerprint, UpdateFn<R>)>,
    on_success: Option<SuccessFn<R>>,
    on_error: Option<ErrorCallback>,
    success_message: Option<String>,
}

impl<R> Default for MutationEffects<R> {
    fn default() -> Self {
        Self {
            invalidates: Vec::new(),
            updates: Vec::new(),
            on_success: None,
            on_error: None,
            success_message: None,
        }
    }
}

impl<R> MutationEffects<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate `pattern` after success.
    pub fn invalidates(mut self, pattern: impl Into<Pattern>) -> Self {
        self.invalidates.push(pattern.into());
        self
    }

    /// Write the value derived from the result into `fingerprint` after success.
    pub fn update<T, F>(mut self, fingerprint: Fingerprint, f: F) -> Self
    where
        T: Serialize,
        F: FnOnce(&R) -> T + Send + 'static,
    {
        let target = fingerprint.to_string();
        self.updates.push((
            fingerprint,
            Box::new(move |result: &R| {
                serde_json::to_value(f(result)).map_err(|err| {
                    FolioError::from(ValidationError::Encode {
                        fingerprint: target,
                        reason: err.to_string(),
                    })
                })
            }),
        ));
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&R) + Send + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&FolioError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Notification emitted after success.
    pub fn success_message(mut self, message: impl Into<String>) -> Self {
        self.success_message = Some(message.into());
        self
    }
}

impl<R> fmt::Debug for MutationEffects<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationEffects")
            .field("invalidates", &self.invalidates)
            .field(
                "updates",
                &self.updates.iter().map(|(fp, _)| fp).collect::<Vec<_>>(),
            )
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("success_message", &self.success_message)
            .finish()
    }
}

/// Runs mutations against a [`QueryClient`].
///
/// There is no locking between mutations: refetches triggered by overlapping
/// mutations settle last-write-wins.
#[derive(Debug, Clone)]
pub struct MutationExecutor {
    client: QueryClient,
}

impl MutationExecutor {
    pub fn new(client: QueryClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    /// Await `side_effect` once, then apply `effects`.
    ///
    /// On success: cache writes, invalidations (awaited), `on_success`, then the
    /// success notification. On failure the cache is untouched; the classified
    /// error goes to `on_error` and the notification sink, and is returned.
    pub async fn run<R, Fut>(&self, side_effect: Fut, effects: MutationEffects<R>) -> FolioResult<R>
    where
        Fut: Future<Output = FolioResult<R>>,
    {
        let token = self.client.identity().auth_token();
        let MutationEffects {
            invalidates,
            updates,
            on_success,
            on_error,
            success_message,
        } = effects;

        let result = match side_effect.await {
            Ok(result) => result,
            Err(err) => {
                let err = err.classify(token.is_some());
                tracing::debug!(error = %err, kind = ?err.kind(), "mutation failed");
                self.client
                    .report_error(&err, token.as_deref(), on_error.as_ref());
                return Err(err);
            }
        };

        for (fingerprint, update) in updates {
            match update(&result) {
                Ok(value) => self.client.set_query_value(&fingerprint, value),
                Err(err) => {
                    tracing::warn!(fingerprint = %fingerprint, error = %err, "skipping cache update")
                }
            }
        }
        let mut refetched = 0;
        for pattern in &invalidates {
            refetched += self.client.invalidate(pattern).await;
        }
        tracing::debug!(
            invalidated = invalidates.len(),
            refetched,
            "mutation effects applied",
        );
        if let Some(on_success) = on_success {
            on_success(&result);
        }
        if let Some(message) = success_message {
            self.client.sink().notify(Notification::success(message));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{QueryOptions, SharedQueryFn};
    use folio_core::{ChannelSink, IdentityCell, NotificationLevel};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn client_with_channel() -> (QueryClient, tokio::sync::mpsc::UnboundedReceiver<Notification>) {
        let (sink, rx) = ChannelSink::new();
        let client = QueryClient::new(
            crate::CacheConfig::default(),
            IdentityCell::new(),
            Arc::new(sink),
        );
        (client, rx)
    }

    #[tokio::test]
    async fn test_success_applies_effects_in_order() {
        let (client, mut rx) = client_with_channel();
        let executor = MutationExecutor::new(client.clone());
        let user = Fingerprint::bare("user").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let seen = order.clone();
        let check_client = client.clone();
        let check_user = user.clone();
        let result = executor
            .run(
                async { Ok::<_, FolioError>(json!({"name": "grace"})) },
                MutationEffects::new()
                    .update(user.clone(), |profile: &Value| profile.clone())
                    .invalidates(Pattern::resource("user-counters"))
                    .on_success(move |_| {
                        let stored = check_client.get(&check_user).and_then(|e| e.data);
                        seen.lock().unwrap().push(stored);
                    })
                    .success_message("Profile updated"),
            )
            .await
            .unwrap();

        assert_eq!(result, json!({"name": "grace"}));
        assert_eq!(
            *order.lock().unwrap(),
            vec![Some(json!({"name": "grace"}))]
        );
        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.level, NotificationLevel::Success);
        assert_eq!(notification.message, "Profile updated");
    }

    #[tokio::test]
    async fn test_failure_leaves_cache_unchanged() {
        let (client, mut rx) = client_with_channel();
        let executor = MutationExecutor::new(client.clone());
        let user = Fingerprint::bare("user").unwrap();
        client.set_query_value(&user, json!({"name": "ada"}));

        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher: SharedQueryFn = {
            let calls = calls.clone();
            Arc::new(move |_fp: Fingerprint| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, FolioError>(json!({"name": "refetched"})) }
            })
        };
        let _observer = client
            .watch(&user, fetcher, QueryOptions::default())
            .await;
        let baseline = calls.load(Ordering::SeqCst);

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let result: FolioResult<Value> = executor
            .run(
                async { Err::<Value, _>(FolioError::http(422, Some(json!({"error": "Invalid name"})))) },
                MutationEffects::new()
                    .update(user.clone(), |_: &Value| json!({"name": "never"}))
                    .invalidates(Pattern::resource("user"))
                    .on_error(move |err| sink.lock().unwrap().push(err.clone())),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), baseline);
        assert_ne!(client.get(&user).unwrap().data, Some(json!({"name": "never"})));
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(rx.try_recv().unwrap().message, "Invalid name");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unauthorized_mutation_with_token_is_session_expired() {
        let identity = IdentityCell::new();
        identity.set_address(Some("0xabc".into()));
        identity.set_token(Some("token".into()));
        let client = QueryClient::new(
            crate::CacheConfig::default(),
            identity,
            Arc::new(folio_core::TracingSink),
        );
        let executor = MutationExecutor::new(client);

        let classified = Arc::new(Mutex::new(None));
        let slot = classified.clone();
        let err = executor
            .run(
                async { Err::<(), _>(FolioError::http(401, None)) },
                MutationEffects::new().on_error(move |err| *slot.lock().unwrap() = Some(err.clone())),
            )
            .await
            .unwrap_err();

        assert!(err.is_session_expired());
        assert!(classified.lock().unwrap().as_ref().unwrap().is_session_expired());
    }
}
