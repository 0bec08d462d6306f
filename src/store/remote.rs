//! Networked bucket store.
//!
//! State lives in an external key/value service and crosses the boundary as
//! JSON. Updates are optimistic: read, apply, then write only if the stored
//! value is still the one that was read.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, trace, warn};

use super::{ApplyFn, BucketStore, StoreError};
use crate::ratelimit::{Admission, BucketState};

/// Default bound for a single key/value call.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);
/// Default number of compare-and-swap attempts per update.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Upper bound of the randomized pause between conflicting attempts.
const MAX_BACKOFF_MICROS: u64 = 2_000;

/// Minimal client for a key/value service with a conditional write.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Get the raw value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally store `value` under `key`.
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Store `value` only if the current value equals `expected`
    /// (`None` meaning the key must be absent).
    ///
    /// Returns `false` when the condition did not hold and nothing was written.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError>;
}

/// A bucket store backed by a [`KvClient`].
pub struct RemoteStore<C: KvClient> {
    /// The key/value client
    client: C,
    /// Bound for each client call
    timeout: Duration,
    /// Compare-and-swap attempts before giving up
    max_attempts: u32,
}

impl<C: KvClient> RemoteStore<C> {
    /// Create a new remote store with default timeout and retry bound.
    pub fn new(client: C) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the compare-and-swap attempt bound. Values below one are raised to one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Get the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    async fn call<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "call timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    fn decode(key: &str, raw: &str) -> Result<BucketState, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn encode(key: &str, state: &BucketState) -> Result<String, StoreError> {
        serde_json::to_string(state).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl<C: KvClient> BucketStore for RemoteStore<C> {
    async fn load(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        match self.call(self.client.get(key)).await? {
            Some(raw) => Self::decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, key: &str, state: BucketState) -> Result<(), StoreError> {
        let raw = Self::encode(key, &state)?;
        self.call(self.client.set(key, raw)).await
    }

    async fn update(&self, key: &str, apply: ApplyFn<'_>) -> Result<Admission, StoreError> {
        for attempt in 1..=self.max_attempts {
            let current_raw = self.call(self.client.get(key)).await?;
            let current = current_raw
                .as_deref()
                .map(|raw| Self::decode(key, raw))
                .transpose()?;

            let admission = apply(current);
            let next_raw = Self::encode(key, &admission.state)?;

            let swapped = self
                .call(
                    self.client
                        .compare_and_swap(key, current_raw.as_deref(), next_raw),
                )
                .await?;

            if swapped {
                trace!(
                    key = %key,
                    attempt = attempt,
                    tokens = admission.state.tokens,
                    "Updated remote bucket"
                );
                return Ok(admission);
            }

            debug!(key = %key, attempt = attempt, "Bucket changed concurrently, retrying");
            if attempt < self.max_attempts {
                let pause = rand::thread_rng().gen_range(0..=MAX_BACKOFF_MICROS);
                tokio::time::sleep(Duration::from_micros(pause)).await;
            }
        }

        warn!(
            key = %key,
            attempts = self.max_attempts,
            "Bucket update kept conflicting"
        );
        Err(StoreError::Contention {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{admit, BucketConfig};
    use crate::store::fake::FakeKv;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn take_one(config: BucketConfig) -> impl Fn(Option<BucketState>) -> Admission + Send + Sync {
        move |current| admit(current, 0, &config)
    }

    #[tokio::test]
    async fn test_load_missing_key() {
        let store = RemoteStore::new(FakeKv::new());
        assert_eq!(assert_ok!(store.load("limit:A").await), None);
    }

    #[tokio::test]
    async fn test_save_writes_json() {
        let store = RemoteStore::new(FakeKv::new());
        let state = BucketState { tokens: 7.25, last_refill_ms: 10 };

        assert_ok!(store.save("limit:A", state).await);

        assert_eq!(
            store.client().raw("limit:A").as_deref(),
            Some(r#"{"tokens":7.25,"lastRefillTime":10}"#)
        );
        assert_eq!(store.load("limit:A").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_corrupt_value_is_not_absent() {
        let kv = FakeKv::new();
        kv.insert_raw("limit:A", "not json");
        let store = RemoteStore::new(kv);

        let result = store.load("limit:A").await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_unavailable_service_is_reported() {
        let kv = FakeKv::new();
        kv.fail_calls(true);
        let store = RemoteStore::new(kv);
        let apply = take_one(BucketConfig::new(1.0, 1.0).unwrap());

        assert!(matches!(
            store.load("limit:A").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.update("limit:A", &apply).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        let kv = FakeKv::new();
        kv.set_latency(Duration::from_millis(200));
        let store = RemoteStore::new(kv).with_timeout(Duration::from_millis(20));

        let result = store.load("limit:A").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_update_retries_after_conflict() {
        let kv = FakeKv::new();
        kv.reject_next_swaps(2);
        let store = RemoteStore::new(kv).with_max_attempts(3);
        let apply = take_one(BucketConfig::new(1.0, 5.0).unwrap());

        let admission = assert_ok!(store.update("limit:A", &apply).await);

        assert!(admission.admitted);
        assert_eq!(admission.state.tokens, 4.0);
        assert_eq!(store.client().swap_attempts(), 3);
    }

    #[tokio::test]
    async fn test_update_gives_up_on_persistent_conflict() {
        let kv = FakeKv::new();
        kv.reject_next_swaps(u32::MAX);
        let store = RemoteStore::new(kv).with_max_attempts(4);
        let apply = take_one(BucketConfig::new(1.0, 5.0).unwrap());

        let err = assert_err!(store.update("limit:A", &apply).await);

        assert!(matches!(err, StoreError::Contention { attempts: 4 }));
        assert_eq!(store.client().raw("limit:A"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_never_over_admit() {
        let store = Arc::new(RemoteStore::new(FakeKv::new()).with_max_attempts(64));
        let config = BucketConfig::new(1.0, 10.0).unwrap();

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let apply = take_one(config);
                    match store.update("limit:A", &apply).await {
                        Ok(admission) => admission.admitted,
                        Err(StoreError::Contention { .. }) => false,
                        Err(e) => panic!("unexpected store error: {}", e),
                    }
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

        assert!(admitted <= 10, "admitted {} with 10 tokens", admitted);
        let stored = store.load("limit:A").await.unwrap().unwrap();
        assert_eq!(stored.tokens, 10.0 - admitted as f64);
    }
}
