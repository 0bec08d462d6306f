//! Token bucket limiter.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::bucket::{admit, BucketConfig, BucketState};
use super::key::BucketKey;
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::Result;
use crate::store::{BucketStore, StoreError};

/// Default namespace prepended to every identity.
pub const DEFAULT_NAMESPACE: &str = "limit";

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Tokens left in the bucket after this check. Unknown for a contended
    /// check and reported as 0.
    pub tokens: f64,
    /// Maximum tokens the bucket can hold
    pub capacity: f64,
    /// Tokens added per second
    pub rate: f64,
    /// Set when the store could not commit the check and it was denied
    /// conservatively
    pub contended: bool,
}

/// Admits or rejects requests per identity against a shared token bucket
/// configuration.
///
/// The limiter holds no bucket state itself; every check is a single atomic
/// update on the [`BucketStore`].
pub struct Limiter {
    /// Rate and capacity shared by every bucket
    bucket: BucketConfig,
    /// Key prefix
    namespace: String,
    /// Where bucket state lives
    store: Arc<dyn BucketStore>,
    /// Time source for refills
    clock: Arc<dyn Clock>,
}

impl Limiter {
    /// Create a limiter using the system clock and the default namespace.
    pub fn new(bucket: BucketConfig, store: Arc<dyn BucketStore>) -> Self {
        Self {
            bucket,
            namespace: DEFAULT_NAMESPACE.to_string(),
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a limiter from configuration, validating rate and capacity.
    pub fn from_config(config: &LimiterConfig, store: Arc<dyn BucketStore>) -> Result<Self> {
        let bucket = BucketConfig::new(config.rate, config.capacity)?;
        Ok(Self::new(bucket, store).with_namespace(&config.namespace))
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn bucket(&self) -> BucketConfig {
        self.bucket
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Refill the identity's bucket and try to take one token.
    ///
    /// Store failures are returned to the caller. Exhausted compare-and-swap
    /// retries are not failures: they produce a denied [`Decision`] with
    /// `contended` set.
    ///
    /// The store update runs on its own task, so dropping the returned future
    /// does not abandon a write that has already started.
    pub async fn check(&self, identity: &str) -> std::result::Result<Decision, StoreError> {
        let key = BucketKey::new(&self.namespace, identity);

        trace!(key = %key, "Checking rate limit");

        let store = self.store.clone();
        let clock = self.clock.clone();
        let bucket = self.bucket;
        let store_key = key.to_store_key();

        let update = tokio::spawn(async move {
            let log_key = store_key.clone();
            let apply = move |current: Option<BucketState>| {
                if current.is_none() {
                    debug!(
                        key = %log_key,
                        capacity = bucket.capacity(),
                        rate = bucket.rate(),
                        "Creating new bucket"
                    );
                }
                admit(current, clock.now_millis(), &bucket)
            };
            store.update(&store_key, &apply).await
        });

        let result = match update.await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Unavailable(format!("store task failed: {}", e))),
        };

        match result {
            Ok(admission) => {
                if !admission.admitted {
                    debug!(
                        key = %key,
                        tokens = admission.state.tokens,
                        "Rate limit exceeded"
                    );
                }
                Ok(Decision {
                    admitted: admission.admitted,
                    tokens: admission.state.tokens,
                    capacity: self.bucket.capacity(),
                    rate: self.bucket.rate(),
                    contended: false,
                })
            }
            Err(StoreError::Contention { attempts }) => {
                warn!(
                    key = %key,
                    attempts = attempts,
                    "Bucket contention unresolved, denying request"
                );
                Ok(Decision {
                    admitted: false,
                    tokens: 0.0,
                    capacity: self.bucket.capacity(),
                    rate: self.bucket.rate(),
                    contended: true,
                })
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Bucket store failed");
                Err(e)
            }
        }
    }

    /// Get the stored state for an identity without refilling or consuming.
    ///
    /// Returns `None` if the identity has never been checked.
    pub async fn peek(&self, identity: &str) -> std::result::Result<Option<BucketState>, StoreError> {
        let key = BucketKey::new(&self.namespace, identity);
        self.store.load(&key.to_store_key()).await
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("bucket", &self.bucket)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
