//! Bucket state persistence.
//!
//! Stores own every [`BucketState`]. The limiter never holds a reference into
//! a store; it hands an `apply` function to [`BucketStore::update`] and the
//! store runs it inside its own per-key critical section (in-process) or
//! compare-and-swap loop (networked).

mod memory;
mod redis_kv;
mod remote;

#[cfg(test)]
pub(crate) mod fake;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{StoreConfig, StoreDriver};
use crate::error::TollgateError;
use crate::ratelimit::{Admission, BucketState};

pub use memory::MemoryStore;
pub use redis_kv::RedisKv;
pub use remote::{KvClient, RemoteStore};

/// Errors raised by bucket stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing service could not be reached or timed out
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded
    #[error("corrupt bucket state for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Conditional writes kept conflicting
    #[error("gave up after {attempts} conflicting updates")]
    Contention { attempts: u32 },
}

/// Function run against the current state of one key inside a store's
/// critical section.
pub type ApplyFn<'a> = &'a (dyn Fn(Option<BucketState>) -> Admission + Send + Sync);

/// Trait for bucket store implementations.
///
/// This trait abstracts over the in-process [`MemoryStore`] and the networked
/// [`RemoteStore`] so the limiter works with either.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Load the state for `key`, or `None` if the key has never been seen.
    async fn load(&self, key: &str) -> Result<Option<BucketState>, StoreError>;

    /// Overwrite the state for `key`.
    async fn save(&self, key: &str, state: BucketState) -> Result<(), StoreError>;

    /// Atomically read, transform and write the state for `key`.
    ///
    /// Concurrent updates of the same key are linearized. `apply` may run
    /// more than once when the store retries a conflicting write.
    async fn update(&self, key: &str, apply: ApplyFn<'_>) -> Result<Admission, StoreError>;
}

/// Build the store selected by `config`.
pub async fn connect(config: &StoreConfig) -> crate::error::Result<Arc<dyn BucketStore>> {
    match config.driver {
        StoreDriver::Memory => {
            info!("Using in-process bucket store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreDriver::Redis => {
            let url = config.url.as_deref().ok_or_else(|| {
                TollgateError::Config("store.url is required for the redis driver".to_string())
            })?;
            info!(url = %url, "Using redis bucket store");

            let client = RedisKv::connect(url).await?;
            let store = RemoteStore::new(client)
                .with_timeout(Duration::from_millis(config.timeout_ms))
                .with_max_attempts(config.max_attempts);
            Ok(Arc::new(store))
        }
    }
}
