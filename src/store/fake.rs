//! In-memory [`KvClient`] with injectable faults, for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KvClient, StoreError};

#[derive(Debug, Default)]
pub(crate) struct FakeKv {
    values: Mutex<HashMap<String, String>>,
    fail: AtomicBool,
    rejected_swaps: AtomicU32,
    swap_attempts: AtomicU32,
    latency: Mutex<Option<Duration>>,
}

impl FakeKv {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn raw(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub(crate) fn insert_raw(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    /// Make every call fail as if the service were down.
    pub(crate) fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Report a conflict for the next `count` swaps, regardless of the value.
    pub(crate) fn reject_next_swaps(&self, count: u32) {
        self.rejected_swaps.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub(crate) fn swap_attempts(&self) -> u32 {
        self.swap_attempts.load(Ordering::SeqCst)
    }

    async fn round_trip(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        tokio::task::yield_now().await;
        Ok(())
    }
}

#[async_trait]
impl KvClient for FakeKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.round_trip().await?;
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.round_trip().await?;
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError> {
        self.round_trip().await?;
        self.swap_attempts.fetch_add(1, Ordering::SeqCst);

        let rejected = self
            .rejected_swaps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Ok(false);
        }

        let mut values = self.values.lock();
        if values.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        values.insert(key.to_string(), value);
        Ok(true)
    }
}
