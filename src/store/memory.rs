//! In-process bucket store.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::{ApplyFn, BucketStore, StoreError};
use crate::ratelimit::{Admission, BucketState};

type Slot = Arc<Mutex<Option<BucketState>>>;

/// A bucket store backed by a process-local concurrent map.
///
/// Each key owns its own mutex, so updates of one key are serialized while
/// updates of different keys never wait on each other beyond the brief map
/// lookup.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of keys that hold a bucket.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.value().lock().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.slots.clear();
    }

    fn slot(&self, key: &str) -> Slot {
        if let Some(slot) = self.slots.get(key) {
            return slot.value().clone();
        }
        self.slots
            .entry(key.to_string())
            .or_insert_with(Slot::default)
            .value()
            .clone()
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        let Some(slot) = self.slots.get(key).map(|slot| slot.value().clone()) else {
            return Ok(None);
        };
        let state = *slot.lock();
        Ok(state)
    }

    async fn save(&self, key: &str, state: BucketState) -> Result<(), StoreError> {
        *self.slot(key).lock() = Some(state);
        Ok(())
    }

    async fn update(&self, key: &str, apply: ApplyFn<'_>) -> Result<Admission, StoreError> {
        let slot = self.slot(key);
        let mut current = slot.lock();

        let admission = apply(*current);
        *current = Some(admission.state);

        trace!(key = %key, tokens = admission.state.tokens, "Updated bucket");
        Ok(admission)
    }
}
