//! Storage of values other nodes asked us to keep.

use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

use crate::common::{Contact, Id};

/// Default maximum number of stored values.
pub const MAX_VALUES: usize = 1000;
/// Default time a value is kept after it was last stored.
pub const DEFAULT_VALUE_TTL: Duration = Duration::from_secs(60 * 60);

/// Key -> value storage backing the STORE and FIND_VALUE handlers.
///
/// Called from the node's actor thread, so implementations should not block, and must
/// never wait on an [OperationHandle](crate::OperationHandle) of the same node.
pub trait ValueStore: Send + Sync + Debug {
    fn get(&self, key: &Id) -> Option<Box<[u8]>>;

    /// Returns `false` if the value was refused.
    fn store(&self, sender: &Contact, key: Id, value: Box<[u8]>) -> bool;

    fn keys(&self) -> Vec<Id>;

    /// Drop expired values, returns how many were dropped.
    fn expire(&self, now: Instant) -> usize;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Box<[u8]>,
    stored_at: Instant,
}

/// In-memory [ValueStore] evicting the least recently used value when full, and values
/// not refreshed within their time to live.
#[derive(Debug)]
pub struct MemoryValueStore {
    values: Mutex<LruCache<Id, StoredValue>>,
    ttl: Duration,
}

impl Default for MemoryValueStore {
    fn default() -> Self {
        Self::new(MAX_VALUES, DEFAULT_VALUE_TTL)
    }
}

impl MemoryValueStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        MemoryValueStore {
            values: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }

    fn values(&self) -> MutexGuard<'_, LruCache<Id, StoredValue>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_at(&self, key: &Id, now: Instant) -> Option<Box<[u8]>> {
        let mut values = self.values();
        let stored = values.get(key)?;

        if now.saturating_duration_since(stored.stored_at) < self.ttl {
            return Some(stored.value.clone());
        }

        // Expired but not swept yet.
        values.pop(key);
        None
    }

    fn store_at(&self, key: Id, value: Box<[u8]>, now: Instant) {
        self.values().put(
            key,
            StoredValue {
                value,
                stored_at: now,
            },
        );
    }
}

impl ValueStore for MemoryValueStore {
    fn get(&self, key: &Id) -> Option<Box<[u8]>> {
        self.get_at(key, Instant::now())
    }

    fn store(&self, sender: &Contact, key: Id, value: Box<[u8]>) -> bool {
        trace!(?key, from = ?sender.address(), size = value.len(), "Storing value");

        self.store_at(key, value, Instant::now());

        true
    }

    fn keys(&self) -> Vec<Id> {
        self.values().iter().map(|(key, _)| *key).collect()
    }

    fn expire(&self, now: Instant) -> usize {
        let mut values = self.values();

        let expired: Vec<Id> = values
            .iter()
            .filter(|(_, stored)| now.saturating_duration_since(stored.stored_at) >= self.ttl)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            values.pop(key);
        }

        expired.len()
    }
}
