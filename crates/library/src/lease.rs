use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::absolute_path;

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5);

/// Shared store with expiring keys. `take` must check and delete in one step.
pub trait LeaseStore: Send + Sync + 'static {
    fn set(&self, key: &str, ttl: Duration);
    fn take(&self, key: &str) -> bool;
}

#[derive(Default)]
pub struct MemoryLeaseStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|expires| **expires > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn set(&self, key: &str, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires| *expires > now);
        entries.insert(key.to_string(), now + ttl);
    }

    fn take(&self, key: &str) -> bool {
        match self.entries.lock().remove(key) {
            Some(expires) => expires > Instant::now(),
            None => false,
        }
    }
}

pub fn lease_key(path: &Path) -> String {
    format!("lock:{}", absolute_path(path).display())
}

/// Marks pipeline-initiated writes so the watcher can drop the echo.
///
/// A lease is a hint rather than a lock: `acquire` overwrites any existing
/// marker, and an external edit landing inside the TTL of one of our own
/// writes is swallowed with it.
#[derive(Clone)]
pub struct WriteLeases {
    store: Arc<dyn LeaseStore>,
    ttl: Duration,
}

impl WriteLeases {
    pub fn new(store: Arc<dyn LeaseStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryLeaseStore::new()), ttl)
    }

    pub fn acquire(&self, path: &Path) {
        let key = lease_key(path);
        debug!("Lease {} for {:?}", key, self.ttl);
        self.store.set(&key, self.ttl);
    }

    pub fn consume(&self, path: &Path) -> bool {
        self.store.take(&lease_key(path))
    }
}
