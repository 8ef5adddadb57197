//! Per-id serialization of workflow advancement

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutexes: at most one writer per workflow id in this process
#[derive(Default)]
pub struct WorkflowLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl WorkflowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the shard guard is dropped before awaiting
        let mutex = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on
    pub fn release_idle(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}
