//! In-memory `WorkflowStore` used by unit tests

use super::WorkflowStore;
use crate::error::{RelayerError, RelayerResult};
use crate::workflow::{ContractInvokeRecord, InvokeStatus, SyncRecord, SyncStatus};

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Lease {
    holder: String,
    run_token: String,
    expires_at: Instant,
    completed: bool,
}

#[derive(Default)]
struct Tables {
    invokes: BTreeMap<String, ContractInvokeRecord>,
    syncs: BTreeMap<String, SyncRecord>,
    pending_syncs: BTreeSet<String>,
    checkpoints: HashMap<String, u64>,
    leases: HashMap<String, Lease>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Makes `remove_pending_syncs` fail like an unreachable database
    fail_pending_removal: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn invoke_count(&self) -> usize {
        self.tables.lock().await.invokes.len()
    }

    pub async fn all_invokes(&self) -> Vec<ContractInvokeRecord> {
        self.tables.lock().await.invokes.values().cloned().collect()
    }

    pub fn set_fail_pending_removal(&self, fail: bool) {
        self.fail_pending_removal.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn get_invoke(&self, id: &str) -> RelayerResult<Option<ContractInvokeRecord>> {
        Ok(self.tables.lock().await.invokes.get(id).cloned())
    }

    async fn insert_invoke(&self, record: &ContractInvokeRecord) -> RelayerResult<bool> {
        let mut tables = self.tables.lock().await;
        if tables.invokes.contains_key(&record.id) {
            return Ok(false);
        }
        tables.invokes.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn put_invoke(&self, record: &ContractInvokeRecord) -> RelayerResult<()> {
        self.tables
            .lock()
            .await
            .invokes
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn unfinished_invoke_ids(
        &self,
        max_retry_count: Option<u32>,
    ) -> RelayerResult<Vec<String>> {
        Ok(self
            .tables
            .lock()
            .await
            .invokes
            .values()
            .filter(|r| !r.status.is_terminal())
            .filter(|r| match (r.status, max_retry_count) {
                (InvokeStatus::Failed, Some(max)) => r.retry_count < max,
                _ => true,
            })
            .map(|r| r.id.clone())
            .collect())
    }

    async fn get_sync(&self, id: &str) -> RelayerResult<Option<SyncRecord>> {
        Ok(self.tables.lock().await.syncs.get(id).cloned())
    }

    async fn insert_sync(&self, record: &SyncRecord) -> RelayerResult<bool> {
        let mut tables = self.tables.lock().await;
        if tables.syncs.contains_key(&record.id) {
            return Ok(false);
        }
        tables.syncs.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn put_sync(&self, record: &SyncRecord) -> RelayerResult<()> {
        self.tables
            .lock()
            .await
            .syncs
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn add_pending_syncs(&self, ids: &[String]) -> RelayerResult<()> {
        self.tables
            .lock()
            .await
            .pending_syncs
            .extend(ids.iter().cloned());
        Ok(())
    }

    async fn pending_sync_ids(&self) -> RelayerResult<Vec<String>> {
        Ok(self
            .tables
            .lock()
            .await
            .pending_syncs
            .iter()
            .cloned()
            .collect())
    }

    async fn remove_pending_syncs(&self, ids: &[String]) -> RelayerResult<()> {
        if self.fail_pending_removal.load(Ordering::SeqCst) {
            return Err(RelayerError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut tables = self.tables.lock().await;
        for id in ids {
            tables.pending_syncs.remove(id);
        }
        Ok(())
    }

    async fn get_checkpoint(&self, name: &str) -> RelayerResult<Option<u64>> {
        Ok(self.tables.lock().await.checkpoints.get(name).copied())
    }

    async fn save_checkpoint(&self, name: &str, height: u64) -> RelayerResult<()> {
        self.tables
            .lock()
            .await
            .checkpoints
            .insert(name.to_string(), height);
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        run_token: &str,
    ) -> RelayerResult<Option<String>> {
        let mut tables = self.tables.lock().await;
        let now = Instant::now();
        if let Some(lease) = tables.leases.get_mut(name) {
            if lease.completed || (lease.holder != holder && lease.expires_at > now) {
                return Ok(None);
            }
            lease.holder = holder.to_string();
            lease.expires_at = now + ttl;
            return Ok(Some(lease.run_token.clone()));
        }

        tables.leases.insert(
            name.to_string(),
            Lease {
                holder: holder.to_string(),
                run_token: run_token.to_string(),
                expires_at: now + ttl,
                completed: false,
            },
        );
        Ok(Some(run_token.to_string()))
    }

    async fn release_lease(&self, name: &str, holder: &str, completed: bool) -> RelayerResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(lease) = tables.leases.get_mut(name) {
            if lease.holder == holder {
                lease.expires_at = Instant::now();
                lease.completed = completed;
            }
        }
        Ok(())
    }

    async fn invoke_status_counts(&self) -> RelayerResult<Vec<(InvokeStatus, u64)>> {
        let tables = self.tables.lock().await;
        Ok(InvokeStatus::ALL
            .into_iter()
            .map(|status| {
                let count = tables.invokes.values().filter(|r| r.status == status).count();
                (status, count as u64)
            })
            .collect())
    }

    async fn sync_status_counts(&self) -> RelayerResult<Vec<(SyncStatus, u64)>> {
        let tables = self.tables.lock().await;
        Ok(SyncStatus::SEQUENCE
            .into_iter()
            .chain([SyncStatus::Failed])
            .map(|status| {
                let count = tables.syncs.values().filter(|r| r.status == status).count();
                (status, count as u64)
            })
            .collect())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completed_lease_is_never_reacquired() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lease("job", "a", ttl, "t1").await.unwrap().is_some());
        assert!(store.try_acquire_lease("job", "b", ttl, "t2").await.unwrap().is_none());
        assert!(store.try_acquire_lease("job", "a", ttl, "t3").await.unwrap().is_some());

        store.release_lease("job", "a", true).await.unwrap();
        assert!(store.try_acquire_lease("job", "a", ttl, "t4").await.unwrap().is_none());
        assert!(store.try_acquire_lease("job", "b", ttl, "t5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = MemoryStore::new();
        assert!(store
            .try_acquire_lease("job", "a", Duration::ZERO, "t1")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .try_acquire_lease("job", "b", Duration::from_secs(60), "t2")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_lease_keeps_first_run_token() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        let first = store.try_acquire_lease("job", "a", ttl, "t1").await.unwrap();
        assert_eq!(first.as_deref(), Some("t1"));

        // Resumed by the same holder
        let resumed = store.try_acquire_lease("job", "a", ttl, "t2").await.unwrap();
        assert_eq!(resumed.as_deref(), Some("t1"));

        // Released without completing, then retried by another holder
        store.release_lease("job", "a", false).await.unwrap();
        let retried = store.try_acquire_lease("job", "b", ttl, "t3").await.unwrap();
        assert_eq!(retried.as_deref(), Some("t1"));
    }
}
