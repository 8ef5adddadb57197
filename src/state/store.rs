//! Persistence seam for workflow records, the pending sync set, scan
//! checkpoints and job leases

use crate::error::RelayerResult;
use crate::workflow::{ContractInvokeRecord, InvokeStatus, SyncRecord, SyncStatus};

use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_invoke(&self, id: &str) -> RelayerResult<Option<ContractInvokeRecord>>;

    /// Insert unless a record with the same id exists; `true` when inserted
    async fn insert_invoke(&self, record: &ContractInvokeRecord) -> RelayerResult<bool>;

    /// Full replace of an existing record
    async fn put_invoke(&self, record: &ContractInvokeRecord) -> RelayerResult<()>;

    /// Ids of records that still need advancing. Failed records that used up
    /// `max_retry_count` retries are left out.
    async fn unfinished_invoke_ids(&self, max_retry_count: Option<u32>)
        -> RelayerResult<Vec<String>>;

    async fn get_sync(&self, id: &str) -> RelayerResult<Option<SyncRecord>>;

    async fn insert_sync(&self, record: &SyncRecord) -> RelayerResult<bool>;

    async fn put_sync(&self, record: &SyncRecord) -> RelayerResult<()>;

    async fn add_pending_syncs(&self, ids: &[String]) -> RelayerResult<()>;

    async fn pending_sync_ids(&self) -> RelayerResult<Vec<String>>;

    async fn remove_pending_syncs(&self, ids: &[String]) -> RelayerResult<()>;

    async fn get_checkpoint(&self, name: &str) -> RelayerResult<Option<u64>>;

    async fn save_checkpoint(&self, name: &str, height: u64) -> RelayerResult<()>;

    /// Take the named lease for `ttl`. Succeeds when the lease is free, expired
    /// or already held by `holder`; never succeeds once a lease was completed.
    ///
    /// Returns the lease's run token. `run_token` is stored only when the
    /// lease row is first created, so every later holder gets the original.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        run_token: &str,
    ) -> RelayerResult<Option<String>>;

    async fn release_lease(&self, name: &str, holder: &str, completed: bool) -> RelayerResult<()>;

    async fn invoke_status_counts(&self) -> RelayerResult<Vec<(InvokeStatus, u64)>>;

    async fn sync_status_counts(&self) -> RelayerResult<Vec<(SyncStatus, u64)>>;

    async fn health_check(&self) -> RelayerResult<()>;
}
