//! Contract-invoke workflow: one opaque contract call driven from
//! `ToBeCreated` through `Pending` to `Success`
//!
//! ```text
//! ToBeCreated --submit--> Pending --mined--> Success
//!      ^                     |
//!      +---retry--- Failed <-+ (any definitive non-mined result)
//! ```
//!
//! A failed attempt waits one tick in `Failed` before it is resubmitted, and
//! every resubmission builds a fresh transaction against a new ref block.

use super::{AdvanceOutcome, ContractInvokeRecord, ContractInvokeRequest, InvokeStatus};
use crate::chain::ChainManager;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{EventBus, WorkflowEvent};
use crate::state::{WorkflowLocks, WorkflowStore};
use crate::tx::TransactionSender;

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ContractInvoker {
    store: Arc<dyn WorkflowStore>,
    locks: Arc<WorkflowLocks>,
    chain_manager: Arc<ChainManager>,
    tx_sender: Arc<TransactionSender>,
    events: EventBus,
    max_retry_count: Option<u32>,
}

impl ContractInvoker {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        locks: Arc<WorkflowLocks>,
        chain_manager: Arc<ChainManager>,
        tx_sender: Arc<TransactionSender>,
        events: EventBus,
        max_retry_count: Option<u32>,
    ) -> Self {
        Self {
            store,
            locks,
            chain_manager,
            tx_sender,
            events,
            max_retry_count,
        }
    }

    /// Start a workflow for `request.biz_id`, or return the one that already exists
    pub async fn create(&self, request: ContractInvokeRequest) -> RelayerResult<ContractInvokeRecord> {
        if request.biz_id.trim().is_empty() {
            return Err(RelayerError::InvalidInput(
                "business id must not be empty".to_string(),
            ));
        }
        if hex::decode(&request.param).is_err() {
            return Err(RelayerError::InvalidInput(format!(
                "param of {} is not hex encoded",
                request.biz_id
            )));
        }

        let _guard = self.locks.lock(&request.biz_id).await;

        if let Some(existing) = self.store.get_invoke(&request.biz_id).await? {
            debug!(
                "Workflow {} already exists in status {}",
                existing.id, existing.status
            );
            return Ok(existing);
        }

        let now = Utc::now();
        let record = ContractInvokeRecord {
            id: request.biz_id,
            chain_id: request.chain_id,
            contract_address: request.contract_address,
            contract_method: request.contract_method,
            biz_type: request.biz_type,
            param: request.param,
            sender: None,
            transaction_id: None,
            status: InvokeStatus::ToBeCreated,
            retry_count: 0,
            message: None,
            block_height: None,
            create_time: now,
            update_time: now,
        };

        if !self.store.insert_invoke(&record).await? {
            // Another process created it between our read and insert
            return self
                .store
                .get_invoke(&record.id)
                .await?
                .ok_or(RelayerError::WorkflowNotFound { id: record.id });
        }

        info!(
            "Created workflow {} ({} {}.{} on chain {})",
            record.id, record.biz_type, record.contract_address, record.contract_method, record.chain_id
        );
        self.events.publish(WorkflowEvent::InvokeCreated {
            record: record.clone(),
        });

        Ok(record)
    }

    pub async fn get(&self, id: &str) -> RelayerResult<Option<ContractInvokeRecord>> {
        self.store.get_invoke(id).await
    }

    /// Apply at most one transition to the persisted record. On error nothing
    /// is written and the workflow is retried on the next tick.
    pub async fn advance(&self, id: &str) -> RelayerResult<AdvanceOutcome<InvokeStatus>> {
        let _guard = self.locks.lock(id).await;

        let mut record = self
            .store
            .get_invoke(id)
            .await?
            .ok_or_else(|| RelayerError::WorkflowNotFound { id: id.to_string() })?;
        let from = record.status;

        match record.status {
            InvokeStatus::ToBeCreated => self.submit(&mut record).await?,
            InvokeStatus::Pending => self.confirm(&mut record).await?,
            InvokeStatus::Failed => self.retry(&mut record),
            InvokeStatus::Success => {}
        }

        if record.status == from {
            return Ok(AdvanceOutcome::unchanged(from));
        }

        record.update_time = Utc::now();
        self.store.put_invoke(&record).await?;

        info!("Workflow {}: {} -> {}", record.id, from, record.status);
        self.events.publish(WorkflowEvent::InvokeStatusChanged {
            id: record.id.clone(),
            chain_id: record.chain_id.clone(),
            from,
            to: record.status,
            transaction_id: record.transaction_id.clone(),
        });

        Ok(AdvanceOutcome {
            from,
            to: record.status,
        })
    }

    async fn submit(&self, record: &mut ContractInvokeRecord) -> RelayerResult<()> {
        // Validate the chain before touching the network
        self.chain_manager.config(&record.chain_id)?;

        let params = hex::decode(&record.param).map_err(|e| {
            RelayerError::InvalidInput(format!("param of {} is not hex: {}", record.id, e))
        })?;

        let sent = self
            .tx_sender
            .send(
                &record.chain_id,
                &record.contract_address,
                &record.contract_method,
                &params,
            )
            .await?;

        record.sender = Some(sent.from);
        record.transaction_id = Some(sent.transaction_id);
        record.message = None;
        record.status = InvokeStatus::Pending;
        Ok(())
    }

    async fn confirm(&self, record: &mut ContractInvokeRecord) -> RelayerResult<()> {
        let transaction_id = record.transaction_id.clone().ok_or_else(|| {
            RelayerError::Internal(format!("Pending workflow {} has no transaction id", record.id))
        })?;

        let client = self.chain_manager.client(&record.chain_id)?;
        let result = client.transaction_result(&transaction_id).await?;

        if result.status.is_mined() {
            record.block_height = Some(result.block_number);
            record.status = InvokeStatus::Success;
        } else if result.status.is_pending() {
            debug!("Workflow {}: transaction {} still pending", record.id, transaction_id);
        } else {
            let message = result
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| result.status.to_string());
            warn!(
                "Workflow {}: transaction {} failed with {}: {}",
                record.id, transaction_id, result.status, message
            );
            record.message = Some(message);
            record.status = InvokeStatus::Failed;
        }

        Ok(())
    }

    fn retry(&self, record: &mut ContractInvokeRecord) {
        if let Some(max) = self.max_retry_count {
            if record.retry_count >= max {
                warn!(
                    "Workflow {} exhausted {} retries, leaving it Failed: {}",
                    record.id,
                    max,
                    record.message.as_deref().unwrap_or_default()
                );
                crate::metrics::record_retries_exhausted(&record.chain_id);
                return;
            }
        }

        record.retry_count += 1;
        record.status = InvokeStatus::ToBeCreated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{test_chain_config, MockChainClient, TransactionResult, TxStatus};
    use crate::state::MemoryStore;
    use crate::tx::signer::tests::{chain_status, test_signer};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Harness {
        invoker: ContractInvoker,
        store: Arc<MemoryStore>,
        events: EventBus,
        submissions: Arc<AtomicUsize>,
    }

    fn result(status: &str, height: u64, error: Option<&str>) -> TransactionResult {
        TransactionResult {
            transaction_id: String::new(),
            status: TxStatus::from(status.to_string()),
            block_number: height,
            error: error.map(str::to_string),
            logs: Vec::new(),
        }
    }

    /// Chain "X" that hands out tx-1, tx-2, ... and answers result queries from `results`
    fn harness(results: Vec<TransactionResult>, max_retry_count: Option<u32>) -> Harness {
        let submissions = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(VecDeque::from(results)));

        let mut client = MockChainClient::new();
        client
            .expect_chain_status()
            .returning(|| Ok(chain_status(100)));
        {
            let submissions = submissions.clone();
            client.expect_send_raw_transaction().returning(move |_| {
                let n = submissions.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("tx-{}", n))
            });
        }
        client
            .expect_transaction_result()
            .returning(move |_| Ok(results.lock().unwrap().pop_front().expect("scripted result")));

        let chains = Arc::new(ChainManager::empty());
        chains.register(
            test_chain_config("X", &[("points", "PointsContract")]),
            Arc::new(client),
        );

        let store = Arc::new(MemoryStore::new());
        let events = EventBus::new(64);
        let sender = Arc::new(TransactionSender::new(
            chains.clone(),
            Arc::new(test_signer(&["X"])),
        ));
        let invoker = ContractInvoker::new(
            store.clone(),
            Arc::new(WorkflowLocks::new()),
            chains,
            sender,
            events.clone(),
            max_retry_count,
        );

        Harness {
            invoker,
            store,
            events,
            submissions,
        }
    }

    fn request(biz_id: &str) -> ContractInvokeRequest {
        ContractInvokeRequest {
            biz_id: biz_id.to_string(),
            chain_id: "X".to_string(),
            contract_address: "PointsContract".to_string(),
            contract_method: "BatchSettle".to_string(),
            biz_type: "points-settle".to_string(),
            param: hex::encode(b"P"),
        }
    }

    #[tokio::test]
    async fn test_submit_then_confirm() {
        let h = harness(
            vec![result("PENDING", 0, None), result("MINED", 100, None)],
            None,
        );
        h.invoker.create(request("B1")).await.unwrap();

        let outcome = h.invoker.advance("B1").await.unwrap();
        assert_eq!(outcome.from, InvokeStatus::ToBeCreated);
        assert_eq!(outcome.to, InvokeStatus::Pending);
        let record = h.invoker.get("B1").await.unwrap().unwrap();
        assert_eq!(record.transaction_id.as_deref(), Some("tx-1"));
        assert!(record.sender.is_some());
        assert_eq!(record.retry_count, 0);

        let outcome = h.invoker.advance("B1").await.unwrap();
        assert!(!outcome.changed());
        assert_eq!(outcome.to, InvokeStatus::Pending);

        let outcome = h.invoker.advance("B1").await.unwrap();
        assert_eq!(outcome.to, InvokeStatus::Success);
        let record = h.invoker.get("B1").await.unwrap().unwrap();
        assert_eq!(record.block_height, Some(100));

        // Success is a no-op
        let outcome = h.invoker.advance("B1").await.unwrap();
        assert!(!outcome.changed());
        assert_eq!(h.submissions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_transaction_is_retried_with_a_new_one() {
        let h = harness(
            vec![
                result("NODE_NOT_FOUND", 0, Some("transaction not found")),
                result("MINED", 130, None),
            ],
            None,
        );
        h.invoker.create(request("B1")).await.unwrap();

        assert_eq!(h.invoker.advance("B1").await.unwrap().to, InvokeStatus::Pending);
        assert_eq!(h.invoker.advance("B1").await.unwrap().to, InvokeStatus::Failed);
        let record = h.invoker.get("B1").await.unwrap().unwrap();
        assert_eq!(record.message.as_deref(), Some("transaction not found"));

        // One tick of cooldown in Failed, then back to ToBeCreated
        assert_eq!(h.invoker.advance("B1").await.unwrap().to, InvokeStatus::ToBeCreated);
        let record = h.invoker.get("B1").await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.transaction_id.as_deref(), Some("tx-1"));

        assert_eq!(h.invoker.advance("B1").await.unwrap().to, InvokeStatus::Pending);
        let record = h.invoker.get("B1").await.unwrap().unwrap();
        assert_eq!(record.transaction_id.as_deref(), Some("tx-2"));
        assert_eq!(record.message, None);

        assert_eq!(h.invoker.advance("B1").await.unwrap().to, InvokeStatus::Success);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let h = harness(Vec::new(), None);
        let mut rx = h.events.subscribe();

        let first = h.invoker.create(request("B1")).await.unwrap();
        let mut again = request("B1");
        again.param = hex::encode(b"different");
        let second = h.invoker.create(again).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.store.invoke_count().await, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "InvokeCreated");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_creates_yield_one_record() {
        let h = harness(Vec::new(), None);
        let mut rx = h.events.subscribe();
        let invoker = Arc::new(h.invoker);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let invoker = invoker.clone();
                tokio::spawn(async move {
                    let mut req = request("B1");
                    req.param = hex::encode(format!("param-{}", i));
                    invoker.create(req).await
                })
            })
            .collect();

        let records: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(h.store.invoke_count().await, 1);
        let stored = h.store.get_invoke("B1").await.unwrap().unwrap();
        for record in &records {
            assert_eq!(record.create_time, stored.create_time);
            assert_eq!(record.param, stored.param);
        }

        assert_eq!(rx.recv().await.unwrap().name(), "InvokeCreated");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_after_progress_does_not_reset() {
        let h = harness(Vec::new(), None);
        h.invoker.create(request("B1")).await.unwrap();
        h.invoker.advance("B1").await.unwrap();

        let record = h.invoker.create(request("B1")).await.unwrap();
        assert_eq!(record.status, InvokeStatus::Pending);
        assert_eq!(record.transaction_id.as_deref(), Some("tx-1"));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let h = harness(Vec::new(), None);

        let err = h.invoker.create(request("  ")).await.unwrap_err();
        assert!(matches!(err, RelayerError::InvalidInput(_)));

        let mut bad = request("B2");
        bad.param = "not-hex".to_string();
        let err = h.invoker.create(bad).await.unwrap_err();
        assert!(matches!(err, RelayerError::InvalidInput(_)));

        assert_eq!(h.store.invoke_count().await, 0);
    }

    #[tokio::test]
    async fn test_rpc_failure_leaves_state_untouched() {
        let mut client = MockChainClient::new();
        client.expect_chain_status().returning(|| {
            Err(RelayerError::ChainConnection {
                chain_id: "X".to_string(),
                message: "connection refused".to_string(),
            })
        });
        client.expect_send_raw_transaction().never();

        let chains = Arc::new(ChainManager::empty());
        chains.register(test_chain_config("X", &[]), Arc::new(client));
        let store = Arc::new(MemoryStore::new());
        let invoker = ContractInvoker::new(
            store.clone(),
            Arc::new(WorkflowLocks::new()),
            chains.clone(),
            Arc::new(TransactionSender::new(chains, Arc::new(test_signer(&["X"])))),
            EventBus::new(8),
            None,
        );

        let created = invoker.create(request("B1")).await.unwrap();
        let err = invoker.advance("B1").await.unwrap_err();
        assert!(err.is_retryable());

        let record = invoker.get("B1").await.unwrap().unwrap();
        assert_eq!(record, created);
    }

    #[tokio::test]
    async fn test_unknown_chain_is_not_submitted() {
        let h = harness(Vec::new(), None);
        let mut req = request("B1");
        req.chain_id = "Y".to_string();
        h.invoker.create(req).await.unwrap();

        let err = h.invoker.advance("B1").await.unwrap_err();
        assert!(matches!(err, RelayerError::ChainNotFound { .. }));
        assert_eq!(
            h.invoker.get("B1").await.unwrap().unwrap().status,
            InvokeStatus::ToBeCreated
        );
        assert_eq!(h.submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_advance_unknown_id() {
        let h = harness(Vec::new(), None);
        let err = h.invoker.advance("missing").await.unwrap_err();
        assert!(matches!(err, RelayerError::WorkflowNotFound { .. }));
    }

    #[tokio::test]
    async fn test_retry_cutoff_keeps_workflow_failed() {
        let h = harness(
            vec![result("FAILED", 0, Some("boom")), result("FAILED", 0, Some("boom"))],
            Some(1),
        );
        h.invoker.create(request("B1")).await.unwrap();

        for expected in [
            InvokeStatus::Pending,
            InvokeStatus::Failed,
            InvokeStatus::ToBeCreated,
            InvokeStatus::Pending,
            InvokeStatus::Failed,
        ] {
            assert_eq!(h.invoker.advance("B1").await.unwrap().to, expected);
        }

        let outcome = h.invoker.advance("B1").await.unwrap();
        assert!(!outcome.changed());
        assert_eq!(outcome.to, InvokeStatus::Failed);
        assert!(h.store.unfinished_invoke_ids(Some(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_only_moves_along_allowed_edges() {
        let script = vec![
            result("PENDING", 0, None),
            result("FAILED", 0, None),
            result("PENDING_VALIDATION", 0, None),
            result("NOTEXISTED", 0, None),
            result("PENDING", 0, None),
            result("MINED", 77, None),
        ];
        let h = harness(script, None);
        h.invoker.create(request("B1")).await.unwrap();

        let allowed = |from: InvokeStatus, to: InvokeStatus| {
            from == to
                || matches!(
                    (from, to),
                    (InvokeStatus::ToBeCreated, InvokeStatus::Pending)
                        | (InvokeStatus::Pending, InvokeStatus::Success)
                        | (InvokeStatus::Pending, InvokeStatus::Failed)
                        | (InvokeStatus::Failed, InvokeStatus::ToBeCreated)
                )
        };

        let mut last_retry = 0;
        for _ in 0..20 {
            let outcome = h.invoker.advance("B1").await.unwrap();
            assert!(allowed(outcome.from, outcome.to), "{:?}", outcome);

            let record = h.invoker.get("B1").await.unwrap().unwrap();
            assert!(record.retry_count >= last_retry);
            last_retry = record.retry_count;

            if record.status == InvokeStatus::Success {
                break;
            }
        }

        let record = h.invoker.get("B1").await.unwrap().unwrap();
        assert_eq!(record.status, InvokeStatus::Success);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.block_height, Some(77));
    }
}
