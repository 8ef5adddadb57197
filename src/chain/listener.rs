//! Token-created event scanner feeding token sync discovery

use crate::error::RelayerResult;
use crate::state::WorkflowStore;
use crate::workflow::TokenSyncer;

use super::ChainManager;

use std::sync::Arc;
use tracing::{debug, info};

/// Scans the source chain for confirmed `TokenCreated` events behind a
/// persisted, strictly increasing height watermark
pub struct TokenCreatedListener {
    /// Chain manager
    chain_manager: Arc<ChainManager>,
    /// Store holding the watermark checkpoint
    store: Arc<dyn WorkflowStore>,
    /// Creates sync workflows for discovered events
    syncer: Arc<TokenSyncer>,
    /// First height scanned when no watermark exists
    start_height: u64,
    /// Maximum heights scanned per call
    search_window: u64,
}

impl TokenCreatedListener {
    pub fn new(
        chain_manager: Arc<ChainManager>,
        store: Arc<dyn WorkflowStore>,
        syncer: Arc<TokenSyncer>,
        start_height: u64,
        search_window: u64,
    ) -> Self {
        Self {
            chain_manager,
            store,
            syncer,
            start_height,
            search_window: search_window.max(1),
        }
    }

    fn checkpoint_name(&self) -> String {
        format!("token_created:{}", self.syncer.source_chain_id())
    }

    /// Scan one window of irreversible blocks, create a sync workflow per
    /// event and advance the watermark. Returns the number of events found.
    pub async fn scan_once(&self) -> RelayerResult<usize> {
        let chain_id = self.syncer.source_chain_id();
        let provider = self.chain_manager.client(chain_id)?;
        let checkpoint = self.checkpoint_name();

        let from_block = match self.store.get_checkpoint(&checkpoint).await? {
            Some(last) => last + 1,
            None => self.start_height,
        };

        // Only confirmed blocks are scanned
        let confirmed = provider.chain_status().await?.last_irreversible_block_height;
        if from_block > confirmed {
            debug!(
                "Chain {}: nothing to scan (next {}, irreversible {})",
                chain_id, from_block, confirmed
            );
            return Ok(0);
        }

        let to_block = std::cmp::min(confirmed, from_block + self.search_window - 1);

        debug!(
            "Chain {}: scanning blocks {} to {} for token creations",
            chain_id, from_block, to_block
        );

        let events = provider.token_created_events(from_block, to_block).await?;
        for event in &events {
            // A failure here keeps the watermark so the window is rescanned;
            // create is idempotent for events already handled
            self.syncer.create(&event.transaction_id).await?;
            info!(
                "Chain {}: token {} created in {} at {}",
                chain_id, event.symbol, event.transaction_id, event.block_height
            );
        }

        self.store.save_checkpoint(&checkpoint, to_block).await?;
        crate::metrics::record_scan_watermark(chain_id, to_block);

        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{test_chain_config, MockChainClient, TokenCreatedEvent};
    use crate::config::TokenSyncConfig;
    use crate::error::RelayerError;
    use crate::events::EventBus;
    use crate::state::{MemoryStore, WorkflowLocks};
    use crate::tx::signer::tests::{chain_status, test_signer};
    use crate::tx::TransactionSender;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;
    use tokio_test::assert_err;

    struct Harness {
        listener: TokenCreatedListener,
        store: Arc<MemoryStore>,
        lib: Arc<AtomicU64>,
        scanned: Arc<Mutex<Vec<(u64, u64)>>>,
        failing: Arc<AtomicBool>,
    }

    /// Source chain tDVV with token creations at heights 5, 18 and 33
    fn harness(start_height: u64, window: u64) -> Harness {
        let lib = Arc::new(AtomicU64::new(50));
        let scanned = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(AtomicBool::new(false));

        let mut client = MockChainClient::new();
        {
            let lib = lib.clone();
            client
                .expect_chain_status()
                .returning(move || Ok(chain_status(lib.load(Ordering::SeqCst))));
        }
        {
            let scanned = scanned.clone();
            let failing = failing.clone();
            client.expect_token_created_events().returning(move |from, to| {
                if failing.load(Ordering::SeqCst) {
                    return Err(RelayerError::Timeout {
                        operation: "token_getTokenCreatedEvents".to_string(),
                    });
                }
                scanned.lock().unwrap().push((from, to));
                Ok([5u64, 18, 33]
                    .into_iter()
                    .filter(|h| (from..=to).contains(h))
                    .map(|h| TokenCreatedEvent {
                        transaction_id: format!("create-{}", h),
                        symbol: format!("SGR-{}", h),
                        block_height: h,
                    })
                    .collect())
            });
        }

        let chains = Arc::new(ChainManager::empty());
        chains.register(test_chain_config("tDVV", &[]), Arc::new(client));

        let store = Arc::new(MemoryStore::new());
        let config = TokenSyncConfig {
            enabled: true,
            source_chain_id: "tDVV".to_string(),
            target_chain_id: "AELF".to_string(),
            start_height,
            search_window: window,
        };
        let syncer = Arc::new(TokenSyncer::new(
            store.clone(),
            Arc::new(WorkflowLocks::new()),
            chains.clone(),
            Arc::new(TransactionSender::new(chains.clone(), Arc::new(test_signer(&["tDVV"])))),
            EventBus::new(16),
            &config,
        ));

        Harness {
            listener: TokenCreatedListener::new(chains, store.clone(), syncer, start_height, window),
            store,
            lib,
            scanned,
            failing,
        }
    }

    #[tokio::test]
    async fn test_scans_in_windows_up_to_irreversible_height() {
        let h = harness(1, 20);

        assert_eq!(h.listener.scan_once().await.unwrap(), 2);
        assert_eq!(h.listener.scan_once().await.unwrap(), 1);
        assert_eq!(h.listener.scan_once().await.unwrap(), 0);
        // Caught up with the irreversible block
        assert_eq!(h.listener.scan_once().await.unwrap(), 0);

        assert_eq!(
            *h.scanned.lock().unwrap(),
            vec![(1, 20), (21, 40), (41, 50)]
        );
        assert_eq!(
            h.store.get_checkpoint("token_created:tDVV").await.unwrap(),
            Some(50)
        );

        let mut pending = h.store.pending_sync_ids().await.unwrap();
        pending.sort();
        assert_eq!(pending, vec!["create-18", "create-33", "create-5"]);

        h.lib.store(60, Ordering::SeqCst);
        h.listener.scan_once().await.unwrap();
        assert_eq!(h.scanned.lock().unwrap().last(), Some(&(51, 60)));
    }

    #[tokio::test]
    async fn test_failed_search_keeps_watermark() {
        let h = harness(10, 100);
        h.failing.store(true, Ordering::SeqCst);

        let err = assert_err!(h.listener.scan_once().await);
        assert!(err.is_retryable());
        assert_eq!(h.store.get_checkpoint("token_created:tDVV").await.unwrap(), None);

        h.failing.store(false, Ordering::SeqCst);
        assert_eq!(h.listener.scan_once().await.unwrap(), 2);
        assert_eq!(*h.scanned.lock().unwrap(), vec![(10, 50)]);
    }

    #[tokio::test]
    async fn test_rescan_does_not_duplicate_workflows() {
        let h = harness(1, 100);
        h.listener.scan_once().await.unwrap();

        // Watermark lost, same window again
        h.store.save_checkpoint("token_created:tDVV", 0).await.unwrap();
        h.listener.scan_once().await.unwrap();

        assert_eq!(h.store.pending_sync_ids().await.unwrap().len(), 3);
    }
}
