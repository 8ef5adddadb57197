//! Token sync workflow: registers a token created on the source chain on the
//! target chain
//!
//! Each step waits on cross-chain indexing progress that cannot be awaited
//! inline, so a step whose precondition is not met yet stalls and is retried
//! on the next tick. Only definitive transaction failures move to `Failed`.

use super::{AdvanceOutcome, SyncRecord, SyncStatus};
use crate::chain::{ChainClient, ChainManager, MerklePath, TransactionResult};
use crate::config::TokenSyncConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{EventBus, WorkflowEvent};
use crate::state::{WorkflowLocks, WorkflowStore};
use crate::tx::TransactionSender;

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Contract role, in chain config, of the token contract
pub const TOKEN_CONTRACT: &str = "token";

const TOKEN_CREATED_EVENT: &str = "TokenCreated";
const VALIDATE_TOKEN_METHOD: &str = "ValidateTokenInfoExists";
const CROSS_CHAIN_CREATE_METHOD: &str = "CrossChainCreateToken";

/// Input of the target chain's cross-chain token creation
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CrossChainCreateTokenInput<'a> {
    from_chain_id: &'a str,
    parent_chain_height: u64,
    /// Signed validation transaction, hex encoded
    transaction_bytes: &'a str,
    merkle_path: MerklePath,
}

/// What to do with a polled transaction
enum Polled {
    Mined(u64),
    Pending,
    Failed(String),
}

impl From<TransactionResult> for Polled {
    fn from(result: TransactionResult) -> Self {
        if result.status.is_mined() {
            Polled::Mined(result.block_number)
        } else if result.status.is_pending() {
            Polled::Pending
        } else {
            let message = result
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| result.status.to_string());
            Polled::Failed(message)
        }
    }
}

pub struct TokenSyncer {
    store: Arc<dyn WorkflowStore>,
    locks: Arc<WorkflowLocks>,
    chain_manager: Arc<ChainManager>,
    tx_sender: Arc<TransactionSender>,
    events: EventBus,
    source_chain_id: String,
    target_chain_id: String,
}

impl TokenSyncer {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        locks: Arc<WorkflowLocks>,
        chain_manager: Arc<ChainManager>,
        tx_sender: Arc<TransactionSender>,
        events: EventBus,
        config: &TokenSyncConfig,
    ) -> Self {
        Self {
            store,
            locks,
            chain_manager,
            tx_sender,
            events,
            source_chain_id: config.source_chain_id.clone(),
            target_chain_id: config.target_chain_id.clone(),
        }
    }

    pub fn source_chain_id(&self) -> &str {
        &self.source_chain_id
    }

    /// Start syncing the token created by `source_tx_id` and mark it pending.
    /// Re-discovering a known transaction returns the existing record.
    pub async fn create(&self, source_tx_id: &str) -> RelayerResult<SyncRecord> {
        if source_tx_id.trim().is_empty() {
            return Err(RelayerError::InvalidInput(
                "source transaction id must not be empty".to_string(),
            ));
        }

        let _guard = self.locks.lock(source_tx_id).await;

        let existing = match self.store.get_sync(source_tx_id).await? {
            Some(existing) => Some(existing),
            None => {
                let record = SyncRecord::new(source_tx_id);
                if self.store.insert_sync(&record).await? {
                    self.store.add_pending_syncs(&[record.id.clone()]).await?;

                    info!("Created token sync {}", record.id);
                    self.events.publish(WorkflowEvent::SyncCreated {
                        id: record.id.clone(),
                    });
                    return Ok(record);
                }
                self.store.get_sync(source_tx_id).await?
            }
        };

        let existing = existing.ok_or_else(|| RelayerError::WorkflowNotFound {
            id: source_tx_id.to_string(),
        })?;
        debug!("Token sync {} already exists in {}", existing.id, existing.status);

        // Re-mark unfinished work in case an earlier pending write was lost
        if !existing.status.is_terminal() {
            self.store.add_pending_syncs(&[existing.id.clone()]).await?;
        }
        Ok(existing)
    }

    pub async fn get(&self, id: &str) -> RelayerResult<Option<SyncRecord>> {
        self.store.get_sync(id).await
    }

    /// Apply at most one step. Errors leave the persisted record untouched.
    pub async fn advance(&self, id: &str) -> RelayerResult<AdvanceOutcome<SyncStatus>> {
        let _guard = self.locks.lock(id).await;

        let mut record = self
            .store
            .get_sync(id)
            .await?
            .ok_or_else(|| RelayerError::WorkflowNotFound { id: id.to_string() })?;
        let from = record.status;

        match record.status {
            SyncStatus::Initial => self.validate_token(&mut record).await?,
            SyncStatus::TokenValidating => self.confirm_validation(&mut record).await?,
            SyncStatus::WaitingIndexing => self.wait_target_indexing(&mut record).await?,
            SyncStatus::WaitingSideIndexing => self.create_on_target(&mut record).await?,
            SyncStatus::CrossChainTokenCreating => self.confirm_creation(&mut record).await?,
            SyncStatus::CrossChainTokenCreated | SyncStatus::Failed => {}
        }

        if record.status == from {
            return Ok(AdvanceOutcome::unchanged(from));
        }
        if record.status != SyncStatus::Failed && record.status.position() < from.position() {
            return Err(RelayerError::InvalidStateTransition {
                from: from.to_string(),
                to: record.status.to_string(),
            });
        }

        record.update_time = Utc::now();
        self.store.put_sync(&record).await?;

        info!(
            "Token sync {} ({}): {} -> {}",
            record.id,
            record.symbol.as_deref().unwrap_or("?"),
            from,
            record.status
        );
        self.events.publish(WorkflowEvent::SyncStatusChanged {
            id: record.id.clone(),
            symbol: record.symbol.clone(),
            from,
            to: record.status,
        });

        Ok(AdvanceOutcome {
            from,
            to: record.status,
        })
    }

    fn source(&self) -> RelayerResult<Arc<dyn ChainClient>> {
        self.chain_manager.client(&self.source_chain_id)
    }

    fn target(&self) -> RelayerResult<Arc<dyn ChainClient>> {
        self.chain_manager.client(&self.target_chain_id)
    }

    fn fail(record: &mut SyncRecord, message: String) {
        warn!("Token sync {} failed in {}: {}", record.id, record.status, message);
        record.message = Some(message);
        record.status = SyncStatus::Failed;
    }

    async fn validate_token(&self, record: &mut SyncRecord) -> RelayerResult<()> {
        let source = self.source()?;

        let created = source.transaction_result(&record.id).await?;
        if !created.status.is_mined() {
            match Polled::from(created) {
                Polled::Failed(message) => {
                    Self::fail(record, format!("source transaction: {}", message))
                }
                _ => debug!("Token sync {}: source transaction not mined yet", record.id),
            }
            return Ok(());
        }

        let symbol = created
            .find_log(TOKEN_CREATED_EVENT)
            .and_then(|log| log.fields.get("symbol"))
            .and_then(|s| s.as_str())
            .map(str::to_string);
        let Some(symbol) = symbol else {
            Self::fail(record, format!("no {} event in source transaction", TOKEN_CREATED_EVENT));
            return Ok(());
        };
        record.symbol = Some(symbol.clone());

        let Some(token_info) = source.token_info(&symbol).await? else {
            Self::fail(record, format!("token {} not found on {}", symbol, self.source_chain_id));
            return Ok(());
        };

        if self.target()?.token_info(&symbol).await?.is_some() {
            info!(
                "Token sync {}: {} already registered on {}",
                record.id, symbol, self.target_chain_id
            );
            record.status = SyncStatus::CrossChainTokenCreated;
            return Ok(());
        }

        let contract = self
            .chain_manager
            .contract_address(&self.source_chain_id, TOKEN_CONTRACT)?;
        let params = serde_json::to_vec(&token_info)?;
        let sent = self
            .tx_sender
            .send(&self.source_chain_id, &contract, VALIDATE_TOKEN_METHOD, &params)
            .await?;

        record.validate_token_tx = Some(sent.raw_transaction);
        record.validate_token_tx_id = Some(sent.transaction_id);
        record.status = SyncStatus::TokenValidating;
        Ok(())
    }

    async fn confirm_validation(&self, record: &mut SyncRecord) -> RelayerResult<()> {
        let tx_id = Self::required(record, record.validate_token_tx_id.clone(), "validate_token_tx_id")?;

        match Polled::from(self.source()?.transaction_result(&tx_id).await?) {
            Polled::Mined(height) => {
                record.validate_token_height = Some(height);
                record.status = SyncStatus::WaitingIndexing;
            }
            Polled::Pending => debug!("Token sync {}: validation {} pending", record.id, tx_id),
            Polled::Failed(message) => Self::fail(record, format!("validation: {}", message)),
        }
        Ok(())
    }

    async fn wait_target_indexing(&self, record: &mut SyncRecord) -> RelayerResult<()> {
        let validated = Self::required(record, record.validate_token_height, "validate_token_height")?;
        let target = self.target()?;

        let indexed = target.indexed_height(&self.source_chain_id).await?;
        if indexed < validated {
            debug!(
                "Token sync {}: {} indexed {} up to {}, waiting for {}",
                record.id, self.target_chain_id, self.source_chain_id, indexed, validated
            );
            return Ok(());
        }

        let status = target.chain_status().await?;
        record.main_chain_index_height = Some(status.best_chain_height);
        record.status = SyncStatus::WaitingSideIndexing;
        Ok(())
    }

    async fn create_on_target(&self, record: &mut SyncRecord) -> RelayerResult<()> {
        let snapshot = Self::required(record, record.main_chain_index_height, "main_chain_index_height")?;
        let validated = Self::required(record, record.validate_token_height, "validate_token_height")?;
        let tx_id = Self::required(record, record.validate_token_tx_id.clone(), "validate_token_tx_id")?;
        let raw_tx = Self::required(record, record.validate_token_tx.clone(), "validate_token_tx")?;
        let source = self.source()?;

        let indexed = source.indexed_height(&self.target_chain_id).await?;
        if indexed < snapshot {
            debug!(
                "Token sync {}: {} indexed {} up to {}, waiting for {}",
                record.id, self.source_chain_id, self.target_chain_id, indexed, snapshot
            );
            return Ok(());
        }

        let mut merkle_path = source.merkle_path(&tx_id).await?;
        let context = source.cross_chain_merkle_proof_context(validated).await?;
        merkle_path
            .merkle_path_nodes
            .extend(context.merkle_path_from_parent_chain.merkle_path_nodes);

        let input = CrossChainCreateTokenInput {
            from_chain_id: &self.source_chain_id,
            parent_chain_height: context.bound_parent_chain_height,
            transaction_bytes: &raw_tx,
            merkle_path,
        };
        let contract = self
            .chain_manager
            .contract_address(&self.target_chain_id, TOKEN_CONTRACT)?;
        let sent = self
            .tx_sender
            .send(
                &self.target_chain_id,
                &contract,
                CROSS_CHAIN_CREATE_METHOD,
                &serde_json::to_vec(&input)?,
            )
            .await?;

        record.cross_chain_create_token_tx_id = Some(sent.transaction_id);
        record.status = SyncStatus::CrossChainTokenCreating;
        Ok(())
    }

    async fn confirm_creation(&self, record: &mut SyncRecord) -> RelayerResult<()> {
        let tx_id = Self::required(
            record,
            record.cross_chain_create_token_tx_id.clone(),
            "cross_chain_create_token_tx_id",
        )?;

        match Polled::from(self.target()?.transaction_result(&tx_id).await?) {
            Polled::Mined(_) => record.status = SyncStatus::CrossChainTokenCreated,
            Polled::Pending => debug!("Token sync {}: creation {} pending", record.id, tx_id),
            Polled::Failed(message) => Self::fail(record, format!("cross-chain create: {}", message)),
        }
        Ok(())
    }

    fn required<T>(record: &SyncRecord, value: Option<T>, field: &str) -> RelayerResult<T> {
        value.ok_or_else(|| {
            RelayerError::Internal(format!(
                "Token sync {} in {} has no {}",
                record.id, record.status, field
            ))
        })
    }
}
