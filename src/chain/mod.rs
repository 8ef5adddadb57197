//! Chain module - the chain capability consumed by the workflows
//!
//! This module provides:
//! - The `ChainClient` capability (submit, query result, query heights, proofs, token info)
//! - A JSON-RPC implementation with multi-URL failover and per-call timeouts
//! - `ChainManager`, resolving a chain id to its client
//! - The token-created event scanner that feeds token sync discovery

pub mod listener;
pub mod provider;
pub mod types;

pub use listener::TokenCreatedListener;
pub use provider::ChainProvider;
pub use types::{
    ChainStatus, CrossChainMerkleProofContext, LogEvent, MerklePath, MerklePathNode, TokenInfo,
    TokenCreatedEvent, TransactionResult, TxStatus,
};

use crate::config::{ChainConfig, Settings};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Capability to talk to one chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current heights and hashes
    async fn chain_status(&self) -> RelayerResult<ChainStatus>;

    /// Submit a signed, hex-encoded transaction and return its id
    async fn send_raw_transaction(&self, raw_transaction: &str) -> RelayerResult<String>;

    async fn transaction_result(&self, transaction_id: &str) -> RelayerResult<TransactionResult>;

    /// Inclusion proof of a transaction inside its block
    async fn merkle_path(&self, transaction_id: &str) -> RelayerResult<MerklePath>;

    /// Height of `of_chain_id` that this chain has indexed
    async fn indexed_height(&self, of_chain_id: &str) -> RelayerResult<u64>;

    async fn cross_chain_merkle_proof_context(
        &self,
        height: u64,
    ) -> RelayerResult<CrossChainMerkleProofContext>;

    async fn token_info(&self, symbol: &str) -> RelayerResult<Option<TokenInfo>>;

    /// Confirmed `TokenCreated` events in `[from_height, to_height]`
    async fn token_created_events(
        &self,
        from_height: u64,
        to_height: u64,
    ) -> RelayerResult<Vec<TokenCreatedEvent>>;
}

/// Resolves chain ids to clients and their configuration
pub struct ChainManager {
    clients: DashMap<String, Arc<dyn ChainClient>>,
    configs: DashMap<String, ChainConfig>,
}

impl ChainManager {
    /// Create JSON-RPC clients for every enabled chain
    pub fn new(settings: &Settings) -> RelayerResult<Self> {
        let manager = Self::empty();

        for (name, chain_config) in settings.enabled_chains() {
            info!("Initializing chain {} ({})", name, chain_config.chain_id);
            let provider = ChainProvider::new(chain_config.clone(), &settings.scheduler)?;
            manager.register(chain_config.clone(), Arc::new(provider));
        }

        Ok(manager)
    }

    pub fn empty() -> Self {
        Self {
            clients: DashMap::new(),
            configs: DashMap::new(),
        }
    }

    pub fn register(&self, config: ChainConfig, client: Arc<dyn ChainClient>) {
        self.clients.insert(config.chain_id.clone(), client);
        self.configs.insert(config.chain_id.clone(), config);
    }

    /// Get the client for a specific chain
    pub fn client(&self, chain_id: &str) -> RelayerResult<Arc<dyn ChainClient>> {
        self.clients
            .get(chain_id)
            .map(|c| c.clone())
            .ok_or_else(|| RelayerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            })
    }

    pub fn config(&self, chain_id: &str) -> RelayerResult<ChainConfig> {
        self.configs
            .get(chain_id)
            .map(|c| c.clone())
            .ok_or_else(|| RelayerError::ChainNotFound {
                chain_id: chain_id.to_string(),
            })
    }

    /// Resolve a contract address by role, failing with a config error if absent
    pub fn contract_address(&self, chain_id: &str, role: &str) -> RelayerResult<String> {
        let config = self.config(chain_id)?;
        config.contract(role).map(str::to_string).ok_or_else(|| {
            RelayerError::Config(format!("Chain {} has no '{}' contract", chain_id, role))
        })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let clients: Vec<_> = self
            .clients
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut results = Vec::new();
        for (chain_id, client) in clients {
            let healthy = client.chain_status().await.is_ok();
            crate::metrics::record_chain_health(&chain_id, healthy);
            results.push((chain_id, healthy));
        }

        results
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<String> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }
}

/// Chain config for tests and local wiring
#[cfg(test)]
pub fn test_chain_config(chain_id: &str, contracts: &[(&str, &str)]) -> ChainConfig {
    ChainConfig {
        chain_id: chain_id.to_string(),
        rpc_urls: vec![format!("http://{}.local:8000", chain_id.to_lowercase())],
        signing_key_env: None,
        contracts: contracts
            .iter()
            .map(|(role, addr)| (role.to_string(), addr.to_string()))
            .collect(),
        enabled: true,
    }
}
