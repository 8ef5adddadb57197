//! JSON-RPC chain provider with multi-RPC support and automatic failover

use super::types::{
    ChainStatus, CrossChainMerkleProofContext, MerklePath, TokenCreatedEvent, TokenInfo,
    TransactionResult,
};
use super::ChainClient;
use crate::config::{ChainConfig, SchedulerConfig};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::providers::{Http, Provider};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Upper bound for a single RPC round trip
    rpc_timeout: Duration,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig, scheduler: &SchedulerConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id.clone(),
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            rpc_timeout: scheduler.rpc_timeout(),
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Issue a JSON-RPC request, rotating through providers on failure
    async fn request<P, R>(&self, method: &str, params: P) -> RelayerResult<R>
    where
        P: Debug + Serialize + Send + Sync + Clone,
        R: Debug + Serialize + DeserializeOwned + Send,
    {
        let mut last_error = String::new();

        for _ in 0..self.http_providers.len() {
            match timeout(self.rpc_timeout, self.http().request(method, params.clone())).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => {
                    warn!(
                        "{} failed on chain {}: {}",
                        method, self.config.chain_id, e
                    );
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(
                        "{} timed out on chain {} after {:?}",
                        method, self.config.chain_id, self.rpc_timeout
                    );
                    last_error = format!("timeout after {:?}", self.rpc_timeout);
                }
            }
            self.failover();
        }

        Err(RelayerError::ChainConnection {
            chain_id: self.config.chain_id.clone(),
            message: format!("{}: {}", method, last_error),
        })
    }
}

#[async_trait]
impl ChainClient for ChainProvider {
    async fn chain_status(&self) -> RelayerResult<ChainStatus> {
        self.request("chain_getChainStatus", json!([])).await
    }

    async fn send_raw_transaction(&self, raw_transaction: &str) -> RelayerResult<String> {
        #[derive(Debug, Serialize, serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SendTransactionOutput {
            transaction_id: String,
        }

        let output: SendTransactionOutput = self
            .request("chain_sendRawTransaction", json!([raw_transaction]))
            .await?;
        Ok(output.transaction_id)
    }

    async fn transaction_result(&self, transaction_id: &str) -> RelayerResult<TransactionResult> {
        self.request("chain_getTransactionResult", json!([transaction_id]))
            .await
    }

    async fn merkle_path(&self, transaction_id: &str) -> RelayerResult<MerklePath> {
        self.request("chain_getMerklePathByTransactionId", json!([transaction_id]))
            .await
    }

    async fn indexed_height(&self, of_chain_id: &str) -> RelayerResult<u64> {
        let height: Value = self
            .request("crosschain_getIndexedHeight", json!([of_chain_id]))
            .await?;
        parse_height(&self.config.chain_id, &height)
    }

    async fn cross_chain_merkle_proof_context(
        &self,
        height: u64,
    ) -> RelayerResult<CrossChainMerkleProofContext> {
        self.request(
            "crosschain_getBoundParentChainHeightAndMerklePathByHeight",
            json!([height]),
        )
        .await
    }

    async fn token_info(&self, symbol: &str) -> RelayerResult<Option<TokenInfo>> {
        let info: Option<TokenInfo> = self.request("token_getTokenInfo", json!([symbol])).await?;
        // Nodes answer unknown symbols with an empty record
        Ok(info.filter(|i| !i.symbol.is_empty()))
    }

    async fn token_created_events(
        &self,
        from_height: u64,
        to_height: u64,
    ) -> RelayerResult<Vec<TokenCreatedEvent>> {
        self.request(
            "token_getTokenCreatedEvents",
            json!([from_height, to_height]),
        )
        .await
    }
}

/// Heights come back either as JSON numbers or decimal strings
fn parse_height(chain_id: &str, value: &Value) -> RelayerResult<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| RelayerError::ChainConnection {
            chain_id: chain_id.to_string(),
            message: format!("unexpected height value: {}", value),
        })
}
