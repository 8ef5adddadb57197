//! Raw transaction construction and signing
//!
//! Transactions reference a recent irreversible block (height plus the first
//! four bytes of its hash). Nodes reject transactions whose ref block is too
//! old, so a retried workflow always builds a fresh one.

use crate::chain::ChainStatus;
use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};

use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub from: String,
    pub to: String,
    pub ref_block_number: u64,
    /// Hex of the first four bytes of the ref block hash
    pub ref_block_prefix: String,
    pub method_name: String,
    /// Hex-encoded method arguments
    pub params: String,
}

impl RawTransaction {
    pub fn new(
        from: String,
        to: &str,
        ref_block: &ChainStatus,
        method_name: &str,
        params: &[u8],
    ) -> RelayerResult<Self> {
        Ok(Self {
            from,
            to: to.to_string(),
            ref_block_number: ref_block.last_irreversible_block_height,
            ref_block_prefix: ref_block_prefix(&ref_block.last_irreversible_block_hash)?,
            method_name: method_name.to_string(),
            params: hex::encode(params),
        })
    }

    /// Keccak-256 over the canonical JSON encoding
    pub fn digest(&self) -> RelayerResult<[u8; 32]> {
        let bytes = serde_json::to_vec(self)?;
        Ok(Keccak256::digest(&bytes).into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    #[serde(flatten)]
    pub raw: RawTransaction,
    pub signature: String,
}

impl SignedTransaction {
    /// Hex encoding submitted to the node
    pub fn encode(&self) -> RelayerResult<String> {
        Ok(hex::encode(serde_json::to_vec(self)?))
    }
}

fn ref_block_prefix(block_hash: &str) -> RelayerResult<String> {
    let bytes = hex::decode(block_hash.trim_start_matches("0x")).map_err(|e| {
        RelayerError::Transaction(format!("Invalid ref block hash {}: {}", block_hash, e))
    })?;
    if bytes.len() < 4 {
        return Err(RelayerError::Transaction(format!(
            "Ref block hash too short: {}",
            block_hash
        )));
    }
    Ok(hex::encode(&bytes[..4]))
}

/// Per-chain signing keys
#[derive(Default)]
pub struct TransactionSigner {
    wallets: DashMap<String, LocalWallet>,
}

impl TransactionSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load one wallet per enabled chain from the configured env vars
    pub fn from_settings(settings: &Settings) -> RelayerResult<Self> {
        let signer = Self::new();

        for (_, chain) in settings.enabled_chains() {
            let key_env = chain
                .signing_key_env
                .as_ref()
                .or(settings.wallet.private_key_env.as_ref());

            let Some(key_env) = key_env else {
                warn!("No signing key configured for chain {}", chain.chain_id);
                continue;
            };

            match std::env::var(key_env) {
                Ok(key) => {
                    let wallet = key.trim().parse::<LocalWallet>().map_err(|e| {
                        RelayerError::Wallet(format!(
                            "Invalid private key in {} for chain {}: {}",
                            key_env, chain.chain_id, e
                        ))
                    })?;
                    info!(
                        "Signing key loaded for chain {}: {}",
                        chain.chain_id,
                        ethers::utils::to_checksum(&wallet.address(), None)
                    );
                    signer.register(&chain.chain_id, wallet);
                }
                Err(_) => {
                    warn!(
                        "Signing key env var {} not set - chain {} cannot submit transactions",
                        key_env, chain.chain_id
                    );
                }
            }
        }

        Ok(signer)
    }

    pub fn register(&self, chain_id: &str, wallet: LocalWallet) {
        self.wallets.insert(chain_id.to_string(), wallet);
    }

    fn wallet(&self, chain_id: &str) -> RelayerResult<LocalWallet> {
        self.wallets
            .get(chain_id)
            .map(|w| w.clone())
            .ok_or_else(|| RelayerError::Wallet(format!("No signing key for chain {}", chain_id)))
    }

    /// From-address derived from the chain's signing key
    pub fn address(&self, chain_id: &str) -> RelayerResult<String> {
        let wallet = self.wallet(chain_id)?;
        Ok(ethers::utils::to_checksum(&wallet.address(), None))
    }

    pub fn sign(&self, chain_id: &str, raw: RawTransaction) -> RelayerResult<SignedTransaction> {
        let wallet = self.wallet(chain_id)?;
        let digest = raw.digest()?;
        let signature = wallet
            .sign_hash(H256::from(digest))
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;

        Ok(SignedTransaction {
            raw,
            signature: hex::encode(signature.to_vec()),
        })
    }
}
