//! Node-facing data types returned by the chain capability

use serde::{Deserialize, Serialize};

/// Current chain state as reported by a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatus {
    pub chain_id: String,
    pub best_chain_height: u64,
    pub best_chain_hash: String,
    pub last_irreversible_block_height: u64,
    pub last_irreversible_block_hash: String,
}

/// Transaction result status
///
/// Both pending statuses mean "not decided yet". Every other status the node
/// reports is a definitive non-mined outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TxStatus {
    Mined,
    Pending,
    PendingValidation,
    Other(String),
}

impl TxStatus {
    pub fn is_mined(&self) -> bool {
        matches!(self, TxStatus::Mined)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TxStatus::Pending | TxStatus::PendingValidation)
    }
}

impl From<String> for TxStatus {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "MINED" => TxStatus::Mined,
            "PENDING" => TxStatus::Pending,
            "PENDING_VALIDATION" => TxStatus::PendingValidation,
            _ => TxStatus::Other(s),
        }
    }
}

impl From<TxStatus> for String {
    fn from(status: TxStatus) -> Self {
        match status {
            TxStatus::Mined => "MINED".to_string(),
            TxStatus::Pending => "PENDING".to_string(),
            TxStatus::PendingValidation => "PENDING_VALIDATION".to_string(),
            TxStatus::Other(s) => s,
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from(self.clone()))
    }
}

/// A decoded contract log event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub address: String,
    pub name: String,
    #[serde(default)]
    pub fields: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    pub transaction_id: String,
    pub status: TxStatus,
    #[serde(default)]
    pub block_number: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogEvent>,
}

impl TransactionResult {
    /// First log event with the given name
    pub fn find_log(&self, name: &str) -> Option<&LogEvent> {
        self.logs.iter().find(|log| log.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerklePathNode {
    pub hash: String,
    pub is_left_child_node: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerklePath {
    pub merkle_path_nodes: Vec<MerklePathNode>,
}

/// Cross-chain proof context bound to a source chain height
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossChainMerkleProofContext {
    pub bound_parent_chain_height: u64,
    pub merkle_path_from_parent_chain: MerklePath,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub symbol: String,
    pub token_name: String,
    pub total_supply: u64,
    pub decimals: u32,
    pub issuer: String,
    pub is_burnable: bool,
    pub issue_chain_id: u64,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub external_info: serde_json::Value,
}

/// A confirmed `TokenCreated` event found by the event search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCreatedEvent {
    pub transaction_id: String,
    pub symbol: String,
    pub block_height: u64,
}
