//! Durable workflows driven forward by the coordination engine
//!
//! Each workflow instance is a persisted record keyed by a business id.
//! `create` is idempotent; `advance` loads the record, applies at most one
//! transition and writes it back before returning. All advancement for one
//! id is serialized through `WorkflowLocks`.

pub mod contract_invoke;
pub mod token_sync;

pub use contract_invoke::ContractInvoker;
pub use token_sync::TokenSyncer;

use crate::error::RelayerError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a contract-invoke workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvokeStatus {
    ToBeCreated,
    Pending,
    Success,
    Failed,
}

impl InvokeStatus {
    pub const ALL: [InvokeStatus; 4] = [
        InvokeStatus::ToBeCreated,
        InvokeStatus::Pending,
        InvokeStatus::Success,
        InvokeStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvokeStatus::ToBeCreated => "ToBeCreated",
            InvokeStatus::Pending => "Pending",
            InvokeStatus::Success => "Success",
            InvokeStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvokeStatus::Success)
    }
}

impl fmt::Display for InvokeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvokeStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InvokeStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| RelayerError::Internal(format!("Unknown invoke status: {}", s)))
    }
}

/// A single opaque contract call tracked from submission to confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractInvokeRecord {
    pub id: String,
    pub chain_id: String,
    pub contract_address: String,
    pub contract_method: String,
    pub biz_type: String,
    /// Hex-encoded method arguments
    pub param: String,
    pub sender: Option<String>,
    pub transaction_id: Option<String>,
    pub status: InvokeStatus,
    pub retry_count: u32,
    pub message: Option<String>,
    pub block_height: Option<u64>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Request to start a contract-invoke workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractInvokeRequest {
    pub biz_id: String,
    pub chain_id: String,
    pub contract_address: String,
    pub contract_method: String,
    pub biz_type: String,
    pub param: String,
}

/// Status of a cross-chain token sync workflow
///
/// Statuses only move forward through `SEQUENCE`; `Failed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    Initial,
    TokenValidating,
    WaitingIndexing,
    WaitingSideIndexing,
    CrossChainTokenCreating,
    CrossChainTokenCreated,
    Failed,
}

impl SyncStatus {
    pub const SEQUENCE: [SyncStatus; 6] = [
        SyncStatus::Initial,
        SyncStatus::TokenValidating,
        SyncStatus::WaitingIndexing,
        SyncStatus::WaitingSideIndexing,
        SyncStatus::CrossChainTokenCreating,
        SyncStatus::CrossChainTokenCreated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Initial => "Initial",
            SyncStatus::TokenValidating => "TokenValidating",
            SyncStatus::WaitingIndexing => "WaitingIndexing",
            SyncStatus::WaitingSideIndexing => "WaitingSideIndexing",
            SyncStatus::CrossChainTokenCreating => "CrossChainTokenCreating",
            SyncStatus::CrossChainTokenCreated => "CrossChainTokenCreated",
            SyncStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::CrossChainTokenCreated | SyncStatus::Failed
        )
    }

    /// Position in the forward sequence; `None` for `Failed`
    pub fn position(&self) -> Option<usize> {
        SyncStatus::SEQUENCE.iter().position(|s| s == self)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncStatus::SEQUENCE
            .into_iter()
            .chain([SyncStatus::Failed])
            .find(|status| status.as_str() == s)
            .ok_or_else(|| RelayerError::Internal(format!("Unknown sync status: {}", s)))
    }
}

/// Cross-chain registration of one newly created token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Id of the source-chain transaction that created the token
    pub id: String,
    pub symbol: Option<String>,
    pub status: SyncStatus,
    /// Signed validation transaction, hex encoded
    pub validate_token_tx: Option<String>,
    pub validate_token_tx_id: Option<String>,
    pub validate_token_height: Option<u64>,
    /// Target chain height snapshotted once it indexed the validation height
    pub main_chain_index_height: Option<u64>,
    pub cross_chain_create_token_tx_id: Option<String>,
    pub message: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl SyncRecord {
    pub fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            symbol: None,
            status: SyncStatus::Initial,
            validate_token_tx: None,
            validate_token_tx_id: None,
            validate_token_height: None,
            main_chain_index_height: None,
            cross_chain_create_token_tx_id: None,
            message: None,
            create_time: now,
            update_time: now,
        }
    }
}

/// Result of one `advance` call on a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceOutcome<S> {
    pub from: S,
    pub to: S,
}

impl<S: PartialEq + Copy> AdvanceOutcome<S> {
    pub fn unchanged(status: S) -> Self {
        Self {
            from: status,
            to: status,
        }
    }

    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}
