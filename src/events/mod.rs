//! Workflow state-change notifications
//!
//! Emitted after records are persisted, for read-model projections. Delivery
//! is best effort: a lagging receiver loses notifications, never state.

use crate::workflow::{ContractInvokeRecord, InvokeStatus, SyncStatus};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowEvent {
    /// A contract-invoke workflow was created
    InvokeCreated { record: ContractInvokeRecord },

    InvokeStatusChanged {
        id: String,
        chain_id: String,
        from: InvokeStatus,
        to: InvokeStatus,
        transaction_id: Option<String>,
    },

    SyncCreated { id: String },

    SyncStatusChanged {
        id: String,
        symbol: Option<String>,
        from: SyncStatus,
        to: SyncStatus,
    },
}

impl WorkflowEvent {
    /// Get event name
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::InvokeCreated { .. } => "InvokeCreated",
            WorkflowEvent::InvokeStatusChanged { .. } => "InvokeStatusChanged",
            WorkflowEvent::SyncCreated { .. } => "SyncCreated",
            WorkflowEvent::SyncStatusChanged { .. } => "SyncStatusChanged",
        }
    }

    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::InvokeCreated { record } => &record.id,
            WorkflowEvent::InvokeStatusChanged { id, .. }
            | WorkflowEvent::SyncCreated { id }
            | WorkflowEvent::SyncStatusChanged { id, .. } => id,
        }
    }
}

/// Broadcast channel for workflow events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        debug!("Publishing {} for {}", event.name(), event.workflow_id());
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

/// Projects workflow events into metrics until the bus closes
pub async fn run_projection(mut rx: broadcast::Receiver<WorkflowEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => crate::metrics::record_workflow_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Workflow event projection lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
