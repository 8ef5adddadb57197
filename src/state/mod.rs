//! State management with PostgreSQL persistence
//!
//! Handles:
//! - Contract-invoke and token-sync workflow records
//! - The durable set of pending token syncs
//! - Named scan checkpoints for restart recovery
//! - Job leases that survive restarts
//! - Per-id advancement locks

mod locks;
mod manager;
#[cfg(test)]
mod memory;
mod store;

pub use locks::WorkflowLocks;
pub use manager::StateManager;
#[cfg(test)]
pub use memory::MemoryStore;
pub use store::WorkflowStore;
