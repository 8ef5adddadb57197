//! Coordination engine for the workflow schedulers
//!
//! The coordination engine:
//! 1. Advances every unfinished contract-invoke workflow on a fixed interval
//! 2. Scans for new token creations, then advances pending token syncs
//! 3. Settles the previous day's points under a persisted lease

pub mod engine;

pub use engine::{CoordinationEngine, SettlementJob, TokenSyncJob};
