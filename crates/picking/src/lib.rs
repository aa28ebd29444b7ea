//! Picking list orchestration for `stockyard`.
//!
//! Groups confirmed allocations into a sequenced pick task and walks it
//! through a lifecycle state machine. Every physical pick is recorded as a
//! `Pick` movement on the ledger; cancellation releases whatever was not
//! yet picked.

pub mod list;
pub mod orchestrator;

pub use list::{PickError, PickLine, PickStatus, PickingList};
pub use orchestrator::PickOrchestrator;
