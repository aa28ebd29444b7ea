//! The allocation engine.
//!
//! Answers the central warehouse question: which specific lots satisfy this
//! demand, in what order, without ever promising the same unit of stock
//! twice. Selection is FIFO or FEFO over the registry's candidate lots;
//! every claim is a `Reservation` movement appended under an optimistic
//! per-lot version check, retried on conflict.

pub mod allocation;
pub mod engine;
pub mod policy;

pub use allocation::{Allocation, AllocationStatus, AllocationStore};
pub use engine::{AllocationEngine, AllocationError, AllocationOutcome, DEFAULT_MAX_ATTEMPTS};
pub use policy::{AllocationPolicy, DemandLine, ShortfallPolicy};
