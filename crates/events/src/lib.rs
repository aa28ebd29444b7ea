//! Event distribution and read-model machinery.
//!
//! The movement ledger is the source of truth; this crate only moves
//! committed movements around (pub/sub) and folds them into disposable
//! read models (projections).

pub mod bus;
pub mod in_memory_bus;
pub mod projection;
pub mod runner;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use projection::{Projection, Sequenced};
pub use runner::{ProjectionError, ProjectionRunner};
