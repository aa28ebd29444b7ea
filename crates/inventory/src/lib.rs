//! Derived views over the movement ledger.
//!
//! The [`StockLotRegistry`] is the authoritative projection the allocation
//! engine reads; the [`InventoryAggregator`] is a read-optimized cache that
//! may lag by one append cycle. Both are disposable and rebuildable by
//! replaying the ledger from empty; that replayability is the core
//! correctness guarantee of the whole subsystem.

pub mod aggregator;
pub mod lot;
pub mod registry;

pub use aggregator::{InventoryAggregator, InventoryTotals};
pub use lot::{IntegrityError, LotStatus, StockLot};
pub use registry::StockLotRegistry;
