//! The append-only movement ledger.
//!
//! The ledger is the **single source of truth** for inventory quantity.
//! Every quantity-changing event is recorded as an immutable, signed
//! movement; lot and aggregate state are derived views rebuildable by
//! replaying the log from empty.

pub mod movement;
pub mod store;

pub use movement::{CommittedMovement, MovementKind, StockMovement};
pub use store::{Cursor, InMemoryMovementLedger, LedgerError, MovementLedger};
