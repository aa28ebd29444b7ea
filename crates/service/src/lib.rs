//! The in-process facade over the whole warehouse subsystem.
//!
//! Wires the ledger, registry, allocation engine, aggregator, and picking
//! orchestrator together behind one `WarehouseService` and exposes the
//! contracts collaborators call: receiving, allocation lifecycle, picking
//! lifecycle, inventory snapshots, the audit feed, and an integrity check.

pub mod service;


pub use service::{ReceiptNotice, ServiceError, WarehouseService};
