//! Domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{
    AllocationId, CorrelationId, IdempotencyKey, LocationId, LotId, MovementId, PickId, ProductId,
};
pub use version::ExpectedVersion;
