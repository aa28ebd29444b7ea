//! Projection trait: read models built from the append-only movement stream.
//!
//! Projections implement the CQRS read-model pattern: they fold committed
//! movements into queryable state. Read models are **disposable**: they can
//! be cleared and rebuilt from the ledger at any time, which is the core
//! recovery and consistency-verification mechanism of this system.

/// A message carrying its ledger position.
///
/// The ledger assigns gap-free, monotonically increasing sequence numbers,
/// so a consumer can detect duplicates (<= cursor) and gaps (> cursor + 1).
pub trait Sequenced {
    fn sequence_number(&self) -> u64;
}

/// A projection builds a read model from an append-only movement stream.
///
/// `apply` must be idempotent at the stream level: the [`ProjectionRunner`]
/// skips messages at or below its cursor, so implementations only see each
/// sequence number once, but they must tolerate being rebuilt from scratch.
///
/// [`ProjectionRunner`]: crate::runner::ProjectionRunner
pub trait Projection {
    type Msg: Sequenced;
    type Error: core::fmt::Debug;

    /// Fold a single message into the read model.
    fn apply(&mut self, message: &Self::Msg) -> Result<(), Self::Error>;

    /// Discard all read-model state (rebuild support).
    fn clear(&mut self);
}
