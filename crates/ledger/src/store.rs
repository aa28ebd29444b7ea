use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

use stockyard_core::{CorrelationId, DomainError, ExpectedVersion, IdempotencyKey, LotId};

use crate::movement::{CommittedMovement, MovementKind, StockMovement};

/// Position in the global movement log.
///
/// `read_since(cursor)` returns every movement strictly after the cursor,
/// so readers can restart from any prior position.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Cursor(pub u64);

impl Cursor {
    /// Cursor before the first movement.
    pub fn start() -> Self {
        Self(0)
    }
}

/// Ledger append error.
///
/// These are **structural** failures (validity, ordering, key reuse).
/// Balance checks live in the allocation engine, never here.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Per-lot optimistic concurrency check failed; re-read and retry.
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    /// The idempotency key was already committed for this correlation id,
    /// but with a different movement. Honoring it would silently drop data.
    #[error("idempotency key reused with a different movement: {0}")]
    IdempotencyMismatch(String),

    /// Structurally invalid movement or stream state.
    #[error("invalid append: {0}")]
    InvalidAppend(String),
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        LedgerError::InvalidAppend(value.to_string())
    }
}

/// Append-only, totally ordered movement log.
///
/// Contract:
/// - sequence numbers are gap-free and monotonically increasing;
/// - appends for a single lot are linearized (the per-lot version check is
///   the serialization point), appends across lots proceed independently;
/// - a movement whose `(correlation_id, idempotency_key)` was already
///   committed returns the original result with no new effect;
/// - movements are never mutated or deleted.
pub trait MovementLedger: Send + Sync {
    /// Append a movement, conditioned on the lot's current stream version.
    ///
    /// Use `ExpectedVersion::Any` for writers serialized elsewhere
    /// (receipts, expiry scheduler); the allocation engine always passes
    /// `Exact` so concurrent claims against a lot cannot interleave.
    fn append(
        &self,
        movement: StockMovement,
        expected: ExpectedVersion,
    ) -> Result<CommittedMovement, LedgerError>;

    /// Read every committed movement strictly after `cursor`, in order.
    fn read_since(&self, cursor: Cursor) -> Vec<CommittedMovement>;

    /// Current per-lot stream version (0 if the lot has no movements).
    fn lot_version(&self, lot_id: LotId) -> u64;

    /// Cursor at the current head of the log.
    fn head(&self) -> Cursor;
}

impl<L> MovementLedger for std::sync::Arc<L>
where
    L: MovementLedger + ?Sized,
{
    fn append(
        &self,
        movement: StockMovement,
        expected: ExpectedVersion,
    ) -> Result<CommittedMovement, LedgerError> {
        (**self).append(movement, expected)
    }

    fn read_since(&self, cursor: Cursor) -> Vec<CommittedMovement> {
        (**self).read_since(cursor)
    }

    fn lot_version(&self, lot_id: LotId) -> u64 {
        (**self).lot_version(lot_id)
    }

    fn head(&self) -> Cursor {
        (**self).head()
    }
}

#[derive(Debug, Default)]
struct Inner {
    log: Vec<CommittedMovement>,
    lot_versions: HashMap<LotId, u64>,
    dedup: HashMap<(CorrelationId, IdempotencyKey), usize>,
}

/// In-memory append-only movement ledger.
///
/// Intended for tests/dev and as the reference semantics for durable
/// backends. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryMovementLedger {
    inner: RwLock<Inner>,
}

impl InMemoryMovementLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MovementLedger for InMemoryMovementLedger {
    fn append(
        &self,
        movement: StockMovement,
        expected: ExpectedVersion,
    ) -> Result<CommittedMovement, LedgerError> {
        movement.validate()?;

        let mut inner = self
            .inner
            .write()
            .map_err(|_| LedgerError::InvalidAppend("lock poisoned".to_string()))?;

        // Idempotent replay: a retried append returns the original result.
        let dedup_key = (movement.correlation_id, movement.idempotency_key.clone());
        if let Some(&idx) = inner.dedup.get(&dedup_key) {
            let original = &inner.log[idx];
            if original.movement.same_fact(&movement) {
                debug!(
                    sequence = original.sequence_number,
                    kind = movement.kind.name(),
                    "idempotent replay, returning original append result"
                );
                return Ok(original.clone());
            }
            return Err(LedgerError::IdempotencyMismatch(format!(
                "correlation {} key '{}' already committed at sequence {}",
                movement.correlation_id, movement.idempotency_key, original.sequence_number
            )));
        }

        let current = inner.lot_versions.get(&movement.lot_id).copied().unwrap_or(0);

        // A lot only exists once its Receipt is on the log.
        if current == 0 && !matches!(movement.kind, MovementKind::Receipt { .. }) {
            return Err(LedgerError::InvalidAppend(format!(
                "first movement for lot {} must be a receipt, got {}",
                movement.lot_id,
                movement.kind.name()
            )));
        }

        if !expected.matches(current) {
            return Err(LedgerError::Conflict(format!(
                "lot {} expected {expected:?}, found {current}",
                movement.lot_id
            )));
        }

        let committed = CommittedMovement {
            sequence_number: inner.log.len() as u64 + 1,
            lot_sequence: current + 1,
            movement,
        };

        debug!(
            sequence = committed.sequence_number,
            lot = %committed.movement.lot_id,
            kind = committed.movement.kind.name(),
            delta = committed.movement.quantity_delta,
            "movement appended"
        );

        inner
            .lot_versions
            .insert(committed.movement.lot_id, committed.lot_sequence);
        inner.dedup.insert(dedup_key, committed.sequence_number as usize - 1);
        inner.log.push(committed.clone());

        Ok(committed)
    }

    fn read_since(&self, cursor: Cursor) -> Vec<CommittedMovement> {
        let inner = match self.inner.read() {
            Ok(i) => i,
            Err(_) => return vec![],
        };

        inner
            .log
            .iter()
            .filter(|c| c.sequence_number > cursor.0)
            .cloned()
            .collect()
    }

    fn lot_version(&self, lot_id: LotId) -> u64 {
        self.inner
            .read()
            .ok()
            .and_then(|i| i.lot_versions.get(&lot_id).copied())
            .unwrap_or(0)
    }

    fn head(&self) -> Cursor {
        let len = self.inner.read().map(|i| i.log.len() as u64).unwrap_or(0);
        Cursor(len)
    }
}
