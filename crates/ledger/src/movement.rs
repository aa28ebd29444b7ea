use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockyard_core::{
    AllocationId, CorrelationId, DomainError, IdempotencyKey, LocationId, LotId, MovementId,
    PickId, ProductId,
};
use stockyard_events::Sequenced;

/// Closed set of movement kinds, with per-kind required fields.
///
/// The sign of `quantity_delta` is fixed per kind (see [`StockMovement::new`]);
/// dynamic, loosely-typed movement records are deliberately not representable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MovementKind {
    /// Inbound stock; creates the lot and fixes its identity
    /// (product, location, received_at never change afterwards).
    Receipt {
        received_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    },
    /// Claim of available quantity by an allocation.
    Reservation { allocation_id: AllocationId },
    /// Return of previously reserved quantity.
    ReservationRelease { allocation_id: AllocationId },
    /// Physical removal of reserved stock by a picking list line.
    Pick {
        allocation_id: AllocationId,
        pick_id: PickId,
    },
    /// Manual correction (count discrepancies, damage, ...).
    Adjustment { reason: String },
    /// Outbound leg of a lot-to-lot transfer; the inbound leg arrives as a
    /// fresh Receipt at the destination.
    Transfer { destination: LocationId },
    /// Write-off of remaining quantity once `expires_at` has passed.
    /// Emitted by an external scheduler, never by this core.
    Expiry,
}

impl MovementKind {
    pub fn name(&self) -> &'static str {
        match self {
            MovementKind::Receipt { .. } => "receipt",
            MovementKind::Reservation { .. } => "reservation",
            MovementKind::ReservationRelease { .. } => "reservation_release",
            MovementKind::Pick { .. } => "pick",
            MovementKind::Adjustment { .. } => "adjustment",
            MovementKind::Transfer { .. } => "transfer",
            MovementKind::Expiry => "expiry",
        }
    }
}

/// An immutable, signed quantity event against a lot.
///
/// Construction validates structure only (required fields, delta sign
/// consistent with kind). Balance invariants are the allocation engine's
/// job *before* appending; the ledger never second-guesses them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub movement_id: MovementId,
    pub lot_id: LotId,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub kind: MovementKind,
    pub quantity_delta: i64,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    pub idempotency_key: IdempotencyKey,
}

impl StockMovement {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lot_id: LotId,
        product_id: ProductId,
        location_id: LocationId,
        kind: MovementKind,
        quantity_delta: i64,
        occurred_at: DateTime<Utc>,
        correlation_id: CorrelationId,
        idempotency_key: IdempotencyKey,
    ) -> Result<Self, DomainError> {
        let movement = Self {
            movement_id: MovementId::new(),
            lot_id,
            product_id,
            location_id,
            kind,
            quantity_delta,
            occurred_at,
            correlation_id,
            idempotency_key,
        };
        movement.validate()?;
        Ok(movement)
    }

    /// Structural validation: delta sign vs kind, per-kind required fields.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.quantity_delta == 0 {
            return Err(DomainError::validation("quantity_delta cannot be zero"));
        }

        let delta = self.quantity_delta;
        match &self.kind {
            MovementKind::Receipt { .. } | MovementKind::Reservation { .. } => {
                if delta < 0 {
                    return Err(DomainError::validation(format!(
                        "{} requires a positive quantity_delta",
                        self.kind.name()
                    )));
                }
            }
            MovementKind::ReservationRelease { .. }
            | MovementKind::Pick { .. }
            | MovementKind::Transfer { .. }
            | MovementKind::Expiry => {
                if delta > 0 {
                    return Err(DomainError::validation(format!(
                        "{} requires a negative quantity_delta",
                        self.kind.name()
                    )));
                }
            }
            MovementKind::Adjustment { reason } => {
                if reason.trim().is_empty() {
                    return Err(DomainError::validation("adjustment reason cannot be empty"));
                }
            }
        }

        Ok(())
    }

    /// Whether two movements describe the same fact.
    ///
    /// Retried appends regenerate `movement_id`, so identity is excluded;
    /// everything the caller controls must match for a replay to be honored.
    pub fn same_fact(&self, other: &StockMovement) -> bool {
        self.lot_id == other.lot_id
            && self.product_id == other.product_id
            && self.location_id == other.location_id
            && self.kind == other.kind
            && self.quantity_delta == other.quantity_delta
            && self.correlation_id == other.correlation_id
            && self.idempotency_key == other.idempotency_key
    }
}

/// A movement persisted in the ledger, assigned its total-order position.
///
/// `sequence_number` is global, gap-free, and monotonically increasing.
/// `lot_sequence` is the per-lot stream version used for optimistic
/// compare-and-append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedMovement {
    pub sequence_number: u64,
    pub lot_sequence: u64,
    pub movement: StockMovement,
}

impl Sequenced for CommittedMovement {
    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}
