use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockyard_core::{LocationId, LotId, ProductId};
use stockyard_ledger::{CommittedMovement, MovementKind};

/// Lot lifecycle status.
///
/// `Quarantined` is set by the external QA flow; within this core it only
/// participates in allocation filtering (non-Active lots are never
/// candidates).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LotStatus {
    Active,
    Quarantined,
    Depleted,
    Expired,
}

/// Derived-state computation disagrees with the ledger. Fatal: writes
/// against the affected lot must halt rather than proceed on inconsistent
/// state. Never silently corrected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("ledger integrity violation for lot {lot_id}: {detail}")]
    LedgerIntegrityViolation { lot_id: LotId, detail: String },

    #[error("movement sequence gap (last={last}, found={found})")]
    SequenceGap { last: u64, found: u64 },
}

impl IntegrityError {
    pub fn violation(lot_id: LotId, detail: impl Into<String>) -> Self {
        Self::LedgerIntegrityViolation {
            lot_id,
            detail: detail.into(),
        }
    }
}

/// The atomic unit of stock: a traceable, expiry-dated batch.
///
/// Identity (`product_id`, `location_id`, `received_at`) is fixed by the
/// creating Receipt and never changes; quantities and status mutate only
/// through ledger folds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLot {
    pub lot_id: LotId,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub received_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub quantity_on_hand: i64,
    pub quantity_reserved: i64,
    pub status: LotStatus,
    /// Per-lot stream version (count of movements folded into this lot).
    pub version: u64,
}

impl StockLot {
    /// Create a lot from its Receipt movement.
    pub fn from_receipt(committed: &CommittedMovement) -> Result<Self, IntegrityError> {
        let m = &committed.movement;
        let MovementKind::Receipt {
            received_at,
            expires_at,
        } = m.kind
        else {
            return Err(IntegrityError::violation(
                m.lot_id,
                format!("lot created by non-receipt movement '{}'", m.kind.name()),
            ));
        };

        Ok(Self {
            lot_id: m.lot_id,
            product_id: m.product_id,
            location_id: m.location_id,
            received_at,
            expires_at,
            quantity_on_hand: m.quantity_delta,
            quantity_reserved: 0,
            status: LotStatus::Active,
            version: committed.lot_sequence,
        })
    }

    /// Quantity not yet promised to any allocation.
    pub fn available(&self) -> i64 {
        self.quantity_on_hand - self.quantity_reserved
    }

    /// Status as seen at `now`: expiry is checked lazily on read, but the
    /// stored status (and allocability) only changes once an explicit
    /// `Expiry` movement is folded.
    pub fn status_at(&self, now: DateTime<Utc>) -> LotStatus {
        match (self.status, self.expires_at) {
            (LotStatus::Active, Some(expiry)) if expiry <= now => LotStatus::Expired,
            (status, _) => status,
        }
    }

    pub fn is_allocatable(&self) -> bool {
        self.status == LotStatus::Active && self.available() > 0
    }

    /// Fold a subsequent movement into the lot.
    ///
    /// Enforces per-lot sequence continuity and the conservation invariants
    /// (`quantity_on_hand >= 0`, `0 <= quantity_reserved <= quantity_on_hand`);
    /// a violation means the writer discipline or the replay path is broken.
    pub fn apply(&mut self, committed: &CommittedMovement) -> Result<(), IntegrityError> {
        let m = &committed.movement;
        if m.lot_id != self.lot_id {
            return Err(IntegrityError::violation(
                self.lot_id,
                format!("movement for lot {} folded into lot {}", m.lot_id, self.lot_id),
            ));
        }
        if committed.lot_sequence != self.version + 1 {
            return Err(IntegrityError::SequenceGap {
                last: self.version,
                found: committed.lot_sequence,
            });
        }

        match &m.kind {
            MovementKind::Receipt {
                received_at,
                expires_at,
            } => {
                // A later receipt credits the lot; identity must not drift.
                if m.product_id != self.product_id
                    || m.location_id != self.location_id
                    || *received_at != self.received_at
                    || *expires_at != self.expires_at
                {
                    return Err(IntegrityError::violation(
                        self.lot_id,
                        "receipt changes immutable lot identity",
                    ));
                }
                self.quantity_on_hand += m.quantity_delta;
            }
            MovementKind::Reservation { .. } | MovementKind::ReservationRelease { .. } => {
                self.quantity_reserved += m.quantity_delta;
            }
            MovementKind::Pick { .. } => {
                // A pick always targets previously reserved stock, so it
                // consumes the reservation together with the on-hand units.
                self.quantity_on_hand += m.quantity_delta;
                self.quantity_reserved += m.quantity_delta;
            }
            MovementKind::Adjustment { .. } | MovementKind::Transfer { .. } => {
                self.quantity_on_hand += m.quantity_delta;
            }
            MovementKind::Expiry => {
                self.quantity_on_hand += m.quantity_delta;
                self.status = LotStatus::Expired;
            }
        }

        if self.quantity_on_hand < 0 {
            return Err(IntegrityError::violation(
                self.lot_id,
                format!("quantity_on_hand went negative ({})", self.quantity_on_hand),
            ));
        }
        if self.quantity_reserved < 0 {
            return Err(IntegrityError::violation(
                self.lot_id,
                format!("quantity_reserved went negative ({})", self.quantity_reserved),
            ));
        }
        if self.quantity_reserved > self.quantity_on_hand {
            return Err(IntegrityError::violation(
                self.lot_id,
                format!(
                    "quantity_reserved ({}) exceeds quantity_on_hand ({})",
                    self.quantity_reserved, self.quantity_on_hand
                ),
            ));
        }

        // Depletion/reactivation tracking; an Expiry fold is terminal.
        if self.status != LotStatus::Expired && self.status != LotStatus::Quarantined {
            self.status = if self.quantity_on_hand == 0 {
                LotStatus::Depleted
            } else {
                LotStatus::Active
            };
        }

        self.version = committed.lot_sequence;
        Ok(())
    }
}
