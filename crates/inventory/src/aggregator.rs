use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use stockyard_core::{LocationId, ProductId};
use stockyard_events::Projection;
use stockyard_ledger::{CommittedMovement, MovementKind};

use crate::lot::IntegrityError;

/// On-hand / reserved / available totals for one product+location.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryTotals {
    pub on_hand: i64,
    pub reserved: i64,
}

impl InventoryTotals {
    pub fn available(&self) -> i64 {
        self.on_hand - self.reserved
    }
}

/// Read-optimized inventory cache, updated incrementally on every ledger
/// append (push model) and fully rebuildable by replay.
///
/// Never a source of truth for allocation decisions: the engine reads the
/// registry directly. Callers that can tolerate one append cycle of lag
/// read here.
#[derive(Debug, Default)]
pub struct InventoryAggregator {
    totals: HashMap<(ProductId, LocationId), InventoryTotals>,
}

impl InventoryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_hand(&self, product_id: ProductId, location_id: Option<LocationId>) -> i64 {
        self.sum(product_id, location_id, |t| t.on_hand)
    }

    pub fn reserved(&self, product_id: ProductId, location_id: Option<LocationId>) -> i64 {
        self.sum(product_id, location_id, |t| t.reserved)
    }

    pub fn available(&self, product_id: ProductId, location_id: Option<LocationId>) -> i64 {
        self.on_hand(product_id, location_id) - self.reserved(product_id, location_id)
    }

    pub fn totals(&self, product_id: ProductId, location_id: Option<LocationId>) -> InventoryTotals {
        InventoryTotals {
            on_hand: self.on_hand(product_id, location_id),
            reserved: self.reserved(product_id, location_id),
        }
    }

    fn sum(
        &self,
        product_id: ProductId,
        location_id: Option<LocationId>,
        f: impl Fn(&InventoryTotals) -> i64,
    ) -> i64 {
        self.totals
            .iter()
            .filter(|((p, l), _)| *p == product_id && location_id.is_none_or(|loc| *l == loc))
            .map(|(_, t)| f(t))
            .sum()
    }

    /// Deterministic dump for replay-equivalence comparisons.
    pub fn snapshot(&self) -> Vec<((ProductId, LocationId), InventoryTotals)> {
        let mut entries: Vec<_> = self.totals.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by_key(|(k, _)| *k);
        entries
    }
}

impl Projection for InventoryAggregator {
    type Msg = CommittedMovement;
    type Error = IntegrityError;

    fn apply(&mut self, message: &CommittedMovement) -> Result<(), IntegrityError> {
        let m = &message.movement;
        let entry = self
            .totals
            .entry((m.product_id, m.location_id))
            .or_default();

        match &m.kind {
            MovementKind::Receipt { .. }
            | MovementKind::Adjustment { .. }
            | MovementKind::Transfer { .. }
            | MovementKind::Expiry => {
                entry.on_hand += m.quantity_delta;
            }
            MovementKind::Reservation { .. } | MovementKind::ReservationRelease { .. } => {
                entry.reserved += m.quantity_delta;
            }
            MovementKind::Pick { .. } => {
                entry.on_hand += m.quantity_delta;
                entry.reserved += m.quantity_delta;
            }
        }

        if entry.on_hand < 0 || entry.reserved < 0 || entry.reserved > entry.on_hand {
            return Err(IntegrityError::violation(
                m.lot_id,
                format!(
                    "aggregate totals inconsistent (on_hand={}, reserved={})",
                    entry.on_hand, entry.reserved
                ),
            ));
        }

        Ok(())
    }

    fn clear(&mut self) {
        self.totals.clear();
    }
}
