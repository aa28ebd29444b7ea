use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::error;

use stockyard_core::{LocationId, LotId, ProductId};
use stockyard_ledger::{CommittedMovement, Cursor, MovementKind, MovementLedger};

use crate::lot::{IntegrityError, StockLot};

#[derive(Debug, Default)]
struct RegistryInner {
    lots: HashMap<LotId, StockLot>,
    cursor: u64,
}

/// Materialized view over the ledger: current quantity, status, expiry and
/// location per lot.
///
/// This is the projection the allocation engine reads **directly** (never
/// the aggregator), so it is kept strictly consistent by pulling from the
/// ledger (`catch_up`) after every append the caller makes.
///
/// A lot whose fold hits a [`IntegrityError::LedgerIntegrityViolation`] is
/// **halted**: it is excluded from allocation, its later movements are no
/// longer folded, and the error is surfaced to operators rather than
/// silently corrected.
#[derive(Debug, Default)]
pub struct StockLotRegistry {
    inner: RwLock<RegistryInner>,
    halted: RwLock<HashSet<LotId>>,
}

impl StockLotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold every ledger movement past the registry cursor, in global order.
    ///
    /// Global-order folding makes per-lot sequences contiguous by
    /// construction, so concurrent callers may race to catch up without
    /// ever observing a gap. Returns the first integrity violation hit;
    /// healthy lots keep folding past a broken one.
    pub fn catch_up<L: MovementLedger>(&self, ledger: &L) -> Result<(), IntegrityError> {
        let mut inner = match self.inner.write() {
            Ok(i) => i,
            Err(_) => return Ok(()),
        };

        let pending = ledger.read_since(Cursor(inner.cursor));
        let mut first_error: Option<IntegrityError> = None;

        for committed in &pending {
            inner.cursor = committed.sequence_number;

            let lot_id = committed.movement.lot_id;
            if self.is_halted(lot_id) {
                continue;
            }

            if let Err(e) = Self::fold(&mut inner.lots, committed) {
                error!(lot = %lot_id, error = %e, "halting lot after integrity violation");
                if let Ok(mut halted) = self.halted.write() {
                    halted.insert(lot_id);
                }
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn fold(
        lots: &mut HashMap<LotId, StockLot>,
        committed: &CommittedMovement,
    ) -> Result<(), IntegrityError> {
        let lot_id = committed.movement.lot_id;
        match lots.get_mut(&lot_id) {
            Some(lot) => lot.apply(committed),
            None => {
                if !matches!(committed.movement.kind, MovementKind::Receipt { .. }) {
                    return Err(IntegrityError::violation(
                        lot_id,
                        format!(
                            "first folded movement is '{}', expected receipt",
                            committed.movement.kind.name()
                        ),
                    ));
                }
                let lot = StockLot::from_receipt(committed)?;
                lots.insert(lot_id, lot);
                Ok(())
            }
        }
    }

    /// Rebuild from an empty state by replaying the full ledger.
    pub fn rebuild<L: MovementLedger>(&self, ledger: &L) -> Result<(), IntegrityError> {
        if let Ok(mut inner) = self.inner.write() {
            inner.lots.clear();
            inner.cursor = 0;
        }
        if let Ok(mut halted) = self.halted.write() {
            halted.clear();
        }
        self.catch_up(ledger)
    }

    pub fn get(&self, lot_id: LotId) -> Option<StockLot> {
        self.inner.read().ok()?.lots.get(&lot_id).cloned()
    }

    /// Lots that can satisfy new demand: Active status, positive available
    /// quantity, not halted. Deterministically ordered by receipt time, then
    /// lot id (the policy layer reorders for FEFO).
    pub fn available_lots(
        &self,
        product_id: ProductId,
        location_id: Option<LocationId>,
    ) -> Vec<StockLot> {
        let inner = match self.inner.read() {
            Ok(i) => i,
            Err(_) => return vec![],
        };
        let halted = self.halted.read().map(|h| h.clone()).unwrap_or_default();

        let mut lots: Vec<StockLot> = inner
            .lots
            .values()
            .filter(|lot| lot.product_id == product_id)
            .filter(|lot| location_id.is_none_or(|loc| lot.location_id == loc))
            .filter(|lot| lot.is_allocatable())
            .filter(|lot| !halted.contains(&lot.lot_id))
            .cloned()
            .collect();

        lots.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.lot_id.cmp(&b.lot_id))
        });
        lots
    }

    /// Every lot, sorted by id (replay-equivalence comparisons).
    pub fn snapshot(&self) -> Vec<StockLot> {
        let inner = match self.inner.read() {
            Ok(i) => i,
            Err(_) => return vec![],
        };
        let mut lots: Vec<StockLot> = inner.lots.values().cloned().collect();
        lots.sort_by_key(|lot| lot.lot_id);
        lots
    }

    pub fn cursor(&self) -> u64 {
        self.inner.read().map(|i| i.cursor).unwrap_or(0)
    }

    pub fn is_halted(&self, lot_id: LotId) -> bool {
        self.halted
            .read()
            .map(|h| h.contains(&lot_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use stockyard_core::{
        CorrelationId, ExpectedVersion, IdempotencyKey,
    };
    use stockyard_ledger::{InMemoryMovementLedger, StockMovement};

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::new(s).unwrap()
    }

    fn receive(
        ledger: &InMemoryMovementLedger,
        product: ProductId,
        location: LocationId,
        qty: i64,
        days_ago: i64,
        k: &str,
    ) -> LotId {
        let lot = LotId::new();
        let movement = StockMovement::new(
            lot,
            product,
            location,
            MovementKind::Receipt {
                received_at: Utc::now() - Duration::days(days_ago),
                expires_at: None,
            },
            qty,
            Utc::now(),
            CorrelationId::new(),
            key(k),
        )
        .unwrap();
        ledger.append(movement, ExpectedVersion::Any).unwrap();
        lot
    }

    #[test]
    fn catch_up_materializes_lots_from_receipts() {
        let ledger = InMemoryMovementLedger::new();
        let registry = StockLotRegistry::new();
        let product = ProductId::new();
        let location = LocationId::new();

        let lot_a = receive(&ledger, product, location, 100, 3, "r1");
        let lot_b = receive(&ledger, product, location, 50, 1, "r2");

        registry.catch_up(&ledger).unwrap();

        assert_eq!(registry.get(lot_a).unwrap().quantity_on_hand, 100);
        assert_eq!(registry.get(lot_b).unwrap().quantity_on_hand, 50);
        assert_eq!(registry.cursor(), 2);
    }

    #[test]
    fn available_lots_filters_by_product_location_and_availability() {
        let ledger = InMemoryMovementLedger::new();
        let registry = StockLotRegistry::new();
        let product = ProductId::new();
        let loc_a = LocationId::new();
        let loc_b = LocationId::new();

        let lot_a = receive(&ledger, product, loc_a, 10, 2, "r1");
        let lot_b = receive(&ledger, product, loc_b, 10, 1, "r2");
        receive(&ledger, ProductId::new(), loc_a, 10, 1, "r3");

        registry.catch_up(&ledger).unwrap();

        let all = registry.available_lots(product, None);
        assert_eq!(all.len(), 2);
        // Ordered by receipt time: lot_a (older) first.
        assert_eq!(all[0].lot_id, lot_a);

        let only_b = registry.available_lots(product, Some(loc_b));
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].lot_id, lot_b);
    }

    #[test]
    fn catch_up_is_idempotent_and_restartable() {
        let ledger = InMemoryMovementLedger::new();
        let registry = StockLotRegistry::new();
        let product = ProductId::new();
        let location = LocationId::new();

        receive(&ledger, product, location, 10, 1, "r1");
        registry.catch_up(&ledger).unwrap();
        let snapshot = registry.snapshot();

        registry.catch_up(&ledger).unwrap();
        assert_eq!(registry.snapshot(), snapshot);

        receive(&ledger, product, location, 20, 0, "r2");
        registry.catch_up(&ledger).unwrap();
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn rebuild_from_empty_matches_incremental_state() {
        let ledger = InMemoryMovementLedger::new();
        let incremental = StockLotRegistry::new();
        let product = ProductId::new();
        let location = LocationId::new();

        receive(&ledger, product, location, 100, 5, "r1");
        incremental.catch_up(&ledger).unwrap();
        receive(&ledger, product, location, 40, 2, "r2");
        incremental.catch_up(&ledger).unwrap();

        let replayed = StockLotRegistry::new();
        replayed.rebuild(&ledger).unwrap();

        assert_eq!(incremental.snapshot(), replayed.snapshot());
    }
}
