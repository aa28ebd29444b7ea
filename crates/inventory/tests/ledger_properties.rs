//! Property tests: conservation and replay equivalence.
//!
//! Random but legal movement sequences are interpreted against the ledger;
//! afterwards the derived views must agree with a full replay from empty,
//! and every lot's quantity must equal the sum of its signed deltas.

use chrono::{Duration, Utc};
use proptest::prelude::*;

use stockyard_core::{
    AllocationId, CorrelationId, ExpectedVersion, IdempotencyKey, LocationId, LotId, ProductId,
};
use stockyard_events::ProjectionRunner;
use stockyard_inventory::{InventoryAggregator, StockLotRegistry};
use stockyard_ledger::{
    Cursor, InMemoryMovementLedger, MovementKind, MovementLedger, StockMovement,
};

#[derive(Debug, Clone)]
enum Op {
    Receive { product: usize, qty: i64, age_days: i64 },
    Reserve { lot: usize, qty: i64 },
    Release { reservation: usize },
    Pick { reservation: usize, qty: i64 },
    Adjust { lot: usize, delta: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3, 1i64..60, 0i64..30)
            .prop_map(|(product, qty, age_days)| Op::Receive { product, qty, age_days }),
        (0usize..8, 1i64..40).prop_map(|(lot, qty)| Op::Reserve { lot, qty }),
        (0usize..8).prop_map(|reservation| Op::Release { reservation }),
        (0usize..8, 1i64..40).prop_map(|(reservation, qty)| Op::Pick { reservation, qty }),
        (0usize..8, -20i64..20).prop_map(|(lot, delta)| Op::Adjust { lot, delta }),
    ]
}

struct Harness {
    ledger: InMemoryMovementLedger,
    registry: StockLotRegistry,
    aggregator: ProjectionRunner<InventoryAggregator>,
    products: Vec<ProductId>,
    location: LocationId,
    lots: Vec<LotId>,
    reservations: Vec<(AllocationId, LotId, i64)>,
    correlation: CorrelationId,
    counter: u64,
}

impl Harness {
    fn new() -> Self {
        Self {
            ledger: InMemoryMovementLedger::new(),
            registry: StockLotRegistry::new(),
            aggregator: ProjectionRunner::new(InventoryAggregator::new()),
            products: (0..3).map(|_| ProductId::new()).collect(),
            location: LocationId::new(),
            lots: Vec::new(),
            reservations: Vec::new(),
            correlation: CorrelationId::new(),
            counter: 0,
        }
    }

    fn next_key(&mut self) -> IdempotencyKey {
        self.counter += 1;
        IdempotencyKey::new(format!("op-{}", self.counter)).unwrap()
    }

    fn append(&mut self, lot: LotId, product: ProductId, kind: MovementKind, delta: i64) {
        let key = self.next_key();
        let movement = StockMovement::new(
            lot,
            product,
            self.location,
            kind,
            delta,
            Utc::now(),
            self.correlation,
            key,
        )
        .expect("interpreter only emits structurally valid movements");
        self.ledger
            .append(movement, ExpectedVersion::Any)
            .expect("interpreter only emits legal appends");

        // Incremental path: registry pulls, aggregator gets pushed.
        self.registry.catch_up(&self.ledger).unwrap();
        let head = self.ledger.read_since(Cursor(self.aggregator.cursor()));
        self.aggregator.run(&head).unwrap();
    }

    fn run(&mut self, op: &Op) {
        match *op {
            Op::Receive { product, qty, age_days } => {
                let lot = LotId::new();
                let product = self.products[product % self.products.len()];
                self.append(
                    lot,
                    product,
                    MovementKind::Receipt {
                        received_at: Utc::now() - Duration::days(age_days),
                        expires_at: None,
                    },
                    qty,
                );
                self.lots.push(lot);
            }
            Op::Reserve { lot, qty } => {
                if self.lots.is_empty() {
                    return;
                }
                let lot = self.lots[lot % self.lots.len()];
                let Some(state) = self.registry.get(lot) else {
                    return;
                };
                let qty = qty.min(state.available());
                if qty <= 0 {
                    return;
                }
                let allocation_id = AllocationId::new();
                self.append(
                    lot,
                    state.product_id,
                    MovementKind::Reservation { allocation_id },
                    qty,
                );
                self.reservations.push((allocation_id, lot, qty));
            }
            Op::Release { reservation } => {
                if self.reservations.is_empty() {
                    return;
                }
                let idx = reservation % self.reservations.len();
                let (allocation_id, lot, qty) = self.reservations.swap_remove(idx);
                let product = self.registry.get(lot).unwrap().product_id;
                self.append(
                    lot,
                    product,
                    MovementKind::ReservationRelease { allocation_id },
                    -qty,
                );
            }
            Op::Pick { reservation, qty } => {
                if self.reservations.is_empty() {
                    return;
                }
                let idx = reservation % self.reservations.len();
                let (allocation_id, lot, reserved) = self.reservations[idx];
                let qty = qty.min(reserved);
                if qty <= 0 {
                    return;
                }
                let product = self.registry.get(lot).unwrap().product_id;
                self.append(
                    lot,
                    product,
                    MovementKind::Pick {
                        allocation_id,
                        pick_id: stockyard_core::PickId::new(),
                    },
                    -qty,
                );
                if qty == reserved {
                    self.reservations.swap_remove(idx);
                } else {
                    self.reservations[idx].2 -= qty;
                }
            }
            Op::Adjust { lot, delta } => {
                if self.lots.is_empty() || delta == 0 {
                    return;
                }
                let lot = self.lots[lot % self.lots.len()];
                let Some(state) = self.registry.get(lot) else {
                    return;
                };
                // Keep the adjustment legal: never below reserved quantity.
                let floor = state.quantity_reserved - state.quantity_on_hand;
                let delta = delta.max(floor);
                if delta == 0 {
                    return;
                }
                self.append(
                    lot,
                    state.product_id,
                    MovementKind::Adjustment {
                        reason: "cycle count".to_string(),
                    },
                    delta,
                );
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn conservation_and_replay_equivalence(ops in proptest::collection::vec(op_strategy(), 1..80)) {
        let mut h = Harness::new();
        for op in &ops {
            h.run(op);
        }

        let movements = h.ledger.read_since(Cursor::start());

        // Conservation: per-lot on-hand equals the sum of its on-hand deltas
        // and is never negative; reserved never exceeds on-hand.
        for lot in h.registry.snapshot() {
            let on_hand: i64 = movements
                .iter()
                .filter(|c| c.movement.lot_id == lot.lot_id)
                .filter(|c| !matches!(
                    c.movement.kind,
                    MovementKind::Reservation { .. } | MovementKind::ReservationRelease { .. }
                ))
                .map(|c| c.movement.quantity_delta)
                .sum();

            prop_assert_eq!(lot.quantity_on_hand, on_hand);
            prop_assert!(lot.quantity_on_hand >= 0);
            prop_assert!(lot.quantity_reserved >= 0);
            prop_assert!(lot.quantity_reserved <= lot.quantity_on_hand);
        }

        // Replay equivalence: incremental registry == full replay from empty.
        let replayed = StockLotRegistry::new();
        replayed.rebuild(&h.ledger).unwrap();
        prop_assert_eq!(h.registry.snapshot(), replayed.snapshot());

        // Same for the aggregator.
        let mut rebuilt = ProjectionRunner::new(InventoryAggregator::new());
        rebuilt.rebuild_from_scratch(&movements).unwrap();
        prop_assert_eq!(
            h.aggregator.projection().snapshot(),
            rebuilt.projection().snapshot()
        );
    }
}
