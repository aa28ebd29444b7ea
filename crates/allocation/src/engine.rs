use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use stockyard_core::{AllocationId, DomainError, ExpectedVersion, IdempotencyKey};
use stockyard_events::EventBus;
use stockyard_inventory::{IntegrityError, StockLot, StockLotRegistry};
use stockyard_ledger::{
    CommittedMovement, LedgerError, MovementKind, MovementLedger, StockMovement,
};

use crate::allocation::{Allocation, AllocationStatus, AllocationStore};
use crate::policy::{AllocationPolicy, DemandLine, ShortfallPolicy};

/// Default bound on optimistic retries before giving up with `Contention`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum AllocationError {
    /// Available stock cannot cover the demand under the requested policy.
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },

    /// The optimistic retry budget was exhausted without committing a full
    /// reservation set. No reservations remain held.
    #[error("allocation contention: gave up after {attempts} attempts")]
    Contention { attempts: u32 },

    /// The allocation is not in a state that permits the operation.
    #[error("invalid allocation state: {0}")]
    InvalidState(String),

    /// No allocation with that id.
    #[error("allocation not found")]
    NotFound,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Result of a successful `allocate` call.
///
/// `shortfall` is zero for a fully covered demand; under
/// `ShortfallPolicy::Partial` it reports the uncovered remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOutcome {
    pub allocations: Vec<Allocation>,
    pub shortfall: i64,
}

impl AllocationOutcome {
    pub fn allocated_quantity(&self) -> i64 {
        self.allocations.iter().map(|a| a.quantity).sum()
    }
}

/// The allocation engine: translates demand into per-lot reservations.
///
/// Every claim is a `Reservation` movement appended under
/// `ExpectedVersion::Exact(lot.version)`, so two engines racing for the
/// same lot cannot both win; the loser releases whatever it already
/// committed in that attempt and re-selects from fresh registry state.
pub struct AllocationEngine<L, B> {
    ledger: L,
    registry: Arc<StockLotRegistry>,
    store: Arc<AllocationStore>,
    bus: B,
    max_attempts: u32,
}

impl<L, B> AllocationEngine<L, B>
where
    L: MovementLedger,
    B: EventBus<CommittedMovement>,
{
    pub fn new(
        ledger: L,
        registry: Arc<StockLotRegistry>,
        store: Arc<AllocationStore>,
        bus: B,
    ) -> Self {
        Self {
            ledger,
            registry,
            store,
            bus,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn store(&self) -> &Arc<AllocationStore> {
        &self.store
    }

    /// Allocate `demand` against specific lots, in policy order.
    ///
    /// Selection is greedy: consume the first candidate fully before moving
    /// to the next. Under `AllOrNothing` a demand the candidates cannot
    /// cover fails with `InsufficientStock` and reserves nothing; under
    /// `Partial` whatever is available is reserved and the remainder is
    /// reported as `shortfall`.
    pub fn allocate(
        &self,
        demand: &DemandLine,
        policy: AllocationPolicy,
        shortfall_policy: ShortfallPolicy,
    ) -> Result<AllocationOutcome, AllocationError> {
        if demand.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "demand quantity must be positive, got {}",
                demand.quantity
            ))
            .into());
        }

        for attempt in 1..=self.max_attempts {
            self.registry.catch_up(&self.ledger)?;

            let mut candidates = self
                .registry
                .available_lots(demand.product_id, demand.location_hint);
            policy.order(&mut candidates);

            let available: i64 = candidates.iter().map(StockLot::available).sum();
            if available < demand.quantity
                && matches!(shortfall_policy, ShortfallPolicy::AllOrNothing)
            {
                return Err(AllocationError::InsufficientStock {
                    requested: demand.quantity,
                    available,
                });
            }
            if available == 0 {
                return Err(AllocationError::InsufficientStock {
                    requested: demand.quantity,
                    available: 0,
                });
            }

            match self.try_reserve(demand, &candidates)? {
                Some(allocations) => {
                    let allocated: i64 = allocations.iter().map(|a| a.quantity).sum();
                    debug!(
                        correlation = %demand.correlation_id,
                        requested = demand.quantity,
                        allocated,
                        lots = allocations.len(),
                        attempt,
                        "demand allocated"
                    );
                    return Ok(AllocationOutcome {
                        allocations,
                        shortfall: demand.quantity - allocated,
                    });
                }
                // Lost a lot to a concurrent writer; re-select from fresh state.
                None => continue,
            }
        }

        Err(AllocationError::Contention {
            attempts: self.max_attempts,
        })
    }

    /// One reservation attempt over an ordered candidate list.
    ///
    /// Returns `Ok(None)` when a per-lot version conflict interrupted the
    /// batch; everything committed before the conflict has been released
    /// again, so the caller may retry cleanly.
    fn try_reserve(
        &self,
        demand: &DemandLine,
        candidates: &[StockLot],
    ) -> Result<Option<Vec<Allocation>>, AllocationError> {
        let mut remaining = demand.quantity;
        let mut reserved: Vec<Allocation> = Vec::new();

        for lot in candidates {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(lot.available());
            if take <= 0 {
                continue;
            }

            let allocation_id = AllocationId::new();
            let movement = StockMovement::new(
                lot.lot_id,
                lot.product_id,
                lot.location_id,
                MovementKind::Reservation { allocation_id },
                take,
                Utc::now(),
                demand.correlation_id,
                reserve_key(allocation_id),
            )?;

            match self
                .ledger
                .append(movement, ExpectedVersion::Exact(lot.version))
            {
                Ok(committed) => {
                    let allocation = Allocation {
                        allocation_id,
                        lot_id: lot.lot_id,
                        product_id: lot.product_id,
                        location_id: lot.location_id,
                        quantity: take,
                        status: AllocationStatus::Reserved,
                        correlation_id: demand.correlation_id,
                        created_at: committed.movement.occurred_at,
                    };
                    self.store.insert(allocation.clone())?;
                    self.publish(committed);
                    reserved.push(allocation);
                    remaining -= take;
                }
                Err(LedgerError::Conflict(detail)) => {
                    debug!(
                        lot = %lot.lot_id,
                        correlation = %demand.correlation_id,
                        detail,
                        "reservation conflict, compensating and retrying"
                    );
                    self.compensate(&reserved)?;
                    return Ok(None);
                }
                Err(e) => {
                    // A structural failure will not improve on retry. Undo
                    // the partial batch before surfacing it.
                    self.compensate(&reserved)?;
                    return Err(e.into());
                }
            }
        }

        Ok(Some(reserved))
    }

    /// Release every reservation committed by an interrupted attempt.
    fn compensate(&self, reserved: &[Allocation]) -> Result<(), AllocationError> {
        for allocation in reserved {
            self.append_release(allocation)?;
            self.store.transition(
                allocation.allocation_id,
                AllocationStatus::Reserved,
                AllocationStatus::Released,
            )?;
        }
        Ok(())
    }

    /// Confirm a reserved allocation. Pure state transition; the stock stays
    /// reserved in the ledger until picked or released.
    pub fn confirm(&self, allocation_id: AllocationId) -> Result<Allocation, AllocationError> {
        self.transition_checked(allocation_id, AllocationStatus::Confirmed)
    }

    /// Release a reserved allocation, returning its quantity to available
    /// stock. Confirmed allocations are released through pick cancellation,
    /// never directly.
    ///
    /// The store transition is the serialization point: only the caller
    /// that wins it appends the `ReservationRelease` movement, so a doubly
    /// submitted release produces exactly one movement.
    pub fn release(&self, allocation_id: AllocationId) -> Result<Allocation, AllocationError> {
        let current = self
            .store
            .get(allocation_id)
            .ok_or(AllocationError::NotFound)?;
        if current.status != AllocationStatus::Reserved {
            return Err(AllocationError::InvalidState(format!(
                "allocation {allocation_id} is {}, only reserved allocations can be released",
                current.status
            )));
        }

        let released = self.transition_checked(allocation_id, AllocationStatus::Released)?;
        self.append_release(&released)?;
        Ok(released)
    }

    fn transition_checked(
        &self,
        allocation_id: AllocationId,
        to: AllocationStatus,
    ) -> Result<Allocation, AllocationError> {
        let current = self
            .store
            .get(allocation_id)
            .ok_or(AllocationError::NotFound)?;

        self.store
            .transition(allocation_id, current.status, to)
            .map_err(|e| match e {
                DomainError::InvariantViolation(detail) => AllocationError::InvalidState(detail),
                DomainError::NotFound => AllocationError::NotFound,
                other => other.into(),
            })
    }

    fn append_release(&self, allocation: &Allocation) -> Result<(), AllocationError> {
        let movement = StockMovement::new(
            allocation.lot_id,
            allocation.product_id,
            allocation.location_id,
            MovementKind::ReservationRelease {
                allocation_id: allocation.allocation_id,
            },
            -allocation.quantity,
            Utc::now(),
            allocation.correlation_id,
            release_key(allocation.allocation_id),
        )?;
        let committed = self.ledger.append(movement, ExpectedVersion::Any)?;
        self.publish(committed);
        Ok(())
    }

    fn publish(&self, committed: CommittedMovement) {
        // Lost publications are recoverable by ledger replay.
        if let Err(e) = self.bus.publish(committed) {
            warn!(error = ?e, "failed to publish committed movement");
        }
    }
}

/// Deterministic key so a retried reservation append dedupes at the ledger.
fn reserve_key(allocation_id: AllocationId) -> IdempotencyKey {
    IdempotencyKey::new(format!("reserve-{allocation_id}"))
        .unwrap_or_else(|_| unreachable!("formatted key is never empty"))
}

fn release_key(allocation_id: AllocationId) -> IdempotencyKey {
    IdempotencyKey::new(format!("release-{allocation_id}"))
        .unwrap_or_else(|_| unreachable!("formatted key is never empty"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};
    use std::sync::atomic::{AtomicU32, Ordering};
    use stockyard_core::{CorrelationId, LocationId, LotId, ProductId};
    use stockyard_events::InMemoryEventBus;
    use stockyard_ledger::{Cursor, InMemoryMovementLedger};

    type TestEngine = AllocationEngine<Arc<InMemoryMovementLedger>, Arc<InMemoryEventBus<CommittedMovement>>>;

    struct Fixture {
        ledger: Arc<InMemoryMovementLedger>,
        registry: Arc<StockLotRegistry>,
        engine: TestEngine,
        product: ProductId,
        location: LocationId,
    }

    impl Fixture {
        fn new() -> Self {
            let ledger = Arc::new(InMemoryMovementLedger::new());
            let registry = Arc::new(StockLotRegistry::new());
            let engine = AllocationEngine::new(
                Arc::clone(&ledger),
                Arc::clone(&registry),
                Arc::new(AllocationStore::new()),
                Arc::new(InMemoryEventBus::new()),
            );
            Self {
                ledger,
                registry,
                engine,
                product: ProductId::new(),
                location: LocationId::new(),
            }
        }

        fn receive(
            &self,
            qty: i64,
            received_at: DateTime<Utc>,
            expires_at: Option<DateTime<Utc>>,
        ) -> LotId {
            let lot = LotId::new();
            let movement = StockMovement::new(
                lot,
                self.product,
                self.location,
                MovementKind::Receipt {
                    received_at,
                    expires_at,
                },
                qty,
                Utc::now(),
                CorrelationId::new(),
                IdempotencyKey::new(format!("receipt-{lot}")).unwrap(),
            )
            .unwrap();
            self.ledger.append(movement, ExpectedVersion::Any).unwrap();
            lot
        }

        fn demand(&self, qty: i64) -> DemandLine {
            DemandLine {
                product_id: self.product,
                quantity: qty,
                location_hint: None,
                correlation_id: CorrelationId::new(),
            }
        }
    }

    #[test]
    fn fifo_consumes_the_oldest_lot_first() {
        let f = Fixture::new();
        let now = Utc::now();
        let old = f.receive(40, now - Duration::days(5), None);
        let new = f.receive(40, now - Duration::days(1), None);

        let outcome = f
            .engine
            .allocate(&f.demand(50), AllocationPolicy::Fifo, ShortfallPolicy::AllOrNothing)
            .unwrap();

        assert_eq!(outcome.shortfall, 0);
        assert_eq!(outcome.allocations.len(), 2);
        assert_eq!(outcome.allocations[0].lot_id, old);
        assert_eq!(outcome.allocations[0].quantity, 40);
        assert_eq!(outcome.allocations[1].lot_id, new);
        assert_eq!(outcome.allocations[1].quantity, 10);
    }

    #[test]
    fn fefo_prefers_the_soonest_expiry_over_receipt_order() {
        // Lot A: 100 units, received day 1, expires day 30.
        // Lot B: 50 units, received day 2, expires day 10.
        // FEFO demand for 120 takes all 50 from B, then 70 from A.
        let f = Fixture::new();
        let day = |d: i64| Utc::now() - Duration::days(40 - d);
        let lot_a = f.receive(100, day(1), Some(Utc::now() + Duration::days(30)));
        let lot_b = f.receive(50, day(2), Some(Utc::now() + Duration::days(10)));

        let outcome = f
            .engine
            .allocate(&f.demand(120), AllocationPolicy::Fefo, ShortfallPolicy::AllOrNothing)
            .unwrap();

        assert_eq!(outcome.allocations.len(), 2);
        assert_eq!(outcome.allocations[0].lot_id, lot_b);
        assert_eq!(outcome.allocations[0].quantity, 50);
        assert_eq!(outcome.allocations[1].lot_id, lot_a);
        assert_eq!(outcome.allocations[1].quantity, 70);
    }

    #[test]
    fn all_or_nothing_shortfall_reserves_nothing() {
        let f = Fixture::new();
        f.receive(30, Utc::now(), None);

        let err = f
            .engine
            .allocate(&f.demand(50), AllocationPolicy::Fifo, ShortfallPolicy::AllOrNothing)
            .unwrap_err();

        match err {
            AllocationError::InsufficientStock { requested, available } => {
                assert_eq!(requested, 50);
                assert_eq!(available, 30);
            }
            other => panic!("expected InsufficientStock, got {other:?}"),
        }

        // Nothing was claimed: the single receipt is still the only movement.
        assert_eq!(f.ledger.read_since(Cursor::start()).len(), 1);
    }

    #[test]
    fn partial_policy_reports_the_shortfall() {
        let f = Fixture::new();
        f.receive(30, Utc::now(), None);

        let outcome = f
            .engine
            .allocate(&f.demand(50), AllocationPolicy::Fifo, ShortfallPolicy::Partial)
            .unwrap();

        assert_eq!(outcome.allocated_quantity(), 30);
        assert_eq!(outcome.shortfall, 20);
    }

    #[test]
    fn release_returns_stock_to_available() {
        let f = Fixture::new();
        let lot = f.receive(30, Utc::now(), None);

        let outcome = f
            .engine
            .allocate(&f.demand(30), AllocationPolicy::Fifo, ShortfallPolicy::AllOrNothing)
            .unwrap();
        let allocation_id = outcome.allocations[0].allocation_id;

        f.registry.catch_up(&f.ledger).unwrap();
        assert_eq!(f.registry.get(lot).unwrap().available(), 0);

        let released = f.engine.release(allocation_id).unwrap();
        assert_eq!(released.status, AllocationStatus::Released);

        f.registry.catch_up(&f.ledger).unwrap();
        assert_eq!(f.registry.get(lot).unwrap().available(), 30);
    }

    #[test]
    fn double_release_is_an_invalid_state() {
        let f = Fixture::new();
        f.receive(10, Utc::now(), None);

        let outcome = f
            .engine
            .allocate(&f.demand(10), AllocationPolicy::Fifo, ShortfallPolicy::AllOrNothing)
            .unwrap();
        let allocation_id = outcome.allocations[0].allocation_id;

        f.engine.release(allocation_id).unwrap();
        let err = f.engine.release(allocation_id).unwrap_err();
        assert!(matches!(err, AllocationError::InvalidState(_)));

        // Exactly one release movement exists despite the retry.
        let releases = f
            .ledger
            .read_since(Cursor::start())
            .into_iter()
            .filter(|c| matches!(c.movement.kind, MovementKind::ReservationRelease { .. }))
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn confirmed_allocations_cannot_be_confirmed_again_or_released_directly() {
        let f = Fixture::new();
        f.receive(10, Utc::now(), None);

        let outcome = f
            .engine
            .allocate(&f.demand(10), AllocationPolicy::Fifo, ShortfallPolicy::AllOrNothing)
            .unwrap();
        let allocation_id = outcome.allocations[0].allocation_id;

        let confirmed = f.engine.confirm(allocation_id).unwrap();
        assert_eq!(confirmed.status, AllocationStatus::Confirmed);
        assert!(matches!(
            f.engine.confirm(allocation_id).unwrap_err(),
            AllocationError::InvalidState(_)
        ));

        // A confirmed allocation only unwinds through pick cancellation.
        assert!(matches!(
            f.engine.release(allocation_id).unwrap_err(),
            AllocationError::InvalidState(_)
        ));
    }

    #[test]
    fn unknown_allocation_is_not_found() {
        let f = Fixture::new();
        assert!(matches!(
            f.engine.release(AllocationId::new()).unwrap_err(),
            AllocationError::NotFound
        ));
    }

    /// Ledger wrapper that fails the first `failures` reservation appends
    /// with a version conflict, simulating a concurrent writer.
    struct ContendedLedger {
        inner: Arc<InMemoryMovementLedger>,
        failures: AtomicU32,
    }

    impl MovementLedger for ContendedLedger {
        fn append(
            &self,
            movement: StockMovement,
            expected: ExpectedVersion,
        ) -> Result<CommittedMovement, LedgerError> {
            if matches!(movement.kind, MovementKind::Reservation { .. })
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(LedgerError::Conflict("simulated concurrent writer".into()));
            }
            self.inner.append(movement, expected)
        }

        fn read_since(&self, cursor: Cursor) -> Vec<CommittedMovement> {
            self.inner.read_since(cursor)
        }

        fn lot_version(&self, lot_id: LotId) -> u64 {
            self.inner.lot_version(lot_id)
        }

        fn head(&self) -> Cursor {
            self.inner.head()
        }
    }

    fn contended_fixture(failures: u32, max_attempts: u32) -> (Fixture, TestEngineContended) {
        let f = Fixture::new();
        let engine = AllocationEngine::new(
            ContendedLedger {
                inner: Arc::clone(&f.ledger),
                failures: AtomicU32::new(failures),
            },
            Arc::clone(&f.registry),
            Arc::new(AllocationStore::new()),
            Arc::new(InMemoryEventBus::new()),
        )
        .with_max_attempts(max_attempts);
        (f, engine)
    }

    type TestEngineContended =
        AllocationEngine<ContendedLedger, Arc<InMemoryEventBus<CommittedMovement>>>;

    #[test]
    fn conflicts_are_retried_until_the_reservation_commits() {
        let (f, engine) = contended_fixture(2, 5);
        f.receive(20, Utc::now(), None);

        let outcome = engine
            .allocate(&f.demand(15), AllocationPolicy::Fifo, ShortfallPolicy::AllOrNothing)
            .unwrap();
        assert_eq!(outcome.allocated_quantity(), 15);
    }

    #[test]
    fn exhausted_retry_budget_reports_contention_and_holds_nothing() {
        let (f, engine) = contended_fixture(10, 3);
        f.receive(20, Utc::now(), None);

        let err = engine
            .allocate(&f.demand(15), AllocationPolicy::Fifo, ShortfallPolicy::AllOrNothing)
            .unwrap_err();
        assert!(matches!(err, AllocationError::Contention { attempts: 3 }));

        // Every attempt was compensated: no reservation survives.
        f.registry.catch_up(&f.ledger).unwrap();
        let lots = f.registry.available_lots(f.product, None);
        assert_eq!(lots[0].quantity_reserved, 0);
    }

    #[test]
    fn mid_batch_conflict_releases_the_partial_batch() {
        let f = Fixture::new();
        let now = Utc::now();
        f.receive(10, now - Duration::days(2), None);
        f.receive(10, now - Duration::days(1), None);

        // Fail only the second reservation of the first attempt.
        let engine = AllocationEngine::new(
            SecondAppendConflicts {
                inner: Arc::clone(&f.ledger),
                seen: AtomicU32::new(0),
            },
            Arc::clone(&f.registry),
            Arc::new(AllocationStore::new()),
            Arc::new(InMemoryEventBus::new()),
        );

        let outcome = engine
            .allocate(&f.demand(15), AllocationPolicy::Fifo, ShortfallPolicy::AllOrNothing)
            .unwrap();
        assert_eq!(outcome.allocated_quantity(), 15);

        // The first attempt's lone reservation was compensated, so the
        // ledger holds a matching release.
        let movements = f.ledger.read_since(Cursor::start());
        let reserves = movements
            .iter()
            .filter(|c| matches!(c.movement.kind, MovementKind::Reservation { .. }))
            .count();
        let releases = movements
            .iter()
            .filter(|c| matches!(c.movement.kind, MovementKind::ReservationRelease { .. }))
            .count();
        assert_eq!(reserves, 3);
        assert_eq!(releases, 1);

        f.registry.catch_up(&f.ledger).unwrap();
        let total_reserved: i64 = f
            .registry
            .snapshot()
            .iter()
            .map(|l| l.quantity_reserved)
            .sum();
        assert_eq!(total_reserved, 15);
    }

    struct SecondAppendConflicts {
        inner: Arc<InMemoryMovementLedger>,
        seen: AtomicU32,
    }

    impl MovementLedger for SecondAppendConflicts {
        fn append(
            &self,
            movement: StockMovement,
            expected: ExpectedVersion,
        ) -> Result<CommittedMovement, LedgerError> {
            if matches!(movement.kind, MovementKind::Reservation { .. })
                && self.seen.fetch_add(1, Ordering::SeqCst) == 1
            {
                return Err(LedgerError::Conflict("simulated concurrent writer".into()));
            }
            self.inner.append(movement, expected)
        }

        fn read_since(&self, cursor: Cursor) -> Vec<CommittedMovement> {
            self.inner.read_since(cursor)
        }

        fn lot_version(&self, lot_id: LotId) -> u64 {
            self.inner.lot_version(lot_id)
        }

        fn head(&self) -> Cursor {
            self.inner.head()
        }
    }
}
