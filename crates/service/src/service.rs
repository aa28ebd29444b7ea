use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use stockyard_allocation::{
    Allocation, AllocationEngine, AllocationError, AllocationOutcome, AllocationPolicy,
    AllocationStore, DemandLine, ShortfallPolicy, DEFAULT_MAX_ATTEMPTS,
};
use stockyard_core::{
    AllocationId, CorrelationId, DomainError, ExpectedVersion, IdempotencyKey, LocationId, LotId,
    PickId, ProductId,
};
use stockyard_events::{
    EventBus, InMemoryEventBus, ProjectionError, ProjectionRunner, Subscription,
};
use stockyard_inventory::{
    IntegrityError, InventoryAggregator, InventoryTotals, StockLot, StockLotRegistry,
};
use stockyard_ledger::{
    CommittedMovement, Cursor, InMemoryMovementLedger, LedgerError, MovementKind, MovementLedger,
    StockMovement,
};
use stockyard_picking::{PickError, PickOrchestrator, PickingList};

type Ledger = Arc<InMemoryMovementLedger>;
type Bus = Arc<InMemoryEventBus<CommittedMovement>>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Pick(#[from] PickError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A concurrent writer kept winning the lot's version check.
    /// Recoverable by caller retry.
    #[error("lot movement contention: gave up after {attempts} attempts")]
    Contention { attempts: u32 },

    /// Incrementally maintained state disagrees with a full ledger replay.
    /// Fatal: indicates a bug in the fold/replay path, surfaced to
    /// operators, never silently corrected.
    #[error("replay mismatch: {0}")]
    ReplayMismatch(String),
}

/// Inbound receipt from the receiving module.
///
/// The receiving flow assigns the lot id (the physical lot number on the
/// slip), which makes a retried notice replay idempotently at the ledger.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReceiptNotice {
    pub lot_id: LotId,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub received_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub correlation_id: CorrelationId,
    pub idempotency_key: IdempotencyKey,
}

/// The warehouse subsystem behind one in-process facade.
///
/// The ledger is the single source of truth; the registry is the strict
/// read the allocation engine uses; the aggregator is a read-optimized
/// cache fed by the bus (push model) with a ledger catch-up fallback, and
/// may lag writes until the next read refreshes it.
pub struct WarehouseService {
    ledger: Ledger,
    registry: Arc<StockLotRegistry>,
    store: Arc<AllocationStore>,
    bus: Bus,
    engine: AllocationEngine<Ledger, Bus>,
    orchestrator: PickOrchestrator<Ledger, Bus>,
    aggregator: RwLock<ProjectionRunner<InventoryAggregator>>,
    feed: Mutex<Subscription<CommittedMovement>>,
}

impl WarehouseService {
    pub fn new() -> Self {
        Self::with_retry_budget(DEFAULT_MAX_ATTEMPTS)
    }

    /// Construct with an explicit optimistic-retry budget for the
    /// allocation engine.
    pub fn with_retry_budget(max_attempts: u32) -> Self {
        let ledger: Ledger = Arc::new(InMemoryMovementLedger::new());
        let registry = Arc::new(StockLotRegistry::new());
        let store = Arc::new(AllocationStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let feed = bus.subscribe();

        let engine = AllocationEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&bus),
        )
        .with_max_attempts(max_attempts);

        let orchestrator = PickOrchestrator::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&bus),
        );

        Self {
            ledger,
            registry,
            store,
            bus,
            engine,
            orchestrator,
            aggregator: RwLock::new(ProjectionRunner::new(InventoryAggregator::new())),
            feed: Mutex::new(feed),
        }
    }

    // ---- inbound movements ------------------------------------------------

    /// Record an inbound receipt, creating (or idempotently replaying) the
    /// lot.
    pub fn receive(&self, notice: ReceiptNotice) -> Result<CommittedMovement, ServiceError> {
        let movement = StockMovement::new(
            notice.lot_id,
            notice.product_id,
            notice.location_id,
            MovementKind::Receipt {
                received_at: notice.received_at,
                expires_at: notice.expires_at,
            },
            notice.quantity,
            Utc::now(),
            notice.correlation_id,
            notice.idempotency_key,
        )?;
        self.append_and_publish(movement)
    }

    /// Record a manual stock correction against a lot.
    pub fn record_adjustment(
        &self,
        lot_id: LotId,
        delta: i64,
        reason: impl Into<String>,
        correlation_id: CorrelationId,
        idempotency_key: IdempotencyKey,
    ) -> Result<CommittedMovement, ServiceError> {
        let reason = reason.into();
        self.append_at_lot_version(lot_id, |lot| {
            if lot.quantity_on_hand + delta < lot.quantity_reserved {
                return Err(DomainError::invariant(format!(
                    "adjustment of {delta} would drop lot {lot_id} below its reserved quantity"
                ))
                .into());
            }
            Ok(StockMovement::new(
                lot_id,
                lot.product_id,
                lot.location_id,
                MovementKind::Adjustment {
                    reason: reason.clone(),
                },
                delta,
                Utc::now(),
                correlation_id,
                idempotency_key.clone(),
            )?)
        })
    }

    /// Record the outbound leg of a lot-to-lot transfer. The inbound leg
    /// arrives as a fresh `Receipt` at the destination, via `receive`.
    pub fn record_transfer(
        &self,
        lot_id: LotId,
        destination: LocationId,
        quantity: i64,
        correlation_id: CorrelationId,
        idempotency_key: IdempotencyKey,
    ) -> Result<CommittedMovement, ServiceError> {
        if quantity <= 0 {
            return Err(DomainError::validation("transfer quantity must be positive").into());
        }
        self.append_at_lot_version(lot_id, |lot| {
            if quantity > lot.available() {
                return Err(DomainError::invariant(format!(
                    "transfer of {quantity} exceeds available {} on lot {lot_id}",
                    lot.available()
                ))
                .into());
            }
            Ok(StockMovement::new(
                lot_id,
                lot.product_id,
                lot.location_id,
                MovementKind::Transfer { destination },
                -quantity,
                Utc::now(),
                correlation_id,
                idempotency_key.clone(),
            )?)
        })
    }

    /// Write off a lot's remaining quantity after its expiry date. Called
    /// by the external expiry scheduler; the core never auto-expires.
    pub fn record_expiry(
        &self,
        lot_id: LotId,
        correlation_id: CorrelationId,
        idempotency_key: IdempotencyKey,
    ) -> Result<CommittedMovement, ServiceError> {
        self.append_at_lot_version(lot_id, |lot| {
            if lot.quantity_reserved > 0 {
                return Err(DomainError::invariant(format!(
                    "lot {lot_id} still has {} reserved units, release them before expiry",
                    lot.quantity_reserved
                ))
                .into());
            }
            if lot.quantity_on_hand == 0 {
                return Err(
                    DomainError::invariant(format!("lot {lot_id} has nothing to write off")).into(),
                );
            }
            Ok(StockMovement::new(
                lot_id,
                lot.product_id,
                lot.location_id,
                MovementKind::Expiry,
                -lot.quantity_on_hand,
                Utc::now(),
                correlation_id,
                idempotency_key.clone(),
            )?)
        })
    }

    // ---- allocation lifecycle ---------------------------------------------

    pub fn allocate(
        &self,
        demand: &DemandLine,
        policy: AllocationPolicy,
        shortfall: ShortfallPolicy,
    ) -> Result<AllocationOutcome, ServiceError> {
        Ok(self.engine.allocate(demand, policy, shortfall)?)
    }

    pub fn release(&self, allocation_id: AllocationId) -> Result<Allocation, ServiceError> {
        Ok(self.engine.release(allocation_id)?)
    }

    pub fn confirm(&self, allocation_id: AllocationId) -> Result<Allocation, ServiceError> {
        Ok(self.engine.confirm(allocation_id)?)
    }

    pub fn allocation(&self, allocation_id: AllocationId) -> Option<Allocation> {
        self.store.get(allocation_id)
    }

    // ---- picking lifecycle ------------------------------------------------

    pub fn create_pick(
        &self,
        allocation_ids: &[AllocationId],
    ) -> Result<PickingList, ServiceError> {
        Ok(self.orchestrator.create_pick(allocation_ids)?)
    }

    pub fn advance_pick(
        &self,
        pick_id: PickId,
        sequence: u32,
        quantity: i64,
    ) -> Result<PickingList, ServiceError> {
        Ok(self.orchestrator.advance_pick(pick_id, sequence, quantity)?)
    }

    pub fn cancel_pick(&self, pick_id: PickId) -> Result<PickingList, ServiceError> {
        Ok(self.orchestrator.cancel_pick(pick_id)?)
    }

    pub fn pick(&self, pick_id: PickId) -> Option<PickingList> {
        self.orchestrator.get(pick_id)
    }

    // ---- reads ------------------------------------------------------------

    /// Strictly consistent lot read through the registry.
    pub fn lot(&self, lot_id: LotId) -> Result<Option<StockLot>, ServiceError> {
        self.registry.catch_up(&self.ledger)?;
        Ok(self.registry.get(lot_id))
    }

    /// On-hand / reserved / available totals from the aggregator.
    pub fn inventory_snapshot(
        &self,
        product_id: ProductId,
        location_id: Option<LocationId>,
    ) -> Result<InventoryTotals, ServiceError> {
        self.refresh_aggregator()?;
        let runner = self
            .aggregator
            .read()
            .map_err(|_| DomainError::lock_poisoned("inventory aggregator"))?;
        Ok(runner.projection().totals(product_id, location_id))
    }

    /// Read-only feed of committed movements for the audit collaborator.
    /// Delivery is at-least-once and fire-and-forget; the ledger's own
    /// durability never depends on it.
    pub fn subscribe_movements(&self) -> Subscription<CommittedMovement> {
        self.bus.subscribe()
    }

    /// Verify that incrementally maintained state equals a full replay of
    /// the ledger from empty, for both the registry and the aggregator.
    pub fn verify_integrity(&self) -> Result<(), ServiceError> {
        self.registry.catch_up(&self.ledger)?;
        let replayed = StockLotRegistry::new();
        replayed.rebuild(&self.ledger)?;

        let live = self.registry.snapshot();
        let replay = replayed.snapshot();
        if live != replay {
            return Err(ServiceError::ReplayMismatch(first_lot_mismatch(
                &live, &replay,
            )));
        }

        self.refresh_aggregator()?;
        let mut rebuilt = ProjectionRunner::new(InventoryAggregator::new());
        rebuilt
            .rebuild_from_scratch(&self.ledger.read_since(Cursor::start()))
            .map_err(projection_error)?;

        let runner = self
            .aggregator
            .read()
            .map_err(|_| DomainError::lock_poisoned("inventory aggregator"))?;
        if runner.projection().snapshot() != rebuilt.projection().snapshot() {
            return Err(ServiceError::ReplayMismatch(
                "aggregate totals diverge from full replay".to_string(),
            ));
        }
        Ok(())
    }

    // ---- internals --------------------------------------------------------

    fn lot_state(&self, lot_id: LotId) -> Result<StockLot, ServiceError> {
        self.registry.catch_up(&self.ledger)?;
        self.registry
            .get(lot_id)
            .ok_or_else(|| DomainError::not_found().into())
    }

    fn append_and_publish(
        &self,
        movement: StockMovement,
    ) -> Result<CommittedMovement, ServiceError> {
        let committed = self.ledger.append(movement, ExpectedVersion::Any)?;
        // Lost publications are recoverable by ledger replay.
        if let Err(e) = self.bus.publish(committed.clone()) {
            warn!(error = ?e, "failed to publish committed movement");
        }
        self.registry.catch_up(&self.ledger)?;
        Ok(committed)
    }

    /// Append a collaborator movement under the lot's current version.
    ///
    /// `build` re-checks its guard against every re-read, so the committed
    /// movement can never reflect lot state the guard did not see; a
    /// reservation landing between the read and the append costs a retry,
    /// not an integrity violation.
    fn append_at_lot_version<F>(
        &self,
        lot_id: LotId,
        build: F,
    ) -> Result<CommittedMovement, ServiceError>
    where
        F: Fn(&StockLot) -> Result<StockMovement, ServiceError>,
    {
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            let lot = self.lot_state(lot_id)?;
            let movement = build(&lot)?;
            match self.ledger.append(movement, ExpectedVersion::Exact(lot.version)) {
                Ok(committed) => {
                    // Lost publications are recoverable by ledger replay.
                    if let Err(e) = self.bus.publish(committed.clone()) {
                        warn!(error = ?e, "failed to publish committed movement");
                    }
                    self.registry.catch_up(&self.ledger)?;
                    return Ok(committed);
                }
                Err(LedgerError::Conflict(detail)) => {
                    debug!(lot = %lot_id, detail, "lot movement conflicted, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Contention {
            attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Fold pushed movements into the aggregator, falling back to a ledger
    /// catch-up whenever the feed shows a gap or missed a publication.
    fn refresh_aggregator(&self) -> Result<(), ServiceError> {
        let feed = self
            .feed
            .lock()
            .map_err(|_| DomainError::lock_poisoned("aggregator feed"))?;
        let pushed = feed.drain();

        let mut runner = self
            .aggregator
            .write()
            .map_err(|_| DomainError::lock_poisoned("inventory aggregator"))?;

        for movement in &pushed {
            match runner.apply(movement) {
                Ok(()) => {}
                Err(ProjectionError::SequenceGap { .. }) => {
                    let tail = self.ledger.read_since(Cursor(runner.cursor()));
                    runner.run(&tail).map_err(projection_error)?;
                }
                Err(e) => return Err(projection_error(e)),
            }
        }

        // Top up from the ledger so reads see everything committed so far.
        let tail = self.ledger.read_since(Cursor(runner.cursor()));
        runner.run(&tail).map_err(projection_error)?;
        Ok(())
    }
}

impl Default for WarehouseService {
    fn default() -> Self {
        Self::new()
    }
}

fn projection_error(e: ProjectionError<IntegrityError>) -> ServiceError {
    match e {
        ProjectionError::SequenceGap { last, found } => {
            ServiceError::Integrity(IntegrityError::SequenceGap { last, found })
        }
        ProjectionError::Apply(e) => ServiceError::Integrity(e),
    }
}

fn first_lot_mismatch(live: &[StockLot], replay: &[StockLot]) -> String {
    for (a, b) in live.iter().zip(replay.iter()) {
        if a != b {
            return format!("lot {} diverges from full replay", a.lot_id);
        }
    }
    format!(
        "registry holds {} lots, full replay holds {}",
        live.len(),
        replay.len()
    )
}
