use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, warn};

use stockyard_allocation::{Allocation, AllocationStatus, AllocationStore};
use stockyard_core::{
    AllocationId, DomainError, ExpectedVersion, IdempotencyKey, PickId,
};
use stockyard_events::EventBus;
use stockyard_inventory::{IntegrityError, StockLotRegistry};
use stockyard_ledger::{CommittedMovement, MovementKind, MovementLedger, StockMovement};

use crate::list::{PickError, PickLine, PickStatus, PickingList};

/// Groups confirmed allocations into sequenced picking lists and records
/// their progress on the ledger.
///
/// Line sequencing orders by `(location, lot received_at, lot id)`: one
/// walk per location, and within a location the oldest lot leaves first, so
/// physical egress matches allocation order.
pub struct PickOrchestrator<L, B> {
    ledger: L,
    registry: Arc<StockLotRegistry>,
    store: Arc<AllocationStore>,
    bus: B,
    picks: RwLock<HashMap<PickId, PickingList>>,
}

impl<L, B> PickOrchestrator<L, B>
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
            picks: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, pick_id: PickId) -> Option<PickingList> {
        self.picks.read().ok()?.get(&pick_id).cloned()
    }

    /// Create a picking list over a set of confirmed allocations.
    ///
    /// Every allocation must exist and be `Confirmed`; anything else fails
    /// the whole call and creates nothing.
    pub fn create_pick(
        &self,
        allocation_ids: &[AllocationId],
    ) -> Result<PickingList, PickError> {
        if allocation_ids.is_empty() {
            return Err(
                DomainError::validation("a picking list needs at least one allocation").into(),
            );
        }
        let distinct: HashSet<_> = allocation_ids.iter().collect();
        if distinct.len() != allocation_ids.len() {
            return Err(DomainError::validation("duplicate allocation in pick request").into());
        }

        self.registry.catch_up(&self.ledger)?;

        let mut staged: Vec<(Allocation, chrono::DateTime<Utc>)> = Vec::new();
        for &allocation_id in allocation_ids {
            let allocation = self
                .store
                .get(allocation_id)
                .ok_or(PickError::NotFound)?;
            if allocation.status != AllocationStatus::Confirmed {
                return Err(PickError::InvalidState(format!(
                    "allocation {allocation_id} is {}, only confirmed allocations can be picked",
                    allocation.status
                )));
            }
            let lot = self.registry.get(allocation.lot_id).ok_or_else(|| {
                IntegrityError::violation(
                    allocation.lot_id,
                    "allocation references a lot unknown to the registry",
                )
            })?;
            staged.push((allocation, lot.received_at));
        }

        staged.sort_by(|(a, a_received), (b, b_received)| {
            a.location_id
                .cmp(&b.location_id)
                .then_with(|| a_received.cmp(b_received))
                .then_with(|| a.lot_id.cmp(&b.lot_id))
        });

        let lines: Vec<PickLine> = staged
            .into_iter()
            .enumerate()
            .map(|(i, (allocation, _))| PickLine {
                sequence: i as u32 + 1,
                allocation_id: allocation.allocation_id,
                lot_id: allocation.lot_id,
                location_id: allocation.location_id,
                allocated_quantity: allocation.quantity,
                picked_quantity: 0,
            })
            .collect();

        let mut list = PickingList::new(PickId::new());
        list.attach_lines(lines)?;
        debug!(pick = %list.pick_id, lines = list.lines.len(), "picking list created");

        let mut picks = self
            .picks
            .write()
            .map_err(|_| DomainError::lock_poisoned("pick store"))?;
        picks.insert(list.pick_id, list.clone());
        Ok(list)
    }

    /// Record `quantity` physically picked against one line.
    ///
    /// The `Pick` movement lands on the ledger before the list mutation is
    /// committed; a failed append leaves the list untouched. The movement's
    /// idempotency key encodes the line's cumulative progress, so a retried
    /// advance dedupes while the next advance gets a fresh key.
    pub fn advance_pick(
        &self,
        pick_id: PickId,
        sequence: u32,
        quantity: i64,
    ) -> Result<PickingList, PickError> {
        let mut picks = self
            .picks
            .write()
            .map_err(|_| DomainError::lock_poisoned("pick store"))?;
        let list = picks.get(&pick_id).ok_or(PickError::NotFound)?;

        // Mutate a working copy; commit it only once the ledger accepted
        // the movement.
        let mut updated = list.clone();
        let line = updated.record_pick(sequence, quantity)?;

        let allocation = self
            .store
            .get(line.allocation_id)
            .ok_or(PickError::NotFound)?;

        let movement = StockMovement::new(
            line.lot_id,
            allocation.product_id,
            line.location_id,
            MovementKind::Pick {
                allocation_id: line.allocation_id,
                pick_id,
            },
            -quantity,
            Utc::now(),
            allocation.correlation_id,
            pick_key(pick_id, sequence, line.picked_quantity),
        )?;
        let committed = self.ledger.append(movement, ExpectedVersion::Any)?;
        self.publish(committed);

        if line.is_complete() {
            self.store.transition(
                line.allocation_id,
                AllocationStatus::Confirmed,
                AllocationStatus::Picked,
            )?;
        }

        debug!(
            pick = %pick_id,
            sequence,
            picked = line.picked_quantity,
            of = line.allocated_quantity,
            status = %updated.status,
            "pick advanced"
        );

        picks.insert(pick_id, updated.clone());
        Ok(updated)
    }

    /// Cancel a picking list, releasing the reservation behind every line
    /// that still has unpicked quantity. Already-picked stock stays picked.
    ///
    /// The cancelled list commits before any release is emitted, and each
    /// release lands on the ledger before the allocation is marked
    /// `Released`. A failure partway through is resumed by cancelling
    /// again: already-released lines are skipped and a replayed append
    /// dedupes on its key.
    pub fn cancel_pick(&self, pick_id: PickId) -> Result<PickingList, PickError> {
        let mut picks = self
            .picks
            .write()
            .map_err(|_| DomainError::lock_poisoned("pick store"))?;
        let list = picks.get(&pick_id).ok_or(PickError::NotFound)?;

        let updated = if list.status == PickStatus::Cancelled {
            // Resuming an interrupted cancellation.
            list.clone()
        } else {
            let mut working = list.clone();
            working.cancel()?;
            picks.insert(pick_id, working.clone());
            working
        };

        let mut released = 0usize;
        for line in updated.lines.iter().filter(|l| l.remaining() > 0) {
            let allocation = self
                .store
                .get(line.allocation_id)
                .ok_or(PickError::NotFound)?;
            if allocation.status == AllocationStatus::Released {
                continue;
            }

            let movement = StockMovement::new(
                line.lot_id,
                allocation.product_id,
                line.location_id,
                MovementKind::ReservationRelease {
                    allocation_id: line.allocation_id,
                },
                -line.remaining(),
                Utc::now(),
                allocation.correlation_id,
                cancel_key(pick_id, line.allocation_id),
            )?;
            let committed = self.ledger.append(movement, ExpectedVersion::Any)?;
            self.publish(committed);

            self.store
                .transition(
                    line.allocation_id,
                    allocation.status,
                    AllocationStatus::Released,
                )
                .map_err(|e| match e {
                    DomainError::InvariantViolation(detail) => PickError::InvalidState(detail),
                    other => other.into(),
                })?;
            released += 1;
        }

        debug!(pick = %pick_id, released_lines = released, "picking list cancelled");
        Ok(updated)
    }

    fn publish(&self, committed: CommittedMovement) {
        // Lost publications are recoverable by ledger replay.
        if let Err(e) = self.bus.publish(committed) {
            warn!(error = ?e, "failed to publish committed movement");
        }
    }
}

fn pick_key(pick_id: PickId, sequence: u32, cumulative: i64) -> IdempotencyKey {
    IdempotencyKey::new(format!("pick-{pick_id}-line-{sequence}-{cumulative}"))
        .unwrap_or_else(|_| unreachable!("formatted key is never empty"))
}

fn cancel_key(pick_id: PickId, allocation_id: AllocationId) -> IdempotencyKey {
    IdempotencyKey::new(format!("cancel-{pick_id}-{allocation_id}"))
        .unwrap_or_else(|_| unreachable!("formatted key is never empty"))
}
