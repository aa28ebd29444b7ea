use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockyard_core::{
    AllocationId, CorrelationId, DomainError, DomainResult, LocationId, LotId, ProductId,
};

/// Allocation lifecycle.
///
/// ```text
/// Reserved -> Confirmed -> Picked
///     \            \
///      -> Released  -> Released
/// ```
///
/// `Released` and `Picked` are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Reserved,
    Confirmed,
    Released,
    Picked,
}

impl AllocationStatus {
    pub fn can_transition_to(&self, next: AllocationStatus) -> bool {
        use AllocationStatus::*;
        matches!(
            (self, next),
            (Reserved, Confirmed) | (Reserved, Released) | (Confirmed, Released) | (Confirmed, Picked)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AllocationStatus::Released | AllocationStatus::Picked)
    }
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AllocationStatus::Reserved => "reserved",
            AllocationStatus::Confirmed => "confirmed",
            AllocationStatus::Released => "released",
            AllocationStatus::Picked => "picked",
        };
        f.write_str(s)
    }
}

/// A claim of `quantity` units against one specific lot.
///
/// Multi-lot demand produces one allocation per consumed lot; the shared
/// `correlation_id` ties them back to the originating demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub allocation_id: AllocationId,
    pub lot_id: LotId,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub status: AllocationStatus,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
}

/// Allocation records, keyed by id.
///
/// Transitions are compare-and-set on the current status, so two callers
/// racing to release the same allocation cannot both win.
#[derive(Debug, Default)]
pub struct AllocationStore {
    records: RwLock<HashMap<AllocationId, Allocation>>,
}

impl AllocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, allocation: Allocation) -> DomainResult<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| DomainError::lock_poisoned("allocation store"))?;
        if records.contains_key(&allocation.allocation_id) {
            return Err(DomainError::invariant(format!(
                "allocation {} already recorded",
                allocation.allocation_id
            )));
        }
        records.insert(allocation.allocation_id, allocation);
        Ok(())
    }

    pub fn get(&self, allocation_id: AllocationId) -> Option<Allocation> {
        self.records.read().ok()?.get(&allocation_id).cloned()
    }

    /// Compare-and-set transition. Fails with `NotFound` for an unknown id
    /// and `InvariantViolation` when the record is not in `from` (including
    /// a lost race against another caller).
    pub fn transition(
        &self,
        allocation_id: AllocationId,
        from: AllocationStatus,
        to: AllocationStatus,
    ) -> DomainResult<Allocation> {
        if !from.can_transition_to(to) {
            return Err(DomainError::invariant(format!(
                "allocation transition {from} -> {to} is not allowed"
            )));
        }

        let mut records = self
            .records
            .write()
            .map_err(|_| DomainError::lock_poisoned("allocation store"))?;
        let record = records
            .get_mut(&allocation_id)
            .ok_or_else(DomainError::not_found)?;

        if record.status != from {
            return Err(DomainError::invariant(format!(
                "allocation {allocation_id} is {}, expected {from}",
                record.status
            )));
        }

        record.status = to;
        Ok(record.clone())
    }

    /// Non-terminal allocations for one correlation id, in creation order.
    pub fn open_for_correlation(&self, correlation_id: CorrelationId) -> Vec<Allocation> {
        let records = match self.records.read() {
            Ok(r) => r,
            Err(_) => return vec![],
        };
        let mut open: Vec<Allocation> = records
            .values()
            .filter(|a| a.correlation_id == correlation_id && !a.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|a| (a.created_at, a.allocation_id));
        open
    }
}
