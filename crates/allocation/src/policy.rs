use serde::{Deserialize, Serialize};

use stockyard_core::{CorrelationId, LocationId, ProductId};
use stockyard_inventory::StockLot;

/// Lot selection policy.
///
/// The candidate ordering below is the policy's defining contract and must
/// be deterministic for identical inputs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationPolicy {
    /// First-In-First-Out: earliest-received lot first.
    Fifo,
    /// First-Expired-First-Out: soonest-to-expire lot first (lots without
    /// an expiry date last), tie-broken by receipt time.
    Fefo,
}

impl AllocationPolicy {
    /// Order candidates in consumption order. Lot id is the final
    /// tie-breaker so equal timestamps still order deterministically.
    pub fn order(&self, lots: &mut [StockLot]) {
        match self {
            AllocationPolicy::Fifo => lots.sort_by(|a, b| {
                a.received_at
                    .cmp(&b.received_at)
                    .then_with(|| a.lot_id.cmp(&b.lot_id))
            }),
            AllocationPolicy::Fefo => lots.sort_by(|a, b| {
                match (a.expires_at, b.expires_at) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => core::cmp::Ordering::Less,
                    (None, Some(_)) => core::cmp::Ordering::Greater,
                    (None, None) => core::cmp::Ordering::Equal,
                }
                .then_with(|| a.received_at.cmp(&b.received_at))
                .then_with(|| a.lot_id.cmp(&b.lot_id))
            }),
        }
    }
}

/// Whether a demand that cannot be fully covered yields a partial
/// allocation (with a reported shortfall) or nothing at all. The caller
/// (order processing) decides.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallPolicy {
    Partial,
    AllOrNothing,
}

/// A demand line from the order module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandLine {
    pub product_id: ProductId,
    pub quantity: i64,
    pub location_hint: Option<LocationId>,
    pub correlation_id: CorrelationId,
}
