use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockyard_core::{AllocationId, DomainError, LocationId, LotId, PickId};
use stockyard_inventory::IntegrityError;
use stockyard_ledger::LedgerError;

/// Picking list lifecycle.
///
/// ```text
/// Created -> Allocated -> InProgress -> Completed
///     \          \            \
///      ----------------------- -> Cancelled
/// ```
///
/// `Completed` and `Cancelled` are terminal; terminal lists are immutable
/// history.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickStatus {
    Created,
    Allocated,
    InProgress,
    Completed,
    Cancelled,
}

impl PickStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PickStatus::Completed | PickStatus::Cancelled)
    }
}

impl std::fmt::Display for PickStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PickStatus::Created => "created",
            PickStatus::Allocated => "allocated",
            PickStatus::InProgress => "in_progress",
            PickStatus::Completed => "completed",
            PickStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PickError {
    /// No picking list with that id.
    #[error("picking list not found")]
    NotFound,

    /// No line with that sequence number on this list.
    #[error("unknown pick line {sequence}")]
    UnknownLine { sequence: u32 },

    /// The list is not in a state that permits the operation.
    #[error("invalid pick state: {0}")]
    InvalidState(String),

    /// Picking more than the line's allocated quantity. Rejected outright,
    /// never truncated.
    #[error("over-pick on line {sequence}: {attempted} picked against {allocated} allocated")]
    OverPick {
        sequence: u32,
        allocated: i64,
        attempted: i64,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// One allocation's slice of a picking list.
///
/// `sequence` is the walk order through the warehouse; partial completion
/// is tracked per line in `picked_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickLine {
    pub sequence: u32,
    pub allocation_id: AllocationId,
    pub lot_id: LotId,
    pub location_id: LocationId,
    pub allocated_quantity: i64,
    pub picked_quantity: i64,
}

impl PickLine {
    pub fn remaining(&self) -> i64 {
        self.allocated_quantity - self.picked_quantity
    }

    pub fn is_complete(&self) -> bool {
        self.picked_quantity == self.allocated_quantity
    }
}

/// A sequenced pick task over confirmed allocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickingList {
    pub pick_id: PickId,
    pub status: PickStatus,
    pub lines: Vec<PickLine>,
    pub created_at: DateTime<Utc>,
}

impl PickingList {
    /// An empty pick shell. Lines are attached by the orchestrator once
    /// their allocations are confirmed.
    pub fn new(pick_id: PickId) -> Self {
        Self {
            pick_id,
            status: PickStatus::Created,
            lines: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach the sequenced lines, moving the shell to `Allocated`.
    pub fn attach_lines(&mut self, lines: Vec<PickLine>) -> Result<(), PickError> {
        if self.status != PickStatus::Created {
            return Err(PickError::InvalidState(format!(
                "pick {} is {}, lines can only be attached once",
                self.pick_id, self.status
            )));
        }
        if lines.is_empty() {
            return Err(DomainError::validation("a picking list needs at least one line").into());
        }
        self.lines = lines;
        self.status = PickStatus::Allocated;
        Ok(())
    }

    pub fn line(&self, sequence: u32) -> Option<&PickLine> {
        self.lines.iter().find(|l| l.sequence == sequence)
    }

    /// Record `quantity` picked against one line.
    ///
    /// Moves the list to `InProgress` on the first pick and to `Completed`
    /// once every line's picked quantity equals its allocation. Returns the
    /// updated line.
    pub fn record_pick(&mut self, sequence: u32, quantity: i64) -> Result<PickLine, PickError> {
        if !matches!(self.status, PickStatus::Allocated | PickStatus::InProgress) {
            return Err(PickError::InvalidState(format!(
                "pick {} is {}, cannot advance",
                self.pick_id, self.status
            )));
        }
        if quantity <= 0 {
            return Err(
                DomainError::validation("picked quantity must be positive").into(),
            );
        }

        let line = self
            .lines
            .iter_mut()
            .find(|l| l.sequence == sequence)
            .ok_or(PickError::UnknownLine { sequence })?;

        if quantity > line.remaining() {
            return Err(PickError::OverPick {
                sequence,
                allocated: line.allocated_quantity,
                attempted: line.picked_quantity + quantity,
            });
        }

        line.picked_quantity += quantity;
        let snapshot = line.clone();

        self.status = if self.lines.iter().all(PickLine::is_complete) {
            PickStatus::Completed
        } else {
            PickStatus::InProgress
        };

        Ok(snapshot)
    }

    /// Cancel the list, returning the lines that still have unpicked
    /// quantity (their reservations must be released by the caller).
    /// Already-picked quantity is immutable history.
    pub fn cancel(&mut self) -> Result<Vec<PickLine>, PickError> {
        if self.status.is_terminal() {
            return Err(PickError::InvalidState(format!(
                "pick {} is already {}",
                self.pick_id, self.status
            )));
        }
        self.status = PickStatus::Cancelled;
        Ok(self
            .lines
            .iter()
            .filter(|l| l.remaining() > 0)
            .cloned()
            .collect())
    }
}
