//! Optimistic concurrency primitives.

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation for a per-lot movement stream.
///
/// An allocation attempt reads a lot's current version, computes its claim,
/// and appends conditioned on that version still being current. A mismatch
/// means another writer got there first; the caller re-reads and retries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (useful for receipts and externally-serialized writers).
    Any,
    /// Require the lot stream to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        match self {
            ExpectedVersion::Any => Ok(()),
            ExpectedVersion::Exact(expected) if expected == actual => Ok(()),
            ExpectedVersion::Exact(expected) => Err(DomainError::StaleVersion { expected, actual }),
        }
    }
}
