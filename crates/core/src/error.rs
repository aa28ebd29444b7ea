//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic business failures shared by every stockyard crate.
///
/// Ledger-level append failures and projection integrity failures carry
/// their own types; this covers what the domain objects themselves reject.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input: bad quantity sign, empty key, missing field.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A state machine or balance invariant would be broken.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The referenced record does not exist.
    #[error("not found")]
    NotFound,

    /// An optimistic version check lost against a concurrent writer.
    /// Recoverable: re-read and retry.
    #[error("stale version: expected {expected}, stream is at {actual}")]
    StaleVersion { expected: u64, actual: u64 },

    /// A shared-state lock was poisoned by a panicking holder.
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn lock_poisoned(component: &'static str) -> Self {
        Self::LockPoisoned(component)
    }
}
