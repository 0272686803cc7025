//! Core types for xact
//!
//! This module defines the foundational types:
//! - TransactionId: Unique identifier for a global transaction
//! - ResourceId: Stable name of an enlisted resource manager
//! - Status: Lifecycle status of a global transaction
//! - Vote: Prepare-phase answer of a resource
//! - Capability: Whether a resource takes part in the prepare round

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a global transaction
///
/// A TransactionId is a wrapper around a UUID v4. It is assigned by the
/// coordinator at `begin` time and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Create a new random TransactionId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a TransactionId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse a TransactionId from its string representation
    ///
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this TransactionId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable, unique name of a resource manager
///
/// Used in logs and in heuristic reports so an operator can find the
/// resource that needs manual reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a resource id from a name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Status of a global transaction
///
/// State transitions:
/// - `Active` → `MarkedRollback` (rollback-only requested, or a prepare failed)
/// - `Active` → `Preparing` → `Prepared` → `Committing` → `Committed`
/// - `Active` → `Committing` → `Committed` (one-phase)
/// - any non-terminal → `RollingBack` → `RolledBack`
/// - `Committing` / `RollingBack` → `Unknown` (heuristic or system fault)
///
/// Terminal states: `Committed`, `RolledBack`, `Unknown`.
/// Once a transaction leaves `Active` it never returns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    /// No transaction is associated with the caller
    NoTransaction = 0,
    /// Transaction is open for enlistment and work
    Active = 1,
    /// Transaction may only be rolled back
    MarkedRollback = 2,
    /// Prepare round in progress
    Preparing = 3,
    /// Every preparable resource voted commit
    Prepared = 4,
    /// Commit decision is being delivered
    Committing = 5,
    /// All resources committed
    Committed = 6,
    /// Rollback is being delivered
    RollingBack = 7,
    /// All resources rolled back
    RolledBack = 8,
    /// Outcome is inconsistent or could not be determined
    Unknown = 9,
}

impl Status {
    /// Decode a status from its `repr(u8)` value
    ///
    /// Out-of-range values decode to `Unknown`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::NoTransaction,
            1 => Status::Active,
            2 => Status::MarkedRollback,
            3 => Status::Preparing,
            4 => Status::Prepared,
            5 => Status::Committing,
            6 => Status::Committed,
            7 => Status::RollingBack,
            8 => Status::RolledBack,
            _ => Status::Unknown,
        }
    }

    /// Encode as `u8`
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Terminal statuses: `Committed`, `RolledBack` and `Unknown`
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Committed | Status::RolledBack | Status::Unknown)
    }

    /// Whether the transition `self → next` is allowed
    ///
    /// `NoTransaction` is never a source or target of a transition.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (Active, MarkedRollback | Preparing | Committing | RollingBack) => true,
            (MarkedRollback, RollingBack) => true,
            (Preparing, Prepared | MarkedRollback | RollingBack) => true,
            (Prepared, Committing | RollingBack) => true,
            (Committing, Committed | RolledBack | Unknown) => true,
            (RollingBack, RolledBack | Unknown) => true,
            _ => false,
        }
    }

    /// Human-readable name, as printed in operator logs
    pub fn name(self) -> &'static str {
        match self {
            Status::NoTransaction => "NO TRANSACTION",
            Status::Active => "ACTIVE",
            Status::MarkedRollback => "MARKED ROLLBACK",
            Status::Preparing => "PREPARING",
            Status::Prepared => "PREPARED",
            Status::Committing => "COMMITTING",
            Status::Committed => "COMMITTED",
            Status::RollingBack => "ROLLING BACK",
            Status::RolledBack => "ROLLEDBACK",
            Status::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A resource's answer to `prepare`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    /// The resource can durably commit its part
    Commit,
    /// The resource cannot commit; the transaction must roll back
    Rollback,
}

/// Whether a resource takes part in the prepare round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Supports a two-phase vote
    Preparable,
    /// Commit/rollback only ("last resource")
    NonPreparable,
}

impl Capability {
    /// True for `Preparable`
    pub fn is_preparable(self) -> bool {
        matches!(self, Capability::Preparable)
    }
}
