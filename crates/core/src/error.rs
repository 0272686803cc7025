//! Error types for xact
//!
//! Two layers of errors:
//! - `AdapterError`: what a resource adapter reports to the coordinator
//! - `XactError`: what the coordinator reports to its caller
//!
//! Heuristic and system errors carry a `HeuristicReport` with the last-known
//! outcome of every enlisted resource, so an operator can reconcile by hand.

use crate::types::{ResourceId, Status, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, XactError>;

/// Kind of unilateral decision a resource made on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeuristicKind {
    /// The resource committed its part
    Commit,
    /// The resource rolled back its part
    Rollback,
    /// Part of the resource's work committed, part rolled back
    Mixed,
    /// The resource cannot tell what happened
    Hazard,
}

impl fmt::Display for HeuristicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeuristicKind::Commit => "heuristic commit",
            HeuristicKind::Rollback => "heuristic rollback",
            HeuristicKind::Mixed => "heuristic mixed",
            HeuristicKind::Hazard => "heuristic hazard",
        };
        f.write_str(name)
    }
}

/// Error reported by a resource adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// The resource resolved the transaction independently
    #[error("{0}")]
    Heuristic(HeuristicKind),

    /// The resource rolled back its part instead of committing
    #[error("resource rolled back: {0}")]
    RolledBack(String),

    /// Transient communication failure; the call may be retried
    #[error("resource unavailable: {0}")]
    Unavailable(String),

    /// The adapter is bound to another transaction
    #[error("adapter already enlisted in transaction {0}")]
    AlreadyEnlisted(TransactionId),

    /// Any other failure
    #[error("resource failure: {0}")]
    Failed(String),
}

/// Why an enlistment was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnlistmentFailure {
    /// The transaction is no longer ACTIVE
    NotActive(Status),
    /// The adapter is bound to another non-terminal transaction
    AlreadyEnlisted(TransactionId),
    /// The transaction's deadline has passed
    DeadlineExceeded,
    /// The adapter itself refused
    Adapter(String),
}

impl fmt::Display for EnlistmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnlistmentFailure::NotActive(status) => write!(f, "transaction is {}", status),
            EnlistmentFailure::AlreadyEnlisted(other) => {
                write!(f, "adapter already enlisted in transaction {}", other)
            }
            EnlistmentFailure::DeadlineExceeded => write!(f, "transaction deadline exceeded"),
            EnlistmentFailure::Adapter(msg) => write!(f, "adapter refused: {}", msg),
        }
    }
}

/// Why a commit request ended in a rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackCause {
    /// The transaction was marked rollback-only before commit
    MarkedRollbackOnly,
    /// A resource voted ROLLBACK (or refused a one-phase commit)
    ResourceVotedRollback(ResourceId),
    /// A prepare call failed
    PrepareFailed(ResourceId),
    /// The transaction's deadline passed before the commit decision
    TimeoutExceeded,
    /// Another caller requested a rollback while commit was in flight
    RollbackRequested,
}

impl fmt::Display for RollbackCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackCause::MarkedRollbackOnly => write!(f, "transaction was marked rollback-only"),
            RollbackCause::ResourceVotedRollback(r) => write!(f, "resource {} voted rollback", r),
            RollbackCause::PrepareFailed(r) => write!(f, "prepare failed on resource {}", r),
            RollbackCause::TimeoutExceeded => write!(f, "transaction timeout exceeded"),
            RollbackCause::RollbackRequested => write!(f, "rollback requested during commit"),
        }
    }
}

/// Last-known outcome of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceOutcome {
    /// Enlisted, nothing delivered yet
    Enlisted,
    /// Voted COMMIT
    Prepared,
    /// Voted ROLLBACK
    VotedRollback,
    /// Committed as instructed
    Committed,
    /// Rolled back as instructed
    RolledBack,
    /// Made a unilateral decision
    Heuristic(HeuristicKind),
    /// Call failed; state of the resource is not known
    Failed(String),
}

impl ResourceOutcome {
    /// True if the resource's part is known to be applied
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            ResourceOutcome::Committed | ResourceOutcome::Heuristic(HeuristicKind::Commit)
        )
    }

    /// True if this outcome needs a `forget` call on the adapter
    pub fn needs_forget(&self) -> bool {
        matches!(self, ResourceOutcome::Heuristic(_))
    }
}

impl fmt::Display for ResourceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceOutcome::Enlisted => write!(f, "enlisted"),
            ResourceOutcome::Prepared => write!(f, "prepared"),
            ResourceOutcome::VotedRollback => write!(f, "voted rollback"),
            ResourceOutcome::Committed => write!(f, "committed"),
            ResourceOutcome::RolledBack => write!(f, "rolled back"),
            ResourceOutcome::Heuristic(kind) => write!(f, "{}", kind),
            ResourceOutcome::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// Per-resource outcomes of a transaction that ended inconsistently
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeuristicReport {
    /// The affected transaction
    pub txn: TransactionId,
    /// Every enlisted resource with its last-known outcome, in enlistment order
    pub outcomes: Vec<(ResourceId, ResourceOutcome)>,
}

impl HeuristicReport {
    /// Create an empty report
    pub fn new(txn: TransactionId) -> Self {
        Self {
            txn,
            outcomes: Vec::new(),
        }
    }

    /// Resources whose outcome is neither committed nor rolled back cleanly
    pub fn failed_resources(&self) -> Vec<&ResourceId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| {
                matches!(o, ResourceOutcome::Heuristic(_) | ResourceOutcome::Failed(_))
            })
            .map(|(r, _)| r)
            .collect()
    }

    /// Outcome recorded for a resource
    pub fn outcome_of(&self, resource: &ResourceId) -> Option<&ResourceOutcome> {
        self.outcomes
            .iter()
            .find(|(r, _)| r == resource)
            .map(|(_, o)| o)
    }
}

impl fmt::Display for HeuristicReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transaction {} [", self.txn)?;
        for (i, (resource, outcome)) in self.outcomes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", resource, outcome)?;
        }
        write!(f, "]")
    }
}

/// Error types returned by the coordinator
#[derive(Debug, Clone, Error)]
pub enum XactError {
    /// An adapter could not be bound to the transaction
    #[error("Enlistment of {resource} in transaction {txn} failed: {reason}")]
    Enlistment {
        /// Target transaction
        txn: TransactionId,
        /// Adapter that was refused
        resource: ResourceId,
        /// Why
        reason: EnlistmentFailure,
    },

    /// Commit was requested but the transaction rolled back
    #[error("Transaction {txn} rolled back: {cause}")]
    Rollback {
        /// The transaction
        txn: TransactionId,
        /// Why the commit became a rollback
        cause: RollbackCause,
    },

    /// Some resources committed, others did not
    #[error("Heuristic mixed outcome: {0}")]
    HeuristicMixed(HeuristicReport),

    /// Resources rolled back against the coordinator's decision, or failed to roll back
    #[error("Heuristic rollback outcome: {0}")]
    HeuristicRollback(HeuristicReport),

    /// Coordinator-internal fault
    #[error("System error in transaction {txn}: {message}")]
    System {
        /// The transaction
        txn: TransactionId,
        /// Description of the fault
        message: String,
        /// Per-resource outcomes at the time of the fault, if any were delivered
        report: Option<HeuristicReport>,
    },

    /// `begin` was called while a transaction is current
    #[error("Nested transactions are not supported: transaction {current} is current")]
    NestedTransaction {
        /// The transaction already current on this thread
        current: TransactionId,
    },

    /// The transaction is not in a state that allows the operation
    #[error("Cannot {operation} transaction {txn} in state {status}")]
    InvalidState {
        /// The transaction
        txn: TransactionId,
        /// Its status at the time of the call
        status: Status,
        /// The refused operation
        operation: &'static str,
    },

    /// No transaction with this id is known to the coordinator
    #[error("Transaction not found: {0}")]
    NotFound(TransactionId),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The coordinator has been shut down
    #[error("Coordinator is shut down")]
    Shutdown,

    /// Unexpected internal failure (thread spawn, I/O, ...)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XactError {
    /// True for `HeuristicMixed` and `HeuristicRollback`
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            XactError::HeuristicMixed(_) | XactError::HeuristicRollback(_)
        )
    }

    /// True for `Rollback`
    pub fn is_rollback(&self) -> bool {
        matches!(self, XactError::Rollback { .. })
    }

    /// Rollback cause, if this is a `Rollback`
    pub fn rollback_cause(&self) -> Option<&RollbackCause> {
        match self {
            XactError::Rollback { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// Per-resource report for heuristic and system errors
    pub fn report(&self) -> Option<&HeuristicReport> {
        match self {
            XactError::HeuristicMixed(r) | XactError::HeuristicRollback(r) => Some(r),
            XactError::System { report, .. } => report.as_ref(),
            _ => None,
        }
    }

    /// The transaction this error refers to
    pub fn transaction(&self) -> Option<TransactionId> {
        match self {
            XactError::Enlistment { txn, .. }
            | XactError::Rollback { txn, .. }
            | XactError::System { txn, .. }
            | XactError::InvalidState { txn, .. }
            | XactError::NotFound(txn) => Some(*txn),
            XactError::HeuristicMixed(r) | XactError::HeuristicRollback(r) => Some(r.txn),
            XactError::NestedTransaction { current } => Some(*current),
            XactError::Config(_) | XactError::Shutdown | XactError::Internal(_) => None,
        }
    }

    /// Whether the caller may retry the same operation
    ///
    /// Rollback, heuristic and system outcomes are final; retrying a
    /// non-idempotent commit risks applying it twice.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            XactError::Enlistment {
                reason: EnlistmentFailure::AlreadyEnlisted(_),
                ..
            }
        )
    }
}
