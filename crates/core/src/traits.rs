//! Core trait definitions
//!
//! `ResourceAdapter` is the seam between the coordinator and a concrete
//! resource manager (database connection, message-queue session, ...).
//! The coordinator only ever talks to resources through this trait.

use crate::error::AdapterError;
use crate::types::{Capability, ResourceId, TransactionId, Vote};

/// Result of an adapter call
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// An enlistable participant representing one resource manager
///
/// Implementations may block on network or disk I/O in every method. The
/// coordinator never holds its registry lock while calling into an adapter.
///
/// # Contract
///
/// - `enlist` binds the adapter's live connection to `txn`. It must fail with
///   `AdapterError::AlreadyEnlisted` if the adapter is bound to another
///   transaction that has not ended.
/// - `prepare` is only called on `Capability::Preparable` adapters, must be
///   idempotent for the same `txn`, and returns the resource's vote.
/// - `commit` with `one_phase = true` is only issued when this adapter is the
///   sole participant; no `prepare` precedes it.
/// - `rollback` must succeed even if `prepare` was never called.
/// - `forget` is called after a heuristic outcome was recorded and reported.
///
/// After `commit` or `rollback` returns (successfully or not) the adapter is
/// unbound and may be enlisted in another transaction.
pub trait ResourceAdapter: Send + Sync {
    /// Stable, unique name of the resource
    fn resource_id(&self) -> &ResourceId;

    /// Whether this resource takes part in the prepare round
    fn capability(&self) -> Capability;

    /// Bind the resource's connection to `txn`
    fn enlist(&self, txn: TransactionId) -> AdapterResult<()>;

    /// Ask the resource whether it can durably commit its part
    fn prepare(&self, txn: TransactionId) -> AdapterResult<Vote>;

    /// Durably apply the resource's part
    fn commit(&self, txn: TransactionId, one_phase: bool) -> AdapterResult<()>;

    /// Discard the resource's part
    fn rollback(&self, txn: TransactionId) -> AdapterResult<()>;

    /// Clear the resource's record of a heuristically completed transaction
    fn forget(&self, txn: TransactionId) -> AdapterResult<()>;
}
