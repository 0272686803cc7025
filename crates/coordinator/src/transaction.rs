//! Transaction record and state machine
//!
//! A `TransactionEntry` is shared between the registry, the caller's
//! `Transaction` handle and the deadline sweeper. Its mutable parts live
//! behind a per-transaction mutex; only the holder of that lock (a
//! `TransactionGuard`) may change the status or the enlisted resources.
//!
//! The status is mirrored in an atomic so `Transaction::status` never
//! blocks, even while a commit holds the lock for the whole 2PC round.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use xact_core::{
    HeuristicReport, ResourceAdapter, ResourceId, ResourceOutcome, Result, RollbackCause, Status,
    TransactionId, XactError,
};

/// One enlisted resource and what it has been told so far
pub(crate) struct Enlistment {
    pub(crate) adapter: Arc<dyn ResourceAdapter>,
    /// Last-known outcome
    pub(crate) outcome: ResourceOutcome,
}

impl Enlistment {
    fn new(adapter: Arc<dyn ResourceAdapter>) -> Self {
        Self {
            adapter,
            outcome: ResourceOutcome::Enlisted,
        }
    }
}

impl fmt::Debug for Enlistment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enlistment")
            .field("resource", self.adapter.resource_id())
            .field("capability", &self.adapter.capability())
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Lock-protected part of a transaction
#[derive(Debug, Default)]
pub(crate) struct TransactionState {
    /// Enlisted resources in enlistment order
    enlisted: Vec<Enlistment>,
    /// Why the transaction is (or was) rolled back, if known
    rollback_cause: Option<RollbackCause>,
    /// Per-resource report of an inconsistent outcome
    report: Option<HeuristicReport>,
    /// When a terminal status was reached
    completed_at: Option<Instant>,
    completed_wall: Option<DateTime<Utc>>,
    /// Completion bookkeeping has run
    finished: bool,
}

/// Shared record of one global transaction
pub(crate) struct TransactionEntry {
    id: TransactionId,
    timeout: Duration,
    deadline: Instant,
    started_wall: DateTime<Utc>,
    status: AtomicU8,
    /// Set once the deadline has been observed to pass
    timed_out: AtomicBool,
    /// Set by `rollback` so an in-flight commit aborts before its decision
    rollback_requested: AtomicBool,
    state: Mutex<TransactionState>,
}

impl TransactionEntry {
    pub(crate) fn new(id: TransactionId, now: Instant, timeout: Duration) -> Self {
        Self {
            id,
            timeout,
            deadline: now + timeout,
            started_wall: Utc::now(),
            status: AtomicU8::new(Status::Active.as_u8()),
            timed_out: AtomicBool::new(false),
            rollback_requested: AtomicBool::new(false),
            state: Mutex::new(TransactionState::default()),
        }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn started_wall(&self) -> DateTime<Utc> {
        self.started_wall
    }

    /// Whether the deadline has passed at `now`; latches `timed_out`.
    pub(crate) fn check_deadline(&self, now: Instant) -> bool {
        if self.timed_out.load(Ordering::Acquire) {
            return true;
        }
        if now >= self.deadline {
            self.timed_out.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub(crate) fn request_rollback(&self) {
        self.rollback_requested.store(true, Ordering::Release);
    }

    pub(crate) fn rollback_requested(&self) -> bool {
        self.rollback_requested.load(Ordering::Acquire)
    }

    /// Acquire the per-transaction lock, blocking
    pub(crate) fn lock(&self) -> TransactionGuard<'_> {
        TransactionGuard {
            entry: self,
            state: self.state.lock(),
        }
    }

    /// Acquire the per-transaction lock if nobody holds it
    pub(crate) fn try_lock(&self) -> Option<TransactionGuard<'_>> {
        self.state.try_lock().map(|state| TransactionGuard { entry: self, state })
    }

    /// Acquire the per-transaction lock, giving up after `timeout`
    pub(crate) fn try_lock_for(&self, timeout: Duration) -> Option<TransactionGuard<'_>> {
        self.state
            .try_lock_for(timeout)
            .map(|state| TransactionGuard { entry: self, state })
    }
}

/// Exclusive access to a transaction's mutable state
///
/// All status transitions go through `transition`, which enforces the
/// state machine in `Status::can_transition_to`.
pub(crate) struct TransactionGuard<'a> {
    entry: &'a TransactionEntry,
    state: MutexGuard<'a, TransactionState>,
}

impl<'a> TransactionGuard<'a> {
    pub(crate) fn id(&self) -> TransactionId {
        self.entry.id
    }

    pub(crate) fn status(&self) -> Status {
        self.entry.status()
    }

    pub(crate) fn entry(&self) -> &'a TransactionEntry {
        self.entry
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// `XactError::System` if the transition is not allowed; the status is
    /// left unchanged.
    pub(crate) fn transition(&mut self, next: Status) -> Result<()> {
        let current = self.status();
        if !current.can_transition_to(next) {
            return Err(XactError::System {
                txn: self.id(),
                message: format!("illegal status transition {} -> {}", current, next),
                report: None,
            });
        }
        self.entry.status.store(next.as_u8(), Ordering::Release);
        if next.is_terminal() {
            self.state.completed_at = Some(Instant::now());
            self.state.completed_wall = Some(Utc::now());
        }
        Ok(())
    }

    pub(crate) fn enlisted(&self) -> &[Enlistment] {
        &self.state.enlisted
    }

    pub(crate) fn is_enlisted(&self, resource: &ResourceId) -> bool {
        self.state
            .enlisted
            .iter()
            .any(|e| e.adapter.resource_id() == resource)
    }

    /// Append an adapter; only allowed while ACTIVE.
    pub(crate) fn push_enlistment(&mut self, adapter: Arc<dyn ResourceAdapter>) -> Result<()> {
        let status = self.status();
        if status != Status::Active {
            return Err(XactError::InvalidState {
                txn: self.id(),
                status,
                operation: "enlist in",
            });
        }
        self.state.enlisted.push(Enlistment::new(adapter));
        Ok(())
    }

    /// Adapters in enlistment order
    pub(crate) fn adapters(&self) -> Vec<Arc<dyn ResourceAdapter>> {
        self.state
            .enlisted
            .iter()
            .map(|e| Arc::clone(&e.adapter))
            .collect()
    }

    pub(crate) fn set_outcome(&mut self, index: usize, outcome: ResourceOutcome) {
        if let Some(enlistment) = self.state.enlisted.get_mut(index) {
            enlistment.outcome = outcome;
        }
    }

    pub(crate) fn rollback_cause(&self) -> Option<&RollbackCause> {
        self.state.rollback_cause.as_ref()
    }

    pub(crate) fn set_rollback_cause(&mut self, cause: RollbackCause) {
        self.state.rollback_cause = Some(cause);
    }

    /// Snapshot of every resource's outcome
    pub(crate) fn build_report(&self) -> HeuristicReport {
        HeuristicReport {
            txn: self.id(),
            outcomes: self
                .state
                .enlisted
                .iter()
                .map(|e| (e.adapter.resource_id().clone(), e.outcome.clone()))
                .collect(),
        }
    }

    pub(crate) fn set_report(&mut self, report: HeuristicReport) {
        self.state.report = Some(report);
    }

    pub(crate) fn report(&self) -> Option<&HeuristicReport> {
        self.state.report.as_ref()
    }

    pub(crate) fn completed_at(&self) -> Option<Instant> {
        self.state.completed_at
    }

    pub(crate) fn completed_wall(&self) -> Option<DateTime<Utc>> {
        self.state.completed_wall
    }

    /// Record completion at `now` on the coordinator's clock.
    ///
    /// Returns `false` if this already happened, so bookkeeping runs once.
    pub(crate) fn mark_finished(&mut self, now: Instant) -> bool {
        if self.state.finished {
            return false;
        }
        self.state.finished = true;
        self.state.completed_at = Some(now);
        true
    }
}

/// Caller-side handle to a global transaction
///
/// Cheap to clone. All operations that change the transaction go through
/// the `TransactionCoordinator`; the handle itself only reads.
#[derive(Clone)]
pub struct Transaction {
    entry: Arc<TransactionEntry>,
}

impl Transaction {
    pub(crate) fn from_entry(entry: Arc<TransactionEntry>) -> Self {
        Self { entry }
    }

    pub(crate) fn entry(&self) -> &Arc<TransactionEntry> {
        &self.entry
    }

    /// Unique transaction id
    pub fn id(&self) -> TransactionId {
        self.entry.id
    }

    /// Current status; never blocks
    pub fn status(&self) -> Status {
        self.entry.status()
    }

    /// Whether the status is `Active`
    pub fn is_active(&self) -> bool {
        self.status() == Status::Active
    }

    /// Timeout the transaction was begun with
    pub fn timeout(&self) -> Duration {
        self.entry.timeout
    }

    /// Absolute deadline after which the transaction is rolled back
    pub fn deadline(&self) -> Instant {
        self.entry.deadline()
    }

    /// Wall-clock begin time
    pub fn started_at(&self) -> DateTime<Utc> {
        self.entry.started_wall()
    }

    /// Whether the deadline has been observed to pass
    pub fn is_timed_out(&self) -> bool {
        self.entry.timed_out.load(Ordering::Acquire)
    }

    /// Resource ids in enlistment order
    ///
    /// Briefly takes the transaction lock, so it waits for an in-flight
    /// commit or rollback to finish.
    pub fn enlisted_resources(&self) -> Vec<ResourceId> {
        let guard = self.entry.lock();
        guard
            .enlisted()
            .iter()
            .map(|e| e.adapter.resource_id().clone())
            .collect()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("timeout", &self.entry.timeout)
            .finish()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Transaction {}
