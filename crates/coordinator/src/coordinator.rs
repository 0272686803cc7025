//! Transaction coordinator for managing global transaction lifecycle
//!
//! The TransactionCoordinator owns:
//! - The registry of live and recently finished transactions
//! - The resource binding table (one adapter, one non-terminal transaction)
//! - The calling thread's current transaction
//! - Transaction metrics (started, committed, rolled back, heuristic)
//! - The deadline sweeper thread
//!
//! Coordinators are explicit objects. Two instances in one process share
//! nothing, including the per-thread current transaction.

use crate::config::CoordinatorConfig;
use crate::context::CurrentContext;
use crate::protocol::Protocol;
use crate::registry::Registry;
use crate::sweeper::Sweeper;
use crate::transaction::{Transaction, TransactionEntry, TransactionGuard};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use xact_core::{
    AdapterError, Clock, EnlistmentFailure, HeuristicReport, ResourceAdapter, Result,
    RollbackCause, Status, SystemClock, TransactionId, XactError,
};

/// Source of per-process coordinator instance ids
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// State shared between the coordinator handle and the sweeper thread
///
/// # Memory Ordering
///
/// The metric counters use Relaxed ordering: they are observational only
/// and do not synchronize any other memory operations.
pub(crate) struct CoordinatorInner {
    /// Key into the thread-local current-transaction map
    instance: u64,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    registry: Registry,
    shutdown: AtomicBool,
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_rolled_back: AtomicU64,
    total_heuristic: AtomicU64,
    total_timed_out: AtomicU64,
}

/// Result of one sweeper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired transactions rolled back in this pass
    pub expired: usize,
    /// Finished transactions dropped from the registry in this pass
    pub reaped: usize,
}

impl CoordinatorInner {
    fn protocol(&self) -> Protocol<'_> {
        Protocol::new(&self.config, self.clock.as_ref())
    }

    fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Completion bookkeeping, run once per transaction under its lock.
    ///
    /// Updates metrics, releases resource bindings and clears the calling
    /// thread's current transaction if it is this one.
    fn finish(&self, txn: &mut TransactionGuard<'_>) {
        let status = txn.status();
        if !status.is_terminal() || !txn.mark_finished(self.clock.now()) {
            return;
        }

        match status {
            Status::Committed => self.total_committed.fetch_add(1, Ordering::Relaxed),
            Status::RolledBack => self.total_rolled_back.fetch_add(1, Ordering::Relaxed),
            _ => self.total_heuristic.fetch_add(1, Ordering::Relaxed),
        };
        if txn.rollback_cause() == Some(&RollbackCause::TimeoutExceeded) {
            self.total_timed_out.fetch_add(1, Ordering::Relaxed);
        }
        // Use fetch_update for saturating decrement to prevent underflow
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });

        let id = txn.id();
        for adapter in txn.adapters() {
            self.registry.unbind(adapter.resource_id(), id);
        }
        CurrentContext::clear_if(self.instance, id);
    }

    /// Roll back expired transactions and reap stale finished ones.
    ///
    /// Transactions whose lock is held (an in-flight commit or enlist) are
    /// only flagged; the holder observes the flag and rolls back itself.
    /// UNKNOWN outcomes are kept until `forget`.
    pub(crate) fn sweep(&self) -> SweepStats {
        let now = self.clock.now();
        let mut stats = SweepStats::default();

        for entry in self.registry.snapshot() {
            let status = entry.status();
            if status.is_terminal() {
                if status != Status::Unknown && self.reap_if_stale(&entry, now) {
                    stats.reaped += 1;
                }
                continue;
            }
            if !entry.check_deadline(now) {
                continue;
            }

            let mut guard = match entry.try_lock() {
                Some(guard) => guard,
                None => {
                    debug!(target: "xact::sweeper", txn = %entry.id(), "Expired transaction busy, flagged");
                    continue;
                }
            };
            let cause = match guard.status() {
                Status::Active => RollbackCause::TimeoutExceeded,
                Status::MarkedRollback => RollbackCause::MarkedRollbackOnly,
                _ => continue,
            };
            guard.set_rollback_cause(cause);
            warn!(target: "xact::sweeper", txn = %entry.id(), "Transaction timed out, rolling back");
            if let Err(e) = self.protocol().rollback(&mut guard) {
                error!(target: "xact::sweeper", txn = %entry.id(), error = %e, "Timeout rollback incomplete");
            }
            self.finish(&mut guard);
            stats.expired += 1;
        }
        stats
    }

    /// Drop stale finished transactions without touching live ones.
    fn reap(&self) -> usize {
        let now = self.clock.now();
        self.registry
            .snapshot()
            .into_iter()
            .filter(|entry| {
                let status = entry.status();
                status.is_terminal() && status != Status::Unknown
            })
            .filter(|entry| self.reap_if_stale(entry, now))
            .count()
    }

    fn reap_if_stale(&self, entry: &Arc<TransactionEntry>, now: Instant) -> bool {
        let completed_at = match entry.try_lock() {
            Some(guard) => guard.completed_at(),
            None => return false,
        };
        match completed_at {
            Some(at) if now.saturating_duration_since(at) >= self.config.reap_after() => {
                self.registry.remove(&entry.id());
                debug!(target: "xact::sweeper", txn = %entry.id(), "Reaped finished transaction");
                true
            }
            _ => false,
        }
    }
}

/// Outcome of a finished transaction still held by the coordinator
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    /// The transaction
    pub txn: TransactionId,
    /// Terminal status
    pub status: Status,
    /// Why it rolled back, if it did and the reason is known
    pub rollback_cause: Option<RollbackCause>,
    /// Per-resource outcomes for UNKNOWN transactions
    pub report: Option<HeuristicReport>,
    /// Wall-clock begin time
    pub started_at: DateTime<Utc>,
    /// Wall-clock completion time
    pub completed_at: Option<DateTime<Utc>>,
}

/// Transaction coordinator
///
/// Creates and tracks global transactions and drives two-phase commit
/// across the resources enlisted in them. Share it between threads with
/// an `Arc`; every method takes `&self`.
///
/// # Example
///
/// ```ignore
/// let coordinator = TransactionCoordinator::new(CoordinatorConfig::default())?;
/// coordinator.start()?;
///
/// let txn = coordinator.begin(Some(Duration::from_secs(300)))?;
/// coordinator.enlist(&txn, db_connection)?;
/// coordinator.enlist(&txn, queue_session)?;
/// // ... work against both resources ...
/// coordinator.commit(&txn)?;
/// ```
pub struct TransactionCoordinator {
    inner: Arc<CoordinatorInner>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl TransactionCoordinator {
    /// Create a coordinator using the system clock
    ///
    /// The sweeper is not running until `start` is called. Until then
    /// expired transactions are only rolled back by `sweep` or by their own
    /// commit, and stale finished outcomes are reaped by `begin`.
    ///
    /// # Errors
    /// `XactError::Config` if the configuration is invalid.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a coordinator with an explicit clock
    ///
    /// # Arguments
    /// * `config` - Validated before use
    /// * `clock` - Source of `Instant`s for deadlines and reaping
    pub fn with_clock(config: CoordinatorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(CoordinatorInner {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            config,
            clock,
            registry: Registry::new(),
            shutdown: AtomicBool::new(false),
            active_count: AtomicU64::new(0),
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_rolled_back: AtomicU64::new(0),
            total_heuristic: AtomicU64::new(0),
            total_timed_out: AtomicU64::new(0),
        });
        Ok(Self {
            inner,
            sweeper: Mutex::new(None),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Launch the deadline sweeper thread
    ///
    /// Calling it again while the sweeper runs is a no-op.
    ///
    /// # Errors
    /// `XactError::Shutdown` after `shutdown`; `XactError::Internal` if the
    /// thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(XactError::Shutdown);
        }
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(Sweeper::spawn(
                Arc::downgrade(&self.inner),
                self.inner.config.sweep_interval(),
            )?);
            info!(target: "xact::txn", instance = self.inner.instance, "Coordinator started");
        }
        Ok(())
    }

    /// Begin a new transaction and make it current on the calling thread
    ///
    /// # Arguments
    /// * `timeout` - `None` or zero uses the configured default; values
    ///   above `max_timeout` are clamped
    ///
    /// # Errors
    /// * `NestedTransaction` - a non-terminal transaction is already current
    ///   on this thread
    /// * `Shutdown` - the coordinator has been shut down
    pub fn begin(&self, timeout: Option<Duration>) -> Result<Transaction> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(XactError::Shutdown);
        }

        if let Some(current) = CurrentContext::get(inner.instance) {
            if !current.status().is_terminal() && inner.registry.contains(&current.id()) {
                return Err(XactError::NestedTransaction {
                    current: current.id(),
                });
            }
            CurrentContext::clear(inner.instance);
        }

        if self.sweeper.lock().is_none() {
            let reaped = inner.reap();
            if reaped > 0 {
                debug!(target: "xact::txn", reaped, "Reaped finished transactions");
            }
        }

        let timeout = inner.config.effective_timeout(timeout);
        let entry = Arc::new(TransactionEntry::new(
            TransactionId::new(),
            inner.clock.now(),
            timeout,
        ));
        inner.registry.insert(Arc::clone(&entry));
        let txn = Transaction::from_entry(entry);
        CurrentContext::set(inner.instance, txn.clone());
        inner.record_start();

        debug!(
            target: "xact::txn",
            txn = %txn.id(),
            timeout_ms = timeout.as_millis() as u64,
            "Transaction started"
        );
        Ok(txn)
    }

    /// Status of `txn`; never blocks
    pub fn get_status(&self, txn: &Transaction) -> Status {
        txn.status()
    }

    /// Status of a transaction by id; `NoTransaction` if unknown
    pub fn status_of(&self, id: TransactionId) -> Status {
        self.inner
            .registry
            .get(&id)
            .map(|entry| entry.status())
            .unwrap_or(Status::NoTransaction)
    }

    /// The calling thread's current transaction
    pub fn current(&self) -> Option<Transaction> {
        CurrentContext::get(self.inner.instance)
    }

    /// Status of the calling thread's current transaction
    pub fn current_status(&self) -> Status {
        self.current()
            .map(|txn| txn.status())
            .unwrap_or(Status::NoTransaction)
    }

    /// Enlist a resource in `txn`
    ///
    /// Calls `adapter.enlist` and appends the adapter to the enlistment
    /// order. Enlisting a resource id that is already part of `txn` is a
    /// no-op.
    ///
    /// # Errors
    /// `XactError::Enlistment` if the transaction is not ACTIVE, its
    /// deadline has passed, the resource is bound to another live
    /// transaction, or the adapter refuses.
    pub fn enlist(&self, txn: &Transaction, adapter: Arc<dyn ResourceAdapter>) -> Result<()> {
        let inner = &self.inner;
        let id = txn.id();
        let resource = adapter.resource_id().clone();
        let entry = txn.entry();
        let mut guard = entry.lock();

        let fail = |reason: EnlistmentFailure| XactError::Enlistment {
            txn: id,
            resource: resource.clone(),
            reason,
        };

        let status = guard.status();
        if status != Status::Active {
            return Err(fail(EnlistmentFailure::NotActive(status)));
        }
        if entry.check_deadline(inner.clock.now()) {
            warn!(target: "xact::txn", txn = %id, resource = %resource, "Enlist after deadline");
            return Err(fail(EnlistmentFailure::DeadlineExceeded));
        }
        if guard.is_enlisted(&resource) {
            debug!(target: "xact::txn", txn = %id, resource = %resource, "Resource already enlisted");
            return Ok(());
        }
        if let Err(holder) = inner.registry.bind(&resource, id) {
            return Err(fail(EnlistmentFailure::AlreadyEnlisted(holder)));
        }
        if let Err(e) = adapter.enlist(id) {
            inner.registry.unbind(&resource, id);
            let reason = match e {
                AdapterError::AlreadyEnlisted(holder) => EnlistmentFailure::AlreadyEnlisted(holder),
                other => EnlistmentFailure::Adapter(other.to_string()),
            };
            return Err(fail(reason));
        }

        guard.push_enlistment(adapter)?;
        debug!(
            target: "xact::txn",
            txn = %id,
            resource = %resource,
            position = guard.enlisted().len(),
            "Resource enlisted"
        );
        Ok(())
    }

    /// Mark `txn` so that it can only roll back
    ///
    /// Idempotent while MARKED_ROLLBACK.
    ///
    /// # Errors
    /// `XactError::InvalidState` in any other non-ACTIVE status.
    pub fn mark_rollback_only(&self, txn: &Transaction) -> Result<()> {
        let mut guard = txn.entry().lock();
        match guard.status() {
            Status::Active => {
                guard.transition(Status::MarkedRollback)?;
                debug!(target: "xact::txn", txn = %txn.id(), "Transaction marked rollback-only");
                Ok(())
            }
            Status::MarkedRollback => Ok(()),
            status => Err(XactError::InvalidState {
                txn: txn.id(),
                status,
                operation: "mark rollback-only",
            }),
        }
    }

    /// Commit `txn`
    ///
    /// Uses one-phase commit for a single resource and two-phase commit
    /// otherwise.
    ///
    /// # Errors
    /// * `Rollback` - the transaction rolled back instead (marked
    ///   rollback-only, a resource voted no, deadline passed, rollback
    ///   requested)
    /// * `HeuristicMixed` / `HeuristicRollback` / `System` - the outcome is
    ///   UNKNOWN; the error carries the per-resource report
    /// * `InvalidState` - the transaction already finished
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        let mut guard = txn.entry().lock();
        if guard.status() == Status::RolledBack {
            if let Some(cause) = guard.rollback_cause().cloned() {
                return Err(XactError::Rollback {
                    txn: txn.id(),
                    cause,
                });
            }
        }
        let result = self.inner.protocol().commit(&mut guard);
        self.inner.finish(&mut guard);
        result
    }

    /// Roll back `txn`
    ///
    /// A commit in flight on another thread observes the request before its
    /// decision and rolls back itself; this call then waits for it and
    /// reports the final status. Rolling back a ROLLEDBACK or UNKNOWN
    /// transaction is a no-op that returns that status.
    ///
    /// # Errors
    /// * `HeuristicRollback` - some resource failed to roll back
    /// * `InvalidState` - the transaction committed
    pub fn rollback(&self, txn: &Transaction) -> Result<Status> {
        let entry = txn.entry();
        entry.request_rollback();
        let mut guard = entry.lock();
        let result = match guard.status() {
            Status::RolledBack | Status::Unknown => Ok(guard.status()),
            Status::Active | Status::MarkedRollback => self.inner.protocol().rollback(&mut guard),
            status => Err(XactError::InvalidState {
                txn: txn.id(),
                status,
                operation: "roll back",
            }),
        };
        self.inner.finish(&mut guard);
        result
    }

    /// Commit `txn` if it is still ACTIVE; otherwise return its status
    ///
    /// # Returns
    /// * `Ok(status)` - the final status after commit, or the untouched
    ///   status of a non-ACTIVE transaction
    pub fn commit_if_active(&self, txn: &Transaction) -> Result<Status> {
        let mut guard = txn.entry().lock();
        let status = guard.status();
        if status != Status::Active {
            debug!(target: "xact::txn", txn = %txn.id(), status = %status, "Not active, commit skipped");
            return Ok(status);
        }
        let result = self.inner.protocol().commit(&mut guard);
        self.inner.finish(&mut guard);
        result.map(|()| guard.status())
    }

    /// Finished transactions still held by the coordinator, oldest first
    pub fn pending_outcomes(&self) -> Vec<OutcomeRecord> {
        let mut records: Vec<OutcomeRecord> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .filter(|entry| entry.status().is_terminal())
            .map(|entry| {
                let guard = entry.lock();
                OutcomeRecord {
                    txn: entry.id(),
                    status: guard.status(),
                    rollback_cause: guard.rollback_cause().cloned(),
                    report: guard.report().cloned(),
                    started_at: entry.started_wall(),
                    completed_at: guard.completed_wall(),
                }
            })
            .collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    /// Drop a finished transaction
    ///
    /// For UNKNOWN transactions, tells every resource that reported a
    /// heuristic outcome to forget it first.
    ///
    /// # Errors
    /// * `NotFound` - unknown id (never begun, already forgotten or reaped)
    /// * `InvalidState` - the transaction has not finished
    pub fn forget(&self, id: TransactionId) -> Result<()> {
        let inner = &self.inner;
        let entry = inner.registry.get(&id).ok_or(XactError::NotFound(id))?;
        {
            let guard = entry.lock();
            let status = guard.status();
            if !status.is_terminal() {
                return Err(XactError::InvalidState {
                    txn: id,
                    status,
                    operation: "forget",
                });
            }
            for enlistment in guard.enlisted() {
                if status == Status::Unknown && enlistment.outcome.needs_forget() {
                    if let Err(e) = enlistment.adapter.forget(id) {
                        warn!(
                            target: "xact::txn",
                            txn = %id,
                            resource = %enlistment.adapter.resource_id(),
                            error = %e,
                            "Forget failed"
                        );
                    }
                }
                inner.registry.unbind(enlistment.adapter.resource_id(), id);
            }
        }
        inner.registry.remove(&id);
        debug!(target: "xact::txn", txn = %id, "Transaction forgotten");
        Ok(())
    }

    /// Run one sweeper pass on the calling thread
    pub fn sweep(&self) -> SweepStats {
        self.inner.sweep()
    }

    /// Get transaction metrics
    ///
    /// Returns current snapshot of transaction statistics.
    pub fn metrics(&self) -> TransactionMetrics {
        let inner = &self.inner;
        let started = inner.total_started.load(Ordering::Relaxed);
        let committed = inner.total_committed.load(Ordering::Relaxed);

        TransactionMetrics {
            active_count: inner.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_rolled_back: inner.total_rolled_back.load(Ordering::Relaxed),
            total_heuristic: inner.total_heuristic.load(Ordering::Relaxed),
            total_timed_out: inner.total_timed_out.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }

    /// Get current active transaction count
    pub fn active_count(&self) -> u64 {
        self.inner.active_count.load(Ordering::SeqCst)
    }

    /// Wait for all active transactions to complete
    ///
    /// Spins with short sleeps until active_count reaches 0.
    ///
    /// # Arguments
    /// * `timeout` - Maximum time to wait
    ///
    /// # Returns
    /// * `true` if all transactions completed within timeout
    /// * `false` if timeout expired with transactions still active
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let sleep_duration = Duration::from_millis(1);

        while self.inner.active_count.load(Ordering::SeqCst) > 0 {
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(sleep_duration);
        }
        true
    }

    /// Whether `shutdown` has run
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop the sweeper and roll back every unfinished transaction
    ///
    /// Transactions locked by an in-flight commit get up to `grace` to
    /// finish; an abort request is raised so they roll back at their next
    /// check. Later calls are no-ops.
    ///
    /// # Returns
    /// Number of transactions rolled back by this call.
    pub fn shutdown(&self, grace: Duration) -> usize {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::AcqRel) {
            return 0;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }

        let give_up_at = Instant::now() + grace;
        let mut rolled_back = 0;
        for entry in inner.registry.snapshot() {
            if entry.status().is_terminal() {
                continue;
            }
            entry.request_rollback();
            let wait = give_up_at.saturating_duration_since(Instant::now());
            let mut guard = match entry.try_lock_for(wait) {
                Some(guard) => guard,
                None => {
                    warn!(target: "xact::txn", txn = %entry.id(), "Transaction still in flight at shutdown");
                    continue;
                }
            };
            if matches!(guard.status(), Status::Active | Status::MarkedRollback) {
                if let Err(e) = inner.protocol().rollback(&mut guard) {
                    error!(target: "xact::txn", txn = %entry.id(), error = %e, "Shutdown rollback incomplete");
                }
                inner.finish(&mut guard);
                rolled_back += 1;
            }
        }

        info!(
            target: "xact::txn",
            instance = inner.instance,
            rolled_back,
            retained = inner.registry.len(),
            "Coordinator shut down"
        );
        rolled_back
    }
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            self.shutdown(self.inner.config.shutdown_grace());
        }
    }
}

/// Transaction metrics
///
/// Provides statistics about transaction lifecycle.
#[derive(Debug, Clone)]
pub struct TransactionMetrics {
    /// Number of transactions begun and not yet finished
    pub active_count: u64,
    /// Total number of transactions begun
    pub total_started: u64,
    /// Total number of transactions committed
    pub total_committed: u64,
    /// Total number of transactions rolled back
    pub total_rolled_back: u64,
    /// Total number of transactions that ended UNKNOWN
    pub total_heuristic: u64,
    /// Rolled-back transactions whose cause was the deadline
    pub total_timed_out: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Total transactions that finished (committed + rolled back + heuristic)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_rolled_back + self.total_heuristic
    }

    /// Rollback rate (rolled back / started)
    pub fn abort_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_rolled_back as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}
