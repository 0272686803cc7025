//! Shared test utilities for the coordinator integration suites.
//!
//! Import via `mod common;` from any test file.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::{Arc, Once};
use std::time::Duration;
pub use xact_coordinator::{CoordinatorConfig, Transaction, TransactionCoordinator};
pub use xact_core::{
    AdapterError, AdapterResult, Capability, EnlistmentFailure, HeuristicKind, ManualClock,
    ResourceAdapter, ResourceId, ResourceOutcome, RollbackCause, Status, TransactionId, Vote,
    XactError,
};

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Coordinator on the system clock with default config.
pub fn coordinator() -> TransactionCoordinator {
    init_tracing();
    TransactionCoordinator::new(CoordinatorConfig::default()).unwrap()
}

/// Coordinator with a custom config.
pub fn coordinator_with(config: CoordinatorConfig) -> TransactionCoordinator {
    init_tracing();
    TransactionCoordinator::new(config).unwrap()
}

/// Coordinator on a manual clock.
pub fn manual_coordinator() -> (TransactionCoordinator, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::new());
    let coordinator =
        TransactionCoordinator::with_clock(CoordinatorConfig::default(), clock.clone()).unwrap();
    (coordinator, clock)
}

// ============================================================================
// MockAdapter - scripted resource that records every call
// ============================================================================

/// One call made on a `MockAdapter`, tagged with the adapter's name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Enlist(String),
    Prepare(String),
    Commit(String, bool),
    Rollback(String),
    Forget(String),
}

/// Call log shared by all adapters of one test, in global call order
pub type CallLog = Arc<Mutex<Vec<Call>>>;

pub fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Resource adapter with scripted answers
pub struct MockAdapter {
    id: ResourceId,
    name: String,
    capability: Capability,
    enlist: AdapterResult<()>,
    vote: AdapterResult<Vote>,
    commit: AdapterResult<()>,
    rollback: AdapterResult<()>,
    prepare_delay: Duration,
    log: CallLog,
}

impl MockAdapter {
    /// Preparable adapter that accepts everything
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            id: ResourceId::new(name),
            name: name.to_string(),
            capability: Capability::Preparable,
            enlist: Ok(()),
            vote: Ok(Vote::Commit),
            commit: Ok(()),
            rollback: Ok(()),
            prepare_delay: Duration::ZERO,
            log: Arc::clone(log),
        }
    }

    pub fn non_preparable(mut self) -> Self {
        self.capability = Capability::NonPreparable;
        self
    }

    pub fn voting(mut self, vote: AdapterResult<Vote>) -> Self {
        self.vote = vote;
        self
    }

    pub fn committing(mut self, result: AdapterResult<()>) -> Self {
        self.commit = result;
        self
    }

    pub fn rolling_back(mut self, result: AdapterResult<()>) -> Self {
        self.rollback = result;
        self
    }

    pub fn enlisting(mut self, result: AdapterResult<()>) -> Self {
        self.enlist = result;
        self
    }

    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    pub fn shared(self) -> Arc<dyn ResourceAdapter> {
        Arc::new(self)
    }

    fn record(&self, call: Call) {
        self.log.lock().push(call);
    }
}

impl ResourceAdapter for MockAdapter {
    fn resource_id(&self) -> &ResourceId {
        &self.id
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn enlist(&self, _txn: TransactionId) -> AdapterResult<()> {
        self.record(Call::Enlist(self.name.clone()));
        self.enlist.clone()
    }

    fn prepare(&self, _txn: TransactionId) -> AdapterResult<Vote> {
        self.record(Call::Prepare(self.name.clone()));
        if !self.prepare_delay.is_zero() {
            std::thread::sleep(self.prepare_delay);
        }
        self.vote.clone()
    }

    fn commit(&self, _txn: TransactionId, one_phase: bool) -> AdapterResult<()> {
        self.record(Call::Commit(self.name.clone(), one_phase));
        self.commit.clone()
    }

    fn rollback(&self, _txn: TransactionId) -> AdapterResult<()> {
        self.record(Call::Rollback(self.name.clone()));
        self.rollback.clone()
    }

    fn forget(&self, _txn: TransactionId) -> AdapterResult<()> {
        self.record(Call::Forget(self.name.clone()));
        Ok(())
    }
}

// ============================================================================
// Log helpers
// ============================================================================

/// Calls made on the adapter called `name`, in order
pub fn calls_of(log: &CallLog, name: &str) -> Vec<Call> {
    log.lock()
        .iter()
        .filter(|call| match call {
            Call::Enlist(n)
            | Call::Prepare(n)
            | Call::Commit(n, _)
            | Call::Rollback(n)
            | Call::Forget(n) => n == name,
        })
        .cloned()
        .collect()
}

/// Names of adapters that received `prepare`, in call order
pub fn prepared(log: &CallLog) -> Vec<String> {
    log.lock()
        .iter()
        .filter_map(|call| match call {
            Call::Prepare(n) => Some(n.clone()),
            _ => None,
        })
        .collect()
}

/// Names of adapters that received `commit`, in call order
pub fn committed(log: &CallLog) -> Vec<String> {
    log.lock()
        .iter()
        .filter_map(|call| match call {
            Call::Commit(n, _) => Some(n.clone()),
            _ => None,
        })
        .collect()
}

/// Names of adapters that received `rollback`, in call order
pub fn rolled_back(log: &CallLog) -> Vec<String> {
    log.lock()
        .iter()
        .filter_map(|call| match call {
            Call::Rollback(n) => Some(n.clone()),
            _ => None,
        })
        .collect()
}
