//! Two-phase-commit driver
//!
//! Drives prepare/commit/rollback across the adapters enlisted in one
//! transaction. Every function here runs with the transaction's lock held
//! (through a `TransactionGuard`) and never touches the registry.
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. MARKED_ROLLBACK, deadline passed or rollback requested → rollback, Err(Rollback)
//! 2. 0 resources → COMMITTED
//!    1 resource  → commit(one_phase = true) → COMMITTED
//! 3. PREPARING: prepare() every preparable resource
//!    any ROLLBACK vote / prepare failure → MARKED_ROLLBACK → rollback, Err(Rollback)
//! 4. commit(one_phase = false) each non-preparable resource, in enlist
//!    order; a refusal by the first one → rollback, Err(Rollback)
//! 5. PREPARED → COMMITTING: commit(one_phase = false) every other resource
//! 6. all committed → COMMITTED
//!    otherwise → UNKNOWN, Err(HeuristicMixed | HeuristicRollback | System)
//! ```
//!
//! The deadline and rollback requests are checked before each prepare and
//! once more before the decision. After COMMITTING nothing can stop the
//! commit from being delivered.

use crate::config::CoordinatorConfig;
use crate::transaction::TransactionGuard;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use xact_core::{
    AdapterError, AdapterResult, Clock, HeuristicKind, HeuristicReport, ResourceAdapter, ResourceId,
    ResourceOutcome, Result, RollbackCause, Status, TransactionId, Vote, XactError,
};

/// Stateless protocol driver bound to a coordinator's config and clock
pub(crate) struct Protocol<'a> {
    config: &'a CoordinatorConfig,
    clock: &'a dyn Clock,
}

impl<'a> Protocol<'a> {
    pub(crate) fn new(config: &'a CoordinatorConfig, clock: &'a dyn Clock) -> Self {
        Self { config, clock }
    }

    /// Call every adapter, sequentially or in parallel.
    ///
    /// Results come back in the order of `adapters` either way.
    fn dispatch<T, F>(&self, adapters: &[Arc<dyn ResourceAdapter>], call: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&dyn ResourceAdapter) -> T + Send + Sync,
    {
        if self.config.parallel_dispatch && adapters.len() > 1 {
            adapters.par_iter().map(|a| call(a.as_ref())).collect()
        } else {
            adapters.iter().map(|a| call(a.as_ref())).collect()
        }
    }

    /// Reason an in-flight commit must turn into a rollback, if any
    fn abort_reason(&self, txn: &TransactionGuard<'_>) -> Option<RollbackCause> {
        let entry = txn.entry();
        if entry.check_deadline(self.clock.now()) {
            Some(RollbackCause::TimeoutExceeded)
        } else if entry.rollback_requested() {
            Some(RollbackCause::RollbackRequested)
        } else {
            None
        }
    }

    /// Run the commit protocol.
    ///
    /// The transaction must be ACTIVE or MARKED_ROLLBACK; anything else is
    /// `InvalidState`.
    pub(crate) fn commit(&self, txn: &mut TransactionGuard<'_>) -> Result<()> {
        let id = txn.id();
        match txn.status() {
            Status::Active => {}
            Status::MarkedRollback => {
                let cause = txn
                    .rollback_cause()
                    .cloned()
                    .unwrap_or(RollbackCause::MarkedRollbackOnly);
                return self.abort_commit(txn, cause);
            }
            status => {
                return Err(XactError::InvalidState {
                    txn: id,
                    status,
                    operation: "commit",
                })
            }
        }

        if let Some(cause) = self.abort_reason(txn) {
            return self.abort_commit(txn, cause);
        }

        let adapters = txn.adapters();
        match adapters.len() {
            0 => {
                txn.transition(Status::Committing)?;
                txn.transition(Status::Committed)?;
                info!(target: "xact::txn", txn = %id, "Empty transaction committed");
                Ok(())
            }
            1 => self.commit_one_phase(txn, &adapters[0]),
            _ => self.commit_two_phase(txn, &adapters),
        }
    }

    /// Roll back instead of committing and report the cause to the caller.
    fn abort_commit(&self, txn: &mut TransactionGuard<'_>, cause: RollbackCause) -> Result<()> {
        if matches!(txn.status(), Status::Active | Status::Preparing) {
            txn.transition(Status::MarkedRollback)?;
        }
        txn.set_rollback_cause(cause.clone());
        warn!(target: "xact::txn", txn = %txn.id(), cause = %cause, "Commit refused, rolling back");
        self.rollback(txn)?;
        Err(XactError::Rollback {
            txn: txn.id(),
            cause,
        })
    }

    /// Single-participant commit without a prepare round.
    fn commit_one_phase(
        &self,
        txn: &mut TransactionGuard<'_>,
        adapter: &Arc<dyn ResourceAdapter>,
    ) -> Result<()> {
        let id = txn.id();
        let resource = adapter.resource_id().clone();
        txn.transition(Status::Committing)?;
        debug!(target: "xact::txn", txn = %id, resource = %resource, "One-phase commit");

        match adapter.commit(id, true) {
            Ok(()) => {
                txn.set_outcome(0, ResourceOutcome::Committed);
                txn.transition(Status::Committed)?;
                info!(target: "xact::txn", txn = %id, "Transaction committed (one-phase)");
                Ok(())
            }
            Err(AdapterError::Heuristic(HeuristicKind::Commit)) => {
                txn.set_outcome(0, ResourceOutcome::Heuristic(HeuristicKind::Commit));
                forget_quietly(id, adapter.as_ref());
                txn.transition(Status::Committed)?;
                info!(target: "xact::txn", txn = %id, "Transaction committed (one-phase, heuristic)");
                Ok(())
            }
            Err(AdapterError::RolledBack(reason)) => {
                txn.set_outcome(0, ResourceOutcome::RolledBack);
                let cause = RollbackCause::ResourceVotedRollback(resource);
                txn.set_rollback_cause(cause.clone());
                txn.transition(Status::RolledBack)?;
                warn!(target: "xact::txn", txn = %id, reason = %reason, "One-phase commit rolled back by resource");
                Err(XactError::Rollback { txn: id, cause })
            }
            Err(AdapterError::Heuristic(kind)) => {
                txn.set_outcome(0, ResourceOutcome::Heuristic(kind));
                let report = self.finish_unknown(txn)?;
                if kind == HeuristicKind::Rollback {
                    Err(XactError::HeuristicRollback(report))
                } else {
                    Err(XactError::HeuristicMixed(report))
                }
            }
            Err(e) => {
                txn.set_outcome(0, ResourceOutcome::Failed(e.to_string()));
                let report = self.finish_unknown(txn)?;
                Err(XactError::System {
                    txn: id,
                    message: format!("one-phase commit of {} failed: {}", resource, e),
                    report: Some(report),
                })
            }
        }
    }

    /// Full prepare/commit round.
    fn commit_two_phase(
        &self,
        txn: &mut TransactionGuard<'_>,
        adapters: &[Arc<dyn ResourceAdapter>],
    ) -> Result<()> {
        let id = txn.id();
        txn.transition(Status::Preparing)?;

        let preparable: Vec<usize> = adapters
            .iter()
            .enumerate()
            .filter(|(_, a)| a.capability().is_preparable())
            .map(|(i, _)| i)
            .collect();

        let mut failure = None;
        if self.config.parallel_dispatch && preparable.len() > 1 {
            let targets: Vec<Arc<dyn ResourceAdapter>> =
                preparable.iter().map(|&i| Arc::clone(&adapters[i])).collect();
            let votes = self.dispatch(&targets, |a| self.prepare_with_retry(id, a));
            for (&index, vote) in preparable.iter().zip(votes) {
                let (outcome, cause) = classify_vote(adapters[index].resource_id(), vote);
                txn.set_outcome(index, outcome);
                if failure.is_none() {
                    failure = cause;
                }
            }
        } else {
            for &index in &preparable {
                if let Some(cause) = self.abort_reason(txn) {
                    failure = Some(cause);
                    break;
                }
                let vote = self.prepare_with_retry(id, adapters[index].as_ref());
                let (outcome, cause) = classify_vote(adapters[index].resource_id(), vote);
                txn.set_outcome(index, outcome);
                if cause.is_some() {
                    failure = cause;
                    break;
                }
            }
        }

        if failure.is_none() {
            failure = self.abort_reason(txn);
        }
        if let Some(cause) = failure {
            return self.abort_commit(txn, cause);
        }

        // Non-preparable resources commit first; a refusal from the first
        // one still lets the whole transaction roll back.
        let mut delivered = vec![false; adapters.len()];
        let mut decided = false;
        for (index, adapter) in adapters.iter().enumerate() {
            if adapter.capability().is_preparable() {
                continue;
            }
            let result = adapter.commit(id, false);
            delivered[index] = true;
            let refused = matches!(
                result,
                Err(AdapterError::RolledBack(_)
                    | AdapterError::Failed(_)
                    | AdapterError::Unavailable(_)
                    | AdapterError::AlreadyEnlisted(_))
            );
            if refused && !decided {
                warn!(
                    target: "xact::txn",
                    txn = %id,
                    resource = %adapter.resource_id(),
                    "Last resource refused commit"
                );
                let cause = RollbackCause::ResourceVotedRollback(adapter.resource_id().clone());
                return self.abort_commit(txn, cause);
            }
            decided = true;
            self.record_commit(txn, index, adapter.as_ref(), result);
        }

        txn.transition(Status::Prepared)?;
        debug!(target: "xact::txn", txn = %id, voters = preparable.len(), "All resources prepared");
        txn.transition(Status::Committing)?;

        let remaining: Vec<usize> = (0..adapters.len()).filter(|&i| !delivered[i]).collect();
        let targets: Vec<Arc<dyn ResourceAdapter>> =
            remaining.iter().map(|&i| Arc::clone(&adapters[i])).collect();
        let results = self.dispatch(&targets, |a| a.commit(id, false));
        for (&index, result) in remaining.iter().zip(results) {
            self.record_commit(txn, index, adapters[index].as_ref(), result);
        }

        self.decide(txn, adapters)
    }

    /// Record one resource's answer to the commit decision.
    fn record_commit(
        &self,
        txn: &mut TransactionGuard<'_>,
        index: usize,
        adapter: &dyn ResourceAdapter,
        result: AdapterResult<()>,
    ) {
        let outcome = match result {
            Ok(()) => ResourceOutcome::Committed,
            Err(AdapterError::Heuristic(kind)) => ResourceOutcome::Heuristic(kind),
            Err(AdapterError::RolledBack(_)) => ResourceOutcome::Heuristic(HeuristicKind::Rollback),
            Err(e) => ResourceOutcome::Failed(e.to_string()),
        };
        if !outcome.is_committed() {
            warn!(
                target: "xact::txn",
                txn = %txn.id(),
                resource = %adapter.resource_id(),
                outcome = %outcome,
                "Resource did not commit"
            );
        }
        txn.set_outcome(index, outcome);
    }

    /// Classify the commit-phase outcomes into the final status.
    fn decide(
        &self,
        txn: &mut TransactionGuard<'_>,
        adapters: &[Arc<dyn ResourceAdapter>],
    ) -> Result<()> {
        let id = txn.id();
        let report = txn.build_report();
        let committed = report
            .outcomes
            .iter()
            .filter(|(_, o)| o.is_committed())
            .count();

        if committed == report.outcomes.len() {
            for (adapter, (_, outcome)) in adapters.iter().zip(&report.outcomes) {
                if outcome.needs_forget() {
                    forget_quietly(id, adapter.as_ref());
                }
            }
            txn.transition(Status::Committed)?;
            info!(target: "xact::txn", txn = %id, resources = committed, "Transaction committed");
            return Ok(());
        }

        let mixed = report.outcomes.iter().any(|(_, o)| {
            matches!(
                o,
                ResourceOutcome::Heuristic(HeuristicKind::Mixed | HeuristicKind::Hazard)
            )
        });
        let all_rolled_back = report
            .outcomes
            .iter()
            .all(|(_, o)| matches!(o, ResourceOutcome::Heuristic(HeuristicKind::Rollback)));

        let report = self.finish_unknown(txn)?;
        if committed > 0 || mixed {
            Err(XactError::HeuristicMixed(report))
        } else if all_rolled_back {
            Err(XactError::HeuristicRollback(report))
        } else {
            Err(XactError::System {
                txn: id,
                message: "commit decision could not be delivered".to_string(),
                report: Some(report),
            })
        }
    }

    /// Move to UNKNOWN and record the report.
    fn finish_unknown(&self, txn: &mut TransactionGuard<'_>) -> Result<HeuristicReport> {
        txn.transition(Status::Unknown)?;
        let report = txn.build_report();
        txn.set_report(report.clone());
        error!(target: "xact::txn", txn = %txn.id(), report = %report, "Transaction outcome is inconsistent");
        Ok(report)
    }

    /// Roll back every enlisted resource.
    ///
    /// Attempts all resources even if earlier ones fail. Returns
    /// `RolledBack`, or `HeuristicRollback` naming the failing resources.
    pub(crate) fn rollback(&self, txn: &mut TransactionGuard<'_>) -> Result<Status> {
        let id = txn.id();
        txn.transition(Status::RollingBack)?;

        let adapters = txn.adapters();
        let results = self.dispatch(&adapters, |a| a.rollback(id));

        let mut failed = false;
        for (index, (adapter, result)) in adapters.iter().zip(results).enumerate() {
            let outcome = match result {
                Ok(()) => ResourceOutcome::RolledBack,
                Err(AdapterError::Heuristic(HeuristicKind::Rollback)) => {
                    forget_quietly(id, adapter.as_ref());
                    ResourceOutcome::RolledBack
                }
                Err(AdapterError::Heuristic(kind)) => ResourceOutcome::Heuristic(kind),
                Err(e) => ResourceOutcome::Failed(e.to_string()),
            };
            if outcome != ResourceOutcome::RolledBack {
                failed = true;
                warn!(
                    target: "xact::txn",
                    txn = %id,
                    resource = %adapter.resource_id(),
                    outcome = %outcome,
                    "Resource did not roll back"
                );
            }
            txn.set_outcome(index, outcome);
        }

        if failed {
            let report = self.finish_unknown(txn)?;
            return Err(XactError::HeuristicRollback(report));
        }

        txn.transition(Status::RolledBack)?;
        info!(target: "xact::txn", txn = %id, resources = adapters.len(), "Transaction rolled back");
        Ok(Status::RolledBack)
    }

    /// Prepare, retrying transient failures up to `prepare_retries` times.
    fn prepare_with_retry(&self, txn: TransactionId, adapter: &dyn ResourceAdapter) -> AdapterResult<Vote> {
        let mut attempt = 0;
        loop {
            match adapter.prepare(txn) {
                Err(AdapterError::Unavailable(reason)) if attempt < self.config.prepare_retries => {
                    attempt += 1;
                    debug!(
                        target: "xact::txn",
                        txn = %txn,
                        resource = %adapter.resource_id(),
                        attempt,
                        reason = %reason,
                        "Prepare unavailable, retrying"
                    );
                }
                result => {
                    debug!(
                        target: "xact::txn",
                        txn = %txn,
                        resource = %adapter.resource_id(),
                        vote = ?result,
                        "Prepare vote"
                    );
                    return result;
                }
            }
        }
    }
}

/// Map a prepare result to the resource's outcome and, for a no-vote, the rollback cause.
fn classify_vote(
    resource: &ResourceId,
    vote: AdapterResult<Vote>,
) -> (ResourceOutcome, Option<RollbackCause>) {
    match vote {
        Ok(Vote::Commit) => (ResourceOutcome::Prepared, None),
        Ok(Vote::Rollback) | Err(AdapterError::RolledBack(_)) => (
            ResourceOutcome::VotedRollback,
            Some(RollbackCause::ResourceVotedRollback(resource.clone())),
        ),
        Err(e) => (
            ResourceOutcome::Failed(e.to_string()),
            Some(RollbackCause::PrepareFailed(resource.clone())),
        ),
    }
}

/// Tell an adapter to forget a heuristic outcome that matched the decision.
fn forget_quietly(txn: TransactionId, adapter: &dyn ResourceAdapter) {
    if let Err(e) = adapter.forget(txn) {
        warn!(
            target: "xact::txn",
            txn = %txn,
            resource = %adapter.resource_id(),
            error = %e,
            "Forget failed"
        );
    }
}
