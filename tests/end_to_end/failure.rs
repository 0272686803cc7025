//! Transfers that fail and must leave no trace

use crate::common::*;
use std::thread;
use std::time::{Duration, Instant};

/// Begin a transfer: enlist a fresh connection and session, receive one
/// message and stage its ledger row
fn stage_transfer(
    fixture: &Fixture,
) -> (
    xact::Transaction,
    std::sync::Arc<DbConnection>,
    std::sync::Arc<QueueSession>,
) {
    let conn = fixture.connection();
    let session = fixture.session();
    let c = &fixture.coordinator;
    let txn = c.begin(None).unwrap();
    c.enlist(&txn, conn.clone()).unwrap();
    c.enlist(&txn, session.clone()).unwrap();

    let message = session
        .receive(QUEUE, Duration::from_millis(100))
        .unwrap()
        .expect("a transfer was published");
    conn.execute(Statement::insert(LEDGER, ledger_row(1, &message.body)))
        .unwrap();
    (txn, conn, session)
}

#[test]
fn conflicting_write_rolls_back_and_redelivers() {
    let fixture = Fixture::new();
    fixture.broker.publish(QUEUE, "order-1").unwrap();
    let (txn, conn, _session) = stage_transfer(&fixture);

    // Another writer commits the same key before the transfer does
    fixture
        .db
        .open_connection()
        .execute(Statement::insert(LEDGER, ledger_row(1, "intruder")))
        .unwrap();

    let err = fixture.coordinator.commit(&txn).unwrap_err();
    assert_eq!(
        err.rollback_cause(),
        Some(&RollbackCause::ResourceVotedRollback(conn.resource_id().clone()))
    );
    assert_eq!(txn.status(), Status::RolledBack);
    assert_eq!(fixture.ledger(), vec![(1, "intruder".to_string())]);

    let queued = fixture.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].body, "order-1");
    assert!(queued[0].redelivered);
    assert_eq!(fixture.db.locked_rows(), 0);
}

#[test]
fn caller_rollback_redelivers_and_commit_if_active_skips() {
    let fixture = Fixture::new();
    fixture.broker.publish(QUEUE, "order-1").unwrap();
    let (txn, _conn, _session) = stage_transfer(&fixture);
    let c = &fixture.coordinator;

    // Processing failed; the caller gives up on the transfer
    assert_eq!(c.rollback(&txn).unwrap(), Status::RolledBack);
    assert_eq!(c.commit_if_active(&txn).unwrap(), Status::RolledBack);
    assert!(matches!(
        c.commit(&txn),
        Err(XactError::InvalidState {
            status: Status::RolledBack,
            ..
        })
    ));
    // Rolling back twice is harmless
    assert_eq!(c.rollback(&txn).unwrap(), Status::RolledBack);

    assert!(fixture.ledger().is_empty());
    assert!(fixture.queued()[0].redelivered);
    assert_eq!(c.metrics().total_rolled_back, 1);
}

#[test]
fn rollback_only_transfer_is_never_committed() {
    let fixture = Fixture::new();
    fixture.broker.publish(QUEUE, "order-1").unwrap();
    let (txn, _conn, _session) = stage_transfer(&fixture);
    let c = &fixture.coordinator;

    c.mark_rollback_only(&txn).unwrap();
    assert_eq!(c.current_status(), Status::MarkedRollback);
    let err = c.commit(&txn).unwrap_err();
    assert_eq!(err.rollback_cause(), Some(&RollbackCause::MarkedRollbackOnly));

    assert!(fixture.ledger().is_empty());
    assert_eq!(fixture.queued().len(), 1);
}

#[test]
fn expired_transfer_is_rolled_back_by_the_sweeper() {
    let fixture = Fixture::with_config(CoordinatorConfig {
        sweep_interval_ms: 10,
        ..CoordinatorConfig::default()
    });
    fixture.broker.publish(QUEUE, "order-1").unwrap();
    let c = &fixture.coordinator;

    let conn = fixture.connection();
    let session = fixture.session();
    let txn = c.begin(Some(Duration::from_millis(50))).unwrap();
    c.enlist(&txn, conn.clone()).unwrap();
    c.enlist(&txn, session.clone()).unwrap();
    session.receive(QUEUE, Duration::ZERO).unwrap().unwrap();
    conn.execute(Statement::insert(LEDGER, ledger_row(1, "order-1")))
        .unwrap();

    let start = Instant::now();
    while !txn.status().is_terminal() && start.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(txn.status(), Status::RolledBack);
    assert!(txn.is_timed_out());
    assert!(fixture.ledger().is_empty());
    assert!(fixture.queued()[0].redelivered);
    assert_eq!(conn.pending_writes(), 0);

    let err = c.commit(&txn).unwrap_err();
    assert_eq!(err.rollback_cause(), Some(&RollbackCause::TimeoutExceeded));
}

#[test]
fn work_after_timeout_is_refused_not_autocommitted() {
    let fixture = Fixture::with_config(CoordinatorConfig {
        sweep_interval_ms: 10,
        ..CoordinatorConfig::default()
    });
    fixture.broker.publish(QUEUE, "order-1").unwrap();
    fixture.broker.publish(QUEUE, "order-2").unwrap();
    let c = &fixture.coordinator;

    let conn = fixture.connection();
    let session = fixture.session();
    let txn = c.begin(Some(Duration::from_millis(50))).unwrap();
    c.enlist(&txn, conn.clone()).unwrap();
    c.enlist(&txn, session.clone()).unwrap();
    session.receive(QUEUE, Duration::ZERO).unwrap().unwrap();
    conn.execute(Statement::insert(LEDGER, ledger_row(1, "order-1")))
        .unwrap();

    let start = Instant::now();
    while !txn.status().is_terminal() && start.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(txn.status(), Status::RolledBack);

    // The caller has not noticed the timeout and keeps going
    assert!(matches!(
        session.receive(QUEUE, Duration::ZERO),
        Err(QueueError::TransactionEnded { txn: ended, .. }) if ended == txn.id()
    ));
    assert!(matches!(
        conn.execute(Statement::insert(LEDGER, ledger_row(2, "order-2"))),
        Err(DatabaseError::TransactionEnded { txn: ended, .. }) if ended == txn.id()
    ));
    assert!(matches!(
        session.send(QUEUE, "receipt"),
        Err(QueueError::TransactionEnded { .. })
    ));
    let err = c.commit(&txn).unwrap_err();
    assert_eq!(err.rollback_cause(), Some(&RollbackCause::TimeoutExceeded));

    assert!(fixture.ledger().is_empty());
    let bodies: Vec<_> = fixture.queued().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["order-1", "order-2"]);

    // Re-enlisting starts clean
    let retry = c.begin(None).unwrap();
    c.enlist(&retry, conn.clone()).unwrap();
    c.enlist(&retry, session.clone()).unwrap();
    let message = session.receive(QUEUE, Duration::ZERO).unwrap().unwrap();
    assert!(message.redelivered);
    conn.execute(Statement::insert(LEDGER, ledger_row(1, &message.body)))
        .unwrap();
    c.commit(&retry).unwrap();
    assert_eq!(fixture.ledger(), vec![(1, "order-1".to_string())]);
}

#[test]
fn redelivered_transfer_succeeds_on_retry() {
    let fixture = Fixture::new();
    fixture.broker.publish(QUEUE, "order-1").unwrap();

    let (txn, _conn, _session) = stage_transfer(&fixture);
    fixture.coordinator.rollback(&txn).unwrap();

    let (retry, _conn, _session) = stage_transfer(&fixture);
    fixture.coordinator.commit(&retry).unwrap();

    assert_eq!(fixture.ledger(), vec![(1, "order-1".to_string())]);
    assert!(fixture.queued().is_empty());
    let metrics = fixture.coordinator.metrics();
    assert_eq!(metrics.total_committed, 1);
    assert_eq!(metrics.total_rolled_back, 1);
}
