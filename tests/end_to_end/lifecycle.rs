//! Coordinator lifecycle around the reference resources

use crate::common::*;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn status_names_match_operator_output() {
    let names: Vec<String> = [
        Status::NoTransaction,
        Status::Active,
        Status::MarkedRollback,
        Status::Preparing,
        Status::Prepared,
        Status::Committing,
        Status::Committed,
        Status::RollingBack,
        Status::RolledBack,
        Status::Unknown,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    assert_eq!(
        names,
        vec![
            "NO TRANSACTION",
            "ACTIVE",
            "MARKED ROLLBACK",
            "PREPARING",
            "PREPARED",
            "COMMITTING",
            "COMMITTED",
            "ROLLING BACK",
            "ROLLEDBACK",
            "UNKNOWN",
        ]
    );
}

#[test]
fn current_status_follows_the_thread() {
    let fixture = Fixture::new();
    let c = &fixture.coordinator;
    assert_eq!(c.current_status(), Status::NoTransaction);

    let txn = c.begin(None).unwrap();
    assert_eq!(c.current_status(), Status::Active);
    c.commit(&txn).unwrap();
    assert_eq!(c.current_status(), Status::NoTransaction);
    assert_eq!(c.status_of(txn.id()), Status::Committed);
}

#[test]
fn coordinator_from_config_file() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(xact::CONFIG_FILE_NAME);
    CoordinatorConfig::write_default_if_missing(&path).unwrap();

    let mut config = CoordinatorConfig::from_file(&path).unwrap();
    assert_eq!(config, CoordinatorConfig::default());
    config.parallel_dispatch = true;
    config.write_to_file(&path).unwrap();

    let fixture = Fixture::with_config(CoordinatorConfig::from_file(&path).unwrap());
    assert!(fixture.coordinator.config().parallel_dispatch);

    fixture.broker.publish(QUEUE, "order-4").unwrap();
    let conn = fixture.connection();
    let session = fixture.session();
    let c = &fixture.coordinator;
    let txn = c.begin(None).unwrap();
    c.enlist(&txn, conn.clone()).unwrap();
    c.enlist(&txn, session.clone()).unwrap();
    let message = session.receive(QUEUE, Duration::ZERO).unwrap().unwrap();
    conn.execute(Statement::insert(LEDGER, ledger_row(4, &message.body)))
        .unwrap();
    c.commit(&txn).unwrap();

    assert_eq!(fixture.ledger(), vec![(4, "order-4".to_string())]);
}

#[test]
fn shutdown_rolls_back_open_transfers() {
    let fixture = Fixture::new();
    fixture.broker.publish(QUEUE, "order-1").unwrap();
    let c = &fixture.coordinator;

    let conn = fixture.connection();
    let session = fixture.session();
    let txn = c.begin(None).unwrap();
    c.enlist(&txn, conn.clone()).unwrap();
    c.enlist(&txn, session.clone()).unwrap();
    session.receive(QUEUE, Duration::ZERO).unwrap().unwrap();

    assert_eq!(c.shutdown(Duration::from_secs(1)), 1);
    assert!(c.is_shut_down());
    assert_eq!(txn.status(), Status::RolledBack);
    assert!(fixture.queued()[0].redelivered);
    assert!(matches!(c.begin(None), Err(XactError::Shutdown)));
}

#[test]
fn finished_outcomes_can_be_forgotten() {
    let fixture = Fixture::new();
    let c = &fixture.coordinator;

    let txn = c.begin(None).unwrap();
    c.enlist(&txn, fixture.connection()).unwrap();
    c.commit(&txn).unwrap();

    let pending = c.pending_outcomes();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].txn, txn.id());
    assert_eq!(pending[0].status, Status::Committed);
    assert!(pending[0].completed_at.is_some());

    c.forget(txn.id()).unwrap();
    assert!(c.pending_outcomes().is_empty());
    assert!(matches!(c.forget(txn.id()), Err(XactError::NotFound(_))));
}
