//! Queue → database transfers that commit

use crate::common::*;
use std::time::Duration;

/// Receive every waiting transfer and write it to the ledger under one
/// transaction
fn drain_into_ledger(
    fixture: &Fixture,
    conn: &DbConnection,
    session: &QueueSession,
) -> usize {
    let mut moved = 0;
    while let Some(message) = session.receive(QUEUE, Duration::from_millis(20)).unwrap() {
        let id = message.body.trim_start_matches("order-").parse::<i64>().unwrap();
        conn.execute(Statement::insert(LEDGER, ledger_row(id, &message.body)))
            .unwrap();
        moved += 1;
    }
    assert!(fixture.ledger().is_empty(), "staged rows must stay private");
    moved
}

#[test]
fn queue_to_database_commits_atomically() {
    let fixture = Fixture::new();
    for n in 1..=3 {
        fixture.broker.publish(QUEUE, format!("order-{n}")).unwrap();
    }

    let conn = fixture.connection();
    let session = fixture.session();
    let c = &fixture.coordinator;

    // The demos give each transaction five minutes
    let txn = c.begin(Some(Duration::from_secs(300))).unwrap();
    assert_eq!(txn.timeout(), Duration::from_secs(300));
    c.enlist(&txn, conn.clone()).unwrap();
    c.enlist(&txn, session.clone()).unwrap();
    assert_eq!(
        txn.enlisted_resources(),
        vec![conn.resource_id().clone(), session.resource_id().clone()]
    );

    assert_eq!(drain_into_ledger(&fixture, &conn, &session), 3);
    assert!(fixture.queued().is_empty());

    c.commit(&txn).unwrap();
    assert_eq!(c.get_status(&txn), Status::Committed);
    assert_eq!(
        fixture.ledger(),
        vec![
            (1, "order-1".to_string()),
            (2, "order-2".to_string()),
            (3, "order-3".to_string()),
        ]
    );
    assert!(fixture.queued().is_empty());
    assert_eq!(fixture.db.locked_rows(), 0);
    assert_eq!(conn.enlisted_in(), None);
    assert_eq!(session.enlisted_in(), None);
}

#[test]
fn staged_sends_publish_with_the_database_write() {
    let fixture = Fixture::new();
    let conn = fixture.connection();
    let session = fixture.session();
    let c = &fixture.coordinator;

    let txn = c.begin(None).unwrap();
    c.enlist(&txn, conn.clone()).unwrap();
    c.enlist(&txn, session.clone()).unwrap();
    conn.execute(Statement::insert(LEDGER, ledger_row(10, "refund")))
        .unwrap();
    session.send(QUEUE, "refund-issued").unwrap();
    assert!(fixture.queued().is_empty());

    c.commit(&txn).unwrap();
    assert_eq!(fixture.ledger(), vec![(10, "refund".to_string())]);
    let queued = fixture.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].body, "refund-issued");
}

#[test]
fn non_preparable_session_as_last_resource() {
    let fixture = Fixture::new();
    fixture.broker.publish(QUEUE, "order-5").unwrap();

    let conn = fixture.connection();
    let session = std::sync::Arc::new(fixture.broker.open_session().non_preparable());
    let c = &fixture.coordinator;

    let txn = c.begin(None).unwrap();
    c.enlist(&txn, conn.clone()).unwrap();
    c.enlist(&txn, session.clone()).unwrap();
    assert_eq!(drain_into_ledger(&fixture, &conn, &session), 1);

    c.commit(&txn).unwrap();
    assert_eq!(fixture.ledger(), vec![(5, "order-5".to_string())]);
    assert!(fixture.queued().is_empty());
}

#[test]
fn single_connection_commits_in_one_phase() {
    let fixture = Fixture::new();
    let conn = fixture.connection();
    let c = &fixture.coordinator;

    let txn = c.begin(None).unwrap();
    c.enlist(&txn, conn.clone()).unwrap();
    conn.execute(Statement::insert(LEDGER, ledger_row(1, "solo")))
        .unwrap();
    c.commit(&txn).unwrap();

    assert_eq!(fixture.ledger(), vec![(1, "solo".to_string())]);
    // One-phase commit never takes row locks
    assert_eq!(fixture.db.locked_rows(), 0);
    assert_eq!(c.metrics().total_committed, 1);
}

#[test]
fn consecutive_transactions_reuse_connections() {
    let fixture = Fixture::new();
    let conn = fixture.connection();
    let session = fixture.session();
    let c = &fixture.coordinator;

    for id in 1..=5 {
        fixture.broker.publish(QUEUE, format!("order-{id}")).unwrap();
        let txn = c.begin(None).unwrap();
        c.enlist(&txn, conn.clone()).unwrap();
        c.enlist(&txn, session.clone()).unwrap();
        assert_eq!(drain_into_ledger_open(&conn, &session), 1);
        c.commit(&txn).unwrap();
    }

    assert_eq!(fixture.ledger().len(), 5);
    let metrics = c.metrics();
    assert_eq!(metrics.total_started, 5);
    assert_eq!(metrics.total_committed, 5);
    assert_eq!(metrics.commit_rate, 1.0);
    assert!(c.wait_for_idle(Duration::from_millis(100)));
}

/// Like `drain_into_ledger` without the privacy check, for ledgers that
/// already hold committed rows
fn drain_into_ledger_open(conn: &DbConnection, session: &QueueSession) -> usize {
    let mut moved = 0;
    while let Some(message) = session.receive(QUEUE, Duration::from_millis(20)).unwrap() {
        let id = message.body.trim_start_matches("order-").parse::<i64>().unwrap();
        conn.execute(Statement::insert(LEDGER, ledger_row(id, &message.body)))
            .unwrap();
        moved += 1;
    }
    moved
}
