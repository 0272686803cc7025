//! Shared test utilities for the root integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's
//! main.rs.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::{Arc, Once};
pub use xact::{
    CoordinatorConfig, DatabaseError, DbConnection, InMemoryBroker, InMemoryDatabase, Message,
    QueueError, QueueSession, ResourceAdapter, RollbackCause, Statement, Status,
    TransactionCoordinator, XactError,
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

/// Queue the transfer scenarios consume from
pub const QUEUE: &str = "transfers";

/// Table the transfer scenarios write to
pub const LEDGER: &str = "ledger";

// ============================================================================
// Fixture - coordinator plus one database and one broker
// ============================================================================

pub struct Fixture {
    pub coordinator: Arc<TransactionCoordinator>,
    pub db: InMemoryDatabase,
    pub broker: InMemoryBroker,
}

impl Fixture {
    /// Default config, sweeper running, `ledger(id, body)` and `transfers`
    /// declared
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        init_tracing();
        let coordinator = Arc::new(TransactionCoordinator::new(config).unwrap());
        coordinator.start().unwrap();

        let db = InMemoryDatabase::new("bank");
        let setup = db.open_connection();
        setup
            .execute(Statement::drop_table_if_exists(LEDGER))
            .unwrap();
        setup
            .execute(Statement::create_table(LEDGER, &["id", "body"]))
            .unwrap();

        let broker = InMemoryBroker::new("mq");
        broker.declare_queue(QUEUE);

        Self {
            coordinator,
            db,
            broker,
        }
    }

    pub fn connection(&self) -> Arc<DbConnection> {
        Arc::new(self.db.open_connection())
    }

    pub fn session(&self) -> Arc<QueueSession> {
        Arc::new(self.broker.open_session())
    }

    /// Committed ledger rows as `(id, body)`
    pub fn ledger(&self) -> Vec<(i64, String)> {
        self.db
            .open_connection()
            .execute(Statement::select_all(LEDGER))
            .unwrap()
            .rows()
            .iter()
            .map(|row| {
                (
                    row[0].as_i64().unwrap(),
                    row[1].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    pub fn queued(&self) -> Vec<Message> {
        self.broker.peek_all(QUEUE)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.coordinator.shutdown(std::time::Duration::from_secs(1));
    }
}

/// Ledger row for `id`
pub fn ledger_row(id: i64, body: &str) -> Vec<Value> {
    vec![json!(id), json!(body)]
}
