//! xact - in-process two-phase-commit transaction coordinator
//!
//! xact coordinates one global transaction across several resource managers
//! (a database connection, a message-queue session, ...) so that their work
//! commits or rolls back as a unit.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use xact::{CoordinatorConfig, InMemoryBroker, InMemoryDatabase, Statement, TransactionCoordinator};
//!
//! let coordinator = TransactionCoordinator::new(CoordinatorConfig::default())?;
//! coordinator.start()?;
//!
//! let db = InMemoryDatabase::new("orders");
//! let conn = Arc::new(db.open_connection());
//!
//! let txn = coordinator.begin(None)?;
//! coordinator.enlist(&txn, conn.clone())?;
//! conn.execute(Statement::insert("orders", vec![1.into(), "widget".into()]))?;
//! coordinator.commit(&txn)?;
//! ```
//!
//! # Architecture
//!
//! - `xact-core`: identifiers, status vocabulary, errors, `ResourceAdapter`
//! - `xact-coordinator`: transaction registry, commit protocol, sweeper
//! - `xact-adapters`: in-memory reference database and message broker

pub use xact_adapters::*;
pub use xact_coordinator::*;
pub use xact_core::*;
