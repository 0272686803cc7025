//! In-memory reference resource managers for xact
//!
//! Two resource managers that implement `xact_core::ResourceAdapter`, so the
//! commit protocol can be exercised end to end without external services:
//! - Database: tables keyed by primary key, statements staged per transaction
//! - Queue: named message queues with transactional send and receive
//!
//! Both keep everything in process memory. Nothing survives a restart.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod database;
pub mod queue;

pub use database::{DatabaseError, DbConnection, InMemoryDatabase, QueryResult, Row, Statement};
pub use queue::{InMemoryBroker, Message, QueueError, QueueSession};
