//! Two-phase-commit coordinator for xact
//!
//! This crate tracks global transactions and drives them to a decision:
//! - TransactionCoordinator: begin/enlist/commit/rollback, metrics, shutdown
//! - Transaction: caller-side handle with a lock-free status read
//! - Protocol: one-phase and two-phase commit, rollback, heuristic reporting
//! - Sweeper: background rollback of expired transactions
//! - Config: `xact.toml` loading and validation
//!
//! Resource managers plug in through `xact_core::ResourceAdapter`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod context;
pub mod coordinator;
mod protocol;
mod registry;
mod sweeper;
pub mod transaction;

pub use config::{CoordinatorConfig, CONFIG_FILE_NAME};
pub use coordinator::{OutcomeRecord, SweepStats, TransactionCoordinator, TransactionMetrics};
pub use transaction::Transaction;
