//! Core types and traits for xact
//!
//! This crate defines the foundational types used throughout the system:
//! - TransactionId / ResourceId: Identifiers for transactions and resources
//! - Status / Vote / Capability: Protocol vocabulary
//! - Error: `XactError` taxonomy, `AdapterError`, heuristic reports
//! - Traits: `ResourceAdapter`, the contract every resource manager implements
//! - Clock: time source for transaction deadlines

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{
    AdapterError, EnlistmentFailure, HeuristicKind, HeuristicReport, ResourceOutcome, Result,
    RollbackCause, XactError,
};
pub use traits::{AdapterResult, ResourceAdapter};
pub use types::{Capability, ResourceId, Status, TransactionId, Vote};
