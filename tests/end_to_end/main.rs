//! End-to-end tests: coordinator driving the in-memory database and broker
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test end_to_end
//! ```

#[path = "../common/mod.rs"]
mod common;

mod failure;
mod lifecycle;
mod transfer;
