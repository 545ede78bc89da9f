// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    dead_code
)]

//! Common test utilities shared across test targets
//!
//! Fixtures build DatabaseCluster and OpsRequest records; the fakes stand in
//! for the Kubernetes API so that whole reconciliation passes can run in
//! memory.
//!
//! # Usage
//!
//! ```rust,ignore
//! #[path = "../common/mod.rs"]
//! mod common;
//! use common::*;
//! ```

mod fakes;
mod fixtures;

pub use fakes::*;
pub use fixtures::*;
