// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the DBaaS operator
//!
//! These run whole reconciliation passes against in-memory fakes of the
//! Kubernetes API:
//! - DatabaseCluster passes through the CloudNativePG delegate
//! - OpsRequest dispatch, progress polling and TTL
//! - Delegate factory resolution

#[path = "../common/mod.rs"]
mod common;

mod delegate_factory;
mod ops_passes;
