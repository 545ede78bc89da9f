mod backup_storage;
mod common;
mod database_cluster;
mod database_engine;
mod ops_request;

pub use backup_storage::*;
pub use common::*;
pub use database_cluster::*;
pub use database_engine::*;
pub use ops_request::*;
