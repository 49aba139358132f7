//! SeaORM entity models — the on-disk projection of `domain::*`, one module
//! per relational store.

pub mod archived_op;
pub mod cache_registry;
pub mod local_node;
pub mod pending_op;
pub mod remote_node;
pub mod remote_parent;
pub mod uid_cloud_id_mapping;
pub mod uid_path_mapping;
