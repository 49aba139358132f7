//! Data model: the entities and invariants making up a synced node.
//!
//! These are plain Rust types — the source of truth for a node in memory.
//! The `db::entities` module defines their on-disk projection; writes always
//! flow domain -> entity (write-through), never the other way, matching the
//! invariant that the disk row is equal to or an older snapshot of the
//! memory row.

mod cache_info;
pub mod identifier;
pub mod node;
mod op;
mod stats;

pub use cache_info::CacheInfoEntry;
pub use identifier::{DeviceUid, Guid, NodeIdentifier, Uid, NULL_UID, ROOT_UID};
pub use node::{Container, Ephemeral, LocalDir, LocalFile, Node, RemoteDir, RemoteFile, Signature};
pub use op::{OpStatus, OpType, UserOp};
pub use stats::DirectoryStats;
