//! Tree Stores: `TreeStore` is the capability the Cache Manager drives,
//! implemented once per backend (`local`, `remote`).

pub mod local;
pub mod remote;
pub mod rules;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{DeviceUid, DirectoryStats, Node, NodeIdentifier, Uid};
use crate::error::{Classify, ErrorClass};

#[derive(Debug, Error)]
pub enum TreeStoreError {
	#[error("i/o error walking {path}: {source}")]
	Walk {
		path: std::path::PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("node not found for uid {0}")]
	NodeNotFound(Uid),
	#[error("node not found for domain id {0}")]
	DomainIdNotFound(String),
	#[error(transparent)]
	Db(#[from] crate::db::DbError),
	#[error(transparent)]
	Mapper(#[from] crate::identity::MapperError),
	#[error(transparent)]
	Rule(#[from] rules::RuleError),
	#[error("{0} does not support this operation")]
	Unsupported(&'static str),
	#[error("failed to start filesystem watcher on {path}: {source}")]
	WatchSpawn {
		path: std::path::PathBuf,
		#[source]
		source: notify::Error,
	},
}

impl Classify for TreeStoreError {
	fn class(&self) -> ErrorClass {
		match self {
			Self::Walk { .. } => ErrorClass::Transient,
			Self::NodeNotFound(_) | Self::DomainIdNotFound(_) => ErrorClass::NotFound,
			Self::Unsupported(_) => ErrorClass::Invariant,
			Self::Db(e) => e.class(),
			Self::Mapper(e) => e.class(),
			Self::Rule(_) => ErrorClass::Permanent,
			Self::WatchSpawn { .. } => ErrorClass::Permanent,
		}
	}
}

/// A read-only point-in-time view of a subtree, handed to the Diff Engine.
/// Produced by `get_all_files_and_dirs_for_subtree`.
#[derive(Debug, Clone)]
pub struct SubtreeSnapshot {
	pub root: NodeIdentifier,
	pub files: Vec<Node>,
	pub dirs: Vec<Node>,
}

/// Filter applied when listing a node's children; `None` lists everything.
#[derive(Debug, Clone, Default)]
pub struct ChildFilter {
	pub files_only: bool,
	pub dirs_only: bool,
	pub include_trashed: bool,
}

#[async_trait]
pub trait TreeStore: Send + Sync {
	async fn load_subtree(&self, root: &NodeIdentifier) -> Result<(), TreeStoreError>;
	async fn refresh_subtree(&self, root: &NodeIdentifier) -> Result<(), TreeStoreError>;

	async fn get_node_for_uid(&self, uid: Uid) -> Result<Option<Node>, TreeStoreError>;
	async fn get_child_list(
		&self,
		node: &Node,
		filter: &ChildFilter,
	) -> Result<Vec<Node>, TreeStoreError>;
	async fn get_parent_list(&self, node: &Node) -> Result<Vec<Node>, TreeStoreError>;

	async fn upsert_single_node(&self, node: Node) -> Result<(), TreeStoreError>;
	async fn update_single_node(&self, node: Node) -> Result<(), TreeStoreError>;
	async fn remove_single_node(&self, node: &Node, to_trash: bool) -> Result<(), TreeStoreError>;
	async fn remove_subtree(&self, root: &Node, to_trash: bool) -> Result<(), TreeStoreError>;

	async fn generate_dir_stats(
		&self,
		root: &NodeIdentifier,
	) -> Result<HashMap<Uid, DirectoryStats>, TreeStoreError>;
	async fn get_all_files_and_dirs_for_subtree(
		&self,
		root: &NodeIdentifier,
	) -> Result<SubtreeSnapshot, TreeStoreError>;

	async fn get_node_for_domain_id(&self, domain_id: &str) -> Result<Node, TreeStoreError>;
	async fn get_uid_for_domain_id(
		&self,
		domain_id: &str,
		suggestion: Option<Uid>,
	) -> Result<Uid, TreeStoreError>;

	fn device_uid(&self) -> DeviceUid;

	/// Batch entry point for remote change notifications. Only
	/// `RemoteTreeStore` implements this; a local backend has no
	/// change-feed to reconcile.
	async fn apply_remote_changes(&self, _changes: Vec<crate::tree_store::remote::RemoteChange>) -> Result<(), TreeStoreError> {
		Err(TreeStoreError::Unsupported("apply_remote_changes"))
	}
}
