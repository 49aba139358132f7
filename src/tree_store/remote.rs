//! `RemoteTreeStore` — mirrors a cloud-drive namespace via a narrow
//! `RemoteDriveClient` capability. The actual network transport is out of
//! scope here; this module defines the trait boundary and a
//! `NullRemoteDriveClient` test double.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, Set};
use tokio::sync::RwLock;
use tracing::instrument;

use crate::db::entities::{remote_node, remote_parent};
use crate::db::Database;
use crate::domain::node::RemoteDir;
use crate::domain::{DeviceUid, DirectoryStats, Node, NodeIdentifier, RemoteFile, Uid};
use crate::events::{Event, EventBus};
use crate::identity::CloudIdMapper;
use crate::uid::UidAllocator;

use super::{ChildFilter, SubtreeSnapshot, TreeStore, TreeStoreError};

/// One page of remote changes, applied monotonically by `change_ts`.
#[derive(Debug, Clone)]
pub struct RemoteChange {
	pub cloud_id: String,
	pub parent_cloud_ids: Vec<String>,
	pub is_dir: bool,
	pub is_removed: bool,
	pub change_ts: i64,
	pub size: u64,
	pub mtime_ms: i64,
	pub ctime_ms: i64,
	pub md5: Option<String>,
	pub owner: Option<String>,
	pub version: u64,
	pub head_revision: Option<String>,
	pub my_drive: bool,
	pub shared: bool,
}

#[async_trait]
pub trait RemoteDriveClient: Send + Sync {
	/// Lists the next page of changes since `since_ts` (0 means "unknown").
	async fn list_changes(&self, since_ts: i64) -> Result<Vec<RemoteChange>, TreeStoreError>;
}

/// A `RemoteDriveClient` with no remote backend — always reports no
/// changes. Used in tests and as the default when no cloud account is
/// configured.
pub struct NullRemoteDriveClient;

#[async_trait]
impl RemoteDriveClient for NullRemoteDriveClient {
	async fn list_changes(&self, _since_ts: i64) -> Result<Vec<RemoteChange>, TreeStoreError> {
		Ok(Vec::new())
	}
}

pub struct RemoteTreeStore {
	device_uid: DeviceUid,
	db: Arc<Database>,
	uid_alloc: Arc<UidAllocator>,
	cloud_mapper: Arc<CloudIdMapper>,
	events: Arc<EventBus>,
	client: Arc<dyn RemoteDriveClient>,
	nodes: RwLock<HashMap<Uid, Node>>,
	last_change_ts: RwLock<i64>,
}

impl RemoteTreeStore {
	pub fn new(
		device_uid: DeviceUid,
		db: Arc<Database>,
		uid_alloc: Arc<UidAllocator>,
		cloud_mapper: Arc<CloudIdMapper>,
		events: Arc<EventBus>,
		client: Arc<dyn RemoteDriveClient>,
	) -> Self {
		Self {
			device_uid,
			db,
			uid_alloc,
			cloud_mapper,
			events,
			client,
			nodes: RwLock::new(HashMap::new()),
			last_change_ts: RwLock::new(0),
		}
	}

	#[instrument(skip(self))]
	pub async fn apply_changes(&self, changes: Vec<RemoteChange>) -> Result<(), TreeStoreError> {
		let mut ordered = changes;
		ordered.sort_by_key(|c| c.change_ts);

		for change in ordered {
			if change.change_ts != 0 {
				let mut last = self.last_change_ts.write().await;
				if change.change_ts < *last {
					continue;
				}
				*last = change.change_ts;
			}

			let existing_uid = self.cloud_mapper.get(&change.cloud_id).await?;

			if change.is_removed {
				if let Some(uid) = existing_uid {
					self.nodes.write().await.remove(&uid);
					remote_node::Entity::delete_by_id(uid as i64)
						.exec(self.db.conn())
						.await
						.map_err(crate::db::DbError::from)?;
					self.events.emit(Event::NodeRemovedFromCache {
						device_uid: self.device_uid,
						uid,
					});
				}
				continue;
			}

			let uid = match existing_uid {
				Some(uid) => uid,
				None => {
					let fresh = self
						.uid_alloc
						.next()
						.await
						.map_err(|e| TreeStoreError::Walk {
							path: std::path::PathBuf::from(&change.cloud_id),
							source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
						})?;
					self.cloud_mapper.get_or_insert(&change.cloud_id, fresh, self.device_uid).await?
				}
			};

			let identifier = NodeIdentifier {
				device_uid: self.device_uid,
				uid,
				paths: Vec::new(),
			};

			let node = if change.is_dir {
				Node::RemoteDir(RemoteDir {
					identifier,
					cloud_id: change.cloud_id.clone(),
					my_drive: change.my_drive,
					shared: change.shared,
					trashed: false,
					children_complete: false,
				})
			} else {
				Node::RemoteFile(RemoteFile {
					identifier,
					cloud_id: change.cloud_id.clone(),
					size: change.size,
					mtime_ms: change.mtime_ms,
					ctime_ms: change.ctime_ms,
					md5: change.md5.clone(),
					owner: change.owner.clone(),
					version: change.version,
					head_revision: change.head_revision.clone(),
					shared: change.shared,
					trashed: false,
				})
			};

			self.persist_node(&node, uid).await?;
			self.nodes.write().await.insert(uid, node);

			for parent_cloud_id in &change.parent_cloud_ids {
				if let Some(parent_uid) = self.cloud_mapper.get(parent_cloud_id).await? {
					self.upsert_parent_edge(uid, parent_uid).await?;
				}
			}

			self.events.emit(Event::NodeUpsertedInCache {
				device_uid: self.device_uid,
				uid,
				path: None,
			});
		}
		Ok(())
	}

	async fn persist_node(&self, node: &Node, uid: Uid) -> Result<(), TreeStoreError> {
		let existing = remote_node::Entity::find_by_id(uid as i64).one(self.db.conn()).await?;
		let mut am = match existing {
			Some(model) => model.into_active_model(),
			None => remote_node::ActiveModel {
				uid: Set(uid as i64),
				..Default::default()
			},
		};
		am.device_uid = Set(self.device_uid as i64);
		am.is_dir = Set(node.is_dir());
		am.size = Set(node.size() as i64);
		am.mtime_ms = Set(node.mtime_ms().unwrap_or(0));
		match node {
			Node::RemoteFile(f) => {
				am.cloud_id = Set(f.cloud_id.clone());
				am.ctime_ms = Set(f.ctime_ms);
				am.md5 = Set(f.md5.clone());
				am.owner = Set(f.owner.clone());
				am.version = Set(f.version as i64);
				am.head_revision = Set(f.head_revision.clone());
				am.my_drive = Set(false);
				am.shared = Set(f.shared);
				am.trashed = Set(f.trashed);
				am.children_complete = Set(false);
			}
			Node::RemoteDir(d) => {
				am.cloud_id = Set(d.cloud_id.clone());
				am.ctime_ms = Set(0);
				am.version = Set(0);
				am.my_drive = Set(d.my_drive);
				am.shared = Set(d.shared);
				am.trashed = Set(d.trashed);
				am.children_complete = Set(d.children_complete);
			}
			_ => {}
		}
		am.save(self.db.conn()).await.map_err(crate::db::DbError::from)?;
		Ok(())
	}

	async fn upsert_parent_edge(&self, child_uid: Uid, parent_uid: Uid) -> Result<(), TreeStoreError> {
		let already_present = remote_parent::Entity::find()
			.filter(remote_parent::Column::ChildUid.eq(child_uid as i64))
			.filter(remote_parent::Column::ParentUid.eq(parent_uid as i64))
			.one(self.db.conn())
			.await?
			.is_some();
		if already_present {
			return Ok(());
		}
		let am = remote_parent::ActiveModel {
			child_uid: Set(child_uid as i64),
			parent_uid: Set(parent_uid as i64),
			..Default::default()
		};
		am.insert(self.db.conn()).await.map_err(crate::db::DbError::from)?;
		Ok(())
	}
}

#[async_trait]
impl TreeStore for RemoteTreeStore {
	async fn load_subtree(&self, _root: &NodeIdentifier) -> Result<(), TreeStoreError> {
		let since = *self.last_change_ts.read().await;
		let changes = self.client.list_changes(since).await?;
		self.apply_changes(changes).await
	}

	async fn refresh_subtree(&self, root: &NodeIdentifier) -> Result<(), TreeStoreError> {
		self.load_subtree(root).await
	}

	async fn get_node_for_uid(&self, uid: Uid) -> Result<Option<Node>, TreeStoreError> {
		Ok(self.nodes.read().await.get(&uid).cloned())
	}

	async fn get_child_list(
		&self,
		node: &Node,
		filter: &ChildFilter,
	) -> Result<Vec<Node>, TreeStoreError> {
		let Some(parent_uid) = node.uid() else { return Ok(Vec::new()) };
		let edges = remote_parent::Entity::find()
			.filter(remote_parent::Column::ParentUid.eq(parent_uid as i64))
			.all(self.db.conn())
			.await?;
		let nodes = self.nodes.read().await;
		Ok(edges
			.into_iter()
			.filter_map(|edge| nodes.get(&(edge.child_uid as Uid)).cloned())
			.filter(|n| {
				(!filter.files_only || n.is_file())
					&& (!filter.dirs_only || n.is_dir())
					&& (filter.include_trashed || !n.is_trashed())
			})
			.collect())
	}

	async fn get_parent_list(&self, node: &Node) -> Result<Vec<Node>, TreeStoreError> {
		let Some(child_uid) = node.uid() else { return Ok(Vec::new()) };
		let edges = remote_parent::Entity::find()
			.filter(remote_parent::Column::ChildUid.eq(child_uid as i64))
			.all(self.db.conn())
			.await?;
		let nodes = self.nodes.read().await;
		Ok(edges
			.into_iter()
			.filter_map(|edge| nodes.get(&(edge.parent_uid as Uid)).cloned())
			.collect())
	}

	async fn upsert_single_node(&self, node: Node) -> Result<(), TreeStoreError> {
		let uid = node.uid().expect("remote nodes are always addressable");
		self.persist_node(&node, uid).await?;
		self.nodes.write().await.insert(uid, node);
		self.events.emit(Event::NodeUpsertedInCache {
			device_uid: self.device_uid,
			uid,
			path: None,
		});
		Ok(())
	}

	async fn update_single_node(&self, node: Node) -> Result<(), TreeStoreError> {
		self.upsert_single_node(node).await
	}

	async fn remove_single_node(&self, node: &Node, to_trash: bool) -> Result<(), TreeStoreError> {
		let Some(uid) = node.uid() else { return Ok(()) };
		if to_trash {
			let mut trashed = node.clone();
			match &mut trashed {
				Node::RemoteFile(f) => f.trashed = true,
				Node::RemoteDir(d) => d.trashed = true,
				_ => {}
			}
			self.upsert_single_node(trashed).await
		} else {
			self.nodes.write().await.remove(&uid);
			remote_node::Entity::delete_by_id(uid as i64)
				.exec(self.db.conn())
				.await
				.map_err(crate::db::DbError::from)?;
			self.events.emit(Event::NodeRemovedFromCache {
				device_uid: self.device_uid,
				uid,
			});
			Ok(())
		}
	}

	async fn remove_subtree(&self, root: &Node, to_trash: bool) -> Result<(), TreeStoreError> {
		let children = self.get_child_list(root, &ChildFilter::default()).await?;
		for child in &children {
			if child.is_dir() {
				self.remove_subtree(child, to_trash).await?;
			} else {
				self.remove_single_node(child, to_trash).await?;
			}
		}
		self.remove_single_node(root, to_trash).await
	}

	async fn generate_dir_stats(
		&self,
		root: &NodeIdentifier,
	) -> Result<HashMap<Uid, DirectoryStats>, TreeStoreError> {
		// Remote backends report size/child counts authoritatively; no
		// bottom-up aggregation is needed the way the local walker needs.
		let _ = root;
		Ok(HashMap::new())
	}

	async fn get_all_files_and_dirs_for_subtree(
		&self,
		root: &NodeIdentifier,
	) -> Result<SubtreeSnapshot, TreeStoreError> {
		let nodes = self.nodes.read().await;
		let mut files = Vec::new();
		let mut dirs = Vec::new();
		for node in nodes.values() {
			if node.is_file() {
				files.push(node.clone());
			} else if node.is_dir() {
				dirs.push(node.clone());
			}
		}
		Ok(SubtreeSnapshot {
			root: root.clone(),
			files,
			dirs,
		})
	}

	async fn get_node_for_domain_id(&self, domain_id: &str) -> Result<Node, TreeStoreError> {
		let uid = self
			.cloud_mapper
			.get(domain_id)
			.await?
			.ok_or_else(|| TreeStoreError::DomainIdNotFound(domain_id.to_string()))?;
		self.get_node_for_uid(uid)
			.await?
			.ok_or(TreeStoreError::NodeNotFound(uid))
	}

	async fn get_uid_for_domain_id(
		&self,
		domain_id: &str,
		suggestion: Option<Uid>,
	) -> Result<Uid, TreeStoreError> {
		Ok(self
			.cloud_mapper
			.get_or_insert(domain_id, suggestion.unwrap_or(0), self.device_uid)
			.await?)
	}

	fn device_uid(&self) -> DeviceUid {
		self.device_uid
	}

	async fn apply_remote_changes(&self, changes: Vec<RemoteChange>) -> Result<(), TreeStoreError> {
		self.apply_changes(changes).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConfigStore;
	use tempfile::tempdir;

	const DEVICE: DeviceUid = 2;

	fn change(cloud_id: &str, is_dir: bool, change_ts: i64, parents: &[&str]) -> RemoteChange {
		RemoteChange {
			cloud_id: cloud_id.to_string(),
			parent_cloud_ids: parents.iter().map(|p| p.to_string()).collect(),
			is_dir,
			is_removed: false,
			change_ts,
			size: if is_dir { 0 } else { 42 },
			mtime_ms: 0,
			ctime_ms: 0,
			md5: if is_dir { None } else { Some("abc123".to_string()) },
			owner: None,
			version: 1,
			head_revision: None,
			my_drive: true,
			shared: false,
		}
	}

	async fn harness() -> (RemoteTreeStore, tempfile::TempDir) {
		let dir = tempdir().unwrap();
		let db = Arc::new(Database::create(&dir.path().join("coresync.db")).await.unwrap());
		db.migrate().await.unwrap();
		let events = Arc::new(EventBus::default());
		let cloud_mapper = Arc::new(CloudIdMapper::load(db.clone()).await.unwrap());
		let config = Arc::new(ConfigStore::load_or_create(&dir.path().join("config")).await.unwrap());
		let uid_alloc = Arc::new(UidAllocator::load(config).await.unwrap());
		let store = RemoteTreeStore::new(DEVICE, db, uid_alloc, cloud_mapper, events, Arc::new(NullRemoteDriveClient));
		(store, dir)
	}

	#[tokio::test]
	async fn apply_changes_allocates_a_uid_on_first_sight() {
		let (store, _dir) = harness().await;
		store.apply_changes(vec![change("file-1", false, 1, &[])]).await.unwrap();

		let uid = store.cloud_mapper.get("file-1").await.unwrap().unwrap();
		let node = store.get_node_for_uid(uid).await.unwrap().unwrap();
		assert_eq!(node.md5(), Some("abc123"));
	}

	#[tokio::test]
	async fn apply_changes_wires_a_multi_parent_edge() {
		let (store, _dir) = harness().await;
		store
			.apply_changes(vec![change("dir-a", true, 1, &[]), change("dir-b", true, 2, &[])])
			.await
			.unwrap();
		store.apply_changes(vec![change("shared-file", false, 3, &["dir-a", "dir-b"])]).await.unwrap();

		let dir_a_uid = store.cloud_mapper.get("dir-a").await.unwrap().unwrap();
		let dir_b_uid = store.cloud_mapper.get("dir-b").await.unwrap().unwrap();
		let file_uid = store.cloud_mapper.get("shared-file").await.unwrap().unwrap();

		let file_node = store.get_node_for_uid(file_uid).await.unwrap().unwrap();
		let parents = store.get_parent_list(&file_node).await.unwrap();
		let parent_uids: Vec<Uid> = parents.iter().filter_map(|n| n.uid()).collect();
		assert!(parent_uids.contains(&dir_a_uid));
		assert!(parent_uids.contains(&dir_b_uid));
	}

	#[tokio::test]
	async fn a_removed_change_deletes_the_node_from_the_cache() {
		let (store, _dir) = harness().await;
		store.apply_changes(vec![change("file-1", false, 1, &[])]).await.unwrap();
		let uid = store.cloud_mapper.get("file-1").await.unwrap().unwrap();

		let mut removal = change("file-1", false, 2, &[]);
		removal.is_removed = true;
		store.apply_changes(vec![removal]).await.unwrap();

		assert!(store.get_node_for_uid(uid).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn older_changes_are_ignored_once_a_newer_change_ts_has_been_seen() {
		let (store, _dir) = harness().await;
		store.apply_changes(vec![change("file-1", false, 10, &[])]).await.unwrap();
		let uid = store.cloud_mapper.get("file-1").await.unwrap().unwrap();

		let mut stale = change("file-1", false, 5, &[]);
		stale.md5 = Some("stale-hash".to_string());
		store.apply_changes(vec![stale]).await.unwrap();

		let node = store.get_node_for_uid(uid).await.unwrap().unwrap();
		assert_eq!(node.md5(), Some("abc123"), "a change older than the last-seen change_ts must not apply");
	}

	#[tokio::test]
	async fn out_of_order_batch_is_applied_in_change_ts_order() {
		let (store, _dir) = harness().await;
		// handed to apply_changes out of order; it must sort by change_ts
		// before applying so the later write wins.
		let mut newer = change("file-1", false, 2, &[]);
		newer.md5 = Some("second".to_string());
		let older = change("file-1", false, 1, &[]);
		store.apply_changes(vec![newer, older]).await.unwrap();

		let uid = store.cloud_mapper.get("file-1").await.unwrap().unwrap();
		let node = store.get_node_for_uid(uid).await.unwrap().unwrap();
		assert_eq!(node.md5(), Some("second"));
	}
}
