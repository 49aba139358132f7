//! Cache Manager: the process-wide coordinator that owns the `TreeStore`
//! set keyed by `DeviceUID`, the identifier mappers, and the
//! active-display-tree registry UI code subscribes against.
//!
//! One struct holding every long-lived collaborator, constructed once at
//! startup, with an idempotent `start`/`shutdown` pair. Constructed
//! explicitly and handed to callers — no ambient global singleton.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

use crate::db::entities::cache_registry;
use crate::db::Database;
use crate::domain::{CacheInfoEntry, DeviceUid, DirectoryStats, Node, NodeIdentifier, Uid, UserOp};
use crate::error::{Classify, ErrorClass};
use crate::identity::{CloudIdMapper, MapperError, PathMapper};
use crate::op_graph::{OpGraph, OpGraphError};
use crate::tree_store::remote::RemoteChange;
use crate::tree_store::{ChildFilter, TreeStore, TreeStoreError};

#[derive(Debug, Error)]
pub enum CacheManagerError {
	#[error(transparent)]
	TreeStore(#[from] TreeStoreError),
	#[error(transparent)]
	Mapper(#[from] MapperError),
	#[error(transparent)]
	OpGraph(#[from] OpGraphError),
	#[error(transparent)]
	Db(#[from] crate::db::DbError),
	#[error("no backend registered for device {0}")]
	UnknownDevice(DeviceUid),
	#[error("display tree {0} not found")]
	UnknownTree(TreeId),
}

impl Classify for CacheManagerError {
	fn class(&self) -> ErrorClass {
		match self {
			Self::TreeStore(e) => e.class(),
			Self::Mapper(e) => e.class(),
			Self::OpGraph(e) => e.class(),
			Self::Db(e) => e.class(),
			Self::UnknownDevice(_) | Self::UnknownTree(_) => ErrorClass::NotFound,
		}
	}
}

/// Opaque handle for a UI-facing display tree subscription.
pub type TreeId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
	NotLoaded,
	Loading,
	CompletelyLoaded,
}

/// Everything the UI layer needs to render one subscribed subtree without
/// re-walking it: load progress, directory aggregates, and local
/// presentation state (which nodes are expanded/selected).
#[derive(Debug, Clone)]
pub struct ActiveDisplayTreeMeta {
	pub root: NodeIdentifier,
	pub load_state: LoadState,
	pub filter: ChildFilter,
	pub dir_stats: HashMap<Uid, DirectoryStats>,
	pub expanded: std::collections::HashSet<Uid>,
	pub selected: std::collections::HashSet<Uid>,
}

impl ActiveDisplayTreeMeta {
	fn new(root: NodeIdentifier) -> Self {
		Self {
			root,
			load_state: LoadState::NotLoaded,
			filter: ChildFilter::default(),
			dir_stats: HashMap::new(),
			expanded: Default::default(),
			selected: Default::default(),
		}
	}
}

/// Process-wide singleton-lifecycle coordinator. One instance per running
/// process; `start`/`shutdown` are idempotent so callers don't need to track
/// whether a previous caller already brought it up.
pub struct CacheManager {
	db: Arc<Database>,
	stores: HashMap<DeviceUid, Arc<dyn TreeStore>>,
	local_device_uid: DeviceUid,
	path_mapper: Arc<PathMapper>,
	cloud_mapper: Arc<CloudIdMapper>,
	op_graph: Arc<OpGraph>,
	display_trees: RwLock<HashMap<TreeId, ActiveDisplayTreeMeta>>,
	started: RwLock<bool>,
}

impl CacheManager {
	pub fn new(
		db: Arc<Database>,
		local_device_uid: DeviceUid,
		stores: Vec<Arc<dyn TreeStore>>,
		path_mapper: Arc<PathMapper>,
		cloud_mapper: Arc<CloudIdMapper>,
		op_graph: Arc<OpGraph>,
	) -> Self {
		let stores = stores.into_iter().map(|s| (s.device_uid(), s)).collect();
		Self {
			db,
			stores,
			local_device_uid,
			path_mapper,
			cloud_mapper,
			op_graph,
			display_trees: RwLock::new(HashMap::new()),
			started: RwLock::new(false),
		}
	}

	fn store_for(&self, device_uid: DeviceUid) -> Result<&Arc<dyn TreeStore>, CacheManagerError> {
		self.stores.get(&device_uid).ok_or(CacheManagerError::UnknownDevice(device_uid))
	}

	/// Idempotent: a second call while already started is a no-op. Loads
	/// any `pending_ops` left over from a previous run back into the graph
	/// so interrupted work resumes instead of being silently dropped.
	#[instrument(skip(self))]
	pub async fn start(&self) -> Result<(), CacheManagerError> {
		let mut started = self.started.write().await;
		if *started {
			return Ok(());
		}
		self.op_graph.load_pending().await?;
		*started = true;
		Ok(())
	}

	/// Idempotent: clears the display-tree registry and marks the manager
	/// stopped. The underlying tree stores and op graph are left intact —
	/// shutdown ends UI subscriptions, not the persisted state they read.
	pub async fn shutdown(&self) -> Result<(), CacheManagerError> {
		let mut started = self.started.write().await;
		if !*started {
			return Ok(());
		}
		self.display_trees.write().await.clear();
		*started = false;
		Ok(())
	}

	/// Resolves `path` to its stable UID, minting one via `suggestion` (or
	/// a fresh allocation upstream) on first sight.
	pub async fn get_uid_for_local_path(&self, path: &Path, suggestion: Uid) -> Result<Uid, CacheManagerError> {
		Ok(self
			.path_mapper
			.get_or_insert(path, suggestion, self.local_device_uid)
			.await?)
	}

	/// Pure cache read: resolves `path` through the mapper, then serves
	/// whatever the named backend's in-memory tree already holds. Never
	/// triggers a walk.
	pub async fn read_single_node_from_disk_for_path(
		&self,
		path: &Path,
		device_uid: DeviceUid,
	) -> Result<Option<Node>, CacheManagerError> {
		let Some(uid) = self.path_mapper.get(path).await? else {
			return Ok(None);
		};
		Ok(self.store_for(device_uid)?.get_node_for_uid(uid).await?)
	}

	/// Registers a new UI-facing subscription against `root`, not-yet-loaded.
	pub async fn create_display_tree(&self, root: NodeIdentifier) -> TreeId {
		let tree_id = Uuid::new_v4();
		self.display_trees
			.write().await
			.insert(tree_id, ActiveDisplayTreeMeta::new(root));
		tree_id
	}

	/// Walks (or re-walks) the subtree behind `tree_id`, then recomputes its
	/// directory aggregates. A concurrent caller that asks for the same
	/// already-`Loading` tree gets an immediate `Ok` rather than a second
	/// walk — the registry exists precisely so this doesn't happen twice.
	#[instrument(skip(self))]
	pub async fn start_subtree_load(&self, tree_id: TreeId) -> Result<(), CacheManagerError> {
		let root = {
			let mut trees = self.display_trees.write().await;
			let meta = trees.get_mut(&tree_id).ok_or(CacheManagerError::UnknownTree(tree_id))?;
			if meta.load_state == LoadState::Loading {
				return Ok(());
			}
			meta.load_state = LoadState::Loading;
			meta.root.clone()
		};

		let store = self.store_for(root.device_uid)?;
		let result = async {
			store.load_subtree(&root).await?;
			// The walk is addressed by path and mints its own UID the first
			// time it sees this root; `root.uid` may still be the
			// placeholder the caller constructed `create_display_tree`
			// with, so re-resolve it before asking for stats keyed by UID.
			let resolved_uid = match root.spid_path() {
				Some(path) => store.get_uid_for_domain_id(&path.to_string_lossy(), None).await?,
				None => root.uid,
			};
			let resolved = NodeIdentifier {
				uid: resolved_uid,
				..root.clone()
			};
			let dir_stats = store.generate_dir_stats(&resolved).await?;
			Ok::<_, TreeStoreError>((resolved, dir_stats))
		}
		.await;

		let mut trees = self.display_trees.write().await;
		let meta = trees.get_mut(&tree_id).ok_or(CacheManagerError::UnknownTree(tree_id))?;
		let (resolved_root, dir_stats) = match result {
			Ok(pair) => pair,
			Err(e) => {
				// Leave it retriable rather than stuck claiming a load is
				// still in flight.
				meta.load_state = LoadState::NotLoaded;
				return Err(e.into());
			}
		};
		meta.root = resolved_root.clone();
		meta.dir_stats = dir_stats;
		meta.load_state = LoadState::CompletelyLoaded;
		drop(trees);

		self.record_cache_registry(&resolved_root).await?;
		Ok(())
	}

	async fn record_cache_registry(&self, root: &NodeIdentifier) -> Result<(), CacheManagerError> {
		let entry = CacheInfoEntry {
			cache_location: self.db.path().to_path_buf(),
			subtree_root_identifier: root.clone(),
			last_sync_ts: Utc::now(),
			is_complete: true,
		};
		let existing = cache_registry::Entity::find()
			.filter(cache_registry::Column::DeviceUid.eq(root.device_uid as i64))
			.filter(cache_registry::Column::SubtreeRootUid.eq(root.uid as i64))
			.one(self.db.conn())
			.await
			.map_err(crate::db::DbError::from)?;
		if let Some(existing) = existing {
			let mut am: cache_registry::ActiveModel = existing.into();
			am.last_sync_ts = Set(entry.last_sync_ts);
			am.is_complete = Set(entry.is_complete);
			am.update(self.db.conn()).await.map_err(crate::db::DbError::from)?;
		} else {
			let am = cache_registry::ActiveModel {
				id: sea_orm::ActiveValue::NotSet,
				device_uid: Set(root.device_uid as i64),
				subtree_root_uid: Set(root.uid as i64),
				subtree_root_path: Set(root.spid_path().map(|p| p.to_string_lossy().to_string()).unwrap_or_default()),
				cache_location: Set(entry.cache_location.to_string_lossy().to_string()),
				last_sync_ts: Set(entry.last_sync_ts),
				is_complete: Set(entry.is_complete),
			};
			am.insert(self.db.conn()).await.map_err(crate::db::DbError::from)?;
		}
		Ok(())
	}

	/// Batch entry point for remote change notifications — delegates to
	/// the remote device's tree store, which reconciles and emits events.
	pub async fn apply_remote_changes(
		&self,
		device_uid: DeviceUid,
		changes: Vec<RemoteChange>,
	) -> Result<(), CacheManagerError> {
		self.store_for(device_uid)?.apply_remote_changes(changes).await?;
		Ok(())
	}

	/// Delegates to the Operation Graph: blocks until an executable op is
	/// ready.
	pub async fn get_next_command(&self) -> UserOp {
		self.op_graph.get_next().await
	}

	pub async fn display_tree_meta(&self, tree_id: TreeId) -> Option<ActiveDisplayTreeMeta> {
		self.display_trees.read().await.get(&tree_id).cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConfigStore;
	use crate::events::EventBus;
	use crate::identity::{CloudIdMapper, PathMapper};
	use crate::tree_store::local::LocalTreeStore;
	use crate::tree_store::remote::{NullRemoteDriveClient, RemoteTreeStore};
	use crate::uid::UidAllocator;
	use std::path::PathBuf;
	use tempfile::tempdir;

	const LOCAL_DEVICE: DeviceUid = 1;
	const REMOTE_DEVICE: DeviceUid = 2;

	async fn harness() -> (CacheManager, PathBufRoot) {
		let dir = tempdir().unwrap();
		let db = Arc::new(Database::create(&dir.path().join("coresync.db")).await.unwrap());
		db.migrate().await.unwrap();
		let events = Arc::new(EventBus::default());
		let path_mapper = Arc::new(PathMapper::load(db.clone()).await.unwrap());
		let cloud_mapper = Arc::new(CloudIdMapper::load(db.clone()).await.unwrap());
		let config = Arc::new(ConfigStore::load_or_create(&dir.path().join("config")).await.unwrap());
		let uid_alloc = Arc::new(UidAllocator::load(config).await.unwrap());

		let local_store: Arc<dyn TreeStore> = Arc::new(LocalTreeStore::new(
			LOCAL_DEVICE,
			db.clone(),
			uid_alloc.clone(),
			path_mapper.clone(),
			events.clone(),
		));
		let remote_store: Arc<dyn TreeStore> = Arc::new(RemoteTreeStore::new(
			REMOTE_DEVICE,
			db.clone(),
			uid_alloc,
			cloud_mapper.clone(),
			events,
			Arc::new(NullRemoteDriveClient),
		));

		let root = dir.path().join("root");
		tokio::fs::create_dir_all(&root).await.unwrap();
		let op_graph = Arc::new(OpGraph::new(db.clone()));

		let manager = CacheManager::new(
			db,
			LOCAL_DEVICE,
			vec![local_store, remote_store],
			path_mapper,
			cloud_mapper,
			op_graph,
		);
		(manager, PathBufRoot { root, _dir: dir })
	}

	struct PathBufRoot {
		root: PathBuf,
		_dir: tempfile::TempDir,
	}

	#[tokio::test]
	async fn start_and_shutdown_are_idempotent() {
		let (manager, _root) = harness().await;
		manager.start().await.unwrap();
		manager.start().await.unwrap();
		manager.shutdown().await.unwrap();
		manager.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn display_tree_loads_and_records_dir_stats() {
		let (manager, root) = harness().await;
		tokio::fs::write(root.root.join("a.txt"), b"hi").await.unwrap();

		let root_id = NodeIdentifier::single(LOCAL_DEVICE, 0, root.root.clone());
		let tree_id = manager.create_display_tree(root_id).await;
		manager.start_subtree_load(tree_id).await.unwrap();

		let meta = manager.display_tree_meta(tree_id).await.unwrap();
		assert_eq!(meta.load_state, LoadState::CompletelyLoaded);
		let root_uid = manager.get_uid_for_local_path(&root.root, 0).await.unwrap();
		assert_eq!(meta.dir_stats.get(&root_uid).map(|s| s.file_count), Some(1));
	}

	#[tokio::test]
	async fn get_uid_for_local_path_is_stable_across_calls() {
		let (manager, root) = harness().await;
		let path = root.root.join("x.txt");
		let first = manager.get_uid_for_local_path(&path, 50).await.unwrap();
		let second = manager.get_uid_for_local_path(&path, 999).await.unwrap();
		assert_eq!(first, second);
	}
}
