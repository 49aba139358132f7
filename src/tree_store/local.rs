//! `LocalTreeStore` — walks a POSIX subtree, keeping an in-memory node map
//! plus a write-through `local_nodes` table in sync with it.
//!
//! Owns an in-memory index, writes through to the database, and emits an
//! event on change, with exclusion rules (see `rules.rs`) applied during
//! the walk. Directories are reported pre-order, before their contents.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sea_orm::{ActiveModelTrait, EntityTrait, IntoActiveModel, Set};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::task_runner::HoldOffTimer;

use crate::db::entities::local_node;
use crate::db::Database;
use crate::domain::node::{unix_epoch_ms, LocalDir, LocalFile, Signature};
use crate::domain::{DeviceUid, DirectoryStats, Node, NodeIdentifier, Uid};
use crate::events::{Event, EventBus};
use crate::identity::PathMapper;
use crate::uid::UidAllocator;

use super::{ChildFilter, SubtreeSnapshot, TreeStore, TreeStoreError};
use super::rules::ExclusionRuleSet;

pub struct LocalTreeStore {
	device_uid: DeviceUid,
	db: Arc<Database>,
	uid_alloc: Arc<UidAllocator>,
	path_mapper: Arc<PathMapper>,
	events: Arc<EventBus>,
	rules: ExclusionRuleSet,
	nodes: RwLock<HashMap<Uid, Node>>,
}

impl LocalTreeStore {
	pub fn new(
		device_uid: DeviceUid,
		db: Arc<Database>,
		uid_alloc: Arc<UidAllocator>,
		path_mapper: Arc<PathMapper>,
		events: Arc<EventBus>,
	) -> Self {
		Self {
			device_uid,
			db,
			uid_alloc,
			path_mapper,
			events,
			rules: ExclusionRuleSet::default_set(),
			nodes: RwLock::new(HashMap::new()),
		}
	}

	async fn uid_for_path(&self, path: &Path) -> Result<Uid, TreeStoreError> {
		if let Some(existing) = self.path_mapper.get(path).await? {
			return Ok(existing);
		}
		let fresh = self
			.uid_alloc
			.next()
			.await
			.map_err(|e| TreeStoreError::Walk {
				path: path.to_path_buf(),
				source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
			})?;
		Ok(self.path_mapper.get_or_insert(path, fresh, self.device_uid).await?)
	}

	/// Breadth-first from `root`, emitting each directory before its
	/// contents (pre-order). Permission-denied subtrees are logged and
	/// cause the walk to return `is_complete = false` for that branch, but
	/// do not abort the rest of the walk.
	#[instrument(skip(self), fields(root = %root.display()))]
	async fn walk(&self, root: &Path) -> Result<bool, TreeStoreError> {
		let mut is_complete = true;
		let mut queue = std::collections::VecDeque::new();
		queue.push_back(root.to_path_buf());

		while let Some(dir_path) = queue.pop_front() {
			if self.rules.is_excluded(&dir_path) {
				continue;
			}

			self.upsert_dir(&dir_path).await?;

			let mut read_dir = match tokio::fs::read_dir(&dir_path).await {
				Ok(rd) => rd,
				Err(source) if source.kind() == std::io::ErrorKind::PermissionDenied => {
					warn!(path = %dir_path.display(), "permission denied, marking subtree incomplete");
					is_complete = false;
					continue;
				}
				Err(source) => {
					return Err(TreeStoreError::Walk {
						path: dir_path.clone(),
						source,
					})
				}
			};

			while let Some(entry) = read_dir.next_entry().await.map_err(|source| TreeStoreError::Walk {
				path: dir_path.clone(),
				source,
			})? {
				let path = entry.path();
				if self.rules.is_excluded(&path) {
					continue;
				}
				let metadata = match entry.metadata().await {
					Ok(m) => m,
					Err(source) => {
						return Err(TreeStoreError::Walk { path: path.clone(), source })
					}
				};

				if metadata.is_dir() {
					queue.push_back(path);
				} else {
					// Symlinks are recorded as files, never followed.
					self.upsert_file(&path, &metadata).await?;
				}
			}
		}

		Ok(is_complete)
	}

	async fn upsert_dir(&self, path: &Path) -> Result<Node, TreeStoreError> {
		let uid = self.uid_for_path(path).await?;
		let identifier = NodeIdentifier::single(self.device_uid, uid, path.to_path_buf());
		let existing_trashed = {
			let nodes = self.nodes.read().await;
			match nodes.get(&uid) {
				Some(Node::LocalDir(d)) => d.trashed,
				_ => false,
			}
		};
		let node = Node::LocalDir(LocalDir {
			identifier,
			size: 0,
			file_count: 0,
			dir_count: 0,
			trashed: existing_trashed,
		});
		self.upsert_single_node(node.clone()).await?;
		Ok(node)
	}

	async fn upsert_file(&self, path: &Path, metadata: &std::fs::Metadata) -> Result<(), TreeStoreError> {
		let uid = self.uid_for_path(path).await?;
		let identifier = NodeIdentifier::single(self.device_uid, uid, path.to_path_buf());
		let existing_signature = {
			let nodes = self.nodes.read().await;
			match nodes.get(&uid) {
				Some(Node::LocalFile(f)) if f.identifier.paths == identifier.paths => {
					f.signature.clone()
				}
				_ => Signature::default(),
			}
		};
		let node = Node::LocalFile(LocalFile {
			identifier,
			size: metadata.len(),
			mtime_ms: unix_epoch_ms(metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
			ctime_ms: unix_epoch_ms(metadata.created().unwrap_or(SystemTime::UNIX_EPOCH)),
			signature: existing_signature,
			trashed: false,
		});
		self.upsert_single_node(node).await
	}

	async fn persist_node(&self, node: &Node) -> Result<(), TreeStoreError> {
		let uid = node.uid().expect("only addressable nodes are persisted") as i64;
		let path = node
			.single_path()
			.map(|p| p.to_string_lossy().to_string())
			.unwrap_or_default();

		let existing = local_node::Entity::find_by_id(uid).one(self.db.conn()).await?;
		let mut am = match existing {
			Some(model) => model.into_active_model(),
			None => local_node::ActiveModel {
				uid: Set(uid),
				..Default::default()
			},
		};
		am.device_uid = Set(self.device_uid as i64);
		am.path = Set(path);
		am.is_dir = Set(node.is_dir());
		am.size = Set(node.size() as i64);
		am.mtime_ms = Set(node.mtime_ms().unwrap_or(0));
		am.ctime_ms = Set(match node {
			Node::LocalFile(f) => f.ctime_ms,
			_ => 0,
		});
		am.md5 = Set(node.md5().map(str::to_owned));
		am.sha256 = Set(match node {
			Node::LocalFile(f) => f.signature.sha256.clone(),
			_ => None,
		});
		am.file_count = Set(match node {
			Node::LocalDir(d) => d.file_count as i64,
			_ => 0,
		});
		am.dir_count = Set(match node {
			Node::LocalDir(d) => d.dir_count as i64,
			_ => 0,
		});
		am.trashed = Set(node.is_trashed());
		am.sync_ts = Set(chrono::Utc::now());

		am.save(self.db.conn()).await.map_err(crate::db::DbError::from)?;
		Ok(())
	}

	/// Starts live filesystem watching on `root`, coalescing bursts of raw
	/// `notify` events behind a `HoldOffTimer` and re-walking the subtree
	/// once things settle, rather than reacting to each event
	/// individually. The returned `RecommendedWatcher` must be kept alive
	/// for as long as watching should continue; dropping it stops the
	/// watch.
	pub fn watch(self: &Arc<Self>, root: PathBuf, settle: Duration) -> Result<RecommendedWatcher, TreeStoreError> {
		let store = self.clone();
		let callback_root = root.clone();
		let hold_off = Arc::new(HoldOffTimer::new());

		let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
			let event = match res {
				Ok(event) => event,
				Err(source) => {
					warn!(%source, "filesystem watcher reported an error");
					return;
				}
			};
			if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
				return;
			}
			let store = store.clone();
			let root = callback_root.clone();
			hold_off.start_or_delay(settle, move || {
				tokio::spawn(async move {
					debug!(root = %root.display(), "settled, re-walking after filesystem change");
					if let Err(source) = store.walk(&root).await {
						warn!(%source, "re-walk after filesystem change failed");
					}
				});
			});
		})
		.map_err(|source| TreeStoreError::WatchSpawn {
			path: root.clone(),
			source,
		})?;

		watcher
			.watch(&root, RecursiveMode::Recursive)
			.map_err(|source| TreeStoreError::WatchSpawn { path: root, source })?;
		Ok(watcher)
	}
}

#[async_trait]
impl TreeStore for LocalTreeStore {
	async fn load_subtree(&self, root: &NodeIdentifier) -> Result<(), TreeStoreError> {
		let Some(path) = root.spid_path() else {
			return Err(TreeStoreError::NodeNotFound(root.uid));
		};
		self.walk(path).await?;
		Ok(())
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
		let Some(parent_path) = node.single_path() else {
			return Ok(Vec::new());
		};
		let nodes = self.nodes.read().await;
		Ok(nodes
			.values()
			.filter(|n| {
				let Some(p) = n.single_path() else { return false };
				if p.parent() != Some(parent_path.as_path()) {
					return false;
				}
				if filter.files_only && !n.is_file() {
					return false;
				}
				if filter.dirs_only && !n.is_dir() {
					return false;
				}
				if !filter.include_trashed && n.is_trashed() {
					return false;
				}
				true
			})
			.cloned()
			.collect())
	}

	async fn get_parent_list(&self, node: &Node) -> Result<Vec<Node>, TreeStoreError> {
		let Some(path) = node.single_path() else {
			return Ok(Vec::new());
		};
		let Some(parent_path) = path.parent() else {
			return Ok(Vec::new());
		};
		let Some(uid) = self.path_mapper.get(parent_path).await? else {
			return Ok(Vec::new());
		};
		Ok(self.get_node_for_uid(uid).await?.into_iter().collect())
	}

	async fn upsert_single_node(&self, node: Node) -> Result<(), TreeStoreError> {
		self.persist_node(&node).await?;
		let uid = node.uid().expect("local nodes are always addressable");
		let path = node.single_path().cloned();
		self.nodes.write().await.insert(uid, node);
		self.events.emit(Event::NodeUpsertedInCache {
			device_uid: self.device_uid,
			uid,
			path,
		});
		Ok(())
	}

	async fn update_single_node(&self, node: Node) -> Result<(), TreeStoreError> {
		self.upsert_single_node(node).await
	}

	async fn remove_single_node(&self, node: &Node, to_trash: bool) -> Result<(), TreeStoreError> {
		let Some(uid) = node.uid() else { return Ok(()) };
		if to_trash {
			let mut trashed_node = node.clone();
			match &mut trashed_node {
				Node::LocalFile(f) => f.trashed = true,
				Node::LocalDir(d) => d.trashed = true,
				_ => {}
			}
			self.upsert_single_node(trashed_node).await?;
		} else {
			self.nodes.write().await.remove(&uid);
			local_node::Entity::delete_by_id(uid as i64)
				.exec(self.db.conn())
				.await
				.map_err(crate::db::DbError::from)?;
			self.events.emit(Event::NodeRemovedFromCache {
				device_uid: self.device_uid,
				uid,
			});
		}
		Ok(())
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
		let Some(root_node) = self.get_node_for_uid(root.uid).await? else {
			return Err(TreeStoreError::NodeNotFound(root.uid));
		};
		let mut stats = HashMap::new();
		self.accumulate_stats(&root_node, &mut stats).await?;
		Ok(stats)
	}

	async fn get_all_files_and_dirs_for_subtree(
		&self,
		root: &NodeIdentifier,
	) -> Result<SubtreeSnapshot, TreeStoreError> {
		let nodes = self.nodes.read().await;
		let Some(root_path) = root.spid_path() else {
			return Err(TreeStoreError::NodeNotFound(root.uid));
		};
		let mut files = Vec::new();
		let mut dirs = Vec::new();
		for node in nodes.values() {
			if let Some(path) = node.single_path() {
				if path.starts_with(root_path) {
					if node.is_file() {
						files.push(node.clone());
					} else if node.is_dir() {
						dirs.push(node.clone());
					}
				}
			}
		}
		Ok(SubtreeSnapshot {
			root: root.clone(),
			files,
			dirs,
		})
	}

	async fn get_node_for_domain_id(&self, domain_id: &str) -> Result<Node, TreeStoreError> {
		let path = PathBuf::from(domain_id);
		let uid = self
			.path_mapper
			.get(&path)
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
		let path = PathBuf::from(domain_id);
		Ok(self.path_mapper.get_or_insert(&path, suggestion.unwrap_or(0), self.device_uid).await?)
	}

	fn device_uid(&self) -> DeviceUid {
		self.device_uid
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConfigStore;
	use tempfile::tempdir;

	const DEVICE: DeviceUid = 1;

	async fn harness() -> (Arc<LocalTreeStore>, std::path::PathBuf, tempfile::TempDir) {
		let dir = tempdir().unwrap();
		let db = Arc::new(Database::create(&dir.path().join("coresync.db")).await.unwrap());
		db.migrate().await.unwrap();
		let events = Arc::new(EventBus::default());
		let path_mapper = Arc::new(PathMapper::load(db.clone()).await.unwrap());
		let config = Arc::new(ConfigStore::load_or_create(&dir.path().join("config")).await.unwrap());
		let uid_alloc = Arc::new(UidAllocator::load(config).await.unwrap());
		let store = Arc::new(LocalTreeStore::new(DEVICE, db, uid_alloc, path_mapper, events));
		let root = dir.path().join("root");
		tokio::fs::create_dir_all(&root).await.unwrap();
		(store, root, dir)
	}

	#[tokio::test]
	async fn walk_indexes_files_and_nested_directories() {
		let (store, root, _dir) = harness().await;
		tokio::fs::create_dir_all(root.join("sub")).await.unwrap();
		tokio::fs::write(root.join("a.txt"), b"hello").await.unwrap();
		tokio::fs::write(root.join("sub/b.txt"), b"world").await.unwrap();

		let identifier = NodeIdentifier::single(DEVICE, 0, root.clone());
		store.load_subtree(&identifier).await.unwrap();

		let snapshot = store
			.get_all_files_and_dirs_for_subtree(&NodeIdentifier::single(DEVICE, 0, root.clone()))
			.await
			.unwrap();
		assert_eq!(snapshot.files.len(), 2);
		// root + sub
		assert_eq!(snapshot.dirs.len(), 2);
	}

	#[tokio::test]
	async fn exclusion_rules_skip_dotgit_and_node_modules() {
		let (store, root, _dir) = harness().await;
		tokio::fs::create_dir_all(root.join(".git")).await.unwrap();
		tokio::fs::write(root.join(".git/HEAD"), b"ref: refs/heads/main").await.unwrap();
		tokio::fs::create_dir_all(root.join("node_modules/pkg")).await.unwrap();
		tokio::fs::write(root.join("node_modules/pkg/index.js"), b"").await.unwrap();
		tokio::fs::write(root.join("kept.txt"), b"x").await.unwrap();

		store.load_subtree(&NodeIdentifier::single(DEVICE, 0, root.clone())).await.unwrap();

		let snapshot = store
			.get_all_files_and_dirs_for_subtree(&NodeIdentifier::single(DEVICE, 0, root.clone()))
			.await
			.unwrap();
		assert_eq!(snapshot.files.len(), 1);
		assert_eq!(snapshot.files[0].single_path().unwrap(), &root.join("kept.txt"));
	}

	#[tokio::test]
	async fn rewalk_preserves_an_already_computed_signature() {
		let (store, root, _dir) = harness().await;
		let file_path = root.join("a.txt");
		tokio::fs::write(&file_path, b"hello").await.unwrap();
		store.load_subtree(&NodeIdentifier::single(DEVICE, 0, root.clone())).await.unwrap();

		let uid = store.path_mapper.get(&file_path).await.unwrap().unwrap();
		let mut node = store.get_node_for_uid(uid).await.unwrap().unwrap();
		if let Node::LocalFile(f) = &mut node {
			f.signature.md5 = Some("deadbeef".to_string());
		}
		store.update_single_node(node).await.unwrap();

		// re-walk without touching the file on disk
		store.load_subtree(&NodeIdentifier::single(DEVICE, 0, root.clone())).await.unwrap();
		let refreshed = store.get_node_for_uid(uid).await.unwrap().unwrap();
		assert_eq!(refreshed.md5(), Some("deadbeef"));
	}

	#[tokio::test]
	async fn remove_single_node_without_trash_deletes_it_from_the_cache() {
		let (store, root, _dir) = harness().await;
		let file_path = root.join("a.txt");
		tokio::fs::write(&file_path, b"hello").await.unwrap();
		store.load_subtree(&NodeIdentifier::single(DEVICE, 0, root.clone())).await.unwrap();

		let uid = store.path_mapper.get(&file_path).await.unwrap().unwrap();
		let node = store.get_node_for_uid(uid).await.unwrap().unwrap();
		store.remove_single_node(&node, false).await.unwrap();

		assert!(store.get_node_for_uid(uid).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn remove_single_node_with_trash_keeps_it_marked_trashed() {
		let (store, root, _dir) = harness().await;
		let file_path = root.join("a.txt");
		tokio::fs::write(&file_path, b"hello").await.unwrap();
		store.load_subtree(&NodeIdentifier::single(DEVICE, 0, root.clone())).await.unwrap();

		let uid = store.path_mapper.get(&file_path).await.unwrap().unwrap();
		let node = store.get_node_for_uid(uid).await.unwrap().unwrap();
		store.remove_single_node(&node, true).await.unwrap();

		let trashed = store.get_node_for_uid(uid).await.unwrap().unwrap();
		assert!(trashed.is_trashed());
	}

	#[tokio::test]
	async fn remove_subtree_removes_a_directory_and_its_descendants() {
		let (store, root, _dir) = harness().await;
		tokio::fs::create_dir_all(root.join("sub")).await.unwrap();
		tokio::fs::write(root.join("sub/a.txt"), b"hello").await.unwrap();
		let root_id = NodeIdentifier::single(DEVICE, 0, root.clone());
		store.load_subtree(&root_id).await.unwrap();

		let sub_uid = store.path_mapper.get(&root.join("sub")).await.unwrap().unwrap();
		let file_uid = store.path_mapper.get(&root.join("sub/a.txt")).await.unwrap().unwrap();
		let sub_node = store.get_node_for_uid(sub_uid).await.unwrap().unwrap();

		store.remove_subtree(&sub_node, false).await.unwrap();

		assert!(store.get_node_for_uid(sub_uid).await.unwrap().is_none());
		assert!(store.get_node_for_uid(file_uid).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn generate_dir_stats_aggregates_bottom_up() {
		let (store, root, _dir) = harness().await;
		tokio::fs::create_dir_all(root.join("sub")).await.unwrap();
		tokio::fs::write(root.join("a.txt"), b"12345").await.unwrap();
		tokio::fs::write(root.join("sub/b.txt"), b"1234567").await.unwrap();
		let root_id = NodeIdentifier::single(DEVICE, 0, root.clone());
		store.load_subtree(&root_id).await.unwrap();

		let root_uid = store.path_mapper.get(&root).await.unwrap().unwrap();
		let stats = store
			.generate_dir_stats(&NodeIdentifier::single(DEVICE, root_uid, root.clone()))
			.await
			.unwrap();
		let root_stats = stats.get(&root_uid).copied().unwrap();
		assert_eq!(root_stats.file_count, 2);
		assert_eq!(root_stats.dir_count, 1);
		assert_eq!(root_stats.size_bytes, 12);
	}

	#[tokio::test]
	async fn watch_picks_up_a_file_created_after_the_initial_walk() {
		let (store, root, _dir) = harness().await;
		store.load_subtree(&NodeIdentifier::single(DEVICE, 0, root.clone())).await.unwrap();
		assert!(store.path_mapper.get(&root.join("late.txt")).await.unwrap().is_none());

		let _watcher = store.watch(root.clone(), Duration::from_millis(50)).unwrap();
		tokio::fs::write(root.join("late.txt"), b"arrived after the walk").await.unwrap();

		// give the watcher + hold-off timer time to fire the re-walk.
		tokio::time::sleep(Duration::from_millis(500)).await;

		let uid = store.path_mapper.get(&root.join("late.txt")).await.unwrap();
		assert!(uid.is_some(), "watcher must have triggered a re-walk that picked up the new file");
	}
}

impl LocalTreeStore {
	fn accumulate_stats<'a>(
		&'a self,
		node: &'a Node,
		out: &'a mut HashMap<Uid, DirectoryStats>,
	) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<DirectoryStats, TreeStoreError>> + 'a>> {
		Box::pin(async move {
			if !node.is_dir() {
				return Ok(DirectoryStats::default());
			}
			let mut stats = DirectoryStats::default();
			let children = self.get_child_list(node, &ChildFilter::default()).await?;
			for child in &children {
				if child.is_dir() {
					let child_stats = self.accumulate_stats(child, out).await?;
					stats.merge_child_dir(&child_stats, child.is_trashed());
				} else {
					stats.merge_child_file(child.size(), child.is_trashed());
				}
			}
			out.insert(node.uid().expect("dir nodes are addressable"), stats);
			Ok(stats)
		})
	}
}
