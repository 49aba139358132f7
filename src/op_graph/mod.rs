//! Operation Graph: a persisted forest of action nodes sharing `UserOp`s,
//! dequeued in topological order.
//!
//! A status-column DB-backed tracking table, with per-graph-node
//! persistence and explicit parent/child edges rather than per-job
//! persistence with no dependency structure.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sea_orm::{ActiveModelTrait, EntityTrait, QueryOrder, Set};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::entities::{archived_op, pending_op};
use crate::db::Database;
use crate::domain::{NodeIdentifier, OpStatus, OpType, UserOp};
use crate::error::{Classify, ErrorClass};

#[derive(Debug, Error)]
pub enum OpGraphError {
	#[error(transparent)]
	Db(#[from] crate::db::DbError),
	#[error("op {0} not found in graph")]
	NotFound(Uuid),
	#[error("op {0} already present in graph for this role")]
	Duplicate(Uuid),
}

impl Classify for OpGraphError {
	fn class(&self) -> ErrorClass {
		match self {
			Self::Db(e) => e.class(),
			Self::NotFound(_) => ErrorClass::NotFound,
			Self::Duplicate(_) => ErrorClass::Invariant,
		}
	}
}

struct GraphNode {
	op: UserOp,
	parent: Option<Uuid>,
	children: Vec<Uuid>,
}

struct GraphState {
	nodes: HashMap<Uuid, GraphNode>,
	/// FIFO of op_uids whose parent has completed (or has none) and whose
	/// predecessor siblings are complete — i.e. ready to dequeue.
	ready: VecDeque<Uuid>,
}

/// Persisted forest of pending operations. One `OpGraph` per device pair
/// (or per process, for a single-root deployment); `get_next` blocks the
/// caller until an executable op exists.
pub struct OpGraph {
	db: Arc<Database>,
	state: Mutex<GraphState>,
	notify: Notify,
}

impl OpGraph {
	pub fn new(db: Arc<Database>) -> Self {
		Self {
			db,
			state: Mutex::new(GraphState {
				nodes: HashMap::new(),
				ready: VecDeque::new(),
			}),
			notify: Notify::new(),
		}
	}

	/// Loads any `pending_ops` rows left over from a previous run back into
	/// the graph, so a restart resumes rather than silently dropping work.
	pub async fn load_pending(&self) -> Result<(), OpGraphError> {
		let rows = pending_op::Entity::find()
			.order_by_asc(pending_op::Column::CreateTs)
			.all(self.db.conn())
			.await
			.map_err(crate::db::DbError::from)?;
		let mut state = self.state.lock().await;
		for row in rows {
			let op = row_to_user_op(&row);
			let parent = row.parent_op_uid;
			state.nodes.insert(
				op.op_uid,
				GraphNode {
					op,
					parent,
					children: Vec::new(),
				},
			);
		}
		// second pass: wire children + seed ready queue
		let op_uids: Vec<Uuid> = state.nodes.keys().copied().collect();
		for uid in &op_uids {
			if let Some(parent) = state.nodes[uid].parent {
				if let Some(parent_node) = state.nodes.get_mut(&parent) {
					parent_node.children.push(*uid);
				}
			}
		}
		let ready_uids: Vec<Uuid> = op_uids
			.iter()
			.copied()
			.filter(|uid| is_ready(&state.nodes, *uid))
			.collect();
		state.ready.extend(ready_uids);
		drop(state);
		self.notify.notify_waiters();
		Ok(())
	}

	/// Persists each op transactionally, then splices it into the graph.
	/// If an op's target directory has no corresponding node yet, a
	/// synthetic `MKDIR` is inserted ahead of it (and recursively ahead of
	/// that, up to the first ancestor directory that already has one).
	///
	/// Returns the total number of graph nodes actually persisted, which can
	/// exceed `ops.len()` by however many synthetic `MKDIR`s were spliced in
	/// — a caller draining the graph to completion needs this count, not
	/// `ops.len()`, or it will stop short of the synthetic nodes.
	#[instrument(skip(self, ops))]
	pub async fn add_batch(&self, ops: Vec<UserOp>) -> Result<usize, OpGraphError> {
		let mut state = self.state.lock().await;
		let mut to_persist: Vec<(UserOp, Option<Uuid>)> = Vec::with_capacity(ops.len());

		for op in ops {
			if state.nodes.contains_key(&op.op_uid) {
				return Err(OpGraphError::Duplicate(op.op_uid));
			}
			let parent = self.find_or_synthesize_parent(&mut state, &op, &mut to_persist);
			insert_node(&mut state, op.clone(), parent);
			to_persist.push((op, parent));
		}

		let active_models: Vec<pending_op::ActiveModel> = to_persist
			.iter()
			.map(|(op, parent)| user_op_to_active_model(op, *parent))
			.collect();
		let persisted = active_models.len();
		self.db
			.insert_many(active_models)
			.await
			.map_err(OpGraphError::from)?;

		drop(state);
		self.notify.notify_waiters();
		Ok(persisted)
	}

	/// Resolves the op_uid of the operation whose target is `op`'s
	/// containing directory, synthesizing a chain of `MKDIR` ops (and
	/// splicing each into `state` and `to_persist`) when no such operation
	/// already exists in the graph or earlier in this same batch. `RM` has
	/// no such dependency: removal
	/// ordering among siblings is handled by `recursive`, not by a parent
	/// edge on the containing directory.
	fn find_or_synthesize_parent(
		&self,
		state: &mut GraphState,
		op: &UserOp,
		to_persist: &mut Vec<(UserOp, Option<Uuid>)>,
	) -> Option<Uuid> {
		let target_path = match op.op_type {
			OpType::Cp | OpType::Mv | OpType::Up => op.dst_node.as_ref().and_then(|d| d.spid_path()),
			OpType::Mkdir => op.src_node.spid_path(),
			OpType::Rm => return None,
		}?;
		let parent_dir = target_path.parent()?;
		if parent_dir.as_os_str().is_empty() {
			return None;
		}

		if let Some(existing) = find_node_targeting(state, parent_dir) {
			return Some(existing);
		}
		if let Some(existing) = to_persist.iter().find_map(|(op, _)| {
			(node_target_path(op).as_deref() == Some(parent_dir)).then_some(op.op_uid)
		}) {
			return Some(existing);
		}

		let device_uid = op
			.dst_node
			.as_ref()
			.map(|d| d.device_uid)
			.unwrap_or(op.src_node.device_uid);
		let mkdir_op = UserOp::new_in_batch(
			op.batch_uid,
			OpType::Mkdir,
			NodeIdentifier::single(device_uid, 0, parent_dir.to_path_buf()),
			None,
		);
		let grandparent = self.find_or_synthesize_parent(state, &mkdir_op, to_persist);
		insert_node(state, mkdir_op.clone(), grandparent);
		to_persist.push((mkdir_op.clone(), grandparent));
		Some(mkdir_op.op_uid)
	}

	/// Blocks until an op is ready: its parent is root or completed, and
	/// its earlier siblings are complete.
	pub async fn get_next(&self) -> UserOp {
		loop {
			{
				let mut state = self.state.lock().await;
				while let Some(uid) = state.ready.pop_front() {
					if let Some(node) = state.nodes.get(&uid) {
						if node.op.status == OpStatus::Pending {
							return node.op.clone();
						}
					}
				}
			}
			self.notify.notified().await;
		}
	}

	/// Moves the op to `archived_ops`, removes its graph node, and may
	/// unblock children whose predecessor was this op.
	pub async fn mark_completed(&self, op_uid: Uuid) -> Result<(), OpGraphError> {
		self.archive(op_uid, OpStatus::Completed, "completed").await
	}

	/// Archives the op with `reason`; children are recursively archived as
	/// `CANCELLED: parent_failed`.
	pub async fn mark_failed(&self, op_uid: Uuid, reason: &str) -> Result<(), OpGraphError> {
		self.archive(op_uid, OpStatus::Failed, reason).await?;
		let children = {
			let state = self.state.lock().await;
			state
				.nodes
				.get(&op_uid)
				.map(|n| n.children.clone())
				.unwrap_or_default()
		};
		for child in children {
			Box::pin(self.mark_failed(child, "CANCELLED: parent_failed")).await?;
		}
		Ok(())
	}

	async fn archive(&self, op_uid: Uuid, status: OpStatus, reason: &str) -> Result<(), OpGraphError> {
		let mut state = self.state.lock().await;
		let node = state.nodes.remove(&op_uid).ok_or(OpGraphError::NotFound(op_uid))?;

		pending_op::Entity::delete_by_id(op_uid)
			.exec(self.db.conn())
			.await
			.map_err(crate::db::DbError::from)?;
		let archived = archived_op::ActiveModel {
			op_uid: Set(op_uid),
			batch_uid: Set(node.op.batch_uid),
			parent_op_uid: Set(node.parent),
			op_type: Set(op_type_to_column(node.op.op_type)),
			src_device_uid: Set(node.op.src_node.device_uid as i64),
			src_uid: Set(node.op.src_node.uid as i64),
			src_paths: Set(paths_to_json(&node.op.src_node)),
			dst_device_uid: Set(node.op.dst_node.as_ref().map(|d| d.device_uid as i64)),
			dst_uid: Set(node.op.dst_node.as_ref().map(|d| d.uid as i64)),
			dst_paths: Set(node.op.dst_node.as_ref().map(paths_to_json)),
			create_ts: Set(node.op.create_ts),
			status: Set(op_status_to_column(status)),
			recursive: Set(node.op.recursive),
			to_trash: Set(node.op.to_trash),
			archived_ts: Set(chrono::Utc::now()),
			archival_reason: Set(reason.to_string()),
		};
		archived.insert(self.db.conn()).await.map_err(crate::db::DbError::from)?;

		// Unblock children whose only blocker was this node.
		let newly_ready: Vec<Uuid> = node
			.children
			.iter()
			.copied()
			.filter(|c| is_ready(&state.nodes, *c))
			.collect();
		state.ready.extend(newly_ready);
		drop(state);
		self.notify.notify_waiters();
		info!(%op_uid, ?status, "archived op");
		Ok(())
	}
}

fn is_ready(nodes: &HashMap<Uuid, GraphNode>, uid: Uuid) -> bool {
	nodes
		.get(&uid)
		.map(|n| n.parent.map(|p| !nodes.contains_key(&p)).unwrap_or(true))
		.unwrap_or(false)
}

/// Splices `op` into `state.nodes`/`ready`/the parent's `children` list.
/// An op with no parent, or whose parent is not currently tracked (already
/// terminal and archived), is immediately ready.
fn insert_node(state: &mut GraphState, op: UserOp, parent: Option<Uuid>) {
	let ready = parent.map(|p| !state.nodes.contains_key(&p)).unwrap_or(true);
	state.nodes.insert(
		op.op_uid,
		GraphNode {
			op: op.clone(),
			parent,
			children: Vec::new(),
		},
	);
	if let Some(parent_uid) = parent {
		if let Some(parent_node) = state.nodes.get_mut(&parent_uid) {
			parent_node.children.push(op.op_uid);
		}
	}
	if ready {
		state.ready.push_back(op.op_uid);
	}
}

/// The path an op's completion brings into existence / acts on: the
/// destination for ops with one, the source otherwise. Used to match a
/// would-be parent's directory against operations already known to the
/// graph.
fn node_target_path(op: &UserOp) -> Option<PathBuf> {
	match op.op_type {
		OpType::Cp | OpType::Mv | OpType::Up => op.dst_node.as_ref().and_then(|d| d.spid_path()).cloned(),
		OpType::Mkdir | OpType::Rm => op.src_node.spid_path().cloned(),
	}
}

fn find_node_targeting(state: &GraphState, path: &Path) -> Option<Uuid> {
	state
		.nodes
		.values()
		.find(|n| node_target_path(&n.op).as_deref() == Some(path))
		.map(|n| n.op.op_uid)
}

fn op_type_to_column(op_type: OpType) -> pending_op::OpTypeColumn {
	use pending_op::OpTypeColumn as C;
	match op_type {
		OpType::Mkdir => C::Mkdir,
		OpType::Cp => C::Cp,
		OpType::Mv => C::Mv,
		OpType::Rm => C::Rm,
		OpType::Up => C::Up,
	}
}

fn op_status_to_column(status: OpStatus) -> pending_op::OpStatusColumn {
	use pending_op::OpStatusColumn as C;
	match status {
		OpStatus::Pending => C::Pending,
		OpStatus::Executing => C::Executing,
		OpStatus::Completed => C::Completed,
		OpStatus::Failed => C::Failed,
		OpStatus::Cancelled => C::Cancelled,
	}
}

fn paths_to_json(id: &NodeIdentifier) -> serde_json::Value {
	serde_json::json!(id.paths.iter().map(|p| p.to_string_lossy().to_string()).collect::<Vec<_>>())
}

fn user_op_to_active_model(op: &UserOp, parent: Option<Uuid>) -> pending_op::ActiveModel {
	pending_op::ActiveModel {
		op_uid: Set(op.op_uid),
		batch_uid: Set(op.batch_uid),
		parent_op_uid: Set(parent),
		op_type: Set(op_type_to_column(op.op_type)),
		src_device_uid: Set(op.src_node.device_uid as i64),
		src_uid: Set(op.src_node.uid as i64),
		src_paths: Set(paths_to_json(&op.src_node)),
		dst_device_uid: Set(op.dst_node.as_ref().map(|d| d.device_uid as i64)),
		dst_uid: Set(op.dst_node.as_ref().map(|d| d.uid as i64)),
		dst_paths: Set(op.dst_node.as_ref().map(paths_to_json)),
		create_ts: Set(op.create_ts),
		status: Set(op_status_to_column(op.status)),
		recursive: Set(op.recursive),
		to_trash: Set(op.to_trash),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	const DEVICE: u64 = 1;

	async fn fresh_graph() -> (OpGraph, tempfile::TempDir) {
		let dir = tempdir().unwrap();
		let db = Database::create(&dir.path().join("op_graph.db")).await.unwrap();
		db.migrate().await.unwrap();
		(OpGraph::new(Arc::new(db)), dir)
	}

	fn cp(batch: Uuid, src: &str, dst: &str) -> UserOp {
		UserOp::new_in_batch(
			batch,
			OpType::Cp,
			NodeIdentifier::single(DEVICE, 10, PathBuf::from(src)),
			Some(NodeIdentifier::single(DEVICE, 0, PathBuf::from(dst))),
		)
	}

	fn mkdir(batch: Uuid, path: &str) -> UserOp {
		UserOp::new_in_batch(
			batch,
			OpType::Mkdir,
			NodeIdentifier::single(DEVICE, 0, PathBuf::from(path)),
			None,
		)
	}

	#[tokio::test]
	async fn adding_the_same_op_uid_twice_is_rejected() {
		let (graph, _dir) = fresh_graph().await;
		let batch = Uuid::new_v4();
		let op = mkdir(batch, "/root/a");
		graph.add_batch(vec![op.clone()]).await.unwrap();
		let err = graph.add_batch(vec![op]).await.unwrap_err();
		assert!(matches!(err, OpGraphError::Duplicate(_)));
	}

	#[tokio::test]
	async fn cp_into_a_missing_directory_gets_a_synthetic_mkdir_parent() {
		let (graph, _dir) = fresh_graph().await;
		let batch = Uuid::new_v4();
		let op = cp(batch, "/root/x", "/root/dir/x");
		graph.add_batch(vec![op.clone()]).await.unwrap();

		// the synthesized MKDIR must run before the CP
		let first = graph.get_next().await;
		assert_eq!(first.op_type, OpType::Mkdir);
		assert_eq!(first.src_node.spid_path(), Some(&PathBuf::from("/root/dir")));
		graph.mark_completed(first.op_uid).await.unwrap();

		let second = graph.get_next().await;
		assert_eq!(second.op_type, OpType::Cp);
		assert_eq!(second.op_uid, op.op_uid);
	}

	#[tokio::test]
	async fn two_cps_into_the_same_missing_directory_share_one_synthetic_mkdir() {
		let (graph, _dir) = fresh_graph().await;
		let batch = Uuid::new_v4();
		let a = cp(batch, "/root/a", "/root/dir/a");
		let b = cp(batch, "/root/b", "/root/dir/b");
		graph.add_batch(vec![a, b]).await.unwrap();

		let first = graph.get_next().await;
		assert_eq!(first.op_type, OpType::Mkdir);
		// no second MKDIR should be ready yet: both CPs are blocked on the one we just got
		graph.mark_completed(first.op_uid).await.unwrap();

		let second = graph.get_next().await;
		let third = graph.get_next().await;
		assert_eq!(second.op_type, OpType::Cp);
		assert_eq!(third.op_type, OpType::Cp);
	}

	#[tokio::test]
	async fn cp_into_an_existing_directory_needs_no_synthetic_parent() {
		let (graph, _dir) = fresh_graph().await;
		let batch = Uuid::new_v4();
		let existing_dir = mkdir(batch, "/root/dir");
		graph.add_batch(vec![existing_dir.clone()]).await.unwrap();
		let next = graph.get_next().await;
		graph.mark_completed(next.op_uid).await.unwrap();

		let op = cp(batch, "/root/x", "/root/dir/x");
		graph.add_batch(vec![op.clone()]).await.unwrap();
		let ready = graph.get_next().await;
		assert_eq!(ready.op_uid, op.op_uid);
	}

	#[tokio::test]
	async fn failing_a_synthetic_mkdir_cancels_the_op_waiting_on_it() {
		let (graph, _dir) = fresh_graph().await;
		let batch = Uuid::new_v4();
		let op = cp(batch, "/root/x", "/root/dir/x");
		graph.add_batch(vec![op.clone()]).await.unwrap();

		let mkdir_op = graph.get_next().await;
		assert_eq!(mkdir_op.op_type, OpType::Mkdir);
		graph.mark_failed(mkdir_op.op_uid, "disk full").await.unwrap();

		// the CP was archived as CANCELLED along with its failed parent and
		// must never be handed out by get_next.
		let next = tokio::time::timeout(std::time::Duration::from_millis(50), graph.get_next()).await;
		assert!(next.is_err(), "no further op should become ready");
	}

	#[tokio::test]
	async fn load_pending_reconstructs_the_ready_queue_after_restart() {
		let dir = tempdir().unwrap();
		let db = Arc::new(Database::create(&dir.path().join("op_graph.db")).await.unwrap());
		db.migrate().await.unwrap();
		let batch = Uuid::new_v4();
		{
			let graph = OpGraph::new(db.clone());
			let op = mkdir(batch, "/root/a");
			graph.add_batch(vec![op]).await.unwrap();
		}

		let reloaded = OpGraph::new(db);
		reloaded.load_pending().await.unwrap();
		let op = reloaded.get_next().await;
		assert_eq!(op.src_node.spid_path(), Some(&PathBuf::from("/root/a")));
	}
}

fn row_to_user_op(row: &pending_op::Model) -> UserOp {
	use pending_op::{OpStatusColumn, OpTypeColumn};
	let op_type = match row.op_type {
		OpTypeColumn::Mkdir => OpType::Mkdir,
		OpTypeColumn::Cp => OpType::Cp,
		OpTypeColumn::Mv => OpType::Mv,
		OpTypeColumn::Rm => OpType::Rm,
		OpTypeColumn::Up => OpType::Up,
	};
	let status = match row.status {
		OpStatusColumn::Pending => OpStatus::Pending,
		OpStatusColumn::Executing => OpStatus::Executing,
		OpStatusColumn::Completed => OpStatus::Completed,
		OpStatusColumn::Failed => OpStatus::Failed,
		OpStatusColumn::Cancelled => OpStatus::Cancelled,
	};
	let src_paths: Vec<String> = serde_json::from_value(row.src_paths.clone()).unwrap_or_default();
	let src_node = NodeIdentifier {
		device_uid: row.src_device_uid as u64,
		uid: row.src_uid as u64,
		paths: src_paths.into_iter().map(std::path::PathBuf::from).collect(),
	};
	let dst_node = match (row.dst_device_uid, row.dst_uid) {
		(Some(device_uid), Some(uid)) => {
			let dst_paths: Vec<String> = row
				.dst_paths
				.clone()
				.and_then(|v| serde_json::from_value(v).ok())
				.unwrap_or_default();
			Some(NodeIdentifier {
				device_uid: device_uid as u64,
				uid: uid as u64,
				paths: dst_paths.into_iter().map(std::path::PathBuf::from).collect(),
			})
		}
		_ => None,
	};
	UserOp {
		op_uid: row.op_uid,
		batch_uid: row.batch_uid,
		op_type,
		src_node,
		dst_node,
		create_ts: row.create_ts,
		status,
		recursive: row.recursive,
		to_trash: row.to_trash,
	}
}
