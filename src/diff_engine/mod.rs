//! Diff Engine: content-first-with-path-fallback comparison of two subtree
//! snapshots, producing a categorized set of `UserOp`s.
//!
//! An unmatched node with neither a usable hash nor a usable path is a hard
//! error, not a silently skipped entry: an unreachable branch here is a
//! bug, not a no-op.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{DeviceUid, Node, NodeIdentifier, OpType, UserOp};
use crate::error::{Classify, ErrorClass};
use crate::tree_store::SubtreeSnapshot;

#[derive(Debug, Error)]
pub enum DiffError {
	#[error("node {0:?} has neither an md5 nor a usable path, diff cannot proceed")]
	Unreachable(NodeIdentifier),
}

impl Classify for DiffError {
	fn class(&self) -> ErrorClass {
		ErrorClass::Invariant
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeCategory {
	ToAddLeft,
	ToDeleteLeft,
	ToUpdateLeft,
	ToMoveLeft,
	ToAddRight,
	ToDeleteRight,
	ToUpdateRight,
	ToMoveRight,
}

#[derive(Debug, Default)]
pub struct ChangeTree {
	pub by_category: HashMap<ChangeCategory, Vec<UserOp>>,
}

impl ChangeTree {
	fn push(&mut self, category: ChangeCategory, op: UserOp) {
		self.by_category.entry(category).or_default().push(op);
	}

	pub fn all_ops(&self) -> Vec<UserOp> {
		self.by_category.values().flatten().cloned().collect()
	}
}

#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
	/// Whether a trashed-vs-present pair with identical content becomes an
	/// `RM` on the non-trashed side.
	pub propagate_deletions: bool,
}

impl Default for DiffOptions {
	fn default() -> Self {
		Self {
			propagate_deletions: false,
		}
	}
}

/// `change_ts == 0` means "unknown" and is ignored in mtime comparisons.
fn known_mtime(node: &Node) -> Option<i64> {
	match node.mtime_ms() {
		Some(0) => None,
		other => other,
	}
}

pub fn diff(
	left: &SubtreeSnapshot,
	right: &SubtreeSnapshot,
	options: DiffOptions,
) -> Result<ChangeTree, DiffError> {
	let batch_uid = Uuid::new_v4();
	let mut tree = ChangeTree::default();

	let left_by_md5 = index_by_md5(left);
	let right_by_md5 = index_by_md5(right);
	let left_by_path = index_by_path(left);
	let right_by_path = index_by_path(right);

	// Step 2: MD5 present on left but not right -> CP left -> right.
	for (md5, node) in &left_by_md5 {
		if right_by_md5.contains_key(md5) {
			continue;
		}
		let dst = mirrored_identifier(node, &right.root, &left.root)?;
		tree.push(
			ChangeCategory::ToAddRight,
			UserOp::new_in_batch(batch_uid, OpType::Cp, node_identifier(node)?, Some(dst)),
		);
	}

	// Step 3: MD5 present on right but not left -> CP right -> left.
	for (md5, node) in &right_by_md5 {
		if left_by_md5.contains_key(md5) {
			continue;
		}
		let dst = mirrored_identifier(node, &left.root, &right.root)?;
		tree.push(
			ChangeCategory::ToAddLeft,
			UserOp::new_in_batch(batch_uid, OpType::Cp, node_identifier(node)?, Some(dst)),
		);
	}

	// Step 4: MD5 present on both sides at different (relative) paths ->
	// MV on the older side.
	for (md5, left_node) in &left_by_md5 {
		let Some(right_node) = right_by_md5.get(md5) else { continue };
		let (Some(left_rel), Some(right_rel)) = (
			relative_path(left_node, &left.root),
			relative_path(right_node, &right.root),
		) else {
			continue;
		};
		if left_rel == right_rel {
			continue;
		}
		let left_mtime = known_mtime(left_node);
		let right_mtime = known_mtime(right_node);
		match (left_mtime, right_mtime) {
			(Some(l), Some(r)) if l < r => tree.push(
				ChangeCategory::ToMoveLeft,
				UserOp::new_in_batch(
					batch_uid,
					OpType::Mv,
					node_identifier(left_node)?,
					Some(node_identifier(right_node)?),
				),
			),
			(Some(l), Some(r)) if l > r => tree.push(
				ChangeCategory::ToMoveRight,
				UserOp::new_in_batch(
					batch_uid,
					OpType::Mv,
					node_identifier(right_node)?,
					Some(node_identifier(left_node)?),
				),
			),
			// Equal mtime, or one/both unknown: the rename still needs
			// reconciling, so the default is to rename the right side onto
			// the left side's path.
			_ => tree.push(
				ChangeCategory::ToMoveRight,
				UserOp::new_in_batch(
					batch_uid,
					OpType::Mv,
					node_identifier(right_node)?,
					Some(node_identifier(left_node)?),
				),
			),
		}
	}

	// Step 5: same path, different MD5 -> UP on the older side.
	for (path, left_node) in &left_by_path {
		let Some(right_node) = right_by_path.get(path) else { continue };
		if left_node.md5() == right_node.md5() {
			if left_node.is_trashed() != right_node.is_trashed() && options.propagate_deletions {
				let (src, category) = if left_node.is_trashed() {
					(*right_node, ChangeCategory::ToDeleteRight)
				} else {
					(*left_node, ChangeCategory::ToDeleteLeft)
				};
				tree.push(
					category,
					UserOp::new_in_batch(batch_uid, OpType::Rm, node_identifier(src)?, None),
				);
			}
			continue;
		}
		let left_mtime = known_mtime(left_node);
		let right_mtime = known_mtime(right_node);
		match (left_mtime, right_mtime) {
			(Some(l), Some(r)) if l < r => tree.push(
				ChangeCategory::ToUpdateLeft,
				UserOp::new_in_batch(
					batch_uid,
					OpType::Up,
					node_identifier(right_node)?,
					Some(node_identifier(left_node)?),
				),
			),
			(Some(l), Some(r)) if l > r => tree.push(
				ChangeCategory::ToUpdateRight,
				UserOp::new_in_batch(
					batch_uid,
					OpType::Up,
					node_identifier(left_node)?,
					Some(node_identifier(right_node)?),
				),
			),
			_ => {}
		}
	}

	Ok(tree)
}

fn index_by_md5(snapshot: &SubtreeSnapshot) -> HashMap<String, &Node> {
	snapshot
		.files
		.iter()
		.filter_map(|n| n.md5().map(|md5| (md5.to_string(), n)))
		.collect()
}

fn index_by_path(snapshot: &SubtreeSnapshot) -> HashMap<std::path::PathBuf, &Node> {
	snapshot
		.files
		.iter()
		.filter_map(|n| relative_path(n, &snapshot.root).map(|p| (p, n)))
		.collect()
}

/// `node`'s path relative to its subtree's root, used as the fallback join
/// key once MD5 matching is exhausted.
fn relative_path(node: &Node, root: &NodeIdentifier) -> Option<std::path::PathBuf> {
	let path = node.single_path()?;
	let root_path = root.spid_path()?;
	Some(path.strip_prefix(root_path).unwrap_or(path).to_path_buf())
}

fn node_identifier(node: &Node) -> Result<NodeIdentifier, DiffError> {
	let uid = node.uid().ok_or_else(|| {
		DiffError::Unreachable(NodeIdentifier {
			device_uid: 0,
			uid: 0,
			paths: Vec::new(),
		})
	})?;
	let device_uid = node.device_uid().unwrap_or(0);
	Ok(NodeIdentifier {
		device_uid,
		uid,
		paths: node.single_path().cloned().into_iter().collect(),
	})
}

/// Mirrors `node`'s path from its own root onto `dst_root`, for the CP
/// destination of a file that exists on only one side.
fn mirrored_identifier(
	node: &Node,
	dst_root: &NodeIdentifier,
	src_root: &NodeIdentifier,
) -> Result<NodeIdentifier, DiffError> {
	let src_path = node.single_path().ok_or_else(|| DiffError::Unreachable(node_identifier(node).unwrap_or_else(|_| src_root.clone())))?;
	let src_root_path = src_root
		.spid_path()
		.ok_or_else(|| DiffError::Unreachable(src_root.clone()))?;
	let dst_root_path = dst_root
		.spid_path()
		.ok_or_else(|| DiffError::Unreachable(dst_root.clone()))?;
	let relative = src_path.strip_prefix(src_root_path).unwrap_or(src_path);
	let mirrored = dst_root_path.join(relative);
	Ok(NodeIdentifier {
		device_uid: dst_root.device_uid,
		uid: 0,
		paths: vec![mirrored],
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::node::{LocalFile, Signature};
	use std::path::PathBuf;

	fn file(device_uid: DeviceUid, uid: u64, path: &str, md5: &str, mtime_ms: i64) -> Node {
		Node::LocalFile(LocalFile {
			identifier: NodeIdentifier::single(device_uid, uid, PathBuf::from(path)),
			size: 10,
			mtime_ms,
			ctime_ms: mtime_ms,
			signature: Signature {
				md5: Some(md5.to_string()),
				sha256: Some(format!("sha-{md5}")),
			},
			trashed: false,
		})
	}

	fn snapshot(device_uid: DeviceUid, root: &str, files: Vec<Node>) -> SubtreeSnapshot {
		SubtreeSnapshot {
			root: NodeIdentifier::single(device_uid, 1, PathBuf::from(root)),
			files,
			dirs: Vec::new(),
		}
	}

	#[test]
	fn identical_trees_produce_no_ops() {
		let left = snapshot(1, "/left", vec![file(1, 10, "/left/a.txt", "abc", 100)]);
		let right = snapshot(2, "/right", vec![file(2, 20, "/right/a.txt", "abc", 100)]);
		let tree = diff(&left, &right, DiffOptions::default()).unwrap();
		assert!(tree.all_ops().is_empty());
	}

	#[test]
	fn file_only_on_left_is_copied_right() {
		let left = snapshot(1, "/left", vec![file(1, 10, "/left/a.txt", "abc", 100)]);
		let right = snapshot(2, "/right", vec![]);
		let tree = diff(&left, &right, DiffOptions::default()).unwrap();
		let ops = tree.all_ops();
		assert_eq!(ops.len(), 1);
		assert_eq!(ops[0].op_type, OpType::Cp);
	}

	#[test]
	fn rename_as_move_detected_by_md5() {
		let left = snapshot(1, "/left", vec![file(1, 10, "/left/old.txt", "abc", 50)]);
		let right = snapshot(2, "/right", vec![file(2, 20, "/right/new.txt", "abc", 100)]);
		let tree = diff(&left, &right, DiffOptions::default()).unwrap();
		let ops = tree.all_ops();
		assert_eq!(ops.len(), 1);
		assert_eq!(ops[0].op_type, OpType::Mv);
	}

	#[test]
	fn rename_with_equal_mtime_still_produces_a_move() {
		let left = snapshot(1, "/left", vec![file(1, 10, "/left/old.txt", "abc", 100)]);
		let right = snapshot(2, "/right", vec![file(2, 20, "/right/new.txt", "abc", 100)]);
		let tree = diff(&left, &right, DiffOptions::default()).unwrap();
		let ops = tree.all_ops();
		assert_eq!(ops.len(), 1, "a same-content rename must not be silently dropped just because mtimes tie");
		assert_eq!(ops[0].op_type, OpType::Mv);
	}

	#[test]
	fn content_conflict_updates_older_side() {
		let left = snapshot(1, "/left", vec![file(1, 10, "/left/a.txt", "old", 50)]);
		let right = snapshot(2, "/right", vec![file(2, 20, "/right/a.txt", "new", 100)]);
		let tree = diff(&left, &right, DiffOptions::default()).unwrap();
		let ops = tree.all_ops();
		assert_eq!(ops.len(), 1);
		assert_eq!(ops[0].op_type, OpType::Up);
	}
}
