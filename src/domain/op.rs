//! `UserOp` — a pending mutation produced by the Diff Engine or direct user
//! action and tracked through the Operation Graph.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::identifier::NodeIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
	Mkdir,
	Cp,
	Mv,
	Rm,
	Up,
}

impl OpType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Mkdir => "MKDIR",
			Self::Cp => "CP",
			Self::Mv => "MV",
			Self::Rm => "RM",
			Self::Up => "UP",
		}
	}

	/// Whether this op type has a distinct destination side (CP/MV/UP), as
	/// opposed to acting on the source node alone (MKDIR/RM).
	pub fn has_dst(self) -> bool {
		matches!(self, Self::Cp | Self::Mv | Self::Up)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
	Pending,
	Executing,
	Completed,
	Failed,
	Cancelled,
}

impl OpStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
	}
}

#[derive(Debug, Clone)]
pub struct UserOp {
	pub op_uid: Uuid,
	pub batch_uid: Uuid,
	pub op_type: OpType,
	pub src_node: NodeIdentifier,
	pub dst_node: Option<NodeIdentifier>,
	pub create_ts: DateTime<Utc>,
	pub status: OpStatus,
	/// `RM` only: refuse to remove a non-empty directory unless set.
	pub recursive: bool,
	/// `RM` only: trash (recoverable) vs. permanently unlink/delete.
	pub to_trash: bool,
}

impl UserOp {
	/// Diff-engine-generated ops (CP/MV/UP) never target a whole directory
	/// and default `RM` to a recoverable trash rather than a hard delete.
	pub fn new_in_batch(
		batch_uid: Uuid,
		op_type: OpType,
		src_node: NodeIdentifier,
		dst_node: Option<NodeIdentifier>,
	) -> Self {
		Self {
			op_uid: Uuid::new_v4(),
			batch_uid,
			op_type,
			src_node,
			dst_node,
			create_ts: Utc::now(),
			status: OpStatus::Pending,
			recursive: false,
			to_trash: true,
		}
	}

	/// Explicit `RM`, allowing the caller (e.g. a user-issued directory
	/// delete) to set `recursive`/`to_trash` rather than take the
	/// diff-engine defaults.
	pub fn new_rm(batch_uid: Uuid, src_node: NodeIdentifier, recursive: bool, to_trash: bool) -> Self {
		Self {
			recursive,
			to_trash,
			..Self::new_in_batch(batch_uid, OpType::Rm, src_node, None)
		}
	}
}
