//! `pending_ops` — persisted `domain::op::UserOp`s tracked by the Operation
//! Graph. Completed rows move to `archived_ops` (see that module) rather
//! than being deleted, so a post-mortem can always find what ran.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum OpTypeColumn {
	#[sea_orm(string_value = "MKDIR")]
	Mkdir,
	#[sea_orm(string_value = "CP")]
	Cp,
	#[sea_orm(string_value = "MV")]
	Mv,
	#[sea_orm(string_value = "RM")]
	Rm,
	#[sea_orm(string_value = "UP")]
	Up,
}

#[derive(Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum OpStatusColumn {
	#[sea_orm(string_value = "pending")]
	Pending,
	#[sea_orm(string_value = "executing")]
	Executing,
	#[sea_orm(string_value = "completed")]
	Completed,
	#[sea_orm(string_value = "failed")]
	Failed,
	#[sea_orm(string_value = "cancelled")]
	Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pending_ops")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub op_uid: Uuid,
	#[sea_orm(indexed)]
	pub batch_uid: Uuid,
	/// Parent node in the operation forest, if any (see op_graph).
	#[sea_orm(indexed, nullable)]
	pub parent_op_uid: Option<Uuid>,
	pub op_type: OpTypeColumn,
	pub src_device_uid: i64,
	pub src_uid: i64,
	#[sea_orm(column_type = "Json")]
	pub src_paths: Json,
	pub dst_device_uid: Option<i64>,
	pub dst_uid: Option<i64>,
	#[sea_orm(column_type = "Json", nullable)]
	pub dst_paths: Option<Json>,
	pub create_ts: DateTimeUtc,
	#[sea_orm(indexed)]
	pub status: OpStatusColumn,
	pub recursive: bool,
	pub to_trash: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
