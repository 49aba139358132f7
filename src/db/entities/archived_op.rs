//! `archived_ops` — a `pending_ops` row plus an archival reason, written
//! when an operation reaches a terminal status and is retired from the
//! active queue.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pending_op::{OpStatusColumn, OpTypeColumn};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "archived_ops")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub op_uid: Uuid,
	pub batch_uid: Uuid,
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
	pub status: OpStatusColumn,
	pub recursive: bool,
	pub to_trash: bool,
	pub archived_ts: DateTimeUtc,
	pub archival_reason: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
