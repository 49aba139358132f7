//! `local_nodes` — the on-disk projection of `domain::node::LocalFile` and
//! `LocalDir`. `is_dir` distinguishes the two since they share a table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "local_nodes")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub uid: i64,
	#[sea_orm(indexed)]
	pub device_uid: i64,
	#[sea_orm(indexed, unique)]
	pub path: String,
	pub is_dir: bool,
	pub size: i64,
	pub mtime_ms: i64,
	pub ctime_ms: i64,
	pub md5: Option<String>,
	pub sha256: Option<String>,
	pub file_count: i64,
	pub dir_count: i64,
	pub trashed: bool,
	pub sync_ts: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
