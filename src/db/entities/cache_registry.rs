//! One row per indexed subtree — the on-disk projection of `CacheInfoEntry`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cache_registry")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	#[sea_orm(indexed)]
	pub device_uid: i64,
	pub subtree_root_uid: i64,
	pub subtree_root_path: String,
	pub cache_location: String,
	pub last_sync_ts: DateTimeUtc,
	pub is_complete: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
