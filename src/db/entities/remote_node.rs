//! `remote_nodes` — the on-disk projection of `domain::node::RemoteFile` and
//! `RemoteDir`. Parent edges live in a separate many-to-many table,
//! `remote_parent`, since a cloud object can have multiple parents.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "remote_nodes")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub uid: i64,
	#[sea_orm(indexed)]
	pub device_uid: i64,
	#[sea_orm(indexed, unique)]
	pub cloud_id: String,
	pub is_dir: bool,
	pub size: i64,
	pub mtime_ms: i64,
	pub ctime_ms: i64,
	pub md5: Option<String>,
	pub owner: Option<String>,
	pub version: i64,
	pub head_revision: Option<String>,
	pub my_drive: bool,
	pub shared: bool,
	pub trashed: bool,
	pub children_complete: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
	#[sea_orm(has_many = "super::remote_parent::Entity")]
	RemoteParent,
}

impl Related<super::remote_parent::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::RemoteParent.def()
	}
}

impl ActiveModelBehavior for ActiveModel {}
