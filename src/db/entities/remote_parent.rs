//! `remote_parents` — many-to-many edge between a remote node and each of
//! its parent directories.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "remote_parents")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	#[sea_orm(indexed)]
	pub child_uid: i64,
	#[sea_orm(indexed)]
	pub parent_uid: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
	#[sea_orm(
		belongs_to = "super::remote_node::Entity",
		from = "Column::ChildUid",
		to = "super::remote_node::Column::Uid"
	)]
	RemoteNode,
}

impl ActiveModelBehavior for ActiveModel {}
