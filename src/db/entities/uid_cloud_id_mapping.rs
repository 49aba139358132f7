//! Persisted backing store for `identity::CloudIdMapper`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "uid_cloud_id_mapping")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub cloud_id: String,
	#[sea_orm(indexed)]
	pub device_uid: i64,
	#[sea_orm(indexed)]
	pub uid: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
