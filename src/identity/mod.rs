//! Identifier Mappers: bidirectional `path <-> UID` and `cloud_id <-> UID`
//! tables with idempotent, suggestion-accepting lookup.
//!
//! A `RwLock<HashMap<_, _>>` state container rather than a `DashMap` —
//! reads vastly outnumber writes here (every diff/lookup reads, only
//! first-sight inserts write), so a single `RwLock` per table is the
//! right-sized primitive. Each table writes through to `uid_path_mapping` /
//! `uid_cloud_id_mapping` on first sight and replays those rows on `load`,
//! so a restart never reissues a UID for a path or cloud object it has
//! already seen — `get_uid_for_path(p)` stays constant for a given `p`
//! across process restarts, not just within one run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use crate::db::entities::{uid_cloud_id_mapping, uid_path_mapping};
use crate::db::Database;
use crate::domain::{Uid, NULL_UID, ROOT_UID};
use crate::error::{Classify, ErrorClass};

#[derive(Debug, Error)]
pub enum MapperError {
	#[error(transparent)]
	Db(#[from] crate::db::DbError),
}

impl Classify for MapperError {
	fn class(&self) -> ErrorClass {
		match self {
			Self::Db(e) => e.class(),
		}
	}
}

/// `path -> UID`, append-only for the lifetime of the process: once a path
/// is mapped, it keeps its UID for as long as the root stays indexed.
pub struct PathMapper {
	db: Arc<Database>,
	forward: RwLock<HashMap<PathBuf, Uid>>,
}

impl PathMapper {
	/// Loads every previously-seen `path -> UID` row from disk so a
	/// restart resumes the same mapping instead of minting fresh UIDs.
	pub async fn load(db: Arc<Database>) -> Result<Self, MapperError> {
		let mut forward = HashMap::new();
		forward.insert(PathBuf::from("/"), ROOT_UID);
		let rows = uid_path_mapping::Entity::find().all(db.conn()).await.map_err(crate::db::DbError::from)?;
		for row in rows {
			forward.insert(PathBuf::from(row.path), row.uid as Uid);
		}
		Ok(Self {
			db,
			forward: RwLock::new(forward),
		})
	}

	pub async fn get(&self, path: &Path) -> Result<Option<Uid>, MapperError> {
		Ok(self.forward.read().await.get(path).copied())
	}

	/// Looks up `path`, accepting `suggestion` as its UID if the path has
	/// never been seen before. If the path is already mapped, the stored
	/// UID wins and a warning is logged when it disagrees with `suggestion`.
	/// A first-sight insert is written through to disk before returning.
	pub async fn get_or_insert(&self, path: &Path, suggestion: Uid, device_uid: Uid) -> Result<Uid, MapperError> {
		{
			let map = self.forward.read().await;
			if let Some(existing) = map.get(path) {
				if suggestion != NULL_UID && *existing != suggestion {
					warn!(
						?path,
						existing,
						suggestion,
						"suggested uid disagrees with stored mapping, keeping stored uid"
					);
				}
				return Ok(*existing);
			}
		}
		let mut map = self.forward.write().await;
		if let Some(existing) = map.get(path) {
			// Lost the race between the read above and taking the write lock.
			return Ok(*existing);
		}
		map.insert(path.to_path_buf(), suggestion);
		drop(map);

		let am = uid_path_mapping::ActiveModel {
			path: Set(path.to_string_lossy().to_string()),
			device_uid: Set(device_uid as i64),
			uid: Set(suggestion as i64),
		};
		am.insert(self.db.conn()).await.map_err(crate::db::DbError::from)?;
		Ok(suggestion)
	}

	pub async fn len(&self) -> usize {
		self.forward.read().await.len()
	}
}

/// `cloud_id -> UID` plus its inverse, guarded by one lock so the pair never
/// drifts out of sync with each other.
pub struct CloudIdMapper {
	db: Arc<Database>,
	tables: RwLock<CloudIdTables>,
}

struct CloudIdTables {
	forward: HashMap<String, Uid>,
	inverse: HashMap<Uid, String>,
}

impl CloudIdMapper {
	pub async fn load(db: Arc<Database>) -> Result<Self, MapperError> {
		let rows = uid_cloud_id_mapping::Entity::find()
			.all(db.conn())
			.await
			.map_err(crate::db::DbError::from)?;
		let mut forward = HashMap::new();
		let mut inverse = HashMap::new();
		for row in rows {
			forward.insert(row.cloud_id.clone(), row.uid as Uid);
			inverse.insert(row.uid as Uid, row.cloud_id);
		}
		Ok(Self {
			db,
			tables: RwLock::new(CloudIdTables { forward, inverse }),
		})
	}

	pub async fn get(&self, cloud_id: &str) -> Result<Option<Uid>, MapperError> {
		Ok(self.tables.read().await.forward.get(cloud_id).copied())
	}

	pub async fn get_cloud_id(&self, uid: Uid) -> Result<Option<String>, MapperError> {
		Ok(self.tables.read().await.inverse.get(&uid).cloned())
	}

	/// Same suggestion semantics as `PathMapper::get_or_insert`: accepted on
	/// first sight, stored value wins thereafter, written through to disk.
	pub async fn get_or_insert(&self, cloud_id: &str, suggestion: Uid, device_uid: Uid) -> Result<Uid, MapperError> {
		{
			let tables = self.tables.read().await;
			if let Some(existing) = tables.forward.get(cloud_id) {
				if suggestion != NULL_UID && *existing != suggestion {
					warn!(
						cloud_id,
						existing,
						suggestion,
						"suggested uid disagrees with stored cloud-id mapping, keeping stored uid"
					);
				}
				return Ok(*existing);
			}
		}
		let mut tables = self.tables.write().await;
		if let Some(existing) = tables.forward.get(cloud_id) {
			return Ok(*existing);
		}
		tables.forward.insert(cloud_id.to_string(), suggestion);
		tables.inverse.insert(suggestion, cloud_id.to_string());
		drop(tables);

		let am = uid_cloud_id_mapping::ActiveModel {
			cloud_id: Set(cloud_id.to_string()),
			device_uid: Set(device_uid as i64),
			uid: Set(suggestion as i64),
		};
		am.insert(self.db.conn()).await.map_err(crate::db::DbError::from)?;
		Ok(suggestion)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	async fn fresh_db() -> (Arc<Database>, tempfile::TempDir) {
		let dir = tempdir().unwrap();
		let db = Database::create(&dir.path().join("mappers.db")).await.unwrap();
		db.migrate().await.unwrap();
		(Arc::new(db), dir)
	}

	#[tokio::test]
	async fn root_path_maps_to_root_uid() {
		let (db, _dir) = fresh_db().await;
		let mapper = PathMapper::load(db).await.unwrap();
		assert_eq!(mapper.get(Path::new("/")).await.unwrap(), Some(ROOT_UID));
	}

	#[tokio::test]
	async fn first_sight_suggestion_is_accepted() {
		let (db, _dir) = fresh_db().await;
		let mapper = PathMapper::load(db).await.unwrap();
		let uid = mapper.get_or_insert(Path::new("/a/b"), 42, 1).await.unwrap();
		assert_eq!(uid, 42);
	}

	#[tokio::test]
	async fn stored_uid_wins_over_later_suggestion() {
		let (db, _dir) = fresh_db().await;
		let mapper = PathMapper::load(db).await.unwrap();
		mapper.get_or_insert(Path::new("/a/b"), 42, 1).await.unwrap();
		let second = mapper.get_or_insert(Path::new("/a/b"), 99, 1).await.unwrap();
		assert_eq!(second, 42);
	}

	#[tokio::test]
	async fn mapping_survives_reload_from_disk() {
		let dir = tempdir().unwrap();
		let db_path = dir.path().join("mappers.db");
		let db = Arc::new(Database::create(&db_path).await.unwrap());
		db.migrate().await.unwrap();
		let mapper = PathMapper::load(db.clone()).await.unwrap();
		mapper.get_or_insert(Path::new("/a/b"), 42, 1).await.unwrap();
		drop(mapper);

		let reloaded = PathMapper::load(db).await.unwrap();
		assert_eq!(reloaded.get(Path::new("/a/b")).await.unwrap(), Some(42));
	}

	#[tokio::test]
	async fn cloud_id_mapper_tracks_inverse() {
		let (db, _dir) = fresh_db().await;
		let mapper = CloudIdMapper::load(db).await.unwrap();
		let uid = mapper.get_or_insert("drive-object-1", 7, 1).await.unwrap();
		assert_eq!(uid, 7);
		assert_eq!(mapper.get_cloud_id(7).await.unwrap().as_deref(), Some("drive-object-1"));
	}
}
