//! Database infrastructure: a thin typed layer over an embedded relational
//! engine, one store per logical table.
//!
//! SQLite with WAL-friendly PRAGMA tuning and a `sea_orm_migration`-per-
//! concern layout.

pub mod entities;
pub mod migration;

use std::path::Path;
use std::time::Duration;

use sea_orm::{
	ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database as SeaDatabase,
	DatabaseConnection, DbErr, EntityTrait, QueryFilter, Statement, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use thiserror::Error;
use tracing::info;

use crate::error::{Classify, ErrorClass};

#[derive(Debug, Error)]
pub enum DbError {
	#[error("database error: {0}")]
	Orm(#[from] DbErr),
	#[error("failed to create database directory: {0}")]
	Io(#[from] std::io::Error),
}

impl Classify for DbError {
	fn class(&self) -> ErrorClass {
		match self {
			Self::Orm(_) => ErrorClass::Transient,
			Self::Io(_) => ErrorClass::Permanent,
		}
	}
}

/// Owns one SQLite file; all eight logical stores share this single
/// physical database, with table-level rather than file-level separation
/// between them.
pub struct Database {
	conn: DatabaseConnection,
	path: std::path::PathBuf,
}

impl Database {
	pub async fn create(path: &Path) -> Result<Self, DbError> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let db_url = format!("sqlite://{}?mode=rwc", path.display());
		let conn = Self::connect(db_url).await?;
		info!(?path, "created database");
		Ok(Self {
			conn,
			path: path.to_path_buf(),
		})
	}

	pub async fn open(path: &Path) -> Result<Self, DbError> {
		if !path.exists() {
			return Err(DbError::Orm(DbErr::Custom(format!(
				"database does not exist: {}",
				path.display()
			))));
		}
		let db_url = format!("sqlite://{}", path.display());
		let conn = Self::connect(db_url).await?;
		info!(?path, "opened database");
		Ok(Self {
			conn,
			path: path.to_path_buf(),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	async fn connect(db_url: String) -> Result<DatabaseConnection, DbError> {
		let mut opt = ConnectOptions::new(db_url);
		opt.max_connections(10)
			.min_connections(1)
			.connect_timeout(Duration::from_secs(8))
			.idle_timeout(Duration::from_secs(8))
			.max_lifetime(Duration::from_secs(60))
			.sqlx_logging(false);

		let conn = SeaDatabase::connect(opt).await?;
		for pragma in [
			"PRAGMA journal_mode=WAL",
			"PRAGMA synchronous=NORMAL",
			"PRAGMA temp_store=MEMORY",
			"PRAGMA cache_size=-20000",
			"PRAGMA mmap_size=67108864",
		] {
			conn.execute(Statement::from_string(sea_orm::DatabaseBackend::Sqlite, pragma))
				.await
				.ok();
		}
		Ok(conn)
	}

	pub async fn migrate(&self) -> Result<(), DbError> {
		migration::Migrator::up(&self.conn, None).await?;
		info!("database migrations completed");
		Ok(())
	}

	pub fn conn(&self) -> &DatabaseConnection {
		&self.conn
	}

	/// Batched, transactional insert.
	pub async fn insert_many<A>(&self, models: Vec<A>) -> Result<(), DbError>
	where
		A: ActiveModelTrait + Send,
		A::Entity: EntityTrait,
	{
		if models.is_empty() {
			return Ok(());
		}
		let txn = self.conn.begin().await?;
		for model in models {
			model.insert(&txn).await?;
		}
		txn.commit().await?;
		Ok(())
	}

	/// Used only during full-refresh or schema migration.
	pub async fn drop_table_if_exists<E: EntityTrait>(&self, entity: E) -> Result<(), DbError> {
		use sea_orm::sea_query::TableRef;
		let table_ref: TableRef = entity.table_name().into();
		self.conn
			.execute(Statement::from_string(
				sea_orm::DatabaseBackend::Sqlite,
				format!("DROP TABLE IF EXISTS {table_ref}"),
			))
			.await?;
		Ok(())
	}

	pub async fn truncate<E: EntityTrait>(&self, entity: E) -> Result<(), DbError> {
		self.conn
			.execute(Statement::from_string(
				sea_orm::DatabaseBackend::Sqlite,
				format!("DELETE FROM {}", entity.table_name()),
			))
			.await?;
		Ok(())
	}

	pub async fn has_rows<E>(&self, entity: E) -> Result<bool, DbError>
	where
		E: EntityTrait,
	{
		Ok(entity.find().one(&self.conn).await?.is_some())
	}
}

// re-exported so call sites can filter without importing sea_orm directly
pub use sea_orm::Condition;

#[allow(unused_imports)]
use ColumnTrait as _;
#[allow(unused_imports)]
use QueryFilter as _;
