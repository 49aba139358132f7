//! Configuration KV store: `<config_dir>/config.json` with a `transient.*`
//! namespace for machine-written values (UID watermark, last tree roots,
//! UI expansion state) and non-transient keys for user preferences.
//!
//! A JSON-on-disk `AppConfig`, carrying an explicit `transient` sub-map
//! instead of dedicated fields per machine-written value, since this crate
//! has no UI layer to own expansion-state fields of its own.

mod app_config;

pub use app_config::{AppConfig, TransientState};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::Uid;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config: {0}")]
	Read(#[from] std::io::Error),
	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_json::Error),
}

/// Owns the on-disk `config.json` and serializes writes through an
/// in-memory copy so readers never block on disk I/O.
pub struct ConfigStore {
	path: PathBuf,
	state: RwLock<AppConfig>,
}

impl ConfigStore {
	pub async fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
		fs::create_dir_all(config_dir).await?;
		let path = config_dir.join("config.json");
		let config = match fs::read(&path).await {
			Ok(bytes) => serde_json::from_slice(&bytes)?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				info!(?path, "no config found, creating default");
				AppConfig::default()
			}
			Err(e) => return Err(e.into()),
		};
		let store = Self {
			path,
			state: RwLock::new(config),
		};
		store.persist().await?;
		Ok(store)
	}

	async fn persist(&self) -> Result<(), ConfigError> {
		let snapshot = self.state.read().await.clone();
		let json = serde_json::to_vec_pretty(&snapshot)?;
		fs::write(&self.path, json).await?;
		Ok(())
	}

	pub async fn get_uid_watermark(&self) -> Uid {
		self.state.read().await.transient.uid_watermark
	}

	pub async fn set_uid_watermark(&self, value: Uid) -> Result<(), ConfigError> {
		{
			let mut state = self.state.write().await;
			if value <= state.transient.uid_watermark {
				warn!(
					value,
					current = state.transient.uid_watermark,
					"ignoring non-increasing watermark write"
				);
				return Ok(());
			}
			state.transient.uid_watermark = value;
		}
		self.persist().await
	}

	pub async fn get_last_tree_roots(&self) -> Vec<PathBuf> {
		self.state.read().await.transient.last_tree_roots.clone()
	}

	pub async fn set_last_tree_roots(&self, roots: Vec<PathBuf>) -> Result<(), ConfigError> {
		self.state.write().await.transient.last_tree_roots = roots;
		self.persist().await
	}

	pub async fn snapshot(&self) -> AppConfig {
		self.state.read().await.clone()
	}
}

pub type SharedConfigStore = Arc<ConfigStore>;
