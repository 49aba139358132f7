//! On-disk shape of `config.json`.
//!
//! A version-stamped document holding both user-editable preferences and a
//! nested `transient` block for values this process itself writes back
//! (UID watermark, last opened tree roots). There is no
//! version-migration-on-load step here yet — `schema_version` is carried so
//! one can be added without a breaking format change later.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::Uid;

const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransientState {
	#[serde(default)]
	pub uid_watermark: Uid,
	#[serde(default)]
	pub last_tree_roots: Vec<PathBuf>,
}

impl Default for TransientState {
	fn default() -> Self {
		Self {
			uid_watermark: crate::domain::ROOT_UID,
			last_tree_roots: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
	#[serde(default = "default_schema_version")]
	pub schema_version: u32,
	#[serde(default)]
	pub transient: TransientState,
}

fn default_schema_version() -> u32 {
	CURRENT_SCHEMA_VERSION
}

impl Default for AppConfig {
	fn default() -> Self {
		Self {
			schema_version: CURRENT_SCHEMA_VERSION,
			transient: TransientState::default(),
		}
	}
}
