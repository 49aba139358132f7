//! `CacheInfoEntry` — one row per on-disk cached subtree.

use chrono::{DateTime, Utc};
use std::path::PathBuf;

use super::identifier::NodeIdentifier;

#[derive(Debug, Clone)]
pub struct CacheInfoEntry {
	pub cache_location: PathBuf,
	pub subtree_root_identifier: NodeIdentifier,
	pub last_sync_ts: DateTime<Utc>,
	/// True iff the on-disk rows constitute a full cover of the subtree at
	/// `last_sync_ts` — false after a permission-denied walk, for instance.
	pub is_complete: bool,
}
