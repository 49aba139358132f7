//! UID Allocator — hands out UIDs unique across process restarts,
//! reserving a watermark block at a time in the config KV store.
//!
//! A single JSON-on-disk document (`AppConfig`) carries both user
//! preferences and machine-written state; the watermark lives in its
//! `transient.uid_watermark` field (see `config::app_config`), persisted
//! synchronously on every block rollover.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::config::ConfigStore;
use crate::error::{Classify, ErrorClass};

use crate::domain::Uid;

/// How many UIDs are reserved (written to disk) per watermark advance.
const RESERVATION_BLOCK: u64 = 1024;

#[derive(Debug, Error)]
pub enum UidError {
	#[error("failed to persist uid watermark: {0}")]
	Persist(#[from] crate::config::ConfigError),
	#[error("uid space exhausted near u64::MAX")]
	Exhausted,
}

impl Classify for UidError {
	fn class(&self) -> ErrorClass {
		match self {
			Self::Persist(_) => ErrorClass::Transient,
			Self::Exhausted => ErrorClass::Invariant,
		}
	}
}

struct AllocatorState {
	value: Uid,
	watermark: Uid,
}

/// Issues UIDs strictly greater than any previously issued, even across a
/// crash between issuance and use — because the watermark is always well
/// ahead of `value`, never behind it.
pub struct UidAllocator {
	config: Arc<ConfigStore>,
	state: Mutex<AllocatorState>,
}

impl UidAllocator {
	/// Loads the persisted watermark and sets `value = watermark + 1`.
	pub async fn load(config: Arc<ConfigStore>) -> Result<Self, UidError> {
		let watermark = config.get_uid_watermark().await;
		Ok(Self {
			config,
			state: Mutex::new(AllocatorState {
				value: watermark + 1,
				watermark,
			}),
		})
	}

	/// Returns a fresh UID strictly greater than any previously issued.
	///
	/// If persistence fails, the allocator fails closed: no UID is returned
	/// and `value` is not advanced, so a retry issues the same UID again.
	#[instrument(skip(self))]
	pub async fn next(&self) -> Result<Uid, UidError> {
		let mut state = self.state.lock().await;
		if state.value >= state.watermark {
			let new_watermark = state
				.watermark
				.checked_add(RESERVATION_BLOCK)
				.ok_or(UidError::Exhausted)?;
			self.config.set_uid_watermark(new_watermark).await?;
			debug!(new_watermark, "advanced uid watermark");
			state.watermark = new_watermark;
		}
		let issued = state.value;
		state.value = state
			.value
			.checked_add(1)
			.ok_or(UidError::Exhausted)?;
		Ok(issued)
	}

	/// Advances the counter so the next issue is >= n + 1. Used when
	/// replaying UIDs suggested by a disk-backed mapper during startup.
	pub async fn ensure_at_least(&self, n: Uid) -> Result<(), UidError> {
		let mut state = self.state.lock().await;
		if n < state.value {
			return Ok(());
		}
		let target = n + 1;
		if target > state.watermark {
			let new_watermark = target
				.checked_add(RESERVATION_BLOCK - 1)
				.unwrap_or(u64::MAX);
			self.config.set_uid_watermark(new_watermark).await?;
			state.watermark = new_watermark;
		}
		state.value = target;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConfigStore;
	use tempfile::tempdir;

	async fn fresh_allocator() -> (UidAllocator, tempfile::TempDir) {
		let dir = tempdir().unwrap();
		let config = Arc::new(ConfigStore::load_or_create(dir.path()).await.unwrap());
		(UidAllocator::load(config).await.unwrap(), dir)
	}

	#[tokio::test]
	async fn issues_strictly_increasing_uids() {
		let (alloc, _dir) = fresh_allocator().await;
		let a = alloc.next().await.unwrap();
		let b = alloc.next().await.unwrap();
		assert!(b > a);
	}

	#[tokio::test]
	async fn restart_never_reissues() {
		let dir = tempdir().unwrap();
		let config = Arc::new(ConfigStore::load_or_create(dir.path()).await.unwrap());
		let alloc = UidAllocator::load(config.clone()).await.unwrap();
		let last = {
			let mut v = 0;
			for _ in 0..5 {
				v = alloc.next().await.unwrap();
			}
			v
		};
		drop(alloc);

		// Simulate a process restart against the same config store.
		let restarted = UidAllocator::load(config).await.unwrap();
		let next = restarted.next().await.unwrap();
		assert!(next > last);
	}

	#[tokio::test]
	async fn ensure_at_least_advances_past_suggestion() {
		let (alloc, _dir) = fresh_allocator().await;
		alloc.ensure_at_least(5_000).await.unwrap();
		let next = alloc.next().await.unwrap();
		assert!(next > 5_000);
	}
}
