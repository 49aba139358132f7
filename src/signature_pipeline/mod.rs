//! Signature Pipeline: a single background worker that fills in content
//! hashes for files the walker left unhashed.
//!
//! Uses `async_channel` for its runner's message queue (a cheap unbounded
//! FIFO, no backpressure needed since the producer side is just event
//! fan-out), with a settling delay before acting on filesystem events, so
//! a burst of upserts at startup doesn't immediately saturate the hasher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::domain::{DeviceUid, Node, Uid};
use crate::events::{Event, EventBus};
use crate::hash;
use crate::tree_store::TreeStore;

/// Default settling delay before the worker starts draining its queue —
/// gives a just-started walk time to finish its initial burst of upserts.
const DEFAULT_SETTLING_DELAY: Duration = Duration::from_millis(500);

pub struct SignaturePipeline {
	events: Arc<EventBus>,
	stores: HashMap<DeviceUid, Arc<dyn TreeStore>>,
	settling_delay: Duration,
	queue_tx: async_channel::Sender<(DeviceUid, Uid)>,
	queue_rx: async_channel::Receiver<(DeviceUid, Uid)>,
}

impl SignaturePipeline {
	pub fn new(events: Arc<EventBus>, stores: Vec<Arc<dyn TreeStore>>, settling_delay: Duration) -> Self {
		let (queue_tx, queue_rx) = async_channel::unbounded();
		Self {
			events,
			stores: stores.into_iter().map(|s| (s.device_uid(), s)).collect(),
			settling_delay,
			queue_tx,
			queue_rx,
		}
	}

	pub fn with_default_settling_delay(events: Arc<EventBus>, stores: Vec<Arc<dyn TreeStore>>) -> Self {
		Self::new(events, stores, DEFAULT_SETTLING_DELAY)
	}

	/// Runs forever: sleeps out the settling delay, then subscribes to the
	/// event bus (a separate task forwards matching events into the FIFO)
	/// while this task drains the FIFO one node at a time. Intended to be
	/// spawned once per process and left running; cancel by dropping the
	/// task handle.
	pub async fn run(self: Arc<Self>) {
		tokio::time::sleep(self.settling_delay).await;

		let forwarder = {
			let pipeline = self.clone();
			let receiver = pipeline.events.subscribe();
			tokio::spawn(async move { pipeline.forward_events(receiver).await })
		};

		while let Ok((device_uid, uid)) = self.queue_rx.recv().await {
			self.process(device_uid, uid).await;
		}

		forwarder.abort();
	}

	/// Filters the broadcast stream down to upserts that plausibly need a
	/// hash and pushes their `(device_uid, uid)` onto the FIFO. The actual
	/// "does it still need one" check happens in `process`, once it's this
	/// node's turn — an event only tells us a node changed, not its current
	/// signature state.
	async fn forward_events(&self, mut receiver: broadcast::Receiver<Event>) {
		loop {
			match receiver.recv().await {
				Ok(Event::NodeUpsertedInCache { device_uid, uid, .. }) => {
					if self.queue_tx.send((device_uid, uid)).await.is_err() {
						return;
					}
				}
				Ok(_) => continue,
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					warn!(skipped, "signature pipeline lagged behind the event bus");
					continue;
				}
				Err(broadcast::error::RecvError::Closed) => return,
			}
		}
	}

	#[instrument(skip(self))]
	async fn process(&self, device_uid: DeviceUid, uid: Uid) {
		let Some(store) = self.stores.get(&device_uid) else {
			return;
		};
		let node = match store.get_node_for_uid(uid).await {
			Ok(Some(node)) => node,
			Ok(None) => return,
			Err(e) => {
				warn!(%e, device_uid, uid, "failed to re-read node before hashing");
				return;
			}
		};
		// Re-check: another writer (or an earlier dequeue of the same uid)
		// may have already filled this node's signature.
		if !node.needs_signature() {
			return;
		}
		let Some(path) = node.single_path().cloned() else {
			return;
		};

		let signature = hash::hash(&path).await;
		if signature.is_empty() {
			debug!(device_uid, uid, "hash came back empty, file likely vanished mid-scan");
			return;
		}

		// Deep copy, never mutate in place: a concurrent write to the same
		// uid would be silently lost if we held a reference into the live
		// cache instead.
		let mut updated = node;
		if let Node::LocalFile(f) = &mut updated {
			f.signature = signature;
		} else {
			return;
		}

		if let Err(e) = store.update_single_node(updated).await {
			warn!(%e, device_uid, uid, "failed to persist computed signature");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConfigStore;
	use crate::db::Database;
	use crate::domain::{LocalFile, NodeIdentifier, Signature};
	use crate::identity::PathMapper;
	use crate::tree_store::local::LocalTreeStore;
	use crate::uid::UidAllocator;
	use std::time::Duration as StdDuration;
	use tempfile::tempdir;
	use tokio::io::AsyncWriteExt;

	const LOCAL_DEVICE: DeviceUid = 1;

	async fn harness() -> (Arc<LocalTreeStore>, Arc<EventBus>, std::path::PathBuf, tempfile::TempDir) {
		let dir = tempdir().unwrap();
		let db = Arc::new(Database::create(&dir.path().join("coresync.db")).await.unwrap());
		db.migrate().await.unwrap();
		let events = Arc::new(EventBus::default());
		let path_mapper = Arc::new(PathMapper::load(db.clone()).await.unwrap());
		let config = Arc::new(ConfigStore::load_or_create(&dir.path().join("config")).await.unwrap());
		let uid_alloc = Arc::new(UidAllocator::load(config).await.unwrap());
		let local_store = Arc::new(LocalTreeStore::new(LOCAL_DEVICE, db, uid_alloc, path_mapper, events.clone()));
		let root = dir.path().join("root");
		tokio::fs::create_dir_all(&root).await.unwrap();
		(local_store, events, root, dir)
	}

	#[tokio::test]
	async fn fills_in_hash_for_upserted_file_missing_a_signature() {
		let (store, events, root, _dir) = harness().await;
		let file_path = root.join("doc.txt");
		let mut f = tokio::fs::File::create(&file_path).await.unwrap();
		f.write_all(b"content").await.unwrap();
		f.flush().await.unwrap();

		let identifier = NodeIdentifier::single(LOCAL_DEVICE, 77, file_path.clone());
		store
			.upsert_single_node(Node::LocalFile(LocalFile {
				identifier,
				size: 7,
				mtime_ms: 0,
				ctime_ms: 0,
				signature: Signature::default(),
				trashed: false,
			}))
			.await
			.unwrap();

		let pipeline = Arc::new(SignaturePipeline::new(
			events,
			vec![store.clone()],
			StdDuration::from_millis(1),
		));
		let handle = tokio::spawn(pipeline.run());

		let deadline = tokio::time::Instant::now() + StdDuration::from_secs(2);
		loop {
			let node = store.get_node_for_uid(77).await.unwrap().unwrap();
			if !node.needs_signature() {
				break;
			}
			assert!(tokio::time::Instant::now() < deadline, "signature was never filled in");
			tokio::time::sleep(StdDuration::from_millis(20)).await;
		}
		handle.abort();

		let node = store.get_node_for_uid(77).await.unwrap().unwrap();
		assert!(node.md5().is_some());
	}

	#[tokio::test]
	async fn vanished_file_is_dropped_without_a_signature() {
		let (store, events, root, _dir) = harness().await;
		let file_path = root.join("gone.txt");
		// never created on disk

		let identifier = NodeIdentifier::single(LOCAL_DEVICE, 88, file_path);
		store
			.upsert_single_node(Node::LocalFile(LocalFile {
				identifier,
				size: 0,
				mtime_ms: 0,
				ctime_ms: 0,
				signature: Signature::default(),
				trashed: false,
			}))
			.await
			.unwrap();

		let pipeline = Arc::new(SignaturePipeline::new(events, vec![store.clone()], StdDuration::from_millis(1)));
		pipeline.process(LOCAL_DEVICE, 88).await;

		let node = store.get_node_for_uid(88).await.unwrap().unwrap();
		assert!(node.needs_signature(), "a vanished file must not end up with a fabricated signature");
	}
}
