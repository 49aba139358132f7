//! Typed event bus for decoupled communication between components.
//!
//! A `broadcast`-backed `EventBus`, constructor-injected (`Arc<EventBus>`
//! passed to whatever needs it) rather than reached via a thread-local or
//! global singleton, so tests can spin up an isolated bus per case.

use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::domain::{DeviceUid, Uid};

#[derive(Debug, Clone)]
pub enum Event {
	NodeUpsertedInCache {
		device_uid: DeviceUid,
		uid: Uid,
		path: Option<PathBuf>,
	},
	NodeRemovedFromCache {
		device_uid: DeviceUid,
		uid: Uid,
	},
	CommandComplete {
		op_uid: uuid::Uuid,
		succeeded: bool,
	},
}

/// Broadcast bus: every subscriber gets every event, as `domain` events
/// here are cheap and consumers are few (signature pipeline, op graph,
/// cache manager's display-tree registry).
pub struct EventBus {
	sender: broadcast::Sender<Event>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	pub fn emit(&self, event: Event) {
		let _ = self.sender.send(event);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.sender.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1024)
	}
}
