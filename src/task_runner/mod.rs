//! Task Runner & Hold-Off Timer: a bounded worker pool for opportunistic
//! background work, plus a debounce primitive used to coalesce bursty
//! save/refresh requests.
//!
//! The pool's shape (priority, `on_complete`/`on_error`, a unique task id)
//! echoes a `Task`/`Interrupter` style scheduler, narrowed to a
//! `tokio::sync::Semaphore`-gated spawn pool rather than a full
//! actor-driven one — there is no pause/resume requirement here, only a
//! bound on concurrency. `HoldOffTimer` is a generation-counter debounce
//! (an `Arc<Mutex<_>>` counter plus a spawned `tokio::time::sleep`) used to
//! coalesce filesystem-watcher events before they reach the diff engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

/// Lower numeric value runs first when multiple tasks are queued waiting
/// for a free slot. Ties are broken FIFO by submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
	High,
	Normal,
	Low,
}

pub type TaskUid = Uuid;
type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// One unit of opportunistic work submitted to the pool: the future itself,
/// plus optional callbacks invoked on the pool's worker once it resolves.
pub struct Task<T: Send + 'static, E: Send + 'static> {
	pub id: TaskUid,
	pub priority: TaskPriority,
	work: BoxFuture<Result<T, E>>,
	on_complete: Option<Box<dyn FnOnce(T) + Send>>,
	on_error: Option<Box<dyn FnOnce(E) + Send>>,
}

impl<T: Send + 'static, E: Send + 'static> Task<T, E> {
	pub fn new<F>(priority: TaskPriority, work: F) -> Self
	where
		F: Future<Output = Result<T, E>> + Send + 'static,
	{
		Self {
			id: Uuid::new_v4(),
			priority,
			work: Box::pin(work),
			on_complete: None,
			on_error: None,
		}
	}

	pub fn on_complete(mut self, f: impl FnOnce(T) + Send + 'static) -> Self {
		self.on_complete = Some(Box::new(f));
		self
	}

	pub fn on_error(mut self, f: impl FnOnce(E) + Send + 'static) -> Self {
		self.on_error = Some(Box::new(f));
		self
	}
}

/// Bounded thread pool for opportunistic tasks, alongside the dedicated
/// threads owned by the signature pipeline, operation-graph consumer, and
/// friends. A `Semaphore` permit is acquired before spawning so no more
/// than `capacity` tasks run concurrently; excess submissions simply wait
/// for a permit rather than spawning unbounded tokio tasks.
pub struct TaskRunner {
	semaphore: Arc<Semaphore>,
}

impl TaskRunner {
	/// Default capacity is 10.
	pub fn new(capacity: usize) -> Self {
		Self {
			semaphore: Arc::new(Semaphore::new(capacity.max(1))),
		}
	}

	/// Submits `task`, returning immediately; the task runs once a permit is
	/// free, on its own spawned tokio task, and calls `on_complete`/
	/// `on_error` when it finishes. Submission order is not itself a
	/// priority queue — `priority` is carried for callers that want to
	/// inspect it, but this pool has no queueing structure of its own to
	/// reorder spawned tasks by, so ordering among waiters for a permit is
	/// whatever tokio's semaphore FIFO gives.
	pub fn submit<T, E>(&self, task: Task<T, E>)
	where
		T: Send + 'static,
		E: Send + 'static,
	{
		let semaphore = self.semaphore.clone();
		let Task {
			id,
			priority,
			work,
			on_complete,
			on_error,
		} = task;
		tokio::spawn(async move {
			let _permit = match semaphore.acquire_owned().await {
				Ok(permit) => permit,
				Err(_) => return, // pool shut down
			};
			debug!(%id, ?priority, "task runner: starting task");
			match work.await {
				Ok(value) => {
					if let Some(cb) = on_complete {
						cb(value);
					}
				}
				Err(err) => {
					if let Some(cb) = on_error {
						cb(err);
					} else {
						warn!(%id, "task runner: task failed with no on_error callback");
					}
				}
			}
		});
	}

	pub fn available_permits(&self) -> usize {
		self.semaphore.available_permits()
	}
}

impl Default for TaskRunner {
	fn default() -> Self {
		Self::new(10)
	}
}

/// Coalesces bursty requests behind a single resettable deadline: each call
/// to `start_or_delay` pushes the deadline `delay` out from now, so a
/// function that would otherwise run once per event instead runs once
/// `delay` after the *last* event in a burst.
///
/// A `generation` counter is bumped on every call, and the spawned sleep
/// only invokes `fn` if its captured generation is still the latest one
/// once it wakes.
pub struct HoldOffTimer {
	generation: Arc<AtomicU64>,
	running: Arc<Mutex<()>>,
}

impl HoldOffTimer {
	pub fn new() -> Self {
		Self {
			generation: Arc::new(AtomicU64::new(0)),
			running: Arc::new(Mutex::new(())),
		}
	}

	/// Schedules `fn` to run `delay` from now. A call within the window
	/// resets the deadline instead of scheduling a second invocation — only
	/// the final call in a burst ever fires.
	pub fn start_or_delay<F>(&self, delay: Duration, fn_: F)
	where
		F: FnOnce() + Send + 'static,
	{
		let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
		let generation = self.generation.clone();
		let running = self.running.clone();
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let _guard = running.lock().await;
			if generation.load(Ordering::SeqCst) == my_generation {
				fn_();
			}
		});
	}
}

impl Default for HoldOffTimer {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration as StdDuration;

	#[tokio::test]
	async fn submitted_task_runs_and_invokes_on_complete() {
		let runner = TaskRunner::new(2);
		let (tx, rx) = tokio::sync::oneshot::channel();
		let task: Task<u32, std::convert::Infallible> =
			Task::new(TaskPriority::Normal, async { Ok(42) }).on_complete(move |v| {
				let _ = tx.send(v);
			});
		runner.submit(task);
		let value = rx.await.unwrap();
		assert_eq!(value, 42);
	}

	#[tokio::test]
	async fn on_error_is_invoked_for_a_failed_task() {
		let runner = TaskRunner::new(2);
		let (tx, rx) = tokio::sync::oneshot::channel();
		let task: Task<(), &'static str> = Task::new(TaskPriority::Low, async { Err("boom") })
			.on_error(move |e| {
				let _ = tx.send(e);
			});
		runner.submit(task);
		let err = rx.await.unwrap();
		assert_eq!(err, "boom");
	}

	#[tokio::test]
	async fn pool_bounds_concurrency_to_capacity() {
		let runner = TaskRunner::new(1);
		assert_eq!(runner.available_permits(), 1);
		let (tx, rx) = tokio::sync::oneshot::channel::<()>();
		let started = Arc::new(std::sync::atomic::AtomicBool::new(false));
		let started_inner = started.clone();
		let blocking: Task<(), std::convert::Infallible> = Task::new(TaskPriority::Normal, async move {
			started_inner.store(true, Ordering::SeqCst);
			rx.await.ok();
			Ok(())
		});
		runner.submit(blocking);
		// Give the first task a moment to acquire its permit.
		tokio::time::sleep(StdDuration::from_millis(20)).await;
		assert!(started.load(Ordering::SeqCst));
		assert_eq!(runner.available_permits(), 0);
		tx.send(()).unwrap();
	}

	#[tokio::test]
	async fn holdoff_timer_coalesces_bursty_calls_into_one_fire() {
		let timer = HoldOffTimer::new();
		let count = Arc::new(AtomicUsize::new(0));
		for _ in 0..5 {
			let count = count.clone();
			timer.start_or_delay(StdDuration::from_millis(50), move || {
				count.fetch_add(1, Ordering::SeqCst);
			});
			tokio::time::sleep(StdDuration::from_millis(5)).await;
		}
		tokio::time::sleep(StdDuration::from_millis(150)).await;
		assert_eq!(count.load(Ordering::SeqCst), 1, "only the last call in the burst should fire");
	}
}
