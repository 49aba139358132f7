//! Command Executor: pulls one ready `UserOp` off the Operation Graph at a
//! time and applies it to the filesystem or the remote backend.
//!
//! Copy/move/delete run through the same shape: stage under a temp name,
//! verify, atomically publish. Each run reports its outcome back to the
//! tracking store — here the Operation Graph rather than a generic job
//! queue. The executor only performs the real-world mutation; it does not
//! write the result back into a `TreeStore`'s cache. That reconciliation
//! happens the same way any other external change does, through the next
//! index walk or live FS watch, so a crash between "file written" and
//! "cache updated" can never leave the cache claiming something the disk
//! doesn't have.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use filetime::FileTime;
use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{DeviceUid, Node, NodeIdentifier, OpType, UserOp};
use crate::error::{Classify, ErrorClass};
use crate::events::{Event, EventBus};
use crate::hash;
use crate::op_graph::OpGraph;
use crate::tree_store::local::LocalTreeStore;
use crate::tree_store::remote::RemoteTreeStore;
use crate::tree_store::{TreeStore, TreeStoreError};

const STAGING_DIR_NAME: &str = ".sync-tmp";

/// Retries exhausted after this many attempts on top of the first, per
/// spec.md:230 ("retried up to `max_retries`, default 10").
const DEFAULT_MAX_RETRIES: u32 = 10;
/// Per-RPC timeout applied to every `RemoteObjectClient` call.
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

fn backoff_for(attempt: u32) -> Duration {
	let exp = attempt.min(10);
	(BACKOFF_BASE * 2u32.pow(exp)).min(BACKOFF_CAP)
}

fn join_error_to_io(e: tokio::task::JoinError) -> std::io::Error {
	std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

/// Stamps `path`'s modified time, running the blocking syscall on the
/// blocking thread pool.
async fn set_mtime(path: &Path, mtime_ms: i64) -> Result<(), ExecutorError> {
	let path = path.to_path_buf();
	let seconds = mtime_ms.div_euclid(1000);
	let nanos = (mtime_ms.rem_euclid(1000) * 1_000_000) as u32;
	tokio::task::spawn_blocking(move || filetime::set_file_mtime(&path, FileTime::from_unix_time(seconds, nanos)))
		.await
		.map_err(join_error_to_io)?
		.map_err(ExecutorError::from)
}

#[derive(Debug, Error)]
pub enum ExecutorError {
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
	#[error("content mismatch after transfer: expected {expected}, got {actual}")]
	ContentMismatch { expected: String, actual: String },
	#[error("cannot remove non-empty directory {0} without the recursive flag")]
	NonEmptyDir(PathBuf),
	#[error("{0} exists and is not a directory")]
	NotADirectory(PathBuf),
	#[error("op {0:?} requires a destination identifier but none was supplied")]
	MissingDestination(OpType),
	#[error("identifier for device {0} carries no addressable path")]
	Unaddressable(DeviceUid),
	#[error("node {0} is on neither the local nor the configured remote device")]
	UnknownBackend(DeviceUid),
	#[error(transparent)]
	TreeStore(#[from] TreeStoreError),
	#[error("remote backend error: {0}")]
	Remote(String),
}

impl Classify for ExecutorError {
	fn class(&self) -> ErrorClass {
		match self {
			Self::Io(_) => ErrorClass::Transient,
			Self::ContentMismatch { .. } => ErrorClass::Conflict,
			Self::NonEmptyDir(_) | Self::NotADirectory(_) => ErrorClass::Permanent,
			Self::MissingDestination(_) | Self::Unaddressable(_) | Self::UnknownBackend(_) => ErrorClass::Invariant,
			Self::TreeStore(e) => e.class(),
			Self::Remote(_) => ErrorClass::Transient,
		}
	}
}

/// Outcome of running one `UserOp`, reported to the caller and mirrored onto
/// the event bus as `Event::CommandComplete`.
#[derive(Debug, Clone)]
pub struct UserOpResult {
	pub op_uid: Uuid,
	pub succeeded: bool,
	pub error: Option<String>,
	pub affected_nodes: Vec<NodeIdentifier>,
}

/// Result of a successful remote upload: what the backend assigned to the
/// new object and the digest it computed, so the caller can verify it
/// without a round-trip read-back.
#[derive(Debug, Clone)]
pub struct RemoteUploadResult {
	pub cloud_id: String,
	pub md5: String,
}

/// The remote backend's write surface, addressed by a path relative to the
/// remote root rather than by `cloud_id` — the executor always knows a
/// relative path (it comes from the op's identifier) but rarely has a fresh
/// `cloud_id` for content that does not exist yet. The transport itself
/// (HTTP client, auth, retries) is out of scope here; this trait is the
/// seam a concrete backend plugs into.
#[async_trait]
pub trait RemoteObjectClient: Send + Sync {
	async fn ensure_dir(&self, relative_path: &Path) -> Result<String, ExecutorError>;
	async fn upload(&self, relative_path: &Path, local_path: &Path) -> Result<RemoteUploadResult, ExecutorError>;
	async fn download(&self, relative_path: &Path, local_dest: &Path) -> Result<(), ExecutorError>;
	async fn remove(&self, relative_path: &Path, to_trash: bool) -> Result<(), ExecutorError>;
}

/// No remote backend wired up. Every call fails as a permanent
/// configuration error; used for local-only deployments and in tests that
/// never exercise the remote side of a `UserOp`.
pub struct NullRemoteObjectClient;

#[async_trait]
impl RemoteObjectClient for NullRemoteObjectClient {
	async fn ensure_dir(&self, _relative_path: &Path) -> Result<String, ExecutorError> {
		Err(ExecutorError::Remote("no remote backend configured".into()))
	}

	async fn upload(&self, _relative_path: &Path, _local_path: &Path) -> Result<RemoteUploadResult, ExecutorError> {
		Err(ExecutorError::Remote("no remote backend configured".into()))
	}

	async fn download(&self, _relative_path: &Path, _local_dest: &Path) -> Result<(), ExecutorError> {
		Err(ExecutorError::Remote("no remote backend configured".into()))
	}

	async fn remove(&self, _relative_path: &Path, _to_trash: bool) -> Result<(), ExecutorError> {
		Err(ExecutorError::Remote("no remote backend configured".into()))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
	Local,
	Remote,
}

pub struct CommandExecutor {
	local_device_uid: DeviceUid,
	remote_device_uid: DeviceUid,
	local_root: PathBuf,
	local_store: Arc<LocalTreeStore>,
	remote_store: Arc<RemoteTreeStore>,
	remote_client: Arc<dyn RemoteObjectClient>,
	events: Arc<EventBus>,
	max_retries: u32,
	rpc_timeout: Duration,
}

impl CommandExecutor {
	pub fn new(
		local_device_uid: DeviceUid,
		remote_device_uid: DeviceUid,
		local_root: PathBuf,
		local_store: Arc<LocalTreeStore>,
		remote_store: Arc<RemoteTreeStore>,
		remote_client: Arc<dyn RemoteObjectClient>,
		events: Arc<EventBus>,
	) -> Self {
		Self {
			local_device_uid,
			remote_device_uid,
			local_root,
			local_store,
			remote_store,
			remote_client,
			events,
			max_retries: DEFAULT_MAX_RETRIES,
			rpc_timeout: DEFAULT_RPC_TIMEOUT,
		}
	}

	/// Overrides the default retry budget and per-RPC timeout. Exposed
	/// separately from `new` so callers that don't care keep the
	/// spec-mandated defaults (10 retries, 30s) without naming them.
	pub fn with_retry_policy(mut self, max_retries: u32, rpc_timeout: Duration) -> Self {
		self.max_retries = max_retries;
		self.rpc_timeout = rpc_timeout;
		self
	}

	/// Runs `fut` under the executor's per-RPC timeout, turning an elapsed
	/// deadline into a `Transient` error so the retry loop in `execute`
	/// treats it the same as any other retryable remote failure.
	async fn remote_call<T, Fut>(&self, fut: Fut) -> Result<T, ExecutorError>
	where
		Fut: Future<Output = Result<T, ExecutorError>>,
	{
		match tokio::time::timeout(self.rpc_timeout, fut).await {
			Ok(result) => result,
			Err(_) => Err(ExecutorError::Remote(format!("rpc timed out after {:?}", self.rpc_timeout))),
		}
	}

	/// Removes any `.sync-tmp` directory left over from a previous run.
	/// A crash mid-transfer leaves a staged file behind but never a visible
	/// half-written one; this just reclaims the disk space on restart.
	#[instrument(skip(self))]
	pub async fn cleanup_staging(&self) -> Result<(), ExecutorError> {
		let staging = self.local_root.join(STAGING_DIR_NAME);
		match fs::remove_dir_all(&staging).await {
			Ok(()) => info!(?staging, "cleaned up leftover staging directory"),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => return Err(e.into()),
		}
		Ok(())
	}

	fn backend_of(&self, device_uid: DeviceUid) -> Result<Backend, ExecutorError> {
		if device_uid == self.local_device_uid {
			Ok(Backend::Local)
		} else if device_uid == self.remote_device_uid {
			Ok(Backend::Remote)
		} else {
			Err(ExecutorError::UnknownBackend(device_uid))
		}
	}

	async fn resolve_node(&self, id: &NodeIdentifier) -> Result<Node, ExecutorError> {
		let node = match self.backend_of(id.device_uid)? {
			Backend::Local => self.local_store.get_node_for_uid(id.uid).await?,
			Backend::Remote => self.remote_store.get_node_for_uid(id.uid).await?,
		};
		node.ok_or_else(|| ExecutorError::TreeStore(TreeStoreError::NodeNotFound(id.uid)))
	}

	/// Drives the Operation Graph to completion: blocks for the next ready
	/// op, executes it, and reports the outcome back. Runs until the task
	/// it is spawned on is dropped or cancelled by the caller.
	pub async fn run(self: Arc<Self>, op_graph: Arc<OpGraph>) {
		loop {
			let op = op_graph.get_next().await;
			let op_uid = op.op_uid;
			let result = self.execute(&op).await;
			if result.succeeded {
				if let Err(e) = op_graph.mark_completed(op_uid).await {
					warn!(%op_uid, error = %e, "failed to archive completed op");
				}
			} else {
				let reason = result.error.clone().unwrap_or_else(|| "unknown failure".to_string());
				if let Err(e) = op_graph.mark_failed(op_uid, &reason).await {
					warn!(%op_uid, error = %e, "failed to archive failed op");
				}
			}
			self.events.emit(Event::CommandComplete {
				op_uid,
				succeeded: result.succeeded,
			});
		}
	}

	/// Executes a single op and always returns a result rather than an
	/// `Err` — a failed mutation is reported through `UserOpResult`, not
	/// propagated, so `run`'s loop never needs a third outcome branch.
	///
	/// A `Transient` failure (network blip, RPC timeout) is retried in
	/// place with exponential backoff up to `max_retries` times before it
	/// is surfaced; every other class fails on the first attempt.
	#[instrument(skip(self, op), fields(op_uid = %op.op_uid, op_type = op.op_type.as_str()))]
	pub async fn execute(&self, op: &UserOp) -> UserOpResult {
		let mut attempt = 0u32;
		loop {
			let outcome = match op.op_type {
				OpType::Mkdir => self.execute_mkdir(op).await,
				OpType::Cp => self.execute_copy(op, false).await,
				OpType::Up => self.execute_copy(op, true).await,
				OpType::Mv => self.execute_move(op).await,
				OpType::Rm => self.execute_remove(op).await,
			};
			match outcome {
				Ok(affected) => {
					return UserOpResult {
						op_uid: op.op_uid,
						succeeded: true,
						error: None,
						affected_nodes: affected,
					};
				}
				Err(e) => {
					if e.class().is_retryable() && attempt < self.max_retries {
						let backoff = backoff_for(attempt);
						warn!(op_uid = %op.op_uid, error = %e, attempt, ?backoff, "transient failure, retrying");
						tokio::time::sleep(backoff).await;
						attempt += 1;
						continue;
					}
					warn!(op_uid = %op.op_uid, error = %e, "op failed");
					return UserOpResult {
						op_uid: op.op_uid,
						succeeded: false,
						error: Some(e.to_string()),
						affected_nodes: Vec::new(),
					};
				}
			}
		}
	}

	async fn execute_mkdir(&self, op: &UserOp) -> Result<Vec<NodeIdentifier>, ExecutorError> {
		let path = op
			.src_node
			.spid_path()
			.ok_or_else(|| ExecutorError::Unaddressable(op.src_node.device_uid))?;
		match self.backend_of(op.src_node.device_uid)? {
			Backend::Local => {
				match fs::metadata(path).await {
					Ok(m) if m.is_dir() => {} // already exists: MKDIR is idempotent
					Ok(_) => return Err(ExecutorError::NotADirectory(path.clone())),
					Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
						fs::create_dir_all(path).await?;
					}
					Err(e) => return Err(e.into()),
				}
			}
			Backend::Remote => {
				self.remote_call(self.remote_client.ensure_dir(path)).await?;
			}
		}
		Ok(vec![op.src_node.clone()])
	}

	async fn execute_copy(&self, op: &UserOp, is_update: bool) -> Result<Vec<NodeIdentifier>, ExecutorError> {
		let dst_id = op
			.dst_node
			.as_ref()
			.ok_or(ExecutorError::MissingDestination(op.op_type))?;
		let src_node = self.resolve_node(&op.src_node).await?;
		let expected_md5 = src_node.md5().map(str::to_owned);
		let expected_mtime_ms = src_node.mtime_ms();
		let staging_name = match &src_node {
			Node::LocalFile(f) => f.signature.sha256.clone(),
			_ => None,
		};

		let src_backend = self.backend_of(op.src_node.device_uid)?;
		let dst_backend = self.backend_of(dst_id.device_uid)?;

		if is_update {
			self.require_dst_exists(dst_id, dst_backend).await?;
		}

		match (src_backend, dst_backend) {
			(Backend::Local, Backend::Local) => {
				let src_path = op
					.src_node
					.spid_path()
					.ok_or_else(|| ExecutorError::Unaddressable(op.src_node.device_uid))?;
				let dst_path = dst_id
					.spid_path()
					.ok_or_else(|| ExecutorError::Unaddressable(dst_id.device_uid))?;
				self.copy_local_to_local(src_path, dst_path, expected_md5.as_deref(), expected_mtime_ms, staging_name)
					.await?;
			}
			(Backend::Local, Backend::Remote) => {
				let src_path = op
					.src_node
					.spid_path()
					.ok_or_else(|| ExecutorError::Unaddressable(op.src_node.device_uid))?;
				let relative = dst_id
					.spid_path()
					.ok_or_else(|| ExecutorError::Unaddressable(dst_id.device_uid))?;
				let uploaded = self.remote_call(self.remote_client.upload(relative, src_path)).await?;
				if let Some(expected) = expected_md5.as_deref() {
					if uploaded.md5 != expected {
						let _ = self.remote_call(self.remote_client.remove(relative, false)).await;
						return Err(ExecutorError::ContentMismatch {
							expected: expected.to_string(),
							actual: uploaded.md5,
						});
					}
				}
			}
			(Backend::Remote, Backend::Local) => {
				let relative = op
					.src_node
					.spid_path()
					.ok_or_else(|| ExecutorError::Unaddressable(op.src_node.device_uid))?;
				let dst_path = dst_id
					.spid_path()
					.ok_or_else(|| ExecutorError::Unaddressable(dst_id.device_uid))?;
				self.download_to_local(relative, dst_path, expected_md5.as_deref(), expected_mtime_ms)
					.await?;
			}
			(Backend::Remote, Backend::Remote) => {
				return Err(ExecutorError::Remote("remote-to-remote copy is not supported".into()));
			}
		}
		Ok(vec![op.src_node.clone(), dst_id.clone()])
	}

	async fn require_dst_exists(&self, dst_id: &NodeIdentifier, backend: Backend) -> Result<(), ExecutorError> {
		match backend {
			Backend::Local => {
				let path = dst_id
					.spid_path()
					.ok_or_else(|| ExecutorError::Unaddressable(dst_id.device_uid))?;
				fs::metadata(path)
					.await
					.map_err(|_| ExecutorError::TreeStore(TreeStoreError::NodeNotFound(dst_id.uid)))?;
			}
			Backend::Remote => {
				self.resolve_node(dst_id).await?;
			}
		}
		Ok(())
	}

	/// Stages the copy under `<local_root>/.sync-tmp/<name>`, verifies it
	/// against `expected_md5` once staged, stamps it with the source's
	/// mtime, and only then renames it into place — the destination path
	/// never observes a partial write, and a re-diff of the two roots
	/// never sees a spurious mtime mismatch from the copy itself.
	async fn copy_local_to_local(
		&self,
		src: &Path,
		dst: &Path,
		expected_md5: Option<&str>,
		expected_mtime_ms: Option<i64>,
		staging_name_hint: Option<String>,
	) -> Result<(), ExecutorError> {
		let staging_dir = self.local_root.join(STAGING_DIR_NAME);
		fs::create_dir_all(&staging_dir).await?;
		let staging_name = staging_name_hint.unwrap_or_else(|| Uuid::new_v4().to_string());
		let staging_path = staging_dir.join(staging_name);

		if let Err(e) = fs::copy(src, &staging_path).await {
			let _ = fs::remove_file(&staging_path).await;
			return Err(e.into());
		}

		if let Some(expected) = expected_md5 {
			let staged_sig = hash::hash(&staging_path).await;
			if staged_sig.md5.as_deref() != Some(expected) {
				let _ = fs::remove_file(&staging_path).await;
				return Err(ExecutorError::ContentMismatch {
					expected: expected.to_string(),
					actual: staged_sig.md5.unwrap_or_default(),
				});
			}
		}

		if let Some(mtime_ms) = expected_mtime_ms {
			if let Err(e) = set_mtime(&staging_path, mtime_ms).await {
				let _ = fs::remove_file(&staging_path).await;
				return Err(e);
			}
		}

		self.publish_staged(&staging_path, dst).await
	}

	/// Same staging discipline as `copy_local_to_local`, but the content
	/// arrives from `remote_client.download` rather than a local `fs::copy`.
	async fn download_to_local(
		&self,
		relative: &Path,
		dst: &Path,
		expected_md5: Option<&str>,
		expected_mtime_ms: Option<i64>,
	) -> Result<(), ExecutorError> {
		let staging_dir = self.local_root.join(STAGING_DIR_NAME);
		fs::create_dir_all(&staging_dir).await?;
		let staging_path = staging_dir.join(Uuid::new_v4().to_string());

		self.remote_call(self.remote_client.download(relative, &staging_path)).await?;

		if let Some(expected) = expected_md5 {
			let staged_sig = hash::hash(&staging_path).await;
			if staged_sig.md5.as_deref() != Some(expected) {
				let _ = fs::remove_file(&staging_path).await;
				return Err(ExecutorError::ContentMismatch {
					expected: expected.to_string(),
					actual: staged_sig.md5.unwrap_or_default(),
				});
			}
		}

		if let Some(mtime_ms) = expected_mtime_ms {
			if let Err(e) = set_mtime(&staging_path, mtime_ms).await {
				let _ = fs::remove_file(&staging_path).await;
				return Err(e);
			}
		}

		self.publish_staged(&staging_path, dst).await
	}

	/// Copy without staging or hash verification: used only as the
	/// same-filesystem `MV` fallback when `fs::rename` fails across a mount
	/// boundary. The source and staged copy live on the same disk the
	/// `rename` itself would have used, so there is nothing to verify that
	/// a same-device rename wouldn't also have skipped. `fs::rename` would
	/// have kept the original mtime, so this fallback restores it too.
	async fn copy_local_to_local_raw(&self, src: &Path, dst: &Path) -> Result<(), ExecutorError> {
		if let Some(parent) = dst.parent() {
			fs::create_dir_all(parent).await?;
		}
		fs::copy(src, dst).await?;
		let src_metadata = fs::metadata(src).await?;
		let mtime = FileTime::from_last_modification_time(&src_metadata);
		let dst = dst.to_path_buf();
		tokio::task::spawn_blocking(move || filetime::set_file_mtime(&dst, mtime))
			.await
			.map_err(join_error_to_io)?
			.map_err(ExecutorError::from)
	}

	async fn publish_staged(&self, staging_path: &Path, dst: &Path) -> Result<(), ExecutorError> {
		if let Some(parent) = dst.parent() {
			fs::create_dir_all(parent).await?;
		}
		match fs::rename(staging_path, dst).await {
			Ok(()) => Ok(()),
			Err(e) => {
				let _ = fs::remove_file(staging_path).await;
				Err(e.into())
			}
		}
	}

	async fn execute_move(&self, op: &UserOp) -> Result<Vec<NodeIdentifier>, ExecutorError> {
		let dst_id = op
			.dst_node
			.as_ref()
			.ok_or(ExecutorError::MissingDestination(op.op_type))?;
		let src_backend = self.backend_of(op.src_node.device_uid)?;
		let dst_backend = self.backend_of(dst_id.device_uid)?;

		if src_backend == Backend::Local && dst_backend == Backend::Local {
			let src_path = op
				.src_node
				.spid_path()
				.ok_or_else(|| ExecutorError::Unaddressable(op.src_node.device_uid))?;
			let dst_path = dst_id
				.spid_path()
				.ok_or_else(|| ExecutorError::Unaddressable(dst_id.device_uid))?;
			if let Some(parent) = dst_path.parent() {
				fs::create_dir_all(parent).await?;
			}
			if fs::rename(src_path, dst_path).await.is_err() {
				// Cross-device rename: fall back to copy-then-unlink.
				self.copy_local_to_local_raw(src_path, dst_path).await?;
				fs::remove_file(src_path).await?;
			}
		} else {
			// Cross-backend move has no atomic primitive: copy first, only
			// remove the source once the copy has been verified.
			self.execute_copy(op, false).await?;
			self.remove_by_identifier(&op.src_node, false, true).await?;
		}
		Ok(vec![op.src_node.clone(), dst_id.clone()])
	}

	async fn execute_remove(&self, op: &UserOp) -> Result<Vec<NodeIdentifier>, ExecutorError> {
		self.remove_by_identifier(&op.src_node, op.recursive, op.to_trash).await?;
		Ok(vec![op.src_node.clone()])
	}

	async fn remove_by_identifier(&self, id: &NodeIdentifier, recursive: bool, to_trash: bool) -> Result<(), ExecutorError> {
		match self.backend_of(id.device_uid)? {
			Backend::Local => {
				let path = id.spid_path().ok_or_else(|| ExecutorError::Unaddressable(id.device_uid))?;
				let metadata = match fs::metadata(path).await {
					Ok(m) => m,
					Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
					Err(e) => return Err(e.into()),
				};
				if metadata.is_dir() {
					let mut entries = fs::read_dir(path).await?;
					let has_children = entries.next_entry().await?.is_some();
					if has_children && !recursive {
						return Err(ExecutorError::NonEmptyDir(path.clone()));
					}
					if recursive {
						fs::remove_dir_all(path).await?;
					} else {
						fs::remove_dir(path).await?;
					}
				} else {
					fs::remove_file(path).await?;
				}
				Ok(())
			}
			Backend::Remote => {
				let relative = id.spid_path().ok_or_else(|| ExecutorError::Unaddressable(id.device_uid))?;
				self.remote_call(self.remote_client.remove(relative, to_trash)).await
			}
		}
	}
}
