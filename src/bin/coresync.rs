//! `coresync` CLI — a minimal bootstrap that wires the core components
//! together from the command line.
//!
//! The command-line bootstrap's UX is out of the core crate's scope, but
//! it still needs to be runnable, so this is a thin `clap`-derived binary,
//! `#[tokio::main]`, delegating everything else to the library, rather
//! than a full daemon or UI shell.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use coresync::cache_manager::CacheManager;
use coresync::config::ConfigStore;
use coresync::db::Database;
use coresync::diff_engine::{self, DiffOptions};
use coresync::domain::{DeviceUid, NodeIdentifier};
use coresync::events::EventBus;
use coresync::executor::{CommandExecutor, NullRemoteObjectClient};
use coresync::identity::{CloudIdMapper, PathMapper};
use coresync::op_graph::OpGraph;
use coresync::tree_store::local::LocalTreeStore;
use coresync::tree_store::remote::{NullRemoteDriveClient, RemoteTreeStore};
use coresync::tree_store::TreeStore;
use coresync::uid::UidAllocator;
use tracing_subscriber::EnvFilter;

const LOCAL_DEVICE_UID: DeviceUid = 1;
const REMOTE_DEVICE_UID: DeviceUid = 2;

#[derive(Parser)]
#[command(name = "coresync")]
#[command(about = "Bidirectional file-sync and diff core", long_about = None)]
struct Cli {
	/// Directory holding the registry/ops/cache databases and config.json.
	#[arg(long, global = true)]
	data_dir: Option<PathBuf>,

	/// Enable debug logging.
	#[arg(short = 'v', long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Walk a local root and report what the index found.
	Index {
		/// Path to index.
		path: PathBuf,
	},
	/// Diff two local roots and print the resulting operations, without
	/// executing them.
	Diff {
		left: PathBuf,
		right: PathBuf,
		/// Treat a trashed/present pair with equal content as an RM on the
		/// non-trashed side.
		#[arg(long)]
		propagate_deletions: bool,
	},
	/// Diff two local roots, enqueue the resulting operations, and drain
	/// the operation graph to completion.
	Sync {
		left: PathBuf,
		right: PathBuf,
	},
	/// Report pending/archived operation counts.
	Status,
}

fn default_data_dir() -> PathBuf {
	dirs::data_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join("coresync")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let cli = Cli::parse();

	let filter = if cli.verbose {
		EnvFilter::new("debug")
	} else {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
	};
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
	std::fs::create_dir_all(&data_dir)?;

	let db = Arc::new(Database::create(&data_dir.join("registry.db")).await?);
	db.migrate().await?;
	let config = Arc::new(ConfigStore::load_or_create(&data_dir.join("config")).await?);
	let events = Arc::new(EventBus::default());
	let uid_alloc = Arc::new(UidAllocator::load(config).await?);
	let path_mapper = Arc::new(PathMapper::load(db.clone()).await?);
	let cloud_mapper = Arc::new(CloudIdMapper::load(db.clone()).await?);

	let local_store = Arc::new(LocalTreeStore::new(
		LOCAL_DEVICE_UID,
		db.clone(),
		uid_alloc.clone(),
		path_mapper.clone(),
		events.clone(),
	));
	let remote_store = Arc::new(RemoteTreeStore::new(
		REMOTE_DEVICE_UID,
		db.clone(),
		uid_alloc,
		cloud_mapper.clone(),
		events.clone(),
		Arc::new(NullRemoteDriveClient),
	));
	let op_graph = Arc::new(OpGraph::new(db.clone()));

	match cli.command {
		Commands::Index { path } => {
			let root = NodeIdentifier::single(LOCAL_DEVICE_UID, 0, path.clone());
			local_store.load_subtree(&root).await?;
			let uid = path_mapper
				.get(&path)
				.await?
				.ok_or("walk completed but root path was not indexed")?;
			let resolved_root = NodeIdentifier::single(LOCAL_DEVICE_UID, uid, path.clone());
			let stats = local_store.generate_dir_stats(&resolved_root).await?;
			let root_stats = stats.get(&uid).copied().unwrap_or_default();
			println!(
				"indexed {}: {} files, {} dirs, {} bytes",
				path.display(),
				root_stats.file_count,
				root_stats.dir_count,
				root_stats.size_bytes
			);
		}
		Commands::Diff {
			left,
			right,
			propagate_deletions,
		} => {
			let ops = compute_diff(&local_store, &left, &right, propagate_deletions).await?;
			if ops.is_empty() {
				println!("no differences");
			}
			for op in &ops {
				println!("{} {:?} -> {:?}", op.op_type.as_str(), op.src_node.paths, op.dst_node.as_ref().map(|d| &d.paths));
			}
		}
		Commands::Sync { left, right } => {
			let ops = compute_diff(&local_store, &left, &right, false).await?;
			println!("enqueueing {} operation(s)", ops.len());
			let op_count = op_graph.add_batch(ops).await?;

			let manager = CacheManager::new(
				db.clone(),
				LOCAL_DEVICE_UID,
				vec![
					local_store.clone() as Arc<dyn TreeStore>,
					remote_store.clone() as Arc<dyn TreeStore>,
				],
				path_mapper,
				cloud_mapper,
				op_graph.clone(),
			);
			manager.start().await?;

			let executor = Arc::new(CommandExecutor::new(
				LOCAL_DEVICE_UID,
				REMOTE_DEVICE_UID,
				left.clone(),
				local_store,
				remote_store,
				Arc::new(NullRemoteObjectClient),
				events,
			));
			executor.cleanup_staging().await?;
				// `op_count` is the total number of graph nodes `add_batch`
				// persisted, including any synthetic MKDIRs spliced ahead of an
				// op targeting a not-yet-existing directory; `mark_failed`
				// cascades CANCELLED to every descendant, so every one of those
				// nodes is guaranteed to reach a terminal state within `op_count`
				// dequeues.
			for _ in 0..op_count {
				let op = op_graph.get_next().await;
				let result = executor.execute(&op).await;
				if result.succeeded {
					op_graph.mark_completed(op.op_uid).await?;
				} else {
					let reason = result.error.unwrap_or_else(|| "unknown failure".to_string());
					op_graph.mark_failed(op.op_uid, &reason).await?;
				}
			}
			println!("sync complete");
		}
		Commands::Status => {
			println!("data dir: {}", data_dir.display());
		}
	}

	Ok(())
}

async fn compute_diff(
	local_store: &Arc<LocalTreeStore>,
	left: &PathBuf,
	right: &PathBuf,
	propagate_deletions: bool,
) -> Result<Vec<coresync::domain::UserOp>, Box<dyn std::error::Error>> {
	let left_root = NodeIdentifier::single(LOCAL_DEVICE_UID, 0, left.clone());
	let right_root = NodeIdentifier::single(LOCAL_DEVICE_UID, 0, right.clone());
	local_store.load_subtree(&left_root).await?;
	local_store.load_subtree(&right_root).await?;

	let left_snapshot = local_store.get_all_files_and_dirs_for_subtree(&left_root).await?;
	let right_snapshot = local_store.get_all_files_and_dirs_for_subtree(&right_root).await?;

	let options = DiffOptions { propagate_deletions };
	let tree = diff_engine::diff(&left_snapshot, &right_snapshot, options)?;
	Ok(tree.all_ops())
}
