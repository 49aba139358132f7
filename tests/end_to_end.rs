//! Cross-module end-to-end scenarios, driving the Diff Engine, Operation
//! Graph, and Command Executor together against real temp-directory
//! filesystems — placed under `tests/` since they span more than one
//! module.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use coresync::config::ConfigStore;
use coresync::db::Database;
use coresync::diff_engine::{self, DiffOptions};
use coresync::domain::node::LocalFile;
use coresync::domain::{DeviceUid, Node, NodeIdentifier, OpStatus, OpType, UserOp};
use coresync::events::EventBus;
use coresync::executor::{CommandExecutor, NullRemoteObjectClient};
use coresync::hash;
use coresync::identity::{CloudIdMapper, PathMapper};
use coresync::op_graph::OpGraph;
use coresync::tree_store::local::LocalTreeStore;
use coresync::tree_store::remote::{NullRemoteDriveClient, RemoteTreeStore};
use coresync::tree_store::TreeStore;
use coresync::uid::UidAllocator;
use uuid::Uuid;

const LOCAL_DEVICE: DeviceUid = 1;
const REMOTE_DEVICE: DeviceUid = 2;

struct Harness {
    local_store: Arc<LocalTreeStore>,
    remote_store: Arc<RemoteTreeStore>,
    op_graph: Arc<OpGraph>,
    executor: Arc<CommandExecutor>,
    uid_alloc: Arc<UidAllocator>,
    root: PathBuf,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::create(&dir.path().join("coresync.db")).await.unwrap());
    db.migrate().await.unwrap();
    let events = Arc::new(EventBus::default());
    let path_mapper = Arc::new(PathMapper::load(db.clone()).await.unwrap());
    let cloud_mapper = Arc::new(CloudIdMapper::load(db.clone()).await.unwrap());
    let config = Arc::new(ConfigStore::load_or_create(&dir.path().join("config")).await.unwrap());
    let uid_alloc = Arc::new(UidAllocator::load(config).await.unwrap());

    let local_store = Arc::new(LocalTreeStore::new(
        LOCAL_DEVICE,
        db.clone(),
        uid_alloc.clone(),
        path_mapper,
        events.clone(),
    ));
    let remote_store = Arc::new(RemoteTreeStore::new(
        REMOTE_DEVICE,
        db.clone(),
        uid_alloc.clone(),
        cloud_mapper,
        events.clone(),
        Arc::new(NullRemoteDriveClient),
    ));

    let root = dir.path().join("root");
    tokio::fs::create_dir_all(&root).await.unwrap();

    let executor = Arc::new(CommandExecutor::new(
        LOCAL_DEVICE,
        REMOTE_DEVICE,
        root.clone(),
        local_store.clone(),
        remote_store.clone(),
        Arc::new(NullRemoteObjectClient),
        events,
    ));
    let op_graph = Arc::new(OpGraph::new(db));

    Harness {
        local_store,
        remote_store,
        op_graph,
        executor,
        uid_alloc,
        root,
        _dir: dir,
    }
}

/// Writes `content` to `path` and registers it in `store` as a `LocalFile`
/// with a real computed signature and the given `mtime_ms`, bypassing the
/// walker so the test controls mtime precisely (see `executor`'s own tests
/// for the same pattern).
async fn seed_file(store: &LocalTreeStore, uid_alloc: &UidAllocator, path: &Path, content: &[u8], mtime_ms: i64) -> Node {
    tokio::fs::write(path, content).await.unwrap();
    let sig = hash::hash(path).await;
    let uid = uid_alloc.next().await.unwrap();
    let node = Node::LocalFile(LocalFile {
        identifier: NodeIdentifier::single(LOCAL_DEVICE, uid, path.to_path_buf()),
        size: content.len() as u64,
        mtime_ms,
        ctime_ms: mtime_ms,
        signature: sig,
        trashed: false,
    });
    store.upsert_single_node(node.clone()).await.unwrap();
    node
}

async fn snapshot_of(store: &LocalTreeStore, root: &Path) -> coresync::tree_store::SubtreeSnapshot {
    store
        .get_all_files_and_dirs_for_subtree(&NodeIdentifier::single(LOCAL_DEVICE, 0, root.to_path_buf()))
        .await
        .unwrap()
}

/// Runs `ops` to completion through the real operation graph and executor,
/// returning once every op has reached a terminal state.
async fn run_to_completion(h: &Harness, ops: Vec<UserOp>) {
    let op_count = h.op_graph.add_batch(ops).await.unwrap();
    for _ in 0..op_count {
        let op = h.op_graph.get_next().await;
        let result = h.executor.execute(&op).await;
        if result.succeeded {
            h.op_graph.mark_completed(op.op_uid).await.unwrap();
        } else {
            h.op_graph.mark_failed(op.op_uid, &result.error.unwrap_or_default()).await.unwrap();
        }
    }
}

#[tokio::test]
async fn scenario_1_diff_of_identical_trees_is_empty() {
    let h = harness().await;
    let a = h.root.join("a");
    let b = h.root.join("b");
    tokio::fs::create_dir_all(a.join("dir")).await.unwrap();
    tokio::fs::create_dir_all(b.join("dir")).await.unwrap();
    seed_file(&h.local_store, &h.uid_alloc, &a.join("a.txt"), b"hello", 100).await;
    seed_file(&h.local_store, &h.uid_alloc, &b.join("a.txt"), b"hello", 100).await;
    seed_file(&h.local_store, &h.uid_alloc, &a.join("dir/b.txt"), b"world", 100).await;
    seed_file(&h.local_store, &h.uid_alloc, &b.join("dir/b.txt"), b"world", 100).await;

    let left = snapshot_of(&h.local_store, &a).await;
    let right = snapshot_of(&h.local_store, &b).await;
    let tree = diff_engine::diff(&left, &right, DiffOptions::default()).unwrap();
    assert!(tree.all_ops().is_empty());
}

#[tokio::test]
async fn scenario_2_add_on_one_side_is_copied_across() {
    let h = harness().await;
    let a = h.root.join("a");
    let b = h.root.join("b");
    tokio::fs::create_dir_all(&a).await.unwrap();
    tokio::fs::create_dir_all(&b).await.unwrap();
    seed_file(&h.local_store, &h.uid_alloc, &a.join("a.txt"), b"hello", 100).await;
    seed_file(&h.local_store, &h.uid_alloc, &b.join("a.txt"), b"hello", 100).await;
    seed_file(&h.local_store, &h.uid_alloc, &b.join("new.txt"), b"fresh content", 100).await;

    let left = snapshot_of(&h.local_store, &a).await;
    let right = snapshot_of(&h.local_store, &b).await;
    let tree = diff_engine::diff(&left, &right, DiffOptions::default()).unwrap();
    let ops = tree.all_ops();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].op_type, OpType::Cp);

    run_to_completion(&h, ops).await;

    assert_eq!(tokio::fs::read(a.join("new.txt")).await.unwrap(), b"fresh content");
    let left_after = snapshot_of(&h.local_store, &a).await;
    let right_after = snapshot_of(&h.local_store, &b).await;
    // both sides now agree on both files' content, re-diffing finds nothing
    // left to do for the copied file.
    assert_eq!(left_after.files.len(), right_after.files.len());
}

#[tokio::test]
async fn scenario_3_rename_is_detected_as_a_move() {
    let h = harness().await;
    let a = h.root.join("a");
    let b = h.root.join("b");
    tokio::fs::create_dir_all(&a).await.unwrap();
    tokio::fs::create_dir_all(&b).await.unwrap();
    seed_file(&h.local_store, &h.uid_alloc, &a.join("old.txt"), b"same bytes", 100).await;
    seed_file(&h.local_store, &h.uid_alloc, &b.join("new.txt"), b"same bytes", 100).await;

    let left = snapshot_of(&h.local_store, &a).await;
    let right = snapshot_of(&h.local_store, &b).await;
    let tree = diff_engine::diff(&left, &right, DiffOptions::default()).unwrap();
    let ops = tree.all_ops();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].op_type, OpType::Mv);

    run_to_completion(&h, ops).await;

    assert!(a.join("new.txt").exists() || b.join("new.txt").exists());
}

#[tokio::test]
async fn scenario_4_content_conflict_updates_the_older_side() {
    let h = harness().await;
    let a = h.root.join("a");
    let b = h.root.join("b");
    tokio::fs::create_dir_all(&a).await.unwrap();
    tokio::fs::create_dir_all(&b).await.unwrap();
    seed_file(&h.local_store, &h.uid_alloc, &a.join("a.txt"), b"left content is newer", 200).await;
    seed_file(&h.local_store, &h.uid_alloc, &b.join("a.txt"), b"right content is older", 100).await;

    let left = snapshot_of(&h.local_store, &a).await;
    let right = snapshot_of(&h.local_store, &b).await;
    let tree = diff_engine::diff(&left, &right, DiffOptions::default()).unwrap();
    let ops = tree.all_ops();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].op_type, OpType::Up);

    run_to_completion(&h, ops).await;

    assert_eq!(
        tokio::fs::read(b.join("a.txt")).await.unwrap(),
        b"left content is newer",
        "the newer side's content must win"
    );
}

#[tokio::test]
async fn scenario_5_crash_mid_copy_resumes_cleanly_after_restart() {
    let h = harness().await;
    let src_path = h.root.join("big.bin");
    tokio::fs::write(&src_path, vec![7u8; 4096]).await.unwrap();
    let sig = hash::hash(&src_path).await;
    let src_uid = h.uid_alloc.next().await.unwrap();
    h.local_store
        .upsert_single_node(Node::LocalFile(LocalFile {
            identifier: NodeIdentifier::single(LOCAL_DEVICE, src_uid, src_path.clone()),
            size: 4096,
            mtime_ms: 0,
            ctime_ms: 0,
            signature: sig,
            trashed: false,
        }))
        .await
        .unwrap();

    // Simulate a crash that left a staged (but never published) copy behind.
    let staging_dir = h.root.join(".sync-tmp");
    tokio::fs::create_dir_all(&staging_dir).await.unwrap();
    tokio::fs::write(staging_dir.join("leftover-fragment"), b"partial").await.unwrap();

    // "Restart": a fresh executor sharing the same root cleans up staging
    // before doing any work, same as the real binary's bootstrap.
    h.executor.cleanup_staging().await.unwrap();
    assert!(!staging_dir.exists());

    let op = UserOp::new_in_batch(
        Uuid::new_v4(),
        OpType::Cp,
        NodeIdentifier::single(LOCAL_DEVICE, src_uid, src_path.clone()),
        Some(NodeIdentifier::single(LOCAL_DEVICE, 0, h.root.join("big-copy.bin"))),
    );
    assert_eq!(op.status, OpStatus::Pending, "a re-dequeued op must still be PENDING, never stuck EXECUTING");

    run_to_completion(&h, vec![op]).await;

    assert_eq!(tokio::fs::read(h.root.join("big-copy.bin")).await.unwrap(), vec![7u8; 4096]);
}

#[tokio::test]
async fn scenario_6_parent_dependency_runs_mkdir_before_the_copy_into_it() {
    let h = harness().await;
    let src_path = h.root.join("x");
    tokio::fs::write(&src_path, b"payload").await.unwrap();
    let sig = hash::hash(&src_path).await;
    let src_uid = h.uid_alloc.next().await.unwrap();
    h.local_store
        .upsert_single_node(Node::LocalFile(LocalFile {
            identifier: NodeIdentifier::single(LOCAL_DEVICE, src_uid, src_path.clone()),
            size: 7,
            mtime_ms: 0,
            ctime_ms: 0,
            signature: sig,
            trashed: false,
        }))
        .await
        .unwrap();

    let dir_path = h.root.join("dir");
    let cp = UserOp::new_in_batch(
        Uuid::new_v4(),
        OpType::Cp,
        NodeIdentifier::single(LOCAL_DEVICE, src_uid, src_path.clone()),
        Some(NodeIdentifier::single(LOCAL_DEVICE, 0, dir_path.join("x"))),
    );
    // handed to add_batch with the CP before the MKDIR, out of order, and no
    // MKDIR for `dir` at all: the graph must synthesize one.
    h.op_graph.add_batch(vec![cp.clone()]).await.unwrap();

    let first = h.op_graph.get_next().await;
    assert_eq!(first.op_type, OpType::Mkdir, "the synthetic MKDIR must be dequeued before the CP");
    let result = h.executor.execute(&first).await;
    assert!(result.succeeded, "{:?}", result.error);
    h.op_graph.mark_completed(first.op_uid).await.unwrap();

    let second = h.op_graph.get_next().await;
    assert_eq!(second.op_uid, cp.op_uid);
    let result = h.executor.execute(&second).await;
    assert!(result.succeeded, "{:?}", result.error);
    h.op_graph.mark_completed(second.op_uid).await.unwrap();

    assert_eq!(tokio::fs::read(dir_path.join("x")).await.unwrap(), b"payload");
}

#[tokio::test]
async fn scenario_6_variant_failed_synthetic_mkdir_cancels_the_dependent_copy() {
    let h = harness().await;
    let src_path = h.root.join("x");
    tokio::fs::write(&src_path, b"payload").await.unwrap();
    let src_uid = h.uid_alloc.next().await.unwrap();

    // `dir` is a path occupied by a plain file, so the synthetic MKDIR that
    // targets it is guaranteed to fail (not a directory).
    let dir_path = h.root.join("dir");
    tokio::fs::write(&dir_path, b"not a directory").await.unwrap();

    let cp = UserOp::new_in_batch(
        Uuid::new_v4(),
        OpType::Cp,
        NodeIdentifier::single(LOCAL_DEVICE, src_uid, src_path.clone()),
        Some(NodeIdentifier::single(LOCAL_DEVICE, 0, dir_path.join("x"))),
    );
    h.op_graph.add_batch(vec![cp.clone()]).await.unwrap();

    let mkdir_op = h.op_graph.get_next().await;
    assert_eq!(mkdir_op.op_type, OpType::Mkdir);
    let result = h.executor.execute(&mkdir_op).await;
    assert!(!result.succeeded);
    h.op_graph
        .mark_failed(mkdir_op.op_uid, &result.error.unwrap_or_default())
        .await
        .unwrap();

    // the CP must have been cascaded to a terminal (cancelled) state and
    // never handed out by get_next.
    let next = tokio::time::timeout(std::time::Duration::from_millis(50), h.op_graph.get_next()).await;
    assert!(next.is_err(), "the dependent CP must not become ready after its prerequisite failed");
}

