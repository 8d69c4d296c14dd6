mod common;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::{FailingReader, FailingSealer, FlakyBackend, memory_repo, sealer, stored_blobs, test_config, verify_tree};
use snapvault_core::backend::FileType;
use snapvault_core::fake::FakeTree;
use snapvault_core::tree::{Node, Tree};
use snapvault_core::{BlobHandle, BlobKind, Error, Id, Repository, Result, TreeBuilder, VirtualDir};
use std::path::PathBuf;
use std::sync::Arc;

fn paths() -> Vec<PathBuf> {
    vec![PathBuf::from("/data")]
}

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap()
}

#[tokio::test]
async fn test_two_identical_files() {
    let (_backend, _sealer, repo) = memory_repo(test_config()).await;
    let content = vec![7u8; 10_000];
    let dir = VirtualDir::new()
        .file("one.bin", content.clone())
        .file("two.bin", content);

    let snapshot = repo.assemble_snapshot(paths(), now(), &dir).await.unwrap();
    let tree = repo.load_tree(&snapshot.tree).await.unwrap();

    assert_eq!(tree.nodes.len(), 2);
    assert_eq!(tree.nodes[0].content(), tree.nodes[1].content());
    assert!(!tree.nodes[0].content().is_empty());

    let mut unique = tree.nodes[0].content().to_vec();
    unique.sort();
    unique.dedup();
    let data_blobs = stored_blobs(&repo)
        .await
        .into_iter()
        .filter(|(_, kind)| *kind == BlobKind::Data)
        .count();
    assert_eq!(data_blobs, unique.len());
}

#[tokio::test]
async fn test_two_level_directory() {
    let (backend, sealer, repo) = memory_repo(test_config()).await;
    let dir = VirtualDir::new()
        .file("top.txt", &b"top level"[..])
        .dir("sub", VirtualDir::new().file("inner.txt", &b"inner"[..]));

    let snapshot = repo.assemble_snapshot(paths(), now(), &dir).await.unwrap();
    assert_eq!(snapshot.paths, paths());
    assert_eq!(snapshot.time, now());

    // read everything back through a fresh session
    let reopened = Repository::open(backend, sealer).await.unwrap();
    let stored = reopened.load_snapshot(&snapshot.id.unwrap()).await.unwrap();
    assert_eq!(stored.tree, snapshot.tree);

    let root = reopened.load_tree(&stored.tree).await.unwrap();
    assert_eq!(root.nodes.len(), 2);
    assert!(root.nodes[0].is_file());
    assert_eq!(root.nodes[1].name(), "sub");

    let subtree = root.nodes[1].subtree().unwrap();
    let sub = reopened.load_tree(&subtree).await.unwrap();
    assert_eq!(sub.nodes.len(), 1);
    assert!(matches!(&sub.nodes[0], Node::File { name, size: 5, .. } if name == "inner.txt"));

    assert_eq!(verify_tree(&reopened, stored.tree).await, 2);
}

/// Saves three single-chunk files one after the other.
struct ThreeChunks;

const CHUNKS: [&[u8]; 3] = [b"first chunk", b"second chunk", b"third chunk"];

#[async_trait]
impl TreeBuilder for ThreeChunks {
    async fn build(&self, repo: &Repository) -> Result<Id> {
        let mut tree = Tree::new();
        for (i, data) in CHUNKS.iter().enumerate() {
            let saved = repo.save_file(*data).await?;
            tree.add_node(saved.into_node(format!("file-{i}"), 0o644));
        }
        repo.save_tree(&tree).await
    }
}

#[tokio::test]
async fn test_failed_write_then_retry() {
    // one blob per pack, so every chunk save writes a pack
    let backend = Arc::new(FlakyBackend::failing_pack_writes(&[2]));
    let repo = Repository::init(backend.clone(), sealer(), test_config().with_max_pack_size(1))
        .await
        .unwrap();

    let err = repo
        .assemble_snapshot(paths(), now(), &ThreeChunks)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BackendWrite { .. }), "got {err}");
    assert_eq!(backend.pack_write_attempts(), 2);
    assert_eq!(backend.file_count(FileType::Snapshot), 0);

    let first = Id::hash(CHUNKS[0]);
    let second = Id::hash(CHUNKS[1]);
    assert!(repo.index_has(&first, BlobKind::Data));
    assert!(!repo.index_has(&second, BlobKind::Data));

    let snapshot = repo
        .assemble_snapshot(paths(), now(), &ThreeChunks)
        .await
        .unwrap();

    // second and third chunk plus the tree; the first chunk is not written again
    assert_eq!(backend.pack_write_attempts(), 5);
    assert_eq!(repo.stats().deduplicated, 1);

    let blobs = stored_blobs(&repo).await;
    assert_eq!(blobs.iter().filter(|(id, _)| *id == first).count(), 1);
    assert_eq!(blobs.len(), 4);
    assert_eq!(verify_tree(&repo, snapshot.tree).await, 1);
}

#[tokio::test]
async fn test_failed_flush_returns_no_snapshot() {
    let backend = Arc::new(FlakyBackend::failing_pack_writes(&[1]));
    let repo = Repository::init(backend.clone(), sealer(), test_config())
        .await
        .unwrap();
    let dir = VirtualDir::new().file("a", &b"a"[..]);

    // the data pack is written first and fails, the tree pack succeeds
    let err = repo.assemble_snapshot(paths(), now(), &dir).await.unwrap_err();
    assert!(matches!(err, Error::BackendWrite { .. }));
    // not stored, but still buffered for the next flush
    let a = BlobHandle::new(Id::hash(b"a"), BlobKind::Data);
    assert!(repo.index().lookup(&a).is_none());
    assert_eq!(repo.index().pending_count(), 1);
    assert_eq!(backend.file_count(FileType::Index), 0);
    // the snapshot record was persisted before the flush, but never returned
    assert_eq!(backend.file_count(FileType::Snapshot), 1);

    let snapshot = repo.assemble_snapshot(paths(), now(), &dir).await.unwrap();
    assert_eq!(backend.pack_write_attempts(), 3);
    assert_eq!(verify_tree(&repo, snapshot.tree).await, 1);
}

#[tokio::test]
async fn test_seal_failure_then_retry() {
    let backend = Arc::new(FlakyBackend::failing_pack_writes(&[]));
    let sealer = Arc::new(FailingSealer::new());
    let repo = Repository::init(backend.clone(), sealer.clone(), test_config())
        .await
        .unwrap();
    let dir = VirtualDir::new().file("secret", &b"sealed eventually"[..]);
    let id = Id::hash(b"sealed eventually");

    sealer.set_failing(true);
    let err = repo.assemble_snapshot(paths(), now(), &dir).await.unwrap_err();
    assert!(matches!(err, Error::Seal(_)), "got {err}");
    assert!(!repo.index_has(&id, BlobKind::Data));
    assert_eq!(backend.pack_write_attempts(), 0);
    assert_eq!(backend.file_count(FileType::Snapshot), 0);

    sealer.set_failing(false);
    let snapshot = repo.assemble_snapshot(paths(), now(), &dir).await.unwrap();
    assert_eq!(repo.stats().deduplicated, 0);
    assert_eq!(repo.load_blob(BlobKind::Data, &id).await.unwrap(), b"sealed eventually");
    assert_eq!(verify_tree(&repo, snapshot.tree).await, 1);
}

/// One stable file, then one whose source breaks partway unless `healed`.
struct BreakingSource {
    healed: bool,
}

const STABLE: &[u8] = b"stable content";

#[async_trait]
impl TreeBuilder for BreakingSource {
    async fn build(&self, repo: &Repository) -> Result<Id> {
        let mut tree = Tree::new();
        let stable = repo.save_file(STABLE).await?;
        tree.add_node(stable.into_node("stable", 0o644));

        let tail = vec![9u8; 5000];
        let saved = if self.healed {
            repo.save_file(&tail[..]).await?
        } else {
            repo.save_file(FailingReader::new(tail)).await?
        };
        tree.add_node(saved.into_node("tail", 0o644));
        repo.save_tree(&tree).await
    }
}

#[tokio::test]
async fn test_stream_failure_mid_assembly_then_retry() {
    let (backend, _sealer, repo) = memory_repo(test_config()).await;

    let err = repo
        .assemble_snapshot(paths(), now(), &BreakingSource { healed: false })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StreamRead(_)), "got {err}");
    assert_eq!(backend.file_count(FileType::Snapshot), 0);
    assert!(repo.index_has(&Id::hash(STABLE), BlobKind::Data));

    let snapshot = repo
        .assemble_snapshot(paths(), now(), &BreakingSource { healed: true })
        .await
        .unwrap();
    assert!(repo.stats().deduplicated >= 1);

    let blobs = stored_blobs(&repo).await;
    assert_eq!(blobs.iter().filter(|(id, _)| *id == Id::hash(STABLE)).count(), 1);
    assert_eq!(verify_tree(&repo, snapshot.tree).await, 1);
}

#[tokio::test]
async fn test_failed_index_write_fails_assembly() {
    let backend = Arc::new(FlakyBackend::failing_pack_writes(&[]));
    backend.set_index_writes_failing(true);
    let sealer = sealer();
    let repo = Repository::init(backend.clone(), sealer.clone(), test_config())
        .await
        .unwrap();
    let dir = VirtualDir::new().file("a", &b"a"[..]);

    let err = repo.assemble_snapshot(paths(), now(), &dir).await.unwrap_err();
    assert!(matches!(err, Error::IndexCheckpoint(_)), "got {err}");
    // packs and the snapshot record made it, the index did not
    assert_eq!(backend.file_count(FileType::Pack), 2);
    assert_eq!(backend.file_count(FileType::Snapshot), 1);
    assert_eq!(backend.file_count(FileType::Index), 0);

    backend.set_index_writes_failing(false);
    assert!(repo.checkpoint_index().await.unwrap().is_some());
    let reopened = Repository::open(backend, sealer).await.unwrap();
    assert!(reopened.index_has(&Id::hash(b"a"), BlobKind::Data));
}

#[tokio::test]
async fn test_fake_tree_is_deterministic() {
    let tree = FakeTree::new(42, 2).with_max_file_size(64 * 1024);

    let (_b1, _s1, first) = memory_repo(test_config()).await;
    let (_b2, _s2, second) = memory_repo(test_config()).await;
    let a = first.assemble_snapshot(paths(), now(), &tree).await.unwrap();
    let b = second.assemble_snapshot(paths(), now(), &tree).await.unwrap();
    assert_eq!(a.tree, b.tree);

    // a second pass over the same tree writes nothing new
    let before = first.stats();
    let again = first.assemble_snapshot(paths(), now(), &tree).await.unwrap();
    let after = first.stats();
    assert_eq!(again.tree, a.tree);
    assert_eq!(after.data_blobs, before.data_blobs);
    assert_eq!(after.tree_blobs, before.tree_blobs);
    assert_ne!(again.id, a.id);

    verify_tree(&first, a.tree).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assemblies_share_blobs() {
    let (_backend, _sealer, repo) = memory_repo(test_config()).await;
    let repo = Arc::new(repo);
    let dir = VirtualDir::new()
        .file("a.txt", vec![1u8; 5000])
        .dir("nested", VirtualDir::new().file("b.txt", vec![2u8; 9000]));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let repo = repo.clone();
        let dir = dir.clone();
        handles.push(tokio::spawn(async move {
            repo.assemble_snapshot(paths(), now(), &dir).await.unwrap()
        }));
    }

    let mut trees = Vec::new();
    for handle in handles {
        trees.push(handle.await.unwrap().tree);
    }
    trees.dedup();
    assert_eq!(trees.len(), 1);

    let mut blobs = stored_blobs(&repo).await;
    let total = blobs.len();
    blobs.sort();
    blobs.dedup();
    assert_eq!(total, blobs.len());
    assert_eq!(repo.list_snapshots().await.unwrap().len(), 4);
    verify_tree(&repo, trees[0]).await;
}
