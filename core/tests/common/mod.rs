#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use snapvault_core::backend::{Backend, BackendType, FileType, Handle, MemoryBackend, WriteOutcome};
use snapvault_core::crypto::{Encryptor, MasterKey, Sealer};
use snapvault_core::polynomial::Polynomial;
use snapvault_core::tree::Node;
use snapvault_core::{BlobKind, Error, Id, RepoConfig, Repository, Result};
use std::collections::HashSet;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub const POLYNOMIAL: Polynomial = Polynomial::new(0x3DA3358B4DC173);

pub fn test_config() -> RepoConfig {
    RepoConfig::with_polynomial(POLYNOMIAL).with_chunk_sizes(256, 1024, 4096)
}

pub fn sealer() -> Arc<Encryptor> {
    Arc::new(Encryptor::from_master_key(&MasterKey::generate()))
}

pub async fn memory_repo(config: RepoConfig) -> (Arc<MemoryBackend>, Arc<Encryptor>, Repository) {
    let backend = Arc::new(MemoryBackend::new());
    let sealer = sealer();
    let repo = Repository::init(backend.clone(), sealer.clone(), config)
        .await
        .unwrap();
    (backend, sealer, repo)
}

/// Memory backend that fails selected pack writes, counted from 1, and
/// optionally every index write.
pub struct FlakyBackend {
    inner: MemoryBackend,
    pack_writes: AtomicUsize,
    fail_on: Mutex<HashSet<usize>>,
    failure_delay: Option<Duration>,
    fail_index_writes: AtomicBool,
}

impl FlakyBackend {
    pub fn failing_pack_writes(attempts: &[usize]) -> Self {
        Self {
            inner: MemoryBackend::new(),
            pack_writes: AtomicUsize::new(0),
            fail_on: Mutex::new(attempts.iter().copied().collect()),
            failure_delay: None,
            fail_index_writes: AtomicBool::new(false),
        }
    }

    /// Failing pack writes wait this long before returning their error.
    pub fn with_failure_delay(mut self, delay: Duration) -> Self {
        self.failure_delay = Some(delay);
        self
    }

    pub fn set_index_writes_failing(&self, failing: bool) {
        self.fail_index_writes.store(failing, Ordering::SeqCst);
    }

    pub fn pack_write_attempts(&self) -> usize {
        self.pack_writes.load(Ordering::SeqCst)
    }

    pub fn file_count(&self, file_type: FileType) -> usize {
        self.inner.file_count(file_type)
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn exists(&self, handle: &Handle) -> Result<bool> {
        self.inner.exists(handle).await
    }

    async fn read(&self, handle: &Handle) -> Result<Bytes> {
        self.inner.read(handle).await
    }

    async fn write(&self, handle: &Handle, data: Bytes) -> Result<WriteOutcome> {
        match handle.file_type {
            FileType::Pack => {
                let attempt = self.pack_writes.fetch_add(1, Ordering::SeqCst) + 1;
                if self.fail_on.lock().remove(&attempt) {
                    if let Some(delay) = self.failure_delay {
                        tokio::time::sleep(delay).await;
                    }
                    return Err(Error::Backend(format!("injected failure on pack write {attempt}")));
                }
            }
            FileType::Index if self.fail_index_writes.load(Ordering::SeqCst) => {
                return Err(Error::Backend("injected failure on index write".to_string()));
            }
            _ => {}
        }
        self.inner.write(handle, data).await
    }

    async fn list(&self, file_type: FileType) -> Result<Vec<Handle>> {
        self.inner.list(file_type).await
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}

/// Sealer that fails while `failing` is set.
pub struct FailingSealer {
    inner: Encryptor,
    failing: AtomicBool,
}

impl FailingSealer {
    pub fn new() -> Self {
        Self {
            inner: Encryptor::from_master_key(&MasterKey::generate()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Sealer for FailingSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Seal("injected seal failure".to_string()));
        }
        self.inner.seal(plaintext)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        self.inner.open(sealed)
    }
}

/// Yields `data`, then fails instead of reporting end of stream.
pub struct FailingReader {
    data: Vec<u8>,
    pos: usize,
}

impl FailingReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.data.len() {
            return Err(io::Error::other("device went away"));
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Every blob stored in the repository's packs, read from the pack headers.
pub async fn stored_blobs(repo: &Repository) -> Vec<(Id, BlobKind)> {
    let mut blobs = Vec::new();
    for pack in repo.list_packs().await.unwrap() {
        for blob in repo.list_pack(&pack).await.unwrap() {
            blobs.push((blob.id, blob.kind));
        }
    }
    blobs
}

/// Loads every tree and data blob reachable from `root`; returns the number
/// of trees visited.
pub fn verify_tree<'a>(repo: &'a Repository, root: Id) -> BoxFuture<'a, usize> {
    async move {
        let tree = repo.load_tree(&root).await.unwrap();
        let mut trees = 1;
        for node in &tree.nodes {
            match node {
                Node::File { size, content, .. } => {
                    let mut total = 0u64;
                    for id in content {
                        total += repo.load_blob(BlobKind::Data, id).await.unwrap().len() as u64;
                    }
                    assert_eq!(total, *size, "size of {}", node.name());
                }
                Node::Dir { subtree, .. } => trees += verify_tree(repo, *subtree).await,
            }
        }
        trees
    }
    .boxed()
}
