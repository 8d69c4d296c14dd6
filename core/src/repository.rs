use crate::backend::{Backend, FileType, Handle, WriteOutcome};
use crate::chunker::Chunker;
use crate::crypto::Sealer;
use crate::index::Index;
use crate::pack::{self, PackFile, PackManager};
use crate::snapshot::Snapshot;
use crate::tree::Tree;
use crate::types::encode_canonical;
use crate::{BlobHandle, BlobKind, Error, Id, RepoConfig, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// The content-addressed blob store.
///
/// A repository owns the deduplication index and the pack buffers, and
/// writes through a [`Backend`] after sealing everything with a [`Sealer`].
/// It is meant to be shared (`Arc<Repository>`) between concurrent savers:
/// every method takes `&self`.
///
/// # Layout
///
/// ```text
/// repository/
/// ├── config          # RepoConfig, plain JSON
/// ├── data/           # packs of sealed data and tree blobs
/// ├── index/          # sealed index checkpoints
/// └── snapshots/      # sealed snapshot records
/// ```
///
/// # Durability
///
/// [`Repository::save`] only buffers. A blob is durable once the pack that
/// holds it has been written, which happens when the pack fills up or on
/// [`Repository::flush`]. [`Repository::checkpoint_index`] persists index
/// entries for durable blobs only, and should be called after `flush`.
pub struct Repository {
    backend: Arc<dyn Backend>,
    sealer: Arc<dyn Sealer>,
    config: RepoConfig,
    chunker: Chunker,
    index: Index,
    packer: Mutex<PackManager>,
    // held shared by every save and pack upload; flush takes it exclusively
    // to wait for those in flight before collecting the open packs
    upload_gate: RwLock<()>,
    stats: SaveStats,
}

impl Repository {
    /// Creates a new repository on an empty backend.
    ///
    /// # Errors
    ///
    /// Returns `Error::RepositoryExists` if the backend already holds a config,
    /// and `Error::InvalidPolynomial` / `Error::InvalidFormatVersion` if the
    /// config does not validate.
    pub async fn init(backend: Arc<dyn Backend>, sealer: Arc<dyn Sealer>, config: RepoConfig) -> Result<Self> {
        config.validate()?;
        backend.init().await?;

        let config_handle = Handle::config();
        if backend.exists(&config_handle).await? {
            return Err(Error::RepositoryExists {
                path: config_handle.path(),
            });
        }

        let config_json = serde_json::to_vec_pretty(&config)?;
        backend
            .write(&config_handle, Bytes::from(config_json))
            .await
            .map_err(|e| backend_write_error(&config_handle, e))?;

        info!(repo = %config.id, polynomial = %config.chunker_polynomial, "initialized repository");
        Ok(Self::with_index(backend, sealer, config, Index::new()))
    }

    /// Opens an existing repository and loads every index checkpoint.
    pub async fn open(backend: Arc<dyn Backend>, sealer: Arc<dyn Sealer>) -> Result<Self> {
        let config_handle = Handle::config();
        if !backend.exists(&config_handle).await? {
            return Err(Error::RepositoryNotFound {
                path: config_handle.path(),
            });
        }

        let config_data = backend.read(&config_handle).await?;
        let config: RepoConfig = serde_json::from_slice(&config_data)?;
        config.validate()?;

        let index = Index::load_all(backend.as_ref(), sealer.as_ref()).await?;
        info!(repo = %config.id, blobs = index.len(), "opened repository");
        Ok(Self::with_index(backend, sealer, config, index))
    }

    fn with_index(backend: Arc<dyn Backend>, sealer: Arc<dyn Sealer>, config: RepoConfig, index: Index) -> Self {
        Self {
            chunker: Chunker::from_config(&config),
            packer: Mutex::new(PackManager::new(config.max_pack_size)),
            backend,
            sealer,
            config,
            index,
            upload_gate: RwLock::new(()),
            stats: SaveStats::default(),
        }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    pub fn index_has(&self, id: &Id, kind: BlobKind) -> bool {
        self.index.has(id, kind)
    }

    /// Stores a blob unless the index already accounts for it.
    ///
    /// The ID is computed from `plaintext`; if `expected` is given it must
    /// match. Returns once the sealed blob is buffered, or once its pack has
    /// been written if this blob filled the pack.
    pub async fn save(&self, kind: BlobKind, plaintext: &[u8], expected: Option<Id>) -> Result<Id> {
        let id = Id::hash(plaintext);
        if let Some(expected) = expected {
            if expected != id {
                return Err(Error::IdMismatch {
                    expected: expected.to_hex(),
                    actual: id.to_hex(),
                });
            }
        }

        if self.index.share(&id, kind) {
            self.skip_known(id, kind);
            return Ok(id);
        }

        let sealed = self.seal(plaintext)?;

        let _gate = self.upload_gate.read().await;
        if !self.index.mark(&id, kind) {
            // another saver got there while this one was sealing
            self.skip_known(id, kind);
            return Ok(id);
        }
        let full_pack = self.packer.lock().add_blob(kind, id, &sealed);
        self.stats.record_blob(kind, plaintext.len() as u64);
        debug!(blob = %BlobHandle::new(id, kind), size = plaintext.len(), "buffered blob");

        if let Some(pack) = full_pack {
            self.upload_pack(pack, Some(BlobHandle::new(id, kind))).await?;
        }
        Ok(id)
    }

    fn skip_known(&self, id: Id, kind: BlobKind) {
        self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
        debug!(blob = %BlobHandle::new(id, kind), "blob already known, skipping write");
    }

    /// Canonically serializes `value` and saves it as a packed blob.
    pub async fn save_structured<T: Serialize + ?Sized>(&self, kind: BlobKind, value: &T) -> Result<Id> {
        let data = encode_canonical(value)?;
        self.save(kind, &data, None).await
    }

    /// Writes `value` as its own file, bypassing packs and the index.
    ///
    /// The returned ID is the hash of the sealed bytes, so two calls with
    /// equal values produce two distinct files.
    pub async fn save_unpacked<T: Serialize + ?Sized>(&self, file_type: FileType, value: &T) -> Result<Id> {
        let plaintext = encode_canonical(value)?;
        let sealed = self.seal(&plaintext)?;
        let id = Id::hash(&sealed);
        let handle = Handle::new(file_type, id.to_hex());

        let outcome = self
            .backend
            .write(&handle, Bytes::from(sealed))
            .await
            .map_err(|e| backend_write_error(&handle, e))?;
        if outcome == WriteOutcome::AlreadyExists {
            debug!(file = %handle, "unpacked file already stored");
        }
        Ok(id)
    }

    /// Writes every pack buffered so far.
    ///
    /// Waits for saves and uploads already in flight first, so blobs that
    /// other savers buffered or re-buffered after a failed upload are
    /// included. Blobs buffered after the call began may or may not be.
    pub async fn flush(&self) -> Result<()> {
        let gate = self.upload_gate.write().await;
        let packs = self.packer.lock().finish_all();
        let _gate = gate.downgrade();
        debug!(packs = packs.len(), "flushing packs");

        let mut result = Ok(());
        for pack in packs {
            if let Err(e) = self.upload_pack(pack, None).await {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Persists index entries for every durable blob not yet checkpointed.
    ///
    /// Blobs still buffered are left out, which is why callers flush first:
    /// a checkpoint without a preceding flush records less, never more,
    /// than what is durable.
    pub async fn checkpoint_index(&self) -> Result<Option<Id>> {
        self.index
            .checkpoint(self.backend.as_ref(), self.sealer.as_ref())
            .await
    }

    /// Writes a pack. `own` is the blob whose save filled it, if any.
    ///
    /// On failure `own` is dropped from the index unless another saver
    /// deduplicated against it; every other blob of the pack was already
    /// reported as saved, so it is buffered again for the next write.
    async fn upload_pack(&self, pack: PackFile, own: Option<BlobHandle>) -> Result<()> {
        let result = self.write_pack(&pack).await;
        if let Err(e) = &result {
            let dropped = own.filter(|handle| self.index.forget_unshared(handle));
            let requeued = self
                .packer
                .lock()
                .requeue(&pack, |blob| Some(blob.handle()) != dropped);
            warn!(blobs = pack.len(), requeued, error = %e, "pack upload failed");
        }
        result
    }

    async fn write_pack(&self, pack: &PackFile) -> Result<()> {
        let finished = pack.finish(self.sealer.as_ref()).await?;
        let handle = Handle::new(FileType::Pack, finished.id.to_hex());
        let size = finished.bytes.len();

        let outcome = self
            .backend
            .write(&handle, finished.bytes.clone())
            .await
            .map_err(|e| backend_write_error(&handle, e))?;
        self.index.record_pack(finished.id, &finished.blobs);
        self.stats.packs.fetch_add(1, Ordering::Relaxed);
        if outcome == WriteOutcome::AlreadyExists {
            debug!(pack = %finished.id.short_string(), "identical pack already stored");
        }
        info!(pack = %finished.id.short_string(), blobs = finished.blobs.len(), size, "saved pack");
        Ok(())
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.sealer.seal(plaintext).map_err(|e| match e {
            Error::Seal(_) => e,
            other => Error::Seal(other.to_string()),
        })
    }

    /// Reads a durable blob back and checks it against its ID.
    pub async fn load_blob(&self, kind: BlobKind, id: &Id) -> Result<Vec<u8>> {
        let handle = BlobHandle::new(*id, kind);
        let location = self.index.lookup(&handle).ok_or_else(|| Error::BlobNotFound {
            kind: kind.to_string(),
            id: id.to_hex(),
        })?;

        let pack_bytes = self
            .backend
            .read(&Handle::new(FileType::Pack, location.pack_id.to_hex()))
            .await?;
        let sealed = pack::blob_bytes(&pack_bytes, location.offset, location.length).ok_or_else(|| {
            Error::CorruptedPack {
                id: location.pack_id.to_hex(),
            }
        })?;

        let plaintext = self.sealer.open(sealed)?;
        if Id::hash(&plaintext) != *id {
            return Err(Error::CorruptedPack {
                id: location.pack_id.to_hex(),
            });
        }
        Ok(plaintext)
    }

    pub async fn load_tree(&self, id: &Id) -> Result<Tree> {
        let data = self.load_blob(BlobKind::Tree, id).await?;
        Tree::from_bytes(&data)
    }

    /// Lists the blobs recorded in a stored pack's own header.
    pub async fn list_pack(&self, pack_id: &Id) -> Result<Vec<pack::PackedBlob>> {
        let bytes = self
            .backend
            .read(&Handle::new(FileType::Pack, pack_id.to_hex()))
            .await?;
        Ok(pack::read_header(pack_id, &bytes, self.sealer.as_ref())?.blobs)
    }

    pub async fn list_packs(&self) -> Result<Vec<Id>> {
        parse_ids(self.backend.list(FileType::Pack).await?)
    }

    pub async fn load_snapshot(&self, id: &Id) -> Result<Snapshot> {
        let sealed = self
            .backend
            .read(&Handle::new(FileType::Snapshot, id.to_hex()))
            .await?;
        let plaintext = self.sealer.open(&sealed)?;
        let mut snapshot: Snapshot = serde_json::from_slice(&plaintext)?;
        snapshot.id = Some(*id);
        Ok(snapshot)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<Id>> {
        parse_ids(self.backend.list(FileType::Snapshot).await?)
    }
}

fn parse_ids(handles: Vec<Handle>) -> Result<Vec<Id>> {
    handles
        .iter()
        .map(|h| {
            h.name
                .parse()
                .map_err(|_| Error::Backend(format!("unexpected file {}", h)))
        })
        .collect()
}

fn backend_write_error(handle: &Handle, err: Error) -> Error {
    match err {
        Error::BackendWrite { .. } => err,
        other => Error::BackendWrite {
            path: handle.path(),
            message: other.to_string(),
        },
    }
}

#[derive(Debug, Default)]
struct SaveStats {
    data_blobs: AtomicU64,
    tree_blobs: AtomicU64,
    deduplicated: AtomicU64,
    bytes: AtomicU64,
    packs: AtomicU64,
}

impl SaveStats {
    fn record_blob(&self, kind: BlobKind, size: u64) {
        match kind {
            BlobKind::Data => self.data_blobs.fetch_add(1, Ordering::Relaxed),
            BlobKind::Tree => self.tree_blobs.fetch_add(1, Ordering::Relaxed),
        };
        self.bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Stats {
        Stats {
            data_blobs: self.data_blobs.load(Ordering::Relaxed),
            tree_blobs: self.tree_blobs.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            packs: self.packs.load(Ordering::Relaxed),
        }
    }
}

/// Counters for this session. `data_blobs` and `tree_blobs` count blobs
/// actually buffered for writing; `deduplicated` counts skipped saves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub data_blobs: u64,
    pub tree_blobs: u64,
    pub deduplicated: u64,
    pub bytes: u64,
    pub packs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::crypto::{Encryptor, MasterKey};
    use crate::polynomial::Polynomial;

    fn test_config() -> RepoConfig {
        RepoConfig::with_polynomial(Polynomial::new(0x3DA3358B4DC173))
    }

    async fn memory_repo() -> (Arc<MemoryBackend>, Arc<Encryptor>, Repository) {
        let backend = Arc::new(MemoryBackend::new());
        let sealer = Arc::new(Encryptor::from_master_key(&MasterKey::generate()));
        let repo = Repository::init(backend.clone(), sealer.clone(), test_config())
            .await
            .unwrap();
        (backend, sealer, repo)
    }

    #[tokio::test]
    async fn test_init_twice_fails() {
        let (backend, sealer, _repo) = memory_repo().await;
        let err = Repository::init(backend, sealer, test_config()).await;
        assert!(matches!(err, Err(Error::RepositoryExists { .. })));
    }

    #[tokio::test]
    async fn test_open_missing_repository() {
        let backend = Arc::new(MemoryBackend::new());
        let sealer = Arc::new(Encryptor::from_master_key(&MasterKey::generate()));
        let err = Repository::open(backend, sealer).await;
        assert!(matches!(err, Err(Error::RepositoryNotFound { .. })));
    }

    #[tokio::test]
    async fn test_save_rejects_wrong_expected_id() {
        let (_backend, _sealer, repo) = memory_repo().await;
        let err = repo
            .save(BlobKind::Data, b"content", Some(Id::hash(b"other")))
            .await;
        assert!(matches!(err, Err(Error::IdMismatch { .. })));
        assert!(!repo.index_has(&Id::hash(b"content"), BlobKind::Data));
    }

    #[tokio::test]
    async fn test_save_is_buffered_until_flush() {
        let (backend, _sealer, repo) = memory_repo().await;
        let id = repo.save(BlobKind::Data, b"hello", None).await.unwrap();

        assert!(repo.index_has(&id, BlobKind::Data));
        assert_eq!(backend.file_count(FileType::Pack), 0);
        assert!(matches!(
            repo.load_blob(BlobKind::Data, &id).await,
            Err(Error::BlobNotFound { .. })
        ));

        repo.flush().await.unwrap();
        assert_eq!(backend.file_count(FileType::Pack), 1);
        assert_eq!(repo.load_blob(BlobKind::Data, &id).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_same_id_different_kind_is_stored_twice() {
        let (_backend, _sealer, repo) = memory_repo().await;
        repo.save(BlobKind::Data, b"{}\n", None).await.unwrap();
        repo.save(BlobKind::Tree, b"{}\n", None).await.unwrap();
        let stats = repo.stats();
        assert_eq!(stats.data_blobs, 1);
        assert_eq!(stats.tree_blobs, 1);
        assert_eq!(stats.deduplicated, 0);
    }

    #[tokio::test]
    async fn test_full_pack_is_written_by_save() {
        let backend = Arc::new(MemoryBackend::new());
        let sealer = Arc::new(Encryptor::from_master_key(&MasterKey::generate()));
        let repo = Repository::init(backend.clone(), sealer, test_config().with_max_pack_size(1))
            .await
            .unwrap();

        let id = repo.save(BlobKind::Data, b"fills a pack", None).await.unwrap();
        assert_eq!(backend.file_count(FileType::Pack), 1);
        assert!(repo.index().lookup(&BlobHandle::new(id, BlobKind::Data)).is_some());
        assert_eq!(repo.stats().packs, 1);
    }

    #[tokio::test]
    async fn test_save_unpacked_is_never_deduplicated() {
        let (backend, _sealer, repo) = memory_repo().await;
        let value = serde_json::json!({"same": "value"});
        let a = repo.save_unpacked(FileType::Snapshot, &value).await.unwrap();
        let b = repo.save_unpacked(FileType::Snapshot, &value).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.file_count(FileType::Snapshot), 2);
        assert!(repo.index().is_empty());
    }

    #[tokio::test]
    async fn test_list_pack_reads_header() {
        let (_backend, _sealer, repo) = memory_repo().await;
        let a = repo.save(BlobKind::Data, b"a", None).await.unwrap();
        let b = repo.save(BlobKind::Data, b"b", None).await.unwrap();
        repo.flush().await.unwrap();

        let packs = repo.list_packs().await.unwrap();
        assert_eq!(packs.len(), 1);
        let blobs = repo.list_pack(&packs[0]).await.unwrap();
        let ids: Vec<Id> = blobs.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[tokio::test]
    async fn test_reopen_sees_checkpointed_blobs() {
        let (backend, sealer, repo) = memory_repo().await;
        let id = repo.save(BlobKind::Data, b"persist me", None).await.unwrap();
        repo.flush().await.unwrap();
        repo.checkpoint_index().await.unwrap();

        let reopened = Repository::open(backend, sealer).await.unwrap();
        assert!(reopened.index_has(&id, BlobKind::Data));
        assert_eq!(reopened.config(), repo.config());
        assert_eq!(
            reopened.load_blob(BlobKind::Data, &id).await.unwrap(),
            b"persist me"
        );
    }
}
