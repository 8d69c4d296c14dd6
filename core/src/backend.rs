use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileType {
    Config,
    Pack,
    Index,
    Snapshot,
}

impl FileType {
    pub fn dir(&self) -> &'static str {
        match self {
            FileType::Config => "",
            FileType::Pack => "data",
            FileType::Index => "index",
            FileType::Snapshot => "snapshots",
        }
    }
}

/// Names one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(file_type: FileType, name: impl Into<String>) -> Self {
        Self {
            file_type,
            name: name.into(),
        }
    }

    pub fn config() -> Self {
        Self::new(FileType::Config, "config")
    }

    /// Relative path of the file inside a repository.
    pub fn path(&self) -> String {
        match self.file_type {
            FileType::Config => self.name.clone(),
            other => format!("{}/{}", other.dir(), self.name),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Memory,
    Local,
}

/// Durable storage for opaque sealed files.
///
/// Writes are create-only: writing a handle that already exists leaves the
/// stored file untouched and reports [`WriteOutcome::AlreadyExists`]. A write
/// that returns `Ok` is durable.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn exists(&self, handle: &Handle) -> Result<bool>;

    async fn read(&self, handle: &Handle) -> Result<Bytes>;

    async fn write(&self, handle: &Handle, data: Bytes) -> Result<WriteOutcome>;

    async fn list(&self, file_type: FileType) -> Result<Vec<Handle>>;

    fn backend_type(&self) -> BackendType;
}

/// Backend keeping every file in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    files: RwLock<BTreeMap<Handle, Bytes>>,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes that created a file.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn file_count(&self, file_type: FileType) -> usize {
        self.files
            .read()
            .keys()
            .filter(|h| h.file_type == file_type)
            .count()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, handle: &Handle) -> Result<bool> {
        Ok(self.files.read().contains_key(handle))
    }

    async fn read(&self, handle: &Handle) -> Result<Bytes> {
        self.files
            .read()
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("{} does not exist", handle)))
    }

    async fn write(&self, handle: &Handle, data: Bytes) -> Result<WriteOutcome> {
        let mut files = self.files.write();
        if files.contains_key(handle) {
            return Ok(WriteOutcome::AlreadyExists);
        }
        files.insert(handle.clone(), data);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(WriteOutcome::Created)
    }

    async fn list(&self, file_type: FileType) -> Result<Vec<Handle>> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|h| h.file_type == file_type)
            .cloned()
            .collect())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}
