use async_trait::async_trait;
use bytes::Bytes;
use snapvault_core::backend::{Backend, BackendType, FileType, Handle, WriteOutcome};
use snapvault_core::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const TEMP_PREFIX: &str = ".tmp-";

/// Repository stored in a local directory.
///
/// Files are written to a temporary name, synced, then hard-linked into
/// place. The link fails if the target exists, so concurrent writers of the
/// same name never replace each other's file.
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, handle: &Handle) -> PathBuf {
        self.base_path.join(handle.path())
    }

    async fn write_new(&self, handle: &Handle, data: &[u8]) -> std::io::Result<WriteOutcome> {
        let full_path = self.full_path(handle);
        let dir = full_path.parent().unwrap_or(&self.base_path).to_path_buf();
        fs::create_dir_all(&dir).await?;

        if fs::try_exists(&full_path).await? {
            return Ok(WriteOutcome::AlreadyExists);
        }

        let temp_path = dir.join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
        write_temp(&temp_path, data).await?;

        let linked = fs::hard_link(&temp_path, &full_path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(WriteOutcome::Created),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(WriteOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }
}

/// Writes and syncs `data` to `temp_path`, removing the file again if any
/// step fails.
async fn write_temp(temp_path: &Path, data: &[u8]) -> std::io::Result<()> {
    let result = async {
        let mut file = fs::File::create(temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }
    .await;
    if result.is_err() {
        let _ = fs::remove_file(temp_path).await;
    }
    result
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        for file_type in [FileType::Pack, FileType::Index, FileType::Snapshot] {
            fs::create_dir_all(self.base_path.join(file_type.dir())).await?;
        }
        Ok(())
    }

    async fn exists(&self, handle: &Handle) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(handle)).await?)
    }

    async fn read(&self, handle: &Handle) -> Result<Bytes> {
        let data = fs::read(self.full_path(handle))
            .await
            .map_err(|e| Error::Backend(format!("Failed to read {}: {}", handle, e)))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, handle: &Handle, data: Bytes) -> Result<WriteOutcome> {
        let outcome = self
            .write_new(handle, &data)
            .await
            .map_err(|e| Error::BackendWrite {
                path: handle.path(),
                message: e.to_string(),
            })?;
        debug!(file = %handle, size = data.len(), ?outcome, "local write");
        Ok(outcome)
    }

    async fn list(&self, file_type: FileType) -> Result<Vec<Handle>> {
        if file_type == FileType::Config {
            let config = Handle::config();
            return Ok(if self.exists(&config).await? { vec![config] } else { Vec::new() });
        }

        let dir = self.base_path.join(file_type.dir());
        let mut results = Vec::new();
        if !fs::try_exists(&dir).await? {
            return Ok(results);
        }

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with(TEMP_PREFIX) && entry.file_type().await?.is_file() {
                    results.push(Handle::new(file_type, name));
                }
            }
        }
        results.sort();
        Ok(results)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }
}
