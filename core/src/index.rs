use crate::backend::{Backend, FileType, Handle};
use crate::crypto::Sealer;
use crate::pack::PackedBlob;
use crate::{BlobHandle, BlobKind, Error, Id, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobLocation {
    pub pack_id: Id,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    /// Marked by a saver, its pack is not durable yet. `shared` is set once
    /// another saver has skipped its own write because of this entry.
    Pending { shared: bool },
    Stored {
        location: BlobLocation,
        persisted: bool,
    },
}

/// Serialized form of one checkpoint, grouped by pack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexFile {
    pub packs: Vec<IndexPack>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPack {
    pub id: Id,
    pub blobs: Vec<PackedBlob>,
}

impl IndexFile {
    pub fn blob_count(&self) -> usize {
        self.packs.iter().map(|p| p.blobs.len()).sum()
    }
}

/// The deduplication index: which (id, kind) pairs are stored or about to be.
///
/// All methods take `&self`; the entry table sits behind one mutex so that
/// check-then-mark is a single atomic step.
#[derive(Debug, Default)]
pub struct Index {
    entries: Mutex<HashMap<BlobHandle, Entry>>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, id: &Id, kind: BlobKind) -> bool {
        self.entries.lock().contains_key(&BlobHandle::new(*id, kind))
    }

    /// Returns `true` if the pair is stored or pending. A pending entry is
    /// then flagged as shared: the caller relies on it instead of writing.
    pub fn share(&self, id: &Id, kind: BlobKind) -> bool {
        match self.entries.lock().get_mut(&BlobHandle::new(*id, kind)) {
            Some(Entry::Pending { shared }) => {
                *shared = true;
                true
            }
            Some(Entry::Stored { .. }) => true,
            None => false,
        }
    }

    /// Records the pair as accounted for. Returns `false` if it already was,
    /// in which case the caller must not write it again.
    pub fn mark(&self, id: &Id, kind: BlobKind) -> bool {
        let mut entries = self.entries.lock();
        let handle = BlobHandle::new(*id, kind);
        match entries.get_mut(&handle) {
            Some(Entry::Pending { shared }) => {
                *shared = true;
                false
            }
            Some(Entry::Stored { .. }) => false,
            None => {
                entries.insert(handle, Entry::Pending { shared: false });
                true
            }
        }
    }

    /// Drops the pending mark of a blob whose write failed, unless another
    /// saver already relies on it. Returns whether the mark was dropped.
    pub fn forget_unshared(&self, handle: &BlobHandle) -> bool {
        let mut entries = self.entries.lock();
        if matches!(entries.get(handle), Some(Entry::Pending { shared: false })) {
            entries.remove(handle);
            return true;
        }
        false
    }

    /// Called once the pack holding these blobs is durable.
    pub fn record_pack(&self, pack_id: Id, blobs: &[PackedBlob]) {
        let mut entries = self.entries.lock();
        for blob in blobs {
            let location = BlobLocation {
                pack_id,
                offset: blob.offset,
                length: blob.length,
            };
            let entry = entries.entry(blob.handle()).or_insert(Entry::Pending { shared: false });
            if matches!(entry, Entry::Pending { .. }) {
                *entry = Entry::Stored {
                    location,
                    persisted: false,
                };
            }
        }
    }

    pub fn lookup(&self, handle: &BlobHandle) -> Option<BlobLocation> {
        match self.entries.lock().get(handle) {
            Some(Entry::Stored { location, .. }) => Some(*location),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| matches!(e, Entry::Pending { .. }))
            .count()
    }

    /// Durable entries not yet written by a checkpoint.
    pub fn unsaved(&self) -> IndexFile {
        let entries = self.entries.lock();
        let mut packs: BTreeMap<Id, Vec<PackedBlob>> = BTreeMap::new();
        for (handle, entry) in entries.iter() {
            if let Entry::Stored {
                location,
                persisted: false,
            } = entry
            {
                packs.entry(location.pack_id).or_default().push(PackedBlob {
                    id: handle.id,
                    kind: handle.kind,
                    offset: location.offset,
                    length: location.length,
                });
            }
        }
        IndexFile {
            packs: packs
                .into_iter()
                .map(|(id, mut blobs)| {
                    blobs.sort_by_key(|b| b.offset);
                    IndexPack { id, blobs }
                })
                .collect(),
        }
    }

    fn mark_persisted(&self, file: &IndexFile) {
        let mut entries = self.entries.lock();
        for pack in &file.packs {
            for blob in &pack.blobs {
                if let Some(Entry::Stored { persisted, .. }) = entries.get_mut(&blob.handle()) {
                    *persisted = true;
                }
            }
        }
    }

    /// Merges a loaded index file; its entries count as already persisted.
    pub fn merge(&self, file: IndexFile) {
        let mut entries = self.entries.lock();
        for pack in file.packs {
            for blob in pack.blobs {
                entries.insert(
                    blob.handle(),
                    Entry::Stored {
                        location: BlobLocation {
                            pack_id: pack.id,
                            offset: blob.offset,
                            length: blob.length,
                        },
                        persisted: true,
                    },
                );
            }
        }
    }

    /// Writes every durable, not yet persisted entry as a new index file.
    ///
    /// Pending entries are never written, so a checkpoint taken before a
    /// flush simply omits the blobs still buffered. Returns the ID of the
    /// written file, or `None` if there was nothing to save.
    pub async fn checkpoint(&self, backend: &dyn Backend, sealer: &dyn Sealer) -> Result<Option<Id>> {
        let file = self.unsaved();
        if file.packs.is_empty() {
            debug!("index checkpoint: nothing to save");
            return Ok(None);
        }

        let id = write_index_file(&file, backend, sealer)
            .await
            .map_err(|e| Error::IndexCheckpoint(e.to_string()))?;
        self.mark_persisted(&file);

        info!(index = %id.short_string(), packs = file.packs.len(), blobs = file.blob_count(), "saved index");
        Ok(Some(id))
    }

    /// Loads and merges every index file in the repository.
    pub async fn load_all(backend: &dyn Backend, sealer: &dyn Sealer) -> Result<Self> {
        let index = Index::new();
        let handles = backend.list(FileType::Index).await?;
        for handle in &handles {
            let sealed = backend.read(handle).await?;
            let plaintext = sealer.open(&sealed)?;
            let file: IndexFile = serde_json::from_slice(&plaintext)?;
            index.merge(file);
        }
        debug!(files = handles.len(), blobs = index.len(), "loaded index");
        Ok(index)
    }
}

async fn write_index_file(file: &IndexFile, backend: &dyn Backend, sealer: &dyn Sealer) -> Result<Id> {
    let plaintext = serde_json::to_vec(file)?;
    let id = Id::hash(&plaintext);
    let sealed = sealer.seal(&plaintext)?;
    backend
        .write(&Handle::new(FileType::Index, id.to_hex()), Bytes::from(sealed))
        .await?;
    Ok(id)
}
