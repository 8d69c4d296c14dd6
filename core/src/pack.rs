use crate::crypto::Sealer;
use crate::{BlobHandle, BlobKind, Error, Id, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackHeader {
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub blobs: Vec<PackedBlob>,
}

/// Location of one sealed blob inside a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedBlob {
    pub id: Id,
    pub kind: BlobKind,
    pub offset: u64,
    pub length: u64,
}

impl PackedBlob {
    pub fn handle(&self) -> BlobHandle {
        BlobHandle::new(self.id, self.kind)
    }
}

/// A pack being filled in memory.
///
/// On-disk layout: the sealed blobs back to back, then the sealed header,
/// then the header length as a little-endian `u32`.
#[derive(Debug)]
pub struct PackFile {
    kind: BlobKind,
    header: PackHeader,
    data: Vec<u8>,
}

impl PackFile {
    pub fn new(kind: BlobKind) -> Self {
        Self {
            kind,
            header: PackHeader {
                created_at: chrono::Utc::now(),
                blobs: Vec::new(),
            },
            data: Vec::new(),
        }
    }

    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    pub fn add_blob(&mut self, id: Id, sealed: &[u8]) {
        let blob = PackedBlob {
            id,
            kind: self.kind,
            offset: self.data.len() as u64,
            length: sealed.len() as u64,
        };
        self.data.extend_from_slice(sealed);
        self.header.blobs.push(blob);
    }

    pub fn len(&self) -> usize {
        self.header.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.header.blobs.is_empty()
    }

    pub fn is_full(&self, max_size: u64) -> bool {
        self.data.len() as u64 >= max_size
    }

    pub fn blobs(&self) -> &[PackedBlob] {
        &self.header.blobs
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W, sealer: &dyn Sealer) -> Result<()> {
        let header_data = bincode::serialize(&self.header)?;
        let sealed_header = sealer.seal(&header_data)?;

        writer.write_all(&self.data).await?;
        let header_len = u32::try_from(sealed_header.len())
            .map_err(|_| Error::Other(format!("pack header too large: {} bytes", sealed_header.len())))?;
        writer.write_all(&sealed_header).await?;
        writer.write_u32_le(header_len).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Serializes the pack. The pack ID is the hash of the resulting bytes.
    ///
    /// The pack itself is kept so its blobs can be buffered again if the
    /// upload fails.
    pub async fn finish(&self, sealer: &dyn Sealer) -> Result<FinishedPack> {
        let mut buf = Vec::with_capacity(self.data.len() + 64 * self.header.blobs.len() + 64);
        self.write_to(&mut buf, sealer).await?;
        Ok(FinishedPack {
            id: Id::hash(&buf),
            bytes: Bytes::from(buf),
            blobs: self.header.blobs.clone(),
        })
    }
}

pub struct FinishedPack {
    pub id: Id,
    pub bytes: Bytes,
    pub blobs: Vec<PackedBlob>,
}

/// Parses the trailing header of a stored pack.
pub fn read_header(pack_id: &Id, bytes: &[u8], sealer: &dyn Sealer) -> Result<PackHeader> {
    let corrupted = || Error::CorruptedPack {
        id: pack_id.to_hex(),
    };

    let len_start = bytes.len().checked_sub(4).ok_or_else(corrupted)?;
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[len_start..]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let header_start = len_start.checked_sub(header_len).ok_or_else(corrupted)?;
    let header_data = sealer.open(&bytes[header_start..len_start])?;
    let header: PackHeader = bincode::deserialize(&header_data)?;

    if header
        .blobs
        .iter()
        .any(|b| blob_bytes(&bytes[..header_start], b.offset, b.length).is_none())
    {
        return Err(corrupted());
    }
    Ok(header)
}

/// Returns the sealed bytes at `offset..offset + length`, or `None` if the
/// range does not fit in `bytes`.
pub fn blob_bytes(bytes: &[u8], offset: u64, length: u64) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(length).ok()?)?;
    bytes.get(start..end)
}

/// Buffers sealed blobs into one open pack per blob kind.
#[derive(Debug)]
pub struct PackManager {
    data_pack: Option<PackFile>,
    tree_pack: Option<PackFile>,
    max_pack_size: u64,
}

impl PackManager {
    pub fn new(max_pack_size: u64) -> Self {
        Self {
            data_pack: None,
            tree_pack: None,
            max_pack_size,
        }
    }

    fn slot(&mut self, kind: BlobKind) -> &mut Option<PackFile> {
        match kind {
            BlobKind::Data => &mut self.data_pack,
            BlobKind::Tree => &mut self.tree_pack,
        }
    }

    /// Appends a blob; returns the pack if this blob filled it.
    pub fn add_blob(&mut self, kind: BlobKind, id: Id, sealed: &[u8]) -> Option<PackFile> {
        let max_pack_size = self.max_pack_size;
        let slot = self.slot(kind);
        let pack = slot.get_or_insert_with(|| PackFile::new(kind));
        pack.add_blob(id, sealed);

        if pack.is_full(max_pack_size) {
            return slot.take();
        }
        None
    }

    /// Buffers the blobs of a pack whose upload failed again, except those
    /// rejected by `keep`. Returns how many were buffered.
    ///
    /// They join the open pack of their kind even if that overfills it; the
    /// next save or flush writes it.
    pub fn requeue(&mut self, failed: &PackFile, keep: impl Fn(&PackedBlob) -> bool) -> usize {
        let slot = self.slot(failed.kind());
        let pack = slot.get_or_insert_with(|| PackFile::new(failed.kind()));
        let mut count = 0;
        for blob in failed.blobs().iter().filter(|b| keep(b)) {
            if let Some(sealed) = blob_bytes(&failed.data, blob.offset, blob.length) {
                pack.add_blob(blob.id, sealed);
                count += 1;
            }
        }
        if pack.is_empty() {
            *slot = None;
        }
        count
    }

    /// Takes every open pack that holds at least one blob.
    pub fn finish_all(&mut self) -> Vec<PackFile> {
        [self.data_pack.take(), self.tree_pack.take()]
            .into_iter()
            .flatten()
            .filter(|pack| !pack.is_empty())
            .collect()
    }
}
