use crate::tree::{Node, Tree};
use crate::{BlobKind, Error, Id, Repository, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use std::io::Read;
use tokio::sync::mpsc;
use tracing::debug;

// chunks read ahead of the saver by the blocking reader task
const CHUNK_QUEUE: usize = 4;

/// Produces the root tree of a snapshot.
///
/// Implementations walk some source (a directory, an in-memory description,
/// generated data), save every file and every directory level through the
/// repository, and return the ID of the root tree. A directory level must
/// only be saved after all of its children have been.
#[async_trait]
pub trait TreeBuilder: Send + Sync {
    async fn build(&self, repo: &Repository) -> Result<Id>;
}

/// Result of storing one file: its length and the ordered chunk IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub size: u64,
    pub content: Vec<Id>,
}

impl SavedFile {
    pub fn into_node(self, name: impl Into<String>, mode: u32) -> Node {
        Node::file(name, mode, self.size, self.content)
    }
}

impl Repository {
    /// Chunks `reader` and saves every chunk as a data blob.
    ///
    /// An empty stream yields an empty chunk list. A read error aborts the
    /// file; chunks saved before it stay in the store.
    pub async fn save_file<R: Read + Send>(&self, reader: R) -> Result<SavedFile> {
        let mut size = 0u64;
        let mut content = Vec::new();

        for chunk in self.chunker().chunks(reader) {
            let chunk = chunk?;
            size += chunk.length as u64;
            content.push(self.save(BlobKind::Data, chunk.data(), None).await?);
        }
        Ok(SavedFile { size, content })
    }

    /// Like [`Repository::save_file`], but reads and chunks `reader` on the
    /// blocking thread pool. Use it for files and other sources whose reads
    /// block.
    pub async fn save_blocking_reader<R: Read + Send + 'static>(&self, reader: R) -> Result<SavedFile> {
        let chunker = self.chunker().clone();
        let (tx, mut rx) = mpsc::channel(CHUNK_QUEUE);
        let producer = tokio::task::spawn_blocking(move || {
            for chunk in chunker.chunks(reader) {
                // the saver has stopped listening
                if tx.blocking_send(chunk).is_err() {
                    break;
                }
            }
        });

        let mut size = 0u64;
        let mut content = Vec::new();
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            size += chunk.length as u64;
            content.push(self.save(BlobKind::Data, chunk.data(), None).await?);
        }
        producer
            .await
            .map_err(|e| Error::Other(format!("chunking task failed: {e}")))?;
        Ok(SavedFile { size, content })
    }

    /// Saves a fully built directory level, skipping the write if an equal
    /// tree is already known.
    pub async fn save_tree(&self, tree: &Tree) -> Result<Id> {
        let data = tree.canonical_bytes()?;
        let id = Id::hash(&data);
        if self.index_has(&id, BlobKind::Tree) {
            debug!(tree = %id.short_string(), "tree already known");
            return Ok(id);
        }
        self.save(BlobKind::Tree, &data, Some(id)).await
    }
}

/// An in-memory directory to snapshot.
///
/// Entries keep insertion order, which becomes node order in the saved
/// tree. Children of one directory are saved concurrently.
#[derive(Debug, Clone, Default)]
pub struct VirtualDir {
    entries: Vec<VirtualEntry>,
}

#[derive(Debug, Clone)]
pub enum VirtualEntry {
    File { name: String, mode: u32, data: Bytes },
    Dir { name: String, mode: u32, dir: VirtualDir },
}

impl VirtualDir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.entries.push(VirtualEntry::File {
            name: name.into(),
            mode: 0o644,
            data: data.into(),
        });
        self
    }

    pub fn dir(mut self, name: impl Into<String>, dir: VirtualDir) -> Self {
        self.entries.push(VirtualEntry::Dir {
            name: name.into(),
            mode: 0o755,
            dir,
        });
        self
    }

    fn save<'a>(&'a self, repo: &'a Repository) -> BoxFuture<'a, Result<Id>> {
        async move {
            let nodes = future::try_join_all(self.entries.iter().map(|entry| entry.save(repo))).await?;
            save_nodes(repo, nodes).await
        }
        .boxed()
    }
}

impl VirtualEntry {
    fn save<'a>(&'a self, repo: &'a Repository) -> BoxFuture<'a, Result<Node>> {
        async move {
            match self {
                VirtualEntry::File { name, mode, data } => {
                    let saved = repo.save_file(&data[..]).await?;
                    Ok(saved.into_node(name.clone(), *mode))
                }
                VirtualEntry::Dir { name, mode, dir } => {
                    let subtree = dir.save(repo).await?;
                    Ok(Node::dir(name.clone(), *mode, subtree))
                }
            }
        }
        .boxed()
    }
}

async fn save_nodes(repo: &Repository, nodes: Vec<Node>) -> Result<Id> {
    repo.save_tree(&Tree { nodes }).await
}

#[async_trait]
impl TreeBuilder for VirtualDir {
    async fn build(&self, repo: &Repository) -> Result<Id> {
        self.save(repo).await
    }
}
