use anyhow::{Result, anyhow};
use async_trait::async_trait;
use clap::Args;
use futures::future::{BoxFuture, FutureExt};
use snapvault_core::tree::{Node, Tree};
use snapvault_core::{Error, Id, Repository, SnapshotOptions, TreeBuilder};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Paths to backup")]
    paths: Vec<String>,

    #[arg(long, help = "Backup tags")]
    tag: Vec<String>,

    #[arg(long, help = "Parent snapshot ID")]
    parent: Option<String>,

    #[arg(long, help = "Hostname override")]
    hostname: Option<String>,
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        if self.paths.is_empty() {
            return Err(anyhow!("At least one path must be specified"));
        }

        let paths: Vec<PathBuf> = self.paths.iter().map(PathBuf::from).collect();
        for path in &paths {
            if !path.exists() {
                return Err(anyhow!("Path does not exist: {}", path.display()));
            }
        }

        let parent = self
            .parent
            .as_deref()
            .map(|p| p.parse::<Id>().map_err(|e| anyhow!("Invalid parent snapshot ID {}: {}", p, e)))
            .transpose()?;

        let repo = super::open_repository(cli).await?;
        info!("Starting backup of {} paths", paths.len());

        let options = SnapshotOptions {
            tags: self.tag.clone(),
            parent,
            hostname: self.hostname.clone(),
        };
        let builder = FsTree::new(paths.clone());
        let snapshot = repo
            .assemble_snapshot_with(paths, chrono::Utc::now(), &builder, options)
            .await?;

        super::print_summary(&snapshot, &repo.stats());
        Ok(())
    }
}

/// Builds a tree from paths on the local filesystem.
///
/// The root tree gets one node per source path, in argument order.
/// Directory entries are ordered by file name so that an unchanged
/// directory always produces the same tree. Symlinks and special files are
/// skipped.
pub struct FsTree {
    paths: Vec<PathBuf>,
}

impl FsTree {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    async fn save_node(&self, repo: &Repository, path: &Path, metadata: &Metadata) -> snapvault_core::Result<Option<Node>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());

        if metadata.is_dir() {
            let subtree = self.save_dir(repo, path).await?;
            Ok(Some(Node::dir(name, mode(metadata), subtree)))
        } else if metadata.is_file() {
            let file = tokio::fs::File::open(path).await?.into_std().await;
            let saved = repo.save_blocking_reader(file).await?;
            if saved.size != metadata.len() {
                warn!(path = %path.display(), "file changed while reading");
            }
            debug!(path = %path.display(), chunks = saved.content.len(), "saved file");
            Ok(Some(saved.into_node(name, mode(metadata))))
        } else {
            debug!(path = %path.display(), "skipping special file");
            Ok(None)
        }
    }

    fn save_dir<'a>(&'a self, repo: &'a Repository, dir: &'a Path) -> BoxFuture<'a, snapvault_core::Result<Id>> {
        async move {
            let listed = dir.to_path_buf();
            let entries = tokio::task::spawn_blocking(move || list_dir(&listed))
                .await
                .map_err(|e| Error::Other(format!("directory listing task failed: {e}")))??;

            let mut tree = Tree::new();
            for (path, metadata) in entries {
                if let Some(node) = self.save_node(repo, &path, &metadata).await? {
                    tree.add_node(node);
                }
            }
            repo.save_tree(&tree).await
        }
        .boxed()
    }
}

#[async_trait]
impl TreeBuilder for FsTree {
    async fn build(&self, repo: &Repository) -> snapvault_core::Result<Id> {
        let mut root = Tree::new();
        for path in &self.paths {
            let metadata = tokio::fs::symlink_metadata(path).await?;
            if let Some(node) = self.save_node(repo, path, &metadata).await? {
                root.add_node(node);
            }
        }
        repo.save_tree(&root).await
    }
}

/// Entries of one directory with their metadata, ordered by file name.
fn list_dir(dir: &Path) -> snapvault_core::Result<Vec<(PathBuf, Metadata)>> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let metadata = entry.metadata().map_err(|e| Error::Io(e.into()))?;
            Ok((entry.into_path(), metadata))
        })
        .collect()
}

#[cfg(unix)]
fn mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode(metadata: &Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
