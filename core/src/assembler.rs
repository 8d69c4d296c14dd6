use crate::archiver::TreeBuilder;
use crate::backend::FileType;
use crate::{Id, Repository, Result, Snapshot};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// Steps of one snapshot assembly, run strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Build,
    Record,
    Persist,
    Durabilize,
    Checkpoint,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Build => "build",
            Stage::Record => "record",
            Stage::Persist => "persist",
            Stage::Durabilize => "durabilize",
            Stage::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}

/// Optional metadata attached to an assembled snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub tags: Vec<String>,
    pub parent: Option<Id>,
    pub hostname: Option<String>,
}

impl Repository {
    /// Builds a tree, records and persists a snapshot of it, flushes, then
    /// checkpoints the index.
    ///
    /// Any error aborts the assembly and no snapshot is returned. Blobs that
    /// reached the backend before the failure stay there and are reused by
    /// a retry.
    pub async fn assemble_snapshot(
        &self,
        paths: Vec<PathBuf>,
        time: DateTime<Utc>,
        builder: &dyn TreeBuilder,
    ) -> Result<Snapshot> {
        self.assemble_snapshot_with(paths, time, builder, SnapshotOptions::default())
            .await
    }

    #[instrument(skip_all, fields(paths = paths.len()))]
    pub async fn assemble_snapshot_with(
        &self,
        paths: Vec<PathBuf>,
        time: DateTime<Utc>,
        builder: &dyn TreeBuilder,
        options: SnapshotOptions,
    ) -> Result<Snapshot> {
        let tree = run_stage(Stage::Build, builder.build(self)).await?;

        debug!(stage = %Stage::Record, tree = %tree.short_string());
        let mut snapshot = Snapshot::new(paths, time, tree).with_tags(options.tags);
        if let Some(parent) = options.parent {
            snapshot = snapshot.with_parent(parent);
        }
        if let Some(hostname) = options.hostname {
            snapshot = snapshot.with_hostname(hostname);
        }

        let id = run_stage(Stage::Persist, self.save_unpacked(FileType::Snapshot, &snapshot)).await?;
        snapshot.id = Some(id);

        run_stage(Stage::Durabilize, self.flush()).await?;
        run_stage(Stage::Checkpoint, self.checkpoint_index()).await?;

        let stats = self.stats();
        info!(
            snapshot = %id.short_string(),
            tree = %tree.short_string(),
            data_blobs = stats.data_blobs,
            tree_blobs = stats.tree_blobs,
            deduplicated = stats.deduplicated,
            "snapshot saved"
        );
        Ok(snapshot)
    }
}

async fn run_stage<T, F>(stage: Stage, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    debug!(%stage, "starting");
    fut.await.inspect_err(|e| warn!(%stage, error = %e, "snapshot assembly failed"))
}
