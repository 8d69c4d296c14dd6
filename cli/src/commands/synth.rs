use anyhow::Result;
use clap::Args;
use snapvault_core::fake::{DEFAULT_MAX_FILE_SIZE, FakeTree};
use snapvault_core::SnapshotOptions;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct SynthCommand {
    #[arg(long, default_value_t = 23, help = "Seed of the generated tree")]
    seed: u64,

    #[arg(long, default_value_t = 2, help = "Directory depth")]
    depth: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_FILE_SIZE, help = "Largest generated file size in bytes")]
    max_file_size: u64,

    #[arg(long, help = "Snapshot tags")]
    tag: Vec<String>,
}

impl SynthCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let repo = super::open_repository(cli).await?;
        let tree = FakeTree::new(self.seed, self.depth).with_max_file_size(self.max_file_size);

        info!(seed = self.seed, depth = self.depth, "Snapshotting generated tree");
        let options = SnapshotOptions {
            tags: self.tag.clone(),
            ..Default::default()
        };
        let snapshot = repo
            .assemble_snapshot_with(
                vec![PathBuf::from(format!("synthetic/{}", self.seed))],
                chrono::Utc::now(),
                &tree,
                options,
            )
            .await?;

        super::print_summary(&snapshot, &repo.stats());
        Ok(())
    }
}
