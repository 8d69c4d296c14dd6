pub mod backup;
pub mod init;
pub mod snapshots;
pub mod synth;

use anyhow::{Result, anyhow};
use snapvault_backends::{LocalBackend, RetryBackend, RetryConfig};
use snapvault_core::backend::Backend;
use snapvault_core::crypto::{Encryptor, MasterKey, Sealer};
use snapvault_core::{Repository, Snapshot, Stats};
use std::sync::Arc;
use tracing::info;

pub fn repo_path(cli: &crate::Cli) -> Result<&str> {
    cli.repo
        .as_deref()
        .ok_or_else(|| anyhow!("Repository path required (--repo or SNAPVAULT_REPO)"))
}

pub fn backend(cli: &crate::Cli, path: &str) -> Arc<dyn Backend> {
    let local: Arc<dyn Backend> = Arc::new(LocalBackend::new(path));
    Arc::new(RetryBackend::new(
        local,
        RetryConfig::quick().with_max_attempts(cli.retries),
    ))
}

pub fn sealer(key: &MasterKey) -> Arc<dyn Sealer> {
    Arc::new(Encryptor::from_master_key(key))
}

pub async fn open_repository(cli: &crate::Cli) -> Result<Repository> {
    let path = repo_path(cli)?;
    let key = cli
        .key
        .as_deref()
        .ok_or_else(|| anyhow!("Repository key required (--key or SNAPVAULT_KEY)"))?;
    let key = MasterKey::from_hex(key)?;

    info!("Opening repository at: {}", path);
    Ok(Repository::open(backend(cli, path), sealer(&key)).await?)
}

pub fn print_summary(snapshot: &Snapshot, stats: &Stats) {
    println!("snapshot {} saved", snapshot.short_id());
    println!("  tree:         {}", snapshot.tree.short_string());
    println!(
        "  blobs added:  {} data, {} tree ({:.2} MB)",
        stats.data_blobs,
        stats.tree_blobs,
        stats.bytes as f64 / 1024.0 / 1024.0
    );
    println!("  deduplicated: {}", stats.deduplicated);
    println!("  packs:        {}", stats.packs);
}
