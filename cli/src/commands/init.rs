use anyhow::{Result, anyhow};
use clap::Args;
use snapvault_core::crypto::MasterKey;
use snapvault_core::polynomial::Polynomial;
use snapvault_core::{RepoConfig, Repository};
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(help = "Repository path")]
    repo: Option<String>,

    #[arg(long, help = "Chunker polynomial (hex); random if omitted")]
    polynomial: Option<String>,

    #[arg(long, help = "Minimum chunk size in bytes")]
    min_chunk_size: Option<u32>,

    #[arg(long, help = "Average chunk size in bytes")]
    avg_chunk_size: Option<u32>,

    #[arg(long, help = "Maximum chunk size in bytes")]
    max_chunk_size: Option<u32>,

    #[arg(long, help = "Pack size in bytes")]
    pack_size: Option<u64>,
}

impl InitCommand {
    fn config(&self) -> Result<RepoConfig> {
        let mut config = match &self.polynomial {
            Some(hex) => {
                let value = u64::from_str_radix(hex.trim_start_matches("0x"), 16)
                    .map_err(|e| anyhow!("Invalid polynomial {}: {}", hex, e))?;
                RepoConfig::with_polynomial(Polynomial::new(value))
            }
            None => RepoConfig::default(),
        };

        let min = self.min_chunk_size.unwrap_or(config.min_chunk_size);
        let avg = self.avg_chunk_size.unwrap_or(config.avg_chunk_size);
        let max = self.max_chunk_size.unwrap_or(config.max_chunk_size);
        config = config.with_chunk_sizes(min, avg, max);
        if let Some(pack_size) = self.pack_size {
            config = config.with_max_pack_size(pack_size);
        }
        config.validate()?;
        Ok(config)
    }

    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let repo_path = match &self.repo {
            Some(path) => path.as_str(),
            None => super::repo_path(cli)?,
        };

        let (key, generated) = match cli.key.as_deref() {
            Some(hex) => (MasterKey::from_hex(hex)?, false),
            None => (MasterKey::generate(), true),
        };

        let config = self.config()?;
        info!("Initializing repository at: {}", repo_path);
        let repo = Repository::init(super::backend(cli, repo_path), super::sealer(&key), config).await?;

        println!("Successfully initialized repository at {}", repo_path);
        println!("  id:         {}", repo.config().id);
        println!("  polynomial: {}", repo.config().chunker_polynomial);
        if generated {
            println!();
            println!("Repository key (store it safely, it cannot be recovered):");
            println!("{}", key.to_hex());
        }
        Ok(())
    }
}
