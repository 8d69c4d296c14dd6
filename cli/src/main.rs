mod commands;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use commands::{backup::BackupCommand, init::InitCommand, snapshots::SnapshotsCommand, synth::SynthCommand};
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "snapvault",
    about = "Deduplicating, encrypting backup store",
    long_about = "Snapvault splits data into content-defined chunks, stores every chunk and directory once, and records point-in-time snapshots"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "SNAPVAULT_REPO", help = "Repository path")]
    repo: Option<String>,

    #[arg(long, global = true, env = "SNAPVAULT_KEY", hide_env_values = true, help = "Repository key (hex)")]
    key: Option<String>,

    #[arg(long, global = true, default_value_t = 3, help = "Attempts per backend operation")]
    retries: u32,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new repository")]
    Init(InitCommand),

    #[command(about = "Create a new snapshot of files and directories")]
    Backup(BackupCommand),

    #[command(about = "Create a snapshot of a generated test tree")]
    Synth(SynthCommand),

    #[command(about = "List snapshots")]
    Snapshots(SnapshotsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;
    debug!("Starting Snapvault");

    match cli.command {
        Commands::Init(ref cmd) => cmd.run(&cli).await,
        Commands::Backup(ref cmd) => cmd.run(&cli).await,
        Commands::Synth(ref cmd) => cmd.run(&cli).await,
        Commands::Snapshots(ref cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "snapvault={level},snapvault_core={level},snapvault_backends={level}"
        ))
    });
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Setting default subscriber failed: {}", e))
}
