use anyhow::{Result, anyhow};
use clap::Args;

#[derive(Args)]
pub struct SnapshotsCommand {
    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,

    #[arg(long, help = "Filter by hostname")]
    hostname: Option<String>,

    #[arg(long, help = "Filter by tag")]
    tag: Vec<String>,

    #[arg(long, help = "Show latest N snapshots")]
    latest: Option<usize>,
}

impl SnapshotsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let repo = super::open_repository(cli).await?;
        let format = self.format.as_deref().unwrap_or("table");

        let mut snapshots = Vec::new();
        for snapshot_id in repo.list_snapshots().await? {
            snapshots.push(repo.load_snapshot(&snapshot_id).await?);
        }

        if let Some(hostname_filter) = &self.hostname {
            snapshots.retain(|s| s.hostname == *hostname_filter);
        }

        if !self.tag.is_empty() {
            snapshots.retain(|s| s.tags.iter().any(|tag| self.tag.contains(tag)));
        }

        snapshots.sort_by(|a, b| b.time.cmp(&a.time));
        if let Some(latest) = self.latest {
            snapshots.truncate(latest);
        }

        match format {
            "table" => {
                if snapshots.is_empty() {
                    println!("No snapshots found");
                    return Ok(());
                }

                println!("{:<10} {:<20} {:<15} {:<10} {:<20} Paths", "ID", "Date", "Host", "Tree", "Tags");
                println!("{:-<100}", "");

                for snapshot in snapshots {
                    let paths_str = snapshot
                        .paths
                        .iter()
                        .map(|p| p.to_string_lossy())
                        .collect::<Vec<_>>()
                        .join(",");

                    println!(
                        "{:<10} {:<20} {:<15} {:<10} {:<20} {}",
                        snapshot.short_id(),
                        snapshot.time.format("%Y-%m-%d %H:%M:%S"),
                        snapshot.hostname,
                        snapshot.tree.short_string(),
                        snapshot.tags.join(","),
                        paths_str
                    );
                }
            }
            "json" => {
                let entries = snapshots
                    .iter()
                    .map(|s| -> Result<serde_json::Value> {
                        let mut value = serde_json::to_value(s)?;
                        value["id"] = serde_json::Value::from(s.id.map(|id| id.to_hex()));
                        Ok(value)
                    })
                    .collect::<Result<Vec<_>>>()?;
                println!("{}", serde_json::to_string_pretty(&entries)?);
            }
            _ => {
                return Err(anyhow!("Unsupported format: {}", format));
            }
        }

        Ok(())
    }
}
