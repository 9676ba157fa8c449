use chrono::{Duration, Utc};
use clap::{Args, Subcommand};
use los_sync_core::ledger::epoch;
use los_sync_core::models::parse_timestamp;
use los_sync_core::{Catalog, TombstoneLedger};
use serde_json::Value;
use std::sync::Arc;

use super::open_local;
use crate::config::Config;

/// Inspect and prune the local deletion log
#[derive(Args)]
pub struct TombstonesCommand {
    #[command(subcommand)]
    pub command: TombstonesSubcommand,
}

#[derive(Subcommand)]
pub enum TombstonesSubcommand {
    /// List recorded deletions, oldest first
    List {
        /// Only show deletions at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<String>,
    },
    /// Forget deletions older than the given age
    Prune {
        /// Age in days
        #[arg(long)]
        older_than_days: u32,
    },
}

impl TombstonesCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let catalog = Arc::new(Catalog::builtin()?);
        let (_, ledger) = open_local(config, catalog).await?;

        match &self.command {
            TombstonesSubcommand::List { since } => {
                let since = match since {
                    Some(raw) => parse_timestamp(&Value::String(raw.clone()))
                        .ok_or_else(|| format!("Invalid timestamp: {}", raw))?,
                    None => epoch(),
                };
                let tombstones = ledger.list_since(since).await?;
                if tombstones.is_empty() {
                    println!("No deletions recorded.");
                    return Ok(());
                }
                for tombstone in tombstones {
                    println!(
                        "{}  {:<20} {}",
                        tombstone.deleted_at.to_rfc3339(),
                        tombstone.table,
                        tombstone.identity
                    );
                }
            }
            TombstonesSubcommand::Prune { older_than_days } => {
                let cutoff = Utc::now() - Duration::days(i64::from(*older_than_days));
                let pruned = ledger.prune_before(cutoff).await?;
                println!(
                    "Pruned {} deletion(s) older than {} day(s).",
                    pruned, older_than_days
                );
            }
        }
        Ok(())
    }
}
