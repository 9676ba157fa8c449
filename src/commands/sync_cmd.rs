//! Sync CLI commands for reconciling with the server.

use clap::{Args, Subcommand};
use los_sync_core::ledger::epoch;
use los_sync_core::{
    Catalog, CatalogError, Side, Store, SyncEngine, SyncOptions, SyncReport, TombstoneLedger,
};
use std::path::PathBuf;
use std::sync::Arc;

use super::open_local;
use crate::config::Config;
use crate::db::{backup_database, DbError};
use crate::summary::write_summary;
use crate::sync::{RemoteError, RemoteStore};

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,

    /// Side that wins when both copies share an updatedAt (local or remote)
    #[arg(long)]
    authority: Option<Side>,

    /// Merge and report the plan without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Only sync this table (repeatable)
    #[arg(long = "table", value_name = "TABLE")]
    tables: Vec<String>,

    /// Print the full report as JSON
    #[arg(long)]
    json: bool,

    /// Back up the local database first (into backup_dir, or a backups
    /// directory next to the database)
    #[arg(long)]
    backup: bool,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and server status
    Status,
}

impl SyncCommand {
    pub async fn run(&self, config: &Config) -> Result<(), SyncCommandError> {
        match &self.command {
            None => self.sync(config).await,
            Some(SyncSubcommand::Status) => self.status(config).await,
        }
    }

    fn options(&self, config: &Config) -> SyncOptions {
        SyncOptions {
            authority: self.authority.unwrap_or(config.authority.value),
            dry_run: self.dry_run,
            tables: (!self.tables.is_empty()).then(|| self.tables.clone()),
            deadline: config.timeout(),
        }
    }

    /// Where to back up before this run, if anywhere. Dry runs write
    /// nothing and need no backup.
    fn backup_dir(&self, config: &Config) -> Option<PathBuf> {
        if self.dry_run {
            return None;
        }
        match &config.backup_dir.value {
            Some(dir) => Some(dir.clone()),
            None if self.backup => Some(
                config
                    .database_path
                    .value
                    .parent()
                    .map(|p| p.join("backups"))
                    .unwrap_or_else(|| PathBuf::from("backups")),
            ),
            None => None,
        }
    }

    async fn sync(&self, config: &Config) -> Result<(), SyncCommandError> {
        let catalog = Arc::new(Catalog::builtin()?);
        let remote = RemoteStore::from_config(&config.server, catalog.clone())?;
        let (local, ledger) = open_local(config, catalog.clone()).await?;

        if let Some(dir) = self.backup_dir(config) {
            let path = backup_database(local.pool(), &dir).await?;
            if !self.json {
                println!("Backup written to {}", path.display());
            }
        }

        if !self.json {
            println!("Syncing with {}...", remote.base_url());
            println!();
        }

        let engine = SyncEngine::new(catalog, local, remote, ledger);
        let report = engine.run(&self.options(config)).await;

        if let Some(dir) = &config.summary_dir.value {
            match write_summary(dir, &report) {
                Ok(path) if !self.json => println!("Summary written to {}", path.display()),
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to write sync summary: {}", e),
            }
        }

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).map_err(SyncCommandError::Output)?
            );
        } else {
            print_report(&report);
        }

        match report.error {
            Some(error) => Err(SyncCommandError::Failed(error)),
            None => Ok(()),
        }
    }

    async fn status(&self, config: &Config) -> Result<(), SyncCommandError> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        println!("Database:  {}", config.database_path.value.display());
        println!("Authority: {}", config.authority.value);
        match config.timeout() {
            Some(timeout) => println!("Timeout:   {}s", timeout.as_secs()),
            None => println!("Timeout:   none"),
        }
        println!();

        let catalog = Arc::new(Catalog::builtin()?);
        let (local, ledger) = open_local(config, catalog.clone()).await?;
        let counts = local.counts().await?;
        if counts.is_empty() {
            println!("Local records: none");
        } else {
            println!("Local records:");
            for (table, count) in counts {
                println!("  {:<20} {}", table, count);
            }
        }
        let tombstones = ledger
            .list_since(epoch())
            .await
            .map_err(|e| SyncCommandError::Failed(e.to_string()))?;
        println!("Tombstones:    {}", tombstones.len());
        println!();

        if !config.server.is_configured() {
            println!("Server: Not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  server:");
            println!("    server_url: \"http://localhost:3001\"");
            println!("    api_key: \"your-api-key\"");
            println!();
            println!("Or set environment variables:");
            println!("  LOS_SERVER_URL");
            println!("  LOS_API_KEY");
            return Ok(());
        }

        let remote = RemoteStore::from_config(&config.server, catalog)?;
        println!("Server:  {}", remote.base_url());
        match &config.server.api_key {
            Some(key) => println!("API Key: {}...", key.chars().take(8).collect::<String>()),
            None => println!("API Key: (not set)"),
        }
        println!("Side:    {}", remote.side());
        println!();

        print!("Server status: ");
        match remote.check_server().await {
            Ok(health) => println!("✓ connected (version {})", health.version),
            Err(RemoteError::HttpError(_)) => println!("✗ unreachable"),
            Err(e) => println!("✗ error: {}", e),
        }

        Ok(())
    }
}

fn print_report(report: &SyncReport) {
    for (table, outcome) in &report.outcome.tables {
        if outcome.table_skipped {
            println!(
                "  ✗ {} skipped: {}",
                table,
                outcome.skip_reason.as_deref().unwrap_or("unknown reason")
            );
            continue;
        }

        let mut parts = Vec::new();
        if outcome.copied_local_to_remote > 0 {
            parts.push(format!("{} → remote", outcome.copied_local_to_remote));
        }
        if outcome.copied_remote_to_local > 0 {
            parts.push(format!("{} → local", outcome.copied_remote_to_local));
        }
        if outcome.deleted_local > 0 {
            parts.push(format!("{} deleted locally", outcome.deleted_local));
        }
        if outcome.deleted_remote > 0 {
            parts.push(format!("{} deleted on server", outcome.deleted_remote));
        }
        if outcome.conflicts > 0 {
            parts.push(format!("{} conflict(s)", outcome.conflicts));
        }
        if outcome.malformed > 0 {
            parts.push(format!("{} malformed", outcome.malformed));
        }
        if parts.is_empty() {
            println!("  ✓ {} up to date", table);
        } else {
            println!("  ✓ {} {}", table, parts.join(", "));
        }
    }

    let failed = report.failed_rows();
    let planned = report.planned_local.upserts
        + report.planned_local.deletes
        + report.planned_remote.upserts
        + report.planned_remote.deletes;

    println!();
    if let Some(error) = &report.error {
        println!("Sync failed after {} ms: {}", report.duration_ms(), error);
    } else if report.dry_run {
        println!("Dry run: {} change(s) planned, nothing written.", planned);
    } else if planned == 0 {
        println!("Already up to date.");
    } else {
        println!(
            "Sync complete in {} ms: {} local, {} remote change(s).",
            report.duration_ms(),
            report.local.changed(),
            report.remote.changed()
        );
    }
    if failed > 0 {
        println!("{} row(s) failed to apply:", failed);
        for failure in report.local.failures().chain(report.remote.failures()) {
            println!("  ✗ {} {}: {}", failure.table, failure.key, failure.message);
        }
    }
}

/// Errors from sync commands
#[derive(Debug)]
pub enum SyncCommandError {
    Catalog(CatalogError),
    Remote(RemoteError),
    Database(DbError),
    Output(serde_json::Error),
    /// The run itself failed; the report has already been printed
    Failed(String),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::Catalog(e) => write!(f, "{}", e),
            SyncCommandError::Remote(e) => write!(f, "{}", e),
            SyncCommandError::Database(e) => write!(f, "{}", e),
            SyncCommandError::Output(e) => write!(f, "Failed to format report: {}", e),
            SyncCommandError::Failed(e) => write!(f, "Sync failed: {}", e),
        }
    }
}

impl std::error::Error for SyncCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncCommandError::Catalog(e) => Some(e),
            SyncCommandError::Remote(e) => Some(e),
            SyncCommandError::Database(e) => Some(e),
            SyncCommandError::Output(e) => Some(e),
            SyncCommandError::Failed(_) => None,
        }
    }
}

impl From<CatalogError> for SyncCommandError {
    fn from(e: CatalogError) -> Self {
        SyncCommandError::Catalog(e)
    }
}

impl From<RemoteError> for SyncCommandError {
    fn from(e: RemoteError) -> Self {
        SyncCommandError::Remote(e)
    }
}

impl From<DbError> for SyncCommandError {
    fn from(e: DbError) -> Self {
        SyncCommandError::Database(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        sync: SyncCommand,
    }

    fn config() -> Config {
        let temp_dir = tempfile::tempdir().unwrap();
        Config::load(Some(temp_dir.path().join("missing.yaml"))).unwrap()
    }

    #[test]
    fn test_flags_build_options() {
        let cli = TestCli::parse_from([
            "los",
            "--authority",
            "remote",
            "--dry-run",
            "--table",
            "Tasks",
            "--table",
            "booleanHabits",
        ]);
        let options = cli.sync.options(&config());

        assert_eq!(options.authority, Side::Remote);
        assert!(options.dry_run);
        assert_eq!(
            options.tables,
            Some(vec!["Tasks".to_string(), "booleanHabits".to_string()])
        );
    }

    #[test]
    fn test_defaults_come_from_config() {
        let cli = TestCli::parse_from(["los"]);
        let config = config();
        let options = cli.sync.options(&config);

        assert_eq!(options.authority, config.authority.value);
        assert!(!options.dry_run);
        assert_eq!(options.tables, None);
        assert_eq!(options.deadline, config.timeout());
        assert_eq!(cli.sync.backup_dir(&config), None);
    }

    #[test]
    fn test_backup_flag_defaults_next_to_database() {
        let config = config();
        let cli = TestCli::parse_from(["los", "--backup"]);
        let expected = config.database_path.value.parent().unwrap().join("backups");
        assert_eq!(cli.sync.backup_dir(&config), Some(expected));

        let cli = TestCli::parse_from(["los", "--backup", "--dry-run"]);
        assert_eq!(cli.sync.backup_dir(&config), None);
    }
}
