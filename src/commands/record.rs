//! Local record CRUD. Writes here go through the ordinary path: they stamp
//! `updatedAt` and deletions leave a tombstone for the next sync.

use clap::{Args, Subcommand};
use los_sync_core::{
    Catalog, CatalogError, IdentityError, Row, SnapshotFetcher, SyncError, TableSnapshot,
};
use std::sync::Arc;

use super::open_local;
use crate::config::Config;
use crate::db::DbError;

/// Read and write records in the local database
#[derive(Args)]
pub struct RecordCommand {
    #[command(subcommand)]
    pub command: RecordSubcommand,
}

#[derive(Subcommand)]
pub enum RecordSubcommand {
    /// Print every record of a table as JSON
    List {
        /// Table name (e.g. Tasks, dailyNotes)
        table: String,
    },
    /// Create or update a record from a JSON object
    Put {
        table: String,
        /// Record body, e.g. '{"text": "buy milk"}'
        json: String,
    },
    /// Delete a record by its key
    Delete {
        table: String,
        /// uuid, natural key, or JSON array for composite keys
        key: String,
    },
}

impl RecordCommand {
    pub async fn run(&self, config: &Config) -> Result<(), RecordCommandError> {
        let catalog = Arc::new(Catalog::builtin()?);
        let (store, _) = open_local(config, catalog.clone()).await?;

        match &self.command {
            RecordSubcommand::List { table } => {
                let def = catalog.resolve(table)?;
                let snapshot = SnapshotFetcher::new(&store, &catalog).fetch(&[def]).await?;
                match snapshot.get(&def.name) {
                    Some(TableSnapshot::Rows(rows)) => {
                        println!("{}", serde_json::to_string_pretty(rows)?);
                    }
                    Some(TableSnapshot::Malformed(reason)) => {
                        return Err(RecordCommandError::Unreadable(reason.clone()));
                    }
                    None => println!("[]"),
                }
            }
            RecordSubcommand::Put { table, json } => {
                let def = catalog.resolve(table)?;
                let value: serde_json::Value = serde_json::from_str(json)?;
                let row = Row::from_value(value).ok_or(RecordCommandError::NotAnObject)?;
                let upserted = store.put_record(def, row).await?;
                println!("{}", serde_json::to_string_pretty(&upserted)?);
            }
            RecordSubcommand::Delete { table, key } => {
                let def = catalog.resolve(table)?;
                let identity = def.identity.parse_key(key)?;
                if store.delete_record(def, &identity).await? {
                    println!("✓ Deleted {} {}", def.name, identity);
                } else {
                    println!("{} {} not found; deletion recorded anyway", def.name, identity);
                }
            }
        }
        Ok(())
    }
}

/// Errors from record commands
#[derive(Debug)]
pub enum RecordCommandError {
    Catalog(CatalogError),
    Key(IdentityError),
    Json(serde_json::Error),
    NotAnObject,
    Database(DbError),
    Fetch(SyncError),
    Unreadable(String),
}

impl std::fmt::Display for RecordCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordCommandError::Catalog(e) => write!(f, "{}", e),
            RecordCommandError::Key(e) => write!(f, "{}", e),
            RecordCommandError::Json(e) => write!(f, "Invalid JSON: {}", e),
            RecordCommandError::NotAnObject => write!(f, "Record must be a JSON object"),
            RecordCommandError::Database(e) => write!(f, "{}", e),
            RecordCommandError::Fetch(e) => write!(f, "{}", e),
            RecordCommandError::Unreadable(reason) => write!(f, "Table is unreadable: {}", reason),
        }
    }
}

impl std::error::Error for RecordCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordCommandError::Catalog(e) => Some(e),
            RecordCommandError::Key(e) => Some(e),
            RecordCommandError::Json(e) => Some(e),
            RecordCommandError::Database(e) => Some(e),
            RecordCommandError::Fetch(e) => Some(e),
            RecordCommandError::NotAnObject | RecordCommandError::Unreadable(_) => None,
        }
    }
}

impl From<CatalogError> for RecordCommandError {
    fn from(e: CatalogError) -> Self {
        RecordCommandError::Catalog(e)
    }
}

impl From<IdentityError> for RecordCommandError {
    fn from(e: IdentityError) -> Self {
        RecordCommandError::Key(e)
    }
}

impl From<serde_json::Error> for RecordCommandError {
    fn from(e: serde_json::Error) -> Self {
        RecordCommandError::Json(e)
    }
}

impl From<DbError> for RecordCommandError {
    fn from(e: DbError) -> Self {
        RecordCommandError::Database(e)
    }
}

impl From<SyncError> for RecordCommandError {
    fn from(e: SyncError) -> Self {
        RecordCommandError::Fetch(e)
    }
}
