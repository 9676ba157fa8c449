mod config_cmd;
mod record;
mod sync_cmd;
mod tombstones;

pub use config_cmd::ConfigCommand;
pub use record::{RecordCommand, RecordCommandError};
pub use sync_cmd::{SyncCommand, SyncCommandError};
pub use tombstones::TombstonesCommand;

use los_sync_core::{Catalog, Layout, Side};
use std::sync::Arc;

use crate::config::Config;
use crate::db::{init_db, DbError, SqliteLedger, SqliteStore};

/// Opens the mobile-side database: the normalized store and its ledger
/// share one pool.
pub async fn open_local(
    config: &Config,
    catalog: Arc<Catalog>,
) -> Result<(SqliteStore, SqliteLedger), DbError> {
    let pool = init_db(&config.database_path.value).await?;
    let store = SqliteStore::new(pool.clone(), Side::Local, Layout::Normalized, catalog.clone());
    let ledger = SqliteLedger::new(pool, catalog);
    Ok((store, ledger))
}
