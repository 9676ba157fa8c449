//! Store capability traits.
//!
//! Every store collaborator (the embedded local store, the HTTP client for
//! the server, in-memory fakes) implements [`Store`], handing out one
//! [`TableManager`] per table it can list and write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::TableDef;
use crate::models::{Identity, Layout, Row, Side, Tombstone};

#[cfg(any(test, feature = "testing"))]
mod memory;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be reached at all. Fatal to a sync run.
    #[error("Store unreachable: {0}")]
    Unreachable(String),

    /// The table listing is not a sequence of records.
    #[error("Malformed listing for {table}: {reason}")]
    Malformed { table: String, reason: String },

    /// The store refused a single row.
    #[error("Row rejected: {0}")]
    Rejected(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unreachable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    Inserted,
    Updated,
    Unchanged,
}

/// Result of an upsert: the row as stored plus what happened to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upserted {
    pub row: Row,
    pub change: Change,
}

/// List/write access to one table of one store.
#[async_trait]
pub trait TableManager: Send + Sync {
    async fn list(&self) -> Result<Vec<Row>, StoreError>;

    /// Inserts or replaces the row with the same identity.
    ///
    /// With `is_sync_origin` the incoming `updatedAt` is kept and no change
    /// notification is published; otherwise the store stamps `now`.
    async fn upsert(&self, row: &Row, is_sync_origin: bool) -> Result<Upserted, StoreError>;

    /// Removes the row. Returns `false` when it was already absent.
    async fn remove(&self, identity: &Identity) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    fn side(&self) -> Side;

    fn layout(&self) -> Layout;

    /// Manager for `table`, or `None` when this store cannot manage it.
    fn manager<'a>(&'a self, table: &TableDef) -> Option<Box<dyn TableManager + 'a>>;

    /// Tombstones recorded by this store's own CRUD path.
    async fn tombstones_since(&self, _since: DateTime<Utc>) -> Result<Vec<Tombstone>, StoreError> {
        Ok(Vec::new())
    }
}
