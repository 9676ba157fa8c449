//! LOS Sync Core Library
//!
//! Reconciles the mobile client's embedded store with the desktop/server
//! store. Each sync run takes a full snapshot of both sides, merges them
//! with last-write-wins plus tombstones, and applies the resulting plans
//! row by row.
//!
//! ```text
//! fetch(local) ─┐                      ┌─> apply(local plan)
//!               ├─> merge(tombstones) ─┤
//! fetch(remote) ┘                      └─> apply(remote plan)
//! ```

pub mod apply;
pub mod catalog;
pub mod codec;
pub mod fetch;
pub mod ledger;
pub mod merge;
pub mod models;
pub mod store;
pub mod sync;

pub use apply::{ApplyCounts, ApplyExecutor, ApplyFailure, RowFailure, TableCounts};
pub use catalog::{AggregateSpec, Catalog, CatalogError, ChildTable, TableDef, ValueKind};
pub use codec::{CodecError, Decomposed};
pub use fetch::SnapshotFetcher;
pub use ledger::{LedgerError, MemoryLedger, TombstoneIndex, TombstoneLedger};
pub use merge::{merge, MergeResult};
pub use models::{
    ApplyPlan, Identity, IdentityError, IdentityKind, Layout, MergeOutcome, ParseSideError,
    PlannedDelete, PlannedUpsert, Row, Side, Snapshot, TableOutcome, TablePlan, TableSnapshot,
    Tombstone,
};
pub use store::{Change, Store, StoreError, TableManager, Upserted};
pub use sync::{SyncEngine, SyncError, SyncOptions, SyncReport};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
