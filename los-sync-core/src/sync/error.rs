use crate::catalog::CatalogError;
use crate::codec::CodecError;
use crate::ledger::LedgerError;
use crate::store::StoreError;

/// Errors that end a sync run.
///
/// Row- and table-level problems never show up here; they are counted
/// in the merge outcome and the apply counts instead.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Sync deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),
}
