//! Snapshot fetcher: lists every table of one store.

use std::collections::BTreeMap;

use crate::catalog::{Catalog, TableDef};
use crate::codec;
use crate::models::{Layout, Row, Snapshot};
use crate::store::{Store, StoreError};
use crate::sync::SyncError;

pub struct SnapshotFetcher<'a, S: Store + ?Sized> {
    store: &'a S,
    catalog: &'a Catalog,
}

impl<'a, S: Store + ?Sized> SnapshotFetcher<'a, S> {
    pub fn new(store: &'a S, catalog: &'a Catalog) -> Self {
        Self { store, catalog }
    }

    /// Snapshot of `tables`, keyed by canonical name, always in document
    /// form.
    ///
    /// Only connectivity failures are returned as errors. A table the store
    /// cannot list is recorded as malformed so the merge skips it.
    pub async fn fetch(&self, tables: &[&TableDef]) -> Result<Snapshot, SyncError> {
        let mut snapshot = Snapshot::new();
        for table in tables {
            match self.fetch_table(table).await {
                Ok(rows) => {
                    tracing::debug!(
                        side = %self.store.side(),
                        table = %table.name,
                        rows = rows.len(),
                        "Fetched table"
                    );
                    snapshot.insert_rows(table.name.clone(), rows);
                }
                Err(FetchFailure::Fatal(e)) => return Err(e),
                Err(FetchFailure::Skip(reason)) => {
                    tracing::warn!(
                        side = %self.store.side(),
                        table = %table.name,
                        "Skipping table: {}", reason
                    );
                    snapshot.insert_malformed(table.name.clone(), reason);
                }
            }
        }
        Ok(snapshot)
    }

    async fn fetch_table(&self, table: &TableDef) -> Result<Vec<Row>, FetchFailure> {
        let parents = self.list(table).await?;
        if !table.is_aggregate() || self.store.layout() == Layout::Document {
            return Ok(parents);
        }

        let mut children = BTreeMap::new();
        for child in self.catalog.aggregate_tables_of(&table.name)? {
            children.insert(child.name.clone(), self.list(child).await?);
        }
        codec::recompose_all(table, parents, &children)
            .map_err(|e| FetchFailure::Skip(e.to_string()))
    }

    async fn list(&self, table: &TableDef) -> Result<Vec<Row>, FetchFailure> {
        let manager = self.store.manager(table).ok_or_else(|| {
            FetchFailure::Skip(format!("no table manager for {}", table.name))
        })?;
        manager.list().await.map_err(FetchFailure::from)
    }
}

enum FetchFailure {
    Fatal(SyncError),
    Skip(String),
}

impl From<StoreError> for FetchFailure {
    fn from(e: StoreError) -> Self {
        if e.is_connectivity() {
            FetchFailure::Fatal(e.into())
        } else {
            FetchFailure::Skip(e.to_string())
        }
    }
}

impl From<crate::catalog::CatalogError> for FetchFailure {
    fn from(e: crate::catalog::CatalogError) -> Self {
        FetchFailure::Fatal(e.into())
    }
}
