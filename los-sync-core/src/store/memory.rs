use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::{Change, Store, StoreError, TableManager, Upserted};
use crate::catalog::TableDef;
use crate::models::{Identity, IdentityKind, Layout, Row, Side, Tombstone};

/// In-memory store keyed by the side's own table names.
#[derive(Debug)]
pub struct MemoryStore {
    side: Side,
    layout: Layout,
    tables: Mutex<HashMap<String, Vec<Row>>>,
    failing: Mutex<HashSet<(String, String)>>,
    unmanaged: HashSet<String>,
    unreachable: AtomicBool,
    writes_left: AtomicUsize,
    tombstones: Mutex<Vec<Tombstone>>,
}

impl MemoryStore {
    pub fn new(side: Side, layout: Layout) -> Self {
        Self {
            side,
            layout,
            tables: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            unmanaged: HashSet::new(),
            unreachable: AtomicBool::new(false),
            writes_left: AtomicUsize::new(usize::MAX),
            tombstones: Mutex::new(Vec::new()),
        }
    }

    /// The store will hand out no manager for `table`.
    pub fn without_table(mut self, table: &str) -> Self {
        self.unmanaged.insert(table.to_string());
        self
    }

    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Upserts of the row with this identity key fail with `Rejected`.
    pub async fn fail_row(&self, table: &str, key: &str) {
        self.failing
            .lock()
            .await
            .insert((table.to_string(), key.to_string()));
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Lets `writes` more upserts or removes through, then the store goes
    /// offline.
    pub fn unreachable_after(&self, writes: usize) {
        self.writes_left.store(writes, Ordering::SeqCst);
    }

    pub async fn add_tombstone(&self, tombstone: Tombstone) {
        self.tombstones.lock().await.push(tombstone);
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable(format!("{} store is offline", self.side)));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        self.check_reachable()?;
        let spent = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if spent.is_err() {
            self.set_unreachable(true);
        }
        self.check_reachable()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn side(&self) -> Side {
        self.side
    }

    fn layout(&self) -> Layout {
        self.layout
    }

    fn manager<'a>(&'a self, table: &TableDef) -> Option<Box<dyn TableManager + 'a>> {
        let name = table.side_name(self.side)?;
        if self.unmanaged.contains(name) {
            return None;
        }
        Some(Box::new(MemoryTable {
            store: self,
            name: name.to_string(),
            identity: table.identity.clone(),
        }))
    }

    async fn tombstones_since(&self, since: DateTime<Utc>) -> Result<Vec<Tombstone>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .tombstones
            .lock()
            .await
            .iter()
            .filter(|t| t.deleted_at >= since)
            .cloned()
            .collect())
    }
}

struct MemoryTable<'a> {
    store: &'a MemoryStore,
    name: String,
    identity: IdentityKind,
}

#[async_trait]
impl TableManager for MemoryTable<'_> {
    async fn list(&self) -> Result<Vec<Row>, StoreError> {
        self.store.check_reachable()?;
        Ok(self.store.rows(&self.name).await)
    }

    async fn upsert(&self, row: &Row, is_sync_origin: bool) -> Result<Upserted, StoreError> {
        self.store.check_writable()?;
        let identity = self
            .identity
            .resolve(row)
            .ok_or_else(|| StoreError::Rejected(format!("{} row has no identity", self.name)))?;
        if self
            .store
            .failing
            .lock()
            .await
            .contains(&(self.name.clone(), identity.key()))
        {
            return Err(StoreError::Rejected(format!(
                "{} {} violates a constraint",
                self.name, identity
            )));
        }

        let mut row = row.clone();
        if !is_sync_origin {
            row.set_updated_at(Utc::now());
        }

        let mut tables = self.store.tables.lock().await;
        let rows = tables.entry(self.name.clone()).or_default();
        let existing = rows
            .iter_mut()
            .find(|r| self.identity.resolve(r).as_ref() == Some(&identity));
        let change = match existing {
            Some(current) if *current == row => Change::Unchanged,
            Some(current) => {
                *current = row.clone();
                Change::Updated
            }
            None => {
                rows.push(row.clone());
                Change::Inserted
            }
        };
        Ok(Upserted { row, change })
    }

    async fn remove(&self, identity: &Identity) -> Result<bool, StoreError> {
        self.store.check_writable()?;
        let mut tables = self.store.tables.lock().await;
        let Some(rows) = tables.get_mut(&self.name) else {
            return Ok(false);
        };
        let before = rows.len();
        rows.retain(|r| self.identity.resolve(r).as_ref() != Some(identity));
        Ok(rows.len() != before)
    }
}
