//! Tombstone ledger: the durable record of deletions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::models::{Identity, Tombstone};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger storage error: {0}")]
    Storage(String),
}

/// Durable log of `(table, identity, deletedAt)`.
///
/// Table names are canonical catalog names. Recording the same identity
/// twice keeps the later `deleted_at`.
#[async_trait]
pub trait TombstoneLedger: Send + Sync {
    async fn record(
        &self,
        table: &str,
        identity: &Identity,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// True when a tombstone exists with `deleted_at >= as_of`.
    async fn is_deleted(
        &self,
        table: &str,
        identity: &Identity,
        as_of: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Tombstones with `deleted_at >= since`, oldest first.
    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<Tombstone>, LedgerError>;

    /// Drops tombstones older than `before`. Returns how many were removed.
    async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64, LedgerError>;
}

/// The Unix epoch, used as "since the beginning".
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// Non-durable ledger for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<(String, Identity), DateTime<Utc>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TombstoneLedger for MemoryLedger {
    async fn record(
        &self,
        table: &str,
        identity: &Identity,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry((table.to_string(), identity.clone()))
            .or_insert(deleted_at);
        if deleted_at > *entry {
            *entry = deleted_at;
        }
        Ok(())
    }

    async fn is_deleted(
        &self,
        table: &str,
        identity: &Identity,
        as_of: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&(table.to_string(), identity.clone()))
            .is_some_and(|deleted_at| *deleted_at >= as_of))
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<Tombstone>, LedgerError> {
        let entries = self.entries.lock().await;
        let mut tombstones: Vec<Tombstone> = entries
            .iter()
            .filter(|(_, deleted_at)| **deleted_at >= since)
            .map(|((table, identity), deleted_at)| {
                Tombstone::new(table.clone(), identity.clone(), *deleted_at)
            })
            .collect();
        tombstones.sort_by(|a, b| {
            (a.deleted_at, &a.table, &a.identity).cmp(&(b.deleted_at, &b.table, &b.identity))
        });
        Ok(tombstones)
    }

    async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut entries = self.entries.lock().await;
        let len = entries.len();
        entries.retain(|_, deleted_at| *deleted_at >= before);
        Ok((len - entries.len()) as u64)
    }
}

/// Immutable view of the ledger handed to the merge, which must not do I/O.
#[derive(Debug, Clone, Default)]
pub struct TombstoneIndex {
    entries: HashMap<String, HashMap<Identity, DateTime<Utc>>>,
}

impl TombstoneIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tombstone: Tombstone) {
        let entry = self
            .entries
            .entry(tombstone.table)
            .or_default()
            .entry(tombstone.identity)
            .or_insert(tombstone.deleted_at);
        if tombstone.deleted_at > *entry {
            *entry = tombstone.deleted_at;
        }
    }

    pub fn deleted_at(&self, table: &str, identity: &Identity) -> Option<DateTime<Utc>> {
        self.entries.get(table)?.get(identity).copied()
    }

    pub fn is_deleted(&self, table: &str, identity: &Identity, as_of: DateTime<Utc>) -> bool {
        self.deleted_at(table, identity)
            .is_some_and(|deleted_at| deleted_at >= as_of)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Tombstone> for TombstoneIndex {
    fn from_iter<I: IntoIterator<Item = Tombstone>>(iter: I) -> Self {
        let mut index = Self::new();
        for tombstone in iter {
            index.insert(tombstone);
        }
        index
    }
}
