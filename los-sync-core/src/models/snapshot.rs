use std::collections::BTreeMap;

use super::row::Row;

/// The listing of one table as fetched from a store.
#[derive(Debug, Clone, PartialEq)]
pub enum TableSnapshot {
    Rows(Vec<Row>),
    /// The store returned something that is not a sequence of records.
    Malformed(String),
}

/// Full point-in-time listing of a store, keyed by canonical table name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    tables: BTreeMap<String, TableSnapshot>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rows(&mut self, table: impl Into<String>, rows: Vec<Row>) {
        self.tables.insert(table.into(), TableSnapshot::Rows(rows));
    }

    pub fn insert_malformed(&mut self, table: impl Into<String>, reason: impl Into<String>) {
        self.tables
            .insert(table.into(), TableSnapshot::Malformed(reason.into()));
    }

    pub fn get(&self, table: &str) -> Option<&TableSnapshot> {
        self.tables.get(table)
    }

    pub fn rows(&self, table: &str) -> Option<&[Row]> {
        match self.tables.get(table) {
            Some(TableSnapshot::Rows(rows)) => Some(rows),
            _ => None,
        }
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}
