use serde::Serialize;
use std::collections::BTreeMap;

use super::identity::Identity;
use super::row::Row;
use super::side::Side;

/// Write `row` to the destination. `previous` is the row the destination
/// held before, if any; the executor uses it to find stale child rows.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpsert {
    pub identity: Identity,
    pub row: Row,
    pub previous: Option<Row>,
}

/// Remove the record from the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDelete {
    pub identity: Identity,
    pub previous: Row,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TablePlan {
    pub upserts: Vec<PlannedUpsert>,
    pub deletes: Vec<PlannedDelete>,
}

impl TablePlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }
}

/// Everything one store has to do to converge, keyed by canonical table.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyPlan {
    pub destination: Side,
    pub tables: BTreeMap<String, TablePlan>,
}

impl ApplyPlan {
    pub fn new(destination: Side) -> Self {
        Self {
            destination,
            tables: BTreeMap::new(),
        }
    }

    pub fn table_mut(&mut self, table: &str) -> &mut TablePlan {
        self.tables.entry(table.to_string()).or_default()
    }

    pub fn get(&self, table: &str) -> Option<&TablePlan> {
        self.tables.get(table)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(TablePlan::is_empty)
    }

    /// `(upserts, deletes)` across all tables.
    pub fn counts(&self) -> (usize, usize) {
        self.tables.values().fold((0, 0), |(u, d), plan| {
            (u + plan.upserts.len(), d + plan.deletes.len())
        })
    }
}

/// Per-table merge statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOutcome {
    pub copied_local_to_remote: usize,
    pub copied_remote_to_local: usize,
    pub deleted_local: usize,
    pub deleted_remote: usize,
    pub conflicts: usize,
    pub malformed: usize,
    pub unchanged: usize,
    pub table_skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl TableOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            table_skipped: true,
            skip_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    fn add(&mut self, other: &TableOutcome) {
        self.copied_local_to_remote += other.copied_local_to_remote;
        self.copied_remote_to_local += other.copied_remote_to_local;
        self.deleted_local += other.deleted_local;
        self.deleted_remote += other.deleted_remote;
        self.conflicts += other.conflicts;
        self.malformed += other.malformed;
        self.unchanged += other.unchanged;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub tables: BTreeMap<String, TableOutcome>,
}

impl MergeOutcome {
    /// Sum of all per-table counters. `table_skipped` is left false.
    pub fn totals(&self) -> TableOutcome {
        let mut total = TableOutcome::default();
        for outcome in self.tables.values() {
            total.add(outcome);
        }
        total
    }

    pub fn skipped_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|(_, o)| o.table_skipped)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
