//! Apply/upsert executor: writes an apply plan into one store.
//!
//! Every row is applied on its own. A row the store rejects is logged and
//! counted and the executor moves on; only a store that cannot be reached
//! at all stops the run.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use crate::catalog::{Catalog, TableDef};
use crate::codec::{self, Decomposed};
use crate::models::{ApplyPlan, Identity, Layout, PlannedDelete, PlannedUpsert, TablePlan};
use crate::store::{Change, Store, StoreError, TableManager};

/// A row the destination store rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub table: String,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub already_absent: usize,
    pub failed: usize,
    pub children_upserted: usize,
    pub children_deleted: usize,
    pub children_failed: usize,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RowFailure>,
}

impl TableCounts {
    /// Rows whose stored state actually changed.
    pub fn changed(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    /// Rows applied without error, including no-ops.
    pub fn applied(&self) -> usize {
        self.inserted + self.updated + self.unchanged + self.deleted + self.already_absent
    }

    fn record(&mut self, change: Change) {
        match change {
            Change::Inserted => self.inserted += 1,
            Change::Updated => self.updated += 1,
            Change::Unchanged => self.unchanged += 1,
        }
    }

    fn push_failure(&mut self, table: &str, identity: &Identity, message: String) {
        self.failures.push(RowFailure {
            table: table.to_string(),
            key: identity.key(),
            message,
        });
    }

    /// Counts a rejected row, or hands back a connectivity failure.
    fn row_failed(
        &mut self,
        table: &str,
        identity: &Identity,
        error: StoreError,
        child: bool,
    ) -> Result<(), StoreError> {
        if error.is_connectivity() {
            return Err(error);
        }
        tracing::warn!(table = %table, key = %identity, "Failed to apply row: {}", error);
        if child {
            self.children_failed += 1;
        } else {
            self.failed += 1;
        }
        self.push_failure(table, identity, error.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyCounts {
    pub tables: BTreeMap<String, TableCounts>,
}

impl ApplyCounts {
    pub fn table(&self, name: &str) -> Option<&TableCounts> {
        self.tables.get(name)
    }

    pub fn changed(&self) -> usize {
        self.tables.values().map(TableCounts::changed).sum()
    }

    pub fn failed(&self) -> usize {
        self.tables
            .values()
            .map(|c| c.failed + c.children_failed)
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &RowFailure> {
        self.tables.values().flat_map(|c| c.failures.iter())
    }
}

/// A run-ending store failure plus whatever was applied before it.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ApplyFailure {
    pub counts: ApplyCounts,
    #[source]
    pub error: StoreError,
}

pub struct ApplyExecutor<'a, S: Store + ?Sized> {
    store: &'a S,
    catalog: &'a Catalog,
}

type ChildManagers<'a> = Vec<(&'a TableDef, Box<dyn TableManager + 'a>)>;

impl<'a, S: Store + ?Sized> ApplyExecutor<'a, S> {
    pub fn new(store: &'a S, catalog: &'a Catalog) -> Self {
        Self { store, catalog }
    }

    pub async fn apply(&self, plan: &ApplyPlan) -> Result<ApplyCounts, ApplyFailure> {
        let mut counts = ApplyCounts::default();
        match self.apply_into(plan, &mut counts).await {
            Ok(()) => Ok(counts),
            Err(error) => Err(ApplyFailure { counts, error }),
        }
    }

    /// Applies `plan`, accumulating into `counts` as it goes so partial
    /// progress survives an early return or a cancelled future.
    pub async fn apply_into(
        &self,
        plan: &ApplyPlan,
        counts: &mut ApplyCounts,
    ) -> Result<(), StoreError> {
        for (name, table_plan) in &plan.tables {
            if table_plan.is_empty() {
                continue;
            }
            let table_counts = counts.tables.entry(name.clone()).or_default();
            self.apply_table(name, table_plan, table_counts).await?;
        }
        Ok(())
    }

    async fn apply_table(
        &self,
        name: &str,
        plan: &TablePlan,
        counts: &mut TableCounts,
    ) -> Result<(), StoreError> {
        let side = self.store.side();
        let def = match self.catalog.resolve(name) {
            Ok(def) => def,
            Err(e) => {
                tracing::warn!(side = %side, table = %name, "Skipping table: {}", e);
                counts.skipped = true;
                return Ok(());
            }
        };
        let Some(manager) = self.store.manager(def) else {
            tracing::warn!(side = %side, table = %name, "Skipping table: no table manager");
            counts.skipped = true;
            return Ok(());
        };

        let children = if def.is_aggregate() && self.store.layout() == Layout::Normalized {
            match self.child_managers(def) {
                Some(children) => Some(children),
                None => {
                    tracing::warn!(
                        side = %side,
                        table = %name,
                        "Skipping table: no manager for a child table"
                    );
                    counts.skipped = true;
                    return Ok(());
                }
            }
        } else {
            None
        };

        for upsert in &plan.upserts {
            match &children {
                Some(children) => {
                    self.upsert_aggregate(def, manager.as_ref(), children, upsert, counts)
                        .await?
                }
                None => match manager.upsert(&upsert.row, true).await {
                    Ok(upserted) => counts.record(upserted.change),
                    Err(e) => counts.row_failed(name, &upsert.identity, e, false)?,
                },
            }
        }

        for delete in &plan.deletes {
            self.delete_row(def, manager.as_ref(), children.as_ref(), delete, counts)
                .await?;
        }

        tracing::info!(
            side = %side,
            table = %name,
            inserted = counts.inserted,
            updated = counts.updated,
            deleted = counts.deleted,
            failed = counts.failed,
            "Applied table"
        );
        Ok(())
    }

    fn child_managers(&self, def: &TableDef) -> Option<ChildManagers<'a>> {
        let catalog: &'a Catalog = self.catalog;
        let store: &'a S = self.store;
        catalog
            .aggregate_tables_of(&def.name)
            .ok()?
            .into_iter()
            .map(|child| store.manager(child).map(|m| (child, m)))
            .collect()
    }

    async fn upsert_aggregate(
        &self,
        def: &TableDef,
        manager: &dyn TableManager,
        children: &ChildManagers<'a>,
        upsert: &PlannedUpsert,
        counts: &mut TableCounts,
    ) -> Result<(), StoreError> {
        let parts = match codec::decompose(def, &upsert.row) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(table = %def.name, key = %upsert.identity, "Cannot decompose row: {}", e);
                counts.failed += 1;
                counts.push_failure(&def.name, &upsert.identity, e.to_string());
                return Ok(());
            }
        };

        match manager.upsert(&parts.parent, true).await {
            Ok(upserted) => counts.record(upserted.change),
            Err(e) => return counts.row_failed(&def.name, &upsert.identity, e, false),
        }

        // Only children of a parent that made it in.
        let previous = upsert
            .previous
            .as_ref()
            .and_then(|row| codec::decompose(def, row).ok());

        for (child_def, child_manager) in children {
            let rows = parts.children.get(&child_def.name).map(Vec::as_slice).unwrap_or(&[]);
            let mut kept = HashSet::new();
            for row in rows {
                let identity = child_def.identity.resolve(row);
                match child_manager.upsert(row, true).await {
                    Ok(upserted) => {
                        if upserted.change != Change::Unchanged {
                            counts.children_upserted += 1;
                        }
                    }
                    Err(e) => {
                        let key = identity.clone().unwrap_or_else(|| upsert.identity.clone());
                        counts.row_failed(&child_def.name, &key, e, true)?;
                    }
                }
                kept.extend(identity);
            }

            let stale = stale_children(child_def, previous.as_ref(), &kept);
            for identity in stale {
                match child_manager.remove(&identity).await {
                    Ok(true) => counts.children_deleted += 1,
                    Ok(false) => {}
                    Err(e) => counts.row_failed(&child_def.name, &identity, e, true)?,
                }
            }
        }
        Ok(())
    }

    async fn delete_row(
        &self,
        def: &TableDef,
        manager: &dyn TableManager,
        children: Option<&ChildManagers<'a>>,
        delete: &PlannedDelete,
        counts: &mut TableCounts,
    ) -> Result<(), StoreError> {
        match manager.remove(&delete.identity).await {
            Ok(true) => counts.deleted += 1,
            Ok(false) => counts.already_absent += 1,
            Err(e) => return counts.row_failed(&def.name, &delete.identity, e, false),
        }

        let Some(children) = children else {
            return Ok(());
        };
        let previous = match codec::decompose(def, &delete.previous) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(table = %def.name, key = %delete.identity, "Cannot decompose deleted row: {}", e);
                return Ok(());
            }
        };
        for (child_def, child_manager) in children {
            let identities = stale_children(child_def, Some(&previous), &HashSet::new());
            for identity in identities {
                match child_manager.remove(&identity).await {
                    Ok(true) => counts.children_deleted += 1,
                    Ok(false) => {}
                    Err(e) => counts.row_failed(&child_def.name, &identity, e, true)?,
                }
            }
        }
        Ok(())
    }
}

/// Child identities present in `previous` but not in `kept`.
fn stale_children(
    child_def: &TableDef,
    previous: Option<&Decomposed>,
    kept: &HashSet<Identity>,
) -> Vec<Identity> {
    previous
        .and_then(|parts| parts.children.get(&child_def.name))
        .into_iter()
        .flatten()
        .filter_map(|row| child_def.identity.resolve(row))
        .filter(|identity| !kept.contains(identity))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Row, Side};
    use crate::store::MemoryStore;
    use serde_json::{json, Value};

    fn row(value: Value) -> Row {
        Row::from_value(value).unwrap()
    }

    fn upsert(row: Row) -> PlannedUpsert {
        PlannedUpsert {
            identity: Identity::Uuid(row.uuid().unwrap_or_default().to_string()),
            row,
            previous: None,
        }
    }

    fn task_plan(destination: Side, count: usize) -> ApplyPlan {
        let mut plan = ApplyPlan::new(destination);
        let table = plan.table_mut("Tasks");
        for i in 1..=count {
            table.upserts.push(upsert(row(json!({
                "uuid": format!("task-{}", i),
                "text": format!("task {}", i),
                "updatedAt": "2024-03-14T09:00:00.000Z"
            }))));
        }
        plan
    }

    #[tokio::test]
    async fn test_apply_keeps_incoming_updated_at() {
        let catalog = Catalog::builtin().unwrap();
        let store = MemoryStore::new(Side::Remote, Layout::Document);

        let counts = ApplyExecutor::new(&store, &catalog)
            .apply(&task_plan(Side::Remote, 1))
            .await
            .unwrap();

        assert_eq!(counts.table("Tasks").unwrap().inserted, 1);
        let rows = store.rows("Tasks").await;
        assert_eq!(rows[0].get_str("updatedAt"), Some("2024-03-14T09:00:00.000Z"));
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let catalog = Catalog::builtin().unwrap();
        let store = MemoryStore::new(Side::Remote, Layout::Document);
        let mut plan = task_plan(Side::Remote, 3);
        plan.table_mut("Tasks").deletes.push(PlannedDelete {
            identity: Identity::Uuid("gone".to_string()),
            previous: row(json!({"uuid": "gone"})),
        });
        store.seed("Tasks", vec![row(json!({"uuid": "gone"}))]).await;
        let executor = ApplyExecutor::new(&store, &catalog);

        let first = executor.apply(&plan).await.unwrap();
        let state = store.rows("Tasks").await;
        let second = executor.apply(&plan).await.unwrap();

        assert_eq!(first.changed(), 4);
        assert_eq!(second.changed(), 0);
        assert_eq!(second.table("Tasks").unwrap().unchanged, 3);
        assert_eq!(second.table("Tasks").unwrap().already_absent, 1);
        assert_eq!(store.rows("Tasks").await, state);
    }

    #[tokio::test]
    async fn test_one_bad_row_does_not_stop_the_table() {
        let catalog = Catalog::builtin().unwrap();
        let store = MemoryStore::new(Side::Remote, Layout::Document);
        store.fail_row("Tasks", "task-42").await;

        let counts = ApplyExecutor::new(&store, &catalog)
            .apply(&task_plan(Side::Remote, 100))
            .await
            .unwrap();

        let tasks = counts.table("Tasks").unwrap();
        assert_eq!(tasks.applied(), 99);
        assert_eq!(tasks.failed, 1);
        assert_eq!(
            tasks.failures,
            vec![RowFailure {
                table: "Tasks".to_string(),
                key: "task-42".to_string(),
                message: "Row rejected: Tasks task-42 violates a constraint".to_string(),
            }]
        );
        assert_eq!(counts.failures().count(), 1);

        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json["tables"]["Tasks"]["failures"][0]["key"], "task-42");

        let rows = store.rows("Tasks").await;
        assert_eq!(rows.len(), 99);
        assert_eq!(rows.last().unwrap().uuid(), Some("task-100"));
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_apply() {
        let catalog = Catalog::builtin().unwrap();
        let store = MemoryStore::new(Side::Remote, Layout::Document);
        store.set_unreachable(true);

        let failure = ApplyExecutor::new(&store, &catalog)
            .apply(&task_plan(Side::Remote, 2))
            .await
            .unwrap_err();

        assert!(failure.error.is_connectivity());
        assert_eq!(failure.counts.changed(), 0);
        assert_eq!(failure.counts.failed(), 0);
    }

    #[tokio::test]
    async fn test_missing_manager_skips_table() {
        let catalog = Catalog::builtin().unwrap();
        let store = MemoryStore::new(Side::Remote, Layout::Document).without_table("Tasks");

        let counts = ApplyExecutor::new(&store, &catalog)
            .apply(&task_plan(Side::Remote, 5))
            .await
            .unwrap();

        let tasks = counts.table("Tasks").unwrap();
        assert!(tasks.skipped);
        assert_eq!(tasks.applied(), 0);
    }

    #[tokio::test]
    async fn test_normalized_aggregate_writes_parent_then_children() {
        let catalog = Catalog::builtin().unwrap();
        let store = MemoryStore::new(Side::Local, Layout::Normalized);
        let document = row(json!({
            "date": "2024-03-14",
            "updatedAt": "2024-03-14T21:00:00.000Z",
            "booleanHabits": [
                {"habitKey": "meditate", "value": true},
                {"habitKey": "read", "value": false}
            ],
            "quantifiableHabits": []
        }));
        let previous = row(json!({
            "date": "2024-03-14",
            "updatedAt": "2024-03-13T21:00:00.000Z",
            "booleanHabits": [{"habitKey": "stretch", "value": true}],
            "quantifiableHabits": []
        }));
        store
            .seed(
                "booleanHabits",
                vec![row(json!({"date": "2024-03-14", "habitKey": "stretch", "value": 1}))],
            )
            .await;

        let mut plan = ApplyPlan::new(Side::Local);
        plan.table_mut("DailyNotes").upserts.push(PlannedUpsert {
            identity: Identity::Natural(vec!["2024-03-14".to_string()]),
            row: document,
            previous: Some(previous),
        });

        let counts = ApplyExecutor::new(&store, &catalog).apply(&plan).await.unwrap();

        let notes = store.rows("dailyNotes").await;
        assert_eq!(notes.len(), 1);
        assert!(!notes[0].contains("booleanHabits"));

        let habits = store.rows("booleanHabits").await;
        let values: Vec<_> = habits
            .iter()
            .map(|r| (r.get_str("habitKey").unwrap().to_string(), r.get("value").cloned()))
            .collect();
        assert_eq!(
            values,
            vec![
                ("meditate".to_string(), Some(json!(1))),
                ("read".to_string(), Some(json!(0))),
            ]
        );

        let daily = counts.table("DailyNotes").unwrap();
        assert_eq!(daily.inserted, 1);
        assert_eq!(daily.children_upserted, 2);
        assert_eq!(daily.children_deleted, 1);
    }

    #[tokio::test]
    async fn test_failed_parent_skips_children() {
        let catalog = Catalog::builtin().unwrap();
        let store = MemoryStore::new(Side::Local, Layout::Normalized);
        store.fail_row("dailyNotes", "2024-03-14").await;

        let mut plan = ApplyPlan::new(Side::Local);
        plan.table_mut("DailyNotes").upserts.push(PlannedUpsert {
            identity: Identity::Natural(vec!["2024-03-14".to_string()]),
            row: row(json!({
                "date": "2024-03-14",
                "booleanHabits": [{"habitKey": "read", "value": true}]
            })),
            previous: None,
        });

        let counts = ApplyExecutor::new(&store, &catalog).apply(&plan).await.unwrap();

        assert_eq!(counts.table("DailyNotes").unwrap().failed, 1);
        assert!(store.rows("booleanHabits").await.is_empty());
    }

    #[tokio::test]
    async fn test_deleting_aggregate_removes_children() {
        let catalog = Catalog::builtin().unwrap();
        let store = MemoryStore::new(Side::Local, Layout::Normalized);
        store.seed("dailyNotes", vec![row(json!({"date": "2024-03-14"}))]).await;
        store
            .seed(
                "quantifiableHabits",
                vec![row(json!({"date": "2024-03-14", "habitKey": "water", "value": 3}))],
            )
            .await;

        let mut plan = ApplyPlan::new(Side::Local);
        plan.table_mut("DailyNotes").deletes.push(PlannedDelete {
            identity: Identity::Natural(vec!["2024-03-14".to_string()]),
            previous: row(json!({
                "date": "2024-03-14",
                "booleanHabits": [],
                "quantifiableHabits": [{"habitKey": "water", "value": 3}]
            })),
        });

        let counts = ApplyExecutor::new(&store, &catalog).apply(&plan).await.unwrap();

        assert!(store.rows("dailyNotes").await.is_empty());
        assert!(store.rows("quantifiableHabits").await.is_empty());
        assert_eq!(counts.table("DailyNotes").unwrap().deleted, 1);
        assert_eq!(counts.table("DailyNotes").unwrap().children_deleted, 1);
    }
}
