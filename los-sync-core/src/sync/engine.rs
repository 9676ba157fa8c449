use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::error::SyncError;
use super::report::{PlannedCounts, SyncReport};
use crate::apply::ApplyExecutor;
use crate::catalog::{Catalog, TableDef};
use crate::fetch::SnapshotFetcher;
use crate::ledger::{epoch, TombstoneIndex, TombstoneLedger};
use crate::merge::merge;
use crate::models::Side;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Side whose row wins when both copies share an `updatedAt`.
    pub authority: Side,
    /// Stop after merging and only report the plan.
    pub dry_run: bool,
    /// Restrict the run to these tables. Any catalog name is accepted; a
    /// child table selects its aggregate.
    pub tables: Option<Vec<String>>,
    /// Upper bound for the whole run's I/O.
    pub deadline: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            authority: Side::Local,
            dry_run: false,
            tables: None,
            deadline: None,
        }
    }
}

/// Reconciles a local and a remote store.
///
/// Runs on one engine are serialized, so two syncs never write to the
/// same destination concurrently.
pub struct SyncEngine<L, R, G> {
    catalog: Arc<Catalog>,
    local: L,
    remote: R,
    ledger: G,
    run_lock: Mutex<()>,
}

impl<L, R, G> SyncEngine<L, R, G>
where
    L: Store,
    R: Store,
    G: TombstoneLedger,
{
    pub fn new(catalog: Arc<Catalog>, local: L, remote: R, ledger: G) -> Self {
        Self {
            catalog,
            local,
            remote,
            ledger,
            run_lock: Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn ledger(&self) -> &G {
        &self.ledger
    }

    /// Runs one sync. Never fails outright: a fatal error is reported in
    /// the returned [`SyncReport`] together with the counts gathered so far.
    pub async fn run(&self, options: &SyncOptions) -> SyncReport {
        let _guard = self.run_lock.lock().await;
        let mut report = SyncReport::start(options.authority, options.dry_run);

        tracing::info!(
            authority = %options.authority,
            dry_run = options.dry_run,
            "Starting sync"
        );

        let result = self.run_phases(options, &mut report).await;
        if let Err(e) = &result {
            tracing::error!("Sync failed: {}", e);
        }
        let report = report.finish(result.map_err(|e| e.to_string()));

        let totals = report.outcome.totals();
        tracing::info!(
            success = report.success,
            to_remote = totals.copied_local_to_remote,
            to_local = totals.copied_remote_to_local,
            deleted = totals.deleted_local + totals.deleted_remote,
            conflicts = totals.conflicts,
            malformed = totals.malformed,
            failed = report.failed_rows(),
            duration_ms = report.duration_ms(),
            "Sync finished"
        );
        report
    }

    async fn run_phases(
        &self,
        options: &SyncOptions,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let deadline = options.deadline.map(|d| Instant::now() + d);
        let tables = self.select_tables(options.tables.as_deref())?;

        within(deadline, "tombstone import", self.import_tombstones()).await??;
        let tombstones: TombstoneIndex = self.ledger.list_since(epoch()).await?.into_iter().collect();
        tracing::debug!(count = tombstones.len(), "Loaded tombstones");

        let local = SnapshotFetcher::new(&self.local, &self.catalog);
        let remote = SnapshotFetcher::new(&self.remote, &self.catalog);
        let (local_snapshot, remote_snapshot) = within(
            deadline,
            "fetch",
            futures::future::try_join(local.fetch(&tables), remote.fetch(&tables)),
        )
        .await??;

        let result = merge(
            &self.catalog,
            &local_snapshot,
            &remote_snapshot,
            &tombstones,
            options.authority,
        );
        report.outcome = result.outcome.clone();
        report.planned_local = PlannedCounts::from(&result.local_plan);
        report.planned_remote = PlannedCounts::from(&result.remote_plan);

        if options.dry_run {
            return Ok(());
        }

        let executor = ApplyExecutor::new(&self.local, &self.catalog);
        within(
            deadline,
            "local apply",
            executor.apply_into(&result.local_plan, &mut report.local),
        )
        .await??;

        let executor = ApplyExecutor::new(&self.remote, &self.catalog);
        within(
            deadline,
            "remote apply",
            executor.apply_into(&result.remote_plan, &mut report.remote),
        )
        .await??;

        Ok(())
    }

    fn select_tables(&self, names: Option<&[String]>) -> Result<Vec<&TableDef>, SyncError> {
        let Some(names) = names else {
            return Ok(self.catalog.root_tables().collect());
        };

        let mut tables: Vec<&TableDef> = Vec::new();
        for name in names {
            let def = self.catalog.resolve(name)?;
            let def = self.catalog.parent_of(&def.name).unwrap_or(def);
            if !tables.iter().any(|t| t.name == def.name) {
                tables.push(def);
            }
        }
        Ok(tables)
    }

    /// Copies the deletions both stores recorded through their own CRUD
    /// paths into the ledger.
    async fn import_tombstones(&self) -> Result<(), SyncError> {
        let local = self.local.tombstones_since(epoch());
        let remote = self.remote.tombstones_since(epoch());
        let (local, remote) = futures::future::try_join(local, remote).await?;

        let mut imported = 0;
        for tombstone in local.into_iter().chain(remote) {
            let Ok(def) = self.catalog.resolve(&tombstone.table) else {
                tracing::warn!(table = %tombstone.table, "Ignoring tombstone for unknown table");
                continue;
            };
            self.ledger
                .record(&def.name, &tombstone.identity, tombstone.deleted_at)
                .await?;
            imported += 1;
        }
        tracing::debug!(imported, "Imported store tombstones");
        Ok(())
    }
}

async fn within<F: Future>(
    deadline: Option<Instant>,
    phase: &'static str,
    future: F,
) -> Result<F::Output, SyncError> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, future)
            .await
            .map_err(|_| SyncError::DeadlineExceeded(phase)),
        None => Ok(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::{Identity, Layout, Row, Tombstone};
    use crate::store::{MemoryStore, StoreError, TableManager, Upserted};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    fn row(value: Value) -> Row {
        Row::from_value(value).unwrap()
    }

    fn engine() -> SyncEngine<MemoryStore, MemoryStore, MemoryLedger> {
        SyncEngine::new(
            Arc::new(Catalog::builtin().unwrap()),
            MemoryStore::new(Side::Local, Layout::Normalized),
            MemoryStore::new(Side::Remote, Layout::Document),
            MemoryLedger::new(),
        )
    }

    #[tokio::test]
    async fn test_daily_note_reaches_normalized_side() {
        let engine = engine();
        engine
            .remote()
            .seed(
                "DailyNotes",
                vec![row(json!({
                    "uuid": "dn-1",
                    "date": "2024-03-14",
                    "createdAt": "2024-03-14T08:00:00.000Z",
                    "updatedAt": "2024-03-14T21:00:00.000Z",
                    "booleanHabits": [
                        {"habitKey": "meditate", "value": true},
                        {"habitKey": "read", "value": false}
                    ],
                    "quantifiableHabits": []
                }))],
            )
            .await;

        let report = engine.run(&SyncOptions::default()).await;
        assert!(report.success, "{:?}", report.error);

        let notes = engine.local().rows("dailyNotes").await;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].get_str("date"), Some("2024-03-14"));

        let habits = engine.local().rows("booleanHabits").await;
        let mut pairs: Vec<(String, String, Value)> = habits
            .iter()
            .map(|r| {
                (
                    r.get_str("date").unwrap().to_string(),
                    r.get_str("habitKey").unwrap().to_string(),
                    r.get("value").cloned().unwrap(),
                )
            })
            .collect();
        pairs.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            pairs,
            vec![
                ("2024-03-14".to_string(), "meditate".to_string(), json!(1)),
                ("2024-03-14".to_string(), "read".to_string(), json!(0)),
            ]
        );
        assert_eq!(report.outcome.tables["DailyNotes"].copied_remote_to_local, 1);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let engine = engine();
        engine
            .local()
            .seed(
                "tasks",
                vec![row(json!({"uuid": "t1", "text": "a", "updatedAt": "2024-03-14T09:00:00.000Z"}))],
            )
            .await;
        engine
            .remote()
            .seed(
                "Money",
                vec![row(json!({"uuid": "m1", "amount": 4, "updatedAt": "2024-03-14T09:00:00.000Z"}))],
            )
            .await;

        let first = engine.run(&SyncOptions::default()).await;
        assert!(first.success);
        assert_eq!(first.remote.changed() + first.local.changed(), 2);

        let second = engine.run(&SyncOptions::default()).await;
        assert!(second.success);
        assert_eq!(second.planned_local, PlannedCounts::default());
        assert_eq!(second.planned_remote, PlannedCounts::default());
        assert_eq!(second.outcome.totals().unchanged, 2);
    }

    #[tokio::test]
    async fn test_store_tombstones_delete_stale_rows() {
        let engine = engine();
        engine
            .local()
            .seed(
                "tasks",
                vec![row(json!({"uuid": "x", "updatedAt": "2024-03-14T09:00:00.000Z"}))],
            )
            .await;
        let deleted_at = Utc.with_ymd_and_hms(2024, 3, 14, 12, 0, 0).unwrap();
        engine
            .remote()
            .add_tombstone(Tombstone::new("tasks", Identity::Uuid("x".to_string()), deleted_at))
            .await;

        let report = engine.run(&SyncOptions::default()).await;

        assert!(report.success);
        assert!(engine.local().rows("tasks").await.is_empty());
        assert!(engine.remote().rows("Tasks").await.is_empty());
        assert_eq!(report.local.table("Tasks").unwrap().deleted, 1);
        assert!(engine
            .ledger()
            .is_deleted("Tasks", &Identity::Uuid("x".to_string()), deleted_at)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let engine = engine();
        engine
            .local()
            .seed("mood", vec![row(json!({"uuid": "m", "updatedAt": "2024-03-14T09:00:00.000Z"}))])
            .await;

        let report = engine
            .run(&SyncOptions {
                dry_run: true,
                ..SyncOptions::default()
            })
            .await;

        assert!(report.success);
        assert_eq!(report.planned_remote.upserts, 1);
        assert!(engine.remote().rows("Mood").await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_table_is_fatal() {
        let engine = engine();
        let report = engine
            .run(&SyncOptions {
                tables: Some(vec!["Widgets".to_string()]),
                ..SyncOptions::default()
            })
            .await;

        assert!(!report.success);
        assert!(report.error.unwrap().contains("Unknown table: Widgets"));
    }

    #[test]
    fn test_child_table_selects_its_aggregate() {
        let engine = engine();
        let tables = engine
            .select_tables(Some(&["booleanHabits".to_string(), "DailyNotes".to_string()]))
            .unwrap();
        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["DailyNotes"]);
    }

    #[tokio::test]
    async fn test_unreachable_remote_fails_run() {
        let engine = engine();
        engine.remote().set_unreachable(true);

        let report = engine.run(&SyncOptions::default()).await;

        assert!(!report.success);
        assert!(report.error.unwrap().contains("unreachable"));
        assert_eq!(report.local.changed(), 0);
    }

    #[tokio::test]
    async fn test_daily_notes_converge_under_remote_authority() {
        let engine = engine();
        engine
            .remote()
            .seed(
                "DailyNotes",
                vec![
                    row(json!({
                        "uuid": "dn-1",
                        "date": "2024-03-14",
                        "createdAt": "2024-03-14T08:00:00.000Z",
                        "updatedAt": "2024-03-14T21:00:00.000Z",
                        "booleanHabits": [{
                            "habitKey": "read",
                            "value": true,
                            "createdAt": "2024-03-14T08:00:00.000Z",
                            "updatedAt": "2024-03-14T21:00:00.000Z"
                        }],
                        "quantifiableHabits": [{"habitKey": "water", "value": 2}]
                    })),
                    row(json!({
                        "uuid": "dn-2",
                        "date": "2024-03-15",
                        "updatedAt": "2024-03-15T21:00:00.000Z",
                        "booleanHabits": [{"habitKey": "read", "value": false}],
                        "quantifiableHabits": []
                    })),
                ],
            )
            .await;
        let before = engine.remote().rows("DailyNotes").await;
        let options = SyncOptions {
            authority: Side::Remote,
            ..SyncOptions::default()
        };

        let first = engine.run(&options).await;
        assert!(first.success, "{:?}", first.error);
        assert_eq!(first.outcome.tables["DailyNotes"].copied_remote_to_local, 2);

        for _ in 0..2 {
            let again = engine.run(&options).await;
            assert!(again.success);
            let notes = &again.outcome.tables["DailyNotes"];
            assert_eq!(notes.conflicts, 0);
            assert_eq!(notes.copied_remote_to_local + notes.copied_local_to_remote, 0);
            assert_eq!(again.local.changed() + again.remote.changed(), 0);
        }
        assert_eq!(engine.remote().rows("DailyNotes").await, before);
    }

    #[tokio::test]
    async fn test_failed_run_keeps_counts_applied_before_the_failure() {
        let engine = engine();
        engine
            .remote()
            .seed(
                "Tasks",
                vec![row(json!({"uuid": "t1", "updatedAt": "2024-03-14T09:00:00.000Z"}))],
            )
            .await;
        engine
            .local()
            .seed(
                "money",
                vec![
                    row(json!({"uuid": "m1", "amount": 1, "updatedAt": "2024-03-14T09:00:00.000Z"})),
                    row(json!({"uuid": "m2", "amount": 2, "updatedAt": "2024-03-14T09:00:00.000Z"})),
                ],
            )
            .await;
        engine.remote().unreachable_after(1);

        let report = engine.run(&SyncOptions::default()).await;

        assert!(!report.success);
        assert!(report.error.as_deref().unwrap().contains("unreachable"));
        assert_eq!(report.local.table("Tasks").unwrap().inserted, 1);
        assert_eq!(report.remote.table("Money").unwrap().inserted, 1);
        assert_eq!(report.remote.changed(), 1);
        assert_eq!(engine.remote().rows("Money").await.len(), 1);
    }

    struct Stalled;

    #[async_trait]
    impl TableManager for Stalled {
        async fn list(&self) -> Result<Vec<Row>, StoreError> {
            std::future::pending().await
        }

        async fn upsert(&self, _row: &Row, _is_sync_origin: bool) -> Result<Upserted, StoreError> {
            std::future::pending().await
        }

        async fn remove(&self, _identity: &Identity) -> Result<bool, StoreError> {
            std::future::pending().await
        }
    }

    struct StalledStore;

    #[async_trait]
    impl Store for StalledStore {
        fn side(&self) -> Side {
            Side::Remote
        }

        fn layout(&self) -> Layout {
            Layout::Document
        }

        fn manager<'a>(&'a self, _table: &TableDef) -> Option<Box<dyn TableManager + 'a>> {
            Some(Box::new(Stalled))
        }
    }

    #[tokio::test]
    async fn test_deadline_bounds_fetch() {
        let engine = SyncEngine::new(
            Arc::new(Catalog::builtin().unwrap()),
            MemoryStore::new(Side::Local, Layout::Normalized),
            StalledStore,
            MemoryLedger::new(),
        );

        let report = engine
            .run(&SyncOptions {
                deadline: Some(Duration::from_millis(50)),
                ..SyncOptions::default()
            })
            .await;

        assert!(!report.success);
        assert_eq!(
            report.error.as_deref(),
            Some("Sync deadline exceeded during fetch")
        );
    }
}
