//! SQLite-backed store for one side of the sync.
//!
//! Every table lives in the shared `records` table as JSON documents keyed
//! by `(table_name, identity)`, where `table_name` is the side's own name
//! for the table. The mobile client runs it `Normalized` (daily notes split
//! into parent and habit rows), the server runs it as `Document`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use los_sync_core::codec;
use los_sync_core::models::{format_timestamp, CREATED_AT_FIELD, UUID_FIELD};
use los_sync_core::{
    Catalog, Change, Identity, IdentityKind, Layout, Row, Side, Store, StoreError, TableDef,
    TableManager, Tombstone, Upserted,
};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{deletion_log, store_error, DbError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Upserted,
    Deleted,
}

/// Published for every write that did not come from a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordChange {
    pub table: String,
    pub key: String,
    pub kind: ChangeKind,
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    side: Side,
    layout: Layout,
    catalog: Arc<Catalog>,
    changes: broadcast::Sender<RecordChange>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, side: Side, layout: Layout, catalog: Arc<Catalog>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            pool,
            side,
            layout,
            catalog,
            changes,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Change notifications for ordinary (non-sync) writes.
    pub fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }

    fn publish(&self, table: &str, key: String, kind: ChangeKind) {
        // No receivers is fine.
        let _ = self.changes.send(RecordChange {
            table: table.to_string(),
            key,
            kind,
        });
    }

    fn table_name<'a>(&self, def: &'a TableDef) -> Result<&'a str, DbError> {
        def.side_name(self.side).ok_or_else(|| {
            DbError::InvalidRecord(format!("{} is not stored on the {} side", def.name, self.side))
        })
    }

    /// Creates or replaces a record through the normal CRUD path.
    ///
    /// Assigns a uuid and `createdAt` when missing and stamps `updatedAt`
    /// with the current time. On a normalized store an aggregate document is
    /// split into its parent and child rows, and the parent's previous
    /// children are replaced. Writing a single child row bumps its parent's
    /// `updatedAt` instead, and fails when the parent does not exist. Every
    /// statement runs in one transaction.
    pub async fn put_record(&self, def: &TableDef, row: Row) -> Result<Upserted, DbError> {
        let mut row = row;
        let now = Utc::now();
        let parent = match self.layout {
            Layout::Normalized => self.catalog.parent_of(&def.name),
            Layout::Document => None,
        };
        if parent.is_none() && row.get_str(UUID_FIELD).map_or(true, str::is_empty) {
            row.insert(UUID_FIELD, uuid::Uuid::new_v4().to_string());
        }
        if !row.contains(CREATED_AT_FIELD) {
            row.insert(CREATED_AT_FIELD, format_timestamp(now));
        }
        row.set_updated_at(now);

        let name = self.table_name(def)?;
        let identity = def.identity.resolve(&row).ok_or_else(|| {
            DbError::InvalidRecord(format!("{} row is missing its key fields", def.name))
        })?;
        let key = identity.key();

        let mut tx = self.pool.begin().await?;
        let change = if def.is_aggregate() && self.layout == Layout::Normalized {
            let parts = codec::decompose(def, &row)
                .map_err(|e| DbError::InvalidRecord(e.to_string()))?;
            let change = write_row(&mut *tx, name, &key, &parts.parent).await?;
            self.replace_children(&mut *tx, def, &key, &parts.children)
                .await?;
            change
        } else {
            if let Some(parent) = parent {
                // The row is now the child's own, not inherited.
                row.remove(codec::INHERITED_FIELD);
                if !self.touch_parent(&mut *tx, parent, def, &row, now).await? {
                    return Err(DbError::InvalidRecord(format!(
                        "{} {} has no {} parent",
                        def.name, key, parent.name
                    )));
                }
            }
            write_row(&mut *tx, name, &key, &row).await?
        };
        tx.commit().await?;

        if change != Change::Unchanged {
            self.publish(&def.name, key, ChangeKind::Upserted);
        }
        // Report the document form back, as the caller sent it.
        Ok(Upserted { row, change })
    }

    /// Deletes a record through the normal CRUD path and records a
    /// tombstone so the deletion reaches the other side.
    ///
    /// An aggregate child on a normalized store gets no tombstone of its
    /// own; its parent's `updatedAt` is bumped so the parent document
    /// carries the deletion.
    pub async fn delete_record(&self, def: &TableDef, identity: &Identity) -> Result<bool, DbError> {
        let name = self.table_name(def)?;
        let key = identity.key();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let removed: Option<(String,)> = sqlx::query_as(
            "DELETE FROM records WHERE table_name = ? AND identity = ? RETURNING body",
        )
        .bind(name)
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

        let parent = match self.layout {
            Layout::Normalized => self.catalog.parent_of(&def.name),
            Layout::Document => None,
        };
        match parent {
            Some(parent) => {
                if let Some((body,)) = &removed {
                    let child: Row = serde_json::from_str(body)?;
                    self.touch_parent(&mut *tx, parent, def, &child, now).await?;
                }
            }
            None => {
                if self.layout == Layout::Normalized && def.is_aggregate() {
                    self.replace_children(&mut *tx, def, &key, &BTreeMap::new())
                        .await?;
                }
                deletion_log::record(&mut *tx, &def.name, identity, now).await?;
            }
        }
        tx.commit().await?;

        let removed = removed.is_some();
        tracing::debug!(table = %def.name, key = %key, removed, "Deleted record");
        self.publish(&def.name, key, ChangeKind::Deleted);
        Ok(removed)
    }

    /// Drops every child row linked to `link` and writes `children` in
    /// their place.
    async fn replace_children(
        &self,
        conn: &mut SqliteConnection,
        def: &TableDef,
        link: &str,
        children: &BTreeMap<String, Vec<Row>>,
    ) -> Result<(), DbError> {
        let specs = def.aggregate.iter().flat_map(|a| a.children.iter());
        for spec in specs {
            let child = self
                .catalog
                .resolve(&spec.table)
                .map_err(|e| DbError::InvalidRecord(e.to_string()))?;
            let child_name = self.table_name(child)?;
            sqlx::query(
                "DELETE FROM records WHERE table_name = ? AND json_extract(body, '$.' || ?) = ?",
            )
            .bind(child_name)
            .bind(&spec.parent_link_field)
            .bind(link)
            .execute(&mut *conn)
            .await?;

            for row in children.get(&child.name).into_iter().flatten() {
                let identity = child.identity.resolve(row).ok_or_else(|| {
                    DbError::InvalidRecord(format!("{} row is missing its key fields", child.name))
                })?;
                write_row(conn, child_name, &identity.key(), row).await?;
            }
        }
        Ok(())
    }

    /// Stamps `at` as the `updatedAt` of the aggregate `child` belongs to.
    /// Returns false when that parent is not stored.
    async fn touch_parent(
        &self,
        conn: &mut SqliteConnection,
        parent: &TableDef,
        child_def: &TableDef,
        child: &Row,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let link_field = parent
            .aggregate
            .iter()
            .flat_map(|a| a.children.iter())
            .find(|spec| spec.table == child_def.name)
            .map(|spec| spec.parent_link_field.as_str())
            .ok_or_else(|| {
                DbError::InvalidRecord(format!("{} is not a child of {}", child_def.name, parent.name))
            })?;
        let Some(link) = child.get(link_field) else {
            return Ok(false);
        };
        let mut key_row = Row::new();
        for field in parent.identity.fields() {
            key_row.insert(field, link.clone());
        }
        let Some(parent_key) = parent.identity.resolve(&key_row).map(|i| i.key()) else {
            return Ok(false);
        };
        let parent_name = self.table_name(parent)?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT body FROM records WHERE table_name = ? AND identity = ?")
                .bind(parent_name)
                .bind(&parent_key)
                .fetch_optional(&mut *conn)
                .await?;
        let Some((body,)) = existing else {
            return Ok(false);
        };

        let mut row: Row = serde_json::from_str(&body)?;
        row.set_updated_at(at);
        write_row(conn, parent_name, &parent_key, &row).await?;
        tracing::debug!(table = %parent.name, key = %parent_key, "Touched parent of {} row", child_def.name);
        Ok(true)
    }

    /// Row count per stored table name.
    pub async fn counts(&self) -> Result<Vec<(String, i64)>, DbError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT table_name, COUNT(*) FROM records GROUP BY table_name ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    fn manager_for(&self, def: &TableDef) -> Result<SqliteTable<'_>, DbError> {
        Ok(SqliteTable {
            store: self,
            name: self.table_name(def)?.to_string(),
            canonical: def.name.clone(),
            identity: def.identity.clone(),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn side(&self) -> Side {
        self.side
    }

    fn layout(&self) -> Layout {
        self.layout
    }

    fn manager<'a>(&'a self, table: &TableDef) -> Option<Box<dyn TableManager + 'a>> {
        let manager = self.manager_for(table).ok()?;
        Some(Box::new(manager))
    }

    async fn tombstones_since(&self, since: DateTime<Utc>) -> Result<Vec<Tombstone>, StoreError> {
        deletion_log::list_since(&self.pool, &self.catalog, since)
            .await
            .map_err(store_error)
    }
}

struct SqliteTable<'a> {
    store: &'a SqliteStore,
    name: String,
    canonical: String,
    identity: IdentityKind,
}

#[async_trait]
impl TableManager for SqliteTable<'_> {
    async fn list(&self) -> Result<Vec<Row>, StoreError> {
        let bodies: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM records WHERE table_name = ? ORDER BY rowid")
                .bind(&self.name)
                .fetch_all(&self.store.pool)
                .await
                .map_err(store_error)?;

        bodies
            .into_iter()
            .map(|(body,)| {
                serde_json::from_str::<Row>(&body).map_err(|e| StoreError::Malformed {
                    table: self.canonical.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn upsert(&self, row: &Row, is_sync_origin: bool) -> Result<Upserted, StoreError> {
        let identity = self.identity.resolve(row).ok_or_else(|| {
            StoreError::Rejected(format!("{} row is missing its key fields", self.canonical))
        })?;
        let key = identity.key();

        let mut row = row.clone();
        if !is_sync_origin {
            row.set_updated_at(Utc::now());
        }

        let mut tx = self.store.pool.begin().await.map_err(store_error)?;
        let change = write_row(&mut *tx, &self.name, &key, &row).await?;
        tx.commit().await.map_err(store_error)?;

        if !is_sync_origin && change != Change::Unchanged {
            self.store
                .publish(&self.canonical, key, ChangeKind::Upserted);
        }
        Ok(Upserted { row, change })
    }

    async fn remove(&self, identity: &Identity) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM records WHERE table_name = ? AND identity = ?")
            .bind(&self.name)
            .bind(identity.key())
            .execute(&self.store.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }
}

/// Inserts or replaces one stored row, reporting what changed.
async fn write_row(
    conn: &mut SqliteConnection,
    name: &str,
    key: &str,
    row: &Row,
) -> Result<Change, StoreError> {
    let body = serde_json::to_string(row).map_err(|e| StoreError::Rejected(e.to_string()))?;
    let updated_at = row.updated_at().map(format_timestamp);

    let existing: Option<(String,)> =
        sqlx::query_as("SELECT body FROM records WHERE table_name = ? AND identity = ?")
            .bind(name)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_error)?;

    let change = match existing {
        Some((current,)) if serde_json::from_str::<Row>(&current).ok().as_ref() == Some(row) => {
            return Ok(Change::Unchanged);
        }
        Some(_) => Change::Updated,
        None => Change::Inserted,
    };

    sqlx::query(
        r#"
        INSERT INTO records (table_name, identity, body, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (table_name, identity)
        DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at
        "#,
    )
    .bind(name)
    .bind(key)
    .bind(&body)
    .bind(&updated_at)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;
    Ok(change)
}
