//! `deletion_log`: the durable tombstone ledger.
//!
//! Timestamps are stored in the fixed-width form produced by
//! `format_timestamp`, so SQL comparisons on the text column order
//! correctly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use los_sync_core::models::{format_timestamp, parse_timestamp};
use los_sync_core::{Catalog, Identity, LedgerError, Tombstone, TombstoneLedger};
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool};
use std::sync::Arc;

pub(crate) async fn record<'e, E>(
    executor: E,
    table: &str,
    identity: &Identity,
    deleted_at: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO deletion_log (table_name, identity, deleted_at)
        VALUES (?, ?, ?)
        ON CONFLICT (table_name, identity)
        DO UPDATE SET deleted_at = MAX(deleted_at, excluded.deleted_at)
        "#,
    )
    .bind(table)
    .bind(identity.key())
    .bind(format_timestamp(deleted_at))
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn list_since(
    pool: &SqlitePool,
    catalog: &Catalog,
    since: DateTime<Utc>,
) -> Result<Vec<Tombstone>, sqlx::Error> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        r#"
        SELECT table_name, identity, deleted_at
        FROM deletion_log
        WHERE deleted_at >= ?
        ORDER BY deleted_at, id
        "#,
    )
    .bind(format_timestamp(since))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(table, key, deleted_at)| {
            let tombstone = to_tombstone(catalog, &table, &key, &deleted_at);
            if tombstone.is_none() {
                tracing::warn!(table = %table, key = %key, "Ignoring unreadable deletion log entry");
            }
            tombstone
        })
        .collect())
}

fn to_tombstone(catalog: &Catalog, table: &str, key: &str, deleted_at: &str) -> Option<Tombstone> {
    let def = catalog.resolve(table).ok()?;
    let identity = def.identity.parse_key(key).ok()?;
    let deleted_at = parse_timestamp(&Value::String(deleted_at.to_string()))?;
    Some(Tombstone::new(def.name.clone(), identity, deleted_at))
}

/// [`TombstoneLedger`] over the `deletion_log` table.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
    catalog: Arc<Catalog>,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool, catalog: Arc<Catalog>) -> Self {
        Self { pool, catalog }
    }
}

fn ledger_error(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

#[async_trait]
impl TombstoneLedger for SqliteLedger {
    async fn record(
        &self,
        table: &str,
        identity: &Identity,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        record(&self.pool, table, identity, deleted_at)
            .await
            .map_err(ledger_error)
    }

    async fn is_deleted(
        &self,
        table: &str,
        identity: &Identity,
        as_of: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let deleted_at: Option<(String,)> = sqlx::query_as(
            "SELECT deleted_at FROM deletion_log WHERE table_name = ? AND identity = ?",
        )
        .bind(table)
        .bind(identity.key())
        .fetch_optional(&self.pool)
        .await
        .map_err(ledger_error)?;

        Ok(deleted_at
            .and_then(|(at,)| parse_timestamp(&Value::String(at)))
            .is_some_and(|at| at >= as_of))
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<Tombstone>, LedgerError> {
        list_since(&self.pool, &self.catalog, since)
            .await
            .map_err(ledger_error)
    }

    async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM deletion_log WHERE deleted_at < ?")
            .bind(format_timestamp(before))
            .execute(&self.pool)
            .await
            .map_err(ledger_error)?;
        Ok(result.rows_affected())
    }
}
