//! Merge engine: last-write-wins with tombstones.
//!
//! Pure function of two snapshots and a tombstone index. For every
//! identity in the union of both sides:
//!
//! 1. a tombstone at or after the newest live copy deletes it everywhere;
//! 2. a row present on one side only is copied to the other;
//! 3. otherwise the strictly newer `updatedAt` wins, and a tie with
//!    different content goes to the authority side and counts as a conflict;
//! 4. identical rows are left alone.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

use crate::catalog::{Catalog, TableDef};
use crate::ledger::TombstoneIndex;
use crate::models::{
    ApplyPlan, Identity, MergeOutcome, PlannedDelete, PlannedUpsert, Row, Side, Snapshot,
    TableOutcome, TableSnapshot,
};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub local_plan: ApplyPlan,
    pub remote_plan: ApplyPlan,
    pub outcome: MergeOutcome,
}

pub fn merge(
    catalog: &Catalog,
    local: &Snapshot,
    remote: &Snapshot,
    tombstones: &TombstoneIndex,
    authority: Side,
) -> MergeResult {
    let mut result = MergeResult {
        local_plan: ApplyPlan::new(Side::Local),
        remote_plan: ApplyPlan::new(Side::Remote),
        outcome: MergeOutcome::default(),
    };

    let names: BTreeSet<&str> = local.table_names().chain(remote.table_names()).collect();
    for name in names {
        let outcome = match catalog.resolve(name) {
            Err(e) => skip(name, e.to_string()),
            Ok(def) if catalog.parent_of(&def.name).is_some() => {
                skip(name, "aggregate child table is synced with its parent".to_string())
            }
            Ok(def) => match (local.get(name), remote.get(name)) {
                (Some(TableSnapshot::Malformed(reason)), _) => {
                    skip(name, format!("local snapshot malformed: {}", reason))
                }
                (_, Some(TableSnapshot::Malformed(reason))) => {
                    skip(name, format!("remote snapshot malformed: {}", reason))
                }
                (l, r) => merge_table(
                    def,
                    rows_of(l),
                    rows_of(r),
                    tombstones,
                    authority,
                    &mut result,
                ),
            },
        };
        result.outcome.tables.insert(name.to_string(), outcome);
    }

    result
}

fn skip(table: &str, reason: String) -> TableOutcome {
    tracing::warn!(table = %table, "Skipping table: {}", reason);
    TableOutcome::skipped(reason)
}

/// A table missing from one snapshot is treated as empty on that side.
fn rows_of(snapshot: Option<&TableSnapshot>) -> &[Row] {
    match snapshot {
        Some(TableSnapshot::Rows(rows)) => rows,
        _ => &[],
    }
}

struct Live<'a> {
    row: &'a Row,
    updated_at: DateTime<Utc>,
}

/// Identity-indexed view of one side of a table, in snapshot order.
struct SideIndex<'a> {
    order: Vec<Identity>,
    rows: HashMap<Identity, Live<'a>>,
}

impl<'a> SideIndex<'a> {
    fn build(def: &TableDef, side: Side, rows: &'a [Row], outcome: &mut TableOutcome) -> Self {
        let mut index = SideIndex {
            order: Vec::with_capacity(rows.len()),
            rows: HashMap::with_capacity(rows.len()),
        };

        for row in rows {
            let (Some(identity), Some(updated_at)) = (def.identity.resolve(row), row.updated_at())
            else {
                outcome.malformed += 1;
                tracing::warn!(
                    table = %def.name,
                    side = %side,
                    "Skipping row without identity or updatedAt"
                );
                continue;
            };

            match index.rows.get_mut(&identity) {
                Some(existing) => {
                    outcome.malformed += 1;
                    tracing::warn!(
                        table = %def.name,
                        side = %side,
                        key = %identity,
                        "Duplicate identity in snapshot, keeping the newest copy"
                    );
                    if updated_at > existing.updated_at {
                        *existing = Live { row, updated_at };
                    }
                }
                None => {
                    index.order.push(identity.clone());
                    index.rows.insert(identity, Live { row, updated_at });
                }
            }
        }
        index
    }
}

fn merge_table(
    def: &TableDef,
    local_rows: &[Row],
    remote_rows: &[Row],
    tombstones: &TombstoneIndex,
    authority: Side,
    result: &mut MergeResult,
) -> TableOutcome {
    let mut outcome = TableOutcome::default();
    let local = SideIndex::build(def, Side::Local, local_rows, &mut outcome);
    let remote = SideIndex::build(def, Side::Remote, remote_rows, &mut outcome);

    let identities = local.order.iter().chain(
        remote
            .order
            .iter()
            .filter(|identity| !local.rows.contains_key(*identity)),
    );

    for identity in identities {
        let l = local.rows.get(identity);
        let r = remote.rows.get(identity);

        let newest = l
            .iter()
            .chain(r.iter())
            .map(|live| live.updated_at)
            .max();
        let deleted = match (tombstones.deleted_at(&def.name, identity), newest) {
            (Some(deleted_at), Some(newest)) => deleted_at >= newest,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if deleted {
            if let Some(live) = l {
                result.local_plan.table_mut(&def.name).deletes.push(PlannedDelete {
                    identity: identity.clone(),
                    previous: live.row.clone(),
                });
                outcome.deleted_local += 1;
            }
            if let Some(live) = r {
                result.remote_plan.table_mut(&def.name).deletes.push(PlannedDelete {
                    identity: identity.clone(),
                    previous: live.row.clone(),
                });
                outcome.deleted_remote += 1;
            }
            continue;
        }

        let winner = match (l, r) {
            (Some(_), None) => Side::Local,
            (None, Some(_)) => Side::Remote,
            (Some(l), Some(r)) if l.row == r.row => {
                outcome.unchanged += 1;
                continue;
            }
            (Some(l), Some(r)) if l.updated_at > r.updated_at => Side::Local,
            (Some(l), Some(r)) if r.updated_at > l.updated_at => Side::Remote,
            (Some(_), Some(_)) => {
                outcome.conflicts += 1;
                tracing::info!(
                    table = %def.name,
                    key = %identity,
                    authority = %authority,
                    "Equal updatedAt with different content, resolved to authority"
                );
                authority
            }
            (None, None) => continue,
        };

        let (source, target, plan) = match winner {
            Side::Local => {
                outcome.copied_local_to_remote += 1;
                (l, r, &mut result.remote_plan)
            }
            Side::Remote => {
                outcome.copied_remote_to_local += 1;
                (r, l, &mut result.local_plan)
            }
        };
        let Some(source) = source else { continue };
        plan.table_mut(&def.name).upserts.push(PlannedUpsert {
            identity: identity.clone(),
            row: source.row.clone(),
            previous: target.map(|live| live.row.clone()),
        });
    }

    outcome
}
