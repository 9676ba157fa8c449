use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::apply::ApplyCounts;
use crate::models::{ApplyPlan, MergeOutcome, Side};

/// Upserts and deletes the merge scheduled for one side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlannedCounts {
    pub upserts: usize,
    pub deletes: usize,
}

impl From<&ApplyPlan> for PlannedCounts {
    fn from(plan: &ApplyPlan) -> Self {
        let (upserts, deletes) = plan.counts();
        Self { upserts, deletes }
    }
}

/// Structured result of a sync run.
///
/// Counts gathered before a failure are kept, so a failed report still
/// shows what was applied.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub authority: Side,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: MergeOutcome,
    pub planned_local: PlannedCounts,
    pub planned_remote: PlannedCounts,
    pub local: ApplyCounts,
    pub remote: ApplyCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncReport {
    pub(crate) fn start(authority: Side, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            success: false,
            authority,
            dry_run,
            started_at: now,
            finished_at: now,
            outcome: MergeOutcome::default(),
            planned_local: PlannedCounts::default(),
            planned_remote: PlannedCounts::default(),
            local: ApplyCounts::default(),
            remote: ApplyCounts::default(),
            error: None,
        }
    }

    pub(crate) fn finish(mut self, result: Result<(), String>) -> Self {
        self.finished_at = Utc::now();
        match result {
            Ok(()) => self.success = true,
            Err(error) => {
                self.success = false;
                self.error = Some(error);
            }
        }
        self
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Rows that failed to apply on either side.
    pub fn failed_rows(&self) -> usize {
        self.local.failed() + self.remote.failed()
    }
}
