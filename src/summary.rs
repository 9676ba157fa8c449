//! Sync summary files.
//!
//! After each run the CLI can drop the full [`SyncReport`] as JSON into a
//! directory, one file per run, named after the run's start time.

use los_sync_core::SyncReport;
use std::path::{Path, PathBuf};

/// File name for a run started at the report's `started_at`.
pub fn summary_file_name(report: &SyncReport) -> String {
    format!(
        "sync_summary_{}.json",
        report.started_at.format("%Y-%m-%d_%H-%M-%S")
    )
}

/// Writes `report` into `dir`, creating the directory if needed, and
/// returns the path written.
pub fn write_summary(dir: &Path, report: &SyncReport) -> Result<PathBuf, std::io::Error> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(summary_file_name(report));
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, json)?;
    tracing::debug!("Wrote sync summary to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use los_sync_core::store::MemoryStore;
    use los_sync_core::{Catalog, Layout, MemoryLedger, Side, SyncEngine, SyncOptions};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_summary() {
        let engine = SyncEngine::new(
            Arc::new(Catalog::builtin().unwrap()),
            MemoryStore::new(Side::Local, Layout::Normalized),
            MemoryStore::new(Side::Remote, Layout::Document),
            MemoryLedger::new(),
        );
        let options = SyncOptions {
            dry_run: true,
            ..SyncOptions::default()
        };
        let report = engine.run(&options).await;

        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path().join("summaries");
        let path = write_summary(&dir, &report).unwrap();

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("sync_summary_"));
        assert!(name.ends_with(".json"));

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["success"], true);
        assert_eq!(written["dryRun"], true);
        assert_eq!(written["authority"], "local");
    }
}
