//! Point-in-time copies of the local database, taken before a sync writes.

use chrono::{DateTime, Local};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use super::DbError;

/// File name for a backup taken at `at`.
pub fn backup_file_name(at: DateTime<Local>) -> String {
    format!("los_{}.db", at.format("%Y-%m-%d_%H-%M-%S"))
}

/// Writes a consistent copy of the database behind `pool` into `dir` and
/// returns its path. The directory is created if needed.
pub async fn backup_database(pool: &SqlitePool, dir: &Path) -> Result<PathBuf, DbError> {
    std::fs::create_dir_all(dir).map_err(DbError::Io)?;
    let path = dir.join(backup_file_name(Local::now()));
    if path.exists() {
        return Err(DbError::InvalidRecord(format!(
            "backup {} already exists",
            path.display()
        )));
    }

    sqlx::query("VACUUM INTO ?")
        .bind(path.to_string_lossy().into_owned())
        .execute(pool)
        .await?;

    tracing::info!("Backup created at {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_backup_file_name() {
        let at = Local.with_ymd_and_hms(2024, 3, 14, 9, 5, 7).unwrap();
        assert_eq!(backup_file_name(at), "los_2024-03-14_09-05-07.db");
    }

    #[tokio::test]
    async fn test_backup_is_a_readable_copy() {
        let temp_dir = tempdir().unwrap();
        let pool = init_db(&temp_dir.path().join("los.db")).await.unwrap();
        sqlx::query("INSERT INTO records (table_name, identity, body) VALUES ('tasks', 't1', '{}')")
            .execute(&pool)
            .await
            .unwrap();

        let dir = temp_dir.path().join("backups");
        let path = backup_database(&pool, &dir).await.unwrap();
        assert!(path.starts_with(&dir));
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("los_"));

        let copy = init_db(&path).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
            .fetch_one(&copy)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
