use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{IndexError, IndexStore, SyncFolder, SyncStateRecord, now_unix};

impl IndexStore {
    /// Registers a folder, or re-enables it if already known.
    pub async fn add_sync_folder(&self, path: &str) -> Result<SyncFolder, IndexError> {
        sqlx::query(
            "INSERT INTO sync_folders (path, enabled, created_at) VALUES (?1, 1, ?2)
             ON CONFLICT(path) DO UPDATE SET enabled = 1",
        )
        .bind(path)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        self.get_sync_folder_by_path(path)
            .await?
            .ok_or(IndexError::MissingRow("sync folder"))
    }

    /// Removes the folder and, by cascade, its sync state.
    pub async fn remove_sync_folder(&self, path: &str) -> Result<bool, IndexError> {
        let result = sqlx::query("DELETE FROM sync_folders WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_sync_folder_enabled(
        &self,
        path: &str,
        enabled: bool,
    ) -> Result<bool, IndexError> {
        let result = sqlx::query("UPDATE sync_folders SET enabled = ?1 WHERE path = ?2")
            .bind(enabled as i64)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_sync_folders(&self, enabled_only: bool) -> Result<Vec<SyncFolder>, IndexError> {
        let sql = if enabled_only {
            "SELECT id, path, enabled, created_at FROM sync_folders WHERE enabled = 1 ORDER BY path ASC"
        } else {
            "SELECT id, path, enabled, created_at FROM sync_folders ORDER BY path ASC"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(folder_from_row).collect()
    }

    pub async fn get_sync_folder_by_path(
        &self,
        path: &str,
    ) -> Result<Option<SyncFolder>, IndexError> {
        let row =
            sqlx::query("SELECT id, path, enabled, created_at FROM sync_folders WHERE path = ?1")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    pub async fn get_sync_state(
        &self,
        folder_id: i64,
        relative_path: &str,
    ) -> Result<Option<SyncStateRecord>, IndexError> {
        let row = sqlx::query(
            "SELECT folder_id, relative_path, content_hash, modified
             FROM sync_state WHERE folder_id = ?1 AND relative_path = ?2",
        )
        .bind(folder_id)
        .bind(relative_path)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(SyncStateRecord {
            folder_id: row.try_get("folder_id")?,
            relative_path: row.try_get("relative_path")?,
            content_hash: row.try_get("content_hash")?,
            modified: row.try_get("modified")?,
        }))
    }

    pub async fn upsert_sync_state(&self, state: &SyncStateRecord) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO sync_state (folder_id, relative_path, content_hash, modified)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(folder_id, relative_path) DO UPDATE SET
                content_hash = excluded.content_hash,
                modified = excluded.modified",
        )
        .bind(state.folder_id)
        .bind(&state.relative_path)
        .bind(&state.content_hash)
        .bind(state.modified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn folder_from_row(row: &SqliteRow) -> Result<SyncFolder, IndexError> {
    let enabled: i64 = row.try_get("enabled")?;
    Ok(SyncFolder {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        enabled: enabled != 0,
        created_at: row.try_get("created_at")?,
    })
}
