use super::{FILE_COLUMNS, FileRecord, IndexError, IndexStore, file_from_row};

/// Lowercased and trimmed; `None` for blank input.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let tag = raw.trim().to_lowercase();
    if tag.is_empty() { None } else { Some(tag) }
}

impl IndexStore {
    /// Adds tags to a file, ignoring ones it already carries. Returns how many
    /// were new.
    pub async fn add_tags<S: AsRef<str>>(
        &self,
        file_id: i64,
        tags: &[S],
    ) -> Result<u64, IndexError> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0;
        for tag in tags.iter().filter_map(|t| normalize_tag(t.as_ref())) {
            let result = sqlx::query("INSERT OR IGNORE INTO tags (file_id, tag) VALUES (?1, ?2)")
                .bind(file_id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
            added += result.rows_affected();
        }
        tx.commit().await?;
        Ok(added)
    }

    pub async fn remove_tags<S: AsRef<str>>(
        &self,
        file_id: i64,
        tags: &[S],
    ) -> Result<u64, IndexError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for tag in tags.iter().filter_map(|t| normalize_tag(t.as_ref())) {
            let result = sqlx::query("DELETE FROM tags WHERE file_id = ?1 AND tag = ?2")
                .bind(file_id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn list_tags(&self, file_id: i64) -> Result<Vec<String>, IndexError> {
        let tags: Vec<String> = sqlx::query_scalar("SELECT tag FROM tags WHERE file_id = ?1 ORDER BY tag ASC")
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(tags)
    }

    pub async fn files_with_tag(&self, tag: &str) -> Result<Vec<FileRecord>, IndexError> {
        let Some(tag) = normalize_tag(tag) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE id IN (SELECT file_id FROM tags WHERE tag = ?1)
             ORDER BY filename ASC"
        ))
        .bind(tag)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }
}
