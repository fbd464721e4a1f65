use sqlx::Row;

use super::{
    ChunkRecord, FILE_COLUMNS, FileRecord, IndexError, IndexStore, chunk_from_row, file_from_row,
    now_unix,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub files: i64,
    pub chunks: i64,
    pub original_bytes: i64,
    pub stored_bytes: i64,
    pub pending_uploads: i64,
    pub sync_folders: i64,
    pub tags: i64,
}

impl IndexStore {
    pub async fn get_file_by_hash(&self, hash: &str) -> Result<Option<FileRecord>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE content_hash = ?1"
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    pub async fn get_file_by_name(&self, name: &str) -> Result<Option<FileRecord>, IndexError> {
        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files WHERE filename = ?1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    /// Resolves a user-supplied key: content hash first, then exact file name.
    pub async fn find_file(&self, key: &str) -> Result<Option<FileRecord>, IndexError> {
        if let Some(file) = self.get_file_by_hash(key).await? {
            return Ok(Some(file));
        }
        self.get_file_by_name(key).await
    }

    pub async fn list_files(&self) -> Result<Vec<FileRecord>, IndexError> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files ORDER BY filename ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Substring match on file names plus exact match on normalized tags.
    pub async fn search_files(&self, query: &str) -> Result<Vec<FileRecord>, IndexError> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        let tag = super::normalize_tag(query);
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE filename LIKE ?1 ESCAPE '\\'
                OR id IN (SELECT file_id FROM tags WHERE tag = ?2)
             ORDER BY filename ASC"
        ))
        .bind(pattern)
        .bind(tag)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    pub async fn list_chunks(&self, file_id: i64) -> Result<Vec<ChunkRecord>, IndexError> {
        let rows = sqlx::query(
            "SELECT file_id, chunk_index, message_id, blob_id, size
             FROM chunks WHERE file_id = ?1 ORDER BY chunk_index ASC",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    /// Renames a file in the index only; remote blobs are untouched.
    pub async fn rename_file(&self, file_id: i64, new_name: &str) -> Result<(), IndexError> {
        if let Some(existing) = self.get_file_by_name(new_name).await?
            && existing.id != file_id
        {
            return Err(IndexError::NameTaken(new_name.to_string()));
        }
        sqlx::query("UPDATE files SET filename = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(new_name)
            .bind(now_unix())
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes the file row; chunks and tags cascade.
    pub async fn delete_file(&self, file_id: i64) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM files WHERE id = ?1")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<IndexStats, IndexError> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM files) AS files,
                (SELECT COUNT(*) FROM chunks) AS chunks,
                (SELECT COALESCE(SUM(original_size), 0) FROM files) AS original_bytes,
                (SELECT COALESCE(SUM(stored_size), 0) FROM files) AS stored_bytes,
                (SELECT COUNT(*) FROM pending_uploads) AS pending_uploads,
                (SELECT COUNT(*) FROM sync_folders) AS sync_folders,
                (SELECT COUNT(DISTINCT tag) FROM tags) AS tags",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(IndexStats {
            files: row.try_get("files")?,
            chunks: row.try_get("chunks")?,
            original_bytes: row.try_get("original_bytes")?,
            stored_bytes: row.try_get("stored_bytes")?,
            pending_uploads: row.try_get("pending_uploads")?,
            sync_folders: row.try_get("sync_folders")?,
            tags: row.try_get("tags")?,
        })
    }
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
