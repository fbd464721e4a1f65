use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{
    ChunkRecord, FILE_COLUMNS, FileRecord, IndexError, IndexStore, PendingChunk, PendingUpload,
    chunk_from_row, file_from_row, now_unix,
};

const PENDING_COLUMNS: &str = "id, filename, content_hash, original_size, stored_size, compressed, replace_existing, total_chunks, uploaded_chunks, spill_dir, created_at";

#[derive(Debug, Clone)]
pub struct NewPendingUpload {
    pub filename: String,
    pub content_hash: String,
    pub original_size: i64,
    pub stored_size: i64,
    pub compressed: bool,
    pub replace_existing: bool,
    pub spill_dir: String,
}

#[derive(Debug, Clone)]
pub struct NewPendingChunk {
    pub chunk_index: i64,
    pub spill_path: String,
    pub size: i64,
}

/// Outcome of committing a finished pending upload.
#[derive(Debug, Clone)]
pub struct Promotion {
    pub file: FileRecord,
    /// File row that previously held the name, with the chunks that now only
    /// exist remotely and should be deleted.
    pub replaced: Option<(FileRecord, Vec<ChunkRecord>)>,
}

impl IndexStore {
    /// Records a pending upload and its chunk ledger in one transaction.
    pub async fn create_pending(
        &self,
        upload: NewPendingUpload,
        chunks: &[NewPendingChunk],
    ) -> Result<PendingUpload, IndexError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO pending_uploads
                (filename, content_hash, original_size, stored_size, compressed,
                 replace_existing, total_chunks, uploaded_chunks, spill_dir, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
        )
        .bind(&upload.filename)
        .bind(&upload.content_hash)
        .bind(upload.original_size)
        .bind(upload.stored_size)
        .bind(upload.compressed as i64)
        .bind(upload.replace_existing as i64)
        .bind(chunks.len() as i64)
        .bind(&upload.spill_dir)
        .bind(now_unix())
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO pending_chunks (pending_id, chunk_index, spill_path, size, uploaded)
                 VALUES (?1, ?2, ?3, ?4, 0)",
            )
            .bind(id)
            .bind(chunk.chunk_index)
            .bind(&chunk.spill_path)
            .bind(chunk.size)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get_pending(id)
            .await?
            .ok_or(IndexError::MissingRow("pending upload"))
    }

    /// Pending uploads in creation order.
    pub async fn list_pending(&self) -> Result<Vec<PendingUpload>, IndexError> {
        let rows = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_uploads ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pending_from_row).collect()
    }

    pub async fn get_pending(&self, id: i64) -> Result<Option<PendingUpload>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_uploads WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pending_from_row).transpose()
    }

    pub async fn get_pending_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<PendingUpload>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_uploads WHERE content_hash = ?1"
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pending_from_row).transpose()
    }

    pub async fn list_pending_chunks(
        &self,
        pending_id: i64,
    ) -> Result<Vec<PendingChunk>, IndexError> {
        let rows = sqlx::query(
            "SELECT pending_id, chunk_index, spill_path, size, uploaded, message_id, blob_id
             FROM pending_chunks WHERE pending_id = ?1 ORDER BY chunk_index ASC",
        )
        .bind(pending_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let uploaded: i64 = row.try_get("uploaded")?;
            out.push(PendingChunk {
                pending_id: row.try_get("pending_id")?,
                chunk_index: row.try_get("chunk_index")?,
                spill_path: row.try_get("spill_path")?,
                size: row.try_get("size")?,
                uploaded: uploaded != 0,
                message_id: row.try_get("message_id")?,
                blob_id: row.try_get("blob_id")?,
            });
        }
        Ok(out)
    }

    /// Stores the transport ids of a sent chunk and refreshes the upload's
    /// progress counter. Returns the new uploaded count.
    pub async fn mark_chunk_uploaded(
        &self,
        pending_id: i64,
        chunk_index: i64,
        message_id: i64,
        blob_id: &str,
    ) -> Result<i64, IndexError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE pending_chunks SET uploaded = 1, message_id = ?1, blob_id = ?2
             WHERE pending_id = ?3 AND chunk_index = ?4",
        )
        .bind(message_id)
        .bind(blob_id)
        .bind(pending_id)
        .bind(chunk_index)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(IndexError::PendingNotFound(pending_id));
        }

        let uploaded: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_chunks WHERE pending_id = ?1 AND uploaded = 1",
        )
        .bind(pending_id)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("UPDATE pending_uploads SET uploaded_chunks = ?1 WHERE id = ?2")
            .bind(uploaded)
            .bind(pending_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(uploaded)
    }

    /// Drops the ledger rows; the spill directory is the caller's concern.
    pub async fn delete_pending(&self, id: i64) -> Result<bool, IndexError> {
        let result = sqlx::query("DELETE FROM pending_uploads WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Turns a fully uploaded pending entry into File and Chunk rows. Either
    /// every row is written and the ledger entry removed, or nothing changes.
    pub async fn promote_pending(&self, id: i64) -> Result<Promotion, IndexError> {
        let pending = self
            .get_pending(id)
            .await?
            .ok_or(IndexError::PendingNotFound(id))?;
        let chunks = self.list_pending_chunks(id).await?;

        let uploaded = chunks.iter().filter(|c| c.uploaded).count() as i64;
        if uploaded < pending.total_chunks {
            return Err(IndexError::IncompleteUpload {
                id,
                uploaded,
                total: pending.total_chunks,
            });
        }
        let contiguous = chunks.len() as i64 == pending.total_chunks
            && chunks
                .iter()
                .enumerate()
                .all(|(pos, c)| c.chunk_index == pos as i64);
        if !contiguous {
            return Err(IndexError::ChunkSequence {
                expected: pending.total_chunks,
            });
        }

        let mut tx = self.pool.begin().await?;

        let duplicate: Option<i64> =
            sqlx::query_scalar("SELECT id FROM files WHERE content_hash = ?1")
                .bind(&pending.content_hash)
                .fetch_optional(&mut *tx)
                .await?;
        if duplicate.is_some() {
            return Err(IndexError::DuplicateHash(pending.content_hash));
        }

        let mut replaced = None;
        let holder = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files WHERE filename = ?1"))
            .bind(&pending.filename)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = holder {
            if !pending.replace_existing {
                return Err(IndexError::NameTaken(pending.filename));
            }
            let old = file_from_row(&row)?;
            let old_chunks = sqlx::query(
                "SELECT file_id, chunk_index, message_id, blob_id, size
                 FROM chunks WHERE file_id = ?1 ORDER BY chunk_index ASC",
            )
            .bind(old.id)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(chunk_from_row)
            .collect::<Result<Vec<_>, _>>()?;
            sqlx::query("DELETE FROM files WHERE id = ?1")
                .bind(old.id)
                .execute(&mut *tx)
                .await?;
            replaced = Some((old, old_chunks));
        }

        let now = now_unix();
        let result = sqlx::query(
            "INSERT INTO files
                (filename, content_hash, original_size, stored_size, chunk_count,
                 compressed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        )
        .bind(&pending.filename)
        .bind(&pending.content_hash)
        .bind(pending.original_size)
        .bind(pending.stored_size)
        .bind(pending.total_chunks)
        .bind(pending.compressed as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let file_id = result.last_insert_rowid();

        for chunk in &chunks {
            let (Some(message_id), Some(blob_id)) = (chunk.message_id, chunk.blob_id.as_deref())
            else {
                return Err(IndexError::IncompleteUpload {
                    id,
                    uploaded,
                    total: pending.total_chunks,
                });
            };
            sqlx::query(
                "INSERT INTO chunks (file_id, chunk_index, message_id, blob_id, size)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(file_id)
            .bind(chunk.chunk_index)
            .bind(message_id)
            .bind(blob_id)
            .bind(chunk.size)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM pending_uploads WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"))
            .bind(file_id)
            .fetch_one(&mut *tx)
            .await?;
        let file = file_from_row(&row)?;
        tx.commit().await?;

        Ok(Promotion { file, replaced })
    }
}

fn pending_from_row(row: &SqliteRow) -> Result<PendingUpload, IndexError> {
    let compressed: i64 = row.try_get("compressed")?;
    let replace_existing: i64 = row.try_get("replace_existing")?;
    Ok(PendingUpload {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        content_hash: row.try_get("content_hash")?,
        original_size: row.try_get("original_size")?,
        stored_size: row.try_get("stored_size")?,
        compressed: compressed != 0,
        replace_existing: replace_existing != 0,
        total_chunks: row.try_get("total_chunks")?,
        uploaded_chunks: row.try_get("uploaded_chunks")?,
        spill_dir: row.try_get("spill_dir")?,
        created_at: row.try_get("created_at")?,
    })
}
