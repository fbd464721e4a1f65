use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::index::{FileRecord, IndexStore, PendingUpload};
use crate::pipeline::{Direction, PipelineError, TransferProgress, delete_remote_chunks};
use crate::transport::BlobTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Every chunk is up and the file is committed.
    Completed(FileRecord),
    /// Some chunks could not be sent; the entry stays pending. Chunks listed
    /// in `missing_spill` lost their local copy and can never be resent, so
    /// the entry has to be cleared and the file uploaded again.
    Incomplete {
        id: i64,
        uploaded: i64,
        total: i64,
        missing_spill: Vec<i64>,
    },
    /// The content was committed by another upload meanwhile; the entry was
    /// cleared.
    AlreadyStored(FileRecord),
}

/// Drives pending uploads to completion from their spilled chunk files.
#[derive(Clone)]
pub struct ResumeManager {
    index: IndexStore,
    transport: Arc<dyn BlobTransport>,
    progress: Option<UnboundedSender<TransferProgress>>,
}

impl ResumeManager {
    pub fn new(index: IndexStore, transport: Arc<dyn BlobTransport>) -> Self {
        Self {
            index,
            transport,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: UnboundedSender<TransferProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Local ledger only; never touches the network.
    pub async fn list_pending(&self) -> Result<Vec<PendingUpload>, PipelineError> {
        Ok(self.index.list_pending().await?)
    }

    /// Sends whatever chunks of `id` are still outstanding, then commits the
    /// file once all of them are up.
    pub async fn resume(&self, id: i64) -> Result<ResumeOutcome, PipelineError> {
        let pending = self
            .index
            .get_pending(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("pending upload {id}")))?;

        if let Some(existing) = self.index.get_file_by_hash(&pending.content_hash).await? {
            info!(id, name = %existing.filename, "content already stored, clearing pending upload");
            self.clear(id).await?;
            return Ok(ResumeOutcome::AlreadyStored(existing));
        }

        let chunks = self.index.list_pending_chunks(id).await?;
        let bytes_total: u64 = chunks.iter().map(|c| c.size.max(0) as u64).sum();
        let mut bytes_done: u64 = chunks
            .iter()
            .filter(|c| c.uploaded)
            .map(|c| c.size.max(0) as u64)
            .sum();
        let total = pending.total_chunks;
        let mut missing_spill = Vec::new();

        for chunk in chunks.iter().filter(|c| !c.uploaded) {
            let spill = Path::new(&chunk.spill_path);
            if !tokio::fs::try_exists(spill).await? {
                warn!(id, chunk = chunk.chunk_index, path = %spill.display(), "spill file missing, skipping chunk");
                missing_spill.push(chunk.chunk_index);
                continue;
            }
            let caption = format!("{} [{}/{}]", pending.filename, chunk.chunk_index + 1, total);
            let sent = self.transport.send(spill, &caption).await?;
            let uploaded = self
                .index
                .mark_chunk_uploaded(id, chunk.chunk_index, sent.message_id, &sent.blob_id)
                .await?;
            bytes_done += chunk.size.max(0) as u64;
            self.report(TransferProgress {
                name: pending.filename.clone(),
                direction: Direction::Upload,
                chunk: uploaded as u32,
                total_chunks: total as u32,
                bytes_done,
                bytes_total,
            });
        }

        let refreshed = self
            .index
            .get_pending(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("pending upload {id}")))?;
        if !refreshed.is_complete() {
            if !missing_spill.is_empty() {
                warn!(id, missing = missing_spill.len(), "upload cannot finish without its spill files; clear it and upload again");
            }
            return Ok(ResumeOutcome::Incomplete {
                id,
                uploaded: refreshed.uploaded_chunks,
                total: refreshed.total_chunks,
                missing_spill,
            });
        }

        let promotion = self.index.promote_pending(id).await?;
        if let Some((old, old_chunks)) = promotion.replaced {
            let report = delete_remote_chunks(self.transport.as_ref(), &old_chunks).await;
            info!(name = %old.filename, deleted = report.deleted, failed = report.failed, "replaced previous version");
        }
        remove_spill_dir(Path::new(&pending.spill_dir)).await;
        info!(id, name = %promotion.file.filename, chunks = promotion.file.chunk_count, "upload committed");
        Ok(ResumeOutcome::Completed(promotion.file))
    }

    /// Resumes every pending entry, oldest first.
    pub async fn resume_all(
        &self,
    ) -> Result<Vec<(PendingUpload, Result<ResumeOutcome, PipelineError>)>, PipelineError> {
        let pending = self.index.list_pending().await?;
        let mut out = Vec::with_capacity(pending.len());
        for entry in pending {
            let outcome = self.resume(entry.id).await;
            if let Err(err) = &outcome {
                warn!(id = entry.id, name = %entry.filename, error = %err, "resume failed");
            }
            out.push((entry, outcome));
        }
        Ok(out)
    }

    /// Drops the ledger entry and its spill files. Remote chunks already sent
    /// are left in place.
    pub async fn clear(&self, id: i64) -> Result<bool, PipelineError> {
        let Some(pending) = self.index.get_pending(id).await? else {
            return Ok(false);
        };
        for chunk in self.index.list_pending_chunks(id).await? {
            if let Err(err) = tokio::fs::remove_file(&chunk.spill_path).await
                && err.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %chunk.spill_path, error = %err, "failed to remove spill file");
            }
        }
        remove_spill_dir(Path::new(&pending.spill_dir)).await;
        Ok(self.index.delete_pending(id).await?)
    }

    fn report(&self, progress: TransferProgress) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(progress);
        }
    }
}

async fn remove_spill_dir(dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %dir.display(), error = %err, "failed to remove spill directory");
    }
}
