use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::index::{ChunkRecord, FileRecord, IndexError, IndexStore, NewPendingChunk, NewPendingUpload};
use crate::resume::{ResumeManager, ResumeOutcome};
use crate::storage::frame::{self, FrameError, FrameHeader};
use crate::storage::{Cipher, CipherError, HEADER_LEN, compress, decompress};
use crate::transport::{BlobTransport, TransportError};

const READ_BUF: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("content already stored as {existing} ({hash})")]
    Duplicate { hash: String, existing: String },
    #[error("no stored file matches {0}")]
    NotFound(String),
    #[error("frame error: {0}")]
    Format(#[from] FrameError),
    #[error("chunk continuity broken: expected {expected}, found {found}")]
    Continuity { expected: String, found: String },
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("index error: {0}")]
    Persistence(IndexError),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("upload {id} stopped at {uploaded}/{total} chunks{}", lost_hint(.missing_spill, .id))]
    Incomplete {
        id: i64,
        uploaded: i64,
        total: i64,
        missing_spill: usize,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, PipelineError::Duplicate { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PipelineError::NotFound(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, PipelineError::Cipher(CipherError::Authentication))
    }
}

impl From<IndexError> for PipelineError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::DuplicateHash(hash) => PipelineError::Duplicate {
                existing: String::new(),
                hash,
            },
            IndexError::NameTaken(name) => {
                PipelineError::Validation(format!("name already in use: {name}"))
            }
            other => PipelineError::Persistence(other),
        }
    }
}

/// What to do when the target name already belongs to a different file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamePolicy {
    #[default]
    Reject,
    /// Swap the old file out when the new one is committed.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub name: String,
    pub direction: Direction,
    pub chunk: u32,
    pub total_chunks: u32,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Outcome of a best-effort remote delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: usize,
    pub missing: usize,
    pub failed: usize,
}

/// Upload and download orchestration: hash, dedup, compress, encrypt, chunk,
/// transmit, index, and the reverse.
#[derive(Clone)]
pub struct Pipeline {
    index: IndexStore,
    transport: Arc<dyn BlobTransport>,
    cipher: Cipher,
    spill_root: PathBuf,
    resume: ResumeManager,
    progress: Option<UnboundedSender<TransferProgress>>,
}

impl Pipeline {
    pub fn new(
        index: IndexStore,
        transport: Arc<dyn BlobTransport>,
        cipher: Cipher,
        spill_root: impl Into<PathBuf>,
    ) -> Self {
        let resume = ResumeManager::new(index.clone(), transport.clone());
        Self {
            index,
            transport,
            cipher,
            spill_root: spill_root.into(),
            resume,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: UnboundedSender<TransferProgress>) -> Self {
        self.resume = self.resume.with_progress(progress.clone());
        self.progress = Some(progress);
        self
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn resume_manager(&self) -> &ResumeManager {
        &self.resume
    }

    /// Bytes of ciphertext carried per chunk, after the frame header.
    pub fn segment_size(&self) -> usize {
        self.transport.max_blob_size().saturating_sub(HEADER_LEN)
    }

    /// Uploads a local file under `name` (its file name when `None`).
    pub async fn upload_path(
        &self,
        path: &Path,
        name: Option<&str>,
        policy: NamePolicy,
    ) -> Result<FileRecord, PipelineError> {
        let name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    PipelineError::Validation(format!("{} has no file name", path.display()))
                })?,
        };
        let (data, hash) = read_and_hash(path).await?;
        self.upload_hashed(&name, data, hash, policy).await
    }

    pub async fn upload_bytes(
        &self,
        name: &str,
        data: Vec<u8>,
        policy: NamePolicy,
    ) -> Result<FileRecord, PipelineError> {
        let hash = content_hash(&data);
        self.upload_hashed(name, data, hash, policy).await
    }

    /// Upload of content whose SHA-256 hex digest the caller already has.
    pub async fn upload_hashed(
        &self,
        name: &str,
        data: Vec<u8>,
        hash: String,
        policy: NamePolicy,
    ) -> Result<FileRecord, PipelineError> {
        validate_name(name)?;
        if let Some(existing) = self.index.get_file_by_hash(&hash).await? {
            return Err(PipelineError::Duplicate {
                hash,
                existing: existing.filename,
            });
        }
        if policy == NamePolicy::Reject && self.index.get_file_by_name(name).await?.is_some() {
            return Err(PipelineError::Validation(format!(
                "name already in use: {name}"
            )));
        }

        if let Some(pending) = self.index.get_pending_by_hash(&hash).await? {
            // spilled frames carry the planned name and compression, so only
            // an identical request may continue them
            let replace = policy == NamePolicy::Replace;
            if pending.filename == name && pending.replace_existing == replace {
                info!(id = pending.id, name, "continuing interrupted upload");
                return self.finish(self.resume.resume(pending.id).await?, &hash);
            }
            info!(
                id = pending.id,
                pending = %pending.filename,
                name,
                "interrupted upload was planned differently, starting over"
            );
            self.resume.clear(pending.id).await?;
        }

        let original_size = data.len() as u64;
        let segment = self.segment_size();
        if segment == 0 {
            return Err(PipelineError::Validation(format!(
                "blob ceiling {} leaves no room after the {HEADER_LEN} byte header",
                self.transport.max_blob_size()
            )));
        }

        let cipher = self.cipher.clone();
        let owned_name = name.to_string();
        let (sealed, compressed) = tokio::task::spawn_blocking(move || {
            let packed = compress(data, &owned_name)?;
            let sealed = cipher.encrypt(&packed.data)?;
            Ok::<_, PipelineError>((sealed, packed.compressed))
        })
        .await
        .map_err(io::Error::other)??;

        let total = sealed.len().div_ceil(segment).max(1);
        let total = u16::try_from(total).map_err(|_| {
            PipelineError::Validation(format!(
                "{name} needs {total} chunks, more than {}",
                u16::MAX
            ))
        })?;

        let spill_dir = self.spill_root.join(&hash);
        if tokio::fs::try_exists(&spill_dir).await? {
            tokio::fs::remove_dir_all(&spill_dir).await?;
        }
        tokio::fs::create_dir_all(&spill_dir).await?;

        let mut plan = Vec::with_capacity(total as usize);
        for (idx, segment) in sealed.chunks(segment).enumerate() {
            let header = FrameHeader::new(name, original_size, compressed, idx as u16, total);
            let framed = frame::frame(&header, segment);
            let spill_path = spill_dir.join(format!("{idx:05}.chunk"));
            tokio::fs::write(&spill_path, &framed).await?;
            plan.push(NewPendingChunk {
                chunk_index: idx as i64,
                spill_path: spill_path.to_string_lossy().into_owned(),
                size: framed.len() as i64,
            });
        }
        let pending = self
            .index
            .create_pending(
                NewPendingUpload {
                    filename: name.to_string(),
                    content_hash: hash.clone(),
                    original_size: original_size as i64,
                    stored_size: sealed.len() as i64,
                    compressed,
                    replace_existing: policy == NamePolicy::Replace,
                    spill_dir: spill_dir.to_string_lossy().into_owned(),
                },
                &plan,
            )
            .await?;
        debug!(id = pending.id, name, chunks = total, compressed, "upload planned");

        self.finish(self.resume.resume(pending.id).await?, &hash)
    }

    fn finish(&self, outcome: ResumeOutcome, hash: &str) -> Result<FileRecord, PipelineError> {
        match outcome {
            ResumeOutcome::Completed(file) => Ok(file),
            ResumeOutcome::AlreadyStored(existing) => Err(PipelineError::Duplicate {
                hash: hash.to_string(),
                existing: existing.filename,
            }),
            ResumeOutcome::Incomplete {
                id,
                uploaded,
                total,
                missing_spill,
            } => Err(PipelineError::Incomplete {
                id,
                uploaded,
                total,
                missing_spill: missing_spill.len(),
            }),
        }
    }

    /// Resolves `key` by content hash first, then by exact name.
    pub async fn resolve(&self, key: &str) -> Result<FileRecord, PipelineError> {
        self.index
            .find_file(key)
            .await?
            .ok_or_else(|| PipelineError::NotFound(key.to_string()))
    }

    /// Fetches, verifies and decodes a stored file in memory.
    pub async fn download_bytes(&self, file: &FileRecord) -> Result<Vec<u8>, PipelineError> {
        let chunks = self.index.list_chunks(file.id).await?;
        if chunks.len() as i64 != file.chunk_count {
            return Err(PipelineError::Continuity {
                expected: format!("{} chunks", file.chunk_count),
                found: format!("{} chunks", chunks.len()),
            });
        }

        let mut sealed = Vec::with_capacity(file.stored_size.max(0) as usize);
        let mut compressed = false;
        let total = chunks.len() as u32;
        for (position, chunk) in chunks.iter().enumerate() {
            let blob = self.transport.fetch(&chunk.blob_id).await?;
            let (header, payload) = frame::unframe(&blob)?;
            if i64::from(header.chunk_index) != position as i64
                || i64::from(header.chunk_total) != file.chunk_count
            {
                return Err(PipelineError::Continuity {
                    expected: format!("{position}/{}", file.chunk_count),
                    found: format!("{}/{}", header.chunk_index, header.chunk_total),
                });
            }
            if position == 0 {
                compressed = header.compressed;
            }
            sealed.extend_from_slice(payload);
            self.report(TransferProgress {
                name: file.filename.clone(),
                direction: Direction::Download,
                chunk: position as u32 + 1,
                total_chunks: total,
                bytes_done: sealed.len() as u64,
                bytes_total: file.stored_size.max(0) as u64,
            });
        }

        let cipher = self.cipher.clone();
        let expected = file.content_hash.clone();
        tokio::task::spawn_blocking(move || {
            let packed = cipher.decrypt(&sealed)?;
            let plain = decompress(packed, compressed)?;
            let actual = content_hash(&plain);
            if actual != expected {
                return Err(PipelineError::Integrity { expected, actual });
            }
            Ok(plain)
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Writes the decoded file to `dest` through a `.partial` sibling, so the
    /// destination only ever holds complete content.
    pub async fn download_to_path(
        &self,
        file: &FileRecord,
        dest: &Path,
    ) -> Result<u64, PipelineError> {
        let data = self.download_bytes(file).await?;
        let partial = partial_path(dest);
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(err) = tokio::fs::write(&partial, &data).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err.into());
        }
        tokio::fs::rename(&partial, dest).await?;
        info!(name = %file.filename, dest = %dest.display(), bytes = data.len(), "download complete");
        Ok(data.len() as u64)
    }

    /// Removes remote chunks best-effort, then the index row with its chunks
    /// and tags.
    pub async fn delete_file(&self, file: &FileRecord) -> Result<DeleteReport, PipelineError> {
        let chunks = self.index.list_chunks(file.id).await?;
        let report = delete_remote_chunks(self.transport.as_ref(), &chunks).await;
        self.index.delete_file(file.id).await?;
        info!(
            name = %file.filename,
            deleted = report.deleted,
            missing = report.missing,
            failed = report.failed,
            "file deleted"
        );
        Ok(report)
    }

    /// Index-only rename; chunk payloads stay where they are.
    pub async fn rename_file(&self, file: &FileRecord, new_name: &str) -> Result<(), PipelineError> {
        validate_name(new_name)?;
        self.index.rename_file(file.id, new_name).await?;
        Ok(())
    }

    /// Downloads and decodes without writing anything.
    pub async fn verify_file(&self, file: &FileRecord) -> Result<(), PipelineError> {
        self.download_bytes(file).await.map(|_| ())
    }

    pub async fn verify_all(&self) -> Result<Vec<(FileRecord, Result<(), PipelineError>)>, PipelineError> {
        let files = self.index.list_files().await?;
        let mut out = Vec::with_capacity(files.len());
        for file in files {
            let result = self.verify_file(&file).await;
            if let Err(err) = &result {
                warn!(name = %file.filename, error = %err, "verification failed");
            }
            out.push((file, result));
        }
        Ok(out)
    }

    fn report(&self, progress: TransferProgress) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(progress);
        }
    }
}

pub(crate) async fn delete_remote_chunks(
    transport: &dyn BlobTransport,
    chunks: &[ChunkRecord],
) -> DeleteReport {
    let mut report = DeleteReport::default();
    for chunk in chunks {
        match transport.delete(chunk.message_id).await {
            Ok(true) => report.deleted += 1,
            Ok(false) => report.missing += 1,
            Err(err) => {
                warn!(message_id = chunk.message_id, error = %err, "remote delete failed");
                report.failed += 1;
            }
        }
    }
    report
}

/// Lowercase hex SHA-256.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Reads the whole file, hashing as it streams in.
pub async fn read_and_hash(path: &Path) -> Result<(Vec<u8>, String), io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let capacity = file.metadata().await.map(|m| m.len() as usize).unwrap_or(0);
    let mut data = Vec::with_capacity(capacity);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        data.extend_from_slice(&buf[..read]);
    }
    Ok((data, hex::encode(hasher.finalize())))
}

fn lost_hint(missing_spill: &usize, id: &i64) -> String {
    if *missing_spill == 0 {
        return String::new();
    }
    format!(", {missing_spill} spill file(s) are gone; clear pending upload {id} and upload again")
}

fn validate_name(name: &str) -> Result<(), PipelineError> {
    if name.trim().is_empty() {
        return Err(PipelineError::Validation("file name is empty".into()));
    }
    if name.contains('\0') {
        return Err(PipelineError::Validation(format!(
            "file name contains NUL: {name:?}"
        )));
    }
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_is_a_sibling() {
        assert_eq!(
            partial_path(Path::new("/tmp/out/report.pdf")),
            PathBuf::from("/tmp/out/report.pdf.partial")
        );
    }

    #[test]
    fn content_hash_is_lowercase_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn empty_and_nul_names_are_rejected() {
        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name("a\0b").is_err());
        assert!(validate_name("docs/a.txt").is_ok());
    }

    #[test]
    fn name_collisions_map_to_validation() {
        let err: PipelineError = IndexError::NameTaken("a".into()).into();
        assert!(matches!(err, PipelineError::Validation(_)));
        let err: PipelineError = IndexError::DuplicateHash("h".into()).into();
        assert!(err.is_duplicate());
    }
}
