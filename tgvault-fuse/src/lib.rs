//! Flat filesystem view over a vault: one directory whose entries are the
//! stored files. Reads go through a bounded cache, writes collect in memory
//! and are uploaded on flush.

mod buffers;
mod cache;
#[cfg(feature = "fuse-mount")]
pub mod mount;

use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tgvault_engine::pipeline::{NamePolicy, Pipeline, PipelineError, content_hash};
use tgvault_engine::{FileRecord, IndexError};
use tracing::{debug, info, warn};

pub use buffers::{BufferError, MAX_BUFFER_LEN, WriteBuffer, WriteBuffers};
pub use cache::{DEFAULT_TTL, ReadCache};

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("operation not valid on the root directory")]
    IsRoot,
    #[error("storage error: {0}")]
    Storage(#[from] PipelineError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("file too large: {0}")]
    TooLarge(String),
    #[error("out of memory buffering {0}")]
    OutOfMemory(String),
    #[error("internal state lock poisoned")]
    Poisoned,
}

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Storage(err) if err.is_not_found() => libc::ENOENT,
            FsError::InvalidName(_) => libc::EINVAL,
            FsError::IsRoot => libc::EISDIR,
            FsError::TooLarge(_) => libc::EFBIG,
            FsError::OutOfMemory(_) => libc::ENOMEM,
            _ => libc::EIO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: SystemTime,
}

pub struct VaultFs {
    pipeline: Pipeline,
    cache: Mutex<ReadCache>,
    buffers: Mutex<WriteBuffers>,
}

impl VaultFs {
    pub fn new(pipeline: Pipeline, cache_ttl: Duration, cache_max_bytes: u64) -> Self {
        Self {
            pipeline,
            cache: Mutex::new(ReadCache::new(cache_ttl, cache_max_bytes)),
            buffers: Mutex::new(WriteBuffers::new()),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub async fn getattr(&self, path: &str) -> Result<Attr, FsError> {
        let Some(name) = entry_name(path)? else {
            return Ok(Attr {
                kind: EntryKind::Directory,
                size: 0,
                modified: SystemTime::now(),
            });
        };
        if let Some(len) = self.buffers()?.len_of(name) {
            return Ok(Attr {
                kind: EntryKind::File,
                size: len as u64,
                modified: SystemTime::now(),
            });
        }
        let file = self.tracked(name).await?;
        Ok(Attr {
            kind: EntryKind::File,
            size: file.original_size.max(0) as u64,
            modified: unix_to_system_time(file.updated_at),
        })
    }

    /// Names in the root directory, sorted. Stored names containing a path
    /// separator cannot be represented as entries and are left out.
    pub async fn readdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        if let Some(name) = entry_name(path)? {
            return Err(FsError::NotFound(name.to_string()));
        }
        let files = self.pipeline.index().list_files().await?;
        let mut names: Vec<String> = files
            .into_iter()
            .map(|file| file.filename)
            .filter(|name| {
                let listable = !name.contains('/');
                if !listable {
                    debug!(name, "skipping nested name in directory listing");
                }
                listable
            })
            .collect();
        names.extend(self.buffers()?.names().map(str::to_string));
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub async fn open(&self, path: &str) -> Result<(), FsError> {
        let name = file_name(path)?;
        if self.buffers()?.contains(name) {
            return Ok(());
        }
        self.tracked(name).await.map(|_| ())
    }

    pub async fn read(&self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>, FsError> {
        let name = file_name(path)?;
        if let Some(bytes) = self.buffers()?.read(name, offset, size) {
            return Ok(bytes);
        }
        let content = self.load(name).await?;
        Ok(buffers::slice_at(&content, offset, size).to_vec())
    }

    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let name = file_name(path)?;
        self.ensure_buffer(name).await?;
        self.cache()?.invalidate(name);
        self.buffers()?
            .write(name, offset, data)
            .map_err(|err| buffer_error(name, err))
    }

    pub async fn create(&self, path: &str) -> Result<(), FsError> {
        let name = file_name(path)?;
        self.buffers()?.create(name);
        self.cache()?.invalidate(name);
        debug!(name, "write buffer created");
        Ok(())
    }

    pub async fn truncate(&self, path: &str, size: u64) -> Result<(), FsError> {
        let name = file_name(path)?;
        if size == 0 && !self.buffers()?.contains(name) {
            // nothing to keep, skip downloading the old content
            self.tracked(name).await?;
            self.buffers()?.promote(name, Vec::new());
        } else {
            self.ensure_buffer(name).await?;
        }
        self.cache()?.invalidate(name);
        self.buffers()?
            .truncate(name, size)
            .map_err(|err| buffer_error(name, err))
    }

    /// Uploads the buffered content if it changed since the last flush.
    pub async fn flush(&self, path: &str) -> Result<(), FsError> {
        let name = file_name(path)?;
        let Some((data, version)) = self.buffers()?.dirty_snapshot(name) else {
            return Ok(());
        };
        let hash = content_hash(&data);

        if let Some(existing) = self.pipeline.index().get_file_by_name(name).await? {
            if existing.content_hash == hash {
                self.buffers()?.mark_clean(name, version);
                return Ok(());
            }
            self.pipeline.delete_file(&existing).await?;
        }

        match self
            .pipeline
            .upload_bytes(name, data, NamePolicy::Reject)
            .await
        {
            Ok(file) => info!(name, chunks = file.chunk_count, "flushed"),
            Err(err) if err.is_duplicate() => {
                debug!(name, error = %err, "content already stored under another name");
            }
            Err(err) => {
                warn!(name, error = %err, "flush failed");
                return Err(err.into());
            }
        }
        self.buffers()?.mark_clean(name, version);
        self.cache()?.invalidate(name);
        Ok(())
    }

    /// Flushes, then forgets the buffer.
    pub async fn release(&self, path: &str) -> Result<(), FsError> {
        let name = file_name(path)?;
        let flushed = self.flush(path).await;
        let mut buffers = self.buffers()?;
        if !buffers.is_dirty(name) {
            buffers.remove(name);
        }
        flushed
    }

    pub async fn unlink(&self, path: &str) -> Result<(), FsError> {
        let name = file_name(path)?;
        let buffered = self.buffers()?.remove(name).is_some();
        self.cache()?.invalidate(name);
        match self.pipeline.index().get_file_by_name(name).await? {
            Some(file) => {
                let report = self.pipeline.delete_file(&file).await?;
                if report.failed > 0 {
                    warn!(name, failed = report.failed, "some remote chunks could not be deleted");
                }
                Ok(())
            }
            None if buffered => Ok(()),
            None => Err(FsError::NotFound(name.to_string())),
        }
    }

    /// Index-only rename; a buffer moves with its name and an existing
    /// target is replaced.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let from = file_name(from)?;
        let to = file_name(to)?;
        if from == to {
            return Ok(());
        }
        let index = self.pipeline.index();
        let source = index.get_file_by_name(from).await?;
        let buffered = self.buffers()?.contains(from);
        if source.is_none() && !buffered {
            return Err(FsError::NotFound(from.to_string()));
        }

        if let Some(target) = index.get_file_by_name(to).await? {
            self.pipeline.delete_file(&target).await?;
        }
        if let Some(source) = source {
            self.pipeline.rename_file(&source, to).await?;
        }
        {
            let mut buffers = self.buffers()?;
            buffers.remove(to);
            buffers.rename(from, to);
        }
        let mut cache = self.cache()?;
        cache.invalidate(from);
        cache.invalidate(to);
        info!(from, to, "renamed");
        Ok(())
    }

    async fn tracked(&self, name: &str) -> Result<FileRecord, FsError> {
        self.pipeline
            .index()
            .get_file_by_name(name)
            .await?
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    /// Full content of a stored file, downloading on a cache miss.
    async fn load(&self, name: &str) -> Result<Arc<Vec<u8>>, FsError> {
        if let Some(hit) = self.cache()?.get(name) {
            return Ok(hit);
        }
        let file = self.tracked(name).await?;
        let content = Arc::new(self.pipeline.download_bytes(&file).await?);
        self.cache()?.insert(name, Arc::clone(&content));
        debug!(name, bytes = content.len(), "cached");
        Ok(content)
    }

    async fn ensure_buffer(&self, name: &str) -> Result<(), FsError> {
        if self.buffers()?.contains(name) {
            return Ok(());
        }
        let content = self.load(name).await?;
        self.buffers()?.promote(name, content.as_ref().clone());
        Ok(())
    }

    fn buffers(&self) -> Result<MutexGuard<'_, WriteBuffers>, FsError> {
        self.buffers.lock().map_err(|_| FsError::Poisoned)
    }

    fn cache(&self) -> Result<MutexGuard<'_, ReadCache>, FsError> {
        self.cache.lock().map_err(|_| FsError::Poisoned)
    }
}

fn buffer_error(name: &str, err: BufferError) -> FsError {
    let name = name.to_string();
    match err {
        BufferError::Missing => FsError::NotFound(name),
        BufferError::TooLarge => FsError::TooLarge(name),
        BufferError::OutOfMemory => FsError::OutOfMemory(name),
    }
}

/// `None` for the root, the bare entry name otherwise.
fn entry_name(path: &str) -> Result<Option<&str>, FsError> {
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() {
        return Ok(None);
    }
    if name.contains('/') || name.contains('\0') || name == "." || name == ".." {
        return Err(FsError::InvalidName(name.to_string()));
    }
    Ok(Some(name))
}

fn file_name(path: &str) -> Result<&str, FsError> {
    entry_name(path)?.ok_or(FsError::IsRoot)
}

fn unix_to_system_time(ts: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64)
}

/// Detaches a mount, trying `fusermount -u` before plain `umount`.
pub fn unmount(mountpoint: &Path) -> io::Result<()> {
    let fusermount = Command::new("fusermount").arg("-u").arg(mountpoint).status();
    if let Ok(status) = fusermount
        && status.success()
    {
        return Ok(());
    }
    let status = Command::new("umount").arg(mountpoint).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "failed to unmount {}: {status}",
            mountpoint.display()
        )))
    }
}
