use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::debounce::Debouncer;
use super::local_watcher::start_notify_watcher;
use super::paths::{PathError, is_excluded, relative_name};
use crate::index::{FileRecord, IndexStore, SyncFolder, SyncStateRecord};
use crate::pipeline::{NamePolicy, Pipeline, PipelineError, read_and_hash};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Uploaded(FileRecord),
    /// Content already in the store under some name; state recorded.
    AlreadyStored,
    /// Modification time moved but the content did not.
    Touched,
    Unchanged,
    /// Not a regular file any more, or excluded.
    Ignored,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Evaluated {
        folder: String,
        relative_path: String,
        outcome: SyncOutcome,
    },
    Failed {
        folder: String,
        path: PathBuf,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub uploaded: usize,
    pub already_stored: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl ScanReport {
    fn record(&mut self, outcome: &Result<SyncOutcome, PipelineError>) {
        match outcome {
            Ok(SyncOutcome::Uploaded(_)) => self.uploaded += 1,
            Ok(SyncOutcome::AlreadyStored) => self.already_stored += 1,
            Ok(SyncOutcome::Touched | SyncOutcome::Unchanged) => self.unchanged += 1,
            Ok(SyncOutcome::Ignored) => return,
            Err(_) => self.failed += 1,
        }
        self.scanned += 1;
    }
}

/// Mirrors registered local folders into the store.
#[derive(Clone)]
pub struct SyncEngine {
    index: IndexStore,
    pipeline: Pipeline,
    debounce: Duration,
    events: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl SyncEngine {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            index: pipeline.index().clone(),
            pipeline,
            debounce: DEFAULT_DEBOUNCE,
            events: None,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Registers a directory by its canonical path.
    pub async fn add_folder(&self, path: &Path) -> Result<SyncFolder, PipelineError> {
        let canonical = tokio::fs::canonicalize(path).await?;
        if !tokio::fs::metadata(&canonical).await?.is_dir() {
            return Err(PipelineError::Validation(format!(
                "{} is not a directory",
                canonical.display()
            )));
        }
        Ok(self.index.add_sync_folder(&path_key(&canonical)).await?)
    }

    pub async fn remove_folder(&self, path: &Path) -> Result<bool, PipelineError> {
        let key = match tokio::fs::canonicalize(path).await {
            Ok(canonical) => path_key(&canonical),
            Err(_) => path_key(path),
        };
        Ok(self.index.remove_sync_folder(&key).await?)
    }

    pub async fn set_folder_enabled(&self, path: &Path, enabled: bool) -> Result<bool, PipelineError> {
        let key = match tokio::fs::canonicalize(path).await {
            Ok(canonical) => path_key(&canonical),
            Err(_) => path_key(path),
        };
        Ok(self.index.set_sync_folder_enabled(&key, enabled).await?)
    }

    pub async fn list_folders(&self) -> Result<Vec<SyncFolder>, PipelineError> {
        Ok(self.index.list_sync_folders(false).await?)
    }

    /// Decides whether `path` needs uploading and does so. Cheap when the
    /// stored mtime is current; the file is only hashed once mtime advanced.
    pub async fn evaluate(
        &self,
        folder: &SyncFolder,
        path: &Path,
    ) -> Result<SyncOutcome, PipelineError> {
        let root = Path::new(&folder.path);
        let relative = match relative_name(root, path) {
            Ok(relative) => relative,
            Err(PathError::Empty) => return Ok(SyncOutcome::Ignored),
            Err(err) => return Err(PipelineError::Validation(err.to_string())),
        };
        if is_excluded(Path::new(&relative)) {
            return Ok(SyncOutcome::Ignored);
        }
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(SyncOutcome::Ignored),
            Err(err) => return Err(err.into()),
        };
        if !metadata.is_file() {
            return Ok(SyncOutcome::Ignored);
        }
        let modified = unix_nanos(metadata.modified()?);

        let state = self.index.get_sync_state(folder.id, &relative).await?;
        if let Some(state) = &state
            && state.modified >= modified
        {
            return Ok(SyncOutcome::Unchanged);
        }

        let (data, hash) = read_and_hash(path).await?;
        let record = SyncStateRecord {
            folder_id: folder.id,
            relative_path: relative.clone(),
            content_hash: Some(hash.clone()),
            modified,
        };
        if state
            .as_ref()
            .and_then(|s| s.content_hash.as_deref())
            == Some(hash.as_str())
        {
            self.index.upsert_sync_state(&record).await?;
            return Ok(SyncOutcome::Touched);
        }

        let outcome = match self
            .pipeline
            .upload_hashed(&relative, data, hash, NamePolicy::Replace)
            .await
        {
            Ok(file) => {
                info!(folder = %folder.path, path = %relative, "synced");
                SyncOutcome::Uploaded(file)
            }
            Err(err) if err.is_duplicate() => {
                debug!(folder = %folder.path, path = %relative, "content already stored");
                SyncOutcome::AlreadyStored
            }
            Err(err) => return Err(err),
        };
        self.index.upsert_sync_state(&record).await?;
        Ok(outcome)
    }

    /// One recursive pass over a folder. Per-file failures are reported as
    /// events and counted; the pass continues.
    pub async fn scan_folder(&self, folder: &SyncFolder) -> Result<ScanReport, PipelineError> {
        let root = PathBuf::from(&folder.path);
        let files = tokio::task::spawn_blocking(move || collect_files(&root))
            .await
            .map_err(io::Error::other)?;

        let mut report = ScanReport::default();
        for path in files {
            let outcome = self.evaluate(folder, &path).await;
            report.record(&outcome);
            self.emit(folder, &path, outcome);
        }
        info!(
            folder = %folder.path,
            scanned = report.scanned,
            uploaded = report.uploaded,
            failed = report.failed,
            "scan finished"
        );
        Ok(report)
    }

    /// Scans every enabled folder once.
    pub async fn scan_all(&self) -> Result<Vec<(SyncFolder, ScanReport)>, PipelineError> {
        let folders = self.index.list_sync_folders(true).await?;
        let mut out = Vec::with_capacity(folders.len());
        for folder in folders {
            if !Path::new(&folder.path).is_dir() {
                warn!(folder = %folder.path, "sync folder is missing, skipping");
                continue;
            }
            let report = self.scan_folder(&folder).await?;
            out.push((folder, report));
        }
        Ok(out)
    }

    /// Initial scan, then debounced re-evaluation of changed paths until
    /// `shutdown` resolves. Pending timers are dropped on shutdown.
    pub async fn watch<F>(&self, shutdown: F) -> Result<(), PipelineError>
    where
        F: Future<Output = ()>,
    {
        self.scan_all().await?;

        let folders = self.index.list_sync_folders(true).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watchers = Vec::with_capacity(folders.len());
        for folder in &folders {
            match start_notify_watcher(Path::new(&folder.path), tx.clone()) {
                Ok(watcher) => watchers.push(watcher),
                Err(err) => warn!(folder = %folder.path, error = %err, "cannot watch folder"),
            }
        }
        drop(tx);
        info!(folders = watchers.len(), "watching for changes");

        let folders = Arc::new(folders);
        let debouncer = Debouncer::new(self.debounce);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                changed = rx.recv() => {
                    let Some(path) = changed else { break };
                    let Some(folder) = owning_folder(&folders, &path) else {
                        continue;
                    };
                    if let Ok(relative) = relative_name(Path::new(&folder.path), &path)
                        && is_excluded(Path::new(&relative))
                    {
                        continue;
                    }
                    let engine = self.clone();
                    let folder = folder.clone();
                    debouncer.trigger(path.clone(), move || async move {
                        let outcome = engine.evaluate(&folder, &path).await;
                        engine.emit(&folder, &path, outcome);
                    });
                }
            }
        }
        debouncer.cancel_all();
        drop(watchers);
        info!("sync watch stopped");
        Ok(())
    }

    fn emit(&self, folder: &SyncFolder, path: &Path, outcome: Result<SyncOutcome, PipelineError>) {
        let event = match outcome {
            Ok(SyncOutcome::Ignored) => return,
            Ok(outcome) => SyncEvent::Evaluated {
                folder: folder.path.clone(),
                relative_path: relative_name(Path::new(&folder.path), path)
                    .unwrap_or_else(|_| path.display().to_string()),
                outcome,
            },
            Err(err) => {
                warn!(folder = %folder.path, path = %path.display(), error = %err, "sync failed");
                SyncEvent::Failed {
                    folder: folder.path.clone(),
                    path: path.to_path_buf(),
                    error: err.to_string(),
                }
            }
        };
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn collect_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| match entry.path().strip_prefix(root) {
            Ok(relative) if relative.as_os_str().is_empty() => true,
            Ok(relative) => !is_excluded(relative),
            Err(_) => false,
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

fn owning_folder<'a>(folders: &'a [SyncFolder], path: &Path) -> Option<&'a SyncFolder> {
    folders
        .iter()
        .filter(|folder| path.starts_with(&folder.path))
        .max_by_key(|folder| folder.path.len())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn unix_nanos(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
