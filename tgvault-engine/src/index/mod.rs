use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;

mod files;
mod pending;
mod sync_state;
mod tags;

pub use files::IndexStats;
pub use pending::{NewPendingChunk, NewPendingUpload, Promotion};
pub use tags::normalize_tag;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} not found after insert")]
    MissingRow(&'static str),
    #[error("pending upload {0} not found")]
    PendingNotFound(i64),
    #[error("pending upload {id} is incomplete: {uploaded}/{total} chunks uploaded")]
    IncompleteUpload { id: i64, uploaded: i64, total: i64 },
    #[error("chunk rows do not cover 0..{expected}")]
    ChunkSequence { expected: i64 },
    #[error("content hash already stored: {0}")]
    DuplicateHash(String),
    #[error("file name already in use: {0}")]
    NameTaken(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub filename: String,
    pub content_hash: String,
    pub original_size: i64,
    pub stored_size: i64,
    pub chunk_count: i64,
    pub compressed: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub file_id: i64,
    pub chunk_index: i64,
    pub message_id: i64,
    pub blob_id: String,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub id: i64,
    pub filename: String,
    pub content_hash: String,
    pub original_size: i64,
    pub stored_size: i64,
    pub compressed: bool,
    pub replace_existing: bool,
    pub total_chunks: i64,
    pub uploaded_chunks: i64,
    pub spill_dir: String,
    pub created_at: i64,
}

impl PendingUpload {
    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks >= self.total_chunks
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChunk {
    pub pending_id: i64,
    pub chunk_index: i64,
    pub spill_path: String,
    pub size: i64,
    pub uploaded: bool,
    pub message_id: Option<i64>,
    pub blob_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFolder {
    pub id: i64,
    pub path: String,
    pub enabled: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateRecord {
    pub folder_id: i64,
    pub relative_path: String,
    pub content_hash: Option<String>,
    pub modified: i64,
}

/// Local metadata index backed by SQLite.
#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, IndexError> {
        let options = SqliteConnectOptions::from_str(database_url)?.foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Opens (creating if needed) the database file. WAL journaling with a
    /// busy timeout keeps writers serialized.
    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Single-connection in-memory store. Every pooled connection to
    /// `sqlite::memory:` would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self, IndexError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub(crate) fn file_from_row(row: &SqliteRow) -> Result<FileRecord, IndexError> {
    let compressed: i64 = row.try_get("compressed")?;
    Ok(FileRecord {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        content_hash: row.try_get("content_hash")?,
        original_size: row.try_get("original_size")?,
        stored_size: row.try_get("stored_size")?,
        chunk_count: row.try_get("chunk_count")?,
        compressed: compressed != 0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn chunk_from_row(row: &SqliteRow) -> Result<ChunkRecord, IndexError> {
    Ok(ChunkRecord {
        file_id: row.try_get("file_id")?,
        chunk_index: row.try_get("chunk_index")?,
        message_id: row.try_get("message_id")?,
        blob_id: row.try_get("blob_id")?,
        size: row.try_get("size")?,
    })
}

pub(crate) const FILE_COLUMNS: &str = "id, filename, content_hash, original_size, stored_size, chunk_count, compressed, created_at, updated_at";
