pub mod backoff;
mod bot;
mod memory;

use std::path::Path;

use async_trait::async_trait;
use tgvault_core::BotError;
use thiserror::Error;

pub use backoff::Backoff;
pub use bot::BotTransport;
pub use memory::MemoryTransport;

/// Default per-blob ceiling: just under the Bot API's 50 MB upload limit.
pub const DEFAULT_MAX_BLOB_SIZE: usize = 49 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bot api error: {0}")]
    Bot(#[from] BotError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob of {size} bytes exceeds the {max} byte ceiling")]
    TooLarge { size: usize, max: usize },
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Identifiers assigned by the remote side to a sent blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentBlob {
    pub message_id: i64,
    pub blob_id: String,
}

#[async_trait]
pub trait BlobTransport: Send + Sync {
    /// Largest blob `send` accepts, in bytes.
    fn max_blob_size(&self) -> usize;

    async fn send(&self, blob: &Path, caption: &str) -> Result<SentBlob, TransportError>;

    async fn fetch(&self, blob_id: &str) -> Result<Vec<u8>, TransportError>;

    /// Best-effort removal. `Ok(false)` when the message was already gone.
    async fn delete(&self, message_id: i64) -> Result<bool, TransportError>;
}

pub(crate) async fn read_blob(blob: &Path, max: usize) -> Result<Vec<u8>, TransportError> {
    let bytes = tokio::fs::read(blob).await?;
    if bytes.len() > max {
        return Err(TransportError::TooLarge {
            size: bytes.len(),
            max,
        });
    }
    Ok(bytes)
}
