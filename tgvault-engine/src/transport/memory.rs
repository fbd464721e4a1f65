use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{BlobTransport, SentBlob, TransportError, read_blob};

#[derive(Debug, Default)]
struct MemoryState {
    blobs: HashMap<String, (i64, Vec<u8>)>,
    next_message_id: i64,
    sends: usize,
    send_budget: Option<usize>,
    deleted: Vec<i64>,
}

/// In-process blob store. Clones share the same state.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    max_blob_size: usize,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new(max_blob_size: usize) -> Self {
        Self {
            max_blob_size,
            state: Arc::new(Mutex::new(MemoryState {
                next_message_id: 1,
                ..MemoryState::default()
            })),
        }
    }

    /// After `sends` more successful sends, every further send fails until
    /// `heal` is called.
    pub fn fail_sends_after(&self, sends: usize) {
        self.lock().send_budget = Some(sends);
    }

    pub fn heal(&self) {
        self.lock().send_budget = None;
    }

    /// Total successful sends so far.
    pub fn sent_count(&self) -> usize {
        self.lock().sends
    }

    pub fn blob_count(&self) -> usize {
        self.lock().blobs.len()
    }

    pub fn blob(&self, blob_id: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(blob_id).map(|(_, data)| data.clone())
    }

    pub fn replace_blob(&self, blob_id: &str, data: Vec<u8>) {
        if let Some(entry) = self.lock().blobs.get_mut(blob_id) {
            entry.1 = data;
        }
    }

    pub fn drop_blob(&self, blob_id: &str) {
        self.lock().blobs.remove(blob_id);
    }

    pub fn deleted_messages(&self) -> Vec<i64> {
        self.lock().deleted.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // a poisoned lock only means another test thread panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobTransport for MemoryTransport {
    fn max_blob_size(&self) -> usize {
        self.max_blob_size
    }

    async fn send(&self, blob: &Path, _caption: &str) -> Result<SentBlob, TransportError> {
        let bytes = read_blob(blob, self.max_blob_size).await?;
        let mut state = self.lock();
        if let Some(budget) = state.send_budget {
            if budget == 0 {
                return Err(TransportError::Unavailable("injected send failure".into()));
            }
            state.send_budget = Some(budget - 1);
        }
        let message_id = state.next_message_id;
        state.next_message_id += 1;
        state.sends += 1;
        let blob_id = format!("mem-{message_id}");
        state.blobs.insert(blob_id.clone(), (message_id, bytes));
        Ok(SentBlob {
            message_id,
            blob_id,
        })
    }

    async fn fetch(&self, blob_id: &str) -> Result<Vec<u8>, TransportError> {
        self.blob(blob_id)
            .ok_or_else(|| TransportError::NotFound(blob_id.to_string()))
    }

    async fn delete(&self, message_id: i64) -> Result<bool, TransportError> {
        let mut state = self.lock();
        let key = state
            .blobs
            .iter()
            .find(|(_, (id, _))| *id == message_id)
            .map(|(key, _)| key.clone());
        let Some(key) = key else {
            return Ok(false);
        };
        state.blobs.remove(&key);
        state.deleted.push(message_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn send_fetch_delete_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.chunk");
        std::fs::write(&path, b"framed bytes").unwrap();

        let transport = MemoryTransport::new(64);
        let sent = transport.send(&path, "blob [1/1]").await.unwrap();
        assert_eq!(transport.fetch(&sent.blob_id).await.unwrap(), b"framed bytes");

        assert!(transport.delete(sent.message_id).await.unwrap());
        assert!(!transport.delete(sent.message_id).await.unwrap());
        assert!(matches!(
            transport.fetch(&sent.blob_id).await,
            Err(TransportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_oversized_blobs_and_injected_failures() {
        let dir = tempdir().unwrap();
        let big = dir.path().join("big");
        std::fs::write(&big, vec![0u8; 65]).unwrap();
        let small = dir.path().join("small");
        std::fs::write(&small, b"ok").unwrap();

        let transport = MemoryTransport::new(64);
        assert!(matches!(
            transport.send(&big, "").await,
            Err(TransportError::TooLarge { size: 65, max: 64 })
        ));

        transport.fail_sends_after(1);
        transport.send(&small, "").await.unwrap();
        assert!(matches!(
            transport.send(&small, "").await,
            Err(TransportError::Unavailable(_))
        ));
        transport.heal();
        transport.send(&small, "").await.unwrap();
        assert_eq!(transport.sent_count(), 2);
    }
}
