use std::future::Future;
use std::path::Path;

use async_trait::async_trait;
use tgvault_core::{BotClient, BotError};
use tracing::{debug, warn};

use super::{BlobTransport, SentBlob, TransportError, backoff::Backoff, read_blob};

const MAX_ATTEMPTS: u32 = 5;

/// Blob transport over a bot chat: every blob becomes one document message.
pub struct BotTransport {
    client: BotClient,
    chat_id: String,
    max_blob_size: usize,
    backoff: Backoff,
    max_attempts: u32,
}

impl BotTransport {
    pub fn new(client: BotClient, chat_id: impl Into<String>, max_blob_size: usize) -> Self {
        Self {
            client,
            chat_id: chat_id.into(),
            max_blob_size,
            backoff: Backoff::default(),
            max_attempts: MAX_ATTEMPTS,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff, max_attempts: u32) -> Self {
        self.backoff = backoff;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Retries rate-limited and transient failures, sleeping for the server's
    /// `retry_after` when it sends one.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, BotError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BotError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff.retry_delay(attempt, err.retry_after());
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying bot call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl BlobTransport for BotTransport {
    fn max_blob_size(&self) -> usize {
        self.max_blob_size
    }

    async fn send(&self, blob: &Path, caption: &str) -> Result<SentBlob, TransportError> {
        let bytes = read_blob(blob, self.max_blob_size).await?;
        let file_name = blob
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "blob".to_string());
        let message = self
            .with_retry("sendDocument", || {
                self.client
                    .send_document(&self.chat_id, &file_name, bytes.clone(), caption)
            })
            .await?;
        let (message_id, document) = message.into_document()?;
        debug!(message_id, blob_id = %document.file_id, "blob sent");
        Ok(SentBlob {
            message_id,
            blob_id: document.file_id,
        })
    }

    async fn fetch(&self, blob_id: &str) -> Result<Vec<u8>, TransportError> {
        match self
            .with_retry("getFile", || self.client.fetch_document(blob_id))
            .await
        {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.is_not_found() => Err(TransportError::NotFound(blob_id.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, message_id: i64) -> Result<bool, TransportError> {
        match self
            .with_retry("deleteMessage", || {
                self.client.delete_message(&self.chat_id, message_id)
            })
            .await
        {
            Ok(deleted) => Ok(deleted),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer) -> BotTransport {
        let client = BotClient::with_base_url(&server.uri(), "TOKEN").unwrap();
        BotTransport::new(client, "42", 1024).with_backoff(
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5), false),
            3,
        )
    }

    #[tokio::test]
    async fn send_retries_after_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendDocument"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 0",
                "parameters": { "retry_after": 0 }
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendDocument"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": {
                    "message_id": 7,
                    "document": { "file_id": "FILE-7", "file_unique_id": "U7" }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let blob = dir.path().join("0000.chunk");
        std::fs::write(&blob, b"frame").unwrap();

        let sent = transport(&server).send(&blob, "a.txt [1/1]").await.unwrap();
        assert_eq!(
            sent,
            SentBlob {
                message_id: 7,
                blob_id: "FILE-7".into()
            }
        );
    }

    #[tokio::test]
    async fn fetch_resolves_file_path_then_downloads() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/botTOKEN/getFile"))
            .and(query_param("file_id", "FILE-7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": { "file_id": "FILE-7", "file_path": "documents/file_7" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file/botTOKEN/documents/file_7"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"frame".to_vec()))
            .mount(&server)
            .await;

        let bytes = transport(&server).fetch("FILE-7").await.unwrap();
        assert_eq!(bytes, b"frame");
    }

    #[tokio::test]
    async fn missing_blob_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/botTOKEN/getFile"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: file not found"
            })))
            .mount(&server)
            .await;

        let err = transport(&server).fetch("gone").await.unwrap_err();
        assert!(matches!(err, TransportError::NotFound(id) if id == "gone"));
    }

    #[tokio::test]
    async fn delete_tolerates_missing_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/deleteMessage"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: message to delete not found"
            })))
            .mount(&server)
            .await;

        assert!(!transport(&server).delete(99).await.unwrap());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/deleteMessage"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .expect(3)
            .mount(&server)
            .await;

        let err = transport(&server).delete(1).await.unwrap_err();
        assert!(matches!(err, TransportError::Bot(BotError::Api { code: 502, .. })));
    }
}
