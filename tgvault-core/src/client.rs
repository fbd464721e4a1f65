use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum BotError {
    #[error("request failed: {0}")]
    Request(reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("bot api returned {code}: {description}")]
    Api {
        code: u16,
        description: String,
        retry_after: Option<u64>,
    },
    #[error("bot api response missing result")]
    MissingResult,
    #[error("message {0} carries no document")]
    MissingDocument(i64),
    #[error("file {0} has no download path")]
    MissingFilePath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    Permanent,
}

#[derive(Clone)]
pub struct BotClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl BotClient {
    pub fn new(token: impl Into<String>) -> Result<Self, BotError> {
        Self::with_base_url(TELEGRAM_API_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, BotError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_me(&self) -> Result<BotUser, BotError> {
        let url = self.method_url("getMe")?;
        let response = self.http.get(url).send().await?;
        Self::handle_response(response).await
    }

    /// Uploads `bytes` as a document into `chat_id`. The returned message
    /// carries the document's `file_id`, which is what `get_file` expects.
    pub async fn send_document(
        &self,
        chat_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<Message, BotError> {
        let url = self.method_url("sendDocument")?;
        let size = bytes.len();
        let document = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .text("disable_notification", "true")
            .part("document", document);
        debug!(chat_id, file_name, size, "sendDocument");
        let response = self.http.post(url).multipart(form).send().await?;
        Self::handle_response(response).await
    }

    pub async fn get_file(&self, file_id: &str) -> Result<RemoteFile, BotError> {
        let mut url = self.method_url("getFile")?;
        url.query_pairs_mut().append_pair("file_id", file_id);
        let response = self.http.get(url).send().await?;
        Self::handle_response(response).await
    }

    pub async fn download_file(&self, file_path: &str) -> Result<Vec<u8>, BotError> {
        let url = self
            .base_url
            .join(&format!("/file/bot{}/{}", self.token, file_path))?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::Api {
                code: status.as_u16(),
                description: body,
                retry_after: None,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Resolves `file_id` through `getFile` and downloads the content.
    pub async fn fetch_document(&self, file_id: &str) -> Result<Vec<u8>, BotError> {
        let file = self.get_file(file_id).await?;
        let path = file
            .file_path
            .ok_or_else(|| BotError::MissingFilePath(file.file_id.clone()))?;
        self.download_file(&path).await
    }

    pub async fn delete_message(&self, chat_id: &str, message_id: i64) -> Result<bool, BotError> {
        let mut url = self.method_url("deleteMessage")?;
        url.query_pairs_mut()
            .append_pair("chat_id", chat_id)
            .append_pair("message_id", &message_id.to_string());
        let response = self.http.post(url).send().await?;
        Self::handle_response(response).await
    }

    fn method_url(&self, method: &str) -> Result<Url, BotError> {
        Ok(self.base_url.join(&format!("/bot{}/{}", self.token, method))?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BotError> {
        let status = response.status();
        let body = response.text().await?;
        match serde_json::from_str::<ApiResponse<T>>(&body) {
            Ok(payload) if payload.ok => payload.result.ok_or(BotError::MissingResult),
            Ok(payload) => Err(BotError::Api {
                code: payload.error_code.unwrap_or(status.as_u16()),
                description: payload.description.unwrap_or_default(),
                retry_after: payload.parameters.and_then(|p| p.retry_after),
            }),
            Err(_) => Err(BotError::Api {
                code: status.as_u16(),
                description: body,
                retry_after: None,
            }),
        }
    }
}

impl From<reqwest::Error> for BotError {
    /// Request URLs carry the bot token, so it is stripped before the error
    /// can reach logs or the terminal.
    fn from(err: reqwest::Error) -> Self {
        BotError::Request(err.without_url())
    }
}

impl BotError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            BotError::Api {
                code, description, ..
            } => Some(classify_api_error(*code, description)),
            BotError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::NotFound))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BotError::Api {
                retry_after: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

fn classify_api_error(code: u16, description: &str) -> ApiErrorClass {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::NOT_FOUND
        || description.to_ascii_lowercase().contains("not found")
    {
        ApiErrorClass::NotFound
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BotUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub document: Option<Document>,
}

impl Message {
    pub fn into_document(self) -> Result<(i64, Document), BotError> {
        let id = self.message_id;
        self.document
            .map(|document| (id, document))
            .ok_or(BotError::MissingDocument(id))
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Document {
    pub file_id: String,
    pub file_unique_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RemoteFile {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_path: Option<String>,
}
