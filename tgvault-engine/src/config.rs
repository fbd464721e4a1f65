use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::storage::{HEADER_LEN, cipher};
use crate::transport::DEFAULT_MAX_BLOB_SIZE;

const APP_DIR: &str = "tgvault";
const CONFIG_FILE: &str = "config.json";
const INDEX_FILE: &str = "index.db";
const SPILL_DIR: &str = "spill";
const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CACHE_MAX_BYTES: u64 = 512 * 1024 * 1024;
// room for the frame header plus at least one byte of payload
const MIN_CHUNK_SIZE: u64 = HEADER_LEN as u64 + 1;

/// Runtime settings, all overridable from the environment.
#[derive(Clone, Debug)]
pub struct VaultConfig {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub chunk_size: usize,
    pub api_url: Option<String>,
    pub debounce: Duration,
    pub cache_ttl: Duration,
    pub cache_max_bytes: u64,
    pub password: Option<String>,
}

impl VaultConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_dir = std::env::var("TGVAULT_DATA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| default_data_dir(&home));
        let config_dir = std::env::var("TGVAULT_CONFIG_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| default_config_dir(&home));

        let chunk_size = read_u64_env("TGVAULT_CHUNK_SIZE", DEFAULT_MAX_BLOB_SIZE as u64);
        if chunk_size < MIN_CHUNK_SIZE {
            anyhow::bail!("TGVAULT_CHUNK_SIZE must be at least {MIN_CHUNK_SIZE} bytes");
        }
        let chunk_size = usize::try_from(chunk_size).context("TGVAULT_CHUNK_SIZE is too large")?;

        Ok(Self {
            data_dir,
            config_dir,
            chunk_size,
            api_url: std::env::var("TGVAULT_API_URL")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            debounce: Duration::from_millis(read_u64_env("TGVAULT_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)),
            cache_ttl: Duration::from_secs(read_u64_env(
                "TGVAULT_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
            cache_max_bytes: read_u64_env("TGVAULT_CACHE_MAX_BYTES", DEFAULT_CACHE_MAX_BYTES),
            password: std::env::var("TGVAULT_PASSWORD").ok().filter(|p| !p.is_empty()),
        })
    }

    /// Settings rooted in a single directory, defaults elsewhere.
    pub fn at(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            config_dir: root.join("config"),
            chunk_size: DEFAULT_MAX_BLOB_SIZE,
            api_url: None,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            password: None,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(INDEX_FILE)
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.data_dir.join(SPILL_DIR)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timestamp formatting failed: {0}")]
    Time(#[from] time::error::Format),
    #[error(transparent)]
    Cipher(#[from] cipher::CipherError),
}

/// Persisted link between this machine and a bot chat.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub password_check: String,
    pub created_at: String,
}

impl std::fmt::Debug for LocalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConfig")
            .field("chat_id", &self.chat_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl LocalConfig {
    pub fn new(bot_token: &str, chat_id: &str, password: &str) -> Result<Self, ConfigError> {
        Self::with_check(bot_token, chat_id, cipher::password_check(password))
    }

    pub fn with_check(
        bot_token: &str,
        chat_id: &str,
        password_check: String,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            bot_token: bot_token.trim().to_string(),
            chat_id: chat_id.trim().to_string(),
            password_check,
            created_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
        })
    }

    pub fn verify_password(&self, password: &str) -> Result<bool, ConfigError> {
        Ok(cipher::verify_password(password, &self.password_check)?)
    }

    /// `Ok(None)` when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Writes the file readable by the owner only; it holds the bot token.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(self)?;
        let mut options = OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

fn default_data_dir(home: &Path) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| home.join(".local/share"))
        .join(APP_DIR)
}

fn default_config_dir(home: &Path) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home.join(".config"))
        .join(APP_DIR)
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
