use std::path::PathBuf;
use std::sync::Arc;

use tgvault_core::{BotClient, BotError, TELEGRAM_API_URL};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::config::{ConfigError, LocalConfig, VaultConfig};
use crate::index::{IndexError, IndexStore};
use crate::pipeline::{Pipeline, TransferProgress};
use crate::resume::ResumeManager;
use crate::storage::Cipher;
use crate::sync::SyncEngine;
use crate::transport::{BlobTransport, BotTransport};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault is not initialised: {0} does not exist")]
    NotInitialized(PathBuf),
    #[error("vault is already initialised at {0}")]
    AlreadyInitialized(PathBuf),
    #[error("wrong password")]
    WrongPassword,
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("bot api error: {0}")]
    Bot(#[from] BotError),
}

/// An opened store: verified password, index, transport and pipeline.
pub struct Vault {
    config: VaultConfig,
    local: LocalConfig,
    pipeline: Pipeline,
}

impl Vault {
    /// Links a bot chat and writes the local config. The token is checked
    /// with `getMe` before anything is written.
    pub async fn init(
        config: &VaultConfig,
        bot_token: &str,
        chat_id: &str,
        password: &str,
    ) -> Result<LocalConfig, VaultError> {
        let path = config.config_path();
        if LocalConfig::load(&path)?.is_some() {
            return Err(VaultError::AlreadyInitialized(path));
        }
        let client = bot_client(config, bot_token)?;
        let me = client.get_me().await?;
        let local = LocalConfig::new(bot_token, chat_id, password)?;
        local.save(&path)?;
        info!(bot = me.username.as_deref().unwrap_or(&me.first_name), chat_id, "vault initialised");
        Ok(local)
    }

    pub async fn open(config: &VaultConfig, password: &str) -> Result<Self, VaultError> {
        let local = load_verified(config, password)?;
        let client = bot_client(config, &local.bot_token)?;
        let transport = Arc::new(BotTransport::new(
            client,
            local.chat_id.clone(),
            config.chunk_size,
        ));
        Self::assemble(config, local, password, transport).await
    }

    /// Like `open`, with a caller-supplied transport.
    pub async fn open_with_transport(
        config: &VaultConfig,
        password: &str,
        transport: Arc<dyn BlobTransport>,
    ) -> Result<Self, VaultError> {
        let local = load_verified(config, password)?;
        Self::assemble(config, local, password, transport).await
    }

    async fn assemble(
        config: &VaultConfig,
        local: LocalConfig,
        password: &str,
        transport: Arc<dyn BlobTransport>,
    ) -> Result<Self, VaultError> {
        let index = IndexStore::open(&config.index_path()).await?;
        let pipeline = Pipeline::new(index, transport, Cipher::new(password), config.spill_dir());
        Ok(Self {
            config: config.clone(),
            local,
            pipeline,
        })
    }

    pub fn with_progress(mut self, progress: UnboundedSender<TransferProgress>) -> Self {
        self.pipeline = self.pipeline.with_progress(progress);
        self
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn local(&self) -> &LocalConfig {
        &self.local
    }

    pub fn index(&self) -> &IndexStore {
        self.pipeline.index()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn resume_manager(&self) -> &ResumeManager {
        self.pipeline.resume_manager()
    }

    pub fn sync_engine(&self) -> SyncEngine {
        SyncEngine::new(self.pipeline.clone()).with_debounce(self.config.debounce)
    }

    pub async fn close(&self) {
        self.pipeline.index().close().await;
    }
}

fn load_verified(config: &VaultConfig, password: &str) -> Result<LocalConfig, VaultError> {
    let path = config.config_path();
    let local = LocalConfig::load(&path)?.ok_or(VaultError::NotInitialized(path))?;
    if !local.verify_password(password)? {
        return Err(VaultError::WrongPassword);
    }
    Ok(local)
}

fn bot_client(config: &VaultConfig, token: &str) -> Result<BotClient, BotError> {
    BotClient::with_base_url(
        config.api_url.as_deref().unwrap_or(TELEGRAM_API_URL),
        token,
    )
}
