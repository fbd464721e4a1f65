pub mod config;
pub mod index;
pub mod pipeline;
pub mod resume;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod vault;

pub use config::{LocalConfig, VaultConfig};
pub use index::{FileRecord, IndexError, IndexStore};
pub use pipeline::{NamePolicy, Pipeline, PipelineError, TransferProgress};
pub use resume::{ResumeManager, ResumeOutcome};
pub use storage::Cipher;
pub use transport::{BlobTransport, BotTransport, MemoryTransport};
pub use vault::{Vault, VaultError};
