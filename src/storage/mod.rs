//! Storage backend abstraction

mod filesystem;
mod swift;
mod traits;

pub use filesystem::FilesystemBackend;
pub use swift::SwiftBackend;
pub use traits::{ByteStream, ObjectStore, PutOptions, StorageError};

use crate::auth;
use crate::config::{BackendConfig, Config};
use std::sync::Arc;

/// Build the configured backend.
pub async fn from_config(config: &Config) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match &config.backend {
        BackendConfig::Filesystem { path } => {
            Ok(Arc::new(FilesystemBackend::new(path.clone()).await?))
        }
        BackendConfig::Swift {
            storage_url,
            timeout_secs,
        } => {
            let tokens = auth::from_config(&config.auth, *timeout_secs)?;
            Ok(Arc::new(SwiftBackend::new(
                storage_url.clone(),
                *timeout_secs,
                tokens,
            )?))
        }
    }
}
