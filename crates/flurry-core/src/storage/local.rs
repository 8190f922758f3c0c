//! Local filesystem backend, used for development and tests.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

/// Local filesystem configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    /// Absolute directory path.
    pub path: String,
}

impl StorageProvider {
    /// The directory is created if missing and its path resolved, so the
    /// provider's URLs stay valid when the path goes through a symlink.
    pub(super) async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path)
            .await
            .context(IoSnafu)?;
        let resolved = tokio::fs::canonicalize(&config.path)
            .await
            .context(IoSnafu)?;
        let path = resolved.to_string_lossy().into_owned();

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(LocalFileSystem::new_with_prefix(&resolved).context(ObjectStoreSnafu)?);

        Ok(Self {
            canonical_url: format!("file://{path}"),
            config: BackendConfig::Local(LocalConfig { path }),
            object_store,
            storage_options: HashMap::new(),
        })
    }
}
