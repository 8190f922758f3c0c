//! Object storage abstraction.
//!
//! Provides a unified interface over S3 (and S3-compatible endpoints),
//! Google Cloud Storage and the local filesystem. All paths passed to a
//! `StorageProvider` are relative to the key prefix of the URL it was
//! created for.

mod gcs;
mod local;
mod s3;
mod url_parser;

pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use s3::S3Config;
pub use url_parser::BackendConfig;

use bytes::Bytes;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload,
};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequestCompleted};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over different object store backends.
#[derive(Clone)]
pub struct StorageProvider {
    config: BackendConfig,
    object_store: Arc<dyn ObjectStore>,
    canonical_url: String,
    storage_options: HashMap<String, String>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

fn record(operation: StorageOperation, status: RequestStatus, start: Instant) {
    emit!(StorageRequestCompleted {
        operation,
        status,
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    ///
    /// Options are backend configuration keys (e.g. `aws_access_key_id`,
    /// `aws_region`, `google_service_account_key`); the process environment
    /// is never consulted.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options),
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options),
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// List every object under the configured prefix, recursively.
    ///
    /// Returned locations are relative to the prefix.
    pub async fn list_objects(&self) -> Result<Vec<ObjectMeta>, StorageError> {
        self.list_relative(None).await
    }

    /// List every object below `path`, recursively.
    ///
    /// Returned locations are relative to the configured prefix, so they can
    /// be passed straight back to [`StorageProvider::get`].
    pub async fn list_under(&self, path: &Path) -> Result<Vec<ObjectMeta>, StorageError> {
        self.list_relative(Some(path)).await
    }

    async fn list_relative(&self, path: Option<&Path>) -> Result<Vec<ObjectMeta>, StorageError> {
        let prefix_parts = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();
        let qualified = path.map(|path| self.qualify_path(path));
        let listed = match &qualified {
            Some(path) => Some(path.as_ref()),
            None => self.config.key(),
        };
        let start = Instant::now();

        let result: Result<Vec<ObjectMeta>, _> = self
            .object_store
            .list(listed)
            .map_ok(|meta| ObjectMeta {
                location: meta.location.parts().skip(prefix_parts).collect(),
                ..meta
            })
            .try_collect()
            .await;

        record(StorageOperation::List, RequestStatus::from_result(&result), start);
        let objects = result.context(ObjectStoreSnafu)?;
        debug!(url = %self.canonical_url, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = match self.object_store.get(&self.qualify_path(&path)).await {
            Ok(response) => response.bytes().await,
            Err(err) => Err(err),
        };
        record(StorageOperation::Get, RequestStatus::from_result(&result), start);
        result.context(ObjectStoreSnafu)
    }

    /// Open a file as a stream of byte chunks.
    ///
    /// Only the initial request is awaited here; chunks are fetched as the
    /// stream is polled.
    pub async fn get_stream(
        &self,
        path: impl Into<Path>,
    ) -> Result<BoxStream<'static, Result<Bytes, object_store::Error>>, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(&path)).await;
        record(StorageOperation::Get, RequestStatus::from_result(&result), start);
        Ok(result.context(ObjectStoreSnafu)?.into_stream())
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Storage options for external integrations (e.g. Delta Lake).
    pub fn storage_options(&self) -> &HashMap<String, String> {
        &self.storage_options
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Human-readable URL of the configured location.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// URL of the configured location in the form table formats expect.
    pub fn table_url(&self) -> String {
        let empty = Path::default();
        match &self.config {
            BackendConfig::S3(s3) => format!("s3://{}/{}", s3.bucket, self.qualify_path(&empty)),
            BackendConfig::Gcs(gcs) => format!("gs://{}/{}", gcs.bucket, self.qualify_path(&empty)),
            BackendConfig::Local(local) => format!("file://{}", local.path),
        }
    }

    /// Put a payload to a path.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        self.put_payload_with_opts(path, payload, PutOptions::default())
            .await
    }

    /// Put a Parquet file to a path with the correct content type.
    ///
    /// Local filesystem doesn't support attributes, so they are skipped.
    pub async fn put_parquet(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        if matches!(self.config, BackendConfig::Local(_)) {
            return self.put_payload(path, payload).await;
        }

        let opts = PutOptions {
            attributes: Attributes::from_iter([(
                Attribute::ContentType,
                AttributeValue::from("application/vnd.apache.parquet"),
            )]),
            ..Default::default()
        };
        self.put_payload_with_opts(path, payload, opts).await
    }

    /// Put a payload only if nothing exists at `path` yet.
    ///
    /// Losing the race to another writer surfaces as an error for which
    /// [`StorageError::is_conflict`] holds.
    pub async fn put_if_absent(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        self.put_payload_with_opts(path, payload, opts).await
    }

    async fn put_payload_with_opts(
        &self,
        path: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put_opts(&path, payload, opts).await;
        record(StorageOperation::Put, RequestStatus::from_result(&result), start);
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }
}
