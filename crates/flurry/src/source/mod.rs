//! Source objects and the object stores they are listed from.
//!
//! A source object is identified by its key together with the
//! modification marker reported by the store. A key observed with a new
//! marker is a new unit of ingestion.

pub mod detector;
mod memory;
pub mod reader;

pub use detector::DeltaDetector;
pub use memory::MemorySource;
pub use reader::{BatchReader, ReaderConfig, Row, RowBatch};

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use flurry_core::storage::StorageProviderRef;

use crate::error::{InvalidGlobSnafu, SourceError, SourceStorageSnafu};

/// Point in time at which the store last modified an object.
///
/// Markers are totally ordered and are trusted to change whenever the
/// object's content changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModificationMarker(pub DateTime<Utc>);

impl ModificationMarker {
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for ModificationMarker {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl fmt::Display for ModificationMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

/// A specific version of a source object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectVersion {
    pub key: String,
    pub marker: ModificationMarker,
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.marker)
    }
}

/// An object as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceObject {
    /// Path relative to the source location.
    pub key: String,
    pub modification_marker: ModificationMarker,
    pub size_bytes: u64,
}

impl SourceObject {
    pub fn version(&self) -> ObjectVersion {
        ObjectVersion {
            key: self.key.clone(),
            marker: self.modification_marker,
        }
    }
}

/// A stream of raw object bytes.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Selects the keys a listing should consider.
///
/// Keys are matched against a glob where `*` does not cross `/`. Keys with
/// a path segment starting with `_` or `.` are internal (temp files, our
/// own manifest) and never match.
#[derive(Debug, Clone)]
pub struct KeyFilter {
    pattern: String,
    matcher: GlobMatcher,
}

impl KeyFilter {
    pub fn new(pattern: &str) -> Result<Self, SourceError> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .context(InvalidGlobSnafu { pattern })?;
        Ok(Self {
            pattern: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, key: &str) -> bool {
        let internal = key
            .split('/')
            .any(|segment| segment.starts_with('_') || segment.starts_with('.'));
        !internal && self.matcher.is_match(key)
    }
}

/// A location objects are listed and read from.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// List objects whose key passes `filter`.
    ///
    /// A missing location lists as empty.
    async fn list(&self, filter: &KeyFilter) -> Result<Vec<SourceObject>, SourceError>;

    /// Open an object for streaming reads.
    async fn open_stream(&self, key: &str) -> Result<ByteStream, SourceError>;
}

/// Object source backed by a [`flurry_core::StorageProvider`].
///
/// The store's last-modified timestamp is used as the modification marker.
#[derive(Debug, Clone)]
pub struct StorageSource {
    storage: StorageProviderRef,
}

impl StorageSource {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ObjectSource for StorageSource {
    async fn list(&self, filter: &KeyFilter) -> Result<Vec<SourceObject>, SourceError> {
        let listed = match self.storage.list_objects().await {
            Ok(listed) => listed,
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err).context(SourceStorageSnafu),
        };

        Ok(listed
            .into_iter()
            .filter(|meta| filter.matches(meta.location.as_ref()))
            .map(|meta| SourceObject {
                key: meta.location.to_string(),
                modification_marker: ModificationMarker(meta.last_modified),
                size_bytes: meta.size,
            })
            .collect())
    }

    async fn open_stream(&self, key: &str) -> Result<ByteStream, SourceError> {
        let stream = self
            .storage
            .get_stream(key)
            .await
            .context(SourceStorageSnafu)?;
        Ok(stream.map_err(std::io::Error::other).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_filter_does_not_cross_directories() {
        let filter = KeyFilter::new("yellow_tripdata_*.csv").unwrap();
        assert!(filter.matches("yellow_tripdata_2024-01.csv"));
        assert!(!filter.matches("2024/yellow_tripdata_2024-01.csv"));
        assert!(!filter.matches("green_tripdata_2024-01.csv"));
    }

    #[test]
    fn test_key_filter_recursive_pattern() {
        let filter = KeyFilter::new("**/*.csv").unwrap();
        assert!(filter.matches("2024/01/trips.csv"));
        assert!(filter.matches("trips.csv"));
    }

    #[test]
    fn test_key_filter_skips_internal_paths() {
        let filter = KeyFilter::new("**/*").unwrap();
        assert!(!filter.matches("_flurry/log/00000000000000000000.json"));
        assert!(!filter.matches("raw/.trips.csv.tmp"));
        assert!(filter.matches("raw/trips.csv"));
    }

    #[test]
    fn test_invalid_glob() {
        let err = KeyFilter::new("[unclosed").unwrap_err();
        assert!(matches!(err, SourceError::InvalidGlob { .. }));
    }

    #[test]
    fn test_marker_display_is_stable() {
        let marker = ModificationMarker(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        assert_eq!(marker.to_string(), "2024-03-01T12:00:00.000000Z");
    }

    #[test]
    fn test_versions_order_by_key_then_marker() {
        let t1 = ModificationMarker(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let t2 = ModificationMarker(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        let a = ObjectVersion {
            key: "a.csv".to_string(),
            marker: t2,
        };
        let b = ObjectVersion {
            key: "b.csv".to_string(),
            marker: t1,
        };
        assert!(a < b);
        assert_eq!(a.to_string(), "a.csv@2024-01-02T00:00:00.000000Z");
    }
}
