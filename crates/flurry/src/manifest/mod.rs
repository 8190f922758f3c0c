//! Object manifest: the durable record of every ingestion attempt.
//!
//! The manifest is an append-only log of [`ManifestEntry`] records. The
//! latest record for an object version is that version's state. Once a
//! version is committed it accepts no further records.

mod storage;

pub use storage::{CHECKPOINT_DIR, CHECKPOINT_INTERVAL, LOG_DIR, StorageManifestStore};

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{AlreadyCommittedSnafu, ManifestError};
use crate::source::{ModificationMarker, ObjectVersion};

/// Status of an ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStatus {
    Pending,
    Committed,
    Failed,
}

impl ManifestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::Pending => "pending",
            ManifestStatus::Committed => "committed",
            ManifestStatus::Failed => "failed",
        }
    }
}

/// One manifest record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: String,
    pub modification_marker: ModificationMarker,
    pub status: ManifestStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub committed_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl ManifestEntry {
    fn new(object: &ObjectVersion, status: ManifestStatus, attempt_count: u32) -> Self {
        Self {
            key: object.key.clone(),
            modification_marker: object.marker,
            status,
            attempt_count,
            last_error: None,
            committed_at: None,
            recorded_at: Utc::now(),
        }
    }

    /// An attempt has started.
    pub fn pending(object: &ObjectVersion, attempt_count: u32) -> Self {
        Self::new(object, ManifestStatus::Pending, attempt_count)
    }

    /// Every row of the object is in the destination.
    pub fn committed(object: &ObjectVersion, attempt_count: u32) -> Self {
        let mut entry = Self::new(object, ManifestStatus::Committed, attempt_count);
        entry.committed_at = Some(entry.recorded_at);
        entry
    }

    /// The attempt failed with `error`.
    pub fn failed(object: &ObjectVersion, attempt_count: u32, error: impl Into<String>) -> Self {
        let mut entry = Self::new(object, ManifestStatus::Failed, attempt_count);
        entry.last_error = Some(error.into());
        entry
    }

    pub fn version(&self) -> ObjectVersion {
        ObjectVersion {
            key: self.key.clone(),
            marker: self.modification_marker,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.status == ManifestStatus::Committed
    }
}

/// Durable record of ingestion attempts.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Latest entry recorded for `key`, whatever its marker.
    async fn get(&self, key: &str) -> Result<Option<ManifestEntry>, ManifestError>;

    /// Latest entry recorded for a specific version.
    async fn get_version(
        &self,
        version: &ObjectVersion,
    ) -> Result<Option<ManifestEntry>, ManifestError>;

    /// Append `entry`. Fails with `AlreadyCommitted` if its version is
    /// committed; on any error the store is unchanged.
    async fn record(&self, entry: ManifestEntry) -> Result<(), ManifestError>;

    /// Every committed version.
    async fn list_committed(&self) -> Result<HashSet<ObjectVersion>, ManifestError>;
}

/// In-memory view of the manifest log.
#[derive(Debug, Clone, Default)]
pub(crate) struct ManifestIndex {
    latest_by_key: HashMap<String, ManifestEntry>,
    by_version: HashMap<ObjectVersion, ManifestEntry>,
    committed: HashSet<ObjectVersion>,
}

impl ManifestIndex {
    pub(crate) fn check(&self, entry: &ManifestEntry) -> Result<(), ManifestError> {
        let version = entry.version();
        if self.committed.contains(&version) {
            return AlreadyCommittedSnafu {
                key: version.key,
                marker: version.marker.to_string(),
            }
            .fail();
        }
        Ok(())
    }

    /// Apply a record without checking it; used when replaying the log.
    pub(crate) fn apply(&mut self, entry: ManifestEntry) {
        let version = entry.version();
        if entry.is_committed() {
            self.committed.insert(version.clone());
        }
        self.latest_by_key.insert(entry.key.clone(), entry.clone());
        self.by_version.insert(version, entry);
    }

    pub(crate) fn get(&self, key: &str) -> Option<ManifestEntry> {
        self.latest_by_key.get(key).cloned()
    }

    pub(crate) fn get_version(&self, version: &ObjectVersion) -> Option<ManifestEntry> {
        self.by_version.get(version).cloned()
    }

    pub(crate) fn committed(&self) -> HashSet<ObjectVersion> {
        self.committed.clone()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    index: ManifestIndex,
    history: Vec<ManifestEntry>,
    failures: HashMap<ManifestStatus, usize>,
}

/// Manifest kept in memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryManifestStore {
    state: RwLock<MemoryState>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record accepted so far, in order.
    pub async fn history(&self) -> Vec<ManifestEntry> {
        self.state.read().await.history.clone()
    }

    /// Make the next `times` records with `status` fail as a write error.
    pub async fn fail_next(&self, status: ManifestStatus, times: usize) {
        self.state.write().await.failures.insert(status, times);
    }
}

#[async_trait]
impl ManifestStore for MemoryManifestStore {
    async fn get(&self, key: &str) -> Result<Option<ManifestEntry>, ManifestError> {
        Ok(self.state.read().await.index.get(key))
    }

    async fn get_version(
        &self,
        version: &ObjectVersion,
    ) -> Result<Option<ManifestEntry>, ManifestError> {
        Ok(self.state.read().await.index.get_version(version))
    }

    async fn record(&self, entry: ManifestEntry) -> Result<(), ManifestError> {
        let mut state = self.state.write().await;
        state.index.check(&entry)?;

        if let Some(remaining) = state.failures.get_mut(&entry.status)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ManifestError::ManifestWrite {
                source: flurry_core::StorageError::Io {
                    source: std::io::Error::other("injected manifest write failure"),
                },
            });
        }

        state.history.push(entry.clone());
        state.index.apply(entry);
        Ok(())
    }

    async fn list_committed(&self) -> Result<HashSet<ObjectVersion>, ManifestError> {
        Ok(self.state.read().await.index.committed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn version(key: &str, day: u32) -> ObjectVersion {
        ObjectVersion {
            key: key.to_string(),
            marker: ModificationMarker(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_latest_entry_wins() {
        let store = MemoryManifestStore::new();
        let v1 = version("a.csv", 1);

        store.record(ManifestEntry::pending(&v1, 1)).await.unwrap();
        store
            .record(ManifestEntry::failed(&v1, 1, "boom"))
            .await
            .unwrap();

        let entry = store.get("a.csv").await.unwrap().unwrap();
        assert_eq!(entry.status, ManifestStatus::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("boom"));
        assert_eq!(store.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_committed_is_final() {
        let store = MemoryManifestStore::new();
        let v1 = version("a.csv", 1);

        store.record(ManifestEntry::committed(&v1, 1)).await.unwrap();
        let err = store
            .record(ManifestEntry::pending(&v1, 2))
            .await
            .unwrap_err();

        assert!(matches!(err, ManifestError::AlreadyCommitted { .. }));
        assert!(store.get_version(&v1).await.unwrap().unwrap().is_committed());
        assert_eq!(store.list_committed().await.unwrap(), HashSet::from([v1]));
    }

    #[tokio::test]
    async fn test_new_marker_is_a_new_version() {
        let store = MemoryManifestStore::new();
        let v1 = version("a.csv", 1);
        let v2 = version("a.csv", 2);

        store.record(ManifestEntry::committed(&v1, 1)).await.unwrap();
        store.record(ManifestEntry::pending(&v2, 1)).await.unwrap();

        assert_eq!(
            store.get("a.csv").await.unwrap().unwrap().modification_marker,
            v2.marker
        );
        assert!(store.get_version(&v1).await.unwrap().unwrap().is_committed());
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_state_unchanged() {
        let store = MemoryManifestStore::new();
        let v1 = version("a.csv", 1);
        store.fail_next(ManifestStatus::Committed, 1).await;

        let err = store
            .record(ManifestEntry::committed(&v1, 1))
            .await
            .unwrap_err();

        assert!(matches!(err, ManifestError::ManifestWrite { .. }));
        assert!(store.get("a.csv").await.unwrap().is_none());
        store.record(ManifestEntry::committed(&v1, 1)).await.unwrap();
    }

    #[test]
    fn test_entry_serialization_is_stable() {
        let entry = ManifestEntry::committed(&version("a.csv", 1), 2);
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["status"], "committed");
        assert_eq!(json["key"], "a.csv");
        assert_eq!(json["attempt_count"], 2);
        assert!(json["committed_at"].is_string());
    }
}
