//! Manifest persisted as a sequenced log of records on object storage.
//!
//! Every record lives in its own object, `log/{sequence:020}.json`, written
//! with a create-if-absent put. Two writers can never both claim the same
//! sequence number: the loser reloads the records it missed, re-checks its
//! entry against them and claims the next free number. Periodic checkpoints
//! under `checkpoints/` hold every record up to their sequence number so
//! opening the manifest does not have to fetch the whole log.

use std::collections::HashSet;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::PutPayload;
use object_store::path::Path;
use snafu::prelude::*;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use flurry_core::StorageProviderRef;

use super::{ManifestEntry, ManifestIndex, ManifestStore};
use crate::error::{
    ManifestDecodeSnafu, ManifestEncodeSnafu, ManifestError, ManifestReadSnafu,
    ManifestWriteSnafu,
};
use crate::source::ObjectVersion;

/// Directory of record objects, relative to the manifest location.
pub const LOG_DIR: &str = "log";

/// Directory of checkpoint objects, relative to the manifest location.
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Records between two checkpoints.
pub const CHECKPOINT_INTERVAL: u64 = 100;

/// Lost sequence races tolerated by a single `record` call.
const MAX_CONFLICTS: usize = 32;

fn log_path(sequence: u64) -> Path {
    Path::from(format!("{LOG_DIR}/{sequence:020}.json"))
}

fn checkpoint_path(sequence: u64) -> Path {
    Path::from(format!("{CHECKPOINT_DIR}/{sequence:020}.jsonl"))
}

/// Sequence number encoded in a log or checkpoint object name.
fn sequence_of(location: &Path, extension: &str) -> Option<u64> {
    location
        .filename()?
        .strip_suffix(extension)?
        .parse()
        .ok()
}

#[derive(Debug, Default)]
struct LogState {
    index: ManifestIndex,
    /// Every applied record as JSON lines, the body of the next checkpoint.
    content: Vec<u8>,
    /// Sequence number the next record will claim.
    next: u64,
}

impl LogState {
    /// Decode `content` and apply its records in order.
    ///
    /// Nothing is applied if any line fails to decode.
    fn extend(&mut self, location: &Path, content: &[u8]) -> Result<(), ManifestError> {
        let mut entries = Vec::new();
        for (number, line) in content.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let entry: ManifestEntry = serde_json::from_slice(line).context(ManifestDecodeSnafu {
                location: location.to_string(),
                line: number + 1,
            })?;
            entries.push((entry, line));
        }

        for (entry, line) in entries {
            self.content.extend_from_slice(line);
            self.content.push(b'\n');
            self.index.apply(entry);
        }
        Ok(())
    }
}

/// Manifest stored as a sequenced record log at a storage location.
///
/// Several processes may share one location. A record is only applied to the
/// in-memory view once its own log object exists, and it is always checked
/// against every record with a lower sequence number.
pub struct StorageManifestStore {
    storage: StorageProviderRef,
    state: RwLock<LogState>,
    writer: Mutex<()>,
    checkpoint_interval: u64,
}

impl std::fmt::Debug for StorageManifestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManifestStore")
            .field("location", &self.storage.canonical_url())
            .finish_non_exhaustive()
    }
}

impl StorageManifestStore {
    /// Load the manifest at `storage`. A missing log is an empty manifest.
    pub async fn open(storage: StorageProviderRef) -> Result<Self, ManifestError> {
        Self::open_with_checkpoint_interval(storage, CHECKPOINT_INTERVAL).await
    }

    async fn open_with_checkpoint_interval(
        storage: StorageProviderRef,
        checkpoint_interval: u64,
    ) -> Result<Self, ManifestError> {
        let mut state = LogState::default();

        let checkpoint = storage
            .list_under(&Path::from(CHECKPOINT_DIR))
            .await
            .context(ManifestReadSnafu)?
            .into_iter()
            .filter_map(|meta| sequence_of(&meta.location, ".jsonl"))
            .max();
        if let Some(sequence) = checkpoint {
            let path = checkpoint_path(sequence);
            let content = storage.get(path.clone()).await.context(ManifestReadSnafu)?;
            state.extend(&path, &content)?;
            state.next = sequence + 1;
        }

        let mut records: Vec<u64> = storage
            .list_under(&Path::from(LOG_DIR))
            .await
            .context(ManifestReadSnafu)?
            .into_iter()
            .filter_map(|meta| sequence_of(&meta.location, ".json"))
            .filter(|sequence| *sequence >= state.next)
            .collect();
        records.sort_unstable();
        for sequence in records {
            let path = log_path(sequence);
            let content = storage.get(path.clone()).await.context(ManifestReadSnafu)?;
            state.extend(&path, &content)?;
            state.next = sequence + 1;
        }

        info!(
            location = %storage.canonical_url(),
            committed = state.index.committed().len(),
            next_sequence = state.next,
            "Loaded manifest"
        );

        Ok(Self {
            storage,
            state: RwLock::new(state),
            writer: Mutex::new(()),
            checkpoint_interval: checkpoint_interval.max(1),
        })
    }

    /// Apply records other writers appended since the last load.
    pub async fn refresh(&self) -> Result<(), ManifestError> {
        let mut state = self.state.write().await;
        loop {
            let path = log_path(state.next);
            match self.storage.get(path.clone()).await {
                Ok(content) => {
                    state.extend(&path, &content)?;
                    state.next += 1;
                }
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err).context(ManifestReadSnafu),
            }
        }
    }

    /// Write a checkpoint covering records up to `sequence`.
    ///
    /// The log stays authoritative, so a failed checkpoint is only logged.
    async fn checkpoint(&self, sequence: u64, content: Vec<u8>) {
        let path = checkpoint_path(sequence);
        match self
            .storage
            .put_if_absent(&path, PutPayload::from(Bytes::from(content)))
            .await
        {
            Ok(()) => debug!(sequence, "Wrote manifest checkpoint"),
            Err(err) if err.is_conflict() => {}
            Err(err) => warn!(sequence, error = %err, "Failed to write manifest checkpoint"),
        }
    }
}

#[async_trait]
impl ManifestStore for StorageManifestStore {
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
        let mut line = serde_json::to_vec(&entry).context(ManifestEncodeSnafu)?;
        line.push(b'\n');
        let line = Bytes::from(line);

        let _writer = self.writer.lock().await;
        let mut conflicts = 0;
        let sequence = loop {
            let sequence = {
                let state = self.state.read().await;
                state.index.check(&entry)?;
                state.next
            };
            match self
                .storage
                .put_if_absent(&log_path(sequence), PutPayload::from(line.clone()))
                .await
            {
                Ok(()) => break sequence,
                Err(err) if err.is_conflict() && conflicts < MAX_CONFLICTS => {
                    conflicts += 1;
                    debug!(sequence, key = %entry.key, "Manifest sequence taken; reloading");
                    self.refresh().await?;
                }
                Err(err) => return Err(err).context(ManifestWriteSnafu),
            }
        };

        debug!(
            key = %entry.key,
            marker = %entry.modification_marker,
            status = entry.status.as_str(),
            attempt = entry.attempt_count,
            sequence,
            "Recorded manifest entry"
        );

        let checkpoint = {
            let mut state = self.state.write().await;
            state.content.extend_from_slice(&line);
            state.index.apply(entry);
            state.next = sequence + 1;
            ((sequence + 1) % self.checkpoint_interval == 0).then(|| state.content.clone())
        };
        if let Some(content) = checkpoint {
            self.checkpoint(sequence, content).await;
        }
        Ok(())
    }

    async fn list_committed(&self) -> Result<HashSet<ObjectVersion>, ManifestError> {
        Ok(self.state.read().await.index.committed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestStatus;
    use crate::source::ModificationMarker;
    use chrono::{TimeZone, Utc};
    use flurry_core::StorageProvider;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn storage(dir: &TempDir) -> StorageProviderRef {
        Arc::new(
            StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
                .await
                .unwrap(),
        )
    }

    fn version(key: &str) -> ObjectVersion {
        ObjectVersion {
            key: key.to_string(),
            marker: ModificationMarker(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_missing_manifest_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = StorageManifestStore::open(storage(&dir).await).await.unwrap();

        assert!(store.get("a.csv").await.unwrap().is_none());
        assert!(store.list_committed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let provider = storage(&dir).await;
        let a = version("a.csv");
        let b = version("b.csv");

        let store = StorageManifestStore::open(provider.clone()).await.unwrap();
        store.record(ManifestEntry::pending(&a, 1)).await.unwrap();
        store.record(ManifestEntry::committed(&a, 1)).await.unwrap();
        store
            .record(ManifestEntry::failed(&b, 1, "bad row"))
            .await
            .unwrap();
        drop(store);

        let reopened = StorageManifestStore::open(provider).await.unwrap();
        assert_eq!(
            reopened.list_committed().await.unwrap(),
            HashSet::from([a.clone()])
        );
        let failed = reopened.get("b.csv").await.unwrap().unwrap();
        assert_eq!(failed.status, ManifestStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("bad row"));

        let err = reopened
            .record(ManifestEntry::pending(&a, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::AlreadyCommitted { .. }));
    }

    #[tokio::test]
    async fn test_each_record_is_its_own_log_object() {
        let dir = TempDir::new().unwrap();
        let provider = storage(&dir).await;
        let store = StorageManifestStore::open(provider.clone()).await.unwrap();
        let a = version("a.csv");

        store.record(ManifestEntry::pending(&a, 1)).await.unwrap();
        store.record(ManifestEntry::committed(&a, 1)).await.unwrap();

        let mut listed: Vec<String> = provider
            .list_under(&Path::from(LOG_DIR))
            .await
            .unwrap()
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect();
        listed.sort();
        assert_eq!(
            listed,
            vec![
                "log/00000000000000000000.json",
                "log/00000000000000000001.json"
            ]
        );
        let second = provider.get(log_path(1)).await.unwrap();
        assert!(std::str::from_utf8(&second).unwrap().contains("\"committed\""));
    }

    #[tokio::test]
    async fn test_writers_sharing_a_location_keep_each_others_records() {
        let dir = TempDir::new().unwrap();
        let provider = storage(&dir).await;
        let first = StorageManifestStore::open(provider.clone()).await.unwrap();
        let second = StorageManifestStore::open(provider.clone()).await.unwrap();
        let x = version("x.csv");
        let y = version("y.csv");

        first.record(ManifestEntry::committed(&x, 1)).await.unwrap();
        second.record(ManifestEntry::committed(&y, 1)).await.unwrap();

        let reopened = StorageManifestStore::open(provider).await.unwrap();
        assert_eq!(
            reopened.list_committed().await.unwrap(),
            HashSet::from([x, y])
        );
        // The second writer picked up the first one's record while resolving
        // the sequence race.
        assert!(second.get("x.csv").await.unwrap().unwrap().is_committed());
    }

    #[tokio::test]
    async fn test_stale_writer_cannot_reopen_a_committed_version() {
        let dir = TempDir::new().unwrap();
        let provider = storage(&dir).await;
        let first = StorageManifestStore::open(provider.clone()).await.unwrap();
        let stale = StorageManifestStore::open(provider.clone()).await.unwrap();
        let x = version("x.csv");

        first.record(ManifestEntry::pending(&x, 1)).await.unwrap();
        first.record(ManifestEntry::committed(&x, 1)).await.unwrap();

        let err = stale
            .record(ManifestEntry::pending(&x, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::AlreadyCommitted { .. }));

        let reopened = StorageManifestStore::open(provider).await.unwrap();
        assert!(reopened.get("x.csv").await.unwrap().unwrap().is_committed());
    }

    #[tokio::test]
    async fn test_refresh_applies_records_from_other_writers() {
        let dir = TempDir::new().unwrap();
        let provider = storage(&dir).await;
        let writer = StorageManifestStore::open(provider.clone()).await.unwrap();
        let reader = StorageManifestStore::open(provider).await.unwrap();

        writer
            .record(ManifestEntry::committed(&version("a.csv"), 1))
            .await
            .unwrap();
        assert!(reader.get("a.csv").await.unwrap().is_none());

        reader.refresh().await.unwrap();
        assert!(reader.get("a.csv").await.unwrap().unwrap().is_committed());
    }

    #[tokio::test]
    async fn test_checkpoint_covers_earlier_records() {
        let dir = TempDir::new().unwrap();
        let provider = storage(&dir).await;
        let store = StorageManifestStore::open_with_checkpoint_interval(provider.clone(), 2)
            .await
            .unwrap();
        let a = version("a.csv");
        let b = version("b.csv");

        store.record(ManifestEntry::pending(&a, 1)).await.unwrap();
        store.record(ManifestEntry::committed(&a, 1)).await.unwrap();
        store.record(ManifestEntry::committed(&b, 1)).await.unwrap();
        drop(store);

        // Records 0 and 1 are only reachable through the checkpoint now.
        std::fs::remove_file(dir.path().join("log/00000000000000000000.json")).unwrap();
        std::fs::remove_file(dir.path().join("log/00000000000000000001.json")).unwrap();
        assert!(dir.path().join("checkpoints/00000000000000000001.jsonl").exists());

        let reopened = StorageManifestStore::open(provider).await.unwrap();
        assert_eq!(
            reopened.list_committed().await.unwrap(),
            HashSet::from([a, b])
        );
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reported() {
        let dir = TempDir::new().unwrap();
        let provider = storage(&dir).await;
        let entry = serde_json::to_vec(&ManifestEntry::pending(&version("a.csv"), 1)).unwrap();
        provider
            .put_if_absent(&log_path(0), PutPayload::from(entry))
            .await
            .unwrap();
        provider
            .put_if_absent(&log_path(1), PutPayload::from_static(b"not json\n"))
            .await
            .unwrap();

        let err = StorageManifestStore::open(provider).await.unwrap_err();

        match err {
            ManifestError::ManifestDecode { location, line, .. } => {
                assert_eq!(location, "log/00000000000000000001.json");
                assert_eq!(line, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
