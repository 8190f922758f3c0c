//! Delta log actions and transaction-log recovery.
//!
//! Each source object version gets its own `Txn` application id. The
//! transaction version committed with a data file is the highest row
//! offset in that file, so the log records, per object, how far its rows
//! are already in the table.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use deltalake::DeltaTable;
use deltalake::kernel::{Action, Add, Transaction};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::table::classify;
use crate::error::CatalogError;
use crate::source::ObjectVersion;

/// Prefix of the `Txn` application ids written by this crate.
pub const TXN_APP_ID_PREFIX: &str = "flurry:";

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Stable identifier of an object version, safe for file names.
pub fn object_id(object: &ObjectVersion) -> String {
    let mut hasher = Sha256::new();
    hasher.update(object.key.as_bytes());
    hasher.update(b"\n");
    hasher.update(object.marker.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

pub fn txn_app_id(object: &ObjectVersion) -> String {
    format!("{TXN_APP_ID_PREFIX}{}", object_id(object))
}

/// Data file name for rows `first..=last` of an object.
pub fn data_file_name(object: &ObjectVersion, first: u64, last: u64) -> String {
    format!("{}-{first:012}-{last:012}.parquet", object_id(object))
}

pub fn create_add_action(path: &str, size: usize) -> Action {
    debug!(path, size, "Creating add action");

    Action::Add(Add {
        path: path.trim_start_matches('/').to_string(),
        size: i64::try_from(size).unwrap_or(i64::MAX),
        partition_values: HashMap::new(),
        modification_time: now_millis(),
        data_change: true,
        ..Default::default()
    })
}

/// `Txn` action marking rows of an object up to `last_offset` as committed.
pub fn create_txn_action(app_id: String, last_offset: i64) -> Action {
    Action::Txn(Transaction {
        app_id,
        version: last_offset,
        last_updated: Some(now_millis()),
    })
}

/// Highest committed offset per application id, read from the Delta log.
#[derive(Debug)]
pub struct CommittedOffsets {
    offsets: HashMap<String, i64>,
    scanned_through: i64,
}

impl CommittedOffsets {
    pub fn new() -> Self {
        Self {
            offsets: HashMap::new(),
            scanned_through: -1,
        }
    }

    pub fn get(&self, app_id: &str) -> Option<i64> {
        self.offsets.get(app_id).copied()
    }

    pub fn record(&mut self, app_id: String, offset: i64) {
        let entry = self.offsets.entry(app_id).or_insert(offset);
        *entry = (*entry).max(offset);
    }

    /// Read commits added since the last scan.
    ///
    /// Commits from other writers are picked up too, so an object replayed
    /// by another process is deduplicated as well.
    pub async fn scan(&mut self, table: &DeltaTable) -> Result<(), CatalogError> {
        use deltalake::logstore::{get_actions, read_commit_entry};

        let current_version = table.version().unwrap_or(-1);
        if current_version <= self.scanned_through {
            return Ok(());
        }

        let log_store = table.log_store();
        let object_store = log_store.object_store(None);

        for version in (self.scanned_through + 1)..=current_version {
            let Some(commit_bytes) = read_commit_entry(object_store.as_ref(), version)
                .await
                .map_err(classify)?
            else {
                continue;
            };

            let actions = get_actions(version, &commit_bytes).map_err(classify)?;
            for action in actions {
                if let Action::Txn(txn) = action
                    && txn.app_id.starts_with(TXN_APP_ID_PREFIX)
                {
                    self.record(txn.app_id, txn.version);
                }
            }
        }

        debug!(
            from = self.scanned_through + 1,
            to = current_version,
            "Scanned Delta log for committed offsets"
        );
        self.scanned_through = current_version;
        Ok(())
    }
}
