//! Run summary returned to the caller.

use std::fmt;

use serde::Serialize;

use crate::commit::CommitOutcome;
use crate::source::{ModificationMarker, SourceObject};

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial_failure",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An object that failed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectFailure {
    pub key: String,
    pub marker: ModificationMarker,
    pub error: String,
}

/// What a run did. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Objects selected by change detection.
    pub objects_scanned: usize,
    pub objects_committed: usize,
    pub objects_failed: usize,
    /// Objects never dispatched because the run was cancelled.
    pub objects_skipped: usize,
    pub rows_written: u64,
    pub rows_deduplicated: u64,
    pub failures: Vec<ObjectFailure>,
}

impl RunSummary {
    pub fn new(objects_scanned: usize) -> Self {
        Self {
            objects_scanned,
            ..Default::default()
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.failures.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::PartialFailure
        }
    }

    pub(crate) fn record_commit(&mut self, outcome: &CommitOutcome) {
        self.objects_committed += 1;
        self.rows_written += outcome.rows_written;
        self.rows_deduplicated += outcome.rows_deduplicated;
    }

    pub(crate) fn record_failure(&mut self, object: &SourceObject, error: impl ToString) {
        self.objects_failed += 1;
        self.failures.push(ObjectFailure {
            key: object.key.clone(),
            marker: object.modification_marker,
            error: error.to_string(),
        });
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "status:            {}", self.status())?;
        writeln!(f, "objects scanned:   {}", self.objects_scanned)?;
        writeln!(f, "objects committed: {}", self.objects_committed)?;
        writeln!(f, "objects failed:    {}", self.objects_failed)?;
        writeln!(f, "objects skipped:   {}", self.objects_skipped)?;
        writeln!(f, "rows written:      {}", self.rows_written)?;
        write!(f, "rows deduplicated: {}", self.rows_deduplicated)?;
        for failure in &self.failures {
            write!(
                f,
                "\n  failed {}@{}: {}",
                failure.key, failure.marker, failure.error
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_status_follows_failures() {
        let mut summary = RunSummary::new(2);
        summary.record_commit(&CommitOutcome {
            rows_written: 10,
            ..Default::default()
        });
        assert_eq!(summary.status(), RunStatus::Success);

        let object = SourceObject {
            key: "bad.csv".to_string(),
            modification_marker: ModificationMarker(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ),
            size_bytes: 1,
        };
        summary.record_failure(&object, "type conflict");

        assert_eq!(summary.status(), RunStatus::PartialFailure);
        assert_eq!(summary.objects_failed, 1);
        assert!(summary.to_string().contains("failed bad.csv@2024-01-01"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["rows_written"], 10);
        assert_eq!(json["failures"][0]["key"], "bad.csv");
    }
}
