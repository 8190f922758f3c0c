//! Change detection: which source objects still need ingesting.

use std::sync::Arc;

use snafu::prelude::*;
use tracing::{debug, info};

use flurry_core::emit;

use super::{KeyFilter, ObjectSource, SourceObject};
use crate::commit::RetryPolicy;
use crate::error::{DetectError, ListingSnafu, ManifestLookupSnafu};
use crate::manifest::{ManifestStatus, ManifestStore};
use crate::metrics::events::ObjectsDiscovered;

/// Compares a source listing with the manifest.
pub struct DeltaDetector {
    source: Arc<dyn ObjectSource>,
    manifest: Arc<dyn ManifestStore>,
    filter: KeyFilter,
    target: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for DeltaDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaDetector")
            .field("pattern", &self.filter.pattern())
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl DeltaDetector {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        manifest: Arc<dyn ManifestStore>,
        filter: KeyFilter,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source,
            manifest,
            filter,
            target: target.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for listing the source; each attempt gets the policy's
    /// request timeout.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Objects that are new, changed, or not yet committed, ordered by
    /// marker and then key.
    pub async fn detect(&self) -> Result<Vec<SourceObject>, DetectError> {
        let listed = self.list_source().await?;
        let total = listed.len();

        let mut pending = Vec::new();
        for object in listed {
            if self.is_pending(&object).await? {
                pending.push(object);
            }
        }
        pending.sort_by(|a, b| {
            a.modification_marker
                .cmp(&b.modification_marker)
                .then_with(|| a.key.cmp(&b.key))
        });

        info!(
            target = %self.target,
            pattern = %self.filter.pattern(),
            listed = total,
            pending = pending.len(),
            "Detected source changes"
        );
        emit!(ObjectsDiscovered {
            count: pending.len(),
            target: self.target.clone(),
        });

        Ok(pending)
    }

    /// Every source object passing the filter, regardless of the manifest.
    pub async fn list_source(&self) -> Result<Vec<SourceObject>, DetectError> {
        let source = self.source.as_ref();
        let filter = &self.filter;
        self.retry
            .run("list_source", &self.target, move || source.list(filter))
            .await
            .context(ListingSnafu)
    }

    pub fn pattern(&self) -> &str {
        self.filter.pattern()
    }

    async fn is_pending(&self, object: &SourceObject) -> Result<bool, DetectError> {
        let Some(latest) = self
            .manifest
            .get(&object.key)
            .await
            .context(ManifestLookupSnafu)?
        else {
            return Ok(true);
        };

        if latest.modification_marker == object.modification_marker {
            return Ok(latest.status != ManifestStatus::Committed);
        }

        // The latest record is for another marker; this version may still
        // have been committed before it.
        let committed = self
            .manifest
            .get_version(&object.version())
            .await
            .context(ManifestLookupSnafu)?
            .is_some_and(|entry| entry.is_committed());
        if committed {
            debug!(key = %object.key, marker = %object.modification_marker, "Version already committed");
        }
        Ok(!committed)
    }
}
