//! Destination schema cache shared by all workers.

use std::sync::Arc;

use snafu::prelude::*;
use tokio::sync::RwLock;
use tracing::info;

use flurry_core::emit;

use super::{Reconciliation, SchemaEvolutionMode, TableSchema, reconcile};
use crate::error::{CatalogError, ConflictSnafu, ReconcileError, WidenFailedSnafu};
use crate::metrics::events::SchemaWidened;
use crate::sink::{AccessToken, TableCatalog};

/// Resolves batch schemas against the destination table.
///
/// The cached schema is read concurrently. Widening takes the write lock,
/// so two workers that discover the same new column widen the table once.
pub struct SchemaReconciler {
    catalog: Arc<dyn TableCatalog>,
    table: String,
    mode: SchemaEvolutionMode,
    schema: RwLock<Option<TableSchema>>,
}

impl std::fmt::Debug for SchemaReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaReconciler")
            .field("table", &self.table)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SchemaReconciler {
    pub fn new(catalog: Arc<dyn TableCatalog>, table: String, mode: SchemaEvolutionMode) -> Self {
        Self {
            catalog,
            table,
            mode,
            schema: RwLock::new(None),
        }
    }

    pub fn mode(&self) -> SchemaEvolutionMode {
        self.mode
    }

    /// Load the destination schema into the cache.
    pub async fn load(&self, token: &AccessToken) -> Result<Option<TableSchema>, CatalogError> {
        let schema = self.catalog.get_schema(token, &self.table).await?;
        *self.schema.write().await = schema.clone();
        Ok(schema)
    }

    /// The cached destination schema.
    pub async fn current(&self) -> Option<TableSchema> {
        self.schema.read().await.clone()
    }

    /// Reconcile `batch`, widening the destination first when needed.
    pub async fn resolve(
        &self,
        batch: &TableSchema,
        token: &AccessToken,
    ) -> Result<Reconciliation, ReconcileError> {
        {
            let cached = self.schema.read().await;
            let plan = reconcile(batch, cached.as_ref(), self.mode).context(ConflictSnafu)?;
            if !plan.needs_widening() {
                return Ok(plan);
            }
        }

        let mut cached = self.schema.write().await;
        // Another worker may have widened while we waited for the lock.
        let plan = reconcile(batch, cached.as_ref(), self.mode).context(ConflictSnafu)?;
        if !plan.needs_widening() {
            return Ok(plan);
        }

        let widened = self
            .catalog
            .widen_schema(token, &self.table, plan.new_columns())
            .await
            .context(WidenFailedSnafu)?;

        let added: Vec<_> = plan.new_columns().iter().map(|c| c.name.as_str()).collect();
        info!(
            target = %self.table,
            created = cached.is_none(),
            columns = ?added,
            "Widened destination schema"
        );
        emit!(SchemaWidened {
            columns: added.len(),
            target: self.table.clone(),
        });

        *cached = Some(widened);
        reconcile(batch, cached.as_ref(), self.mode).context(ConflictSnafu)
    }
}
