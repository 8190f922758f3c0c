//! In-process table catalog with fault injection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{
    AccessToken, AppendOutcome, Credentials, IdempotencyKey, ReconciledBatch, TableCatalog,
};
use crate::error::CatalogError;
use crate::schema::{Column, TableSchema, Value};

/// Failure returned by an append instead of writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Permanent,
    AuthExpired,
}

impl InjectedFailure {
    fn into_error(self, call: usize) -> CatalogError {
        match self {
            InjectedFailure::Transient => CatalogError::Transient {
                message: format!("injected failure on append {call}"),
            },
            InjectedFailure::Permanent => CatalogError::Permanent {
                message: format!("injected failure on append {call}"),
            },
            InjectedFailure::AuthExpired => CatalogError::AuthExpired,
        }
    }
}

/// A committed row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub key: IdempotencyKey,
    pub values: BTreeMap<String, Value>,
}

impl StoredRow {
    /// Value of `column`; null for columns added after the row was written.
    pub fn value(&self, column: &str) -> Value {
        self.values.get(column).cloned().unwrap_or(Value::Null)
    }
}

#[derive(Debug, Default)]
struct Table {
    schema: TableSchema,
    rows: Vec<StoredRow>,
    keys: HashSet<IdempotencyKey>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Table>,
    valid_tokens: HashSet<String>,
    issued_tokens: usize,
    auth_calls: usize,
    append_calls: usize,
    reject_credentials: bool,
    failures: HashMap<usize, InjectedFailure>,
    append_gate: Option<Arc<Semaphore>>,
}

/// Table catalog keeping tables in memory.
///
/// Deduplicates on the idempotency key of every row and can be told to
/// fail specific appends, expire tokens or hold appends behind a gate.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<State>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create `table` with `schema`.
    pub fn with_table(self, table: &str, schema: TableSchema) -> Self {
        self.state().tables.insert(
            table.to_string(),
            Table {
                schema,
                ..Default::default()
            },
        );
        self
    }

    /// Block every append until a permit is available on `gate`.
    pub fn with_append_gate(self, gate: Arc<Semaphore>) -> Self {
        self.state().append_gate = Some(gate);
        self
    }

    /// Fail the `call`-th append (1-based, counted across all tables).
    pub fn fail_append(&self, call: usize, failure: InjectedFailure) {
        self.state().failures.insert(call, failure);
    }

    /// Revoke every token issued so far.
    pub fn expire_tokens(&self) {
        self.state().valid_tokens.clear();
    }

    /// Make authentication fail with `Unauthorized`.
    pub fn reject_credentials(&self, reject: bool) {
        self.state().reject_credentials = reject;
    }

    pub fn auth_calls(&self) -> usize {
        self.state().auth_calls
    }

    pub fn append_calls(&self) -> usize {
        self.state().append_calls
    }

    pub fn schema(&self, table: &str) -> Option<TableSchema> {
        self.state().tables.get(table).map(|t| t.schema.clone())
    }

    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state().tables.get(table).map_or(0, |t| t.rows.len())
    }

    fn check_token(state: &State, token: &AccessToken) -> Result<(), CatalogError> {
        if state.valid_tokens.contains(token.value()) {
            Ok(())
        } else {
            Err(CatalogError::AuthExpired)
        }
    }
}

#[async_trait]
impl TableCatalog for MemoryCatalog {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<AccessToken, CatalogError> {
        let mut state = self.state();
        state.auth_calls += 1;
        if state.reject_credentials {
            return Err(CatalogError::Unauthorized {
                message: "credentials rejected".to_string(),
            });
        }
        state.issued_tokens += 1;
        let value = format!("memory-token-{}", state.issued_tokens);
        state.valid_tokens.insert(value.clone());
        Ok(AccessToken::non_expiring(value))
    }

    async fn get_schema(
        &self,
        token: &AccessToken,
        table: &str,
    ) -> Result<Option<TableSchema>, CatalogError> {
        let state = self.state();
        Self::check_token(&state, token)?;
        Ok(state.tables.get(table).map(|t| t.schema.clone()))
    }

    async fn widen_schema(
        &self,
        token: &AccessToken,
        table: &str,
        columns: &[Column],
    ) -> Result<TableSchema, CatalogError> {
        let mut state = self.state();
        Self::check_token(&state, token)?;
        let entry = state.tables.entry(table.to_string()).or_default();
        entry.schema = entry.schema.widened(columns);
        Ok(entry.schema.clone())
    }

    async fn append_rows(
        &self,
        token: &AccessToken,
        table: &str,
        batch: &ReconciledBatch,
    ) -> Result<AppendOutcome, CatalogError> {
        let gate = self.state().append_gate.clone();
        let _permit = match &gate {
            Some(gate) => Some(gate.acquire().await.map_err(|_| CatalogError::Transient {
                message: "append gate closed".to_string(),
            })?),
            None => None,
        };

        let mut state = self.state();
        Self::check_token(&state, token)?;
        state.append_calls += 1;
        let call = state.append_calls;
        if let Some(failure) = state.failures.remove(&call) {
            return Err(failure.into_error(call));
        }

        let Some(entry) = state.tables.get_mut(table) else {
            return Err(CatalogError::UnknownTable {
                table: table.to_string(),
            });
        };

        for column in batch.schema.columns() {
            match entry.schema.get(&column.name) {
                Some(existing) if existing.column_type.accepts(column.column_type) => {}
                _ => {
                    return Err(CatalogError::Permanent {
                        message: format!(
                            "column '{}' ({}) does not match table '{table}'",
                            column.name, column.column_type
                        ),
                    });
                }
            }
        }

        let mut outcome = AppendOutcome::default();
        for row in &batch.rows {
            let key = batch.key(row);
            if !entry.keys.insert(key.clone()) {
                outcome.rows_deduplicated += 1;
                continue;
            }
            let values = batch
                .schema
                .columns()
                .iter()
                .map(|column| column.name.clone())
                .zip(row.values.iter().cloned())
                .collect();
            entry.rows.push(StoredRow { key, values });
            outcome.rows_written += 1;
        }

        Ok(outcome)
    }
}
