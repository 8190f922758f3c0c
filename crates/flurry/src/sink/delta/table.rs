//! Delta table lifecycle: open, create, evolve and commit.

use std::collections::HashMap;

use deltalake::arrow::datatypes::Schema;
use deltalake::kernel::Action;
use deltalake::operations::create::CreateBuilder;
use deltalake::protocol::{DeltaOperation, SaveMode};
use deltalake::{DeltaTable, DeltaTableError};
use tracing::info;
use url::Url;

use flurry_core::StorageProvider;

use crate::error::CatalogError;

/// Ensure Delta Lake cloud storage handlers are registered.
///
/// This is idempotent.
pub fn ensure_handlers_registered() {
    deltalake::aws::register_handlers(None);
    deltalake::gcp::register_handlers(None);
}

/// Map a Delta error onto the catalog error taxonomy.
///
/// Storage failures and commit conflicts are transient; the retry loop
/// reloads the table and tries again.
pub fn classify(err: DeltaTableError) -> CatalogError {
    let message = err.to_string();
    match err {
        DeltaTableError::ObjectStore { source } => match source {
            object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. } => CatalogError::Unauthorized { message },
            object_store::Error::NotFound { .. } | object_store::Error::InvalidPath { .. } => {
                CatalogError::Permanent { message }
            }
            _ => CatalogError::Transient { message },
        },
        DeltaTableError::Io { .. }
        | DeltaTableError::VersionAlreadyExists(_)
        | DeltaTableError::Transaction { .. } => CatalogError::Transient { message },
        _ => CatalogError::Permanent { message },
    }
}

fn table_url(storage: &StorageProvider) -> Result<Url, CatalogError> {
    let table_url = storage.table_url();
    Url::parse(&table_url).map_err(|e| CatalogError::Permanent {
        message: format!("invalid table URL '{table_url}': {e}"),
    })
}

/// Open the table, or `None` if nothing has been written there yet.
pub async fn try_open_table(
    storage: &StorageProvider,
    table_name: &str,
) -> Result<Option<DeltaTable>, CatalogError> {
    ensure_handlers_registered();

    let url = table_url(storage)?;
    match deltalake::open_table_with_storage_options(url, storage.storage_options().clone()).await
    {
        Ok(table) => {
            info!(
                target = %table_name,
                "Opened existing Delta table at version {}",
                table.version().unwrap_or(-1)
            );
            Ok(Some(table))
        }
        Err(DeltaTableError::NotATable(_) | DeltaTableError::InvalidTableLocation(_)) => Ok(None),
        Err(err) => Err(classify(err)),
    }
}

/// Convert an Arrow schema to a Delta schema.
pub fn arrow_schema_to_delta(
    schema: &Schema,
) -> Result<deltalake::kernel::StructType, CatalogError> {
    use deltalake::kernel::engine::arrow_conversion::TryIntoKernel;
    use deltalake::kernel::{DataType as DeltaType, StructField, StructType};

    let fields: Vec<StructField> = schema
        .fields()
        .iter()
        .map(|field| {
            let delta_type: DeltaType =
                field
                    .data_type()
                    .try_into_kernel()
                    .map_err(|e| CatalogError::Permanent {
                        message: format!("unsupported type for '{}': {e}", field.name()),
                    })?;
            Ok(StructField::new(
                field.name(),
                delta_type,
                field.is_nullable(),
            ))
        })
        .collect::<Result<Vec<_>, CatalogError>>()?;

    StructType::try_new(fields).map_err(|e| CatalogError::Permanent {
        message: e.to_string(),
    })
}

/// Arrow schema of the table's current snapshot.
pub fn table_arrow_schema(table: &DeltaTable) -> Result<Schema, CatalogError> {
    use deltalake::kernel::engine::arrow_conversion::TryIntoArrow;

    let snapshot = table.snapshot().map_err(classify)?;
    let schema: Schema =
        snapshot
            .schema()
            .as_ref()
            .try_into_arrow()
            .map_err(|e| CatalogError::Permanent {
                message: format!("failed to convert table schema: {e}"),
            })?;
    Ok(schema)
}

/// Create the table with the given Arrow schema.
pub async fn create_table(
    storage: &StorageProvider,
    schema: &Schema,
    table_name: &str,
) -> Result<DeltaTable, CatalogError> {
    ensure_handlers_registered();

    let url = table_url(storage)?;
    info!(target = %table_name, "Creating new Delta table at {}", url);

    let delta_schema = arrow_schema_to_delta(schema)?;
    CreateBuilder::new()
        .with_location(url.as_str())
        .with_table_name(table_name)
        .with_columns(delta_schema.fields().cloned())
        .with_storage_options(storage.storage_options().clone())
        .await
        .map_err(classify)
}

/// Replace the table schema with `schema`, which must extend the current one.
pub async fn evolve_schema(
    table: &mut DeltaTable,
    schema: &Schema,
    table_name: &str,
) -> Result<i64, CatalogError> {
    use deltalake::kernel::MetadataExt;
    use deltalake::kernel::transaction::CommitBuilder;

    let delta_schema = arrow_schema_to_delta(schema)?;

    let snapshot = table.snapshot().map_err(classify)?;
    let new_metadata = snapshot
        .metadata()
        .clone()
        .with_schema(&delta_schema)
        .map_err(|source| classify(DeltaTableError::Kernel { source }))?;

    let version = CommitBuilder::default()
        .with_actions(vec![Action::Metadata(new_metadata)])
        .build(
            Some(snapshot),
            table.log_store(),
            DeltaOperation::SetTableProperties {
                properties: HashMap::new(),
            },
        )
        .await
        .map_err(classify)?
        .version;

    table.load().await.map_err(classify)?;
    info!(target = %table_name, "Schema evolution committed at version {}", version);

    Ok(version)
}

/// Commit actions as a single append and reload the table.
pub async fn commit_append(
    table: &mut DeltaTable,
    actions: Vec<Action>,
) -> Result<i64, CatalogError> {
    use deltalake::kernel::transaction::CommitBuilder;

    let version = CommitBuilder::default()
        .with_actions(actions)
        .build(
            Some(table.snapshot().map_err(classify)?),
            table.log_store(),
            DeltaOperation::Write {
                mode: SaveMode::Append,
                partition_by: None,
                predicate: None,
            },
        )
        .await
        .map_err(classify)?
        .version;

    table.load().await.map_err(classify)?;
    Ok(version)
}
