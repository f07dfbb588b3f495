//! Identity-table loading
//!
//! When identity resolution is enabled for a destination, the merge-rules
//! and mappings tables are loaded by a dedicated stage: resolve merge rules
//! first (unless this upload already generated load files for both tables),
//! then sync and load each table through the destination-specific driver
//! calls. Each table's load-file state is checked independently via its own
//! recorded location.

use crate::metrics;
use crate::schema_registry::SchemaRegistry;
use crate::table_loader::apply_table_schema_diff;
use crate::warehouse_manager::WarehouseManager;
use crate::Result;
use async_trait::async_trait;
use granary_core::state_machine::TableStage;
use granary_core::warehouse::Warehouse;
use granary_storage::{UploadModel, UploadStore};
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Resolves identity merge rules into the mappings table before the two
/// identity tables are loaded. Implemented by the identity-resolution
/// subsystem; the orchestrator only sequences the calls.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self) -> Result<()>;

    /// Rebuild mappings from the full history rather than this upload's
    /// batch. Requested explicitly by operators.
    async fn resolve_historic_identities(&self) -> Result<()>;
}

/// Loads the identity merge-rules/mappings pair for one upload
pub(crate) struct IdentityLoader {
    store: Arc<dyn UploadStore>,
    manager: Arc<dyn WarehouseManager>,
    registry: Arc<SchemaRegistry>,
    warehouse: Warehouse,
    upload: Arc<UploadModel>,
    resolver: Option<Arc<dyn IdentityResolver>>,
}

impl IdentityLoader {
    pub(crate) fn new(
        store: Arc<dyn UploadStore>,
        manager: Arc<dyn WarehouseManager>,
        registry: Arc<SchemaRegistry>,
        warehouse: Warehouse,
        upload: Arc<UploadModel>,
        resolver: Option<Arc<dyn IdentityResolver>>,
    ) -> Self {
        Self {
            store,
            manager,
            registry,
            warehouse,
            upload,
            resolver,
        }
    }

    /// Load the merge-rules and mappings tables, resolving identities first
    /// when their load files have not been generated yet. Returns collected
    /// error messages; empty means the stage succeeded.
    #[instrument(skip_all, fields(upload_id = %self.upload.id))]
    pub(crate) async fn load_identity_tables(&self, populate_historic: bool) -> Vec<String> {
        let merge_rules = self.warehouse.identity_merge_rules_table();
        let mappings = self.warehouse.identity_mappings_table();

        let generated = match self.load_files_generated(&merge_rules, &mappings).await {
            Ok(generated) => generated,
            Err(e) => return vec![e.to_string()],
        };

        if !generated {
            if let Some(resolver) = &self.resolver {
                info!(
                    warehouse = %self.warehouse.identifier(),
                    historic = populate_historic,
                    "Resolving identities before identity-table load"
                );
                let resolved = if populate_historic {
                    resolver.resolve_historic_identities().await
                } else {
                    resolver.resolve().await
                };
                if let Err(e) = resolved {
                    error!(error = %e, "Identity resolution failed");
                    if let Err(store_err) = self
                        .store
                        .set_table_upload_error(
                            self.upload.id,
                            &merge_rules,
                            TableStage::ExportingDataFailed,
                            &e.to_string(),
                        )
                        .await
                    {
                        return vec![e.to_string(), store_err.to_string()];
                    }
                    return vec![e.to_string()];
                }
            }
        }

        let mut errors = Vec::new();
        let mut altered_schema = false;
        for table in [&merge_rules, &mappings] {
            match self.load_identity_table(table, &merge_rules).await {
                Ok(altered) => altered_schema = altered_schema || altered,
                Err(e) => {
                    errors.push(e.to_string());
                    break;
                }
            }
        }

        if altered_schema {
            let warehouse_schema = self.registry.warehouse_schema();
            if let Err(e) = self
                .store
                .update_local_schema(&self.warehouse, &warehouse_schema)
                .await
            {
                errors.push(e.to_string());
            }
        }

        errors
    }

    /// Sync and load one identity table unless already loaded. Returns
    /// whether the warehouse schema was altered.
    async fn load_identity_table(&self, table: &str, merge_rules: &str) -> Result<bool> {
        let table_upload = self.store.get_table_upload(self.upload.id, table).await?;
        if table_upload.status == TableStage::ExportedData.as_str() {
            return Ok(false);
        }

        let mut altered = false;
        match apply_table_schema_diff(self.manager.as_ref(), self.registry.as_ref(), table).await {
            Ok(true) => {
                self.store
                    .set_table_upload_status(self.upload.id, table, TableStage::UpdatedSchema)
                    .await?;
                altered = true;
            }
            Ok(false) => {}
            Err(e) => {
                self.store
                    .set_table_upload_error(
                        self.upload.id,
                        table,
                        TableStage::UpdatingSchemaFailed,
                        &e.to_string(),
                    )
                    .await?;
                return Err(e);
            }
        }

        self.store
            .set_table_upload_status(self.upload.id, table, TableStage::Executing)
            .await?;

        let loaded = if table == merge_rules {
            self.manager.load_identity_merge_rules_table().await
        } else {
            self.manager.load_identity_mappings_table().await
        };
        if let Err(e) = loaded {
            self.store
                .set_table_upload_error(
                    self.upload.id,
                    table,
                    TableStage::ExportingDataFailed,
                    &e.to_string(),
                )
                .await?;
            return Err(e);
        }

        self.store
            .set_table_upload_status(self.upload.id, table, TableStage::ExportedData)
            .await?;
        if let Some(events) = self
            .store
            .get_table_upload(self.upload.id, table)
            .await
            .ok()
            .and_then(|t| t.total_events)
        {
            metrics::TABLE_EVENTS_LOADED_TOTAL
                .with_label_values(&[self.warehouse.destination_type.as_str()])
                .inc_by(events.max(0) as u64);
        }
        Ok(altered)
    }

    /// Whether this upload already generated load files for both identity
    /// tables, judged by each table's own recorded location.
    async fn load_files_generated(&self, merge_rules: &str, mappings: &str) -> Result<bool> {
        for table in [merge_rules, mappings] {
            let location = self.store.table_upload_location(self.upload.id, table).await?;
            if location.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
