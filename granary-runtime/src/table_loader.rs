//! Bounded-parallel per-table loading
//!
//! Each table of the upload schema is synced against the live warehouse
//! schema and loaded through the destination driver, with in-flight tables
//! bounded by a per-destination semaphore. The loader never fails fast: it
//! awaits every dispatched table and returns the full error list.

use crate::config::UploadConfig;
use crate::metrics;
use crate::schema_registry::SchemaRegistry;
use crate::warehouse_manager::WarehouseManager;
use crate::Result;
use granary_core::state_machine::TableStage;
use granary_core::warehouse::Warehouse;
use granary_storage::{LoadFileScope, UploadModel, UploadStore};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Apply the schema diff of one table to the warehouse: create the table,
/// or add the missing columns and widen promoted string columns. On success
/// the registry's warehouse snapshot absorbs the change. Returns whether
/// anything was altered.
pub(crate) async fn apply_table_schema_diff(
    manager: &dyn WarehouseManager,
    registry: &SchemaRegistry,
    table: &str,
) -> Result<bool> {
    let diff = registry.table_diff(table);
    if !diff.exists {
        return Ok(false);
    }

    if diff.table_to_be_created {
        info!(table = %table, "Creating table in warehouse");
        manager.create_table(table, &diff.column_map).await?;
    } else {
        for (column, column_type) in &diff.column_map {
            debug!(table = %table, column = %column, "Adding column in warehouse");
            manager.add_column(table, column, column_type).await?;
        }
        for column in &diff.string_columns_to_be_altered_to_text {
            debug!(table = %table, column = %column, "Widening string column to text");
            manager.alter_column(table, column, "text").await?;
        }
    }

    registry.set_updated_table_schema(table, diff.updated_schema);
    Ok(true)
}

/// Drives loading across the tables of one upload
#[derive(Clone)]
pub(crate) struct TableLoader {
    store: Arc<dyn UploadStore>,
    manager: Arc<dyn WarehouseManager>,
    registry: Arc<SchemaRegistry>,
    warehouse: Warehouse,
    upload: Arc<UploadModel>,
    config: UploadConfig,
}

impl TableLoader {
    pub(crate) fn new(
        store: Arc<dyn UploadStore>,
        manager: Arc<dyn WarehouseManager>,
        registry: Arc<SchemaRegistry>,
        warehouse: Warehouse,
        upload: Arc<UploadModel>,
        config: UploadConfig,
    ) -> Self {
        Self {
            store,
            manager,
            registry,
            warehouse,
            upload,
            config,
        }
    }

    /// Load every table of the upload schema not in `skip`.
    ///
    /// Tables without load files in the upload's range are skipped (and
    /// marked exported when on the always-mark-exported allow-list). Always
    /// awaits every dispatched table; returns the collected error messages
    /// rather than failing fast.
    #[instrument(skip_all, fields(upload_id = %self.upload.id, skipped = skip.len()))]
    pub(crate) async fn load_all_tables_except(&self, skip: &HashSet<String>) -> Vec<String> {
        let upload_schema = self.registry.upload_schema();
        let parallel = self
            .config
            .parallel_loads_for(self.warehouse.destination_type);
        let semaphore = Arc::new(Semaphore::new(parallel));
        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let altered_schema = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for table in upload_schema.keys() {
            if skip.contains(table) {
                continue;
            }

            let scope = LoadFileScope::for_table(&self.upload, table);
            match self.store.has_load_files(&scope).await {
                Err(e) => {
                    push_error(&errors, e.to_string());
                    continue;
                }
                Ok(false) => {
                    if self.config.always_mark_exported.iter().any(|t| t == table) {
                        if let Err(e) = self
                            .store
                            .set_table_upload_status(
                                self.upload.id,
                                table,
                                TableStage::ExportedData,
                            )
                            .await
                        {
                            push_error(&errors, e.to_string());
                        }
                    }
                    continue;
                }
                Ok(true) => {}
            }

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .expect("table load semaphore closed unexpectedly");
            let loader = self.clone();
            let table = table.clone();
            let errors = Arc::clone(&errors);
            let altered_schema = Arc::clone(&altered_schema);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                match loader.load_table(&table).await {
                    Ok(altered) => {
                        if altered {
                            altered_schema.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(e) => push_error(&errors, e.to_string()),
                }
            }));
        }

        for handle in handles {
            if handle.await.is_err() {
                push_error(&errors, "table load task panicked".to_string());
            }
        }

        // One snapshot persist after the fan-in, not one per table.
        if altered_schema.load(Ordering::SeqCst) {
            let warehouse_schema = self.registry.warehouse_schema();
            if let Err(e) = self
                .store
                .update_local_schema(&self.warehouse, &warehouse_schema)
                .await
            {
                push_error(&errors, e.to_string());
            }
        }

        let errors = errors.lock().expect("table load error lock poisoned");
        errors.clone()
    }

    /// Sync the table's schema and load it. Returns whether the warehouse
    /// schema was altered for this table.
    async fn load_table(&self, table: &str) -> Result<bool> {
        let altered = match apply_table_schema_diff(
            self.manager.as_ref(),
            self.registry.as_ref(),
            table,
        )
        .await
        {
            Ok(altered) => altered,
            Err(e) => {
                warn!(table = %table, error = %e, "Schema update failed");
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
        };

        info!(
            table = %table,
            warehouse = %self.warehouse.identifier(),
            "Starting table load"
        );
        self.store
            .set_table_upload_status(self.upload.id, table, TableStage::Executing)
            .await?;

        if let Err(e) = self.manager.load_table(table).await {
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
        if let Ok(table_upload) = self.store.get_table_upload(self.upload.id, table).await {
            if let Some(events) = table_upload.total_events {
                metrics::TABLE_EVENTS_LOADED_TOTAL
                    .with_label_values(&[self.warehouse.destination_type.as_str()])
                    .inc_by(events.max(0) as u64);
            }
        }
        Ok(altered)
    }
}

fn push_error(errors: &Arc<Mutex<Vec<String>>>, message: String) {
    errors
        .lock()
        .expect("table load error lock poisoned")
        .push(message);
}
