//! The upload job: one crash-resumable run of the upload state machine
//!
//! A job owns one upload row and drives it stage by stage: consolidate the
//! staging-file schemas, record table uploads, fan staging files out to the
//! load-file workers, sync the remote schema, then load identity, user and
//! remaining tables under the per-destination parallelism cap. Every stage
//! persists an in-progress label before its work and a completed or failed
//! label after it, so a crashed job resumes by re-running the stage it died
//! in. Stage work is idempotent by construction.

use crate::config::UploadConfig;
use crate::identity::{IdentityLoader, IdentityResolver};
use crate::load_files::LoadFileBuilder;
use crate::metrics;
use crate::notifier::Notifier;
use crate::schema_registry::SchemaRegistry;
use crate::table_loader::{apply_table_schema_diff, TableLoader};
use crate::warehouse_manager::{Uploader, WarehouseManager};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use granary_core::schema::{Schema, TableSchema};
use granary_core::state_machine::{
    TableStage, UploadStage, ABORTED, FETCHING_REMOTE_SCHEMA_FAILED, INTERNAL_PROCESSING_FAILED,
};
use granary_core::warehouse::Warehouse;
use granary_storage::models::UPLOAD_LAST_EXEC_AT_COLUMN;
use granary_storage::{
    ColumnValue, LoadFileScope, StagingFileModel, UploadColumn, UploadModel, UploadStore,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

/// Collaborators and state for one upload job
pub struct UploadJobContext {
    pub upload: UploadModel,
    pub warehouse: Warehouse,
    pub staging_files: Vec<StagingFileModel>,
    pub store: Arc<dyn UploadStore>,
    pub manager: Arc<dyn WarehouseManager>,
    pub notifier: Arc<dyn Notifier>,
    pub resolver: Option<Arc<dyn IdentityResolver>>,
    pub config: UploadConfig,
    /// Rebuild identity mappings from full history instead of this batch
    pub populate_historic_identities: bool,
}

/// One run of the upload state machine.
///
/// The job is handed exclusive ownership of its upload row by the upstream
/// scheduler; nothing else mutates the row while the job runs.
pub struct UploadJob {
    upload: Mutex<UploadModel>,
    warehouse: Warehouse,
    staging_files: Vec<StagingFileModel>,
    store: Arc<dyn UploadStore>,
    manager: Arc<dyn WarehouseManager>,
    notifier: Arc<dyn Notifier>,
    resolver: Option<Arc<dyn IdentityResolver>>,
    registry: Arc<SchemaRegistry>,
    config: UploadConfig,
    populate_historic_identities: bool,
}

impl UploadJob {
    pub fn new(ctx: UploadJobContext) -> Arc<Self> {
        Arc::new(Self {
            upload: Mutex::new(ctx.upload),
            warehouse: ctx.warehouse,
            staging_files: ctx.staging_files,
            store: ctx.store,
            manager: ctx.manager,
            notifier: ctx.notifier,
            resolver: ctx.resolver,
            registry: Arc::new(SchemaRegistry::new()),
            config: ctx.config,
            populate_historic_identities: ctx.populate_historic_identities,
        })
    }

    fn upload(&self) -> MutexGuard<'_, UploadModel> {
        self.upload.lock().expect("upload state lock poisoned")
    }

    fn upload_id(&self) -> i64 {
        self.upload().id
    }

    /// Run the job to completion, a retryable stage failure, or abort.
    #[instrument(
        skip(self),
        fields(
            upload_id = %self.upload_id(),
            warehouse = %self.warehouse.identifier(),
        )
    )]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let started = Instant::now();
        let destination_type = self.warehouse.destination_type.as_str();

        let _watchdog = LongRunningWatchdog::arm(
            self.config.long_running_upload_threshold,
            self.upload_id(),
            self.warehouse.identifier(),
            destination_type.to_string(),
        );

        let result = Arc::clone(&self).execute().await;

        metrics::UPLOAD_DURATION_SECONDS
            .with_label_values(&[destination_type])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn execute(self: Arc<Self>) -> Result<()> {
        let upload_id = self.upload_id();

        // Recorded before anything else so scheduling upstream can tell the
        // job started.
        self.store
            .set_upload_columns(
                upload_id,
                vec![UploadColumn::new(
                    UPLOAD_LAST_EXEC_AT_COLUMN,
                    ColumnValue::Timestamp(Utc::now()),
                )],
            )
            .await?;

        if self.staging_files.is_empty() {
            let err = Error::InternalProcessing("no staging files found".to_string());
            self.record_failure(INTERNAL_PROCESSING_FAILED, INTERNAL_PROCESSING_FAILED, &err)
                .await?;
            return Err(err);
        }

        let schema_changed = match self
            .registry
            .sync_remote(self.manager.as_ref(), self.store.as_ref(), &self.warehouse)
            .await
        {
            Ok(changed) => changed,
            Err(e) => {
                self.record_failure(
                    FETCHING_REMOTE_SCHEMA_FAILED,
                    FETCHING_REMOTE_SCHEMA_FAILED,
                    &e,
                )
                .await?;
                return Err(e);
            }
        };
        if schema_changed {
            info!(warehouse = %self.warehouse.identifier(), "Remote warehouse schema changed");
        }

        // May be empty on a first run; filled by the first stage.
        let known_schema = self.upload().schema.0.clone();
        self.registry.set_upload_schema(known_schema);

        let uploader: Arc<dyn Uploader> = Arc::clone(&self) as Arc<dyn Uploader>;
        if let Err(e) = self.manager.setup(&self.warehouse, uploader).await {
            let err = Error::InternalProcessing(e.to_string());
            self.record_failure(INTERNAL_PROCESSING_FAILED, INTERNAL_PROCESSING_FAILED, &err)
                .await?;
            return Err(err);
        }

        let result = Arc::clone(&self).run_stages(schema_changed).await;
        self.manager.cleanup().await;
        result
    }

    async fn run_stages(self: Arc<Self>, schema_changed: bool) -> Result<()> {
        let upload_id = self.upload_id();
        let destination_type = self.warehouse.destination_type.as_str();

        // A changed remote schema invalidates everything derived from it;
        // restart from the first productive stage.
        let mut stage = if schema_changed {
            UploadStage::first_productive()
        } else {
            let status = self.upload().status.clone();
            UploadStage::next_stage_for_status(&status)
                .unwrap_or_else(UploadStage::first_productive)
        };

        loop {
            let in_progress = stage
                .in_progress_label()
                .ok_or_else(|| Error::InvalidState(format!("{:?} is not runnable", stage)))?;
            self.set_status(in_progress).await?;
            debug!(upload_id, stage = in_progress, "Entering upload stage");

            match self.execute_stage(stage).await {
                Ok(()) => {
                    self.set_status(stage.completed_label()).await?;
                    if stage == UploadStage::ExportedData {
                        metrics::UPLOADS_COMPLETED_TOTAL
                            .with_label_values(&[destination_type])
                            .inc();
                        info!(upload_id, "Upload completed");
                        return Ok(());
                    }
                    stage = stage
                        .next()
                        .ok_or_else(|| Error::InvalidState(format!("{:?} has no successor", stage)))?;
                }
                Err(err) => {
                    error!(upload_id, stage = in_progress, error = %err, "Upload stage failed");
                    metrics::STAGE_FAILURES_TOTAL
                        .with_label_values(&[in_progress])
                        .inc();
                    let failed = stage
                        .failed_label()
                        .ok_or_else(|| Error::InvalidState(format!("{:?} has no failed label", stage)))?;
                    self.record_failure(in_progress, failed, &err).await?;
                    return Err(err);
                }
            }
        }
    }

    /// Journal the failure and let the store decide between the retryable
    /// failure status and the terminal abort.
    async fn record_failure(&self, journal_key: &str, failure_status: &str, err: &Error) -> Result<()> {
        let upload_id = self.upload_id();
        let destination_type = self.warehouse.destination_type.as_str();

        let new_status = self
            .store
            .set_upload_error(upload_id, journal_key, failure_status, &err.to_string())
            .await?;
        self.upload().status = new_status.clone();

        metrics::FAILED_UPLOADS_TOTAL
            .with_label_values(&[destination_type])
            .inc();
        if new_status == ABORTED {
            warn!(upload_id, "Upload aborted after exhausting retries");
            metrics::UPLOADS_ABORTED_TOTAL
                .with_label_values(&[destination_type])
                .inc();
        }
        Ok(())
    }

    async fn set_status(&self, status: &str) -> Result<()> {
        self.store
            .set_upload_status(self.upload_id(), status, Vec::new())
            .await?;
        self.upload().status = status.to_string();
        Ok(())
    }

    async fn execute_stage(&self, stage: UploadStage) -> Result<()> {
        match stage {
            UploadStage::GeneratedUploadSchema => self.generate_upload_schema().await,
            UploadStage::CreatedTableUploads => self.create_table_uploads().await,
            UploadStage::GeneratedLoadFiles => self.generate_load_files().await,
            UploadStage::UpdatedTableUploadsCounts => self.update_table_upload_counts().await,
            UploadStage::CreatedRemoteSchema => self.create_remote_schema().await,
            UploadStage::ExportedUserTables => self.export_user_tables().await,
            UploadStage::ExportedIdentities => self.export_identities().await,
            UploadStage::ExportedData => self.export_data().await,
            UploadStage::Waiting | UploadStage::Aborted => {
                Err(Error::InvalidState(format!("{:?} has no unit of work", stage)))
            }
        }
    }

    // ---- stage units of work ----

    async fn generate_upload_schema(&self) -> Result<()> {
        let consolidated = self.registry.consolidate(&self.staging_files);
        self.registry.set_upload_schema(consolidated.clone());
        self.store
            .set_upload_schema(self.upload_id(), &consolidated)
            .await?;
        self.upload().schema = granary_storage::Json(consolidated);
        Ok(())
    }

    async fn create_table_uploads(&self) -> Result<()> {
        let upload_schema = self.registry.upload_schema();
        let mut tables: Vec<String> = upload_schema.keys().cloned().collect();

        // Mappings ride along whenever the batch carries merge rules for an
        // identity-enabled destination, even without mappings rows of its
        // own.
        if self
            .config
            .identity_enabled_for(self.warehouse.destination_type)
        {
            let merge_rules = self.warehouse.identity_merge_rules_table();
            let mappings = self.warehouse.identity_mappings_table();
            if upload_schema.contains_key(&merge_rules) && !upload_schema.contains_key(&mappings) {
                tables.push(mappings);
            }
        }

        self.store
            .create_table_uploads(self.upload_id(), &tables)
            .await?;
        Ok(())
    }

    async fn generate_load_files(&self) -> Result<()> {
        let started = Instant::now();
        let upload_snapshot = self.upload().clone();
        let upload_schema = self.registry.upload_schema();

        let builder = LoadFileBuilder::new(
            Arc::clone(&self.store),
            Arc::clone(&self.notifier),
            self.config.publish_batch_size,
        );
        let load_file_ids = builder
            .create_load_files(
                &upload_snapshot,
                &self.warehouse,
                &upload_schema,
                &self.staging_files,
            )
            .await?;

        let (Some(&start), Some(&end)) = (load_file_ids.first(), load_file_ids.last()) else {
            return Err(Error::NoLoadFilesGenerated);
        };
        self.store
            .set_load_file_ids(self.upload_id(), start, end)
            .await?;
        {
            let mut upload = self.upload();
            upload.start_load_file_id = start;
            upload.end_load_file_id = end;
        }

        metrics::LOAD_FILE_GENERATION_DURATION_SECONDS
            .with_label_values(&[self.warehouse.destination_type.as_str()])
            .observe(started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn update_table_upload_counts(&self) -> Result<()> {
        let upload_snapshot = self.upload().clone();
        for table in self.registry.upload_schema().keys() {
            let scope = LoadFileScope::for_table(&upload_snapshot, table);
            let total_events = self.store.total_events_in_load_files(&scope).await?;
            self.store
                .set_table_upload_total_events(upload_snapshot.id, table, total_events)
                .await?;
            if let Some(location) = self.store.load_file_locations(&scope).await?.first() {
                self.store
                    .set_table_upload_location(upload_snapshot.id, table, location)
                    .await?;
            }
        }
        Ok(())
    }

    async fn create_remote_schema(&self) -> Result<()> {
        if self.registry.warehouse_schema_is_empty() {
            info!(warehouse = %self.warehouse.identifier(), "Creating remote schema");
            self.manager.create_schema().await?;
        }
        Ok(())
    }

    async fn export_user_tables(&self) -> Result<()> {
        let upload_schema = self.registry.upload_schema();
        let identifies = self.warehouse.identifies_table();
        if !upload_schema.contains_key(&identifies) {
            return Ok(());
        }
        let users = self.warehouse.users_table();
        let upload_id = self.upload_id();
        let upload_snapshot = self.upload().clone();

        // Load only when at least one of the pair has load files and is not
        // already exported; re-runs of the stage must not reload.
        let mut should_load = false;
        for table in [&identifies, &users] {
            let loaded = match self.store.get_table_upload(upload_id, table).await {
                Ok(table_upload) => table_upload.status == TableStage::ExportedData.as_str(),
                Err(granary_storage::Error::NotFound(_)) => false,
                Err(e) => return Err(e.into()),
            };
            let scope = LoadFileScope::for_table(&upload_snapshot, table);
            if !loaded && self.store.has_load_files(&scope).await? {
                should_load = true;
                break;
            }
        }
        if !should_load {
            return Ok(());
        }

        let started = Instant::now();
        let mut altered_schema = false;
        for table in [&identifies, &users] {
            match apply_table_schema_diff(self.manager.as_ref(), self.registry.as_ref(), table).await
            {
                Ok(altered) => altered_schema = altered_schema || altered,
                Err(e) => {
                    self.set_table_error_if_exists(table, TableStage::UpdatingSchemaFailed, &e)
                        .await;
                    return Err(e);
                }
            }
        }

        let results = self.manager.load_user_tables().await;

        if altered_schema {
            let warehouse_schema = self.registry.warehouse_schema();
            self.store
                .update_local_schema(&self.warehouse, &warehouse_schema)
                .await?;
        }

        let mut errors = Vec::new();
        for (table, load_error) in results {
            match load_error {
                Some(message) => {
                    self.set_table_error_if_exists(
                        &table,
                        TableStage::ExportingDataFailed,
                        &Error::Warehouse(message.clone()),
                    )
                    .await;
                    errors.push(message);
                }
                None => {
                    match self
                        .store
                        .set_table_upload_status(upload_id, &table, TableStage::ExportedData)
                        .await
                    {
                        Ok(()) => {
                            if let Some(events) = self
                                .store
                                .get_table_upload(upload_id, &table)
                                .await
                                .ok()
                                .and_then(|t| t.total_events)
                            {
                                metrics::TABLE_EVENTS_LOADED_TOTAL
                                    .with_label_values(&[self.warehouse.destination_type.as_str()])
                                    .inc_by(events.max(0) as u64);
                            }
                        }
                        Err(granary_storage::Error::NotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        metrics::TABLE_GROUP_LOAD_DURATION_SECONDS
            .with_label_values(&["user"])
            .observe(started.elapsed().as_secs_f64());

        if errors.is_empty() {
            Ok(())
        } else {
            errors.sort();
            Err(Error::TableLoads(errors.join("; ")))
        }
    }

    async fn export_identities(&self) -> Result<()> {
        if !self.config.id_resolution_enabled
            || !self
                .config
                .identity_enabled_for(self.warehouse.destination_type)
        {
            return Ok(());
        }
        let merge_rules = self.warehouse.identity_merge_rules_table();
        if !self.registry.upload_schema().contains_key(&merge_rules) {
            return Ok(());
        }

        let started = Instant::now();
        let loader = IdentityLoader::new(
            Arc::clone(&self.store),
            Arc::clone(&self.manager),
            Arc::clone(&self.registry),
            self.warehouse.clone(),
            Arc::new(self.upload().clone()),
            self.resolver.clone(),
        );
        let errors = loader
            .load_identity_tables(self.populate_historic_identities)
            .await;

        metrics::TABLE_GROUP_LOAD_DURATION_SECONDS
            .with_label_values(&["identity"])
            .observe(started.elapsed().as_secs_f64());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::TableLoads(errors.join("; ")))
        }
    }

    async fn export_data(&self) -> Result<()> {
        let upload_id = self.upload_id();

        // Identity and user tables were handled by the earlier stages.
        let mut skip: HashSet<String> = HashSet::from([
            self.warehouse.identifies_table(),
            self.warehouse.users_table(),
            self.warehouse.identity_merge_rules_table(),
            self.warehouse.identity_mappings_table(),
        ]);
        let (previously_failed, current_succeeded) = self.tables_to_skip().await?;
        skip.extend(previously_failed.iter().cloned());
        skip.extend(current_succeeded);

        let started = Instant::now();
        let loader = TableLoader::new(
            Arc::clone(&self.store),
            Arc::clone(&self.manager),
            Arc::clone(&self.registry),
            self.warehouse.clone(),
            Arc::new(self.upload().clone()),
            self.config.clone(),
        );
        let mut errors = loader.load_all_tables_except(&skip).await;

        // A table still failing in an earlier upload to this namespace must
        // keep this upload from completing, or the cross-upload ordering of
        // its rows would be lost.
        if !previously_failed.is_empty() {
            let mut names: Vec<String> = previously_failed.into_iter().collect();
            names.sort();
            errors.push(format!(
                "skipping the following tables because they failed previously: [{}]",
                names.join(", ")
            ));
        }

        metrics::TABLE_GROUP_LOAD_DURATION_SECONDS
            .with_label_values(&["other"])
            .observe(started.elapsed().as_secs_f64());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::TableLoads(errors.join("; ")))
        }
    }

    /// Tables to exclude from the final fan-out: tables still failing in an
    /// earlier non-terminal upload to this namespace, and tables this
    /// upload already exported on a previous attempt.
    async fn tables_to_skip(&self) -> Result<(HashSet<String>, HashSet<String>)> {
        let upload = self.upload().clone();
        let statuses = self
            .store
            .pending_table_statuses(upload.id, &upload.destination_id, &upload.namespace)
            .await?;

        let mut previously_failed = HashSet::new();
        let mut current_succeeded = HashSet::new();
        for status in statuses {
            if status.upload_id < upload.id
                && status.status == TableStage::ExportingDataFailed.as_str()
            {
                previously_failed.insert(status.table_name.clone());
            }
            if status.upload_id == upload.id && status.status == TableStage::ExportedData.as_str() {
                current_succeeded.insert(status.table_name);
            }
        }
        Ok((previously_failed, current_succeeded))
    }

    /// Best-effort per-table error write; absent rows (e.g. a users table
    /// outside the upload schema) are ignored.
    async fn set_table_error_if_exists(&self, table: &str, status: TableStage, err: &Error) {
        match self
            .store
            .set_table_upload_error(self.upload_id(), table, status, &err.to_string())
            .await
        {
            Ok(()) | Err(granary_storage::Error::NotFound(_)) => {}
            Err(e) => warn!(table = %table, error = %e, "Failed to record table error"),
        }
    }
}

#[async_trait]
impl Uploader for UploadJob {
    fn schema_in_warehouse(&self) -> Schema {
        self.registry.warehouse_schema()
    }

    fn table_schema_in_warehouse(&self, table: &str) -> TableSchema {
        self.registry.table_schema_in_warehouse(table)
    }

    fn table_schema_in_upload(&self, table: &str) -> TableSchema {
        self.registry.table_schema_in_upload(table)
    }

    async fn load_file_locations(&self, table: &str) -> Result<Vec<String>> {
        let upload = self.upload().clone();
        let scope = LoadFileScope::for_table(&upload, table);
        Ok(self.store.load_file_locations(&scope).await?)
    }

    async fn sample_load_file_location(&self, table: &str) -> Result<String> {
        self.load_file_locations(table)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("sample load file for table {}", table)))
    }

    async fn single_load_file_location(&self, table: &str) -> Result<String> {
        self.store
            .table_upload_location(self.upload_id(), table)
            .await?
            .ok_or_else(|| Error::NotFound(format!("load file location for table {}", table)))
    }
}

/// Fires the long-running-upload metric once if the job outlives the
/// threshold. Cancelled on drop; never affects the job's outcome.
struct LongRunningWatchdog {
    cancel: Option<oneshot::Sender<()>>,
}

impl LongRunningWatchdog {
    fn arm(
        threshold: std::time::Duration,
        upload_id: i64,
        identifier: String,
        destination_type: String,
    ) -> Self {
        let (cancel, cancelled) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled => {}
                _ = tokio::time::sleep(threshold) => {
                    warn!(upload_id, warehouse = %identifier, "Long running upload");
                    metrics::LONG_RUNNING_UPLOADS_TOTAL
                        .with_label_values(&[&destination_type])
                        .inc();
                }
            }
        });
        Self { cancel: Some(cancel) }
    }
}

impl Drop for LongRunningWatchdog {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}
