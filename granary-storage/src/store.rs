//! The `UploadStore` trait: every persisted operation the upload pipeline
//! performs, behind a seam so the orchestrator can run against Postgres in
//! production and an in-memory double in tests.

use crate::models::{TableUploadModel, TableUploadStatus, UploadColumn, UploadModel};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use granary_core::schema::Schema;
use granary_core::state_machine::{StagingFileStatus, TableStage};
use granary_core::warehouse::Warehouse;

/// Identifies the load files belonging to one table of one upload: the
/// upload's routing keys plus its closed load-file id interval.
#[derive(Debug, Clone)]
pub struct LoadFileScope {
    pub source_id: String,
    pub destination_id: String,
    pub table_name: String,
    pub start_load_file_id: i64,
    pub end_load_file_id: i64,
}

impl LoadFileScope {
    /// Scope for `table` within `upload`'s recorded load-file range.
    pub fn for_table(upload: &UploadModel, table: &str) -> Self {
        Self {
            source_id: upload.source_id.clone(),
            destination_id: upload.destination_id.clone(),
            table_name: table.to_string(),
            start_load_file_id: upload.start_load_file_id,
            end_load_file_id: upload.end_load_file_id,
        }
    }
}

/// Persistence operations for upload pipeline state.
///
/// All operations are durable once they return. Errors from this trait are
/// non-recoverable for the running job: the orchestrator surfaces them as an
/// internal processing failure rather than a stage failure.
#[async_trait]
pub trait UploadStore: Send + Sync {
    // ---- uploads ----

    async fn get_upload(&self, id: i64) -> Result<UploadModel>;

    /// Write `status`, append exactly one timings entry `{status: now}`,
    /// touch `updated_at`, and apply `extra` columns, atomically.
    async fn set_upload_status(
        &self,
        id: i64,
        status: &str,
        extra: Vec<UploadColumn>,
    ) -> Result<()>;

    /// Parameterised column update; rejects columns outside the updatable
    /// allow-list.
    async fn set_upload_columns(&self, id: i64, columns: Vec<UploadColumn>) -> Result<()>;

    async fn set_upload_schema(&self, id: i64, schema: &Schema) -> Result<()>;

    /// Record the closed load-file interval. Tolerant of being re-set with
    /// the same values on stage re-run.
    async fn set_load_file_ids(&self, id: i64, start: i64, end: i64) -> Result<()>;

    /// Record a stage failure: append `message` under `journal_key`,
    /// increment that stage's attempt counter, write `failure_status` (or
    /// `aborted` when the retry policy is exhausted) and the advisory
    /// `nextRetryTime` metadata. Returns the status actually written.
    async fn set_upload_error(
        &self,
        id: i64,
        journal_key: &str,
        failure_status: &str,
        message: &str,
    ) -> Result<String>;

    /// Timestamp of the first timings entry, if any.
    async fn first_attempt_time(&self, id: i64) -> Result<Option<DateTime<Utc>>>;

    // ---- table uploads ----

    /// Create one `waiting` row per table. Idempotent: rows that already
    /// exist for `(upload_id, table)` are left untouched.
    async fn create_table_uploads(&self, upload_id: i64, tables: &[String]) -> Result<()>;

    async fn get_table_upload(&self, upload_id: i64, table: &str) -> Result<TableUploadModel>;

    /// Write the table status; entering `executing` also records
    /// `last_exec_time`.
    async fn set_table_upload_status(
        &self,
        upload_id: i64,
        table: &str,
        status: TableStage,
    ) -> Result<()>;

    async fn set_table_upload_error(
        &self,
        upload_id: i64,
        table: &str,
        status: TableStage,
        error: &str,
    ) -> Result<()>;

    async fn set_table_upload_total_events(
        &self,
        upload_id: i64,
        table: &str,
        total_events: i64,
    ) -> Result<()>;

    /// Record one load-file URI as the table's representative location.
    async fn set_table_upload_location(
        &self,
        upload_id: i64,
        table: &str,
        location: &str,
    ) -> Result<()>;

    async fn table_upload_location(&self, upload_id: i64, table: &str) -> Result<Option<String>>;

    /// Table statuses of every non-terminal upload up to and including
    /// `upload_id` for the same `(destination, namespace)`, restricted to
    /// tables that appear in the current upload. Ordered by upload id.
    async fn pending_table_statuses(
        &self,
        upload_id: i64,
        destination_id: &str,
        namespace: &str,
    ) -> Result<Vec<TableUploadStatus>>;

    // ---- staging files ----

    async fn set_staging_files_status(
        &self,
        ids: &[i64],
        status: StagingFileStatus,
        error: Option<&str>,
    ) -> Result<()>;

    // ---- load files ----

    async fn has_load_files(&self, scope: &LoadFileScope) -> Result<bool>;

    /// Sum of events across the latest load file per staging file in scope.
    async fn total_events_in_load_files(&self, scope: &LoadFileScope) -> Result<i64>;

    /// Locations of the latest load file per staging file in scope.
    async fn load_file_locations(&self, scope: &LoadFileScope) -> Result<Vec<String>>;

    // ---- warehouse schema cache ----

    /// Last known warehouse schema for this namespace; empty when never
    /// cached.
    async fn local_schema(&self, warehouse: &Warehouse) -> Result<Schema>;

    async fn update_local_schema(&self, warehouse: &Warehouse, schema: &Schema) -> Result<()>;
}
