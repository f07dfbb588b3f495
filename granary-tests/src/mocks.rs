//! Mock implementations of the upload pipeline's collaborators
//!
//! The in-memory store mirrors the semantics of the Postgres store closely
//! enough to drive full upload-job runs: timings append per status write,
//! stage-keyed error journal with the retry/abort decision, idempotent
//! table-upload creation, and range-scoped load-file queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use granary_core::retry::RetryPolicy;
use granary_core::schema::{Schema, TableSchema};
use granary_core::state_machine::{StagingFileStatus, TableStage, ABORTED};
use granary_core::warehouse::Warehouse;
use granary_runtime::notifier::{
    Notifier, NotifierMessage, NotifierPayload, NotifierResponse, NotifierResult,
    RESPONSE_ABORTED, RESPONSE_SUCCEEDED,
};
use granary_runtime::warehouse_manager::{LoadTableResults, Uploader, WarehouseManager};
use granary_runtime::IdentityResolver;
use granary_storage::models::{format_timing, parse_timing};
use granary_storage::{
    ColumnValue, Json, LoadFileModel, LoadFileScope, StagingFileModel, TableUploadModel,
    TableUploadStatus, UploadColumn, UploadModel, UploadStore,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

type StorageResult<T> = granary_storage::Result<T>;
type RuntimeResult<T> = granary_runtime::Result<T>;

// ---------------------------------------------------------------------------
// In-memory upload store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    uploads: HashMap<i64, UploadModel>,
    table_uploads: HashMap<(i64, String), TableUploadModel>,
    staging_files: HashMap<i64, StagingFileModel>,
    load_files: Vec<LoadFileModel>,
    schemas: HashMap<(String, String, String), Schema>,
    next_table_upload_id: i64,
    next_load_file_id: i64,
}

/// In-memory `UploadStore` for tests
pub struct InMemoryUploadStore {
    state: Mutex<StoreState>,
    retry: RetryPolicy,
}

impl Default for InMemoryUploadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryUploadStore {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(StoreState {
                next_table_upload_id: 1,
                next_load_file_id: 1,
                ..StoreState::default()
            }),
            retry,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("in-memory store lock poisoned")
    }

    // ---- seeding ----

    pub fn insert_upload(&self, upload: UploadModel) {
        self.lock().uploads.insert(upload.id, upload);
    }

    pub fn insert_staging_file(&self, staging_file: StagingFileModel) {
        self.lock()
            .staging_files
            .insert(staging_file.id, staging_file);
    }

    pub fn insert_table_upload(&self, upload_id: i64, table: &str, status: TableStage) {
        let mut state = self.lock();
        let id = state.next_table_upload_id;
        state.next_table_upload_id += 1;
        let now = Utc::now();
        state.table_uploads.insert(
            (upload_id, table.to_string()),
            TableUploadModel {
                id,
                wh_upload_id: upload_id,
                table_name: table.to_string(),
                status: status.as_str().to_string(),
                error: None,
                last_exec_time: None,
                total_events: None,
                location: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// Append one load-file row, as a worker would. Returns its id.
    pub fn push_load_file(
        &self,
        staging_file_id: i64,
        source_id: &str,
        destination_id: &str,
        table: &str,
        total_events: i64,
    ) -> i64 {
        let mut state = self.lock();
        let id = state.next_load_file_id;
        state.next_load_file_id += 1;
        state.load_files.push(LoadFileModel {
            id,
            staging_file_id,
            location: format!("warehouse/{}/{}.csv.gz", table, id),
            source_id: source_id.to_string(),
            destination_id: destination_id.to_string(),
            table_name: table.to_string(),
            total_events,
            created_at: Utc::now(),
        });
        id
    }

    // ---- snapshots for assertions ----

    pub fn upload(&self, id: i64) -> Option<UploadModel> {
        self.lock().uploads.get(&id).cloned()
    }

    pub fn table_upload(&self, upload_id: i64, table: &str) -> Option<TableUploadModel> {
        self.lock()
            .table_uploads
            .get(&(upload_id, table.to_string()))
            .cloned()
    }

    pub fn staging_file(&self, id: i64) -> Option<StagingFileModel> {
        self.lock().staging_files.get(&id).cloned()
    }

    pub fn cached_schema(&self, warehouse: &Warehouse) -> Option<Schema> {
        self.lock().schemas.get(&schema_key(warehouse)).cloned()
    }

    fn apply_column(upload: &mut UploadModel, column: &UploadColumn) {
        match (column.column, &column.value) {
            ("status", ColumnValue::Text(v)) => upload.status = v.clone(),
            ("last_exec_at", ColumnValue::Timestamp(v)) => upload.last_exec_at = Some(*v),
            ("start_load_file_id", ColumnValue::BigInt(v)) => upload.start_load_file_id = *v,
            ("end_load_file_id", ColumnValue::BigInt(v)) => upload.end_load_file_id = *v,
            ("schema", ColumnValue::Json(v)) => {
                upload.schema = Json(serde_json::from_value(v.clone()).unwrap_or_default())
            }
            ("metadata", ColumnValue::Json(v)) => upload.metadata = Json(v.clone()),
            ("error", ColumnValue::Json(v)) => {
                upload.error = Json(serde_json::from_value(v.clone()).unwrap_or_default())
            }
            _ => panic!("unsupported column update: {}", column.column),
        }
    }

    fn append_timing(upload: &mut UploadModel, status: &str, now: DateTime<Utc>) {
        let mut entry = BTreeMap::new();
        entry.insert(status.to_string(), format_timing(now));
        upload.timings.0.push(entry);
    }
}

fn schema_key(warehouse: &Warehouse) -> (String, String, String) {
    (
        warehouse.source.id.clone(),
        warehouse.destination.id.clone(),
        warehouse.namespace.clone(),
    )
}

fn not_found(what: String) -> granary_storage::Error {
    granary_storage::Error::NotFound(what)
}

/// Latest load file per staging file within scope, ordered by id.
fn latest_in_scope<'a>(state: &'a StoreState, scope: &LoadFileScope) -> Vec<&'a LoadFileModel> {
    let mut latest: HashMap<i64, &LoadFileModel> = HashMap::new();
    for load_file in &state.load_files {
        if load_file.source_id == scope.source_id
            && load_file.destination_id == scope.destination_id
            && load_file.table_name == scope.table_name
            && load_file.id >= scope.start_load_file_id
            && load_file.id <= scope.end_load_file_id
        {
            let entry = latest.entry(load_file.staging_file_id).or_insert(load_file);
            if load_file.id > entry.id {
                *entry = load_file;
            }
        }
    }
    let mut rows: Vec<&LoadFileModel> = latest.into_values().collect();
    rows.sort_by_key(|f| f.id);
    rows
}

#[async_trait]
impl UploadStore for InMemoryUploadStore {
    async fn get_upload(&self, id: i64) -> StorageResult<UploadModel> {
        self.lock()
            .uploads
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(format!("Upload {}", id)))
    }

    async fn set_upload_status(
        &self,
        id: i64,
        status: &str,
        extra: Vec<UploadColumn>,
    ) -> StorageResult<()> {
        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("Upload {}", id)))?;
        let now = Utc::now();
        upload.status = status.to_string();
        Self::append_timing(upload, status, now);
        upload.updated_at = now;
        for column in &extra {
            Self::apply_column(upload, column);
        }
        Ok(())
    }

    async fn set_upload_columns(&self, id: i64, columns: Vec<UploadColumn>) -> StorageResult<()> {
        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("Upload {}", id)))?;
        upload.updated_at = Utc::now();
        for column in &columns {
            Self::apply_column(upload, column);
        }
        Ok(())
    }

    async fn set_upload_schema(&self, id: i64, schema: &Schema) -> StorageResult<()> {
        self.set_upload_columns(
            id,
            vec![UploadColumn::new(
                "schema",
                ColumnValue::Json(serde_json::to_value(schema)?),
            )],
        )
        .await
    }

    async fn set_load_file_ids(&self, id: i64, start: i64, end: i64) -> StorageResult<()> {
        self.set_upload_columns(
            id,
            vec![
                UploadColumn::new("start_load_file_id", ColumnValue::BigInt(start)),
                UploadColumn::new("end_load_file_id", ColumnValue::BigInt(end)),
            ],
        )
        .await
    }

    async fn set_upload_error(
        &self,
        id: i64,
        journal_key: &str,
        failure_status: &str,
        message: &str,
    ) -> StorageResult<String> {
        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("Upload {}", id)))?;
        let now = Utc::now();

        let entry = upload.error.0.entry(journal_key.to_string()).or_default();
        entry.attempt += 1;
        entry.errors.push(message.to_string());
        let stage_attempt = entry.attempt;

        Self::append_timing(upload, failure_status, now);
        let first_attempt = upload.timings.0.first().and_then(parse_timing);

        let status = if self.retry.should_abort(stage_attempt, first_attempt, now) {
            ABORTED.to_string()
        } else {
            failure_status.to_string()
        };

        if !upload.metadata.0.is_object() {
            upload.metadata = Json(serde_json::json!({}));
        }
        let next_retry = upload.last_attempt_at.unwrap_or(now) + self.retry.backoff(upload.attempts);
        upload.metadata.0["nextRetryTime"] = serde_json::Value::String(next_retry.to_rfc3339());

        upload.status = status.clone();
        upload.updated_at = now;
        Ok(status)
    }

    async fn first_attempt_time(&self, id: i64) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self
            .lock()
            .uploads
            .get(&id)
            .and_then(|u| u.timings.0.first().and_then(parse_timing)))
    }

    async fn create_table_uploads(&self, upload_id: i64, tables: &[String]) -> StorageResult<()> {
        let mut state = self.lock();
        let now = Utc::now();
        for table in tables {
            let key = (upload_id, table.clone());
            if state.table_uploads.contains_key(&key) {
                continue;
            }
            let id = state.next_table_upload_id;
            state.next_table_upload_id += 1;
            state.table_uploads.insert(
                key,
                TableUploadModel {
                    id,
                    wh_upload_id: upload_id,
                    table_name: table.clone(),
                    status: TableStage::Waiting.as_str().to_string(),
                    error: None,
                    last_exec_time: None,
                    total_events: None,
                    location: None,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        Ok(())
    }

    async fn get_table_upload(&self, upload_id: i64, table: &str) -> StorageResult<TableUploadModel> {
        self.lock()
            .table_uploads
            .get(&(upload_id, table.to_string()))
            .cloned()
            .ok_or_else(|| not_found(format!("Table upload {}/{}", upload_id, table)))
    }

    async fn set_table_upload_status(
        &self,
        upload_id: i64,
        table: &str,
        status: TableStage,
    ) -> StorageResult<()> {
        let mut state = self.lock();
        let table_upload = state
            .table_uploads
            .get_mut(&(upload_id, table.to_string()))
            .ok_or_else(|| not_found(format!("Table upload {}/{}", upload_id, table)))?;
        let now = Utc::now();
        table_upload.status = status.as_str().to_string();
        if status == TableStage::Executing {
            table_upload.last_exec_time = Some(now);
        }
        table_upload.updated_at = now;
        Ok(())
    }

    async fn set_table_upload_error(
        &self,
        upload_id: i64,
        table: &str,
        status: TableStage,
        error: &str,
    ) -> StorageResult<()> {
        let mut state = self.lock();
        let table_upload = state
            .table_uploads
            .get_mut(&(upload_id, table.to_string()))
            .ok_or_else(|| not_found(format!("Table upload {}/{}", upload_id, table)))?;
        table_upload.status = status.as_str().to_string();
        table_upload.error = Some(error.to_string());
        table_upload.updated_at = Utc::now();
        Ok(())
    }

    async fn set_table_upload_total_events(
        &self,
        upload_id: i64,
        table: &str,
        total_events: i64,
    ) -> StorageResult<()> {
        let mut state = self.lock();
        if let Some(table_upload) = state.table_uploads.get_mut(&(upload_id, table.to_string())) {
            table_upload.total_events = Some(total_events);
            table_upload.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_table_upload_location(
        &self,
        upload_id: i64,
        table: &str,
        location: &str,
    ) -> StorageResult<()> {
        let mut state = self.lock();
        if let Some(table_upload) = state.table_uploads.get_mut(&(upload_id, table.to_string())) {
            table_upload.location = Some(location.to_string());
            table_upload.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn table_upload_location(
        &self,
        upload_id: i64,
        table: &str,
    ) -> StorageResult<Option<String>> {
        Ok(self
            .lock()
            .table_uploads
            .get(&(upload_id, table.to_string()))
            .and_then(|t| t.location.clone()))
    }

    async fn pending_table_statuses(
        &self,
        upload_id: i64,
        destination_id: &str,
        namespace: &str,
    ) -> StorageResult<Vec<TableUploadStatus>> {
        let state = self.lock();
        let current_tables: Vec<String> = state
            .table_uploads
            .keys()
            .filter(|(id, _)| *id == upload_id)
            .map(|(_, table)| table.clone())
            .collect();

        let mut rows = Vec::new();
        for ((table_upload_id, table), table_upload) in &state.table_uploads {
            let Some(upload) = state.uploads.get(table_upload_id) else {
                continue;
            };
            if upload.id > upload_id
                || upload.destination_id != destination_id
                || upload.namespace != namespace
                || upload.status == "exported_data"
                || upload.status == ABORTED
                || !current_tables.contains(table)
            {
                continue;
            }
            rows.push(TableUploadStatus {
                upload_id: upload.id,
                table_name: table.clone(),
                status: table_upload.status.clone(),
            });
        }
        rows.sort_by(|a, b| (a.upload_id, &a.table_name).cmp(&(b.upload_id, &b.table_name)));
        Ok(rows)
    }

    async fn set_staging_files_status(
        &self,
        ids: &[i64],
        status: StagingFileStatus,
        error: Option<&str>,
    ) -> StorageResult<()> {
        let mut state = self.lock();
        for id in ids {
            if let Some(staging_file) = state.staging_files.get_mut(id) {
                staging_file.status = status.as_str().to_string();
                staging_file.error = error.map(|e| e.to_string());
                staging_file.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn has_load_files(&self, scope: &LoadFileScope) -> StorageResult<bool> {
        Ok(!latest_in_scope(&self.lock(), scope).is_empty())
    }

    async fn total_events_in_load_files(&self, scope: &LoadFileScope) -> StorageResult<i64> {
        Ok(latest_in_scope(&self.lock(), scope)
            .iter()
            .map(|f| f.total_events)
            .sum())
    }

    async fn load_file_locations(&self, scope: &LoadFileScope) -> StorageResult<Vec<String>> {
        Ok(latest_in_scope(&self.lock(), scope)
            .iter()
            .map(|f| f.location.clone())
            .collect())
    }

    async fn local_schema(&self, warehouse: &Warehouse) -> StorageResult<Schema> {
        Ok(self
            .lock()
            .schemas
            .get(&schema_key(warehouse))
            .cloned()
            .unwrap_or_default())
    }

    async fn update_local_schema(&self, warehouse: &Warehouse, schema: &Schema) -> StorageResult<()> {
        self.lock()
            .schemas
            .insert(schema_key(warehouse), schema.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock warehouse manager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ManagerState {
    schema: Schema,
    warehouse: Option<Warehouse>,
    fail_load_tables: HashMap<String, String>,
    fail_user_tables: HashMap<String, String>,
    fail_fetch_schema: Option<String>,
    fail_create_schema: Option<String>,
    fail_merge_rules: Option<String>,
    fail_mappings: Option<String>,
    calls: Vec<String>,
}

/// Scriptable destination driver: records calls, maintains a live warehouse
/// schema, and fails where the test tells it to.
#[derive(Default)]
pub struct MockWarehouseManager {
    state: Mutex<ManagerState>,
}

impl MockWarehouseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_warehouse_schema(self, schema: Schema) -> Self {
        self.state.lock().expect("mock manager lock poisoned").schema = schema;
        self
    }

    pub fn fail_load_table(&self, table: &str, message: &str) {
        self.lock()
            .fail_load_tables
            .insert(table.to_string(), message.to_string());
    }

    pub fn fail_user_table(&self, table: &str, message: &str) {
        self.lock()
            .fail_user_tables
            .insert(table.to_string(), message.to_string());
    }

    pub fn fail_fetch_schema(&self, message: &str) {
        self.lock().fail_fetch_schema = Some(message.to_string());
    }

    pub fn fail_create_schema(&self, message: &str) {
        self.lock().fail_create_schema = Some(message.to_string());
    }

    pub fn fail_merge_rules_load(&self, message: &str) {
        self.lock().fail_merge_rules = Some(message.to_string());
    }

    pub fn fail_mappings_load(&self, message: &str) {
        self.lock().fail_mappings = Some(message.to_string());
    }

    /// Grow the live warehouse schema out from under the pipeline, as a
    /// concurrent writer would.
    pub fn add_warehouse_column(&self, table: &str, column: &str, column_type: &str) {
        let mut state = self.lock();
        state
            .schema
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string(), column_type.to_string());
    }

    pub fn warehouse_schema(&self) -> Schema {
        self.lock().schema.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().expect("mock manager lock poisoned")
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl WarehouseManager for MockWarehouseManager {
    async fn setup(&self, warehouse: &Warehouse, _uploader: Arc<dyn Uploader>) -> RuntimeResult<()> {
        let mut state = self.lock();
        state.warehouse = Some(warehouse.clone());
        state.calls.push("setup".to_string());
        Ok(())
    }

    async fn cleanup(&self) {
        self.record("cleanup".to_string());
    }

    async fn create_schema(&self) -> RuntimeResult<()> {
        self.record("create_schema".to_string());
        if let Some(message) = self.lock().fail_create_schema.clone() {
            return Err(granary_runtime::Error::Warehouse(message));
        }
        Ok(())
    }

    async fn create_table(&self, table: &str, columns: &TableSchema) -> RuntimeResult<()> {
        self.record(format!("create_table:{}", table));
        self.lock().schema.insert(table.to_string(), columns.clone());
        Ok(())
    }

    async fn add_column(&self, table: &str, column: &str, column_type: &str) -> RuntimeResult<()> {
        self.record(format!("add_column:{}:{}", table, column));
        self.lock()
            .schema
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string(), column_type.to_string());
        Ok(())
    }

    async fn alter_column(&self, table: &str, column: &str, column_type: &str) -> RuntimeResult<()> {
        self.record(format!("alter_column:{}:{}", table, column));
        self.lock()
            .schema
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string(), column_type.to_string());
        Ok(())
    }

    async fn load_table(&self, table: &str) -> RuntimeResult<()> {
        self.record(format!("load_table:{}", table));
        if let Some(message) = self.lock().fail_load_tables.get(table).cloned() {
            return Err(granary_runtime::Error::Warehouse(message));
        }
        Ok(())
    }

    async fn load_user_tables(&self) -> LoadTableResults {
        self.record("load_user_tables".to_string());
        let state = self.lock();
        let Some(warehouse) = state.warehouse.clone() else {
            return LoadTableResults::new();
        };
        let mut results = LoadTableResults::new();
        for table in [warehouse.identifies_table(), warehouse.users_table()] {
            let error = state.fail_user_tables.get(&table).cloned();
            results.insert(table, error);
        }
        results
    }

    async fn load_identity_merge_rules_table(&self) -> RuntimeResult<()> {
        self.record("load_identity_merge_rules_table".to_string());
        if let Some(message) = self.lock().fail_merge_rules.clone() {
            return Err(granary_runtime::Error::Warehouse(message));
        }
        Ok(())
    }

    async fn load_identity_mappings_table(&self) -> RuntimeResult<()> {
        self.record("load_identity_mappings_table".to_string());
        if let Some(message) = self.lock().fail_mappings.clone() {
            return Err(granary_runtime::Error::Warehouse(message));
        }
        Ok(())
    }

    async fn fetch_schema_from_warehouse(&self) -> RuntimeResult<Schema> {
        self.record("fetch_schema_from_warehouse".to_string());
        let state = self.lock();
        if let Some(message) = state.fail_fetch_schema.clone() {
            return Err(granary_runtime::Error::Warehouse(message));
        }
        Ok(state.schema.clone())
    }
}

// ---------------------------------------------------------------------------
// Mock notifier
// ---------------------------------------------------------------------------

enum NotifierMode {
    /// Behave like a healthy worker fleet: write load-file rows into the
    /// store for every table of the payload schema and reply with their ids
    EmitLoadFiles { events_per_file: i64 },
    /// Reply `aborted` for every message
    AbortAll { error: String },
}

/// Scriptable worker bus wired to an [`InMemoryUploadStore`]
pub struct MockNotifier {
    store: Arc<InMemoryUploadStore>,
    mode: Mutex<NotifierMode>,
    skip_tables: Mutex<Vec<String>>,
    published_batches: Mutex<Vec<usize>>,
}

impl MockNotifier {
    pub fn new(store: Arc<InMemoryUploadStore>) -> Self {
        Self {
            store,
            mode: Mutex::new(NotifierMode::EmitLoadFiles { events_per_file: 1 }),
            skip_tables: Mutex::new(Vec::new()),
            published_batches: Mutex::new(Vec::new()),
        }
    }

    pub fn events_per_load_file(&self, events: i64) {
        *self.mode.lock().expect("mock notifier lock poisoned") =
            NotifierMode::EmitLoadFiles { events_per_file: events };
    }

    pub fn abort_all(&self, error: &str) {
        *self.mode.lock().expect("mock notifier lock poisoned") = NotifierMode::AbortAll {
            error: error.to_string(),
        };
    }

    /// Emit no load files for `table`, as workers do when a batch carries no
    /// rows for it.
    pub fn skip_table(&self, table: &str) {
        self.skip_tables
            .lock()
            .expect("mock notifier lock poisoned")
            .push(table.to_string());
    }

    /// Sizes of the batches published so far.
    pub fn published_batches(&self) -> Vec<usize> {
        self.published_batches
            .lock()
            .expect("mock notifier lock poisoned")
            .clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn publish(
        &self,
        messages: Vec<NotifierMessage>,
    ) -> NotifierResult<oneshot::Receiver<Vec<NotifierResponse>>> {
        self.published_batches
            .lock()
            .expect("mock notifier lock poisoned")
            .push(messages.len());

        let (sender, receiver) = oneshot::channel();
        let mode = self.mode.lock().expect("mock notifier lock poisoned");
        let responses: Vec<NotifierResponse> = match &*mode {
            NotifierMode::AbortAll { error } => messages
                .iter()
                .map(|_| NotifierResponse {
                    status: RESPONSE_ABORTED.to_string(),
                    error: Some(error.clone()),
                    payload: serde_json::json!({}),
                })
                .collect(),
            NotifierMode::EmitLoadFiles { events_per_file } => messages
                .iter()
                .map(|message| {
                    let payload: NotifierPayload =
                        serde_json::from_value(message.payload.clone())
                            .expect("notifier payload deserialises");
                    let skipped = self
                        .skip_tables
                        .lock()
                        .expect("mock notifier lock poisoned")
                        .clone();
                    let mut ids = Vec::new();
                    for table in payload.schema.keys() {
                        if skipped.iter().any(|t| t == table) {
                            continue;
                        }
                        ids.push(self.store.push_load_file(
                            payload.staging_file_id,
                            &payload.source_id,
                            &payload.destination_id,
                            table,
                            *events_per_file,
                        ));
                    }
                    NotifierResponse {
                        status: RESPONSE_SUCCEEDED.to_string(),
                        error: None,
                        payload: serde_json::json!({ "LoadFileIDs": ids }),
                    }
                })
                .collect(),
        };
        let _ = sender.send(responses);
        Ok(receiver)
    }
}

// ---------------------------------------------------------------------------
// Mock identity resolver
// ---------------------------------------------------------------------------

/// Identity resolver double: records invocations, optionally fails
#[derive(Default)]
pub struct MockIdentityResolver {
    calls: Mutex<Vec<String>>,
    fail_with: Mutex<Option<String>>,
}

impl MockIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().expect("mock resolver lock poisoned") = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mock resolver lock poisoned").clone()
    }

    fn run(&self, call: &str) -> RuntimeResult<()> {
        self.calls
            .lock()
            .expect("mock resolver lock poisoned")
            .push(call.to_string());
        match self.fail_with.lock().expect("mock resolver lock poisoned").clone() {
            Some(message) => Err(granary_runtime::Error::Warehouse(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl IdentityResolver for MockIdentityResolver {
    async fn resolve(&self) -> RuntimeResult<()> {
        self.run("resolve")
    }

    async fn resolve_historic_identities(&self) -> RuntimeResult<()> {
        self.run("resolve_historic_identities")
    }
}
