//! End-to-end upload job scenarios
//!
//! Every collaborator is a test double: uploads run against the in-memory
//! store, the scriptable warehouse driver and the scriptable notifier, so
//! these scenarios exercise the full state machine without a database, a
//! warehouse or a worker fleet.

use chrono::{Duration, Utc};
use granary_core::state_machine::{TableStage, UploadStage};
use granary_core::warehouse::{DestinationType, Warehouse};
use granary_runtime::{UploadConfig, UploadJob, UploadJobContext};
use granary_storage::{StagingFileModel, UploadModel, UploadStore};
use granary_tests::assertions::{
    assert_timing_present, assert_timings_non_decreasing, timing_statuses,
};
use granary_tests::fixtures;
use granary_tests::{
    InMemoryUploadStore, MockIdentityResolver, MockNotifier, MockWarehouseManager, StagingFileBuilder,
    UploadBuilder,
};
use std::sync::Arc;

struct Rig {
    store: Arc<InMemoryUploadStore>,
    manager: Arc<MockWarehouseManager>,
    notifier: Arc<MockNotifier>,
    warehouse: Warehouse,
    config: UploadConfig,
}

impl Rig {
    fn new(destination_type: DestinationType) -> Self {
        let store = Arc::new(InMemoryUploadStore::new());
        let notifier = Arc::new(MockNotifier::new(Arc::clone(&store)));
        Self {
            store,
            manager: Arc::new(MockWarehouseManager::new()),
            notifier,
            warehouse: fixtures::warehouse(destination_type),
            config: UploadConfig::default(),
        }
    }

    fn job(
        &self,
        upload: UploadModel,
        staging_files: Vec<StagingFileModel>,
        resolver: Option<Arc<MockIdentityResolver>>,
    ) -> Arc<UploadJob> {
        self.store.insert_upload(upload.clone());
        for staging_file in &staging_files {
            self.store.insert_staging_file(staging_file.clone());
        }
        UploadJob::new(UploadJobContext {
            upload,
            warehouse: self.warehouse.clone(),
            staging_files,
            store: self.store.clone(),
            manager: self.manager.clone(),
            notifier: self.notifier.clone(),
            resolver: resolver.map(|r| r as Arc<dyn granary_runtime::IdentityResolver>),
            config: self.config.clone(),
            populate_historic_identities: false,
        })
    }

    /// Re-load the upload row and build a fresh job for it, as the upstream
    /// scheduler would on retry.
    fn resumed_job(&self, upload_id: i64, staging_files: Vec<StagingFileModel>) -> Arc<UploadJob> {
        let upload = self.store.upload(upload_id).expect("upload exists");
        UploadJob::new(UploadJobContext {
            upload,
            warehouse: self.warehouse.clone(),
            staging_files,
            store: self.store.clone(),
            manager: self.manager.clone(),
            notifier: self.notifier.clone(),
            resolver: None,
            config: self.config.clone(),
            populate_historic_identities: false,
        })
    }
}

fn count_calls(calls: &[String], call: &str) -> usize {
    calls.iter().filter(|c| c.as_str() == call).count()
}

// ---------------------------------------------------------------------------
// Scenario: happy path, single table
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_single_table() {
    let rig = Rig::new(DestinationType::Postgres);
    let upload = UploadBuilder::new().build();
    let staging = StagingFileBuilder::new().schema(fixtures::events_schema()).build();

    let job = rig.job(upload, vec![staging], None);
    job.run().await.expect("upload completes");

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "exported_data");
    assert_eq!(upload.schema.0, fixtures::events_schema());
    assert_eq!(upload.start_load_file_id, 1);
    assert_eq!(upload.end_load_file_id, 1);

    // one in-progress and one completed entry per productive stage
    assert_eq!(timing_statuses(&upload).len(), 16);
    assert_timings_non_decreasing(&upload);
    for stage in UploadStage::PIPELINE {
        assert_timing_present(&upload, stage.in_progress_label().unwrap());
        assert_timing_present(&upload, stage.completed_label());
    }

    let events = rig.store.table_upload(1, "events").expect("table upload exists");
    assert_eq!(events.status, "exported_data");
    assert_eq!(events.total_events, Some(1));
    assert!(events.location.is_some());

    let staging = rig.store.staging_file(1).expect("staging file exists");
    assert_eq!(staging.status, "succeeded");

    let calls = rig.manager.calls();
    assert_eq!(count_calls(&calls, "create_schema"), 1);
    assert_eq!(count_calls(&calls, "create_table:events"), 1);
    assert_eq!(count_calls(&calls, "load_table:events"), 1);
    assert_eq!(count_calls(&calls, "cleanup"), 1);

    // the created table was persisted into the local schema cache
    let cached = rig.store.cached_schema(&rig.warehouse).expect("schema cached");
    assert!(cached.contains_key("events"));
}

#[tokio::test]
async fn rerunning_a_completed_upload_skips_loaded_tables() {
    let rig = Rig::new(DestinationType::Postgres);
    let upload = UploadBuilder::new().build();
    let staging = StagingFileBuilder::new().schema(fixtures::events_schema()).build();

    rig.job(upload, vec![staging.clone()], None)
        .run()
        .await
        .expect("first run completes");
    rig.resumed_job(1, vec![staging])
        .run()
        .await
        .expect("second run completes");

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "exported_data");

    // the table was already exported by this upload, so the second run
    // skipped the driver load; the now-populated warehouse schema also
    // makes the remote-schema stage a no-op
    let calls = rig.manager.calls();
    assert_eq!(count_calls(&calls, "load_table:events"), 1);
    assert_eq!(count_calls(&calls, "create_schema"), 1);
}

// ---------------------------------------------------------------------------
// Scenario: remote schema change forces a restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn schema_change_restarts_from_first_stage() {
    let rig = Rig::new(DestinationType::Postgres);

    // the upload already got through load-file generation on a prior run
    let upload = UploadBuilder::new()
        .status("generated_load_files")
        .schema(fixtures::events_schema())
        .load_file_range(1, 1)
        .timing("generated_load_files", Utc::now() - Duration::minutes(10))
        .build();
    let staging = StagingFileBuilder::new().schema(fixtures::events_schema()).build();

    // local cache reflects the old remote state
    rig.store
        .update_local_schema(
            &rig.warehouse,
            &fixtures::schema(&[("events", &[("id", "string"), ("ts", "timestamp")])]),
        )
        .await
        .expect("seed local schema");

    // meanwhile the warehouse acquired a column
    rig.manager.add_warehouse_column("events", "id", "string");
    rig.manager.add_warehouse_column("events", "ts", "timestamp");
    rig.manager.add_warehouse_column("events", "context_ip", "string");

    let job = rig.job(upload, vec![staging], None);
    job.run().await.expect("upload completes");

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "exported_data");

    // restart is visible: the first productive stage ran again even though
    // its completed label was already persisted
    assert_timing_present(&upload, "generating_upload_schema");

    // the local cache now matches the live warehouse
    let cached = rig.store.cached_schema(&rig.warehouse).expect("schema cached");
    assert_eq!(cached, rig.manager.warehouse_schema());
}

// ---------------------------------------------------------------------------
// Scenario: partial failure in exported_data
// ---------------------------------------------------------------------------

#[tokio::test]
async fn partial_table_failure_fails_the_stage_but_loads_the_rest() {
    let rig = Rig::new(DestinationType::Postgres);
    let schema = fixtures::schema(&[
        ("alpha", &[("id", "string")]),
        ("beta", &[("id", "string")]),
    ]);
    let upload = UploadBuilder::new().build();
    let staging = StagingFileBuilder::new().schema(schema).build();

    rig.manager.fail_load_table("beta", "connection reset by warehouse");

    let job = rig.job(upload, vec![staging], None);
    let result = job.run().await;
    assert!(result.is_err());

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "failed_exporting_data");

    // both tables were attempted
    let calls = rig.manager.calls();
    assert_eq!(count_calls(&calls, "load_table:alpha"), 1);
    assert_eq!(count_calls(&calls, "load_table:beta"), 1);

    let alpha = rig.store.table_upload(1, "alpha").expect("alpha exists");
    assert_eq!(alpha.status, "exported_data");
    let beta = rig.store.table_upload(1, "beta").expect("beta exists");
    assert_eq!(beta.status, "exporting_data_failed");
    assert!(beta.error.as_deref().unwrap_or("").contains("connection reset"));

    let journal = &upload.error.0["exporting_data"];
    assert_eq!(journal.attempt, 1);
    assert_eq!(journal.errors.len(), 1);
    assert!(journal.errors[0].contains("connection reset by warehouse"));
}

// ---------------------------------------------------------------------------
// Scenario: abort after exhausted retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_abort_the_upload() {
    let rig = Rig::new(DestinationType::Clickhouse);
    let schema = fixtures::schema(&[("beta", &[("id", "string")])]);

    // four failed attempts already journalled, first attempt far outside the
    // retry window; load files from the first attempt are still on record
    let upload = UploadBuilder::new()
        .status("failed_exporting_data")
        .schema(schema.clone())
        .attempts(4)
        .last_attempt_at(Utc::now() - Duration::minutes(30))
        .load_file_range(1, 1)
        .stage_error(
            "exporting_data",
            4,
            &["load failed", "load failed", "load failed", "load failed"],
        )
        .timing("generating_upload_schema", Utc::now() - Duration::hours(12))
        .build();
    let staging = StagingFileBuilder::new().schema(schema).build();

    rig.store.push_load_file(1, "src-1", "dst-1", "beta", 1);
    rig.store.insert_table_upload(1, "beta", TableStage::ExportingDataFailed);
    rig.manager.fail_load_table("beta", "load failed");

    let aborted_before = granary_runtime::metrics::UPLOADS_ABORTED_TOTAL
        .with_label_values(&["clickhouse"])
        .get();

    let job = rig.job(upload, vec![staging], None);
    let result = job.run().await;
    assert!(result.is_err());

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "aborted");
    assert_eq!(upload.error.0["exporting_data"].attempt, 5);

    let aborted_after = granary_runtime::metrics::UPLOADS_ABORTED_TOTAL
        .with_label_values(&["clickhouse"])
        .get();
    assert_eq!(aborted_after - aborted_before, 1);

    // nextRetryTime is advisory metadata even for aborted uploads
    assert!(upload.metadata.0["nextRetryTime"].is_string());
}

#[tokio::test]
async fn failures_within_the_window_stay_retryable() {
    let rig = Rig::new(DestinationType::Postgres);
    let schema = fixtures::schema(&[("beta", &[("id", "string")])]);
    let upload = UploadBuilder::new()
        .schema(schema.clone())
        .timing("generating_upload_schema", Utc::now() - Duration::minutes(5))
        .build();
    let staging = StagingFileBuilder::new().schema(schema).build();

    rig.manager.fail_load_table("beta", "load failed");

    let result = rig.job(upload, vec![staging], None).run().await;
    assert!(result.is_err());

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "failed_exporting_data");
}

// ---------------------------------------------------------------------------
// Scenario: cross-upload dependency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tables_failed_in_earlier_uploads_are_skipped_and_reported() {
    let rig = Rig::new(DestinationType::Postgres);

    // upload 1 left table "carts" failing and is itself still non-terminal
    let earlier = UploadBuilder::new()
        .id(1)
        .status("failed_exporting_data")
        .build();
    rig.store.insert_upload(earlier);
    rig.store
        .insert_table_upload(1, "carts", TableStage::ExportingDataFailed);

    let schema = fixtures::schema(&[
        ("carts", &[("id", "string")]),
        ("orders", &[("id", "string")]),
    ]);
    let upload = UploadBuilder::new()
        .id(2)
        .staging_file_range(2, 2)
        .build();
    let staging = StagingFileBuilder::new().id(2).schema(schema).build();

    let job = rig.job(upload, vec![staging], None);
    let result = job.run().await;
    assert!(result.is_err());

    let upload = rig.store.upload(2).expect("upload exists");
    assert_eq!(upload.status, "failed_exporting_data");
    let journal = &upload.error.0["exporting_data"];
    assert!(journal.errors[0]
        .contains("skipping the following tables because they failed previously: [carts]"));

    // orders loaded, carts never reached the driver
    let calls = rig.manager.calls();
    assert_eq!(count_calls(&calls, "load_table:orders"), 1);
    assert_eq!(count_calls(&calls, "load_table:carts"), 0);

    let orders = rig.store.table_upload(2, "orders").expect("orders exists");
    assert_eq!(orders.status, "exported_data");
}

// ---------------------------------------------------------------------------
// Scenario: empty load-file batch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aborted_workers_fail_load_file_generation() {
    let rig = Rig::new(DestinationType::Postgres);
    let upload = UploadBuilder::new().build();
    let staging = StagingFileBuilder::new().schema(fixtures::events_schema()).build();

    rig.notifier.abort_all("worker out of memory");

    let job = rig.job(upload, vec![staging], None);
    let result = job.run().await;
    assert!(result.is_err());

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "failed_generating_load_files");
    assert_eq!(upload.error.0["generating_load_files"].attempt, 1);

    let staging = rig.store.staging_file(1).expect("staging file exists");
    assert_eq!(staging.status, "failed");
    assert!(staging.error.as_deref().unwrap_or("").contains("no load files"));
}

#[tokio::test]
async fn staging_files_are_published_in_batches() {
    let mut rig = Rig::new(DestinationType::Postgres);
    rig.config.publish_batch_size = 2;

    let upload = UploadBuilder::new().staging_file_range(1, 5).build();
    let staging: Vec<_> = (1..=5)
        .map(|id| StagingFileBuilder::new().id(id).schema(fixtures::events_schema()).build())
        .collect();

    let job = rig.job(upload, staging, None);
    job.run().await.expect("upload completes");

    assert_eq!(rig.notifier.published_batches(), vec![2, 2, 1]);
}

// ---------------------------------------------------------------------------
// User tables
// ---------------------------------------------------------------------------

#[tokio::test]
async fn user_tables_load_before_the_general_fan_out() {
    let rig = Rig::new(DestinationType::Postgres);
    let schema = fixtures::schema(&[
        ("identifies", &[("user_id", "string")]),
        ("users", &[("user_id", "string")]),
        ("pages", &[("url", "string")]),
    ]);
    let upload = UploadBuilder::new().build();
    let staging = StagingFileBuilder::new().schema(schema).build();

    let job = rig.job(upload, vec![staging], None);
    job.run().await.expect("upload completes");

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "exported_data");

    let calls = rig.manager.calls();
    assert_eq!(count_calls(&calls, "load_user_tables"), 1);
    // user tables never go through the per-table load path
    assert_eq!(count_calls(&calls, "load_table:identifies"), 0);
    assert_eq!(count_calls(&calls, "load_table:users"), 0);
    assert_eq!(count_calls(&calls, "load_table:pages"), 1);

    for table in ["identifies", "users", "pages"] {
        let table_upload = rig.store.table_upload(1, table).expect("table exists");
        assert_eq!(table_upload.status, "exported_data", "table {}", table);
    }
}

#[tokio::test]
async fn user_table_failure_fails_the_user_stage() {
    let rig = Rig::new(DestinationType::Postgres);
    let schema = fixtures::schema(&[
        ("identifies", &[("user_id", "string")]),
        ("users", &[("user_id", "string")]),
    ]);
    let upload = UploadBuilder::new().build();
    let staging = StagingFileBuilder::new().schema(schema).build();

    rig.manager.fail_user_table("identifies", "users dedup failed");

    let job = rig.job(upload, vec![staging], None);
    let result = job.run().await;
    assert!(result.is_err());

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "failed_exporting_user_tables");

    let identifies = rig.store.table_upload(1, "identifies").expect("row exists");
    assert_eq!(identifies.status, "exporting_data_failed");
}

// ---------------------------------------------------------------------------
// Identity tables
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identity_tables_resolve_and_load_when_enabled() {
    let mut rig = Rig::new(DestinationType::BigQuery);
    rig.config.id_resolution_enabled = true;

    let schema = fixtures::schema(&[
        ("rudder_identity_merge_rules", &[("merge_property_1_type", "string")]),
        ("pages", &[("url", "string")]),
    ]);
    let upload = UploadBuilder::new()
        .destination_type(DestinationType::BigQuery)
        .build();
    let staging = StagingFileBuilder::new().schema(schema).build();

    let resolver = Arc::new(MockIdentityResolver::new());
    let job = rig.job(upload, vec![staging], Some(Arc::clone(&resolver)));
    job.run().await.expect("upload completes");

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "exported_data");

    assert_eq!(resolver.calls(), vec!["resolve"]);
    let calls = rig.manager.calls();
    assert_eq!(count_calls(&calls, "load_identity_merge_rules_table"), 1);
    assert_eq!(count_calls(&calls, "load_identity_mappings_table"), 1);

    // the mappings table got a row even though the batch carried no
    // mappings data of its own
    let mappings = rig
        .store
        .table_upload(1, "rudder_identity_mappings")
        .expect("mappings row exists");
    assert_eq!(mappings.status, "exported_data");
}

#[tokio::test]
async fn identity_stage_is_skipped_when_resolution_is_disabled() {
    let rig = Rig::new(DestinationType::BigQuery);
    let schema = fixtures::schema(&[
        ("rudder_identity_merge_rules", &[("merge_property_1_type", "string")]),
    ]);
    let upload = UploadBuilder::new()
        .destination_type(DestinationType::BigQuery)
        .build();
    let staging = StagingFileBuilder::new().schema(schema).build();

    let job = rig.job(upload, vec![staging], None);
    job.run().await.expect("upload completes");

    let calls = rig.manager.calls();
    assert_eq!(count_calls(&calls, "load_identity_merge_rules_table"), 0);
    assert_eq!(count_calls(&calls, "load_identity_mappings_table"), 0);
}

// ---------------------------------------------------------------------------
// Early failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn schema_fetch_failure_gets_its_own_status() {
    let rig = Rig::new(DestinationType::Postgres);
    let upload = UploadBuilder::new().build();
    let staging = StagingFileBuilder::new().schema(fixtures::events_schema()).build();

    rig.manager.fail_fetch_schema("warehouse unreachable");

    let result = rig.job(upload, vec![staging], None).run().await;
    assert!(result.is_err());

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "fetching_remote_schema_failed");
    assert!(upload.error.0.contains_key("fetching_remote_schema_failed"));
}

#[tokio::test]
async fn empty_staging_file_set_is_an_internal_failure() {
    let rig = Rig::new(DestinationType::Postgres);
    let upload = UploadBuilder::new().build();

    let result = rig.job(upload, Vec::new(), None).run().await;
    assert!(result.is_err());

    let upload = rig.store.upload(1).expect("upload exists");
    assert_eq!(upload.status, "internal_processing_failed");
}

#[tokio::test]
async fn discards_table_is_marked_exported_without_load_files() {
    let rig = Rig::new(DestinationType::Postgres);
    // discards appear in the consolidated schema, but the workers emit no
    // load files for them in this batch
    let schema = fixtures::schema(&[
        ("events", &[("id", "string")]),
        ("rudder_discards", &[("row_id", "string")]),
    ]);
    rig.notifier.skip_table("rudder_discards");

    let upload = UploadBuilder::new().build();
    let staging = StagingFileBuilder::new().schema(schema).build();

    let job = rig.job(upload, vec![staging], None);
    job.run().await.expect("upload completes");

    let discards = rig
        .store
        .table_upload(1, "rudder_discards")
        .expect("discards row exists");
    assert_eq!(discards.status, "exported_data");
    let calls = rig.manager.calls();
    assert_eq!(count_calls(&calls, "load_table:rudder_discards"), 0);
}
