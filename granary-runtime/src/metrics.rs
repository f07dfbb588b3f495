//! Prometheus metrics for upload pipeline operations

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

lazy_static! {
    /// Wall-clock duration of one upload job run
    ///
    /// Labels:
    /// - destination_type: "bigquery", "redshift", "postgres", "snowflake", "clickhouse"
    pub static ref UPLOAD_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "granary_upload_duration_seconds",
        "Duration of one upload job run",
        &["destination_type"],
        vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]
    )
    .expect("granary_upload_duration_seconds metric registration");

    /// Total stage failures, keyed by the stage that failed
    ///
    /// Labels:
    /// - stage: in-progress stage label, e.g. "exporting_data"
    pub static ref STAGE_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "granary_upload_stage_failures_total",
        "Total upload stage failures",
        &["stage"]
    )
    .expect("granary_upload_stage_failures_total metric registration");

    /// Total failed upload runs (retryable or aborted)
    pub static ref FAILED_UPLOADS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "granary_failed_uploads_total",
        "Total failed upload runs",
        &["destination_type"]
    )
    .expect("granary_failed_uploads_total metric registration");

    /// Total uploads that hit the terminal aborted status
    pub static ref UPLOADS_ABORTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "granary_uploads_aborted_total",
        "Total uploads transitioned to aborted",
        &["destination_type"]
    )
    .expect("granary_uploads_aborted_total metric registration");

    /// Total uploads that reached exported_data
    pub static ref UPLOADS_COMPLETED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "granary_uploads_completed_total",
        "Total uploads that completed successfully",
        &["destination_type"]
    )
    .expect("granary_uploads_completed_total metric registration");

    /// Uploads still running past the configured long-running threshold.
    /// Emitted at most once per run.
    pub static ref LONG_RUNNING_UPLOADS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "granary_long_running_uploads_total",
        "Uploads that exceeded the long-running threshold",
        &["destination_type"]
    )
    .expect("granary_long_running_uploads_total metric registration");

    /// Duration of load-file generation across the worker fleet
    pub static ref LOAD_FILE_GENERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "granary_load_file_generation_duration_seconds",
        "Duration of load-file generation",
        &["destination_type"],
        vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0]
    )
    .expect("granary_load_file_generation_duration_seconds metric registration");

    /// Duration of each table-load group within a run
    ///
    /// Labels:
    /// - group: "user", "identity", "other"
    pub static ref TABLE_GROUP_LOAD_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "granary_table_group_load_duration_seconds",
        "Duration of one table-load group",
        &["group"],
        vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]
    )
    .expect("granary_table_group_load_duration_seconds metric registration");

    /// Total events confirmed loaded into destination tables
    pub static ref TABLE_EVENTS_LOADED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "granary_table_events_loaded_total",
        "Total events loaded into destination tables",
        &["destination_type"]
    )
    .expect("granary_table_events_loaded_total metric registration");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // Accessing each metric panics if registration failed
        let _ = UPLOAD_DURATION_SECONDS.with_label_values(&["postgres"]);
        let _ = STAGE_FAILURES_TOTAL.with_label_values(&["exporting_data"]);
        let _ = FAILED_UPLOADS_TOTAL.with_label_values(&["postgres"]);
        let _ = UPLOADS_ABORTED_TOTAL.with_label_values(&["postgres"]);
        let _ = UPLOADS_COMPLETED_TOTAL.with_label_values(&["postgres"]);
        let _ = LONG_RUNNING_UPLOADS_TOTAL.with_label_values(&["postgres"]);
        let _ = LOAD_FILE_GENERATION_DURATION_SECONDS.with_label_values(&["postgres"]);
        let _ = TABLE_GROUP_LOAD_DURATION_SECONDS.with_label_values(&["other"]);
        let _ = TABLE_EVENTS_LOADED_TOTAL.with_label_values(&["postgres"]);
    }
}
