//! Database models for warehouse upload state

use chrono::{DateTime, Utc};
use granary_core::schema::Schema;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

pub const UPLOADS_TABLE: &str = "wh_uploads";
pub const TABLE_UPLOADS_TABLE: &str = "wh_table_uploads";
pub const STAGING_FILES_TABLE: &str = "wh_staging_files";
pub const LOAD_FILES_TABLE: &str = "wh_load_files";
pub const SCHEMAS_TABLE: &str = "wh_schemas";

/// One stage's entry in an upload's error journal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub attempt: i64,
    pub errors: Vec<String>,
}

/// Stage label → accumulated failures for that stage
pub type ErrorJournal = BTreeMap<String, StageError>;

/// Append-only journal of status transitions. Each entry is a single-key
/// map `{status: RFC3339-millisecond timestamp}`.
pub type Timings = Vec<BTreeMap<String, String>>;

/// Timestamp format used in the timings journal.
pub fn format_timing(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse the timestamp out of one timings entry.
pub fn parse_timing(entry: &BTreeMap<String, String>) -> Option<DateTime<Utc>> {
    let raw = entry.values().next()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Upload model for database storage: one row per (source, destination,
/// staging-file batch)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UploadModel {
    pub id: i64,
    pub namespace: String,
    pub source_id: String,
    pub destination_id: String,
    pub destination_type: String,
    pub start_staging_file_id: i64,
    pub end_staging_file_id: i64,
    pub start_load_file_id: i64,
    pub end_load_file_id: i64,
    pub status: String,
    pub schema: sqlx::types::Json<Schema>,
    pub error: sqlx::types::Json<ErrorJournal>,
    pub timings: sqlx::types::Json<Timings>,
    pub metadata: sqlx::types::Json<serde_json::Value>,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub last_exec_at: Option<DateTime<Utc>>,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Table upload model: one row per (upload, table)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TableUploadModel {
    pub id: i64,
    pub wh_upload_id: i64,
    pub table_name: String,
    pub status: String,
    pub error: Option<String>,
    pub last_exec_time: Option<DateTime<Utc>>,
    pub total_events: Option<i64>,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Staging file model. The pipeline only ever writes its status column; the
/// rest is owned by the ingestion layer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StagingFileModel {
    pub id: i64,
    pub location: String,
    pub source_id: String,
    pub destination_id: String,
    pub schema: sqlx::types::Json<Schema>,
    pub status: String,
    pub error: Option<String>,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Load file model, written by the worker fleet and read-only here
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LoadFileModel {
    pub id: i64,
    pub staging_file_id: i64,
    pub location: String,
    pub source_id: String,
    pub destination_id: String,
    pub table_name: String,
    pub total_events: i64,
    pub created_at: DateTime<Utc>,
}

/// Status of one table upload joined with its parent upload's routing keys
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct TableUploadStatus {
    pub upload_id: i64,
    pub table_name: String,
    pub status: String,
}

// Updatable wh_uploads columns
pub const UPLOAD_STATUS_COLUMN: &str = "status";
pub const UPLOAD_SCHEMA_COLUMN: &str = "schema";
pub const UPLOAD_ERROR_COLUMN: &str = "error";
pub const UPLOAD_TIMINGS_COLUMN: &str = "timings";
pub const UPLOAD_METADATA_COLUMN: &str = "metadata";
pub const UPLOAD_START_LOAD_FILE_ID_COLUMN: &str = "start_load_file_id";
pub const UPLOAD_END_LOAD_FILE_ID_COLUMN: &str = "end_load_file_id";
pub const UPLOAD_LAST_EXEC_AT_COLUMN: &str = "last_exec_at";
pub const UPLOAD_UPDATED_AT_COLUMN: &str = "updated_at";

/// Value for a parameterised column update
#[derive(Debug, Clone)]
pub enum ColumnValue {
    Text(String),
    BigInt(i64),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

/// One column assignment in a parameterised upload update
#[derive(Debug, Clone)]
pub struct UploadColumn {
    pub column: &'static str,
    pub value: ColumnValue,
}

impl UploadColumn {
    pub fn new(column: &'static str, value: ColumnValue) -> Self {
        Self { column, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_format_round_trip() {
        let at = Utc::now();
        let mut entry = BTreeMap::new();
        entry.insert("exporting_data".to_string(), format_timing(at));

        let parsed = parse_timing(&entry).expect("timing parses");
        // millisecond precision survives the round trip
        assert_eq!(parsed.timestamp_millis(), at.timestamp_millis());
    }

    #[test]
    fn test_error_journal_shape() {
        let mut journal = ErrorJournal::new();
        journal.insert(
            "exporting_data".to_string(),
            StageError {
                attempt: 2,
                errors: vec!["load failed".to_string(), "load failed again".to_string()],
            },
        );

        let json = serde_json::to_value(&journal).expect("journal serialises");
        assert_eq!(json["exporting_data"]["attempt"], 2);
        assert_eq!(json["exporting_data"]["errors"][1], "load failed again");
    }
}
