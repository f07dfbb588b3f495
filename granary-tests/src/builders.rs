//! Type-safe builders for constructing test objects

use chrono::{DateTime, Utc};
use granary_core::schema::Schema;
use granary_core::warehouse::DestinationType;
use granary_storage::models::format_timing;
use granary_storage::{Json, StageError, StagingFileModel, UploadModel};
use std::collections::BTreeMap;

/// Builder for upload rows
pub struct UploadBuilder {
    upload: UploadModel,
}

impl Default for UploadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            upload: UploadModel {
                id: 1,
                namespace: "analytics".to_string(),
                source_id: "src-1".to_string(),
                destination_id: "dst-1".to_string(),
                destination_type: DestinationType::Postgres.as_str().to_string(),
                start_staging_file_id: 1,
                end_staging_file_id: 1,
                start_load_file_id: 0,
                end_load_file_id: 0,
                status: "waiting".to_string(),
                schema: Json(Schema::new()),
                error: Json(Default::default()),
                timings: Json(Vec::new()),
                metadata: Json(serde_json::json!({})),
                first_attempt_at: None,
                last_attempt_at: None,
                attempts: 0,
                last_exec_at: None,
                first_event_at: None,
                last_event_at: None,
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn id(mut self, id: i64) -> Self {
        self.upload.id = id;
        self
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.upload.namespace = namespace.to_string();
        self
    }

    pub fn destination_type(mut self, destination_type: DestinationType) -> Self {
        self.upload.destination_type = destination_type.as_str().to_string();
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.upload.status = status.to_string();
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.upload.schema = Json(schema);
        self
    }

    pub fn staging_file_range(mut self, start: i64, end: i64) -> Self {
        self.upload.start_staging_file_id = start;
        self.upload.end_staging_file_id = end;
        self
    }

    pub fn load_file_range(mut self, start: i64, end: i64) -> Self {
        self.upload.start_load_file_id = start;
        self.upload.end_load_file_id = end;
        self
    }

    pub fn attempts(mut self, attempts: i64) -> Self {
        self.upload.attempts = attempts;
        self
    }

    pub fn last_attempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.upload.last_attempt_at = Some(at);
        self
    }

    /// Seed the error journal with a prior stage failure.
    pub fn stage_error(mut self, stage: &str, attempt: i64, errors: &[&str]) -> Self {
        self.upload.error.0.insert(
            stage.to_string(),
            StageError {
                attempt,
                errors: errors.iter().map(|e| e.to_string()).collect(),
            },
        );
        self
    }

    /// Seed a timings entry, e.g. the first attempt of a prior run.
    pub fn timing(mut self, status: &str, at: DateTime<Utc>) -> Self {
        let mut entry = BTreeMap::new();
        entry.insert(status.to_string(), format_timing(at));
        self.upload.timings.0.push(entry);
        self
    }

    pub fn build(self) -> UploadModel {
        self.upload
    }
}

/// Builder for staging-file rows
pub struct StagingFileBuilder {
    staging_file: StagingFileModel,
}

impl Default for StagingFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StagingFileBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            staging_file: StagingFileModel {
                id: 1,
                location: "s3://staging/batch-1.json.gz".to_string(),
                source_id: "src-1".to_string(),
                destination_id: "dst-1".to_string(),
                schema: Json(Schema::new()),
                status: "waiting".to_string(),
                error: None,
                first_event_at: None,
                last_event_at: None,
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn id(mut self, id: i64) -> Self {
        self.staging_file.id = id;
        self.staging_file.location = format!("s3://staging/batch-{}.json.gz", id);
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.staging_file.schema = Json(schema);
        self
    }

    pub fn build(self) -> StagingFileModel {
        self.staging_file
    }
}
