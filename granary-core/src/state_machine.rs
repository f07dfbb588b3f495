//! Upload lifecycle state machine
//!
//! The pipeline is linear: every productive stage persists an in-progress
//! label before its unit of work and either its completed label or a failed
//! label after it. Resumption maps whatever label a crashed job left behind
//! back onto the stage to re-run. The transition table is data on the enum
//! rather than a mutable global registry.

use serde::{Deserialize, Serialize};

/// Status written when fetching the remote warehouse schema fails; this
/// bypasses the per-stage failure labels.
pub const FETCHING_REMOTE_SCHEMA_FAILED: &str = "fetching_remote_schema_failed";

/// Status written when the job fails outside any stage (no staging files,
/// driver setup failure, storage invariant violations).
pub const INTERNAL_PROCESSING_FAILED: &str = "internal_processing_failed";

/// Terminal status for uploads that exhausted their retry budget.
pub const ABORTED: &str = "aborted";

/// Stages of one upload, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStage {
    /// Initial status of a freshly scheduled upload
    Waiting,

    /// Staging-file schemas consolidated into the upload schema
    GeneratedUploadSchema,

    /// One row per target table recorded
    CreatedTableUploads,

    /// Load files produced by the worker fleet
    GeneratedLoadFiles,

    /// Per-table event counts recorded
    UpdatedTableUploadsCounts,

    /// Warehouse namespace created when absent
    CreatedRemoteSchema,

    /// Identifies/users pair loaded
    ExportedUserTables,

    /// Identity merge-rules/mappings pair loaded
    ExportedIdentities,

    /// All remaining tables loaded; terminal success
    ExportedData,

    /// Terminal failure, no further retries
    Aborted,
}

impl UploadStage {
    /// Productive stages in execution order.
    pub const PIPELINE: [UploadStage; 8] = [
        UploadStage::GeneratedUploadSchema,
        UploadStage::CreatedTableUploads,
        UploadStage::GeneratedLoadFiles,
        UploadStage::UpdatedTableUploadsCounts,
        UploadStage::CreatedRemoteSchema,
        UploadStage::ExportedUserTables,
        UploadStage::ExportedIdentities,
        UploadStage::ExportedData,
    ];

    /// The first stage a fresh (or restarted) upload runs.
    pub fn first_productive() -> UploadStage {
        UploadStage::GeneratedUploadSchema
    }

    /// Label persisted when the stage's unit of work completes.
    pub fn completed_label(&self) -> &'static str {
        match self {
            UploadStage::Waiting => "waiting",
            UploadStage::GeneratedUploadSchema => "generated_upload_schema",
            UploadStage::CreatedTableUploads => "created_table_uploads",
            UploadStage::GeneratedLoadFiles => "generated_load_files",
            UploadStage::UpdatedTableUploadsCounts => "updated_table_uploads_counts",
            UploadStage::CreatedRemoteSchema => "created_remote_schema",
            UploadStage::ExportedUserTables => "exported_user_tables",
            UploadStage::ExportedIdentities => "exported_identities",
            UploadStage::ExportedData => "exported_data",
            UploadStage::Aborted => ABORTED,
        }
    }

    /// Label persisted before the stage's unit of work runs. Also the key of
    /// the stage's entry in the upload's error journal. `None` for the
    /// terminal pseudo-stages.
    pub fn in_progress_label(&self) -> Option<&'static str> {
        match self {
            UploadStage::Waiting | UploadStage::Aborted => None,
            UploadStage::GeneratedUploadSchema => Some("generating_upload_schema"),
            UploadStage::CreatedTableUploads => Some("creating_table_uploads"),
            UploadStage::GeneratedLoadFiles => Some("generating_load_files"),
            UploadStage::UpdatedTableUploadsCounts => Some("updating_table_uploads_counts"),
            UploadStage::CreatedRemoteSchema => Some("creating_remote_schema"),
            UploadStage::ExportedUserTables => Some("exporting_user_tables"),
            UploadStage::ExportedIdentities => Some("exporting_identities"),
            UploadStage::ExportedData => Some("exporting_data"),
        }
    }

    /// Label persisted when the stage's unit of work fails but the upload
    /// remains eligible for retry.
    pub fn failed_label(&self) -> Option<&'static str> {
        match self {
            UploadStage::Waiting | UploadStage::Aborted => None,
            UploadStage::GeneratedUploadSchema => Some("failed_generating_upload_schema"),
            UploadStage::CreatedTableUploads => Some("failed_creating_table_uploads"),
            UploadStage::GeneratedLoadFiles => Some("failed_generating_load_files"),
            UploadStage::UpdatedTableUploadsCounts => Some("failed_updating_table_uploads_counts"),
            UploadStage::CreatedRemoteSchema => Some("failed_creating_remote_schema"),
            UploadStage::ExportedUserTables => Some("failed_exporting_user_tables"),
            UploadStage::ExportedIdentities => Some("failed_exporting_identities"),
            UploadStage::ExportedData => Some("failed_exporting_data"),
        }
    }

    /// Successor stage; `None` after `ExportedData` and for `Aborted`.
    pub fn next(&self) -> Option<UploadStage> {
        match self {
            UploadStage::Waiting => Some(UploadStage::GeneratedUploadSchema),
            UploadStage::GeneratedUploadSchema => Some(UploadStage::CreatedTableUploads),
            UploadStage::CreatedTableUploads => Some(UploadStage::GeneratedLoadFiles),
            UploadStage::GeneratedLoadFiles => Some(UploadStage::UpdatedTableUploadsCounts),
            UploadStage::UpdatedTableUploadsCounts => Some(UploadStage::CreatedRemoteSchema),
            UploadStage::CreatedRemoteSchema => Some(UploadStage::ExportedUserTables),
            UploadStage::ExportedUserTables => Some(UploadStage::ExportedIdentities),
            UploadStage::ExportedIdentities => Some(UploadStage::ExportedData),
            UploadStage::ExportedData | UploadStage::Aborted => None,
        }
    }

    /// Map a persisted status label back onto a stage.
    ///
    /// Accepts in-progress, failed, and completed labels; the empty string
    /// maps to `Waiting`. Anything else is an invalid state.
    pub fn from_label(label: &str) -> crate::Result<UploadStage> {
        if label.is_empty() {
            return Ok(UploadStage::Waiting);
        }
        let all = [
            UploadStage::Waiting,
            UploadStage::Aborted,
        ]
        .into_iter()
        .chain(UploadStage::PIPELINE);
        for stage in all {
            if label == stage.completed_label()
                || Some(label) == stage.in_progress_label()
                || Some(label) == stage.failed_label()
            {
                return Ok(stage);
            }
        }
        Err(crate::Error::InvalidState(label.to_string()))
    }

    /// Resumption rule: which stage should a job with persisted status
    /// `status` run next?
    ///
    /// - in-progress or failed label → re-enter the same stage;
    /// - completed label → the successor stage;
    /// - anything unrecognised → `None` (caller restarts from
    ///   [`UploadStage::first_productive`]).
    pub fn next_stage_for_status(status: &str) -> Option<UploadStage> {
        let stage = UploadStage::from_label(status).ok()?;
        if Some(status) == stage.in_progress_label() || Some(status) == stage.failed_label() {
            return Some(stage);
        }
        stage.next()
    }
}

/// Status of one table within one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableStage {
    Waiting,
    UpdatingSchema,
    UpdatedSchema,
    Executing,
    ExportedData,
    UpdatingSchemaFailed,
    ExportingDataFailed,
}

impl TableStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStage::Waiting => "waiting",
            TableStage::UpdatingSchema => "updating_schema",
            TableStage::UpdatedSchema => "updated_schema",
            TableStage::Executing => "executing",
            TableStage::ExportedData => "exported_data",
            TableStage::UpdatingSchemaFailed => "updating_schema_failed",
            TableStage::ExportingDataFailed => "exporting_data_failed",
        }
    }
}

impl std::fmt::Display for TableStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::convert::TryFrom<&str> for TableStage {
    type Error = crate::Error;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "waiting" => Ok(TableStage::Waiting),
            "updating_schema" => Ok(TableStage::UpdatingSchema),
            "updated_schema" => Ok(TableStage::UpdatedSchema),
            "executing" => Ok(TableStage::Executing),
            "exported_data" => Ok(TableStage::ExportedData),
            "updating_schema_failed" => Ok(TableStage::UpdatingSchemaFailed),
            "exporting_data_failed" => Ok(TableStage::ExportingDataFailed),
            _ => Err(crate::Error::InvalidState(s.to_string())),
        }
    }
}

/// Status of one staging file while its batch is being processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingFileStatus {
    Executing,
    Succeeded,
    Failed,
}

impl StagingFileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingFileStatus::Executing => "executing",
            StagingFileStatus::Succeeded => "succeeded",
            StagingFileStatus::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order() {
        let mut stage = UploadStage::Waiting;
        let mut visited = Vec::new();
        while let Some(next) = stage.next() {
            visited.push(next);
            stage = next;
        }
        assert_eq!(visited, UploadStage::PIPELINE.to_vec());
    }

    #[test]
    fn test_labels_round_trip() {
        for stage in UploadStage::PIPELINE {
            assert_eq!(UploadStage::from_label(stage.completed_label()), Ok(stage));
            assert_eq!(
                UploadStage::from_label(stage.in_progress_label().unwrap()),
                Ok(stage)
            );
            assert_eq!(
                UploadStage::from_label(stage.failed_label().unwrap()),
                Ok(stage)
            );
        }
    }

    #[test]
    fn test_empty_label_is_waiting() {
        assert_eq!(UploadStage::from_label(""), Ok(UploadStage::Waiting));
    }

    #[test]
    fn test_unknown_label_is_invalid_state() {
        assert!(matches!(
            UploadStage::from_label("uploading_furiously"),
            Err(crate::Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_resume_re_enters_in_progress_and_failed_stages() {
        assert_eq!(
            UploadStage::next_stage_for_status("generating_load_files"),
            Some(UploadStage::GeneratedLoadFiles)
        );
        assert_eq!(
            UploadStage::next_stage_for_status("failed_exporting_data"),
            Some(UploadStage::ExportedData)
        );
    }

    #[test]
    fn test_resume_advances_past_completed_stages() {
        assert_eq!(
            UploadStage::next_stage_for_status("waiting"),
            Some(UploadStage::GeneratedUploadSchema)
        );
        assert_eq!(
            UploadStage::next_stage_for_status("generated_load_files"),
            Some(UploadStage::UpdatedTableUploadsCounts)
        );
        assert_eq!(UploadStage::next_stage_for_status("exported_data"), None);
    }

    #[test]
    fn test_resume_from_unknown_status_is_none() {
        assert_eq!(UploadStage::next_stage_for_status("not_a_state"), None);
        assert_eq!(
            UploadStage::next_stage_for_status(FETCHING_REMOTE_SCHEMA_FAILED),
            None
        );
    }

    #[test]
    fn test_terminal_stages_have_no_companion_labels() {
        for stage in [UploadStage::Waiting, UploadStage::Aborted] {
            assert!(stage.in_progress_label().is_none());
            assert!(stage.failed_label().is_none());
        }
    }

    #[test]
    fn test_table_stage_round_trip() {
        let stages = [
            TableStage::Waiting,
            TableStage::UpdatingSchema,
            TableStage::UpdatedSchema,
            TableStage::Executing,
            TableStage::ExportedData,
            TableStage::UpdatingSchemaFailed,
            TableStage::ExportingDataFailed,
        ];
        for stage in stages {
            let recovered: TableStage = stage.as_str().try_into().expect("valid table stage");
            assert_eq!(recovered, stage);
        }
    }
}
