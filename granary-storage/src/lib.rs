//! # Granary Storage
//!
//! PostgreSQL persistence for the warehouse upload pipeline: upload rows,
//! per-table upload rows, staging-file status, load-file lookups and the
//! cached copy of each namespace's warehouse schema.

pub mod migrations;
pub mod models;
pub mod postgres;
pub mod store;

// Re-export commonly used types
pub use models::{
    ColumnValue, ErrorJournal, LoadFileModel, StageError, StagingFileModel, TableUploadModel,
    TableUploadStatus, Timings, UploadColumn, UploadModel,
};
pub use postgres::PostgresUploadStore;
pub use store::{LoadFileScope, UploadStore};

/// JSON column wrapper used by the models; re-exported so callers can
/// construct model values without depending on sqlx directly.
pub use sqlx::types::Json;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Column not updatable: {0}")]
    InvalidColumn(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
