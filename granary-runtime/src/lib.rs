//! # Granary Runtime
//!
//! The upload orchestrator: drives one upload through its persisted state
//! machine — schema consolidation, load-file generation via the worker bus,
//! remote schema sync, and bounded-parallel table loading — with stage-keyed
//! error journalling and retry/abort accounting.

pub mod config;
pub mod identity;
pub mod load_files;
pub mod metrics;
pub mod notifier;
pub mod schema_registry;
pub mod table_loader;
pub mod upload_job;
pub mod warehouse_manager;

// Re-export commonly used types
pub use config::UploadConfig;
pub use identity::IdentityResolver;
pub use notifier::{Notifier, NotifierMessage, NotifierPayload, NotifierResponse};
pub use schema_registry::SchemaRegistry;
pub use upload_job::{UploadJob, UploadJobContext};
pub use warehouse_manager::{LoadTableResults, Uploader, WarehouseManager};

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for runtime operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] granary_storage::Error),

    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("Notifier error: {0}")]
    Notifier(String),

    #[error("Fetching remote schema failed: {0}")]
    FetchingRemoteSchema(String),

    #[error("Internal processing failed: {0}")]
    InternalProcessing(String),

    #[error("No load files generated")]
    NoLoadFilesGenerated,

    #[error("Table loads failed: {0}")]
    TableLoads(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),
}
