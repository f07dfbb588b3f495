//! # Granary Core
//!
//! Domain model for the Granary warehouse upload pipeline: destination and
//! schema types, the upload lifecycle state machine, and the retry policy
//! applied to failed upload stages.

pub mod retry;
pub mod schema;
pub mod state_machine;
pub mod warehouse;

// Re-export commonly used types
pub use retry::RetryPolicy;
pub use schema::{Schema, TableSchema, TableSchemaDiff};
pub use state_machine::{TableStage, UploadStage};
pub use warehouse::{Destination, DestinationType, Source, Warehouse};

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for core operations
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("Invalid upload state: {0}")]
    InvalidState(String),

    #[error("Unknown destination type: {0}")]
    UnknownDestination(String),
}
