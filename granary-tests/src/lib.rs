//! Shared test utilities for Granary crates
//!
//! This crate provides:
//! - **Mocks**: an in-memory `UploadStore`, a scriptable destination driver
//!   and a scriptable notifier, so upload jobs run end to end without a
//!   database, a warehouse or a worker fleet
//! - **Builders**: fluent construction of uploads and staging files
//! - **Fixtures**: common schemas and warehouse definitions
//! - **Assertions**: verification helpers for timings and journals

pub mod assertions;
pub mod builders;
pub mod fixtures;
pub mod mocks;

// Re-export commonly used items
pub use builders::{StagingFileBuilder, UploadBuilder};
pub use mocks::{InMemoryUploadStore, MockIdentityResolver, MockNotifier, MockWarehouseManager};
