//! Destination-driver contract and the callback surface the orchestrator
//! exposes back to drivers
//!
//! A `WarehouseManager` implements the warehouse-specific SQL and data
//! movement for one destination kind. Drivers never touch pipeline state
//! directly; everything they need from the running job comes through the
//! [`Uploader`] callbacks handed to [`WarehouseManager::setup`].

use crate::Result;
use async_trait::async_trait;
use granary_core::schema::{Schema, TableSchema};
use granary_core::warehouse::Warehouse;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of an atomic multi-table load: table name → error message
/// (`None` on success).
pub type LoadTableResults = HashMap<String, Option<String>>;

/// Warehouse-specific operations implemented per destination kind.
///
/// Implementations must be safe to share across the concurrent per-table
/// load tasks of one job. An `add_column` failure because the column
/// already exists is reported like any other error; the per-table status
/// records it and the job retries idempotently.
#[async_trait]
pub trait WarehouseManager: Send + Sync {
    /// Prepare the driver for one job. `uploader` stays valid for the whole
    /// run and is the driver's only view into pipeline state.
    async fn setup(&self, warehouse: &Warehouse, uploader: Arc<dyn Uploader>) -> Result<()>;

    /// Release connections and scratch state. Called on every exit path
    /// after a successful `setup`.
    async fn cleanup(&self);

    /// Create the namespace (schema/dataset) in the warehouse.
    async fn create_schema(&self) -> Result<()>;

    async fn create_table(&self, table: &str, columns: &TableSchema) -> Result<()>;

    async fn add_column(&self, table: &str, column: &str, column_type: &str) -> Result<()>;

    async fn alter_column(&self, table: &str, column: &str, column_type: &str) -> Result<()>;

    async fn load_table(&self, table: &str) -> Result<()>;

    /// Load the identifies and users tables atomically. Returns one entry
    /// per attempted table.
    async fn load_user_tables(&self) -> LoadTableResults;

    async fn load_identity_merge_rules_table(&self) -> Result<()>;

    async fn load_identity_mappings_table(&self) -> Result<()>;

    /// Fetch the live schema of the namespace.
    async fn fetch_schema_from_warehouse(&self) -> Result<Schema>;
}

/// Callbacks the orchestrator provides to the destination driver.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Live warehouse schema snapshot, including per-table updates applied
    /// during this run.
    fn schema_in_warehouse(&self) -> Schema;

    fn table_schema_in_warehouse(&self, table: &str) -> TableSchema;

    fn table_schema_in_upload(&self, table: &str) -> TableSchema;

    /// Locations of this upload's load files for `table` (latest per
    /// staging file).
    async fn load_file_locations(&self, table: &str) -> Result<Vec<String>>;

    /// Any one load-file location for `table`; `NotFound` when the upload
    /// produced none.
    async fn sample_load_file_location(&self, table: &str) -> Result<String>;

    /// The representative location recorded on the table-upload row.
    async fn single_load_file_location(&self, table: &str) -> Result<String>;
}
