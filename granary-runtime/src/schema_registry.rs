//! Job-scoped schema snapshots
//!
//! One registry lives for the duration of one upload job and holds three
//! snapshots: the locally cached warehouse schema, the schema observed live
//! at the start of the run, and the consolidated schema the job intends to
//! load. The warehouse snapshot is shared with the concurrent per-table
//! loaders, which merge their applied diffs back in under the lock.

use crate::warehouse_manager::WarehouseManager;
use crate::{Error, Result};
use granary_core::schema::{
    self, Schema, TableSchema, TableSchemaDiff,
};
use granary_core::warehouse::Warehouse;
use granary_storage::{StagingFileModel, UploadStore};
use std::sync::Mutex;
use tracing::{debug, instrument};

/// Schema snapshots for one upload job
#[derive(Default)]
pub struct SchemaRegistry {
    local: Mutex<Schema>,
    warehouse: Mutex<Schema>,
    upload: Mutex<Schema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the live warehouse schema and reconcile it with the local
    /// cache. Returns whether the two differed semantically; on change the
    /// live schema is persisted as the new local copy.
    #[instrument(skip_all, fields(warehouse = %warehouse.identifier()))]
    pub async fn sync_remote(
        &self,
        manager: &dyn WarehouseManager,
        store: &dyn UploadStore,
        warehouse: &Warehouse,
    ) -> Result<bool> {
        let local = store.local_schema(warehouse).await?;
        let live = manager
            .fetch_schema_from_warehouse()
            .await
            .map_err(|e| Error::FetchingRemoteSchema(e.to_string()))?;

        let changed = !schema::schemas_equivalent(&local, &live);
        if changed {
            debug!("Remote warehouse schema differs from local cache");
            store.update_local_schema(warehouse, &live).await?;
        }

        *self.lock(&self.local) = live.clone();
        *self.lock(&self.warehouse) = live;
        Ok(changed)
    }

    /// Consolidate the sampled staging-file schemas with the warehouse
    /// snapshot into the schema this upload will load.
    pub fn consolidate(&self, staging_files: &[StagingFileModel]) -> Schema {
        let staging: Vec<Schema> = staging_files.iter().map(|f| f.schema.0.clone()).collect();
        let warehouse = self.warehouse_schema();
        schema::consolidate_staging_schemas(&staging, &warehouse)
    }

    pub fn set_upload_schema(&self, schema: Schema) {
        *self.lock(&self.upload) = schema;
    }

    pub fn upload_schema(&self) -> Schema {
        self.lock(&self.upload).clone()
    }

    pub fn warehouse_schema(&self) -> Schema {
        self.lock(&self.warehouse).clone()
    }

    pub fn warehouse_schema_is_empty(&self) -> bool {
        self.lock(&self.warehouse).is_empty()
    }

    pub fn table_schema_in_warehouse(&self, table: &str) -> TableSchema {
        self.lock(&self.warehouse)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn table_schema_in_upload(&self, table: &str) -> TableSchema {
        self.lock(&self.upload)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Diff between the upload schema of `table` and the current warehouse
    /// snapshot.
    pub fn table_diff(&self, table: &str) -> TableSchemaDiff {
        let upload = self.lock(&self.upload);
        let warehouse = self.lock(&self.warehouse);
        schema::table_schema_diff(table, &upload, &warehouse)
    }

    /// Merge the applied diff of one table back into the warehouse
    /// snapshot. Called concurrently by the per-table loaders.
    pub fn set_updated_table_schema(&self, table: &str, columns: TableSchema) {
        self.lock(&self.warehouse).insert(table.to_string(), columns);
    }

    fn lock<'a>(&self, m: &'a Mutex<Schema>) -> std::sync::MutexGuard<'a, Schema> {
        m.lock().expect("schema registry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn table(columns: &[(&str, &str)]) -> TableSchema {
        columns
            .iter()
            .map(|(c, t)| (c.to_string(), t.to_string()))
            .collect()
    }

    #[test]
    fn test_updated_table_schema_is_visible_in_diff() {
        let registry = SchemaRegistry::new();
        let mut upload = Schema::new();
        upload.insert("events".to_string(), table(&[("id", "string")]));
        registry.set_upload_schema(upload);

        // table missing from the warehouse: full create
        let diff = registry.table_diff("events");
        assert!(diff.table_to_be_created);

        registry.set_updated_table_schema("events", table(&[("id", "string")]));
        let diff = registry.table_diff("events");
        assert!(!diff.exists);
    }

    #[test]
    fn test_table_schema_lookups_default_to_empty() {
        let registry = SchemaRegistry::new();
        assert_eq!(registry.table_schema_in_upload("missing"), BTreeMap::new());
        assert_eq!(
            registry.table_schema_in_warehouse("missing"),
            BTreeMap::new()
        );
    }
}
