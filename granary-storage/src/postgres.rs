//! PostgreSQL implementation of the upload store

use crate::models::*;
use crate::store::{LoadFileScope, UploadStore};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use granary_core::retry::RetryPolicy;
use granary_core::schema::Schema;
use granary_core::state_machine::{StagingFileStatus, TableStage, ABORTED};
use granary_core::warehouse::Warehouse;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{instrument, warn};

/// Configuration for the PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 30,
            idle_timeout_secs: None,
        }
    }
}

/// PostgreSQL-backed upload store
pub struct PostgresUploadStore {
    pool: PgPool,
    retry: RetryPolicy,
}

/// Columns `set_upload_columns` / `set_upload_status` may touch. Column
/// names are never taken from input; anything outside this list is
/// rejected before SQL is built.
const UPDATABLE_UPLOAD_COLUMNS: [&str; 9] = [
    UPLOAD_STATUS_COLUMN,
    UPLOAD_SCHEMA_COLUMN,
    UPLOAD_ERROR_COLUMN,
    UPLOAD_TIMINGS_COLUMN,
    UPLOAD_METADATA_COLUMN,
    UPLOAD_START_LOAD_FILE_ID_COLUMN,
    UPLOAD_END_LOAD_FILE_ID_COLUMN,
    UPLOAD_LAST_EXEC_AT_COLUMN,
    UPLOAD_UPDATED_AT_COLUMN,
];

fn validate_upload_column(column: &str) -> Result<()> {
    if UPDATABLE_UPLOAD_COLUMNS.contains(&column) {
        Ok(())
    } else {
        Err(crate::Error::InvalidColumn(column.to_string()))
    }
}

fn push_column_value(qb: &mut QueryBuilder<'_, Postgres>, value: ColumnValue) {
    match value {
        ColumnValue::Text(v) => {
            qb.push_bind(v);
        }
        ColumnValue::BigInt(v) => {
            qb.push_bind(v);
        }
        ColumnValue::Timestamp(v) => {
            qb.push_bind(v);
        }
        ColumnValue::Json(v) => {
            qb.push_bind(sqlx::types::Json(v));
        }
    }
}

impl PostgresUploadStore {
    /// Connect with default pool settings
    pub async fn new(database_url: &str, retry: RetryPolicy) -> Result<Self> {
        Self::with_pool_config(database_url, PoolConfig::default(), retry).await
    }

    /// Connect using an explicit pool configuration
    pub async fn with_pool_config(
        database_url: &str,
        config: PoolConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        if config.max_connections == 0 || config.max_connections < config.min_connections {
            return Err(crate::Error::Internal(
                "max_connections must be >= min_connections and > 0".to_string(),
            ));
        }

        let mut opts = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs));
        if let Some(idle) = config.idle_timeout_secs {
            opts = opts.idle_timeout(std::time::Duration::from_secs(idle));
        }

        let pool = opts.connect(database_url).await?;
        Ok(Self { pool, retry })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute a closure within a transaction: commit on success, roll back
    /// on error. Slow transactions (>100ms) are logged.
    async fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Transaction<'_, Postgres>) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;

        let result = match f(&mut tx).await {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        };

        let elapsed = start.elapsed();
        if elapsed.as_millis() > 100 {
            warn!(duration_ms = elapsed.as_millis(), "Slow database operation detected");
        }

        result
    }

    /// Append one `{status: now}` entry and write `status`, `timings`,
    /// `updated_at` plus `extra` columns in a single statement. Returns the
    /// new timings journal.
    async fn write_status<'c>(
        tx: &mut Transaction<'c, Postgres>,
        id: i64,
        status: &str,
        extra: Vec<UploadColumn>,
        now: DateTime<Utc>,
    ) -> Result<Timings> {
        let timings: Option<sqlx::types::Json<Timings>> =
            sqlx::query_scalar("SELECT timings FROM wh_uploads WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;
        let mut timings = timings
            .ok_or_else(|| crate::Error::NotFound(format!("Upload {}", id)))?
            .0;

        let mut entry = BTreeMap::new();
        entry.insert(status.to_string(), format_timing(now));
        timings.push(entry);

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("UPDATE wh_uploads SET status = ");
        qb.push_bind(status.to_string());
        qb.push(", timings = ");
        qb.push_bind(sqlx::types::Json(timings.clone()));
        qb.push(", updated_at = ");
        qb.push_bind(now);
        for column in extra {
            validate_upload_column(column.column)?;
            qb.push(format!(", {} = ", column.column));
            push_column_value(&mut qb, column.value);
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id);

        qb.build().execute(&mut **tx).await?;
        Ok(timings)
    }
}

#[async_trait]
impl UploadStore for PostgresUploadStore {
    #[instrument(skip(self), fields(db.sql.table = "wh_uploads", upload_id = %id))]
    async fn get_upload(&self, id: i64) -> Result<UploadModel> {
        sqlx::query_as::<_, UploadModel>("SELECT * FROM wh_uploads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| crate::Error::NotFound(format!("Upload {}", id)))
    }

    #[instrument(skip(self, extra), fields(db.sql.table = "wh_uploads", upload_id = %id, status = %status))]
    async fn set_upload_status(
        &self,
        id: i64,
        status: &str,
        extra: Vec<UploadColumn>,
    ) -> Result<()> {
        let status = status.to_string();
        self.with_transaction(move |tx| {
            Box::pin(async move {
                Self::write_status(tx, id, &status, extra, Utc::now()).await?;
                Ok(())
            })
        })
        .await
    }

    #[instrument(skip(self, columns), fields(db.sql.table = "wh_uploads", upload_id = %id))]
    async fn set_upload_columns(&self, id: i64, columns: Vec<UploadColumn>) -> Result<()> {
        if columns.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("UPDATE wh_uploads SET updated_at = ");
        qb.push_bind(Utc::now());
        for column in columns {
            validate_upload_column(column.column)?;
            qb.push(format!(", {} = ", column.column));
            push_column_value(&mut qb, column.value);
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id);

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(crate::Error::NotFound(format!("Upload {}", id)));
        }
        Ok(())
    }

    async fn set_upload_schema(&self, id: i64, schema: &Schema) -> Result<()> {
        self.set_upload_columns(
            id,
            vec![UploadColumn::new(
                UPLOAD_SCHEMA_COLUMN,
                ColumnValue::Json(serde_json::to_value(schema)?),
            )],
        )
        .await
    }

    async fn set_load_file_ids(&self, id: i64, start: i64, end: i64) -> Result<()> {
        self.set_upload_columns(
            id,
            vec![
                UploadColumn::new(UPLOAD_START_LOAD_FILE_ID_COLUMN, ColumnValue::BigInt(start)),
                UploadColumn::new(UPLOAD_END_LOAD_FILE_ID_COLUMN, ColumnValue::BigInt(end)),
            ],
        )
        .await
    }

    #[instrument(
        skip(self, message),
        fields(db.sql.table = "wh_uploads", upload_id = %id, stage = %journal_key)
    )]
    async fn set_upload_error(
        &self,
        id: i64,
        journal_key: &str,
        failure_status: &str,
        message: &str,
    ) -> Result<String> {
        let retry = self.retry.clone();
        let journal_key = journal_key.to_string();
        let failure_status = failure_status.to_string();
        let message = message.to_string();

        self.with_transaction(move |tx| {
            Box::pin(async move {
                let now = Utc::now();

                let row: Option<(
                    sqlx::types::Json<ErrorJournal>,
                    sqlx::types::Json<serde_json::Value>,
                    i64,
                    Option<DateTime<Utc>>,
                )> = sqlx::query_as(
                    "SELECT error, metadata, attempts, last_attempt_at \
                     FROM wh_uploads WHERE id = $1 FOR UPDATE",
                )
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;
                let (journal, metadata, attempts, last_attempt_at) =
                    row.ok_or_else(|| crate::Error::NotFound(format!("Upload {}", id)))?;

                let mut journal = journal.0;
                let entry = journal.entry(journal_key.clone()).or_default();
                entry.attempt += 1;
                entry.errors.push(message.clone());
                let stage_attempt = entry.attempt;

                let timings = Self::write_status(tx, id, &failure_status, Vec::new(), now).await?;
                let first_attempt = timings.first().and_then(parse_timing);

                let status = if retry.should_abort(stage_attempt, first_attempt, now) {
                    ABORTED.to_string()
                } else {
                    failure_status
                };

                let mut metadata = metadata.0;
                if !metadata.is_object() {
                    metadata = serde_json::json!({});
                }
                let next_retry = last_attempt_at.unwrap_or(now) + retry.backoff(attempts);
                metadata["nextRetryTime"] = serde_json::Value::String(next_retry.to_rfc3339());

                sqlx::query(
                    "UPDATE wh_uploads SET status = $1, error = $2, metadata = $3, updated_at = $4 \
                     WHERE id = $5",
                )
                .bind(&status)
                .bind(sqlx::types::Json(journal))
                .bind(sqlx::types::Json(metadata))
                .bind(now)
                .bind(id)
                .execute(&mut **tx)
                .await?;

                Ok(status)
            })
        })
        .await
    }

    async fn first_attempt_time(&self, id: i64) -> Result<Option<DateTime<Utc>>> {
        let timings: Option<sqlx::types::Json<Timings>> =
            sqlx::query_scalar("SELECT timings FROM wh_uploads WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(timings.and_then(|t| t.0.first().and_then(parse_timing)))
    }

    #[instrument(skip(self, tables), fields(db.sql.table = "wh_table_uploads", upload_id = %upload_id))]
    async fn create_table_uploads(&self, upload_id: i64, tables: &[String]) -> Result<()> {
        sqlx::query(
            "INSERT INTO wh_table_uploads (wh_upload_id, table_name, status, created_at, updated_at) \
             SELECT $1, t, $3, $4, $4 FROM UNNEST($2::text[]) AS t \
             ON CONFLICT (wh_upload_id, table_name) DO NOTHING",
        )
        .bind(upload_id)
        .bind(tables)
        .bind(TableStage::Waiting.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_table_upload(&self, upload_id: i64, table: &str) -> Result<TableUploadModel> {
        sqlx::query_as::<_, TableUploadModel>(
            "SELECT * FROM wh_table_uploads WHERE wh_upload_id = $1 AND table_name = $2",
        )
        .bind(upload_id)
        .bind(table)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| crate::Error::NotFound(format!("Table upload {}/{}", upload_id, table)))
    }

    async fn set_table_upload_status(
        &self,
        upload_id: i64,
        table: &str,
        status: TableStage,
    ) -> Result<()> {
        let now = Utc::now();
        let result = if status == TableStage::Executing {
            sqlx::query(
                "UPDATE wh_table_uploads SET status = $3, last_exec_time = $4, updated_at = $4 \
                 WHERE wh_upload_id = $1 AND table_name = $2",
            )
            .bind(upload_id)
            .bind(table)
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE wh_table_uploads SET status = $3, updated_at = $4 \
                 WHERE wh_upload_id = $1 AND table_name = $2",
            )
            .bind(upload_id)
            .bind(table)
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?
        };
        if result.rows_affected() == 0 {
            return Err(crate::Error::NotFound(format!(
                "Table upload {}/{}",
                upload_id, table
            )));
        }
        Ok(())
    }

    async fn set_table_upload_error(
        &self,
        upload_id: i64,
        table: &str,
        status: TableStage,
        error: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE wh_table_uploads SET status = $3, error = $4, updated_at = $5 \
             WHERE wh_upload_id = $1 AND table_name = $2",
        )
        .bind(upload_id)
        .bind(table)
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(crate::Error::NotFound(format!(
                "Table upload {}/{}",
                upload_id, table
            )));
        }
        Ok(())
    }

    async fn set_table_upload_total_events(
        &self,
        upload_id: i64,
        table: &str,
        total_events: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE wh_table_uploads SET total_events = $3, updated_at = $4 \
             WHERE wh_upload_id = $1 AND table_name = $2",
        )
        .bind(upload_id)
        .bind(table)
        .bind(total_events)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_table_upload_location(
        &self,
        upload_id: i64,
        table: &str,
        location: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE wh_table_uploads SET location = $3, updated_at = $4 \
             WHERE wh_upload_id = $1 AND table_name = $2",
        )
        .bind(upload_id)
        .bind(table)
        .bind(location)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn table_upload_location(&self, upload_id: i64, table: &str) -> Result<Option<String>> {
        let location: Option<Option<String>> = sqlx::query_scalar(
            "SELECT location FROM wh_table_uploads WHERE wh_upload_id = $1 AND table_name = $2",
        )
        .bind(upload_id)
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        Ok(location.flatten())
    }

    #[instrument(skip(self), fields(db.sql.table = "wh_table_uploads", upload_id = %upload_id))]
    async fn pending_table_statuses(
        &self,
        upload_id: i64,
        destination_id: &str,
        namespace: &str,
    ) -> Result<Vec<TableUploadStatus>> {
        let rows = sqlx::query_as::<_, TableUploadStatus>(
            "SELECT u.id AS upload_id, t.table_name, t.status \
             FROM wh_uploads u \
             JOIN wh_table_uploads t ON u.id = t.wh_upload_id \
             WHERE u.id <= $1 \
               AND u.destination_id = $2 \
               AND u.namespace = $3 \
               AND u.status <> $4 \
               AND u.status <> $5 \
               AND t.table_name IN ( \
                   SELECT table_name FROM wh_table_uploads WHERE wh_upload_id = $1 \
               ) \
             ORDER BY u.id ASC",
        )
        .bind(upload_id)
        .bind(destination_id)
        .bind(namespace)
        .bind(granary_core::UploadStage::ExportedData.completed_label())
        .bind(ABORTED)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_staging_files_status(
        &self,
        ids: &[i64],
        status: StagingFileStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE wh_staging_files SET status = $1, error = $2, updated_at = $3 \
             WHERE id = ANY($4)",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_load_files(&self, scope: &LoadFileScope) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS ( \
                 SELECT 1 FROM wh_load_files \
                 WHERE source_id = $1 AND destination_id = $2 AND table_name = $3 \
                   AND id BETWEEN $4 AND $5 \
             )",
        )
        .bind(&scope.source_id)
        .bind(&scope.destination_id)
        .bind(&scope.table_name)
        .bind(scope.start_load_file_id)
        .bind(scope.end_load_file_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn total_events_in_load_files(&self, scope: &LoadFileScope) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(total_events), 0)::bigint FROM ( \
                 SELECT DISTINCT ON (staging_file_id) total_events \
                 FROM wh_load_files \
                 WHERE source_id = $1 AND destination_id = $2 AND table_name = $3 \
                   AND id BETWEEN $4 AND $5 \
                 ORDER BY staging_file_id, id DESC \
             ) latest",
        )
        .bind(&scope.source_id)
        .bind(&scope.destination_id)
        .bind(&scope.table_name)
        .bind(scope.start_load_file_id)
        .bind(scope.end_load_file_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn load_file_locations(&self, scope: &LoadFileScope) -> Result<Vec<String>> {
        let locations: Vec<String> = sqlx::query_scalar(
            "SELECT location FROM ( \
                 SELECT DISTINCT ON (staging_file_id) staging_file_id, id, location \
                 FROM wh_load_files \
                 WHERE source_id = $1 AND destination_id = $2 AND table_name = $3 \
                   AND id BETWEEN $4 AND $5 \
                 ORDER BY staging_file_id, id DESC \
             ) latest ORDER BY id ASC",
        )
        .bind(&scope.source_id)
        .bind(&scope.destination_id)
        .bind(&scope.table_name)
        .bind(scope.start_load_file_id)
        .bind(scope.end_load_file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(locations)
    }

    async fn local_schema(&self, warehouse: &Warehouse) -> Result<Schema> {
        let schema: Option<sqlx::types::Json<Schema>> = sqlx::query_scalar(
            "SELECT schema FROM wh_schemas \
             WHERE source_id = $1 AND destination_id = $2 AND namespace = $3",
        )
        .bind(&warehouse.source.id)
        .bind(&warehouse.destination.id)
        .bind(&warehouse.namespace)
        .fetch_optional(&self.pool)
        .await?;
        Ok(schema.map(|s| s.0).unwrap_or_default())
    }

    #[instrument(skip(self, schema), fields(db.sql.table = "wh_schemas", namespace = %warehouse.namespace))]
    async fn update_local_schema(&self, warehouse: &Warehouse, schema: &Schema) -> Result<()> {
        sqlx::query(
            "INSERT INTO wh_schemas (source_id, destination_id, namespace, schema, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5) \
             ON CONFLICT (source_id, destination_id, namespace) \
             DO UPDATE SET schema = EXCLUDED.schema, updated_at = EXCLUDED.updated_at",
        )
        .bind(&warehouse.source.id)
        .bind(&warehouse.destination.id)
        .bind(&warehouse.namespace)
        .bind(sqlx::types::Json(schema))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_column_allow_list() {
        assert!(validate_upload_column("status").is_ok());
        assert!(validate_upload_column("last_exec_at").is_ok());
        assert!(validate_upload_column("id").is_err());
        assert!(validate_upload_column("status; DROP TABLE wh_uploads").is_err());
    }
}
