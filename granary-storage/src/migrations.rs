//! Embedded database migrations

/// Apply all pending migrations from the crate's `migrations/` directory.
pub async fn run_migrations(pool: &sqlx::PgPool) -> crate::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| crate::Error::Migration(e.to_string()))
}
