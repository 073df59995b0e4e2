use anyhow::{Context, Result};
use sqlx::{migrate::Migrator, postgres::PgPool};
use tracing::info;

/// Embedded schema for the `documents` snapshot table.
pub static MIGRATOR: Migrator = sqlx::migrate!("./src/db/migrations");

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("failed to apply document snapshot migrations")?;
    info!(migrations = MIGRATOR.iter().count(), "document snapshot schema is up to date");
    Ok(())
}
