use std::str::FromStr;

use crate::config::DatabaseConfig;
use crate::context::Context;
use crate::error::ApiscopeError;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

/// Pool whose connections resolve unqualified names in `schema` first.
pub async fn create_schema_pool(url: &str, schema: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(url)?.options([("search_path", schema)]);
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Apply the bundled migrations to the pool's search path.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../migrations").run(pool).await
}

/// Schemas holding the analysis tables, by name. Every provisioned tenant
/// schema shows up here, as does the default one once migrated.
pub async fn analysis_schemas(pool: &PgPool, prefix: &str) -> Result<Vec<String>, sqlx::Error> {
    let schemas: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT n.nspname::TEXT FROM pg_namespace n
        WHERE EXISTS (SELECT 1 FROM pg_class c WHERE c.relnamespace = n.oid AND c.relname = 'endpoint' AND c.relkind = 'r')
          AND EXISTS (SELECT 1 FROM pg_class c WHERE c.relnamespace = n.oid AND c.relname = 'trace' AND c.relkind = 'r')
        ORDER BY n.nspname
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(schemas.into_iter().filter(|s| s.starts_with(prefix)).collect())
}

/// Create the context's schema if needed and apply the migrations inside it.
pub async fn provision_schema(url: &str, ctx: &Context) -> Result<(), ApiscopeError> {
    let admin = PgPoolOptions::new().max_connections(1).connect(url).await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", ctx.schema()))
        .execute(&admin)
        .await?;
    admin.close().await;

    let pool = create_schema_pool(url, ctx.schema(), 1).await?;
    run_migrations(&pool).await?;
    pool.close().await;
    tracing::info!(schema = ctx.schema(), "Schema provisioned");
    Ok(())
}
