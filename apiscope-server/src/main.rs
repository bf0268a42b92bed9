use std::sync::Arc;

use apiscope_core::{ApiscopeConfig, Context};
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use apiscope_server::http::{start_http_server, HttpState};
use apiscope_server::queue::{PgQueue, WorkQueue};
use apiscope_server::subsystems::scheduler::{self, JobKind};
use apiscope_server::subsystems::worker;
use apiscope_server::Engine;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "apiscope.toml")]
    config: String,

    /// Check the database connection and exit.
    #[arg(long)]
    health: bool,

    /// Apply migrations and exit.
    #[arg(long)]
    migrate_only: bool,

    /// Run one batch job (backfill, sweep, openapi, rollup, hsts), print its report and exit.
    #[arg(long, value_name = "JOB")]
    run_job: Option<String>,

    /// Schema for `--run-job`. Without it the job runs in every analysis schema.
    #[arg(long, value_name = "SCHEMA", requires = "run_job")]
    context: Option<String>,

    #[arg(long)]
    no_worker: bool,

    #[arg(long)]
    no_jobs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match ApiscopeConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let pool = match apiscope_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match apiscope_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    apiscope_core::db::run_migrations(&pool).await?;
    migrate_tenant_schemas(&pool, &config).await?;
    if args.migrate_only {
        println!("✅ Migrations applied");
        return Ok(());
    }

    let engine = Arc::new(Engine::new(pool.clone(), config)?);

    if let Some(job) = args.run_job {
        let Some(kind) = JobKind::parse(&job) else {
            eprintln!("Unknown job '{}'", job);
            std::process::exit(2);
        };
        let report = match args.context {
            Some(schema) => {
                let ctx = Context::new(schema)?;
                scheduler::run_job(&engine, &ctx, kind).await?
            }
            None => serde_json::Value::Object(scheduler::run_job_everywhere(&engine, kind).await?),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let queue: Arc<dyn WorkQueue> = Arc::new(PgQueue::new(pool));

    let mut handles = Vec::new();
    if !args.no_worker {
        handles.extend(worker::spawn_workers(Arc::clone(&engine), Arc::clone(&queue), &tx));
    }
    if !args.no_jobs {
        handles.extend(scheduler::spawn_scheduler(Arc::clone(&engine), &tx));
    }

    if engine.config.http.enabled {
        let state = Arc::new(HttpState {
            engine: Arc::clone(&engine),
            queue: Arc::clone(&queue),
        });
        let http_shutdown = tx.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = start_http_server(state, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        }));
    }

    if handles.is_empty() {
        tracing::warn!("Nothing enabled, exiting");
        return Ok(());
    }

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Task panicked: {}", e);
        }
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Bring the default schema and every provisioned tenant schema up to the
/// bundled migrations. `public` is covered by the pool's own run.
async fn migrate_tenant_schemas(pool: &sqlx::PgPool, config: &ApiscopeConfig) -> anyhow::Result<()> {
    let mut schemas = apiscope_core::db::analysis_schemas(pool, &config.jobs.schema_prefix).await?;
    schemas.push(config.service.default_schema.clone());
    schemas.sort();
    schemas.dedup();
    for schema in schemas.into_iter().filter(|s| s != "public") {
        match Context::new(schema) {
            Ok(ctx) => apiscope_core::db::provision_schema(&config.database.url, &ctx).await?,
            Err(e) => tracing::warn!(error = %e, "Skipping schema"),
        }
    }
    Ok(())
}
