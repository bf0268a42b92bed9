//! Batch job scheduler.
//!
//! Every job runs on its own interval, once per analysis schema (the default
//! one plus each provisioned tenant schema). A failed run in one schema is
//! logged and the rest still run. The same entry points serve `--run-job`
//! and `POST /jobs/{job}`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use apiscope_core::Context;
use tokio::sync::broadcast;

use super::{backfill, hsts, openapi, rollup, sweep};
use crate::engine::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Backfill,
    Sweep,
    OpenApi,
    Rollup,
    Hsts,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Backfill,
        JobKind::Sweep,
        JobKind::OpenApi,
        JobKind::Rollup,
        JobKind::Hsts,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "backfill" => Some(JobKind::Backfill),
            "sweep" => Some(JobKind::Sweep),
            "openapi" => Some(JobKind::OpenApi),
            "rollup" => Some(JobKind::Rollup),
            "hsts" => Some(JobKind::Hsts),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backfill => "backfill",
            JobKind::Sweep => "sweep",
            JobKind::OpenApi => "openapi",
            JobKind::Rollup => "rollup",
            JobKind::Hsts => "hsts",
        }
    }

    fn interval_minutes(&self, engine: &Engine) -> u64 {
        let jobs = &engine.config.jobs;
        match self {
            JobKind::Backfill => jobs.backfill_interval_minutes,
            JobKind::Sweep => jobs.sweep_interval_minutes,
            JobKind::OpenApi => jobs.openapi_interval_minutes,
            JobKind::Rollup => jobs.rollup_interval_minutes,
            JobKind::Hsts => jobs.hsts_interval_minutes,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run one job to completion and return its report as JSON.
pub async fn run_job(engine: &Engine, ctx: &Context, kind: JobKind) -> anyhow::Result<serde_json::Value> {
    let report = match kind {
        JobKind::Backfill => serde_json::to_value(backfill::run_backfill(engine, ctx).await?)?,
        JobKind::Sweep => serde_json::to_value(sweep::run_sweep(engine, ctx).await?)?,
        JobKind::OpenApi => serde_json::to_value(openapi::run_generation(engine, ctx).await?)?,
        JobKind::Rollup => serde_json::to_value(rollup::run_rollup(engine, ctx).await?)?,
        JobKind::Hsts => serde_json::to_value(hsts::run_hsts_monitor(engine, ctx).await?)?,
    };
    Ok(report)
}

/// Run a job in every schema from [`Engine::job_contexts`], keyed by schema.
/// A schema whose run fails gets `{"error": ...}` in its slot.
pub async fn run_job_everywhere(
    engine: &Engine,
    kind: JobKind,
) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    let mut reports = serde_json::Map::new();
    for ctx in engine.job_contexts().await? {
        let report = match run_job(engine, &ctx, kind).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(job = %kind, schema = ctx.schema(), error = %e, "Job run failed");
                serde_json::json!({ "error": e.to_string() })
            }
        };
        reports.insert(ctx.schema().to_string(), report);
    }
    Ok(reports)
}

/// Spawn one loop per job with a non-zero interval.
pub fn spawn_scheduler(engine: Arc<Engine>, shutdown: &broadcast::Sender<()>) -> Vec<tokio::task::JoinHandle<()>> {
    if !engine.config.jobs.enabled {
        tracing::info!("Batch jobs disabled via config");
        return Vec::new();
    }
    JobKind::ALL
        .into_iter()
        .filter(|kind| kind.interval_minutes(&engine) > 0)
        .map(|kind| tokio::spawn(run_job_loop(Arc::clone(&engine), kind, shutdown.subscribe())))
        .collect()
}

async fn run_job_loop(engine: Arc<Engine>, kind: JobKind, mut shutdown: broadcast::Receiver<()>) {
    let minutes = kind.interval_minutes(&engine);
    let mut ticker = tokio::time::interval(Duration::from_secs(minutes * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; let workers start first.
    ticker.tick().await;

    tracing::info!(job = %kind, interval_min = minutes, "Job loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_job_everywhere(&engine, kind).await {
                    Ok(reports) => tracing::debug!(job = %kind, schemas = reports.len(), "Job run finished"),
                    Err(e) => tracing::error!(job = %kind, error = %e, "Listing job schemas failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!(job = %kind, "Job loop shutting down");
                break;
            }
        }
    }
}
