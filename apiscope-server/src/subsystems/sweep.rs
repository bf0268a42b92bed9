//! Sweep: analyze traces that were linked without being analyzed.
//!
//! Backfill links traces but leaves field reconciliation and alerting to
//! this job. A trace that fails is counted and left for the next run.

use apiscope_core::models::Trace;
use apiscope_core::{ApiscopeError, Context};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgConnection;
use uuid::Uuid;

use super::pipeline::{self, TraceWrite, TRACE_COLUMNS};
use crate::engine::Engine;

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub traces_scanned: usize,
    pub traces_analyzed: usize,
    pub traces_failed: usize,
    pub alerts_inserted: u64,
}

pub async fn run_sweep(engine: &Engine, ctx: &Context) -> Result<SweepReport, ApiscopeError> {
    let cutoff = Utc::now();
    let batch_size = engine.config.jobs.sweep_batch_size.max(1);
    let mut report = SweepReport::default();
    let mut conn = engine.pool.acquire().await?;
    let mut after: Option<(DateTime<Utc>, Uuid)> = None;

    loop {
        let traces = fetch_unanalyzed(&mut conn, ctx, cutoff, after, batch_size).await?;
        let Some(last) = traces.last() else {
            break;
        };
        after = Some((last.created_at, last.id));
        report.traces_scanned += traces.len();

        for trace in traces {
            let Some(endpoint_id) = trace.endpoint_id else {
                continue;
            };
            let endpoint = match engine.store.find_by_id(ctx, endpoint_id).await {
                Ok(Some(endpoint)) => endpoint,
                Ok(None) => {
                    tracing::warn!(trace_id = %trace.id, %endpoint_id, "Linked endpoint missing");
                    report.traces_failed += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(trace_id = %trace.id, error = %e, "Endpoint lookup failed");
                    report.traces_failed += 1;
                    continue;
                }
            };

            match pipeline::analyze(engine, &mut conn, ctx, endpoint, &trace, false, TraceWrite::MarkAnalyzed).await {
                Ok(analysis) => {
                    report.traces_analyzed += 1;
                    report.alerts_inserted += analysis.alerts_inserted;
                }
                Err(e) => {
                    tracing::warn!(trace_id = %trace.id, error = %e, "Sweep analysis failed");
                    report.traces_failed += 1;
                    if e.is_connection_lost() {
                        return Err(e);
                    }
                }
            }
        }
    }

    tracing::info!(
        scanned = report.traces_scanned,
        analyzed = report.traces_analyzed,
        failed = report.traces_failed,
        "Sweep complete"
    );
    Ok(report)
}

async fn fetch_unanalyzed(
    conn: &mut PgConnection,
    ctx: &Context,
    cutoff: DateTime<Utc>,
    after: Option<(DateTime<Utc>, Uuid)>,
    limit: i64,
) -> Result<Vec<Trace>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM {} \
         WHERE endpoint_id IS NOT NULL AND analyzed = FALSE AND created_at <= $1 \
           AND ($2::timestamptz IS NULL OR (created_at, id) > ($2::timestamptz, $3::uuid)) \
         ORDER BY created_at, id LIMIT $4",
        TRACE_COLUMNS,
        ctx.table("trace")
    );
    sqlx::query_as::<_, Trace>(&sql)
        .bind(cutoff)
        .bind(after.map(|(at, _)| at))
        .bind(after.map(|(_, id)| id))
        .bind(limit)
        .fetch_all(conn)
        .await
}
