//! Backfill: link stored traces that never got an endpoint.
//!
//! Pages through unlinked traces older than the run's start, oldest first:
//! - a trace matching an existing endpoint is linked to it
//! - the rest are grouped by inferred template within the batch and one
//!   endpoint is created per group (or the concurrent winner reused)
//! - 404/405 traces with no match stay unlinked
//!
//! Linked traces are left unanalyzed for the sweep. A trace or group that
//! fails is counted, left unlinked and retried on the next run. Generated
//! OpenAPI documents are refreshed once all pages are done.

use std::collections::BTreeMap;

use apiscope_core::models::{Endpoint, Trace};
use apiscope_core::path::normalize_path;
use apiscope_core::{retry_step, ApiscopeError, Context, PathTemplate, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Connection, PgConnection};
use uuid::Uuid;

use super::alerts;
use super::openapi;
use super::pipeline::TRACE_COLUMNS;
use crate::engine::Engine;
use crate::store::InsertOutcome;

#[derive(Debug, Default, Clone, Serialize)]
pub struct BackfillReport {
    pub traces_scanned: usize,
    pub traces_linked: usize,
    pub traces_skipped: usize,
    pub traces_failed: usize,
    pub endpoints_created: usize,
    pub specs_updated: usize,
}

/// Traces that will share one endpoint.
struct Group {
    endpoint_id: Uuid,
    trace_ids: Vec<Uuid>,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
}

impl Group {
    fn new(endpoint_id: Uuid, trace: &Trace) -> Self {
        Self {
            endpoint_id,
            trace_ids: vec![trace.id],
            first: trace.created_at,
            last: trace.created_at,
        }
    }

    fn add(&mut self, trace: &Trace) {
        self.trace_ids.push(trace.id);
        self.first = self.first.min(trace.created_at);
        self.last = self.last.max(trace.created_at);
    }
}

/// A template discovered in this batch, not yet stored.
struct Pending {
    host: String,
    method: String,
    template: PathTemplate,
    first_trace: Trace,
    group: Group,
}

pub async fn run_backfill(engine: &Engine, ctx: &Context) -> Result<BackfillReport, ApiscopeError> {
    let cutoff = Utc::now();
    let batch_size = engine.config.jobs.backfill_batch_size.max(1);
    let mut report = BackfillReport::default();
    let mut conn = engine.pool.acquire().await?;
    let mut after: Option<(DateTime<Utc>, Uuid)> = None;

    loop {
        let traces = fetch_unlinked(&mut conn, ctx, cutoff, after, batch_size).await?;
        let Some(last) = traces.last() else {
            break;
        };
        after = Some((last.created_at, last.id));
        report.traces_scanned += traces.len();

        process_batch(engine, &mut conn, ctx, traces, &mut report).await?;

        tracing::debug!(
            scanned = report.traces_scanned,
            linked = report.traces_linked,
            "Backfill page done"
        );
    }

    report.specs_updated = openapi::run_generation(engine, ctx).await?.specs_updated;

    tracing::info!(
        scanned = report.traces_scanned,
        linked = report.traces_linked,
        skipped = report.traces_skipped,
        failed = report.traces_failed,
        created = report.endpoints_created,
        "Backfill complete"
    );
    Ok(report)
}

async fn process_batch(
    engine: &Engine,
    conn: &mut PgConnection,
    ctx: &Context,
    traces: Vec<Trace>,
    report: &mut BackfillReport,
) -> Result<(), ApiscopeError> {
    let mut matched: BTreeMap<Uuid, Group> = BTreeMap::new();
    let mut pending: Vec<Pending> = Vec::new();

    for mut trace in traces {
        trace.method = trace.method.to_ascii_uppercase();
        let path = normalize_path(&trace.path);
        if path.is_empty() {
            report.traces_skipped += 1;
            continue;
        }

        let found = match engine.resolver.find(ctx, &trace.host, &trace.method, &path).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(trace_id = %trace.id, error = %e, "Backfill lookup failed");
                report.traces_failed += 1;
                if e.is_connection_lost() {
                    return Err(e);
                }
                continue;
            }
        };
        if let Some(endpoint) = found {
            matched
                .entry(endpoint.id)
                .and_modify(|g| g.add(&trace))
                .or_insert_with(|| Group::new(endpoint.id, &trace));
            continue;
        }
        if trace.is_not_found() {
            report.traces_skipped += 1;
            continue;
        }

        let existing = pending.iter_mut().find(|p| {
            p.host == trace.host && p.method == trace.method && engine.patterns.is_match(&p.template.pattern, &path)
        });
        if let Some(p) = existing {
            p.group.add(&trace);
            continue;
        }
        match engine.inferrer.infer(&path) {
            Some(template) => pending.push(Pending {
                host: trace.host.clone(),
                method: trace.method.clone(),
                template,
                group: Group::new(Uuid::nil(), &trace),
                first_trace: trace,
            }),
            None => report.traces_skipped += 1,
        }
    }

    for group in matched.into_values() {
        let size = group.trace_ids.len();
        let endpoint_id = group.endpoint_id;
        match link_group(conn, ctx, &engine.retry, group, None).await {
            Ok(()) => report.traces_linked += size,
            Err(e) => group_failed(report, size, &endpoint_id.to_string(), e)?,
        }
    }

    for p in pending {
        let size = p.group.trace_ids.len();
        let candidate = Endpoint::from_template(&p.host, &p.method, &p.template);
        let inserted = match engine.store.insert(ctx, &candidate).await {
            Ok(InsertOutcome::Inserted) => Ok(Some((candidate, true))),
            Ok(InsertOutcome::Conflict) => engine
                .store
                .find_exact(ctx, &p.host, &p.method, &p.template.path)
                .await
                .map(|found| found.map(|existing| (existing, false))),
            Err(e) => Err(e),
        };
        let (endpoint, is_new) = match inserted {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                tracing::warn!(host = %p.host, path = %p.template.path, "Endpoint conflict but no row on re-read");
                report.traces_skipped += size;
                continue;
            }
            Err(e) => {
                group_failed(report, size, &p.template.path, e)?;
                continue;
            }
        };

        if is_new {
            report.endpoints_created += 1;
            tracing::info!(
                endpoint_id = %endpoint.id,
                host = %endpoint.host,
                method = %endpoint.method,
                path = %endpoint.path,
                "New endpoint from backfill"
            );
        }
        let alert = is_new.then(|| alerts::new_endpoint_alert(&endpoint, &p.first_trace));
        let group = Group {
            endpoint_id: endpoint.id,
            ..p.group
        };
        match link_group(conn, ctx, &engine.retry, group, alert).await {
            Ok(()) => report.traces_linked += size,
            Err(e) => group_failed(report, size, &p.template.path, e)?,
        }
    }

    Ok(())
}

/// Count a failed group and carry on, unless the connection itself is gone.
fn group_failed(report: &mut BackfillReport, size: usize, target: &str, e: ApiscopeError) -> Result<(), ApiscopeError> {
    tracing::warn!(target_path = %target, traces = size, error = %e, "Backfill group failed");
    report.traces_failed += size;
    if e.is_connection_lost() {
        return Err(e);
    }
    Ok(())
}

/// Link a group's traces and widen its endpoint's dates in one transaction.
async fn link_group(
    conn: &mut PgConnection,
    ctx: &Context,
    retry: &RetryPolicy,
    group: Group,
    alert: Option<apiscope_core::models::Alert>,
) -> Result<(), ApiscopeError> {
    let link_sql = format!(
        "UPDATE {} SET endpoint_id = $1 WHERE id = ANY($2) AND endpoint_id IS NULL",
        ctx.table("trace")
    );
    let dates_sql = format!(
        "UPDATE {} SET first_detected = LEAST(COALESCE(first_detected, $2), $2), \
         last_active = GREATEST(COALESCE(last_active, $3), $3), updated_at = now() WHERE id = $1",
        ctx.table("endpoint")
    );

    let mut tx = conn.begin().await?;
    let result = async {
        let ids = group.trace_ids.clone();
        let endpoint_id = group.endpoint_id;
        retry_step(&mut tx, retry, "link_traces", move |c| {
            let sql = link_sql.clone();
            let ids = ids.clone();
            Box::pin(async move {
                sqlx::query(&sql)
                    .bind(endpoint_id)
                    .bind(&ids)
                    .execute(c)
                    .await
                    .map(|_| ())
            })
        })
        .await?;

        let (first, last) = (group.first, group.last);
        retry_step(&mut tx, retry, "update_endpoint_dates", move |c| {
            let sql = dates_sql.clone();
            Box::pin(async move {
                sqlx::query(&sql)
                    .bind(endpoint_id)
                    .bind(first)
                    .bind(last)
                    .execute(c)
                    .await
                    .map(|_| ())
            })
        })
        .await?;

        if let Some(alert) = alert {
            let ctx = ctx.clone();
            retry_step(&mut tx, retry, "insert_alerts", move |c| {
                let ctx = ctx.clone();
                let alert = alert.clone();
                Box::pin(async move { alerts::insert_alerts(c, &ctx, std::slice::from_ref(&alert)).await })
            })
            .await?;
        }
        Ok::<(), sqlx::Error>(())
    }
    .await;

    match result {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "Rollback failed");
            }
            Err(e.into())
        }
    }
}

async fn fetch_unlinked(
    conn: &mut PgConnection,
    ctx: &Context,
    cutoff: DateTime<Utc>,
    after: Option<(DateTime<Utc>, Uuid)>,
    limit: i64,
) -> Result<Vec<Trace>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM {} \
         WHERE endpoint_id IS NULL AND created_at <= $1 \
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
