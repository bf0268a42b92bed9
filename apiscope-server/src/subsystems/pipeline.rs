//! Analysis pipeline: one trace, one transaction.
//!
//! Resolution happens before the transaction opens. Inside it the endpoint
//! row is locked and its fields re-read, so two workers on one endpoint
//! reconcile in turn. Each write step then runs through `retry_step`:
//!
//! 1. persist the trace linked to its endpoint (or mark it analyzed)
//! 2. upsert changed data fields
//! 3. insert alerts, ignoring duplicates
//! 4. widen the endpoint's first/last seen and raise its risk
//!
//! Every endpoint update is commutative (`LEAST`, `GREATEST`, `AND`) so
//! concurrent workers can apply them in any order.

use apiscope_core::models::{Alert, DataField, Endpoint, Trace};
use apiscope_core::{retry_step, spec_diff, ApiscopeError, Context, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::{Connection, PgConnection};
use uuid::Uuid;

use super::alerts;
use super::reconcile::ReconcileOutcome;
use super::resolver::Resolution;
use crate::engine::Engine;

/// `trace` columns in [`Trace`] field order.
pub const TRACE_COLUMNS: &str = "id, host, path, method, request_parameters, request_headers, request_body, \
     response_status, response_headers, response_body, meta, session_meta, created_at, endpoint_id, analyzed";

/// How the trace row is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceWrite {
    /// Fresh from the queue: insert it, linked and analyzed.
    Insert,
    /// Already stored and linked: flag it analyzed.
    MarkAnalyzed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisReport {
    pub endpoint_id: Uuid,
    pub is_new_endpoint: bool,
    pub fields_written: usize,
    pub alerts_generated: usize,
    pub alerts_inserted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub enum Disposition {
    Analyzed(AnalysisReport),
    /// Stored unlinked for the backfill job.
    Deferred,
    /// Dropped: no endpoint can exist for it.
    Discarded,
}

/// Resolve and analyze one queued trace.
pub async fn process_trace(
    engine: &Engine,
    conn: &mut PgConnection,
    ctx: &Context,
    mut trace: Trace,
) -> Result<Disposition, ApiscopeError> {
    trace.method = trace.method.to_ascii_uppercase();
    trace.endpoint_id = None;
    trace.analyzed = false;

    match engine.resolver.resolve(ctx, &trace).await? {
        Resolution::Resolved { endpoint, is_new } => {
            let report = analyze(engine, conn, ctx, endpoint, &trace, is_new, TraceWrite::Insert).await?;
            Ok(Disposition::Analyzed(report))
        }
        Resolution::Deferred => {
            store_unlinked(conn, ctx, &engine.retry, &trace).await?;
            Ok(Disposition::Deferred)
        }
        Resolution::Unresolvable => {
            tracing::debug!(trace_id = %trace.id, path = %trace.path, status = trace.response_status, "Trace discarded");
            Ok(Disposition::Discarded)
        }
    }
}

/// Reconcile, alert and persist one trace against a resolved endpoint.
pub async fn analyze(
    engine: &Engine,
    conn: &mut PgConnection,
    ctx: &Context,
    mut endpoint: Endpoint,
    trace: &Trace,
    is_new: bool,
    write: TraceWrite,
) -> Result<AnalysisReport, ApiscopeError> {
    endpoint.update_dates(trace.created_at);
    let spec = load_uploaded_spec(conn, ctx, &endpoint).await?;

    // Fields are re-read under the endpoint's row lock: analyses of one
    // endpoint reconcile one at a time.
    let mut tx = conn.begin().await?;
    let result = async {
        lock_endpoint(&mut tx, ctx, &engine.retry, endpoint.id).await?;
        let existing = load_fields(&mut tx, ctx, endpoint.id).await?;
        let outcome = engine.reconciler.reconcile(trace, endpoint.id, &existing);
        let pending = pending_alerts(engine, &endpoint, trace, &outcome, spec.as_ref(), is_new);

        let risk = endpoint.risk().max(outcome.risk);
        let update = EndpointUpdate {
            id: endpoint.id,
            seen_at: trace.created_at,
            risk_rank: risk.rank(),
            authenticated: authentication_signal(trace),
        };
        let inserted = persist(&mut tx, ctx, &engine.retry, trace, endpoint.id, write, &outcome.changed, &pending, &update).await?;
        Ok::<AnalysisReport, sqlx::Error>(AnalysisReport {
            endpoint_id: endpoint.id,
            is_new_endpoint: is_new,
            fields_written: outcome.changed.len(),
            alerts_generated: pending.len(),
            alerts_inserted: inserted,
        })
    }
    .await;

    let report = match result {
        Ok(report) => {
            tx.commit().await?;
            report
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(trace_id = %trace.id, error = %rollback, "Rollback failed");
            }
            return Err(e.into());
        }
    };

    tracing::debug!(
        trace_id = %trace.id,
        endpoint_id = %endpoint.id,
        fields = report.fields_written,
        alerts = report.alerts_inserted,
        "Trace analyzed"
    );
    Ok(report)
}

fn pending_alerts(
    engine: &Engine,
    endpoint: &Endpoint,
    trace: &Trace,
    outcome: &ReconcileOutcome,
    spec: Option<&serde_json::Value>,
    is_new: bool,
) -> Vec<Alert> {
    let mut pending: Vec<Alert> = Vec::new();
    if let Some(spec) = spec {
        let diffs = spec_diff::diff(spec, &endpoint.path, &endpoint.method, trace);
        pending.extend(alerts::spec_diff_alerts(endpoint, trace, &diffs));
    }
    pending.extend(alerts::sensitive_data_alerts(
        endpoint,
        trace,
        &outcome.new_classes,
        engine.scanner.as_ref(),
    ));
    if let Some(alert) = alerts::unauthenticated_alert(endpoint, trace, outcome) {
        pending.push(alert);
    }
    if engine.config.alerts.hsts_from_traffic && !trace.has_response_header("strict-transport-security") {
        pending.push(alerts::missing_hsts_alert(endpoint, trace));
    }
    if is_new {
        pending.push(alerts::new_endpoint_alert(endpoint, trace));
    }
    pending
}

/// Serialize analyses of one endpoint. `NO KEY UPDATE` leaves foreign key
/// checks from trace writes unblocked.
async fn lock_endpoint(
    conn: &mut PgConnection,
    ctx: &Context,
    retry: &RetryPolicy,
    endpoint_id: Uuid,
) -> Result<(), sqlx::Error> {
    let sql = format!("SELECT id FROM {} WHERE id = $1 FOR NO KEY UPDATE", ctx.table("endpoint"));
    retry_step(conn, retry, "lock_endpoint", move |c| {
        let sql = sql.clone();
        Box::pin(async move {
            sqlx::query(&sql)
                .bind(endpoint_id)
                .fetch_optional(c)
                .await
                .map(|_| ())
        })
    })
    .await
}

/// Keep a trace whose endpoint could not be created, unlinked.
pub async fn store_unlinked(
    conn: &mut PgConnection,
    ctx: &Context,
    retry: &RetryPolicy,
    trace: &Trace,
) -> Result<(), ApiscopeError> {
    let sql = insert_trace_sql(ctx);
    let owned = trace.clone();
    retry_step(conn, retry, "store_unlinked_trace", move |c| {
        let sql = sql.clone();
        let trace = owned.clone();
        Box::pin(async move { bind_trace(&sql, &trace, None, false).execute(c).await.map(|_| ()) })
    })
    .await?;
    tracing::warn!(trace_id = %trace.id, host = %trace.host, path = %trace.path, "Trace stored unlinked");
    Ok(())
}

#[derive(Debug, Clone)]
struct EndpointUpdate {
    id: Uuid,
    seen_at: DateTime<Utc>,
    risk_rank: i16,
    authenticated: Option<bool>,
}

/// `Some(false)` when a request succeeded without credentials, `Some(true)`
/// when credentials were presented and accepted.
fn authentication_signal(trace: &Trace) -> Option<bool> {
    let meta = &trace.session_meta;
    if meta.is_unauthenticated_success() {
        Some(false)
    } else if meta.authentication_provided == Some(true) && meta.authentication_successful == Some(true) {
        Some(true)
    } else {
        None
    }
}

#[allow(clippy::too_many_arguments)]
async fn persist(
    conn: &mut PgConnection,
    ctx: &Context,
    retry: &RetryPolicy,
    trace: &Trace,
    endpoint_id: Uuid,
    write: TraceWrite,
    fields: &[DataField],
    pending: &[Alert],
    update: &EndpointUpdate,
) -> Result<u64, sqlx::Error> {
    match write {
        TraceWrite::Insert => {
            let sql = insert_trace_sql(ctx);
            let trace = trace.clone();
            retry_step(conn, retry, "insert_trace", move |c| {
                let sql = sql.clone();
                let trace = trace.clone();
                Box::pin(async move {
                    bind_trace(&sql, &trace, Some(endpoint_id), true)
                        .execute(c)
                        .await
                        .map(|_| ())
                })
            })
            .await?;
        }
        TraceWrite::MarkAnalyzed => {
            let sql = format!(
                "UPDATE {} SET analyzed = TRUE, endpoint_id = $2 WHERE id = $1",
                ctx.table("trace")
            );
            let trace_id = trace.id;
            retry_step(conn, retry, "mark_trace_analyzed", move |c| {
                let sql = sql.clone();
                Box::pin(async move {
                    sqlx::query(&sql)
                        .bind(trace_id)
                        .bind(endpoint_id)
                        .execute(c)
                        .await
                        .map(|_| ())
                })
            })
            .await?;
        }
    }

    if !fields.is_empty() {
        let sql = upsert_field_sql(ctx);
        let fields = fields.to_vec();
        retry_step(conn, retry, "upsert_data_fields", move |c| {
            let sql = sql.clone();
            let fields = fields.clone();
            Box::pin(async move {
                for field in &fields {
                    sqlx::query(&sql)
                        .bind(field.id)
                        .bind(&field.data_section)
                        .bind(&field.data_path)
                        .bind(field.endpoint_id)
                        .bind(&field.data_type)
                        .bind(&field.data_tag)
                        .bind(&field.data_classes)
                        .bind(&field.scanner_identified)
                        .bind(&field.false_positives)
                        .bind(&field.matches)
                        .bind(&field.schema)
                        .execute(&mut *c)
                        .await?;
                }
                Ok::<(), sqlx::Error>(())
            })
        })
        .await?;
    }

    let mut inserted = 0;
    if !pending.is_empty() {
        let alert_ctx = ctx.clone();
        let pending = pending.to_vec();
        inserted = retry_step(conn, retry, "insert_alerts", move |c| {
            let ctx = alert_ctx.clone();
            let pending = pending.clone();
            Box::pin(async move { alerts::insert_alerts(c, &ctx, &pending).await })
        })
        .await?;
    }

    let sql = format!(
        r#"
        UPDATE {} SET
            first_detected = LEAST(COALESCE(first_detected, $2), $2),
            last_active = GREATEST(COALESCE(last_active, $2), $2),
            risk_score = GREATEST(risk_score, $3),
            is_authenticated_detected = CASE
                WHEN $4::BOOLEAN IS NULL THEN is_authenticated_detected
                ELSE COALESCE(is_authenticated_detected, TRUE) AND $4::BOOLEAN
            END,
            updated_at = now()
        WHERE id = $1
        "#,
        ctx.table("endpoint")
    );
    let update = update.clone();
    retry_step(conn, retry, "update_endpoint", move |c| {
        let sql = sql.clone();
        let update = update.clone();
        Box::pin(async move {
            sqlx::query(&sql)
                .bind(update.id)
                .bind(update.seen_at)
                .bind(update.risk_rank)
                .bind(update.authenticated)
                .execute(c)
                .await
                .map(|_| ())
        })
    })
    .await?;

    Ok(inserted)
}

fn insert_trace_sql(ctx: &Context) -> String {
    format!(
        "INSERT INTO {} ({}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         ON CONFLICT (id) DO NOTHING",
        ctx.table("trace"),
        TRACE_COLUMNS
    )
}

fn bind_trace<'q>(
    sql: &'q str,
    trace: &'q Trace,
    endpoint_id: Option<Uuid>,
    analyzed: bool,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(sql)
        .bind(trace.id)
        .bind(&trace.host)
        .bind(&trace.path)
        .bind(&trace.method)
        .bind(&trace.request_parameters)
        .bind(&trace.request_headers)
        .bind(&trace.request_body)
        .bind(trace.response_status)
        .bind(&trace.response_headers)
        .bind(&trace.response_body)
        .bind(&trace.meta)
        .bind(&trace.session_meta)
        .bind(trace.created_at)
        .bind(endpoint_id)
        .bind(analyzed)
}

fn upsert_field_sql(ctx: &Context) -> String {
    format!(
        r#"
        INSERT INTO {} AS f (id, data_section, data_path, endpoint_id, data_type, data_tag,
            data_classes, scanner_identified, false_positives, matches, schema)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT ON CONSTRAINT unique_data_field_section_path_endpoint DO UPDATE SET
            data_classes = ARRAY(
                SELECT DISTINCT c FROM unnest(f.data_classes || EXCLUDED.data_classes) AS c
                WHERE NOT (c = ANY(f.false_positives))
            ),
            scanner_identified = ARRAY(
                SELECT DISTINCT c FROM unnest(f.scanner_identified || EXCLUDED.scanner_identified) AS c
            ),
            data_type = EXCLUDED.data_type,
            data_tag = COALESCE(EXCLUDED.data_tag, f.data_tag),
            matches = f.matches || EXCLUDED.matches,
            schema = EXCLUDED.schema,
            updated_at = now()
        "#,
        ctx.table("data_field")
    )
}

pub async fn load_fields(
    conn: &mut PgConnection,
    ctx: &Context,
    endpoint_id: Uuid,
) -> Result<Vec<DataField>, sqlx::Error> {
    let sql = format!(
        "SELECT id, data_section, data_path, endpoint_id, data_type, data_tag, data_classes, \
         scanner_identified, false_positives, matches, schema FROM {} WHERE endpoint_id = $1",
        ctx.table("data_field")
    );
    sqlx::query_as::<_, DataField>(&sql)
        .bind(endpoint_id)
        .fetch_all(conn)
        .await
}

/// The uploaded document linked to `endpoint`, if any. Generated documents
/// describe the traffic itself and are never diffed against.
async fn load_uploaded_spec(
    conn: &mut PgConnection,
    ctx: &Context,
    endpoint: &Endpoint,
) -> Result<Option<serde_json::Value>, sqlx::Error> {
    let Some(name) = endpoint.openapi_spec_name.as_deref() else {
        return Ok(None);
    };
    if !endpoint.has_uploaded_spec() {
        return Ok(None);
    }
    let sql = format!(
        "SELECT spec FROM {} WHERE name = $1 AND is_auto_generated = FALSE",
        ctx.table("open_api_spec")
    );
    let spec: Option<Json<serde_json::Value>> = sqlx::query_scalar(&sql)
        .bind(name)
        .fetch_optional(conn)
        .await?;
    Ok(spec.map(|Json(v)| v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiscope_core::models::SessionMeta;

    #[test]
    fn authentication_signal_reads_session_meta() {
        let mut t = Trace::new("h", "GET", "/a", 200);
        assert_eq!(authentication_signal(&t), None);

        t.session_meta = Json(SessionMeta {
            authentication_provided: Some(false),
            authentication_successful: Some(true),
        });
        assert_eq!(authentication_signal(&t), Some(false));

        t.session_meta = Json(SessionMeta {
            authentication_provided: Some(true),
            authentication_successful: Some(true),
        });
        assert_eq!(authentication_signal(&t), Some(true));
    }

    #[test]
    fn trace_insert_is_schema_qualified() {
        let ctx = Context::new("tenant_a").unwrap();
        assert!(insert_trace_sql(&ctx).contains("\"tenant_a\".trace"));
        assert!(upsert_field_sql(&ctx).contains("\"tenant_a\".data_field AS f"));
    }
}
