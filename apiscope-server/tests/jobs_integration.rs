//! Batch jobs against a live Postgres: backfill → OpenAPI generation →
//! sweep, and rollup/retention.

mod common;

use std::sync::Arc;

use apiscope_core::models::Trace;
use apiscope_core::{db, Context};
use apiscope_server::subsystems::rollup::{rollup_before, rollup_boundary};
use apiscope_server::subsystems::scheduler::{self, JobKind};
use apiscope_server::subsystems::{backfill, pipeline, sweep};
use apiscope_server::Engine;
use sqlx::PgPool;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use common::{count, drop_schema, make_engine, test_config, DATABASE_URL};

#[tokio::test]
async fn test_backfill_links_generates_and_sweeps() {
    let (engine, ctx) = match make_engine().await {
        Some(s) => s,
        None => {
            eprintln!("Skipping test_backfill_links_generates_and_sweeps: DB unavailable");
            return;
        }
    };
    let mut conn = engine.pool.acquire().await.unwrap();

    for i in 0..3 {
        let mut t = Trace::new("legacy.test", "GET", format!("/orders/{}", 500 + i), 200);
        t.response_body = json!({ "total": 12.5 }).to_string();
        pipeline::store_unlinked(&mut conn, &ctx, &engine.retry, &t).await.unwrap();
    }
    let missing = Trace::new("legacy.test", "GET", "/nothing-here", 404);
    pipeline::store_unlinked(&mut conn, &ctx, &engine.retry, &missing).await.unwrap();

    let report = backfill::run_backfill(&engine, &ctx).await.unwrap();
    assert_eq!(report.traces_scanned, 4);
    assert_eq!(report.endpoints_created, 1);
    assert_eq!(report.traces_linked, 3);
    assert_eq!(report.traces_skipped, 1);
    assert_eq!(report.specs_updated, 1);

    assert_eq!(count(&engine, &ctx, "alert", "alert_type = 'new_endpoint'").await, 1);
    assert_eq!(
        count(&engine, &ctx, "endpoint", "openapi_spec_name = 'legacy.test-generated'").await,
        1
    );
    let spec: sqlx::types::Json<serde_json::Value> = sqlx::query_scalar(&format!(
        "SELECT spec FROM {} WHERE name = 'legacy.test-generated' AND is_auto_generated",
        ctx.table("open_api_spec")
    ))
    .fetch_one(&engine.pool)
    .await
    .unwrap();
    let op = &spec.0["paths"]["/orders/{param1}"]["get"];
    assert_eq!(op["responses"]["200"]["content"]["*/*"]["schema"]["properties"]["total"]["type"], "number");

    let swept = sweep::run_sweep(&engine, &ctx).await.unwrap();
    assert_eq!(swept.traces_analyzed, 3);
    assert_eq!(swept.traces_failed, 0);
    assert_eq!(count(&engine, &ctx, "trace", "analyzed").await, 3);
    assert_eq!(count(&engine, &ctx, "data_field", "data_path = 'total'").await, 1);

    // A second pass finds nothing left to do.
    let again = backfill::run_backfill(&engine, &ctx).await.unwrap();
    assert_eq!(again.endpoints_created, 0);
    assert_eq!(again.traces_linked, 0);

    drop_schema(&engine, &ctx).await;
}

/// A long letters-only segment: never a parameter, too large for a btree entry.
fn oversized_segment() -> String {
    (0..700)
        .flat_map(|_| Uuid::new_v4().simple().to_string().into_bytes())
        .map(|b| match b {
            b'0'..=b'9' => (b'g' + (b - b'0')) as char,
            other => other as char,
        })
        .collect()
}

#[tokio::test]
async fn test_backfill_continues_past_a_failing_group() {
    let (engine, ctx) = match make_engine().await {
        Some(s) => s,
        None => {
            eprintln!("Skipping test_backfill_continues_past_a_failing_group: DB unavailable");
            return;
        }
    };
    let mut conn = engine.pool.acquire().await.unwrap();

    let mut bad = Trace::new("legacy.test", "GET", format!("/{}", oversized_segment()), 200);
    bad.created_at = Utc::now() - Duration::minutes(5);
    pipeline::store_unlinked(&mut conn, &ctx, &engine.retry, &bad).await.unwrap();
    let good = Trace::new("legacy.test", "GET", "/orders/77", 200);
    pipeline::store_unlinked(&mut conn, &ctx, &engine.retry, &good).await.unwrap();

    let report = backfill::run_backfill(&engine, &ctx).await.unwrap();
    assert_eq!(report.traces_scanned, 2);
    assert_eq!(report.traces_failed, 1);
    assert_eq!(report.traces_linked, 1);
    assert_eq!(report.specs_updated, 1);
    assert_eq!(count(&engine, &ctx, "trace", &format!("id = '{}' AND endpoint_id IS NOT NULL", good.id)).await, 1);
    assert_eq!(count(&engine, &ctx, "trace", &format!("id = '{}' AND endpoint_id IS NULL", bad.id)).await, 1);

    // The failing trace does not block later runs either.
    let again = backfill::run_backfill(&engine, &ctx).await.unwrap();
    assert_eq!(again.traces_failed, 1);
    assert_eq!(again.traces_linked, 0);

    drop_schema(&engine, &ctx).await;
}

#[tokio::test]
async fn test_rollup_counts_what_it_deletes() {
    let (engine, ctx) = match make_engine().await {
        Some(s) => s,
        None => {
            eprintln!("Skipping test_rollup_counts_what_it_deletes: DB unavailable");
            return;
        }
    };
    let mut conn = engine.pool.acquire().await.unwrap();
    let old = Utc::now() - Duration::hours(3);

    for i in 0..4 {
        let mut t = Trace::new("metrics.test", "GET", format!("/events/{}", 100 + i), 200);
        t.created_at = old + Duration::seconds(i);
        pipeline::process_trace(&engine, &mut conn, &ctx, t).await.unwrap();
    }
    // Current-hour traffic stays.
    pipeline::process_trace(&engine, &mut conn, &ctx, Trace::new("metrics.test", "GET", "/events/1", 200))
        .await
        .unwrap();

    let boundary = rollup_boundary(Utc::now());
    let report = rollup_before(&mut conn, &ctx, boundary).await.unwrap();
    assert_eq!(report.traces_counted, 4);
    assert_eq!(report.traces_deleted, 4);

    let hourly: i64 = sqlx::query_scalar(&format!(
        "SELECT COALESCE(SUM(num_calls), 0)::BIGINT FROM {}",
        ctx.table("aggregate_trace_data_hourly")
    ))
    .fetch_one(&engine.pool)
    .await
    .unwrap();
    let minutely: i64 = sqlx::query_scalar(&format!(
        "SELECT COALESCE(SUM(num_calls), 0)::BIGINT FROM {}",
        ctx.table("aggregate_trace_data_minutely")
    ))
    .fetch_one(&engine.pool)
    .await
    .unwrap();
    assert_eq!(hourly, 4);
    assert_eq!(minutely, 4);
    assert_eq!(count(&engine, &ctx, "trace", "TRUE").await, 1);

    let again = rollup_before(&mut conn, &ctx, boundary).await.unwrap();
    assert_eq!(again.traces_counted, 0);

    drop_schema(&engine, &ctx).await;
}

#[tokio::test]
async fn test_scheduled_jobs_reach_tenant_schemas() {
    let Ok(pool) = PgPool::connect(DATABASE_URL).await else {
        eprintln!("Skipping test_scheduled_jobs_reach_tenant_schemas: DB unavailable");
        return;
    };
    let prefix = format!("fanout_{}_", &Uuid::new_v4().simple().to_string()[..12]);
    let main = Context::new(format!("{}main", prefix)).unwrap();
    let tenant = Context::new(format!("{}acme", prefix)).unwrap();
    db::provision_schema(DATABASE_URL, &main).await.unwrap();
    db::provision_schema(DATABASE_URL, &tenant).await.unwrap();

    let mut config = test_config(main.schema());
    config.jobs.schema_prefix = prefix.clone();
    let engine = Arc::new(Engine::new(pool, config).unwrap());

    let contexts = engine.job_contexts().await.unwrap();
    let names: Vec<&str> = contexts.iter().map(|c| c.schema()).collect();
    assert_eq!(names, vec![main.schema(), tenant.schema()]);

    let mut conn = engine.pool.acquire().await.unwrap();
    let mut t = Trace::new("tenant.test", "GET", "/events/9", 200);
    t.created_at = Utc::now() - Duration::hours(3);
    pipeline::process_trace(&engine, &mut conn, &tenant, t).await.unwrap();

    let reports = scheduler::run_job_everywhere(&engine, JobKind::Rollup).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[tenant.schema()]["traces_deleted"], 1);
    assert_eq!(count(&engine, &tenant, "trace", "TRUE").await, 0);

    drop_schema(&engine, &main).await;
    drop_schema(&engine, &tenant).await;
}
