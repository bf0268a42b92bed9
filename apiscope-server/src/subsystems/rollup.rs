//! Rollup and retention.
//!
//! Analyzed traces from before the current UTC hour are counted into the
//! minutely and hourly aggregate tables and then deleted, all in one
//! REPEATABLE READ transaction so the delete removes exactly the rows that
//! were counted. Counts add to whatever an earlier run stored.

use apiscope_core::{ApiscopeError, Context};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use sqlx::{Connection, PgConnection};

use crate::engine::Engine;

#[derive(Debug, Default, Clone, Serialize)]
pub struct RollupReport {
    pub boundary: Option<DateTime<Utc>>,
    pub traces_counted: i64,
    pub minutely_rows: u64,
    pub hourly_rows: u64,
    pub traces_deleted: u64,
}

/// Start of the hour containing `now`: the latest fully elapsed boundary.
pub fn rollup_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(TimeDelta::hours(1)).unwrap_or(now)
}

pub async fn run_rollup(engine: &Engine, ctx: &Context) -> Result<RollupReport, ApiscopeError> {
    let boundary = rollup_boundary(Utc::now());
    let mut conn = engine.pool.acquire().await?;
    let report = rollup_before(&mut conn, ctx, boundary).await?;

    tracing::info!(
        boundary = %boundary,
        counted = report.traces_counted,
        deleted = report.traces_deleted,
        "Rollup complete"
    );
    Ok(report)
}

/// Roll up and delete analyzed traces created before `boundary`.
pub async fn rollup_before(
    conn: &mut PgConnection,
    ctx: &Context,
    boundary: DateTime<Utc>,
) -> Result<RollupReport, ApiscopeError> {
    let trace = ctx.table("trace");
    let eligible = "endpoint_id IS NOT NULL AND analyzed = TRUE AND created_at < $1";

    let mut tx = conn.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await?;

    let result = async {
        let traces_counted: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE {}", trace, eligible))
            .bind(boundary)
            .fetch_one(&mut *tx)
            .await?;
        if traces_counted == 0 {
            return Ok(RollupReport {
                boundary: Some(boundary),
                ..RollupReport::default()
            });
        }

        let minutely = sqlx::query(&format!(
            r#"
            INSERT INTO {agg} AS a (endpoint_id, minute, num_calls)
            SELECT endpoint_id,
                   date_trunc('minute', created_at AT TIME ZONE 'UTC') AT TIME ZONE 'UTC',
                   COUNT(*)
            FROM {trace} WHERE {eligible}
            GROUP BY 1, 2
            ON CONFLICT ON CONSTRAINT unique_constraint_minutely
            DO UPDATE SET num_calls = a.num_calls + EXCLUDED.num_calls
            "#,
            agg = ctx.table("aggregate_trace_data_minutely"),
        ))
        .bind(boundary)
        .execute(&mut *tx)
        .await?;

        let hourly = sqlx::query(&format!(
            r#"
            INSERT INTO {agg} AS a (endpoint_id, hour, num_calls)
            SELECT endpoint_id,
                   date_trunc('hour', created_at AT TIME ZONE 'UTC') AT TIME ZONE 'UTC',
                   COUNT(*)
            FROM {trace} WHERE {eligible}
            GROUP BY 1, 2
            ON CONFLICT ON CONSTRAINT unique_constraint_hourly
            DO UPDATE SET num_calls = a.num_calls + EXCLUDED.num_calls
            "#,
            agg = ctx.table("aggregate_trace_data_hourly"),
        ))
        .bind(boundary)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(&format!("DELETE FROM {} WHERE {}", trace, eligible))
            .bind(boundary)
            .execute(&mut *tx)
            .await?;

        Ok::<RollupReport, sqlx::Error>(RollupReport {
            boundary: Some(boundary),
            traces_counted,
            minutely_rows: minutely.rows_affected(),
            hourly_rows: hourly.rows_affected(),
            traces_deleted: deleted.rows_affected(),
        })
    }
    .await;

    match result {
        Ok(report) if report.traces_deleted as i64 == report.traces_counted => {
            tx.commit().await?;
            Ok(report)
        }
        Ok(report) => {
            tx.rollback().await?;
            Err(ApiscopeError::Other(format!(
                "rollup counted {} traces but would delete {}",
                report.traces_counted, report.traces_deleted
            )))
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "Rollback failed");
            }
            Err(e.into())
        }
    }
}
