//! Transport-security monitor.
//!
//! For each endpoint, look at its most recent trace. When that response
//! carried no `Strict-Transport-Security` header, send one `OPTIONS` probe to
//! the live service before raising a missing-HSTS alert. A probe that fails
//! proves nothing and raises nothing.

use std::collections::HashMap;

use apiscope_core::models::{Endpoint, Trace};
use apiscope_core::{ApiscopeError, Context};
use serde::Serialize;
use uuid::Uuid;

use super::alerts;
use super::pipeline::TRACE_COLUMNS;
use crate::engine::Engine;
use crate::store::{endpoint_from, ENDPOINT_SELECT};

const HSTS_HEADER: &str = "strict-transport-security";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Present,
    Missing,
    Inconclusive(String),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct HstsReport {
    pub endpoints_checked: usize,
    pub probes_sent: usize,
    pub probes_failed: usize,
    pub alerts_inserted: u64,
}

pub fn probe_url(scheme: &str, host: &str, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    format!("{}://{}{}", scheme, host, path)
}

/// One live `OPTIONS` request.
pub async fn probe(client: &reqwest::Client, url: &str) -> Verdict {
    match client.request(reqwest::Method::OPTIONS, url).send().await {
        Ok(response) if response.headers().contains_key(HSTS_HEADER) => Verdict::Present,
        Ok(_) => Verdict::Missing,
        Err(e) => Verdict::Inconclusive(e.to_string()),
    }
}

pub async fn run_hsts_monitor(engine: &Engine, ctx: &Context) -> Result<HstsReport, ApiscopeError> {
    let mut report = HstsReport::default();
    let mut conn = engine.pool.acquire().await?;

    let sql = format!("SELECT {} FROM {}", ENDPOINT_SELECT, endpoint_from(ctx));
    let endpoints: HashMap<Uuid, Endpoint> = sqlx::query_as::<_, Endpoint>(&sql)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|e| (e.id, e))
        .collect();

    let sql = format!(
        "SELECT DISTINCT ON (endpoint_id) {} FROM {} WHERE endpoint_id IS NOT NULL \
         ORDER BY endpoint_id, created_at DESC",
        TRACE_COLUMNS,
        ctx.table("trace")
    );
    let latest = sqlx::query_as::<_, Trace>(&sql).fetch_all(&mut *conn).await?;

    for trace in latest {
        let Some(endpoint) = trace.endpoint_id.and_then(|id| endpoints.get(&id)) else {
            continue;
        };
        report.endpoints_checked += 1;
        if trace.has_response_header(HSTS_HEADER) {
            continue;
        }

        let url = probe_url(&engine.config.jobs.probe_scheme, &endpoint.host, &trace.path);
        report.probes_sent += 1;
        match probe(&engine.http, &url).await {
            Verdict::Present => {}
            Verdict::Missing => {
                let alert = alerts::missing_hsts_alert(endpoint, &trace);
                match alerts::insert_alerts(&mut conn, ctx, &[alert]).await {
                    Ok(n) => report.alerts_inserted += n,
                    Err(e) => tracing::warn!(endpoint_id = %endpoint.id, error = %e, "HSTS alert insert failed"),
                }
            }
            Verdict::Inconclusive(reason) => {
                report.probes_failed += 1;
                tracing::warn!(endpoint_id = %endpoint.id, url = %url, error = %reason, "HSTS probe failed");
            }
        }
    }

    tracing::info!(
        checked = report.endpoints_checked,
        probes = report.probes_sent,
        alerts = report.alerts_inserted,
        "HSTS monitor complete"
    );
    Ok(report)
}
