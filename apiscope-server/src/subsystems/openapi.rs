//! OpenAPI generation from observed traffic.
//!
//! Endpoints with no uploaded spec are grouped by host and every trace since
//! the host's generated document was last written is folded into it:
//! - parameters keyed by (name, location): path, query and header
//! - request bodies by content type
//! - responses by status, with headers and bodies by content type
//!
//! Schemas are merged with the same lattice join as data fields. A document
//! named `{host}-generated` that turns out to be uploaded is never touched.

use std::collections::BTreeMap;

use apiscope_core::models::{Endpoint, OpenApiSpecDoc, Trace};
use apiscope_core::path::{is_placeholder, segments};
use apiscope_core::schema::{self, parse_json_or_string, Schema};
use apiscope_core::{retry_step, ApiscopeError, Context};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{Connection, PgConnection};

use super::pipeline::TRACE_COLUMNS;
use crate::engine::Engine;
use crate::store::{endpoint_from, ENDPOINT_SELECT};

const ANY_CONTENT_TYPE: &str = "*/*";

#[derive(Debug, Default, Clone, Serialize)]
pub struct OpenApiReport {
    pub hosts_scanned: usize,
    pub hosts_skipped: usize,
    pub specs_updated: usize,
    pub traces_merged: usize,
}

pub async fn run_generation(engine: &Engine, ctx: &Context) -> Result<OpenApiReport, ApiscopeError> {
    let cutoff = Utc::now();
    let mut report = OpenApiReport::default();
    let mut conn = engine.pool.acquire().await?;

    let sql = format!(
        "SELECT {} FROM {} WHERE e.openapi_spec_name IS NULL OR s.is_auto_generated = TRUE \
         ORDER BY e.host, e.path",
        ENDPOINT_SELECT,
        endpoint_from(ctx)
    );
    let endpoints = sqlx::query_as::<_, Endpoint>(&sql).fetch_all(&mut *conn).await?;

    let mut by_host: BTreeMap<String, Vec<Endpoint>> = BTreeMap::new();
    for endpoint in endpoints {
        by_host.entry(endpoint.host.clone()).or_default().push(endpoint);
    }

    for (host, endpoints) in by_host {
        report.hosts_scanned += 1;
        let name = OpenApiSpecDoc::generated_name(&host);
        let existing = load_spec(&mut conn, ctx, &name).await?;
        if existing.as_ref().is_some_and(|d| !d.is_auto_generated) {
            tracing::warn!(host = %host, spec = %name, "Uploaded spec uses the generated name, skipping host");
            report.hosts_skipped += 1;
            continue;
        }
        let is_new = existing.is_none();
        let mut doc = existing.unwrap_or_else(|| OpenApiSpecDoc::new_generated(&host));

        let mut merged = 0;
        for endpoint in &endpoints {
            let traces = fetch_traces_since(&mut conn, ctx, endpoint, doc.updated_at, cutoff).await?;
            for trace in &traces {
                merge_trace(&mut doc.spec.0, endpoint, trace);
            }
            merged += traces.len();
        }
        if merged == 0 && !is_new {
            continue;
        }

        doc.updated_at = Some(cutoff);
        save_spec(&mut conn, ctx, engine, &doc, &host).await?;
        report.traces_merged += merged;
        report.specs_updated += 1;
        tracing::debug!(host = %host, spec = %doc.name, traces = merged, "Generated spec updated");
    }

    tracing::info!(
        hosts = report.hosts_scanned,
        updated = report.specs_updated,
        traces = report.traces_merged,
        "OpenAPI generation complete"
    );
    Ok(report)
}

async fn load_spec(conn: &mut PgConnection, ctx: &Context, name: &str) -> Result<Option<OpenApiSpecDoc>, sqlx::Error> {
    let sql = format!(
        "SELECT name, spec, is_auto_generated, hosts, extension, updated_at FROM {} WHERE name = $1",
        ctx.table("open_api_spec")
    );
    sqlx::query_as::<_, OpenApiSpecDoc>(&sql)
        .bind(name)
        .fetch_optional(conn)
        .await
}

async fn fetch_traces_since(
    conn: &mut PgConnection,
    ctx: &Context,
    endpoint: &Endpoint,
    since: Option<DateTime<Utc>>,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Trace>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM {} WHERE endpoint_id = $1 \
           AND ($2::timestamptz IS NULL OR created_at > $2::timestamptz) AND created_at <= $3 \
         ORDER BY created_at, id",
        TRACE_COLUMNS,
        ctx.table("trace")
    );
    sqlx::query_as::<_, Trace>(&sql)
        .bind(endpoint.id)
        .bind(since)
        .bind(cutoff)
        .fetch_all(conn)
        .await
}

/// Write the document and link the host's unlinked endpoints to it.
async fn save_spec(
    conn: &mut PgConnection,
    ctx: &Context,
    engine: &Engine,
    doc: &OpenApiSpecDoc,
    host: &str,
) -> Result<(), ApiscopeError> {
    let upsert_sql = format!(
        "INSERT INTO {t} AS s (name, spec, is_auto_generated, hosts, extension, updated_at) \
         VALUES ($1, $2, TRUE, $3, $4, $5) \
         ON CONFLICT (name) DO UPDATE SET spec = EXCLUDED.spec, updated_at = EXCLUDED.updated_at \
         WHERE s.is_auto_generated",
        t = ctx.table("open_api_spec")
    );
    let link_sql = format!(
        "UPDATE {} SET openapi_spec_name = $1, updated_at = now() \
         WHERE host = $2 AND (openapi_spec_name IS NULL OR openapi_spec_name = $1)",
        ctx.table("endpoint")
    );

    let name = doc.name.clone();
    let host = host.to_string();
    let mut tx = conn.begin().await?;
    let result: Result<(), sqlx::Error> = async {
        let doc = doc.clone();
        retry_step(&mut tx, &engine.retry, "upsert_generated_spec", move |c| {
            let sql = upsert_sql.clone();
            let doc = doc.clone();
            Box::pin(async move {
                sqlx::query(&sql)
                    .bind(&doc.name)
                    .bind(Json(&doc.spec.0))
                    .bind(&doc.hosts)
                    .bind(&doc.extension)
                    .bind(doc.updated_at)
                    .execute(c)
                    .await
                    .map(|_| ())
            })
        })
        .await?;

        retry_step(&mut tx, &engine.retry, "link_generated_spec", move |c| {
            let sql = link_sql.clone();
            let (name, host) = (name.clone(), host.clone());
            Box::pin(async move {
                sqlx::query(&sql)
                    .bind(&name)
                    .bind(&host)
                    .execute(c)
                    .await
                    .map(|_| ())
            })
        })
        .await
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

// ============================================================================
// DOCUMENT MERGE
// ============================================================================

/// Fold one trace of `endpoint` into an OpenAPI document. Returns `false`,
/// leaving the document untouched, when its root is not an object.
pub fn merge_trace(doc: &mut Value, endpoint: &Endpoint, trace: &Trace) -> bool {
    // Every lookup creates what it needs, so this only bails on a document
    // whose root is not an object.
    let merged = merge_into(doc, endpoint, trace).is_some();
    if !merged {
        tracing::warn!(trace_id = %trace.id, endpoint_id = %endpoint.id, "OpenAPI document is not an object, trace skipped");
    }
    merged
}

fn merge_into(doc: &mut Value, endpoint: &Endpoint, trace: &Trace) -> Option<()> {
    if !doc.is_object() {
        return None;
    }
    let paths = child(doc.as_object_mut()?, "paths")?;
    let path_item = child(paths, &endpoint.path)?;
    let operation = child(path_item, &endpoint.method.to_ascii_lowercase())?;

    let template = segments(&endpoint.path);
    let observed = segments(&trace.path);
    if template.len() == observed.len() {
        for (slot, value) in template.iter().zip(observed) {
            if is_placeholder(slot) {
                let name = slot.trim_start_matches('{').trim_end_matches('}');
                merge_parameter(operation, name, "path", &parse_json_or_string(value));
            }
        }
    }
    for p in trace.request_parameters.iter() {
        merge_parameter(operation, &p.name, "query", &parse_json_or_string(&p.value));
    }
    for h in trace.request_headers.iter() {
        merge_parameter(
            operation,
            &h.name.to_ascii_lowercase(),
            "header",
            &Value::String(h.value.clone()),
        );
    }

    if !trace.request_body.is_empty() {
        let content_type = media_type(trace.request_content_type());
        let content = child(child(operation, "requestBody")?, "content")?;
        merge_body_at(child(content, &content_type)?, &trace.request_body);
    }

    let status = trace.response_status.to_string();
    let response = child(child(operation, "responses")?, &status)?;
    response
        .entry("description")
        .or_insert_with(|| Value::String(format!("{} description", status)));
    if !trace.response_headers.is_empty() {
        let headers = child(response, "headers")?;
        for h in trace.response_headers.iter() {
            let header = child(headers, &h.name.to_ascii_lowercase())?;
            merge_schema_at(header, &Value::String(h.value.clone()));
        }
    }
    if !trace.response_body.is_empty() {
        let content_type = media_type(trace.response_content_type());
        let content = child(response, "content")?;
        merge_body_at(child(content, &content_type)?, &trace.response_body);
    }
    Some(())
}

/// The object under `key`, created (or replaced, if not an object) as needed.
fn child<'a>(map: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Map<String, Value>> {
    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut()
}

/// Media type without parameters; `*/*` when the trace did not say.
fn media_type(content_type: Option<String>) -> String {
    content_type
        .and_then(|ct| ct.split(';').next().map(|s| s.trim().to_string()))
        .filter(|ct| !ct.is_empty())
        .unwrap_or_else(|| ANY_CONTENT_TYPE.to_string())
}

fn existing_schema(holder: &Map<String, Value>) -> Schema {
    holder
        .get("schema")
        .and_then(|s| serde_json::from_value(s.clone()).ok())
        .unwrap_or_default()
}

fn store_schema(holder: &mut Map<String, Value>, merged: &Schema) {
    if let Ok(encoded) = serde_json::to_value(merged) {
        holder.insert("schema".to_string(), encoded);
    }
}

fn merge_schema_at(holder: &mut Map<String, Value>, value: &Value) {
    let merged = schema::merge(existing_schema(holder), value);
    store_schema(holder, &merged);
}

/// Bodies that are not JSON leave an `unknown` node until valid JSON arrives.
fn merge_body_at(holder: &mut Map<String, Value>, raw: &str) {
    let merged = match schema::parse_body(raw) {
        Some(value) => schema::merge(existing_schema(holder), &value),
        None => schema::merge_unknown(existing_schema(holder)),
    };
    store_schema(holder, &merged);
}

fn merge_parameter(operation: &mut Map<String, Value>, name: &str, location: &str, value: &Value) {
    let slot = operation
        .entry("parameters")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    let Some(params) = slot.as_array_mut() else {
        return;
    };

    let found = params
        .iter()
        .position(|p| p.get("name").and_then(Value::as_str) == Some(name) && p.get("in").and_then(Value::as_str) == Some(location));
    let index = match found {
        Some(i) => i,
        None => {
            let mut param = Map::new();
            param.insert("name".to_string(), Value::String(name.to_string()));
            param.insert("in".to_string(), Value::String(location.to_string()));
            if location == "path" {
                param.insert("required".to_string(), Value::Bool(true));
            }
            params.push(Value::Object(param));
            params.len() - 1
        }
    };
    if let Some(param) = params[index].as_object_mut() {
        merge_schema_at(param, value);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use apiscope_core::config::PolicyConfig;
    use apiscope_core::models::PairObject;
    use apiscope_core::PathInferrer;
    use serde_json::json;

    fn endpoint(method: &str, path: &str) -> Endpoint {
        let template = PathInferrer::from_config(&PolicyConfig::default()).infer(path).unwrap();
        Endpoint::from_template("api.test", method, &template)
    }

    fn operation<'a>(doc: &'a Value, path: &str, method: &str) -> &'a Value {
        &doc["paths"][path][method]
    }

    #[test]
    fn merges_parameters_bodies_and_responses() {
        let e = endpoint("POST", "/users/42/notes");
        let mut t = Trace::new("api.test", "POST", "/users/42/notes", 201);
        t.request_parameters.0.push(PairObject::new("draft", "true"));
        t.request_headers.0.push(PairObject::new("Content-Type", "application/json; charset=utf-8"));
        t.request_body = json!({ "text": "hi" }).to_string();
        t.response_headers.0.push(PairObject::new("X-Request-Id", "abc"));
        t.response_body = json!({ "id": 7 }).to_string();

        let mut doc = OpenApiSpecDoc::new_generated("api.test").spec.0;
        assert!(merge_trace(&mut doc, &e, &t));

        let op = operation(&doc, "/users/{param1}/notes", "post");
        let params = op["parameters"].as_array().unwrap();
        let path_param = params.iter().find(|p| p["in"] == "path").unwrap();
        assert_eq!(path_param["name"], "param1");
        assert_eq!(path_param["required"], true);
        assert_eq!(path_param["schema"]["type"], "integer");
        let query = params.iter().find(|p| p["in"] == "query").unwrap();
        assert_eq!(query["name"], "draft");
        assert_eq!(query["schema"]["type"], "boolean");

        assert_eq!(
            op["requestBody"]["content"]["application/json"]["schema"]["properties"]["text"]["type"],
            "string"
        );
        let response = &op["responses"]["201"];
        assert_eq!(response["description"], "201 description");
        assert_eq!(response["headers"]["x-request-id"]["schema"]["type"], "string");
        assert_eq!(response["content"]["*/*"]["schema"]["properties"]["id"]["type"], "integer");
    }

    #[test]
    fn parameters_are_keyed_by_name_and_location() {
        let e = endpoint("GET", "/search");
        let mut doc = json!({});
        for value in ["1", "2.5"] {
            let mut t = Trace::new("api.test", "GET", "/search", 200);
            t.request_parameters.0.push(PairObject::new("q", value));
            t.request_headers.0.push(PairObject::new("q", "x"));
            merge_trace(&mut doc, &e, &t);
        }
        let params = operation(&doc, "/search", "get")["parameters"].as_array().unwrap();
        assert_eq!(params.len(), 2);
        let query = params.iter().find(|p| p["in"] == "query").unwrap();
        assert_eq!(query["schema"]["type"], "number");
    }

    #[test]
    fn responses_accumulate_by_status() {
        let e = endpoint("GET", "/health");
        let mut doc = json!({ "paths": {} });
        for status in [200, 503, 200] {
            merge_trace(&mut doc, &e, &Trace::new("api.test", "GET", "/health", status));
        }
        let responses = operation(&doc, "/health", "get")["responses"].as_object().unwrap();
        assert_eq!(responses.len(), 2);
        assert!(responses.contains_key("503"));
    }

    #[test]
    fn malformed_bodies_stay_unknown_until_json_arrives() {
        let e = endpoint("POST", "/upload");
        let mut doc = json!({});
        let mut t = Trace::new("api.test", "POST", "/upload", 200);
        t.request_body = "<xml/>".to_string();
        merge_trace(&mut doc, &e, &t);
        let schema = |doc: &Value| operation(doc, "/upload", "post")["requestBody"]["content"]["*/*"]["schema"].clone();
        assert_eq!(schema(&doc), json!({ "type": "unknown" }));

        t.request_body = json!({ "size": 3 }).to_string();
        merge_trace(&mut doc, &e, &t);
        assert_eq!(schema(&doc)["type"], "object");
        assert_eq!(schema(&doc)["properties"]["size"]["type"], "integer");
    }

    #[test]
    fn non_object_documents_are_left_alone() {
        let mut doc = json!([]);
        assert!(!merge_trace(&mut doc, &endpoint("GET", "/x"), &Trace::new("api.test", "GET", "/x", 200)));
        assert_eq!(doc, json!([]));
    }
}
