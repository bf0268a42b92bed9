use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::context::RequestContext;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairObject {
    pub name: String,
    pub value: String,
}

impl PairObject {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// What the capture layer could tell about the caller's credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_provided: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_successful: Option<bool>,
}

impl SessionMeta {
    /// Request got through without presenting credentials.
    pub fn is_unauthenticated_success(&self) -> bool {
        self.authentication_provided == Some(false) && self.authentication_successful != Some(false)
    }
}

/// One observed request/response exchange.
///
/// The serde shape is the queue's camelCase wire format; the sqlx shape is the
/// `trace` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub host: String,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub request_parameters: Json<Vec<PairObject>>,
    #[serde(default)]
    pub request_headers: Json<Vec<PairObject>>,
    #[serde(default)]
    pub request_body: String,
    pub response_status: i32,
    #[serde(default)]
    pub response_headers: Json<Vec<PairObject>>,
    #[serde(default)]
    pub response_body: String,
    #[serde(default)]
    pub meta: Json<serde_json::Value>,
    #[serde(default)]
    pub session_meta: Json<SessionMeta>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub endpoint_id: Option<Uuid>,
    #[serde(default)]
    pub analyzed: bool,
}

impl Trace {
    pub fn new(host: impl Into<String>, method: impl Into<String>, path: impl Into<String>, status: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.into(),
            path: path.into(),
            method: method.into().to_ascii_uppercase(),
            request_parameters: Json(Vec::new()),
            request_headers: Json(Vec::new()),
            request_body: String::new(),
            response_status: status,
            response_headers: Json(Vec::new()),
            response_body: String::new(),
            meta: Json(serde_json::json!({})),
            session_meta: Json(SessionMeta::default()),
            created_at: Utc::now(),
            endpoint_id: None,
            analyzed: false,
        }
    }

    /// 404 and 405 responses can never describe a real resource.
    pub fn is_not_found(&self) -> bool {
        self.response_status == 404 || self.response_status == 405
    }

    pub fn request_content_type(&self) -> Option<String> {
        find_header(&self.request_headers, "content-type").map(|v| v.to_ascii_lowercase())
    }

    pub fn response_content_type(&self) -> Option<String> {
        find_header(&self.response_headers, "content-type").map(|v| v.to_ascii_lowercase())
    }

    pub fn has_response_header(&self, name: &str) -> bool {
        find_header(&self.response_headers, name).is_some()
    }
}

fn find_header<'a>(headers: &'a [PairObject], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// A work-queue item: the trace plus the context it must be analyzed in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTrace {
    pub trace: Trace,
    #[serde(default)]
    pub ctx: RequestContext,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_queue_wire_format() {
        let raw = serde_json::json!({
            "trace": {
                "host": "shop.example.com",
                "path": "/product/42",
                "method": "GET",
                "requestParameters": [{"name": "q", "value": "shoes"}],
                "responseStatus": 200,
                "responseHeaders": [{"name": "Content-Type", "value": "application/json"}],
                "responseBody": "{\"ok\":true}",
                "sessionMeta": {"authenticationProvided": false, "authenticationSuccessful": true},
                "createdAt": "2024-03-01T10:15:00Z"
            },
            "ctx": {"schema": "acme"}
        });

        let queued: QueuedTrace = serde_json::from_value(raw).expect("wire format should parse");
        assert_eq!(queued.trace.path, "/product/42");
        assert_eq!(queued.trace.request_parameters.0[0].name, "q");
        assert_eq!(queued.trace.response_content_type().as_deref(), Some("application/json"));
        assert!(queued.trace.session_meta.is_unauthenticated_success());
        assert_eq!(queued.ctx.schema.as_deref(), Some("acme"));
        assert!(queued.trace.endpoint_id.is_none());
        assert!(!queued.trace.analyzed);
    }

    #[test]
    fn header_lookup_ignores_case() {
        let mut trace = Trace::new("h", "get", "/", 200);
        trace.response_headers.0.push(PairObject::new("strict-transport-security", "max-age=1"));
        assert!(trace.has_response_header("Strict-Transport-Security"));
        assert_eq!(trace.method, "GET");
    }

    #[test]
    fn not_found_statuses() {
        assert!(Trace::new("h", "GET", "/x", 404).is_not_found());
        assert!(Trace::new("h", "GET", "/x", 405).is_not_found());
        assert!(!Trace::new("h", "GET", "/x", 500).is_not_found());
    }
}
