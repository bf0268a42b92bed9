//! Compare observed traffic with an uploaded OpenAPI document.
//!
//! Reports what the traffic shows that the document does not describe:
//! an operation, a query parameter, a request body property, a response
//! status or a response body property. Local `$ref`s are followed.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Trace;
use crate::path::{is_placeholder, segments};
use crate::schema::parse_json_or_string;

const MAX_REF_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecDiffKind {
    UndocumentedOperation,
    UndocumentedQueryParameter,
    UndocumentedRequestProperty,
    UndocumentedStatus,
    UndocumentedResponseProperty,
}

impl SpecDiffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecDiffKind::UndocumentedOperation => "undocumented_operation",
            SpecDiffKind::UndocumentedQueryParameter => "undocumented_query_parameter",
            SpecDiffKind::UndocumentedRequestProperty => "undocumented_request_property",
            SpecDiffKind::UndocumentedStatus => "undocumented_status",
            SpecDiffKind::UndocumentedResponseProperty => "undocumented_response_property",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpecDiff {
    pub kind: SpecDiffKind,
    /// Where in the traffic, e.g. `query.limit` or `res.body.200.user.ssn`.
    pub location: String,
}

impl SpecDiff {
    fn new(kind: SpecDiffKind, location: impl Into<String>) -> Self {
        Self {
            kind,
            location: location.into(),
        }
    }

    /// Stable identity used to suppress duplicate alerts.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.location)
    }
}

impl fmt::Display for SpecDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            SpecDiffKind::UndocumentedOperation => "Operation not documented",
            SpecDiffKind::UndocumentedQueryParameter => "Query parameter not documented",
            SpecDiffKind::UndocumentedRequestProperty => "Request body property not documented",
            SpecDiffKind::UndocumentedStatus => "Response status not documented",
            SpecDiffKind::UndocumentedResponseProperty => "Response body property not documented",
        };
        write!(f, "{}: {}", what, self.location)
    }
}

/// Differences between one trace of `method endpoint_path` and `spec`.
pub fn diff(spec: &Value, endpoint_path: &str, method: &str, trace: &Trace) -> Vec<SpecDiff> {
    let mut diffs = Vec::new();

    let Some((path_item, operation)) = find_operation(spec, endpoint_path, method) else {
        diffs.push(SpecDiff::new(
            SpecDiffKind::UndocumentedOperation,
            format!("{} {}", method.to_ascii_uppercase(), endpoint_path),
        ));
        return diffs;
    };

    let documented = query_parameter_names(spec, path_item, operation);
    for param in trace.request_parameters.iter() {
        if !documented.contains(&param.name) {
            diffs.push(SpecDiff::new(
                SpecDiffKind::UndocumentedQueryParameter,
                format!("query.{}", param.name),
            ));
        }
    }

    if !trace.request_body.is_empty() {
        let body_schema = operation
            .get("requestBody")
            .map(|rb| resolve(spec, rb))
            .and_then(|rb| rb.get("content"))
            .and_then(|content| media_schema(spec, content, trace.request_content_type()));
        if let Some(schema) = body_schema {
            let body = parse_json_or_string(&trace.request_body);
            undocumented_properties(
                spec,
                schema,
                &body,
                "req.body",
                SpecDiffKind::UndocumentedRequestProperty,
                &mut diffs,
            );
        }
    }

    let status = trace.response_status.to_string();
    let responses = operation.get("responses").and_then(Value::as_object);
    let response = responses.and_then(|r| r.get(&status).or_else(|| r.get("default")));
    match response {
        None => diffs.push(SpecDiff::new(
            SpecDiffKind::UndocumentedStatus,
            format!("status.{}", status),
        )),
        Some(response) => {
            let response = resolve(spec, response);
            if !trace.response_body.is_empty() {
                let schema = response
                    .get("content")
                    .and_then(|c| media_schema(spec, c, trace.response_content_type()));
                if let Some(schema) = schema {
                    let body = parse_json_or_string(&trace.response_body);
                    undocumented_properties(
                        spec,
                        schema,
                        &body,
                        &format!("res.body.{}", status),
                        SpecDiffKind::UndocumentedResponseProperty,
                        &mut diffs,
                    );
                }
            }
        }
    }

    diffs.sort();
    diffs.dedup();
    diffs
}

/// Follow local `#/...` references until a non-reference node.
pub fn resolve<'a>(spec: &'a Value, mut node: &'a Value) -> &'a Value {
    for _ in 0..MAX_REF_DEPTH {
        let Some(reference) = node.get("$ref").and_then(Value::as_str) else {
            return node;
        };
        match reference.strip_prefix('#').and_then(|p| spec.pointer(p)) {
            Some(target) => node = target,
            None => return node,
        }
    }
    node
}

/// Matches `/users/{param1}` to `/users/{id}`: same segment count, literal
/// segments equal, placeholders line up.
fn find_operation<'a>(
    spec: &'a Value,
    endpoint_path: &str,
    method: &str,
) -> Option<(&'a Value, &'a Value)> {
    let paths = spec.get("paths")?.as_object()?;
    let wanted = segments(endpoint_path);
    let method = method.to_ascii_lowercase();
    paths.iter().find_map(|(key, item)| {
        let candidate = segments(key);
        let same_shape = candidate.len() == wanted.len()
            && candidate.iter().zip(wanted.iter()).all(|(c, w)| {
                (is_placeholder(c) && is_placeholder(w)) || c == w
            });
        if !same_shape {
            return None;
        }
        let item = resolve(spec, item);
        item.get(&method).map(|op| (item, op))
    })
}

fn query_parameter_names(spec: &Value, path_item: &Value, operation: &Value) -> BTreeSet<String> {
    [path_item, operation]
        .iter()
        .filter_map(|v| v.get("parameters").and_then(Value::as_array))
        .flatten()
        .map(|p| resolve(spec, p))
        .filter(|p| p.get("in").and_then(Value::as_str) == Some("query"))
        .filter_map(|p| p.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn media_schema<'a>(spec: &'a Value, content: &'a Value, content_type: Option<String>) -> Option<&'a Value> {
    let content = content.as_object()?;
    let wanted = content_type
        .as_deref()
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .unwrap_or("*/*");
    let media = content
        .get(wanted)
        .or_else(|| content.get("*/*"))
        .or_else(|| content.values().next())?;
    media.get("schema").map(|s| resolve(spec, s))
}

fn undocumented_properties(
    spec: &Value,
    schema: &Value,
    value: &Value,
    location: &str,
    kind: SpecDiffKind,
    diffs: &mut Vec<SpecDiff>,
) {
    let schema = resolve(spec, schema);
    match value {
        Value::Object(map) => {
            // Free-form objects document nothing to compare against.
            let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
                return;
            };
            for (key, child) in map {
                let child_location = format!("{}.{}", location, key);
                match properties.get(key) {
                    Some(child_schema) => {
                        undocumented_properties(spec, child_schema, child, &child_location, kind, diffs)
                    }
                    None => diffs.push(SpecDiff::new(kind, child_location)),
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                let item_location = format!("{}[]", location);
                for item in items {
                    undocumented_properties(spec, item_schema, item, &item_location, kind, diffs);
                }
            }
        }
        _ => {}
    }
}
