//! Data field reconciliation.
//!
//! Walks every location a trace carries data in (query parameters, request
//! and response headers, request and response body fields), scans the
//! values and folds the findings into the endpoint's tracked fields.
//!
//! - Classes are only ever added.
//! - A class marked false positive at a location is never re-added there
//!   and never reported as new.
//! - Every field carries a merged schema of the values seen at it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use apiscope_core::models::{DataField, DataSection, RiskScore, Trace, SENSITIVE_TAG};
use apiscope_core::schema::{self, parse_body, parse_json_or_string};
use apiscope_core::Scanner;
use serde_json::Value;
use uuid::Uuid;

/// Evidence samples kept per class per field.
const MAX_MATCHES: usize = 5;

/// One value a trace carries at one location.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub section: DataSection,
    pub path: String,
    pub value: Value,
    /// The body did not parse; `value` holds its raw text.
    pub malformed: bool,
}

impl Observation {
    fn new(section: DataSection, path: String, value: Value) -> Self {
        Self {
            section,
            path,
            value,
            malformed: false,
        }
    }
}

/// A sensitivity class seen at one location of one trace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObservedClass {
    pub section: DataSection,
    pub path: String,
    pub class: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Fields that are new or differ from what was loaded.
    pub changed: Vec<DataField>,
    /// Classes recorded at a location for the first time.
    pub new_classes: Vec<ObservedClass>,
    /// Non-false-positive classes present in this trace's response.
    pub response_classes: BTreeSet<String>,
    /// Highest class risk across the endpoint's fields after this trace.
    pub risk: RiskScore,
}

pub struct Reconciler {
    scanner: Arc<dyn Scanner>,
}

impl Reconciler {
    pub fn new(scanner: Arc<dyn Scanner>) -> Self {
        Self { scanner }
    }

    pub fn reconcile(&self, trace: &Trace, endpoint_id: Uuid, existing: &[DataField]) -> ReconcileOutcome {
        let mut fields: BTreeMap<(String, String), DataField> = existing
            .iter()
            .map(|f| (f.key(), f.clone()))
            .collect();
        let mut touched: BTreeSet<(String, String)> = BTreeSet::new();
        let mut outcome = ReconcileOutcome::default();

        for Observation {
            section,
            path,
            value,
            malformed,
        } in observations(trace)
        {
            let key = (section.as_str().to_string(), path.clone());
            let field = fields
                .entry(key.clone())
                .or_insert_with(|| DataField::new(section, path.clone(), endpoint_id));
            touched.insert(key);

            let merged = if malformed {
                schema::merge_unknown(field.schema.0.clone())
            } else {
                schema::merge(field.schema.0.clone(), &value)
            };
            field.data_type = merged.primary_type().as_str().to_string();
            field.schema.0 = merged;

            let Some(text) = scannable(&value) else {
                continue;
            };
            for (class, evidence) in self.scanner.scan(&text) {
                if !field.scanner_identified.contains(&class) {
                    field.scanner_identified.push(class.clone());
                }
                if field.false_positives.contains(&class) {
                    continue;
                }
                if !field.data_classes.contains(&class) {
                    field.data_classes.push(class.clone());
                    outcome.new_classes.push(ObservedClass {
                        section,
                        path: path.clone(),
                        class: class.clone(),
                    });
                }
                let samples = field.matches.0.entry(class.clone()).or_default();
                for sample in evidence {
                    if samples.len() >= MAX_MATCHES {
                        break;
                    }
                    if !samples.contains(&sample) {
                        samples.push(sample);
                    }
                }
                if matches!(section, DataSection::ResponseHeaders | DataSection::ResponseBody) {
                    outcome.response_classes.insert(class);
                }
            }
            if field.is_sensitive() {
                field.data_tag = Some(SENSITIVE_TAG.to_string());
            }
        }

        outcome.new_classes.sort();
        outcome.new_classes.dedup();

        let before: BTreeMap<(String, String), &DataField> =
            existing.iter().map(|f| (f.key(), f)).collect();
        for (key, field) in &fields {
            if !touched.contains(key) {
                continue;
            }
            if before.get(key).map_or(true, |old| *old != field) {
                outcome.changed.push(field.clone());
            }
        }

        outcome.risk = fields
            .values()
            .flat_map(|f| {
                f.data_classes
                    .iter()
                    .filter(|c| !f.false_positives.contains(c))
                    .map(|c| self.scanner.risk(c))
            })
            .max()
            .unwrap_or_default();

        outcome
    }
}

/// Every value a trace carries, by location.
pub fn observations(trace: &Trace) -> Vec<Observation> {
    let mut out = Vec::new();
    for p in trace.request_parameters.iter() {
        out.push(Observation::new(
            DataSection::RequestQuery,
            p.name.clone(),
            parse_json_or_string(&p.value),
        ));
    }
    for h in trace.request_headers.iter() {
        out.push(Observation::new(
            DataSection::RequestHeaders,
            h.name.to_ascii_lowercase(),
            Value::String(h.value.clone()),
        ));
    }
    body(DataSection::RequestBody, &trace.request_body, &mut out);
    for h in trace.response_headers.iter() {
        out.push(Observation::new(
            DataSection::ResponseHeaders,
            h.name.to_ascii_lowercase(),
            Value::String(h.value.clone()),
        ));
    }
    body(DataSection::ResponseBody, &trace.response_body, &mut out);
    out
}

/// An unparseable body is one malformed observation at the body root.
fn body(section: DataSection, raw: &str, out: &mut Vec<Observation>) {
    if raw.is_empty() {
        return;
    }
    match parse_body(raw) {
        Some(value) => flatten(section, &value, String::new(), out),
        None => out.push(Observation {
            section,
            path: String::new(),
            value: Value::String(raw.to_string()),
            malformed: true,
        }),
    }
}

/// Leaves of a body as dot paths; array elements share a `[]` path.
/// An empty path is the body itself.
fn flatten(section: DataSection, value: &Value, prefix: String, out: &mut Vec<Observation>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(section, child, path, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for item in items {
                flatten(section, item, format!("{}[]", prefix), out);
            }
        }
        _ => out.push(Observation::new(section, prefix, value.clone())),
    }
}

fn scannable(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiscope_core::config::ScannerConfig;
    use apiscope_core::models::PairObject;
    use apiscope_core::PatternScanner;
    use sqlx::types::Json;

    fn reconciler() -> Reconciler {
        let mut config = ScannerConfig::default();
        config
            .patterns
            .insert("EMAIL".into(), r"[\w.+-]+@[\w-]+\.[\w.]+".into());
        config.patterns.insert("SSN".into(), r"\b\d{3}-\d{2}-\d{4}\b".into());
        config.risk.insert("SSN".into(), "high".into());
        Reconciler::new(Arc::new(PatternScanner::from_config(&config).unwrap()))
    }

    fn trace_with_body(body: serde_json::Value) -> Trace {
        let mut t = Trace::new("h", "GET", "/users/1", 200);
        t.response_body = body.to_string();
        t
    }

    fn field<'a>(fields: &'a [DataField], section: &str, path: &str) -> &'a DataField {
        fields
            .iter()
            .find(|f| f.data_section == section && f.data_path == path)
            .unwrap_or_else(|| panic!("no field {} {}", section, path))
    }

    #[test]
    fn flattens_bodies_into_dot_paths() {
        let t = trace_with_body(serde_json::json!({
            "user": { "email": "a@b.io", "tags": ["x", "y"] },
            "items": [{ "id": 1 }],
            "empty": {}
        }));
        let paths: Vec<String> = observations(&t).into_iter().map(|o| o.path).collect();
        assert!(paths.contains(&"user.email".to_string()));
        assert!(paths.contains(&"user.tags[]".to_string()));
        assert!(paths.contains(&"items[].id".to_string()));
        assert!(paths.contains(&"empty".to_string()));
    }

    #[test]
    fn records_new_classes_and_schema() {
        let endpoint_id = Uuid::new_v4();
        let mut t = trace_with_body(serde_json::json!({ "email": "jane@example.com", "age": 41 }));
        t.request_parameters = Json(vec![PairObject::new("ssn", "123-45-6789")]);

        let outcome = reconciler().reconcile(&t, endpoint_id, &[]);
        let email = field(&outcome.changed, "res.body", "email");
        assert_eq!(email.data_classes, vec!["EMAIL".to_string()]);
        assert_eq!(email.data_tag.as_deref(), Some(SENSITIVE_TAG));
        assert_eq!(email.data_type, "string");
        assert_eq!(field(&outcome.changed, "res.body", "age").data_type, "integer");
        assert_eq!(outcome.new_classes.len(), 2);
        assert_eq!(outcome.response_classes, BTreeSet::from(["EMAIL".to_string()]));
        assert_eq!(outcome.risk, RiskScore::High);
    }

    #[test]
    fn never_removes_classes() {
        let endpoint_id = Uuid::new_v4();
        let r = reconciler();
        let first = r.reconcile(
            &trace_with_body(serde_json::json!({ "contact": "jane@example.com" })),
            endpoint_id,
            &[],
        );
        let second = r.reconcile(
            &trace_with_body(serde_json::json!({ "contact": 12 })),
            endpoint_id,
            &first.changed,
        );
        let contact = field(&second.changed, "res.body", "contact");
        assert_eq!(contact.data_classes, vec!["EMAIL".to_string()]);
        assert!(second.new_classes.is_empty());
    }

    #[test]
    fn false_positives_are_not_re_added() {
        let endpoint_id = Uuid::new_v4();
        let r = reconciler();
        let t = trace_with_body(serde_json::json!({ "contact": "jane@example.com" }));
        let mut fields = r.reconcile(&t, endpoint_id, &[]).changed;
        fields[0].data_classes.clear();
        fields[0].false_positives.push("EMAIL".into());
        fields[0].data_tag = None;

        let outcome = r.reconcile(&t, endpoint_id, &fields);
        assert!(outcome.new_classes.is_empty());
        assert!(outcome.response_classes.is_empty());
        assert_eq!(outcome.risk, RiskScore::None);
        assert!(outcome.changed.iter().all(|f| f.data_classes.is_empty()));
    }

    #[test]
    fn unchanged_fields_are_not_rewritten() {
        let endpoint_id = Uuid::new_v4();
        let r = reconciler();
        let t = trace_with_body(serde_json::json!({ "n": 1 }));
        let fields = r.reconcile(&t, endpoint_id, &[]).changed;
        assert_eq!(fields.len(), 1);
        assert!(r.reconcile(&t, endpoint_id, &fields).changed.is_empty());
    }

    #[test]
    fn malformed_body_is_unknown_but_still_scanned() {
        let mut t = Trace::new("h", "POST", "/upload", 200);
        t.request_body = "{not json, contact jane@example.com".to_string();
        let outcome = reconciler().reconcile(&t, Uuid::new_v4(), &[]);
        let root = field(&outcome.changed, "req.body", "");
        assert_eq!(root.data_type, "unknown");
        assert_eq!(root.data_classes, vec!["EMAIL".to_string()]);
    }
}
