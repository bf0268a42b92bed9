//! Alert generation and conflict-ignoring persistence.
//!
//! Each trigger builds an [`Alert`] whose `dedup_key` identifies what fired
//! it; `(alert_type, endpoint_id, dedup_key)` is unique in the store so
//! re-running a trigger never produces a second alert.

use apiscope_core::models::{Alert, AlertType, Endpoint, RiskScore, Trace};
use apiscope_core::{Context, Scanner, SpecDiff};
use sqlx::PgConnection;

use super::reconcile::{ObservedClass, ReconcileOutcome};

pub fn new_endpoint_alert(endpoint: &Endpoint, trace: &Trace) -> Alert {
    Alert::new(
        AlertType::NewEndpoint,
        RiskScore::Low,
        endpoint.id,
        "",
        format!("New endpoint {} {} on {}", endpoint.method, endpoint.path, endpoint.host),
    )
    .with_trace(trace.id, trace.created_at)
}

pub fn sensitive_data_alerts(
    endpoint: &Endpoint,
    trace: &Trace,
    new_classes: &[ObservedClass],
    scanner: &dyn Scanner,
) -> Vec<Alert> {
    new_classes
        .iter()
        .map(|o| {
            let location = format!("{}.{}", o.section.as_str(), o.path);
            Alert::new(
                AlertType::SensitiveDataDetected,
                scanner.risk(&o.class),
                endpoint.id,
                format!("{}:{}", location, o.class),
                format!("{} detected in {} of {} {}", o.class, location, endpoint.method, endpoint.path),
            )
            .with_trace(trace.id, trace.created_at)
            .with_context(serde_json::json!({
                "dataSection": o.section.as_str(),
                "dataPath": o.path,
                "dataClass": o.class,
            }))
        })
        .collect()
}

pub fn spec_diff_alerts(endpoint: &Endpoint, trace: &Trace, diffs: &[SpecDiff]) -> Vec<Alert> {
    diffs
        .iter()
        .map(|d| {
            Alert::new(
                AlertType::SpecDiff,
                RiskScore::Medium,
                endpoint.id,
                d.key(),
                d.to_string(),
            )
            .with_trace(trace.id, trace.created_at)
            .with_context(serde_json::json!({
                "kind": d.kind,
                "location": d.location,
                "specName": endpoint.openapi_spec_name,
            }))
        })
        .collect()
}

/// Sensitive data served to a caller that presented no credentials.
pub fn unauthenticated_alert(endpoint: &Endpoint, trace: &Trace, outcome: &ReconcileOutcome) -> Option<Alert> {
    if !trace.session_meta.is_unauthenticated_success() || outcome.response_classes.is_empty() {
        return None;
    }
    let classes: Vec<&str> = outcome.response_classes.iter().map(String::as_str).collect();
    Some(
        Alert::new(
            AlertType::UnauthenticatedSensitiveData,
            RiskScore::High,
            endpoint.id,
            "",
            format!(
                "{} {} returns sensitive data ({}) without authentication",
                endpoint.method,
                endpoint.path,
                classes.join(", ")
            ),
        )
        .with_trace(trace.id, trace.created_at)
        .with_context(serde_json::json!({ "dataClasses": classes })),
    )
}

pub fn missing_hsts_alert(endpoint: &Endpoint, trace: &Trace) -> Alert {
    Alert::new(
        AlertType::MissingHsts,
        RiskScore::Medium,
        endpoint.id,
        "",
        format!(
            "{} {} on {} does not send Strict-Transport-Security",
            endpoint.method, endpoint.path, endpoint.host
        ),
    )
    .with_trace(trace.id, trace.created_at)
}

/// Insert alerts, ignoring any whose trigger already has one.
/// Returns the number actually inserted.
pub async fn insert_alerts(conn: &mut PgConnection, ctx: &Context, alerts: &[Alert]) -> Result<u64, sqlx::Error> {
    let sql = format!(
        "INSERT INTO {} (id, alert_type, risk_score, endpoint_id, trace_id, dedup_key, description, \
         context, status, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) \
         ON CONFLICT ON CONSTRAINT unique_alert_type_endpoint_key DO NOTHING",
        ctx.table("alert")
    );
    let mut inserted = 0;
    for alert in alerts {
        let result = sqlx::query(&sql)
            .bind(alert.id)
            .bind(alert.alert_type.as_str())
            .bind(alert.risk_score.rank())
            .bind(alert.endpoint_id)
            .bind(alert.trace_id)
            .bind(&alert.dedup_key)
            .bind(&alert.description)
            .bind(sqlx::types::Json(&alert.context))
            .bind(alert.status.as_str())
            .bind(alert.created_at)
            .execute(&mut *conn)
            .await?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiscope_core::models::{DataSection, SessionMeta};
    use apiscope_core::path::PathTemplate;
    use apiscope_core::PatternScanner;
    use sqlx::types::Json;
    use std::collections::BTreeSet;

    fn endpoint() -> Endpoint {
        Endpoint::from_template(
            "api.test",
            "GET",
            &PathTemplate {
                path: "/users/{param1}".into(),
                pattern: "^/users/[^/]+(/)*$".into(),
                param_count: 1,
                is_graphql: false,
            },
        )
    }

    #[test]
    fn sensitive_alerts_are_keyed_by_location_and_class() {
        let e = endpoint();
        let t = Trace::new("api.test", "GET", "/users/1", 200);
        let observed = vec![ObservedClass {
            section: DataSection::ResponseBody,
            path: "user.email".into(),
            class: "EMAIL".into(),
        }];
        let alerts = sensitive_data_alerts(&e, &t, &observed, &PatternScanner::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].dedup_key, "res.body.user.email:EMAIL");
        assert_eq!(alerts[0].risk_score, RiskScore::Medium);
        assert_eq!(alerts[0].trace_id, Some(t.id));
    }

    #[test]
    fn unauthenticated_alert_needs_both_signals() {
        let e = endpoint();
        let mut t = Trace::new("api.test", "GET", "/users/1", 200);
        let mut outcome = ReconcileOutcome::default();
        assert!(unauthenticated_alert(&e, &t, &outcome).is_none());

        outcome.response_classes = BTreeSet::from(["EMAIL".to_string()]);
        assert!(unauthenticated_alert(&e, &t, &outcome).is_none());

        t.session_meta = Json(SessionMeta {
            authentication_provided: Some(false),
            authentication_successful: Some(true),
        });
        let alert = unauthenticated_alert(&e, &t, &outcome).unwrap();
        assert_eq!(alert.alert_type, AlertType::UnauthenticatedSensitiveData);
        assert_eq!(alert.risk_score, RiskScore::High);
    }

    #[test]
    fn one_new_endpoint_trigger_per_endpoint() {
        let e = endpoint();
        let a = new_endpoint_alert(&e, &Trace::new("api.test", "GET", "/users/1", 200));
        let b = new_endpoint_alert(&e, &Trace::new("api.test", "GET", "/users/2", 200));
        assert_eq!(a.trigger_key(), b.trigger_key());
    }
}
