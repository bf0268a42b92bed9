use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::endpoint::RiskScore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    NewEndpoint,
    SensitiveDataDetected,
    SpecDiff,
    UnauthenticatedSensitiveData,
    MissingHsts,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::NewEndpoint => "new_endpoint",
            AlertType::SensitiveDataDetected => "sensitive_data_detected",
            AlertType::SpecDiff => "spec_diff",
            AlertType::UnauthenticatedSensitiveData => "unauthenticated_sensitive_data",
            AlertType::MissingHsts => "missing_hsts",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Resolved => "resolved",
        }
    }
}

/// An alert waiting to be inserted. `(alert_type, endpoint_id, dedup_key)`
/// identifies the trigger; a second insert for the same trigger is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub risk_score: RiskScore,
    pub endpoint_id: Uuid,
    pub trace_id: Option<Uuid>,
    pub dedup_key: String,
    pub description: String,
    pub context: serde_json::Value,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        risk_score: RiskScore,
        endpoint_id: Uuid,
        dedup_key: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            risk_score,
            endpoint_id,
            trace_id: None,
            dedup_key: dedup_key.into(),
            description: description.into(),
            context: serde_json::json!({}),
            status: AlertStatus::Open,
            created_at: Utc::now(),
        }
    }

    pub fn with_trace(mut self, trace_id: Uuid, at: DateTime<Utc>) -> Self {
        self.trace_id = Some(trace_id);
        self.created_at = at;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Identity of the trigger, for in-memory dedup.
    pub fn trigger_key(&self) -> (AlertType, Uuid, &str) {
        (self.alert_type, self.endpoint_id, self.dedup_key.as_str())
    }
}
