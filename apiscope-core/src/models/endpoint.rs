use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::path::PathTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskScore {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl RiskScore {
    pub fn rank(self) -> i16 {
        match self {
            RiskScore::None => 0,
            RiskScore::Low => 1,
            RiskScore::Medium => 2,
            RiskScore::High => 3,
        }
    }

    pub fn from_rank(rank: i16) -> Self {
        match rank {
            i16::MIN..=0 => RiskScore::None,
            1 => RiskScore::Low,
            2 => RiskScore::Medium,
            _ => RiskScore::High,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(RiskScore::None),
            "low" => Some(RiskScore::Low),
            "medium" => Some(RiskScore::Medium),
            "high" => Some(RiskScore::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskScore::None => "none",
            RiskScore::Low => "low",
            RiskScore::Medium => "medium",
            RiskScore::High => "high",
        }
    }
}

/// An inferred resource template.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Endpoint {
    pub id: Uuid,
    pub host: String,
    pub method: String,
    pub path: String,
    pub path_regex: String,
    pub number_params: i32,
    pub first_detected: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub risk_score: i16,
    pub openapi_spec_name: Option<String>,
    pub is_graphql: bool,
    pub is_authenticated_detected: Option<bool>,
    /// `is_auto_generated` of the linked spec, when one is linked.
    #[sqlx(default)]
    pub spec_auto_generated: Option<bool>,
}

impl Endpoint {
    pub fn from_template(host: &str, method: &str, template: &PathTemplate) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.to_string(),
            method: method.to_ascii_uppercase(),
            path: template.path.clone(),
            path_regex: template.pattern.clone(),
            number_params: template.param_count as i32,
            first_detected: None,
            last_active: None,
            risk_score: 0,
            openapi_spec_name: None,
            is_graphql: template.is_graphql,
            is_authenticated_detected: None,
            spec_auto_generated: None,
        }
    }

    /// Widen the first/last seen window to include `at`.
    pub fn update_dates(&mut self, at: DateTime<Utc>) {
        self.first_detected = Some(self.first_detected.map_or(at, |t| t.min(at)));
        self.last_active = Some(self.last_active.map_or(at, |t| t.max(at)));
    }

    pub fn risk(&self) -> RiskScore {
        RiskScore::from_rank(self.risk_score)
    }

    /// Linked to an uploaded (not generated) spec.
    pub fn has_uploaded_spec(&self) -> bool {
        self.openapi_spec_name.is_some() && self.spec_auto_generated == Some(false)
    }
}
