use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

/// A stored OpenAPI document. Generated documents are named
/// `{host}-generated` and carry `is_auto_generated = true`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OpenApiSpecDoc {
    pub name: String,
    pub spec: Json<serde_json::Value>,
    pub is_auto_generated: bool,
    pub hosts: Vec<String>,
    pub extension: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl OpenApiSpecDoc {
    pub fn generated_name(host: &str) -> String {
        format!("{}-generated", host)
    }

    pub fn new_generated(host: &str) -> Self {
        Self {
            name: Self::generated_name(host),
            spec: Json(serde_json::json!({
                "openapi": "3.0.0",
                "info": {
                    "title": "OpenAPI 3.0 Spec",
                    "version": "1.0.0",
                    "description": "An auto-generated OpenAPI 3.0 specification.",
                },
                "servers": [{ "url": host }],
                "paths": {},
            })),
            is_auto_generated: true,
            hosts: vec![host.to_string()],
            extension: "json".to_string(),
            updated_at: None,
        }
    }
}
