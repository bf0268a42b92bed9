use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::schema::{DataType, Schema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataSection {
    #[serde(rename = "req.params")]
    RequestQuery,
    #[serde(rename = "req.headers")]
    RequestHeaders,
    #[serde(rename = "req.body")]
    RequestBody,
    #[serde(rename = "res.headers")]
    ResponseHeaders,
    #[serde(rename = "res.body")]
    ResponseBody,
}

impl DataSection {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSection::RequestQuery => "req.params",
            DataSection::RequestHeaders => "req.headers",
            DataSection::RequestBody => "req.body",
            DataSection::ResponseHeaders => "res.headers",
            DataSection::ResponseBody => "res.body",
        }
    }
}

/// Tag applied to fields carrying at least one sensitivity class.
pub const SENSITIVE_TAG: &str = "PII";

/// A tracked location inside an endpoint's traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DataField {
    pub id: Uuid,
    pub data_section: String,
    pub data_path: String,
    pub endpoint_id: Uuid,
    pub data_type: String,
    pub data_tag: Option<String>,
    pub data_classes: Vec<String>,
    pub scanner_identified: Vec<String>,
    /// Classes a person marked as wrong for this field.
    pub false_positives: Vec<String>,
    /// Class → sample evidence from the scanner.
    pub matches: Json<BTreeMap<String, Vec<String>>>,
    pub schema: Json<Schema>,
}

impl DataField {
    pub fn new(section: DataSection, path: impl Into<String>, endpoint_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            data_section: section.as_str().to_string(),
            data_path: path.into(),
            endpoint_id,
            data_type: DataType::Unknown.as_str().to_string(),
            data_tag: None,
            data_classes: Vec::new(),
            scanner_identified: Vec::new(),
            false_positives: Vec::new(),
            matches: Json(BTreeMap::new()),
            schema: Json(Schema::default()),
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.data_section.clone(), self.data_path.clone())
    }

    pub fn is_sensitive(&self) -> bool {
        self.data_classes
            .iter()
            .any(|c| !self.false_positives.contains(c))
    }
}
