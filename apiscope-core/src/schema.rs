//! Schema merge engine.
//!
//! Folds observed JSON values into an OpenAPI-shaped schema. The merge is a
//! lattice join: properties are only ever added, scalar types only widen
//! (`integer` → `number`, conflicting types → `oneOf`), and `null` only ever
//! turns `nullable` on. Merging a value the schema already covers returns the
//! schema unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Unknown,
}

impl DataType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => DataType::Unknown,
            Value::Bool(_) => DataType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => DataType::Integer,
            Value::Number(_) => DataType::Number,
            Value::String(_) => DataType::String,
            Value::Array(_) => DataType::Array,
            Value::Object(_) => DataType::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Object => "object",
            DataType::Array => "array",
            DataType::Unknown => "unknown",
        }
    }

    /// The narrowest type covering both, if the pair widens cleanly.
    fn join(self, other: DataType) -> Option<DataType> {
        use DataType::*;
        match (self, other) {
            (a, b) if a == b => Some(a),
            (Integer, Number) | (Number, Integer) => Some(Number),
            (Unknown, t) | (t, Unknown) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Schema>>,
    #[serde(rename = "oneOf", default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Schema>>,
}

impl Schema {
    pub fn is_empty(&self) -> bool {
        self.data_type.is_none() && self.one_of.is_none() && self.nullable.is_none()
    }

    /// The type reported for a data field: the single type, or `unknown`
    /// once the location has carried incompatible shapes.
    pub fn primary_type(&self) -> DataType {
        match (&self.data_type, &self.one_of) {
            (Some(t), None) => *t,
            _ => DataType::Unknown,
        }
    }

    /// Does this schema describe `value`? Empty schemas accept anything.
    pub fn accepts(&self, value: &Value) -> bool {
        if self.is_empty() {
            return true;
        }
        if value.is_null() {
            return self.nullable == Some(true) || self.data_type == Some(DataType::Unknown);
        }
        if let Some(variants) = &self.one_of {
            return variants.iter().any(|v| v.accepts(value));
        }
        let observed = DataType::of(value);
        match self.data_type {
            Some(DataType::Object) => match value {
                Value::Object(map) => map.iter().all(|(k, v)| {
                    self.properties
                        .as_ref()
                        .and_then(|p| p.get(k))
                        .map(|s| s.accepts(v))
                        .unwrap_or(false)
                }),
                _ => false,
            },
            Some(DataType::Array) => match value {
                Value::Array(elems) => {
                    let items = self.items.as_deref().cloned().unwrap_or_default();
                    elems.iter().all(|e| items.accepts(e))
                }
                _ => false,
            },
            Some(DataType::Number) => matches!(observed, DataType::Number | DataType::Integer),
            Some(t) => t == observed,
            None => false,
        }
    }
}

/// Fold `observed` into `existing`.
pub fn merge(existing: Schema, observed: &Value) -> Schema {
    if observed.is_null() {
        return merge_null(existing);
    }
    let observed_type = DataType::of(observed);

    if let Some(mut variants) = existing.one_of.clone() {
        match variants
            .iter()
            .position(|v| v.data_type.and_then(|t| t.join(observed_type)).is_some())
        {
            Some(i) => {
                let v = std::mem::take(&mut variants[i]);
                variants[i] = merge(v, observed);
            }
            None => variants.push(merge(Schema::default(), observed)),
        }
        return Schema {
            one_of: Some(variants),
            ..existing
        };
    }

    let joined = match existing.data_type {
        None => Some(observed_type),
        Some(t) => t.join(observed_type),
    };

    match joined {
        Some(t) => merge_same_type(existing, t, observed),
        None => {
            // Incompatible shapes: keep both as alternatives.
            let nullable = existing.nullable;
            let first = Schema {
                nullable: None,
                ..existing
            };
            Schema {
                one_of: Some(vec![first, merge(Schema::default(), observed)]),
                nullable,
                ..Schema::default()
            }
        }
    }
}

fn merge_null(existing: Schema) -> Schema {
    if existing.is_empty() {
        return Schema {
            data_type: Some(DataType::Unknown),
            nullable: Some(true),
            ..Schema::default()
        };
    }
    Schema {
        nullable: Some(true),
        ..existing
    }
}

fn merge_same_type(existing: Schema, data_type: DataType, observed: &Value) -> Schema {
    match observed {
        Value::Object(map) => {
            let mut properties = existing.properties.unwrap_or_default();
            for (key, value) in map {
                let sub = properties.remove(key).unwrap_or_default();
                properties.insert(key.clone(), merge(sub, value));
            }
            Schema {
                data_type: Some(DataType::Object),
                nullable: existing.nullable,
                properties: Some(properties),
                items: existing.items,
                one_of: None,
            }
        }
        Value::Array(elems) => {
            let mut items = existing.items.map(|b| *b).unwrap_or_default();
            for elem in elems {
                items = merge(items, elem);
            }
            Schema {
                data_type: Some(DataType::Array),
                nullable: existing.nullable,
                items: Some(Box::new(items)),
                properties: existing.properties,
                one_of: None,
            }
        }
        _ => Schema {
            data_type: Some(data_type),
            ..existing
        },
    }
}

/// Record that a location carried data of no recognizable shape. An empty
/// schema becomes `unknown`; anything already typed is left as is.
pub fn merge_unknown(existing: Schema) -> Schema {
    if existing.is_empty() {
        return Schema {
            data_type: Some(DataType::Unknown),
            ..Schema::default()
        };
    }
    existing
}

/// Parse text as JSON; anything that is not JSON is kept as a string value.
pub fn parse_json_or_string(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// A request or response body as JSON, or `None` when it does not parse.
pub fn parse_body(raw: &str) -> Option<Value> {
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fold(values: &[Value]) -> Schema {
        values.iter().fold(Schema::default(), |s, v| merge(s, v))
    }

    #[test]
    fn object_properties_accumulate() {
        let schema = fold(&[json!({"a": 1}), json!({"b": "x"})]);
        let props = schema.properties.as_ref().unwrap();
        assert_eq!(schema.data_type, Some(DataType::Object));
        assert_eq!(props["a"].data_type, Some(DataType::Integer));
        assert_eq!(props["b"].data_type, Some(DataType::String));
    }

    #[test]
    fn empty_object_keeps_type() {
        let schema = fold(&[json!({})]);
        assert_eq!(schema.data_type, Some(DataType::Object));
        assert_eq!(schema.properties, Some(BTreeMap::new()));
    }

    #[test]
    fn empty_array_records_empty_items() {
        let schema = fold(&[json!([])]);
        assert_eq!(schema.data_type, Some(DataType::Array));
        assert_eq!(schema.items.as_deref(), Some(&Schema::default()));
    }

    #[test]
    fn array_elements_share_one_item_schema() {
        let schema = fold(&[json!([{"id": 1}, {"name": "n"}])]);
        let items = schema.items.unwrap();
        let props = items.properties.unwrap();
        assert!(props.contains_key("id"));
        assert!(props.contains_key("name"));
    }

    #[test]
    fn null_marks_unknown_nullable() {
        let schema = fold(&[Value::Null]);
        assert_eq!(schema.data_type, Some(DataType::Unknown));
        assert_eq!(schema.nullable, Some(true));

        let schema = fold(&[json!("x"), Value::Null]);
        assert_eq!(schema.data_type, Some(DataType::String));
        assert_eq!(schema.nullable, Some(true));
    }

    #[test]
    fn unknown_then_concrete_widens() {
        let schema = fold(&[Value::Null, json!(3)]);
        assert_eq!(schema.data_type, Some(DataType::Integer));
        assert_eq!(schema.nullable, Some(true));
    }

    #[test]
    fn integer_widens_to_number() {
        let schema = fold(&[json!(1), json!(1.5)]);
        assert_eq!(schema.data_type, Some(DataType::Number));
        let schema = fold(&[json!(1.5), json!(1)]);
        assert_eq!(schema.data_type, Some(DataType::Number));
    }

    #[test]
    fn conflicting_types_become_one_of() {
        let schema = fold(&[json!("a"), json!(true), json!("b")]);
        let variants = schema.one_of.as_ref().unwrap();
        assert_eq!(variants.len(), 2);
        assert!(schema.accepts(&json!("z")));
        assert!(schema.accepts(&json!(false)));
        assert!(!schema.accepts(&json!(1)));
        assert_eq!(schema.primary_type(), DataType::Unknown);
    }

    #[test]
    fn remerging_is_a_no_op() {
        let v = json!({"user": {"email": "a@b.c", "tags": ["x", 1]}, "n": null});
        let once = merge(Schema::default(), &v);
        let twice = merge(once.clone(), &v);
        assert_eq!(once, twice);
    }

    #[test]
    fn merged_schema_accepts_each_input() {
        let inputs = [json!({"a": [1, 2]}), json!({"a": [], "b": {"c": null}}), json!({"b": {"c": "s"}})];
        let schema = fold(&inputs);
        for v in &inputs {
            assert!(schema.accepts(v), "schema should accept {v}");
        }
    }

    #[test]
    fn serializes_openapi_shape() {
        let schema = fold(&[json!({"id": 1})]);
        let out = serde_json::to_value(&schema).unwrap();
        assert_eq!(out, json!({"type": "object", "properties": {"id": {"type": "integer"}}}));
    }

    #[test]
    fn unknown_only_fills_empty_schemas() {
        let unknown = merge_unknown(Schema::default());
        assert_eq!(unknown.data_type, Some(DataType::Unknown));
        assert_eq!(merge(unknown, &json!({"a": 1})).data_type, Some(DataType::Object));

        let typed = fold(&[json!("x")]);
        assert_eq!(merge_unknown(typed.clone()), typed);
        assert!(parse_body("{not json").is_none());
    }

    #[test]
    fn non_json_text_is_a_string() {
        assert_eq!(parse_json_or_string("hello"), json!("hello"));
        assert_eq!(parse_json_or_string("42"), json!(42));
    }
}
