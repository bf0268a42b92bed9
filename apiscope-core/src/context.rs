//! Explicit analysis context.
//!
//! Every store call takes a `Context` naming the Postgres schema that holds
//! the tenant's tables. Queued items carry their own context; anything else
//! falls back to the configured default schema.

use serde::{Deserialize, Serialize};

use crate::error::ApiscopeError;

/// Tenant/request context as it arrives on the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    schema: String,
}

impl Context {
    pub fn new(schema: impl Into<String>) -> Result<Self, ApiscopeError> {
        let schema = schema.into();
        if !is_identifier(&schema) {
            return Err(ApiscopeError::InvalidContext(format!(
                "'{}' is not a valid schema name",
                schema
            )));
        }
        Ok(Self { schema })
    }

    /// Resolve a queued item's context against the default schema.
    pub fn from_request(request: &RequestContext, default_schema: &str) -> Result<Self, ApiscopeError> {
        Self::new(request.schema.as_deref().unwrap_or(default_schema))
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Schema-qualified table name, safe to splice into SQL.
    pub fn table(&self, name: &str) -> String {
        format!("\"{}\".{}", self.schema, name)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
        }
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifies_tables() {
        let ctx = Context::new("tenant_42").unwrap();
        assert_eq!(ctx.table("endpoint"), "\"tenant_42\".endpoint");
    }

    #[test]
    fn rejects_injection() {
        assert!(Context::new("public\"; DROP TABLE endpoint; --").is_err());
        assert!(Context::new("").is_err());
        assert!(Context::new("9lives").is_err());
    }

    #[test]
    fn request_context_falls_back_to_default() {
        let ctx = Context::from_request(&RequestContext::default(), "public").unwrap();
        assert_eq!(ctx.schema(), "public");

        let ctx = Context::from_request(
            &RequestContext {
                schema: Some("acme".into()),
            },
            "public",
        )
        .unwrap();
        assert_eq!(ctx.schema(), "acme");
    }
}
