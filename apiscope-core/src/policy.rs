//! Pluggable judgement calls used by path inference and endpoint matching.
//!
//! - [`ParamPredicate`] decides whether a path segment looks like an
//!   identifier (and so becomes `{paramN}` in a template).
//! - [`MatchBypass`] may reject a stored endpoint match so the trace gets
//!   its own, more specific endpoint.

use std::sync::Arc;

use crate::config::PolicyConfig;
use crate::models::Endpoint;
use crate::path::{is_placeholder, segments};

pub trait ParamPredicate: Send + Sync {
    fn is_parameter(&self, segment: &str) -> bool;
}

/// Flags numbers, UUIDs, long hex runs, long mixed letter/digit tokens and
/// email addresses.
#[derive(Debug, Clone)]
pub struct HeuristicParamPredicate {
    min_hex_id_len: usize,
    min_mixed_token_len: usize,
}

impl HeuristicParamPredicate {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            min_hex_id_len: config.min_hex_id_len,
            min_mixed_token_len: config.min_mixed_token_len,
        }
    }
}

impl Default for HeuristicParamPredicate {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}

impl ParamPredicate for HeuristicParamPredicate {
    fn is_parameter(&self, segment: &str) -> bool {
        if segment.is_empty() {
            return false;
        }
        if segment.bytes().all(|b| b.is_ascii_digit()) {
            return true;
        }
        if uuid::Uuid::try_parse(segment).is_ok() {
            return true;
        }
        let has_digit = segment.bytes().any(|b| b.is_ascii_digit());
        if has_digit
            && segment.len() >= self.min_hex_id_len
            && segment.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return true;
        }
        let has_alpha = segment.bytes().any(|b| b.is_ascii_alphabetic());
        if has_digit && has_alpha && segment.len() >= self.min_mixed_token_len {
            return true;
        }
        match segment.split_once('@') {
            Some((user, domain)) => !user.is_empty() && domain.contains('.'),
            None => false,
        }
    }
}

pub trait MatchBypass: Send + Sync {
    /// `true` to ignore `endpoint` as a match for `path`.
    fn bypass(&self, endpoint: &Endpoint, path: &str) -> bool;
}

/// Never rejects a match.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBypass;

impl MatchBypass for NoBypass {
    fn bypass(&self, _endpoint: &Endpoint, _path: &str) -> bool {
        false
    }
}

/// Rejects matches against endpoints whose linked spec was generated from
/// traffic when a templated position holds a segment the predicate would
/// not have flagged. Endpoints from uploaded specs are always trusted.
pub struct AutoGeneratedBypass {
    predicate: Arc<dyn ParamPredicate>,
}

impl AutoGeneratedBypass {
    pub fn new(predicate: Arc<dyn ParamPredicate>) -> Self {
        Self { predicate }
    }
}

impl MatchBypass for AutoGeneratedBypass {
    fn bypass(&self, endpoint: &Endpoint, path: &str) -> bool {
        if endpoint.spec_auto_generated != Some(true) || endpoint.is_graphql {
            return false;
        }
        let template = segments(&endpoint.path);
        let observed = segments(path);
        template
            .iter()
            .zip(observed.iter())
            .any(|(t, o)| is_placeholder(t) && !self.predicate.is_parameter(o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathTemplate;

    fn endpoint(path: &str, params: usize, auto: Option<bool>) -> Endpoint {
        let mut e = Endpoint::from_template(
            "h",
            "GET",
            &PathTemplate {
                path: path.to_string(),
                pattern: String::new(),
                param_count: params,
                is_graphql: false,
            },
        );
        e.openapi_spec_name = auto.map(|_| "h-generated".to_string());
        e.spec_auto_generated = auto;
        e
    }

    #[test]
    fn heuristic_flags_identifiers() {
        let p = HeuristicParamPredicate::default();
        assert!(p.is_parameter("1234"));
        assert!(p.is_parameter("3fa85f64-5717-4562-b3fc-2c963f66afa6"));
        assert!(p.is_parameter("deadbeef00112233"));
        assert!(p.is_parameter("a1b2c3d4e5f6g7h8i9j0k"));
        assert!(p.is_parameter("jane@example.com"));
    }

    #[test]
    fn heuristic_keeps_words() {
        let p = HeuristicParamPredicate::default();
        assert!(!p.is_parameter("users"));
        assert!(!p.is_parameter("v2"));
        assert!(!p.is_parameter("orders"));
        assert!(!p.is_parameter("cafe"));
        assert!(!p.is_parameter(""));
    }

    #[test]
    fn bypass_only_applies_to_generated_specs() {
        let bypass = AutoGeneratedBypass::new(Arc::new(HeuristicParamPredicate::default()));
        let generated = endpoint("/users/{param1}", 1, Some(true));
        let uploaded = endpoint("/users/{param1}", 1, Some(false));
        let unlinked = endpoint("/users/{param1}", 1, None);

        assert!(bypass.bypass(&generated, "/users/me"));
        assert!(!bypass.bypass(&generated, "/users/42"));
        assert!(!bypass.bypass(&uploaded, "/users/me"));
        assert!(!bypass.bypass(&unlinked, "/users/me"));
        assert!(!NoBypass.bypass(&generated, "/users/me"));
    }
}
