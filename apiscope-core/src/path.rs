//! Path inference: raw request path → endpoint template.
//!
//! - Segments the predicate flags become `{paramN}` (numbered from 1) in the
//!   template and `[^/]+` in the pattern; other segments are literal.
//! - Patterns are anchored and accept trailing slashes: `^/a/[^/]+(/)*$`.
//! - GraphQL paths are never tokenized.
//! - [`PatternCache`] keeps compiled patterns keyed by their text.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::policy::{HeuristicParamPredicate, ParamPredicate};

const PARAM_PATTERN: &str = "[^/]+";
const TRAILING_SLASHES: &str = "(/)*$";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathTemplate {
    /// Parameterized path, e.g. `/users/{param1}`.
    pub path: String,
    /// Anchored regular expression matching every path of this template.
    pub pattern: String,
    pub param_count: usize,
    pub is_graphql: bool,
}

/// Non-empty `/`-separated segments of `path`.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// `{param1}`-style template segment.
pub fn is_placeholder(segment: &str) -> bool {
    segment.len() > 2 && segment.starts_with('{') && segment.ends_with('}')
}

/// Leading slash, no repeated slashes. Empty stays empty.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

#[derive(Clone)]
pub struct PathInferrer {
    predicate: Arc<dyn ParamPredicate>,
    graphql_suffixes: Vec<String>,
}

impl PathInferrer {
    pub fn new(predicate: Arc<dyn ParamPredicate>, graphql_suffixes: Vec<String>) -> Self {
        Self {
            predicate,
            graphql_suffixes: graphql_suffixes
                .into_iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(
            Arc::new(HeuristicParamPredicate::new(config)),
            config.graphql_suffixes.clone(),
        )
    }

    pub fn predicate(&self) -> Arc<dyn ParamPredicate> {
        Arc::clone(&self.predicate)
    }

    pub fn is_graphql(&self, path: &str) -> bool {
        segments(path)
            .last()
            .map(|last| {
                let last = last.to_ascii_lowercase();
                self.graphql_suffixes.iter().any(|s| *s == last)
            })
            .unwrap_or(false)
    }

    /// `None` for an empty path.
    pub fn infer(&self, path: &str) -> Option<PathTemplate> {
        let path = normalize_path(path);
        if path.is_empty() {
            return None;
        }

        if self.is_graphql(&path) {
            let trimmed = path.trim_end_matches('/');
            return Some(PathTemplate {
                path: trimmed.to_string(),
                pattern: format!("^{}{}", regex::escape(trimmed), TRAILING_SLASHES),
                param_count: 0,
                is_graphql: true,
            });
        }

        let mut template = String::new();
        let mut pattern = String::from("^");
        let mut param_count = 0;
        for segment in segments(&path) {
            template.push('/');
            pattern.push('/');
            if self.predicate.is_parameter(segment) {
                param_count += 1;
                template.push_str(&format!("{{param{}}}", param_count));
                pattern.push_str(PARAM_PATTERN);
            } else {
                template.push_str(segment);
                pattern.push_str(&regex::escape(segment));
            }
        }
        if template.is_empty() {
            template.push('/');
            pattern.push('/');
        }
        pattern.push_str(TRAILING_SLASHES);

        Some(PathTemplate {
            path: template,
            pattern,
            param_count,
            is_graphql: false,
        })
    }
}

/// Compiled endpoint patterns keyed by pattern text.
pub struct PatternCache {
    cache: Cache<String, Arc<Regex>>,
}

impl PatternCache {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_idle(Duration::from_secs(3600))
            .build();
        Self { cache }
    }

    pub fn compile(&self, pattern: &str) -> Result<Arc<Regex>, regex::Error> {
        if let Some(re) = self.cache.get(pattern) {
            return Ok(re);
        }
        let re = Arc::new(Regex::new(pattern)?);
        self.cache.insert(pattern.to_string(), Arc::clone(&re));
        Ok(re)
    }

    /// An uncompilable pattern matches nothing.
    pub fn is_match(&self, pattern: &str, path: &str) -> bool {
        match self.compile(pattern) {
            Ok(re) => re.is_match(path),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "Invalid endpoint pattern");
                false
            }
        }
    }
}

impl Default for PatternCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}
