//! Sensitive-data scanner seam.
//!
//! The engine only consumes `scan(value) → {class → evidence}`; the concrete
//! patterns come from the `[scanner]` config table.

use std::collections::BTreeMap;

use regex::Regex;

use crate::config::ScannerConfig;
use crate::error::ApiscopeError;
use crate::models::RiskScore;

/// Evidence samples kept per class per value.
const MAX_EVIDENCE: usize = 3;

pub trait Scanner: Send + Sync {
    /// Classes found in `value`, each with sample matched text.
    fn scan(&self, value: &str) -> BTreeMap<String, Vec<String>>;

    fn risk(&self, _class: &str) -> RiskScore {
        RiskScore::Medium
    }
}

/// Regex-per-class scanner. Class names are upper-cased.
#[derive(Debug, Clone, Default)]
pub struct PatternScanner {
    patterns: Vec<(String, Regex)>,
    risk: BTreeMap<String, RiskScore>,
}

impl PatternScanner {
    pub fn from_config(config: &ScannerConfig) -> Result<Self, ApiscopeError> {
        let mut patterns = Vec::with_capacity(config.patterns.len());
        for (class, pattern) in &config.patterns {
            let re = Regex::new(pattern).map_err(|e| {
                ApiscopeError::Other(format!("Invalid scanner pattern for {}: {}", class, e))
            })?;
            patterns.push((class.to_ascii_uppercase(), re));
        }

        let mut risk = BTreeMap::new();
        for (class, level) in &config.risk {
            let level = RiskScore::parse(level).ok_or_else(|| {
                ApiscopeError::Other(format!("Invalid risk level for {}: {}", class, level))
            })?;
            risk.insert(class.to_ascii_uppercase(), level);
        }

        Ok(Self { patterns, risk })
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|(c, _)| c.as_str())
    }
}

impl Scanner for PatternScanner {
    fn scan(&self, value: &str) -> BTreeMap<String, Vec<String>> {
        let mut found = BTreeMap::new();
        if value.is_empty() {
            return found;
        }
        for (class, re) in &self.patterns {
            let mut evidence: Vec<String> = Vec::new();
            for m in re.find_iter(value) {
                let sample = m.as_str().to_string();
                if !evidence.contains(&sample) {
                    evidence.push(sample);
                }
                if evidence.len() >= MAX_EVIDENCE {
                    break;
                }
            }
            if !evidence.is_empty() {
                found.insert(class.clone(), evidence);
            }
        }
        found
    }

    fn risk(&self, class: &str) -> RiskScore {
        self.risk
            .get(&class.to_ascii_uppercase())
            .copied()
            .unwrap_or(RiskScore::Medium)
    }
}
