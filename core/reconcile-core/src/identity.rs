//! Worker identification from process invocation text.
//!
//! A worker id is resolved by walking an ordered table of rules top to bottom;
//! the first rule that matches wins. Matching is case-insensitive. Adding a
//! worker means adding a row, either in code via [`default_rules`] or in the
//! `[[rules]]` table of `reconcile.toml`.
//!
//! No row stops the walk early. A launcher line with a side but no known
//! asset matches none of the directional rows and falls through to the rows
//! below them, so `python hummingbot --side long` resolves to `hummingbot`.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::types::is_valid_worker_id;

/// One row of the identity table as written in configuration.
///
/// All conditions present must hold: every `all` substring, at least one `any`
/// substring (when `any` is non-empty), and the `pattern` regex (when set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRule {
    pub worker_id: String,
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub any: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

impl IdentityRule {
    pub fn contains(worker_id: &str, needle: &str) -> Self {
        IdentityRule {
            worker_id: worker_id.to_string(),
            all: vec![needle.to_string()],
            any: Vec::new(),
            pattern: None,
        }
    }

    fn bot_v1(worker_id: &str, asset: &str, side: &str) -> Self {
        IdentityRule {
            worker_id: worker_id.to_string(),
            all: vec![asset.to_string(), side.to_string()],
            any: vec!["bot_v1".to_string(), "python".to_string()],
            pattern: None,
        }
    }
}

static DEFAULT_RULES: Lazy<Vec<IdentityRule>> = Lazy::new(|| {
    vec![
        IdentityRule::contains("mm_15m", "mm_optimized_15m"),
        IdentityRule::contains("mm_1h", "mm_optimized_1h"),
        IdentityRule::bot_v1("btc_long_v1", "btc", "long"),
        IdentityRule::bot_v1("btc_short_v1", "btc", "short"),
        IdentityRule::bot_v1("doge_long_v1", "doge", "long"),
        IdentityRule::bot_v1("doge_short_v1", "doge", "short"),
        IdentityRule::contains("hummingbot", "hummingbot"),
    ]
});

/// The built-in worker table used when configuration does not supply one.
pub fn default_rules() -> Vec<IdentityRule> {
    DEFAULT_RULES.clone()
}

#[derive(Debug, Clone)]
struct CompiledRule {
    worker_id: String,
    all: Vec<String>,
    any: Vec<String>,
    pattern: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, lowered: &str, original: &str) -> bool {
        self.all.iter().all(|needle| lowered.contains(needle.as_str()))
            && (self.any.is_empty() || self.any.iter().any(|needle| lowered.contains(needle.as_str())))
            && self.pattern.as_ref().map_or(true, |re| re.is_match(original))
    }
}

/// Compiled, ordered identity table.
#[derive(Debug, Clone)]
pub struct IdentityTable {
    rules: Vec<CompiledRule>,
}

impl IdentityTable {
    pub fn compile(rules: &[IdentityRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if !is_valid_worker_id(&rule.worker_id) {
                return Err(ReconcileError::InvalidRule {
                    worker_id: rule.worker_id.clone(),
                    details: "worker_id must be usable as a file stem".to_string(),
                });
            }
            if rule.all.is_empty() && rule.any.is_empty() && rule.pattern.is_none() {
                return Err(ReconcileError::InvalidRule {
                    worker_id: rule.worker_id.clone(),
                    details: "rule has no conditions and would match every process".to_string(),
                });
            }
            let pattern = match &rule.pattern {
                Some(pattern) => Some(
                    RegexBuilder::new(pattern)
                        .case_insensitive(true)
                        .build()
                        .map_err(|err| ReconcileError::InvalidRule {
                            worker_id: rule.worker_id.clone(),
                            details: err.to_string(),
                        })?,
                ),
                None => None,
            };
            compiled.push(CompiledRule {
                worker_id: rule.worker_id.clone(),
                all: rule.all.iter().map(|s| s.to_lowercase()).collect(),
                any: rule.any.iter().map(|s| s.to_lowercase()).collect(),
                pattern,
            });
        }
        Ok(IdentityTable { rules: compiled })
    }

    /// Returns the worker id of the first matching rule, if any.
    pub fn resolve(&self, invocation: &str) -> Option<&str> {
        let lowered = invocation.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered, invocation))
            .map(|rule| rule.worker_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
