//! Declarative, hot-reloadable risk policy.
//!
//! Shape and defaults follow `PolicyConfig`/`ActionRule`/`CompoundDetection`/
//! `NearMissConfig`/`ApprovalConfig` in the original Python source's
//! `config.py`. The glob matcher is restated per the redesign guidance:
//! anchored at start, `*` matches any run of characters, case-insensitive,
//! other regex metacharacters escaped (the source's bare
//! `pattern.replace("*", ".*")` was unanchored and did not escape
//! metacharacters).

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::model::Metadata;

/// Risk thresholds that gate the Decision Maker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    #[serde(default = "default_checkpoint_trigger")]
    pub checkpoint_trigger: f64,
    #[serde(default = "default_session_budget")]
    pub session_budget: f64,
}

fn default_checkpoint_trigger() -> f64 {
    0.6
}

fn default_session_budget() -> f64 {
    0.8
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            checkpoint_trigger: default_checkpoint_trigger(),
            session_budget: default_session_budget(),
        }
    }
}

/// One action-name rule. The first rule (in file order) whose pattern
/// matches wins.
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionRule {
    pub pattern: String,
    pub impact_floor: f64,
    #[serde(default)]
    pub always_checkpoint: bool,
    #[serde(default)]
    pub metadata_boosts: std::collections::BTreeMap<String, f64>,
    #[serde(default)]
    pub description: String,

    /// Lazily compiled matcher, not (de)serialized.
    #[serde(skip)]
    matcher: OnceLock<GlobMatcher>,
}

// `OnceLock` does not implement `Clone`; cloning a rule starts with an
// uncompiled matcher, recompiled lazily on first match.
impl Clone for ActionRule {
    fn clone(&self) -> Self {
        Self {
            pattern: self.pattern.clone(),
            impact_floor: self.impact_floor,
            always_checkpoint: self.always_checkpoint,
            metadata_boosts: self.metadata_boosts.clone(),
            description: self.description.clone(),
            matcher: OnceLock::new(),
        }
    }
}

impl ActionRule {
    pub fn matches(&self, action: &str) -> bool {
        self.matcher
            .get_or_init(|| GlobMatcher::compile(&self.pattern))
            .matches(action)
    }

    /// Build a rule without going through YAML, for use by other modules'
    /// unit tests.
    #[cfg(test)]
    pub(crate) fn for_test(pattern: &str, impact_floor: f64, always_checkpoint: bool, description: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            impact_floor,
            always_checkpoint,
            metadata_boosts: Default::default(),
            description: description.to_string(),
            matcher: OnceLock::new(),
        }
    }
}

/// A compiled `*`-glob matcher: anchored at start, case-insensitive, other
/// regex metacharacters treated literally.
#[derive(Debug, Clone)]
struct GlobMatcher {
    /// Alternating literal segments split on `*`, lowercased. A trailing
    /// empty segment means the pattern ended in `*`.
    segments: Vec<String>,
}

impl GlobMatcher {
    fn compile(pattern: &str) -> Self {
        let lower = pattern.to_lowercase();
        let segments = lower.split('*').map(|s| s.to_string()).collect();
        Self { segments }
    }

    fn matches(&self, action: &str) -> bool {
        let haystack = action.to_lowercase();

        if self.segments.len() == 1 {
            // No wildcard: still a start-anchored prefix match, not full
            // equality — mirrors `re.match(pattern, action)` semantics.
            let only = &self.segments[0];
            return haystack.starts_with(only.as_str());
        }

        // Anchored at start: the first segment must be a literal prefix.
        let mut cursor = 0usize;
        let first = &self.segments[0];
        if !haystack[cursor..].starts_with(first.as_str()) {
            return false;
        }
        cursor += first.len();

        let last_index = self.segments.len() - 1;
        for (i, segment) in self.segments.iter().enumerate().skip(1) {
            if i == last_index {
                if segment.is_empty() {
                    // Pattern ends with '*': anything after is fine.
                    return true;
                }
                return haystack[cursor..].ends_with(segment.as_str());
            }
            match haystack[cursor..].find(segment.as_str()) {
                Some(pos) => cursor += pos + segment.len(),
                None => return false,
            }
        }
        true
    }
}

/// Compound-action detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundDetectionConfig {
    #[serde(default = "default_time_window_seconds")]
    pub time_window_seconds: i64,
    #[serde(default = "default_same_resource_boost")]
    pub same_resource_boost: f64,
    #[serde(default = "default_min_count")]
    pub min_count: u32,
}

fn default_time_window_seconds() -> i64 {
    300
}
fn default_same_resource_boost() -> f64 {
    0.2
}
fn default_min_count() -> u32 {
    2
}

impl Default for CompoundDetectionConfig {
    fn default() -> Self {
        Self {
            time_window_seconds: default_time_window_seconds(),
            same_resource_boost: default_same_resource_boost(),
            min_count: default_min_count(),
        }
    }
}

/// Near-miss learning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearMissConfig {
    #[serde(default = "default_half_life_hours")]
    pub half_life_hours: f64,
    #[serde(default = "default_max_multiplier")]
    pub max_multiplier: f64,
    #[serde(default = "default_min_severity")]
    pub min_severity: f64,
}

fn default_half_life_hours() -> f64 {
    24.0
}
fn default_max_multiplier() -> f64 {
    2.0
}
fn default_min_severity() -> f64 {
    0.1
}

impl Default for NearMissConfig {
    fn default() -> Self {
        Self {
            half_life_hours: default_half_life_hours(),
            max_multiplier: default_max_multiplier(),
            min_severity: default_min_severity(),
        }
    }
}

/// Advisory approval-workflow parameters (not enforced by the engine itself;
/// surfaced for transport/SDK layers).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub auto_approve_timeout: u64,
    #[serde(default)]
    pub require_notes: bool,
    #[serde(default = "default_max_pending")]
    pub max_pending_per_session: u32,
}

fn default_max_pending() -> u32 {
    10
}

/// Process-wide, atomically swappable risk policy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Policy {
    #[serde(default)]
    pub risk_thresholds: RiskThresholds,
    #[serde(default)]
    pub action_rules: Vec<ActionRule>,
    #[serde(default)]
    pub compound_detection: CompoundDetectionConfig,
    #[serde(default)]
    pub near_miss: NearMissConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
}

impl Policy {
    /// Parse a policy document (YAML).
    pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(source)
    }

    /// First action rule (in file order) whose pattern matches `action`.
    pub fn matching_rule(&self, action: &str) -> Option<&ActionRule> {
        self.action_rules.iter().find(|rule| rule.matches(action))
    }
}

/// Compute the additive metadata boosts for a matched action rule: for every
/// key in `rule.metadata_boosts` present and truthy in `metadata`, add the
/// configured boost.
pub fn rule_metadata_boost(rule: &ActionRule, metadata: &Metadata) -> f64 {
    rule.metadata_boosts
        .iter()
        .filter(|(key, _)| {
            metadata
                .get(key.as_str())
                .map(|v| v.is_truthy())
                .unwrap_or(false)
        })
        .map(|(_, boost)| *boost)
        .sum()
}
