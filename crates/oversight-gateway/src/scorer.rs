//! The Scorer: a pure, deterministic, side-effect-free risk-factor
//! computation.
//!
//! Restated from `original_source/oversight_gateway/risk_engine.py`'s
//! `_calculate_impact`/`_calculate_breadth`/`_calculate_probability`, with
//! the hardcoded keyword-based impact floor replaced by the policy-driven
//! action rule match spec §4.1 calls for.

use crate::model::Metadata;
use crate::policy::{rule_metadata_boost, ActionRule, Policy};

/// The three risk components, each clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskFactors {
    pub impact: f64,
    pub breadth: f64,
    pub probability: f64,
}

impl RiskFactors {
    pub fn risk_score(&self) -> f64 {
        self.impact * self.breadth * self.probability
    }
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Compute (impact, breadth, probability) for an action. Never fails: out of
/// range or missing metadata degrades to "no boost applied", not an error.
pub fn score<'a>(
    action: &str,
    target: Option<&str>,
    metadata: &Metadata,
    policy: &'a Policy,
) -> (RiskFactors, Option<&'a ActionRule>) {
    let matched_rule = policy.matching_rule(action);
    let impact = calculate_impact(metadata, matched_rule);
    let breadth = calculate_breadth(target, metadata);
    let probability = calculate_probability(metadata);

    (
        RiskFactors {
            impact,
            breadth,
            probability,
        },
        matched_rule,
    )
}

fn calculate_impact(metadata: &Metadata, matched_rule: Option<&ActionRule>) -> f64 {
    let mut impact = 0.3;

    if let Some(rule) = matched_rule {
        impact = impact.max(rule.impact_floor);
        impact = clamp01(impact + rule_metadata_boost(rule, metadata));
    }

    if truthy(metadata, "contains_pii") {
        impact = clamp01(impact + 0.2);
    }
    if truthy(metadata, "financial") {
        impact = clamp01(impact + 0.3);
    }
    if truthy(metadata, "irreversible") {
        impact = clamp01(impact + 0.2);
    }
    if let Some(amount) = metadata.get("amount").and_then(|v| v.as_number()) {
        if amount > 1000.0 {
            impact = clamp01(impact + 0.2);
        }
        if amount > 10000.0 {
            impact = clamp01(impact + 0.3);
        }
    }

    clamp01(impact)
}

fn calculate_breadth(target: Option<&str>, metadata: &Metadata) -> f64 {
    let mut breadth = 0.3;

    if let Some(target) = target {
        let lower = target.to_lowercase();
        if ["all", "everyone", "public", "broadcast"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            breadth = 0.9;
        } else if ["group", "team", "list"].iter().any(|kw| lower.contains(kw)) {
            breadth = 0.6;
        }
    }

    if let Some(count) = metadata.get("recipients").and_then(|v| v.as_count()) {
        let from_count = if count > 100 {
            0.9
        } else if count > 10 {
            0.6
        } else if count > 1 {
            0.4
        } else {
            0.0
        };
        if from_count > breadth {
            breadth = from_count;
        }
    }

    match metadata.get("scope").and_then(|v| v.as_str()) {
        Some("global") => breadth = 1.0,
        // `.max` rather than overwrite: a target keyword already pushing
        // breadth past 0.8 (e.g. "all-staff") must not be lowered back down.
        Some("organization") => breadth = breadth.max(0.8),
        _ => {}
    }

    if truthy(metadata, "broadcast") || truthy(metadata, "public") {
        breadth = clamp01(breadth + 0.3);
    }

    clamp01(breadth)
}

fn calculate_probability(metadata: &Metadata) -> f64 {
    let mut probability = 0.3;

    if metadata
        .get("user_confirmed")
        .map(|v| v.is_literal_false())
        .unwrap_or(false)
    {
        probability = clamp01(probability + 0.3);
    }
    if truthy(metadata, "automated") {
        probability = clamp01(probability + 0.2);
    }
    if truthy(metadata, "time_sensitive") {
        probability = clamp01(probability + 0.1);
    }
    if truthy(metadata, "off_hours") {
        probability = clamp01(probability + 0.2);
    }

    clamp01(probability)
}

fn truthy(metadata: &Metadata, key: &str) -> bool {
    metadata.get(key).map(|v| v.is_truthy()).unwrap_or(false)
}
