//! The History Adjuster: compound-action detection and near-miss-decay
//! multiplier, applied to the Scorer's raw factors before decisioning.
//!
//! Restated from `original_source/oversight_gateway/risk_engine.py`'s
//! `_detect_compound_action`/`_get_near_miss_multiplier`. The compound
//! predicate follows spec §9's resolution of the open question
//! (`n >= min_count - 1`, not the source's bare `recent_count > 0`).

use chrono::{DateTime, Utc};

use crate::model::NearMiss;
use crate::policy::{CompoundDetectionConfig, NearMissConfig};
use crate::scorer::RiskFactors;

/// Outcome of compound-action detection for one evaluate call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompoundResult {
    pub is_compound: bool,
    pub compound_count: u32,
}

impl CompoundResult {
    pub fn none() -> Self {
        Self {
            is_compound: false,
            compound_count: 1,
        }
    }
}

/// `prior_count` is the number of prior Actions on the same
/// `(session_id, target)` within the compound time window, as counted by
/// the State Store. A missing target always yields "not compound" (spec
/// invariant #7).
pub fn detect_compound(
    target: Option<&str>,
    prior_count: u64,
    config: &CompoundDetectionConfig,
) -> CompoundResult {
    if target.is_none() {
        return CompoundResult::none();
    }

    let min_count = config.min_count.max(1);
    if prior_count + 1 >= min_count as u64 {
        CompoundResult {
            is_compound: true,
            compound_count: (prior_count + 1) as u32,
        }
    } else {
        CompoundResult::none()
    }
}

/// Apply the compound boost to breadth: `breadth * (1 + same_resource_boost
/// * compound_count)`, clamped.
pub fn apply_compound_boost(breadth: f64, compound: &CompoundResult, config: &CompoundDetectionConfig) -> f64 {
    if !compound.is_compound {
        return breadth;
    }
    let boosted = breadth * (1.0 + config.same_resource_boost * compound.compound_count as f64);
    boosted.clamp(0.0, 1.0)
}

/// Near-miss multiplier from every NearMiss record whose action name equals
/// the current action (exact, case-sensitive), with half-life decay applied
/// to each one's contribution. `now` is passed in rather than read from the
/// system clock so the computation stays reproducible in tests.
pub fn near_miss_multiplier(near_misses: &[NearMiss], now: DateTime<Utc>, config: &NearMissConfig) -> f64 {
    let half_life_seconds = (config.half_life_hours * 3600.0).max(f64::EPSILON);

    let mut multiplier = 1.0;
    for near_miss in near_misses {
        if near_miss.actual_severity < config.min_severity {
            continue;
        }
        let age_seconds = (now - near_miss.created_at).num_milliseconds() as f64 / 1000.0;
        let age_seconds = age_seconds.max(0.0);
        let decay = 0.5f64.powf(age_seconds / half_life_seconds);
        multiplier += near_miss.actual_severity * 0.5 * decay;
    }

    multiplier.min(config.max_multiplier)
}

/// Apply the near-miss multiplier to probability, clamped to `[0, 1]`.
pub fn apply_near_miss_multiplier(probability: f64, multiplier: f64) -> f64 {
    (probability * multiplier).clamp(0.0, 1.0)
}

/// Folds both history effects into the Scorer's raw output, per the order
/// spec §4.2 specifies: near-miss multiplier on probability first, then
/// compound detection/boost on breadth.
pub fn adjust(
    raw: RiskFactors,
    target: Option<&str>,
    prior_compound_count: u64,
    near_misses: &[NearMiss],
    now: DateTime<Utc>,
    compound_config: &CompoundDetectionConfig,
    near_miss_config: &NearMissConfig,
) -> (RiskFactors, CompoundResult) {
    let multiplier = near_miss_multiplier(near_misses, now, near_miss_config);
    let probability = apply_near_miss_multiplier(raw.probability, multiplier);

    let compound = detect_compound(target, prior_compound_count, compound_config);
    let breadth = apply_compound_boost(raw.breadth, &compound, compound_config);

    (
        RiskFactors {
            impact: raw.impact,
            breadth,
            probability,
        },
        compound,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NearMissType;
    use chrono::Duration;

    fn near_miss(severity: f64, age: Duration, now: DateTime<Utc>) -> NearMiss {
        NearMiss {
            id: 1,
            session_id: "s1".into(),
            action: "delete_file".into(),
            target: None,
            near_miss_type: NearMissType::BoundaryViolation,
            description: None,
            metadata: Default::default(),
            original_risk: None,
            actual_severity: severity,
            created_at: now - age,
        }
    }

    #[test]
    fn no_target_is_never_compound() {
        let result = detect_compound(None, 99, &CompoundDetectionConfig::default());
        assert_eq!(result, CompoundResult::none());
    }

    #[test]
    fn compound_detection_uses_policy_min_count_threshold() {
        let config = CompoundDetectionConfig::default(); // min_count = 2
        assert_eq!(detect_compound(Some("t"), 0, &config), CompoundResult::none());
        let second = detect_compound(Some("t"), 1, &config);
        assert!(second.is_compound);
        assert_eq!(second.compound_count, 2);
        let third = detect_compound(Some("t"), 2, &config);
        assert!(third.is_compound);
        assert_eq!(third.compound_count, 3);
    }

    #[test]
    fn compound_boost_scales_breadth_by_count() {
        let config = CompoundDetectionConfig::default();
        let compound = CompoundResult {
            is_compound: true,
            compound_count: 3,
        };
        let boosted = apply_compound_boost(0.3, &compound, &config);
        // 0.3 * (1 + 0.2*3) = 0.3 * 1.6 = 0.48
        assert!((boosted - 0.48).abs() < 1e-9);
    }

    #[test]
    fn near_miss_below_min_severity_never_changes_multiplier() {
        let now = Utc::now();
        let config = NearMissConfig::default();
        let misses = vec![near_miss(0.05, Duration::zero(), now)];
        assert!((near_miss_multiplier(&misses, now, &config) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fresh_near_miss_matches_spec_seed_scenario() {
        let now = Utc::now();
        let config = NearMissConfig::default();
        let misses = vec![near_miss(0.8, Duration::zero(), now)];
        // multiplier ~= 1 + 0.8*0.5*1 = 1.4
        let multiplier = near_miss_multiplier(&misses, now, &config);
        assert!((multiplier - 1.4).abs() < 1e-6);
    }

    #[test]
    fn near_miss_multiplier_decays_and_is_capped() {
        let now = Utc::now();
        let config = NearMissConfig {
            half_life_hours: 24.0,
            max_multiplier: 1.2,
            min_severity: 0.1,
        };
        let misses = vec![
            near_miss(1.0, Duration::zero(), now),
            near_miss(1.0, Duration::zero(), now),
            near_miss(1.0, Duration::zero(), now),
        ];
        assert!((near_miss_multiplier(&misses, now, &config) - 1.2).abs() < 1e-9);
    }

    #[test]
    fn old_near_miss_decays_toward_no_effect() {
        let now = Utc::now();
        let config = NearMissConfig::default(); // 24h half-life
        let misses = vec![near_miss(0.8, Duration::hours(240), now)]; // 10 half-lives
        let multiplier = near_miss_multiplier(&misses, now, &config);
        assert!(multiplier < 1.01);
    }
}
