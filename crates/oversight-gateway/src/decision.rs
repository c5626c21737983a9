//! The Decision Maker: turns a risk score plus session/policy state into a
//! checkpoint decision and human-facing reason string.
//!
//! Evaluation order follows spec §4.3 exactly; restated from
//! `original_source/oversight_gateway/risk_engine.py`'s `if`/`elif` chain,
//! reordered so a matched action rule's `always_checkpoint` takes priority
//! (the source didn't have action rules at all — this is the spec's
//! addition).

use crate::history::CompoundResult;
use crate::policy::{ActionRule, RiskThresholds};

/// Checkpoint decision plus its stable, substring-matchable reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub needs_checkpoint: bool,
    pub reason: String,
}

pub fn decide(
    risk_score: f64,
    cumulative_risk: f64,
    session_budget: f64,
    thresholds: &RiskThresholds,
    matched_rule: Option<&ActionRule>,
    compound: &CompoundResult,
) -> Decision {
    let (needs_checkpoint, mut reason) = if matched_rule.map(|r| r.always_checkpoint).unwrap_or(false) {
        let rule = matched_rule.expect("checked above");
        (true, format!("Action rule: {}", rule.description))
    } else if risk_score > thresholds.checkpoint_trigger {
        (
            true,
            format!(
                "High risk score: {:.3} > {}",
                risk_score, thresholds.checkpoint_trigger
            ),
        )
    } else if cumulative_risk + risk_score > session_budget {
        (
            true,
            format!(
                "Would exceed session budget: {:.3} > {}",
                cumulative_risk + risk_score,
                session_budget
            ),
        )
    } else {
        (false, String::new())
    };

    if compound.is_compound {
        reason = if reason.is_empty() {
            format!("Compound action detected ({}x)", compound.compound_count)
        } else {
            format!("Compound action ({}x). {}", compound.compound_count, reason)
        };
    }

    Decision {
        needs_checkpoint,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::CompoundResult;
    use crate::policy::RiskThresholds;

    fn thresholds() -> RiskThresholds {
        RiskThresholds::default()
    }

    #[test]
    fn low_risk_no_checkpoint() {
        let decision = decide(0.027, 0.0, 0.8, &thresholds(), None, &CompoundResult::none());
        assert!(!decision.needs_checkpoint);
        assert_eq!(decision.reason, "");
    }

    #[test]
    fn risk_score_over_trigger_checkpoints_with_named_reason() {
        let decision = decide(0.7, 0.0, 0.8, &thresholds(), None, &CompoundResult::none());
        assert!(decision.needs_checkpoint);
        assert!(decision.reason.starts_with("High risk score:"));
    }

    #[test]
    fn projected_budget_overflow_checkpoints() {
        let decision = decide(0.2, 0.7, 0.8, &thresholds(), None, &CompoundResult::none());
        assert!(decision.needs_checkpoint);
        assert!(decision.reason.starts_with("Would exceed session budget:"));
    }

    #[test]
    fn zero_checkpoint_trigger_forces_checkpoint_on_every_action() {
        let strict = RiskThresholds {
            checkpoint_trigger: 0.0,
            session_budget: 0.8,
        };
        let decision = decide(0.001, 0.0, 0.8, &strict, None, &CompoundResult::none());
        assert!(decision.needs_checkpoint);
    }

    #[test]
    fn zero_session_budget_forces_checkpoint_as_soon_as_any_risk_accrues() {
        let zero_budget = RiskThresholds {
            checkpoint_trigger: 0.6,
            session_budget: 0.0,
        };
        let decision = decide(0.05, 0.0, zero_budget.session_budget, &zero_budget, None, &CompoundResult::none());
        assert!(decision.needs_checkpoint); // 0 + 0.05 > 0
    }

    #[test]
    fn always_checkpoint_rule_wins_even_under_threshold() {
        let rule = ActionRule::for_test("process_payment", 0.5, true, "Large payment requires review");
        let decision = decide(0.1, 0.0, 0.8, &thresholds(), Some(&rule), &CompoundResult::none());
        assert!(decision.needs_checkpoint);
        assert_eq!(decision.reason, "Action rule: Large payment requires review");
    }

    #[test]
    fn compound_prefix_is_prepended_to_existing_reason() {
        let compound = CompoundResult {
            is_compound: true,
            compound_count: 3,
        };
        let decision = decide(0.7, 0.0, 0.8, &thresholds(), None, &compound);
        assert!(decision.reason.starts_with("Compound action (3x). High risk score:"));
    }

    #[test]
    fn compound_alone_describes_itself_without_forcing_a_checkpoint() {
        // Compound detection only decorates the reason text; it does not
        // itself satisfy any of the four checkpoint rules.
        let compound = CompoundResult {
            is_compound: true,
            compound_count: 2,
        };
        let decision = decide(0.01, 0.0, 0.8, &thresholds(), None, &compound);
        assert!(!decision.needs_checkpoint);
        assert_eq!(decision.reason, "Compound action detected (2x)");
    }
}
