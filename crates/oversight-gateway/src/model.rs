//! Data model: Action, Session, NearMiss, Webhook records.
//!
//! Mirrors the four tables the original `oversight_gateway/models.py` used
//! (`actions`, `near_misses`, `sessions`, plus a `webhooks` table the
//! original kept in-process). Field names follow that source; this module
//! only adds the metadata-value typing spec §9 calls for.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single entry of the opaque request metadata map.
///
/// The source treats metadata as an untyped blob and checks "truthiness" per
/// key. This spec gives that blob a closed shape so boost checks are
/// explicit: bool is truthy iff `true`, number iff nonzero, string iff
/// non-empty, list iff non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<String>),
}

impl MetadataValue {
    /// Whether this value counts as "present and truthy" for a boost check.
    pub fn is_truthy(&self) -> bool {
        match self {
            MetadataValue::Bool(b) => *b,
            MetadataValue::Number(n) => *n != 0.0,
            MetadataValue::String(s) => !s.is_empty(),
            MetadataValue::List(items) => !items.is_empty(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(n) => Some(*n),
            MetadataValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<usize> {
        match self {
            MetadataValue::List(items) => Some(items.len()),
            MetadataValue::Number(n) => Some(*n as usize),
            MetadataValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// `user_confirmed is false` must be the literal bool `false`, not merely
    /// absent — this distinguishes "confirmed=false" from "key not present".
    pub fn is_literal_false(&self) -> bool {
        matches!(self, MetadataValue::Bool(false))
    }
}

/// Opaque metadata attached to an action, near-miss, or evaluate request.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Tri-state approval outcome on an [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Undecided,
    Approved,
    Rejected,
}

/// One record per `evaluate` call.
///
/// Immutable except for its approval fields, which are written at most once
/// (enforced by [`crate::store::StateStore::update_action_approval`], not by
/// this type — the type itself has no invariant-checking setters because the
/// store is the only writer after insertion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: i64,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub action: String,
    pub target: Option<String>,
    pub metadata: Metadata,

    pub impact: f64,
    pub breadth: f64,
    pub probability: f64,
    pub risk_score: f64,

    pub needs_checkpoint: bool,
    pub checkpoint_reason: String,
    pub is_compound: bool,
    pub compound_count: u32,

    pub approval: ApprovalState,
    pub approval_timestamp: Option<DateTime<Utc>>,
    pub approval_channel: Option<String>,
    pub approval_notes: Option<String>,
}

/// A new action prepared for insertion, before the store assigns it an id.
#[derive(Debug, Clone)]
pub struct NewAction {
    pub session_id: String,
    pub action: String,
    pub target: Option<String>,
    pub metadata: Metadata,
    pub impact: f64,
    pub breadth: f64,
    pub probability: f64,
    pub risk_score: f64,
    pub needs_checkpoint: bool,
    pub checkpoint_reason: String,
    pub is_compound: bool,
    pub compound_count: u32,
}

/// Session record, keyed by the caller-chosen opaque session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub risk_budget: f64,
    pub cumulative_risk: f64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn remaining_budget(&self) -> f64 {
        self.risk_budget - self.cumulative_risk
    }

    pub fn utilization_percent(&self) -> f64 {
        if self.risk_budget > 0.0 {
            self.cumulative_risk / self.risk_budget * 100.0
        } else {
            0.0
        }
    }
}

/// Closed set of near-miss categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NearMissType {
    BoundaryViolation,
    ResourceOveruse,
    TimingAnomaly,
    PermissionEscalation,
    DataExposure,
    CascadeTrigger,
    PolicyDrift,
}

impl NearMissType {
    pub const ALL: [NearMissType; 7] = [
        NearMissType::BoundaryViolation,
        NearMissType::ResourceOveruse,
        NearMissType::TimingAnomaly,
        NearMissType::PermissionEscalation,
        NearMissType::DataExposure,
        NearMissType::CascadeTrigger,
        NearMissType::PolicyDrift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NearMissType::BoundaryViolation => "boundary_violation",
            NearMissType::ResourceOveruse => "resource_overuse",
            NearMissType::TimingAnomaly => "timing_anomaly",
            NearMissType::PermissionEscalation => "permission_escalation",
            NearMissType::DataExposure => "data_exposure",
            NearMissType::CascadeTrigger => "cascade_trigger",
            NearMissType::PolicyDrift => "policy_drift",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "boundary_violation" => NearMissType::BoundaryViolation,
            "resource_overuse" => NearMissType::ResourceOveruse,
            "timing_anomaly" => NearMissType::TimingAnomaly,
            "permission_escalation" => NearMissType::PermissionEscalation,
            "data_exposure" => NearMissType::DataExposure,
            "cascade_trigger" => NearMissType::CascadeTrigger,
            "policy_drift" => NearMissType::PolicyDrift,
            _ => return None,
        })
    }
}

/// Immutable post-hoc record of an action that caused unexpected harm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearMiss {
    pub id: i64,
    pub session_id: String,
    pub action: String,
    pub target: Option<String>,
    pub near_miss_type: NearMissType,
    pub description: Option<String>,
    pub metadata: Metadata,
    pub original_risk: Option<f64>,
    pub actual_severity: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNearMiss {
    pub session_id: String,
    pub action: String,
    pub target: Option<String>,
    pub near_miss_type: NearMissType,
    pub description: Option<String>,
    pub metadata: Metadata,
    pub original_risk: Option<f64>,
    pub actual_severity: f64,
}

/// A registered webhook subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub url: String,
    pub events: Vec<String>,
    pub secret: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_triggered: Option<DateTime<Utc>>,
    pub failure_count: u32,
}

impl Webhook {
    pub const MAX_FAILURES: u32 = 10;

    pub fn subscribes_to(&self, event: &str) -> bool {
        self.enabled && self.events.iter().any(|e| e == event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_truthiness_matches_per_type_rules() {
        assert!(MetadataValue::Bool(true).is_truthy());
        assert!(!MetadataValue::Bool(false).is_truthy());
        assert!(MetadataValue::Number(1.0).is_truthy());
        assert!(!MetadataValue::Number(0.0).is_truthy());
        assert!(MetadataValue::String("x".into()).is_truthy());
        assert!(!MetadataValue::String(String::new()).is_truthy());
        assert!(MetadataValue::List(vec!["a".into()]).is_truthy());
        assert!(!MetadataValue::List(Vec::new()).is_truthy());
    }

    #[test]
    fn literal_false_is_distinct_from_missing() {
        assert!(MetadataValue::Bool(false).is_literal_false());
        assert!(!MetadataValue::Bool(true).is_literal_false());
        assert!(!MetadataValue::String(String::new()).is_literal_false());
    }

    #[test]
    fn session_remaining_budget_and_utilization() {
        let session = Session {
            session_id: "s1".into(),
            risk_budget: 0.8,
            cumulative_risk: 0.4,
            created_at: Utc::now(),
            last_activity: Utc::now(),
        };
        assert!((session.remaining_budget() - 0.4).abs() < 1e-9);
        assert!((session.utilization_percent() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn near_miss_type_roundtrips_through_strings() {
        for ty in NearMissType::ALL {
            assert_eq!(NearMissType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(NearMissType::parse("not_a_type"), None);
    }

    #[test]
    fn webhook_subscribes_only_when_enabled_and_listed() {
        let mut webhook = Webhook {
            id: 1,
            url: "https://example.com/hook".into(),
            events: vec!["action_evaluated".into()],
            secret: None,
            enabled: true,
            created_at: Utc::now(),
            last_triggered: None,
            failure_count: 0,
        };
        assert!(webhook.subscribes_to("action_evaluated"));
        assert!(!webhook.subscribes_to("near_miss_recorded"));
        webhook.enabled = false;
        assert!(!webhook.subscribes_to("action_evaluated"));
    }
}
