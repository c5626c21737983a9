//! The long-lived Engine: owns the Policy Store, State Store, and Event
//! Dispatcher, and exposes the five operations the transport layer calls.
//!
//! Restates `service.rs`'s `OversightService` struct/constructor/builder
//! shape around this spec's operations, per the re-architecture guidance to
//! model a long-lived Engine value owning its collaborators rather than
//! global mutable singletons. Policy hot-reload is an atomic pointer swap
//! (`RwLock<Arc<Policy>>`) rather than a global.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use gateway_common::{GatewayError, GatewayResult};
use tokio::sync::broadcast;
use tracing::instrument;

use crate::decision::decide;
use crate::dispatcher::{EventDispatcher, GatewayEvent};
use crate::history::adjust;
use crate::model::{Action, ApprovalState, Metadata, NearMiss, NewAction, NewNearMiss, Session};
use crate::policy::Policy;
use crate::scorer::score;
use crate::store::{ActionCounts, SharedStateStore};

/// Dashboard summary combining action counts with a near-miss breakdown by
/// type, as the `/stats` endpoint reports it.
#[derive(Debug, Clone)]
pub struct Stats {
    pub action_counts: ActionCounts,
    pub total_near_misses: u64,
    pub near_miss_breakdown: BTreeMap<String, u64>,
}

/// Result of one `evaluate` call.
#[derive(Debug, Clone)]
pub struct EvaluateOutcome {
    pub action: Action,
    /// `risk_budget - cumulative_risk` as observed at the *start* of this
    /// call; does not subtract the action just scored, even when it needs a
    /// checkpoint. Intentional — see the budget open question.
    pub remaining_budget: f64,
}

/// Owns Policy Store, State Store, and Event Dispatcher; the HTTP layer
/// holds one shared `Arc<Engine>`.
pub struct Engine {
    policy: RwLock<Arc<Policy>>,
    store: SharedStateStore,
    dispatcher: Arc<EventDispatcher>,
}

impl Engine {
    pub fn new(policy: Policy, store: SharedStateStore) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&store)));
        Self {
            policy: RwLock::new(Arc::new(policy)),
            store,
            dispatcher,
        }
    }

    fn current_policy(&self) -> Arc<Policy> {
        Arc::clone(&self.policy.read().expect("policy lock poisoned"))
    }

    /// Score an action, persist it, and fan out its events. See §4 control
    /// flow: Scorer → History Adjuster → Decision Maker → persist → dispatch.
    #[instrument(skip(self, metadata), fields(session_id, action))]
    pub async fn evaluate(
        &self,
        session_id: &str,
        action: &str,
        target: Option<&str>,
        metadata: Metadata,
    ) -> GatewayResult<EvaluateOutcome> {
        let policy = self.current_policy();
        let session = self
            .store
            .get_or_create_session(session_id, policy.risk_thresholds.session_budget)
            .await?;

        let (raw_factors, matched_rule) = score(action, target, &metadata, &policy);

        let since = Utc::now() - Duration::seconds(policy.compound_detection.time_window_seconds);
        let prior_count = self.store.count_actions(session_id, target, since).await?;
        let near_misses = self.store.list_near_misses(action).await?;

        let (adjusted, compound) = adjust(
            raw_factors,
            target,
            prior_count,
            &near_misses,
            Utc::now(),
            &policy.compound_detection,
            &policy.near_miss,
        );

        let risk_score = adjusted.risk_score();
        let decision = decide(
            risk_score,
            session.cumulative_risk,
            session.risk_budget,
            &policy.risk_thresholds,
            matched_rule,
            &compound,
        );

        let new_action = NewAction {
            session_id: session_id.to_string(),
            action: action.to_string(),
            target: target.map(str::to_string),
            metadata,
            impact: adjusted.impact,
            breadth: adjusted.breadth,
            probability: adjusted.probability,
            risk_score,
            needs_checkpoint: decision.needs_checkpoint,
            checkpoint_reason: decision.reason,
            is_compound: compound.is_compound,
            compound_count: compound.compound_count,
        };
        let action_record = self.store.insert_action(new_action).await?;

        let remaining_budget = session.risk_budget - session.cumulative_risk;

        let payload = serde_json::to_value(&action_record).unwrap_or_default();
        self.dispatcher.dispatch("action_evaluated", payload.clone()).await;
        if action_record.needs_checkpoint {
            self.dispatcher.dispatch("checkpoint_triggered", payload).await;
        }

        Ok(EvaluateOutcome {
            action: action_record,
            remaining_budget,
        })
    }

    /// Decide an action, writing approval fields exactly once and, on
    /// approval, committing its risk to the session budget. Errs with
    /// [`GatewayError::AlreadyDecided`] on a second call for the same id.
    #[instrument(skip(self, notes))]
    pub async fn approve(
        &self,
        action_id: i64,
        approved: bool,
        channel: Option<String>,
        notes: Option<String>,
    ) -> GatewayResult<Action> {
        let approval = if approved {
            ApprovalState::Approved
        } else {
            ApprovalState::Rejected
        };
        let decided_at = Utc::now();

        let updated = self
            .store
            .update_action_approval(action_id, approval, channel, notes, decided_at)
            .await?;
        let action = updated.ok_or_else(|| GatewayError::NotFound(format!("action {action_id}")))?;

        if approved {
            self.store
                .add_to_session_cumulative(&action.session_id, action.risk_score)
                .await?;
        }

        let event_name = if approved { "action_approved" } else { "action_rejected" };
        self.dispatcher
            .dispatch(event_name, serde_json::to_value(&action).unwrap_or_default())
            .await;

        Ok(action)
    }

    /// Persist a near-miss and fan out its event. Its effect on future
    /// scores is read lazily by the History Adjuster on the next evaluate
    /// for the same action name.
    #[instrument(skip(self, new_near_miss))]
    pub async fn record_near_miss(&self, new_near_miss: NewNearMiss) -> GatewayResult<NearMiss> {
        let near_miss = self.store.insert_near_miss(new_near_miss).await?;
        self.dispatcher
            .dispatch("near_miss_recorded", serde_json::to_value(&near_miss).unwrap_or_default())
            .await;
        Ok(near_miss)
    }

    /// Replace the process-wide policy pointer atomically. In-flight
    /// evaluations keep reading the `Arc` they captured at entry.
    pub fn reload_policy(&self, policy: Policy) -> GatewayResult<()> {
        let mut guard = self
            .policy
            .write()
            .map_err(|_| GatewayError::Internal("policy lock poisoned".to_string()))?;
        *guard = Arc::new(policy);
        Ok(())
    }

    pub async fn budget(&self, session_id: &str) -> GatewayResult<Session> {
        let policy = self.current_policy();
        self.store
            .get_or_create_session(session_id, policy.risk_thresholds.session_budget)
            .await
    }

    /// Dashboard summary: action counts, approval rate, and near-miss
    /// breakdown by type. Matches the original's `get_stats` shape.
    pub async fn stats(&self) -> GatewayResult<Stats> {
        let action_counts = self.store.action_counts().await?;
        let near_miss_breakdown = self.store.near_miss_counts().await?;
        let total_near_misses = near_miss_breakdown.values().sum();
        Ok(Stats {
            action_counts,
            total_near_misses,
            near_miss_breakdown,
        })
    }

    pub async fn audit_export(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> GatewayResult<Vec<Action>> {
        self.store.list_actions_in_range(since, until).await
    }

    pub async fn register_webhook(
        &self,
        url: String,
        events: Vec<String>,
        secret: Option<String>,
    ) -> GatewayResult<crate::model::Webhook> {
        self.store.insert_webhook(url, events, secret).await
    }

    pub async fn list_webhooks(&self) -> GatewayResult<Vec<crate::model::Webhook>> {
        self.store.list_webhooks().await
    }

    pub async fn delete_webhook(&self, webhook_id: i64) -> GatewayResult<bool> {
        self.store.delete_webhook(webhook_id).await
    }

    /// A fresh event stream for the `/ws/dashboard` handler.
    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.dispatcher.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NearMissType;
    use crate::store::MemoryStateStore;

    fn engine() -> Engine {
        Engine::new(Policy::default(), Arc::new(MemoryStateStore::new()))
    }

    #[tokio::test]
    async fn baseline_evaluate_matches_seed_scenario_one() {
        let engine = engine();
        let outcome = engine
            .evaluate("s1", "send_email", Some("user@example.com"), Metadata::new())
            .await
            .unwrap();
        assert!(!outcome.action.needs_checkpoint);
        assert!((outcome.action.risk_score - 0.027).abs() < 1e-6);
    }

    #[tokio::test]
    async fn three_successive_send_emails_to_same_target_compound() {
        let engine = engine();
        let mut last = None;
        for _ in 0..3 {
            last = Some(
                engine
                    .evaluate("s1", "send_email", Some("same@x"), Metadata::new())
                    .await
                    .unwrap(),
            );
        }
        let outcome = last.unwrap();
        assert!(outcome.action.is_compound);
        assert_eq!(outcome.action.compound_count, 3);
    }

    #[tokio::test]
    async fn near_miss_then_reevaluate_raises_probability() {
        let engine = engine();
        let before = engine
            .evaluate("s1", "delete_file", None, Metadata::new())
            .await
            .unwrap();

        engine
            .record_near_miss(NewNearMiss {
                session_id: "s1".into(),
                action: "delete_file".into(),
                target: None,
                near_miss_type: NearMissType::DataExposure,
                description: None,
                metadata: Default::default(),
                original_risk: None,
                actual_severity: 0.8,
            })
            .await
            .unwrap();

        let after = engine.evaluate("s1", "delete_file", None, Metadata::new()).await.unwrap();
        assert!(after.action.probability > before.action.probability);
    }

    #[tokio::test]
    async fn target_all_staff_sets_high_breadth_regardless_of_metadata() {
        let engine = engine();
        let outcome = engine
            .evaluate("s1", "broadcast_message", Some("all-staff"), Metadata::new())
            .await
            .unwrap();
        assert!((outcome.action.breadth - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn approving_unknown_action_id_returns_not_found_and_leaves_budget_unchanged() {
        let engine = engine();
        let session_before = engine.budget("s1").await.unwrap();
        let result = engine.approve(999, true, None, None).await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
        let session_after = engine.budget("s1").await.unwrap();
        assert_eq!(session_before.cumulative_risk, session_after.cumulative_risk);
    }

    #[tokio::test]
    async fn approving_twice_fails_and_does_not_double_charge() {
        let engine = engine();
        let outcome = engine.evaluate("s1", "send_email", None, Metadata::new()).await.unwrap();
        engine.approve(outcome.action.id, true, None, None).await.unwrap();
        let second = engine.approve(outcome.action.id, true, None, None).await;
        assert!(matches!(second, Err(GatewayError::AlreadyDecided(_))));

        let session = engine.budget("s1").await.unwrap();
        assert!((session.cumulative_risk - outcome.action.risk_score).abs() < 1e-9);
    }

    #[tokio::test]
    async fn approval_commits_risk_score_to_session_cumulative() {
        let engine = engine();
        let outcome = engine.evaluate("s1", "send_email", None, Metadata::new()).await.unwrap();
        let before = engine.budget("s1").await.unwrap();
        assert_eq!(before.cumulative_risk, 0.0);

        engine.approve(outcome.action.id, true, Some("slack".into()), None).await.unwrap();

        let after = engine.budget("s1").await.unwrap();
        assert!((after.cumulative_risk - outcome.action.risk_score).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejection_does_not_change_cumulative_risk() {
        let engine = engine();
        let outcome = engine.evaluate("s1", "send_email", None, Metadata::new()).await.unwrap();
        engine.approve(outcome.action.id, false, None, None).await.unwrap();
        let session = engine.budget("s1").await.unwrap();
        assert_eq!(session.cumulative_risk, 0.0);
    }

    #[tokio::test]
    async fn reload_policy_changes_subsequent_evaluations() {
        let engine = engine();
        let mut strict = Policy::default();
        strict.risk_thresholds.checkpoint_trigger = 0.0;
        engine.reload_policy(strict).unwrap();

        let outcome = engine.evaluate("s1", "send_email", None, Metadata::new()).await.unwrap();
        assert!(outcome.action.needs_checkpoint);
    }

    #[tokio::test]
    async fn stats_reports_decided_counts() {
        let engine = engine();
        let a = engine.evaluate("s1", "send_email", None, Metadata::new()).await.unwrap();
        engine.evaluate("s1", "delete_file", None, Metadata::new()).await.unwrap();
        engine.approve(a.action.id, true, None, None).await.unwrap();

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.action_counts.total, 2);
        assert_eq!(stats.action_counts.approved, 1);
        assert_eq!(stats.total_near_misses, 0);
        assert_eq!(stats.near_miss_breakdown.len(), 7);
    }

    #[tokio::test]
    async fn audit_export_respects_the_requested_range() {
        let engine = engine();
        engine.evaluate("s1", "send_email", None, Metadata::new()).await.unwrap();
        let since = Utc::now() - Duration::minutes(5);
        let until = Utc::now() + Duration::minutes(5);
        let entries = engine.audit_export(since, until).await.unwrap();
        assert_eq!(entries.len(), 1);

        let empty = engine
            .audit_export(since - Duration::days(2), since - Duration::days(1))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
