//! The State Store: persistence for actions, sessions, near-misses, and
//! webhook registrations.
//!
//! The `StateStore` trait is the seam between the Risk Decision Engine and
//! its backing storage; [`PgStateStore`] is grounded on the raw
//! `sqlx::query`/`.bind()` style of `repository.rs`, and [`MemoryStateStore`]
//! on `quota/enforcer.rs`'s `RwLock<HashMap<...>>` in-process storage idiom
//! (adapted to `tokio::sync::RwLock` since trait methods here are async and
//! must not hold a std lock across an await point).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gateway_common::{GatewayError, GatewayResult};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;

use crate::model::{Action, ApprovalState, NearMiss, NewAction, NewNearMiss, Session, Webhook};

/// Persistence seam for the Risk Decision Engine.
///
/// All methods are keyed by the caller-chosen opaque `session_id`; the store
/// does not enforce any relationship between sessions beyond that key.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch a session, creating one with the given default budget if absent.
    async fn get_or_create_session(&self, session_id: &str, default_budget: f64) -> GatewayResult<Session>;

    /// Add `risk_score` to a session's cumulative risk and bump its
    /// `last_activity`. Called only after a checkpoint is approved (or when
    /// no checkpoint was required at all).
    async fn add_to_session_cumulative(&self, session_id: &str, risk_score: f64) -> GatewayResult<Session>;

    /// Insert a newly scored action, returning the stored record with its
    /// assigned id.
    async fn insert_action(&self, new_action: NewAction) -> GatewayResult<Action>;

    /// Load a single action by id.
    async fn load_action(&self, action_id: i64) -> GatewayResult<Option<Action>>;

    /// Atomically set approval fields on an action, but only if it is still
    /// `Undecided`. Returns `Ok(None)` if the action doesn't exist and
    /// `Err(GatewayError::AlreadyDecided)` if it was already decided.
    async fn update_action_approval(
        &self,
        action_id: i64,
        approval: ApprovalState,
        channel: Option<String>,
        notes: Option<String>,
        decided_at: DateTime<Utc>,
    ) -> GatewayResult<Option<Action>>;

    /// Count prior actions on `(session_id, target)` created within
    /// `[since, now)`, used by compound-action detection. A `None` target
    /// always yields 0 (the caller already short-circuits on this, but the
    /// store honors it too).
    async fn count_actions(
        &self,
        session_id: &str,
        target: Option<&str>,
        since: DateTime<Utc>,
    ) -> GatewayResult<u64>;

    /// All near-misses recorded for this exact action name, most recent
    /// first, used by the near-miss decay multiplier.
    async fn list_near_misses(&self, action: &str) -> GatewayResult<Vec<NearMiss>>;

    /// Record a new near-miss.
    async fn insert_near_miss(&self, new_near_miss: NewNearMiss) -> GatewayResult<NearMiss>;

    /// Actions created in `[since, until)`, ordered by `created_at`, for
    /// audit export.
    async fn list_actions_in_range(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> GatewayResult<Vec<Action>>;

    /// Counts used by the `/stats` summary: (total, needs_checkpoint,
    /// approved, rejected, average risk score).
    async fn action_counts(&self) -> GatewayResult<ActionCounts>;

    /// Near-miss counts by type, zero-filled for every [`crate::model::NearMissType`]
    /// variant that has no recorded instance, matching the original's loop
    /// over the fixed type list.
    async fn near_miss_counts(&self) -> GatewayResult<std::collections::BTreeMap<String, u64>>;

    /// Register a webhook subscriber.
    async fn insert_webhook(&self, url: String, events: Vec<String>, secret: Option<String>) -> GatewayResult<Webhook>;

    /// All enabled webhooks.
    async fn list_webhooks(&self) -> GatewayResult<Vec<Webhook>>;

    /// Remove a webhook registration. `Ok(false)` if no webhook had that id.
    async fn delete_webhook(&self, webhook_id: i64) -> GatewayResult<bool>;

    /// Record a delivery outcome: resets `failure_count` to 0 on success, or
    /// increments it (auto-disabling past [`Webhook::MAX_FAILURES`]) on
    /// failure.
    async fn record_webhook_delivery(&self, webhook_id: i64, success: bool, at: DateTime<Utc>) -> GatewayResult<()>;
}

/// Aggregate counters backing the `/stats` endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionCounts {
    pub total: u64,
    pub needs_checkpoint: u64,
    pub approved: u64,
    pub rejected: u64,
    pub average_risk_score: f64,
}

impl ActionCounts {
    /// Matches `main.py`'s `get_stats`: approved / (approved + rejected),
    /// zero when nothing has been decided yet.
    pub fn approval_rate(&self) -> f64 {
        let decided = self.approved + self.rejected;
        if decided == 0 {
            0.0
        } else {
            self.approved as f64 / decided as f64
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// PostgreSQL implementation
// ─────────────────────────────────────────────────────────────────────────

pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_action(r: sqlx::postgres::PgRow) -> GatewayResult<Action> {
        let metadata: serde_json::Value = r.get("metadata");
        let metadata = serde_json::from_value(metadata).unwrap_or_default();
        let approval_str: &str = r.get("approval");
        let approval = match approval_str {
            "approved" => ApprovalState::Approved,
            "rejected" => ApprovalState::Rejected,
            _ => ApprovalState::Undecided,
        };
        Ok(Action {
            id: r.get("id"),
            session_id: r.get("session_id"),
            created_at: r.get("created_at"),
            action: r.get("action"),
            target: r.get("target"),
            metadata,
            impact: r.get("impact"),
            breadth: r.get("breadth"),
            probability: r.get("probability"),
            risk_score: r.get("risk_score"),
            needs_checkpoint: r.get("needs_checkpoint"),
            checkpoint_reason: r.get("checkpoint_reason"),
            is_compound: r.get("is_compound"),
            compound_count: r.get::<i32, _>("compound_count") as u32,
            approval,
            approval_timestamp: r.get("approval_timestamp"),
            approval_channel: r.get("approval_channel"),
            approval_notes: r.get("approval_notes"),
        })
    }

    fn row_to_near_miss(r: sqlx::postgres::PgRow) -> GatewayResult<NearMiss> {
        let metadata: serde_json::Value = r.get("metadata");
        let metadata = serde_json::from_value(metadata).unwrap_or_default();
        let type_str: &str = r.get("near_miss_type");
        let near_miss_type = crate::model::NearMissType::parse(type_str)
            .ok_or_else(|| GatewayError::Internal(format!("unknown near_miss_type in storage: {type_str}")))?;
        Ok(NearMiss {
            id: r.get("id"),
            session_id: r.get("session_id"),
            action: r.get("action"),
            target: r.get("target"),
            near_miss_type,
            description: r.get("description"),
            metadata,
            original_risk: r.get("original_risk"),
            actual_severity: r.get("actual_severity"),
            created_at: r.get("created_at"),
        })
    }

    fn row_to_webhook(r: sqlx::postgres::PgRow) -> Webhook {
        Webhook {
            id: r.get("id"),
            url: r.get("url"),
            events: r.get::<serde_json::Value, _>("events").as_array().map_or(Vec::new(), |a| {
                a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
            }),
            secret: r.get("secret"),
            enabled: r.get("enabled"),
            created_at: r.get("created_at"),
            last_triggered: r.get("last_triggered"),
            failure_count: r.get::<i32, _>("failure_count") as u32,
        }
    }
}

#[async_trait::async_trait]
impl StateStore for PgStateStore {
    async fn get_or_create_session(&self, session_id: &str, default_budget: f64) -> GatewayResult<Session> {
        let row = sqlx::query(
            r#"
            INSERT INTO sessions (session_id, risk_budget, cumulative_risk, created_at, last_activity)
            VALUES ($1, $2, 0.0, NOW(), NOW())
            ON CONFLICT (session_id) DO UPDATE SET session_id = EXCLUDED.session_id
            RETURNING session_id, risk_budget, cumulative_risk, created_at, last_activity
            "#,
        )
        .bind(session_id)
        .bind(default_budget)
        .fetch_one(&self.pool)
        .await?;

        Ok(Session {
            session_id: row.get("session_id"),
            risk_budget: row.get("risk_budget"),
            cumulative_risk: row.get("cumulative_risk"),
            created_at: row.get("created_at"),
            last_activity: row.get("last_activity"),
        })
    }

    async fn add_to_session_cumulative(&self, session_id: &str, risk_score: f64) -> GatewayResult<Session> {
        let row = sqlx::query(
            r#"
            UPDATE sessions
            SET cumulative_risk = cumulative_risk + $2, last_activity = NOW()
            WHERE session_id = $1
            RETURNING session_id, risk_budget, cumulative_risk, created_at, last_activity
            "#,
        )
        .bind(session_id)
        .bind(risk_score)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Session {
                session_id: r.get("session_id"),
                risk_budget: r.get("risk_budget"),
                cumulative_risk: r.get("cumulative_risk"),
                created_at: r.get("created_at"),
                last_activity: r.get("last_activity"),
            }),
            None => Err(GatewayError::NotFound(format!("session {session_id}"))),
        }
    }

    async fn insert_action(&self, new_action: NewAction) -> GatewayResult<Action> {
        let metadata = serde_json::to_value(&new_action.metadata)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO actions (
                session_id, created_at, action, target, metadata,
                impact, breadth, probability, risk_score,
                needs_checkpoint, checkpoint_reason, is_compound, compound_count,
                approval
            ) VALUES ($1, NOW(), $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'undecided')
            RETURNING id, session_id, created_at, action, target, metadata,
                      impact, breadth, probability, risk_score,
                      needs_checkpoint, checkpoint_reason, is_compound, compound_count,
                      approval, approval_timestamp, approval_channel, approval_notes
            "#,
        )
        .bind(&new_action.session_id)
        .bind(&new_action.action)
        .bind(&new_action.target)
        .bind(&metadata)
        .bind(new_action.impact)
        .bind(new_action.breadth)
        .bind(new_action.probability)
        .bind(new_action.risk_score)
        .bind(new_action.needs_checkpoint)
        .bind(&new_action.checkpoint_reason)
        .bind(new_action.is_compound)
        .bind(new_action.compound_count as i32)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_action(row)
    }

    async fn load_action(&self, action_id: i64) -> GatewayResult<Option<Action>> {
        let row = sqlx::query(
            r#"
            SELECT id, session_id, created_at, action, target, metadata,
                   impact, breadth, probability, risk_score,
                   needs_checkpoint, checkpoint_reason, is_compound, compound_count,
                   approval, approval_timestamp, approval_channel, approval_notes
            FROM actions WHERE id = $1
            "#,
        )
        .bind(action_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_action).transpose()
    }

    async fn update_action_approval(
        &self,
        action_id: i64,
        approval: ApprovalState,
        channel: Option<String>,
        notes: Option<String>,
        decided_at: DateTime<Utc>,
    ) -> GatewayResult<Option<Action>> {
        let approval_str = match approval {
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
            ApprovalState::Undecided => "undecided",
        };

        let row = sqlx::query(
            r#"
            UPDATE actions
            SET approval = $2, approval_timestamp = $3, approval_channel = $4, approval_notes = $5
            WHERE id = $1 AND approval = 'undecided'
            RETURNING id, session_id, created_at, action, target, metadata,
                      impact, breadth, probability, risk_score,
                      needs_checkpoint, checkpoint_reason, is_compound, compound_count,
                      approval, approval_timestamp, approval_channel, approval_notes
            "#,
        )
        .bind(action_id)
        .bind(approval_str)
        .bind(decided_at)
        .bind(&channel)
        .bind(&notes)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(Some(Self::row_to_action(row)?));
        }

        // Either the action doesn't exist, or it's already decided. Tell them apart.
        match self.load_action(action_id).await? {
            Some(_) => Err(GatewayError::AlreadyDecided(action_id)),
            None => Ok(None),
        }
    }

    async fn count_actions(&self, session_id: &str, target: Option<&str>, since: DateTime<Utc>) -> GatewayResult<u64> {
        let Some(target) = target else {
            return Ok(0);
        };

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM actions
            WHERE session_id = $1 AND target = $2 AND created_at >= $3
            "#,
        )
        .bind(session_id)
        .bind(target)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("count") as u64)
    }

    async fn list_near_misses(&self, action: &str) -> GatewayResult<Vec<NearMiss>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, action, target, near_miss_type, description, metadata,
                   original_risk, actual_severity, created_at
            FROM near_misses WHERE action = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(action)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_near_miss).collect()
    }

    async fn insert_near_miss(&self, new_near_miss: NewNearMiss) -> GatewayResult<NearMiss> {
        let metadata = serde_json::to_value(&new_near_miss.metadata)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO near_misses (
                session_id, action, target, near_miss_type, description, metadata,
                original_risk, actual_severity, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING id, session_id, action, target, near_miss_type, description, metadata,
                      original_risk, actual_severity, created_at
            "#,
        )
        .bind(&new_near_miss.session_id)
        .bind(&new_near_miss.action)
        .bind(&new_near_miss.target)
        .bind(new_near_miss.near_miss_type.as_str())
        .bind(&new_near_miss.description)
        .bind(&metadata)
        .bind(new_near_miss.original_risk)
        .bind(new_near_miss.actual_severity)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_near_miss(row)
    }

    async fn list_actions_in_range(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> GatewayResult<Vec<Action>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, created_at, action, target, metadata,
                   impact, breadth, probability, risk_score,
                   needs_checkpoint, checkpoint_reason, is_compound, compound_count,
                   approval, approval_timestamp, approval_channel, approval_notes
            FROM actions
            WHERE created_at >= $1 AND created_at < $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_action).collect()
    }

    async fn action_counts(&self) -> GatewayResult<ActionCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE needs_checkpoint) AS needs_checkpoint,
                COUNT(*) FILTER (WHERE approval = 'approved') AS approved,
                COUNT(*) FILTER (WHERE approval = 'rejected') AS rejected,
                COALESCE(AVG(risk_score), 0.0) AS average_risk_score
            FROM actions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ActionCounts {
            total: row.get::<i64, _>("total") as u64,
            needs_checkpoint: row.get::<i64, _>("needs_checkpoint") as u64,
            approved: row.get::<i64, _>("approved") as u64,
            rejected: row.get::<i64, _>("rejected") as u64,
            average_risk_score: row.get("average_risk_score"),
        })
    }

    async fn near_miss_counts(&self) -> GatewayResult<std::collections::BTreeMap<String, u64>> {
        let rows = sqlx::query("SELECT near_miss_type, COUNT(*) AS count FROM near_misses GROUP BY near_miss_type")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: std::collections::BTreeMap<String, u64> = crate::model::NearMissType::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), 0u64))
            .collect();
        for row in rows {
            let ty: String = row.get("near_miss_type");
            let count: i64 = row.get("count");
            counts.insert(ty, count as u64);
        }
        Ok(counts)
    }

    async fn insert_webhook(&self, url: String, events: Vec<String>, secret: Option<String>) -> GatewayResult<Webhook> {
        let events_json = serde_json::to_value(&events).map_err(|e| GatewayError::Internal(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO webhooks (url, events, secret, enabled, created_at, failure_count)
            VALUES ($1, $2, $3, true, NOW(), 0)
            RETURNING id, url, events, secret, enabled, created_at, last_triggered, failure_count
            "#,
        )
        .bind(&url)
        .bind(&events_json)
        .bind(&secret)
        .fetch_one(&self.pool)
        .await?;

        Ok(Self::row_to_webhook(row))
    }

    async fn list_webhooks(&self) -> GatewayResult<Vec<Webhook>> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, events, secret, enabled, created_at, last_triggered, failure_count
            FROM webhooks WHERE enabled = true
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Self::row_to_webhook).collect())
    }

    async fn delete_webhook(&self, webhook_id: i64) -> GatewayResult<bool> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = $1")
            .bind(webhook_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_webhook_delivery(&self, webhook_id: i64, success: bool, at: DateTime<Utc>) -> GatewayResult<()> {
        if success {
            sqlx::query(
                "UPDATE webhooks SET failure_count = 0, last_triggered = $2 WHERE id = $1",
            )
            .bind(webhook_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE webhooks
                SET failure_count = failure_count + 1,
                    last_triggered = $2,
                    enabled = (failure_count + 1 < $3)
                WHERE id = $1
                "#,
            )
            .bind(webhook_id)
            .bind(at)
            .bind(Webhook::MAX_FAILURES as i32)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ─────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, Session>,
    actions: HashMap<i64, Action>,
    next_action_id: i64,
    near_misses: HashMap<i64, NearMiss>,
    next_near_miss_id: i64,
    webhooks: HashMap<i64, Webhook>,
    next_webhook_id: i64,
}

/// In-process `StateStore`, suitable for tests and single-node deployments
/// without a database.
pub struct MemoryStateStore {
    state: RwLock<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn get_or_create_session(&self, session_id: &str, default_budget: f64) -> GatewayResult<Session> {
        let mut state = self.state.write().await;
        let session = state.sessions.entry(session_id.to_string()).or_insert_with(|| {
            let now = Utc::now();
            Session {
                session_id: session_id.to_string(),
                risk_budget: default_budget,
                cumulative_risk: 0.0,
                created_at: now,
                last_activity: now,
            }
        });
        Ok(session.clone())
    }

    async fn add_to_session_cumulative(&self, session_id: &str, risk_score: f64) -> GatewayResult<Session> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {session_id}")))?;
        session.cumulative_risk += risk_score;
        session.last_activity = Utc::now();
        Ok(session.clone())
    }

    async fn insert_action(&self, new_action: NewAction) -> GatewayResult<Action> {
        let mut state = self.state.write().await;
        state.next_action_id += 1;
        let id = state.next_action_id;

        let action = Action {
            id,
            session_id: new_action.session_id,
            created_at: Utc::now(),
            action: new_action.action,
            target: new_action.target,
            metadata: new_action.metadata,
            impact: new_action.impact,
            breadth: new_action.breadth,
            probability: new_action.probability,
            risk_score: new_action.risk_score,
            needs_checkpoint: new_action.needs_checkpoint,
            checkpoint_reason: new_action.checkpoint_reason,
            is_compound: new_action.is_compound,
            compound_count: new_action.compound_count,
            approval: ApprovalState::Undecided,
            approval_timestamp: None,
            approval_channel: None,
            approval_notes: None,
        };
        state.actions.insert(id, action.clone());
        Ok(action)
    }

    async fn load_action(&self, action_id: i64) -> GatewayResult<Option<Action>> {
        let state = self.state.read().await;
        Ok(state.actions.get(&action_id).cloned())
    }

    async fn update_action_approval(
        &self,
        action_id: i64,
        approval: ApprovalState,
        channel: Option<String>,
        notes: Option<String>,
        decided_at: DateTime<Utc>,
    ) -> GatewayResult<Option<Action>> {
        let mut state = self.state.write().await;
        let Some(action) = state.actions.get_mut(&action_id) else {
            return Ok(None);
        };
        if action.approval != ApprovalState::Undecided {
            return Err(GatewayError::AlreadyDecided(action_id));
        }
        action.approval = approval;
        action.approval_timestamp = Some(decided_at);
        action.approval_channel = channel;
        action.approval_notes = notes;
        Ok(Some(action.clone()))
    }

    async fn count_actions(&self, session_id: &str, target: Option<&str>, since: DateTime<Utc>) -> GatewayResult<u64> {
        let Some(target) = target else {
            return Ok(0);
        };
        let state = self.state.read().await;
        let count = state
            .actions
            .values()
            .filter(|a| a.session_id == session_id && a.target.as_deref() == Some(target) && a.created_at >= since)
            .count();
        Ok(count as u64)
    }

    async fn list_near_misses(&self, action: &str) -> GatewayResult<Vec<NearMiss>> {
        let state = self.state.read().await;
        let mut matches: Vec<NearMiss> = state
            .near_misses
            .values()
            .filter(|nm| nm.action == action)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches)
    }

    async fn insert_near_miss(&self, new_near_miss: NewNearMiss) -> GatewayResult<NearMiss> {
        let mut state = self.state.write().await;
        state.next_near_miss_id += 1;
        let id = state.next_near_miss_id;

        let near_miss = NearMiss {
            id,
            session_id: new_near_miss.session_id,
            action: new_near_miss.action,
            target: new_near_miss.target,
            near_miss_type: new_near_miss.near_miss_type,
            description: new_near_miss.description,
            metadata: new_near_miss.metadata,
            original_risk: new_near_miss.original_risk,
            actual_severity: new_near_miss.actual_severity,
            created_at: Utc::now(),
        };
        state.near_misses.insert(id, near_miss.clone());
        Ok(near_miss)
    }

    async fn list_actions_in_range(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> GatewayResult<Vec<Action>> {
        let state = self.state.read().await;
        let mut matches: Vec<Action> = state
            .actions
            .values()
            .filter(|a| a.created_at >= since && a.created_at < until)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches)
    }

    async fn action_counts(&self) -> GatewayResult<ActionCounts> {
        let state = self.state.read().await;
        let mut counts = ActionCounts::default();
        let mut risk_sum = 0.0;
        for action in state.actions.values() {
            counts.total += 1;
            risk_sum += action.risk_score;
            if action.needs_checkpoint {
                counts.needs_checkpoint += 1;
            }
            match action.approval {
                ApprovalState::Approved => counts.approved += 1,
                ApprovalState::Rejected => counts.rejected += 1,
                ApprovalState::Undecided => {}
            }
        }
        counts.average_risk_score = if counts.total > 0 {
            risk_sum / counts.total as f64
        } else {
            0.0
        };
        Ok(counts)
    }

    async fn near_miss_counts(&self) -> GatewayResult<std::collections::BTreeMap<String, u64>> {
        let state = self.state.read().await;
        let mut counts: std::collections::BTreeMap<String, u64> = crate::model::NearMissType::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), 0u64))
            .collect();
        for near_miss in state.near_misses.values() {
            *counts.entry(near_miss.near_miss_type.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn insert_webhook(&self, url: String, events: Vec<String>, secret: Option<String>) -> GatewayResult<Webhook> {
        let mut state = self.state.write().await;
        state.next_webhook_id += 1;
        let id = state.next_webhook_id;

        let webhook = Webhook {
            id,
            url,
            events,
            secret,
            enabled: true,
            created_at: Utc::now(),
            last_triggered: None,
            failure_count: 0,
        };
        state.webhooks.insert(id, webhook.clone());
        Ok(webhook)
    }

    async fn list_webhooks(&self) -> GatewayResult<Vec<Webhook>> {
        let state = self.state.read().await;
        Ok(state.webhooks.values().filter(|w| w.enabled).cloned().collect())
    }

    async fn delete_webhook(&self, webhook_id: i64) -> GatewayResult<bool> {
        let mut state = self.state.write().await;
        Ok(state.webhooks.remove(&webhook_id).is_some())
    }

    async fn record_webhook_delivery(&self, webhook_id: i64, success: bool, at: DateTime<Utc>) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        if let Some(webhook) = state.webhooks.get_mut(&webhook_id) {
            webhook.last_triggered = Some(at);
            if success {
                webhook.failure_count = 0;
            } else {
                webhook.failure_count += 1;
                if webhook.failure_count >= Webhook::MAX_FAILURES {
                    webhook.enabled = false;
                }
            }
        }
        Ok(())
    }
}

/// Shared-ownership handle most callers pass around.
pub type SharedStateStore = Arc<dyn StateStore>;
