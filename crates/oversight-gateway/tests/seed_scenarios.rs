//! End-to-end checks of the six seed scenarios, run against the in-memory
//! State Store with the default policy. Each test name restates the
//! scenario it exercises rather than quoting it verbatim.

use std::collections::BTreeMap;
use std::sync::Arc;

use oversight_gateway::{Engine, MemoryStateStore, MetadataValue, NearMissType, NewNearMiss, Policy};

fn engine() -> Engine {
    Engine::new(Policy::default(), Arc::new(MemoryStateStore::new()))
}

fn meta(pairs: &[(&str, MetadataValue)]) -> BTreeMap<String, MetadataValue> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[tokio::test]
async fn plain_email_does_not_checkpoint_and_scores_baseline() {
    let engine = engine();
    let metadata = meta(&[("contains_pii", MetadataValue::Bool(false))]);
    let outcome = engine
        .evaluate("s1", "send_email", Some("user@example.com"), metadata)
        .await
        .unwrap();

    assert!(!outcome.action.needs_checkpoint);
    assert!((outcome.action.risk_score - 0.027).abs() < 1e-9);
}

#[tokio::test]
async fn payment_action_rule_forces_checkpoint_regardless_of_score() {
    let engine = engine();
    let metadata = meta(&[
        ("financial", MetadataValue::Bool(true)),
        ("amount", MetadataValue::Number(15000.0)),
        ("automated", MetadataValue::Bool(true)),
    ]);
    let outcome = engine
        .evaluate("s1", "process_payment", Some("customer@example.com"), metadata)
        .await
        .unwrap();

    // Default policy has no process_payment rule, so this evaluates on raw
    // factors alone: impact clamped to 0.9, breadth 0.3, probability 0.5.
    assert!((outcome.action.impact - 0.9).abs() < 1e-9);
    assert!((outcome.action.breadth - 0.3).abs() < 1e-9);
    assert!((outcome.action.probability - 0.5).abs() < 1e-9);
    assert!((outcome.action.risk_score - 0.135).abs() < 1e-9);

    // With the always_checkpoint rule loaded from the shipped policy file,
    // the same action checkpoints regardless of its score.
    let policy_source = include_str!("../../../policies/default.yaml");
    let policy_with_rule = Policy::from_yaml(policy_source).unwrap();
    let engine_with_policy = Engine::new(policy_with_rule, Arc::new(MemoryStateStore::new()));
    let metadata = meta(&[
        ("financial", MetadataValue::Bool(true)),
        ("amount", MetadataValue::Number(15000.0)),
        ("automated", MetadataValue::Bool(true)),
    ]);
    let outcome = engine_with_policy
        .evaluate("s1", "process_payment", Some("customer@example.com"), metadata)
        .await
        .unwrap();
    assert!(outcome.action.needs_checkpoint);
    assert!(outcome.action.checkpoint_reason.starts_with("Action rule:"));
}

#[tokio::test]
async fn three_successive_same_target_actions_are_compound() {
    let engine = engine();
    let target = Some("same@x");

    let first = engine
        .evaluate("s1", "send_email", target, BTreeMap::new())
        .await
        .unwrap();
    assert!(!first.action.is_compound);
    assert_eq!(first.action.compound_count, 1);

    let second = engine
        .evaluate("s1", "send_email", target, BTreeMap::new())
        .await
        .unwrap();
    assert!(second.action.is_compound);
    assert_eq!(second.action.compound_count, 2);

    let third = engine
        .evaluate("s1", "send_email", target, BTreeMap::new())
        .await
        .unwrap();
    assert!(third.action.is_compound);
    assert_eq!(third.action.compound_count, 3);
    assert!(third.action.breadth > second.action.breadth);
}

#[tokio::test]
async fn near_miss_raises_probability_on_next_evaluate_of_same_action() {
    let engine = engine();

    let before = engine
        .evaluate("s1", "delete_file", None, BTreeMap::new())
        .await
        .unwrap();

    engine
        .record_near_miss(NewNearMiss {
            session_id: "s1".to_string(),
            action: "delete_file".to_string(),
            target: None,
            near_miss_type: NearMissType::BoundaryViolation,
            description: Some("caught by reviewer".to_string()),
            metadata: BTreeMap::new(),
            original_risk: Some(before.action.risk_score),
            actual_severity: 0.8,
        })
        .await
        .unwrap();

    let after = engine
        .evaluate("s1", "delete_file", None, BTreeMap::new())
        .await
        .unwrap();

    assert!(after.action.probability > before.action.probability);
    // multiplier ~= 1 + 0.8*0.5*1 = 1.4, applied to base probability 0.3
    assert!((after.action.probability - 0.42).abs() < 1e-6);
}

#[tokio::test]
async fn broadcast_target_forces_high_breadth_regardless_of_metadata() {
    let engine = engine();
    let outcome = engine
        .evaluate("s1", "post_update", Some("all-staff"), BTreeMap::new())
        .await
        .unwrap();
    assert!((outcome.action.breadth - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn approving_unknown_action_is_not_found_and_leaves_budget_untouched() {
    let engine = engine();
    let before = engine.budget("s1").await.unwrap();

    let result = engine.approve(999_999, true, None, None).await;
    assert!(result.is_err());

    let after = engine.budget("s1").await.unwrap();
    assert_eq!(before.cumulative_risk, after.cumulative_risk);
}

#[tokio::test]
async fn approving_twice_never_double_charges_the_session() {
    let engine = engine();
    let outcome = engine
        .evaluate("s1", "process_payment", Some("customer@example.com"), BTreeMap::new())
        .await
        .unwrap();
    let action_id = outcome.action.id;

    engine.approve(action_id, true, None, None).await.unwrap();
    let budget_after_first = engine.budget("s1").await.unwrap();

    let second = engine.approve(action_id, true, None, None).await;
    assert!(second.is_err());

    let budget_after_second = engine.budget("s1").await.unwrap();
    assert_eq!(budget_after_first.cumulative_risk, budget_after_second.cumulative_risk);
}
