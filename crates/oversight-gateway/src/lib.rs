//! # oversight-gateway
//!
//! A risk-scoring gateway that sits in front of autonomous agent actions:
//! every action is scored against a hot-reloadable policy, budgeted against
//! a per-session risk allowance, and checkpointed for human approval when it
//! crosses a threshold. Near-misses feed back into future scoring so the
//! same mistake costs more the second time.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      oversight-gateway                        │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌───────────┐  │
//! │  │  Scorer  │→  │ History  │→  │ Decision │→  │   State    │  │
//! │  │          │   │ Adjuster │   │  Maker   │   │   Store    │  │
//! │  └──────────┘   └──────────┘   └──────────┘   └───────────┘  │
//! │                                      │                        │
//! │                              ┌───────────────┐                │
//! │                              │Event Dispatcher│                │
//! │                              └───────────────┘                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Engine`] wires these stages together and is the long-lived value the
//! HTTP layer holds; [`http::router`] exposes it over the routes in the
//! transport module's docs.

pub mod config;
pub mod decision;
pub mod dispatcher;
pub mod engine;
pub mod history;
pub mod http;
pub mod model;
pub mod policy;
pub mod scorer;
pub mod store;

pub use config::GatewayConfig;
pub use dispatcher::{EventDispatcher, GatewayEvent};
pub use engine::{Engine, EvaluateOutcome, Stats};
pub use model::{
    Action, ApprovalState, Metadata, MetadataValue, NearMiss, NearMissType, NewAction, NewNearMiss,
    Session, Webhook,
};
pub use policy::{ActionRule, Policy, RiskThresholds};
pub use store::{ActionCounts, MemoryStateStore, PgStateStore, SharedStateStore, StateStore};
