//! Real-time transaction risk scoring: weighted rule expressions with hot
//! reload, blacklist/whitelist pattern screening and score fusion.

pub mod config;
pub mod domain;
pub mod fusion;
pub mod observability;
pub mod patterns;
pub mod rules;

pub use config::Config;
pub use domain::{Decision, DecisionRecord, Transaction};
pub use fusion::{DecisionContext, RiskPipeline};
pub use patterns::{BackendKind, Pattern, PatternMatcher};
pub use rules::{RuleEngine, RuleStore};
