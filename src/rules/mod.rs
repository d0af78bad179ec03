//! Weighted rule expressions: sources, the published store and the
//! per-thread evaluation engine.

pub mod context;
pub mod engine;
pub mod expression;
pub mod hot_reload;
pub mod source;
pub mod store;

pub use context::{DerivedFeatures, RuleContext};
pub use engine::{RuleEngine, RuleEvaluationMetrics, RuleResult};
pub use expression::ExpressionError;
pub use hot_reload::{CallbackError, ReloadCallback};
pub use source::{FileRuleSource, MemoryRuleSource, RuleError, RuleSource, SourceMarker};
pub use store::{load_rules, RuleStore};
