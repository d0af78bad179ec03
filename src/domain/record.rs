use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transaction::RequestId;
use super::Decision;

/// Outcome record produced for each scored transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Correlated transaction request ID
    pub request_id: RequestId,

    /// The decision outcome
    pub decision: Decision,

    /// Fused risk score in [0, 100]
    pub risk_score: f64,

    /// Human-readable reasons for the score
    pub reasons: Vec<String>,

    /// Identifiers of rules that triggered, in evaluation order
    #[serde(default)]
    pub triggered_rules: Vec<String>,

    #[serde(default)]
    pub blacklist_hits: usize,

    #[serde(default)]
    pub whitelist_hits: usize,

    /// End-to-end scoring latency
    pub latency_ms: f64,

    /// Version label of the model scores that were fused
    pub model_version: String,

    /// Rule configuration version used for this decision
    pub rules_version: String,

    /// When the decision was issued
    pub timestamp: DateTime<Utc>,
}
