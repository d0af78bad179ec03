//! Fusion of rule, pattern and model scores into one decision.

pub mod pipeline;

pub use pipeline::RiskPipeline;

use serde::Serialize;

use crate::domain::Transaction;
use crate::rules::RuleContext;

/// Weight of the mean rule-side score.
pub const RULE_WEIGHT: f64 = 0.6;

/// Weight of the mean model score.
pub const MODEL_WEIGHT: f64 = 0.4;

/// Rule-side scores above this produce a reason.
pub const RULE_REASON_THRESHOLD: f64 = 50.0;

/// A maximum model score above this produces a reason.
pub const MODEL_REASON_THRESHOLD: f64 = 70.0;

/// Number of feature slots handed to models.
pub const FEATURE_VECTOR_SIZE: usize = 64;

pub const NORMAL_RISK_REASON: &str = "Transaction within normal risk parameters";

/// Fixed-width numeric features for one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector(#[serde(with = "feature_slots")] pub [f64; FEATURE_VECTOR_SIZE]);

impl FeatureVector {
    /// Numeric context variables first, remaining slots zero.
    pub fn from_context(ctx: &RuleContext) -> Self {
        let mut slots = [0.0; FEATURE_VECTOR_SIZE];
        for (slot, value) in slots.iter_mut().zip(ctx.numeric_values()) {
            *slot = value;
        }
        FeatureVector(slots)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl Default for FeatureVector {
    fn default() -> Self {
        FeatureVector([0.0; FEATURE_VECTOR_SIZE])
    }
}

mod feature_slots {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        slots: &[f64; super::FEATURE_VECTOR_SIZE],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.collect_seq(slots.iter())
    }
}

fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

/// `clamp(mean(rule) * 0.6 + mean(model) * 0.4, 0, 100)`.
///
/// An empty collection contributes zero to its term; the other term keeps
/// its weight.
pub fn calculate_final_score(rule_scores: &[f64], model_scores: &[f64]) -> f64 {
    let score = mean(rule_scores) * RULE_WEIGHT + mean(model_scores) * MODEL_WEIGHT;
    score.clamp(0.0, 100.0)
}

/// Human-readable reasons in rule-score order.
pub fn generate_reasons(rule_scores: &[f64], model_scores: &[f64]) -> Vec<String> {
    let mut reasons: Vec<String> = rule_scores
        .iter()
        .enumerate()
        .filter(|(_, score)| **score > RULE_REASON_THRESHOLD)
        .map(|(i, score)| format!("Rule {} triggered (score: {})", i + 1, *score as i64))
        .collect();

    let max_model = model_scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max_model > MODEL_REASON_THRESHOLD {
        reasons.push(format!(
            "ML model indicates high risk (score: {})",
            max_model as i64
        ));
    }

    if reasons.is_empty() {
        reasons.push(NORMAL_RISK_REASON.to_string());
    }
    reasons
}

/// Everything collected about one transaction before fusion.
#[derive(Debug, Clone)]
pub struct DecisionContext<'a> {
    pub transaction: &'a Transaction,
    pub features: FeatureVector,
    pub rule_scores: Vec<f64>,
    pub model_scores: Vec<f64>,
}

impl<'a> DecisionContext<'a> {
    pub fn new(transaction: &'a Transaction, ctx: &RuleContext) -> Self {
        DecisionContext {
            transaction,
            features: FeatureVector::from_context(ctx),
            rule_scores: Vec::new(),
            model_scores: Vec::new(),
        }
    }

    pub fn add_rule_score(&mut self, score: f64) {
        self.rule_scores.push(score);
    }

    pub fn add_model_score(&mut self, score: f64) {
        self.model_scores.push(score);
    }

    pub fn calculate_final_score(&self) -> f64 {
        calculate_final_score(&self.rule_scores, &self.model_scores)
    }

    pub fn generate_reasons(&self) -> Vec<String> {
        generate_reasons(&self.rule_scores, &self.model_scores)
    }

    /// Whether there is anything to fuse.
    pub fn is_complete(&self) -> bool {
        !self.rule_scores.is_empty() || !self.model_scores.is_empty()
    }
}
