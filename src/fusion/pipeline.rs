use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::domain::{DecisionRecord, Transaction, ValidationError};
use crate::observability::{MetricsRegistry, TimingGuard};
use crate::patterns::PatternMatcher;
use crate::rules::{DerivedFeatures, RuleContext, RuleEngine, RuleStore};

use super::DecisionContext;

/// End-to-end latency budget for one transaction.
pub const PIPELINE_BUDGET: Duration = Duration::from_millis(10);

/// Label used when no model scores are supplied.
pub const NO_MODEL_VERSION: &str = "none";

/// Scores transactions end to end on the calling thread.
///
/// Rules first, then pattern screening, then fusion with whatever model
/// scores the caller brings. The rule aggregate and the pattern score are
/// the two rule-side inputs to fusion, in that order.
pub struct RiskPipeline {
    engine: RuleEngine,
    matcher: Arc<PatternMatcher>,
    metrics: Arc<MetricsRegistry>,
    model_version: String,
}

impl RiskPipeline {
    pub fn new(
        store: Arc<RuleStore>,
        matcher: Arc<PatternMatcher>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        RiskPipeline {
            engine: RuleEngine::new(store),
            matcher,
            metrics,
            model_version: NO_MODEL_VERSION.to_string(),
        }
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    pub fn matcher(&self) -> &Arc<PatternMatcher> {
        &self.matcher
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Score with neutral derived features.
    pub fn score(
        &self,
        tx: &Transaction,
        model_scores: &[f64],
    ) -> Result<DecisionRecord, ValidationError> {
        let features = DerivedFeatures::neutral(tx.transaction.amount);
        self.score_with_features(tx, features, model_scores)
    }

    pub fn score_with_features(
        &self,
        tx: &Transaction,
        features: DerivedFeatures,
        model_scores: &[f64],
    ) -> Result<DecisionRecord, ValidationError> {
        tx.validate()?;

        let start = Instant::now();
        let _timing = TimingGuard::new(&self.metrics);

        let rule_ctx = RuleContext::with_features(tx, features);
        let rule_metrics = self.engine.evaluate_context(&rule_ctx);
        self.metrics.record_rule_pass(
            rule_metrics.rules_evaluated,
            rule_metrics.rules_triggered,
            rule_metrics.rules_failed,
        );

        let pattern_results = self.matcher.match_transaction(tx);
        self.metrics.record_pattern_scan(
            pattern_results.blacklist_matches.len(),
            pattern_results.whitelist_matches.len(),
        );

        let mut ctx = DecisionContext::new(tx, &rule_ctx);
        ctx.add_rule_score(rule_metrics.total_score);
        ctx.add_rule_score(pattern_results.match_score());
        for score in model_scores {
            ctx.add_model_score(*score);
        }

        let risk_score = ctx.calculate_final_score();
        let decision = self.engine.store().make_decision(risk_score);
        self.metrics.record_decision(decision);

        let latency = start.elapsed();
        if latency > PIPELINE_BUDGET {
            warn!(
                request_id = %tx.request_id,
                latency_us = latency.as_micros() as u64,
                "Scoring exceeded latency budget"
            );
        }

        debug!(
            request_id = %tx.request_id,
            risk_score,
            decision = %decision,
            latency_us = latency.as_micros() as u64,
            "Transaction scored"
        );

        Ok(DecisionRecord {
            request_id: tx.request_id.clone(),
            decision,
            risk_score,
            reasons: ctx.generate_reasons(),
            triggered_rules: rule_metrics
                .triggered_rules()
                .into_iter()
                .map(str::to_string)
                .collect(),
            blacklist_hits: pattern_results.blacklist_matches.len(),
            whitelist_hits: pattern_results.whitelist_matches.len(),
            latency_ms: latency.as_secs_f64() * 1000.0,
            model_version: self.model_version.clone(),
            rules_version: rule_metrics.rules_version,
            timestamp: Utc::now(),
        })
    }
}

impl std::fmt::Debug for RiskPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskPipeline")
            .field("engine", &self.engine)
            .field("matcher", &self.matcher)
            .field("model_version", &self.model_version)
            .finish()
    }
}
