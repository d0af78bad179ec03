use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

use super::Decision;

/// Default score below which transactions are approved.
pub const DEFAULT_APPROVE_THRESHOLD: f64 = 30.0;

/// Default score at or above which transactions are declined.
pub const DEFAULT_REVIEW_THRESHOLD: f64 = 70.0;

/// Default version tag when the document does not carry one.
pub const DEFAULT_CONFIG_VERSION: &str = "1.0.0";

/// Source of configuration generations. Zero is reserved for the empty config.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Rule configuration document as produced by an external loader.
///
/// Every rule field is optional here; entries that lack an id or an
/// expression are dropped when the document is turned into a [`RuleConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub thresholds: Option<ThresholdsDocument>,

    pub rules: Vec<RuleEntry>,
}

/// Threshold section of a [`RuleDocument`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThresholdsDocument {
    #[serde(default)]
    pub approve_threshold: Option<f64>,
    #[serde(default)]
    pub review_threshold: Option<f64>,
}

/// One rule entry of a [`RuleDocument`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A weighted scoring expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule identifier
    pub id: String,
    pub name: String,
    /// Expression evaluated against the rule context
    pub expression: String,
    /// Score contribution when the rule triggers
    pub weight: f64,
    pub enabled: bool,
    pub description: String,
}

impl Rule {
    /// Create an enabled rule with the given weight.
    pub fn new(id: impl Into<String>, expression: impl Into<String>, weight: f64) -> Self {
        let id = id.into();
        Rule {
            name: id.clone(),
            id,
            expression: expression.into(),
            weight,
            enabled: true,
            description: String::new(),
        }
    }
}

/// Cumulative per-rule telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleStats {
    pub hit_count: u64,
    pub evaluation_count: u64,
    pub total_time: Duration,
}

impl RuleStats {
    /// Hit rate as a percentage (0-100).
    pub fn hit_rate(&self) -> f64 {
        if self.evaluation_count == 0 {
            return 0.0;
        }
        self.hit_count as f64 / self.evaluation_count as f64 * 100.0
    }

    /// Mean time per evaluation.
    pub fn avg_evaluation_time(&self) -> Duration {
        if self.evaluation_count == 0 {
            return Duration::ZERO;
        }
        self.total_time / self.evaluation_count as u32
    }
}

/// Score thresholds mapping a risk score to a [`Decision`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleThresholds {
    /// Scores below this are approved
    pub approve_threshold: f64,
    /// Scores at or above this are declined
    pub review_threshold: f64,
}

impl RuleThresholds {
    pub fn new(approve_threshold: f64, review_threshold: f64) -> Self {
        RuleThresholds {
            approve_threshold,
            review_threshold,
        }
    }

    /// Map a score to a decision.
    #[inline]
    pub fn make_decision(&self, score: f64) -> Decision {
        if score < self.approve_threshold {
            Decision::Approve
        } else if score >= self.review_threshold {
            Decision::Decline
        } else {
            Decision::Review
        }
    }
}

impl Default for RuleThresholds {
    fn default() -> Self {
        RuleThresholds::new(DEFAULT_APPROVE_THRESHOLD, DEFAULT_REVIEW_THRESHOLD)
    }
}

/// Versioned, immutable snapshot of the rule set.
#[derive(Debug, Clone)]
pub struct RuleConfig {
    pub version: String,
    /// Rules sorted by weight, heaviest first
    pub rules: Vec<Rule>,
    pub thresholds: RuleThresholds,
    pub loaded_at: DateTime<Utc>,
    /// Process-unique publish counter; compiled rule caches are keyed on it
    pub generation: u64,
}

impl RuleConfig {
    /// Create an empty configuration (generation 0).
    pub fn empty() -> Self {
        RuleConfig {
            version: "0.0.0".to_string(),
            rules: Vec::new(),
            thresholds: RuleThresholds::default(),
            loaded_at: Utc::now(),
            generation: 0,
        }
    }

    /// Build a configuration from explicit rules.
    ///
    /// Rules are stable-sorted descending by weight and a new generation
    /// is assigned.
    pub fn new(
        version: impl Into<String>,
        mut rules: Vec<Rule>,
        thresholds: RuleThresholds,
    ) -> Self {
        rules.sort_by(|a, b| b.weight.total_cmp(&a.weight));

        RuleConfig {
            version: version.into(),
            rules,
            thresholds,
            loaded_at: Utc::now(),
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Build a configuration from a loader document.
    ///
    /// Entries without id or expression are skipped with a warning, as are
    /// repeated ids. Fails only if the thresholds are inconsistent.
    pub fn from_document(doc: RuleDocument) -> Result<Self, String> {
        let thresholds = doc.thresholds.unwrap_or_default();
        let thresholds = RuleThresholds::new(
            thresholds
                .approve_threshold
                .unwrap_or(DEFAULT_APPROVE_THRESHOLD),
            thresholds
                .review_threshold
                .unwrap_or(DEFAULT_REVIEW_THRESHOLD),
        );

        if thresholds.approve_threshold > thresholds.review_threshold {
            return Err(format!(
                "approve_threshold {} exceeds review_threshold {}",
                thresholds.approve_threshold, thresholds.review_threshold
            ));
        }

        let mut seen_ids = HashSet::new();
        let mut rules = Vec::with_capacity(doc.rules.len());

        for (index, entry) in doc.rules.into_iter().enumerate() {
            let Some(id) = entry.id.filter(|id| !id.is_empty()) else {
                warn!(index, "Rule entry missing id, skipping");
                continue;
            };
            let Some(expression) = entry.expression.filter(|e| !e.trim().is_empty()) else {
                warn!(rule_id = %id, "Rule missing expression, skipping");
                continue;
            };
            if !seen_ids.insert(id.clone()) {
                warn!(rule_id = %id, "Duplicate rule id, keeping first definition");
                continue;
            }

            rules.push(Rule {
                name: entry.name.unwrap_or_else(|| id.clone()),
                id,
                expression,
                weight: entry.weight.unwrap_or(1.0),
                enabled: entry.enabled.unwrap_or(true),
                description: entry.description.unwrap_or_default(),
            });
        }

        let version = doc
            .version
            .unwrap_or_else(|| DEFAULT_CONFIG_VERSION.to_string());

        Ok(RuleConfig::new(version, rules, thresholds))
    }

    /// Enabled rules in evaluation order.
    pub fn enabled_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    /// Look up a rule by id.
    pub fn find_rule(&self, rule_id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_decision_boundaries() {
        let thresholds = RuleThresholds::default();

        assert_eq!(thresholds.make_decision(29.9), Decision::Approve);
        assert_eq!(thresholds.make_decision(30.0), Decision::Review);
        assert_eq!(thresholds.make_decision(69.9), Decision::Review);
        assert_eq!(thresholds.make_decision(70.0), Decision::Decline);
    }

    #[test]
    fn test_document_defaults() {
        let json = r#"{
            "rules": [
                {"id": "R1", "expression": "amount > 1000"},
                {"id": "R2", "expression": "amount > 5000", "weight": 40, "enabled": false}
            ]
        }"#;

        let doc: RuleDocument = serde_json::from_str(json).unwrap();
        let config = RuleConfig::from_document(doc).unwrap();

        assert_eq!(config.version, DEFAULT_CONFIG_VERSION);
        assert_eq!(config.thresholds, RuleThresholds::default());
        assert_eq!(config.rules.len(), 2);

        // Sorted heaviest first
        assert_eq!(config.rules[0].id, "R2");
        assert!(!config.rules[0].enabled);
        assert_eq!(config.rules[1].weight, 1.0);
        assert!(config.rules[1].enabled);
        assert_eq!(config.rules[1].name, "R1");
        assert_eq!(config.enabled_rules().count(), 1);
    }

    #[test]
    fn test_incomplete_entries_skipped() {
        let json = r#"{
            "version": "2025.1",
            "rules": [
                {"name": "no id", "expression": "1"},
                {"id": "NO_EXPR"},
                {"id": "OK", "expression": "amount > 1"},
                {"id": "OK", "expression": "amount > 2"}
            ]
        }"#;

        let doc: RuleDocument = serde_json::from_str(json).unwrap();
        let config = RuleConfig::from_document(doc).unwrap();

        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.find_rule("OK").unwrap().expression, "amount > 1");
        assert!(config.find_rule("NO_EXPR").is_none());
    }

    #[test]
    fn test_partial_thresholds() {
        let json = r#"{"thresholds": {"review_threshold": 80}, "rules": []}"#;
        let doc: RuleDocument = serde_json::from_str(json).unwrap();
        let config = RuleConfig::from_document(doc).unwrap();

        assert_eq!(config.thresholds.approve_threshold, 30.0);
        assert_eq!(config.thresholds.review_threshold, 80.0);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let json = r#"{
            "thresholds": {"approve_threshold": 90, "review_threshold": 10},
            "rules": []
        }"#;
        let doc: RuleDocument = serde_json::from_str(json).unwrap();
        assert!(RuleConfig::from_document(doc).is_err());
    }

    #[test]
    fn test_equal_weights_keep_document_order() {
        let rules = vec![
            Rule::new("A", "1", 10.0),
            Rule::new("B", "1", 20.0),
            Rule::new("C", "1", 10.0),
        ];
        let config = RuleConfig::new("v", rules, RuleThresholds::default());
        let ids: Vec<_> = config.rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A", "C"]);
    }

    #[test]
    fn test_generations_increase() {
        let a = RuleConfig::new("v", vec![], RuleThresholds::default());
        let b = RuleConfig::new("v", vec![], RuleThresholds::default());
        assert!(b.generation > a.generation);
        assert_eq!(RuleConfig::empty().generation, 0);
    }

    #[test]
    fn test_rule_stats() {
        let stats = RuleStats {
            hit_count: 1,
            evaluation_count: 4,
            total_time: Duration::from_micros(40),
        };
        assert_eq!(stats.hit_rate(), 25.0);
        assert_eq!(stats.avg_evaluation_time(), Duration::from_micros(10));
        assert_eq!(RuleStats::default().hit_rate(), 0.0);
    }
}
