use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::parse::wildcard_to_regex;

/// Score added per blacklist hit.
pub const BLACKLIST_HIT_SCORE: f64 = 10.0;

/// Score removed per whitelist hit.
pub const WHITELIST_HIT_SCORE: f64 = 5.0;

/// Default pattern priority.
pub const DEFAULT_PRIORITY: u32 = 10;

/// How a pattern line was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Exact,
    Wildcard,
    Cidr,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Exact => "exact",
            PatternKind::Wildcard => "wildcard",
            PatternKind::Cidr => "cidr",
        }
    }
}

/// A screening pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: u32,
    pub name: String,
    /// Raw text, or the translated regex for CIDR patterns
    pub pattern: String,
    /// Free-form; "blacklist"/"whitelist" substrings drive classification
    pub category: String,
    pub is_regex: bool,
    pub case_sensitive: bool,
    pub priority: u32,
    pub kind: PatternKind,
}

impl Pattern {
    /// Literal substring pattern.
    pub fn exact(id: u32, text: impl Into<String>, category: impl Into<String>) -> Self {
        Self::build(id, text.into(), category.into(), PatternKind::Exact, false)
    }

    /// Anchored glob with `*` and `?`.
    pub fn wildcard(id: u32, text: impl Into<String>, category: impl Into<String>) -> Self {
        Self::build(id, text.into(), category.into(), PatternKind::Wildcard, false)
    }

    /// Regular expression used verbatim.
    pub fn regex(id: u32, regex: impl Into<String>, category: impl Into<String>) -> Self {
        Self::build(id, regex.into(), category.into(), PatternKind::Exact, true)
    }

    pub(crate) fn build(
        id: u32,
        pattern: String,
        category: String,
        kind: PatternKind,
        is_regex: bool,
    ) -> Self {
        Pattern {
            name: format!("{}_{}_{}", category, kind.as_str(), id),
            id,
            pattern,
            category,
            is_regex,
            case_sensitive: true,
            priority: DEFAULT_PRIORITY,
            kind,
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_blacklist(&self) -> bool {
        self.category.contains("blacklist")
    }

    pub fn is_whitelist(&self) -> bool {
        !self.is_blacklist() && self.category.contains("whitelist")
    }

    /// Whether the pattern is a plain case-sensitive literal.
    pub fn is_plain_literal(&self) -> bool {
        !self.is_regex && self.kind != PatternKind::Wildcard && self.case_sensitive
    }

    /// Regex source this pattern compiles to.
    pub fn to_regex(&self) -> String {
        let body = if self.is_regex {
            self.pattern.clone()
        } else {
            match self.kind {
                PatternKind::Wildcard => wildcard_to_regex(&self.pattern),
                PatternKind::Exact | PatternKind::Cidr => regex::escape(&self.pattern),
            }
        };

        if self.case_sensitive {
            body
        } else {
            format!("(?i){body}")
        }
    }

    /// Whether the category filter admits this pattern.
    #[inline]
    pub fn in_category(&self, filter: Option<&str>) -> bool {
        filter.map_or(true, |category| self.category == category)
    }
}

/// One pattern hit within one text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern_id: u32,
    pub pattern_name: String,
    pub matched_text: String,
    /// Byte offsets into the scanned text
    pub start: usize,
    pub end: usize,
    pub category: String,
}

impl PatternMatch {
    pub(crate) fn new(pattern: &Pattern, text: &str, start: usize, end: usize) -> Self {
        PatternMatch {
            pattern_id: pattern.id,
            pattern_name: pattern.name.clone(),
            matched_text: text[start..end].to_string(),
            start,
            end,
            category: pattern.category.clone(),
        }
    }

    pub fn is_blacklist(&self) -> bool {
        self.category.contains("blacklist")
    }

    pub fn is_whitelist(&self) -> bool {
        !self.is_blacklist() && self.category.contains("whitelist")
    }
}

/// Matches found in one or more texts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatternMatchResults {
    pub matches: Vec<PatternMatch>,
    pub blacklist_matches: Vec<PatternMatch>,
    pub whitelist_matches: Vec<PatternMatch>,
    pub evaluation_time: Duration,
    pub patterns_checked: usize,
    pub texts_processed: usize,
}

impl PatternMatchResults {
    /// Record a match, partitioning it by category.
    pub fn push(&mut self, m: PatternMatch) {
        if m.is_blacklist() {
            self.blacklist_matches.push(m.clone());
        } else if m.is_whitelist() {
            self.whitelist_matches.push(m.clone());
        }
        self.matches.push(m);
    }

    /// Fold another result set into this one, summing times.
    pub fn merge(&mut self, other: PatternMatchResults) {
        self.matches.extend(other.matches);
        self.blacklist_matches.extend(other.blacklist_matches);
        self.whitelist_matches.extend(other.whitelist_matches);
        self.evaluation_time += other.evaluation_time;
        self.patterns_checked = other.patterns_checked;
        self.texts_processed += other.texts_processed;
    }

    pub fn total_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn has_blacklist_match(&self) -> bool {
        !self.blacklist_matches.is_empty()
    }

    pub fn has_whitelist_match(&self) -> bool {
        !self.whitelist_matches.is_empty()
    }

    /// 10 per blacklist hit minus 5 per whitelist hit, never negative.
    pub fn match_score(&self) -> f64 {
        let score = BLACKLIST_HIT_SCORE * self.blacklist_matches.len() as f64
            - WHITELIST_HIT_SCORE * self.whitelist_matches.len() as f64;
        score.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(category: &str) -> PatternMatch {
        PatternMatch {
            pattern_id: 1,
            pattern_name: "p".to_string(),
            matched_text: "x".to_string(),
            start: 0,
            end: 1,
            category: category.to_string(),
        }
    }

    #[test]
    fn test_partition_by_category_substring() {
        let mut results = PatternMatchResults::default();
        results.push(hit("ip_blacklist"));
        results.push(hit("merchant_whitelist"));
        results.push(hit("watchlist"));

        assert_eq!(results.total_matches(), 3);
        assert_eq!(results.blacklist_matches.len(), 1);
        assert_eq!(results.whitelist_matches.len(), 1);
        assert!(results.has_blacklist_match());
        assert!(results.has_whitelist_match());
    }

    #[test]
    fn test_match_score() {
        let mut results = PatternMatchResults::default();
        results.push(hit("blacklist"));
        assert_eq!(results.match_score(), 10.0);

        results.push(hit("whitelist"));
        assert_eq!(results.match_score(), 5.0);

        results.push(hit("whitelist"));
        results.push(hit("whitelist"));
        assert_eq!(results.match_score(), 0.0);
    }

    #[test]
    fn test_merge() {
        let mut total = PatternMatchResults::default();
        let mut part = PatternMatchResults {
            texts_processed: 1,
            patterns_checked: 7,
            evaluation_time: Duration::from_micros(3),
            ..Default::default()
        };
        part.push(hit("blacklist"));

        total.merge(part.clone());
        total.merge(part);

        assert_eq!(total.matches.len(), 2);
        assert_eq!(total.blacklist_matches.len(), 2);
        assert_eq!(total.texts_processed, 2);
        assert_eq!(total.patterns_checked, 7);
        assert_eq!(total.evaluation_time, Duration::from_micros(6));
    }

    #[test]
    fn test_to_regex() {
        assert_eq!(Pattern::exact(1, "a.b", "blacklist").to_regex(), r"a\.b");
        assert_eq!(Pattern::wildcard(2, "M*", "blacklist").to_regex(), "^M.*$");
        assert_eq!(
            Pattern::regex(3, "^x+$", "blacklist")
                .case_insensitive()
                .to_regex(),
            "(?i)^x+$"
        );
        assert_eq!(Pattern::exact(4, "tor", "ip_blacklist").name, "ip_blacklist_exact_4");
    }

    #[test]
    fn test_builder_defaults() {
        let pattern = Pattern::exact(5, "fp_bad", "blacklist");
        assert_eq!(pattern.priority, DEFAULT_PRIORITY);
        assert!(pattern.case_sensitive);
        assert!(pattern.is_plain_literal());

        let pattern = pattern.case_insensitive().with_priority(1);
        assert_eq!(pattern.priority, 1);
        assert!(!pattern.is_plain_literal());
    }
}
