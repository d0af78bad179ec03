use parking_lot::Mutex;
use regex::Regex;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::patterns::parse::validate_pattern;
use crate::patterns::pattern::{Pattern, PatternMatch, PatternMatchResults};

use super::{CompileReport, PatternBackend, PatternError, ScanCounters};

struct CompiledPattern {
    pattern: Pattern,
    regex: Regex,
}

/// One regex per pattern, tried one at a time.
///
/// Works everywhere. All scans go through a single lock.
#[derive(Default)]
pub struct FallbackBackend {
    compiled: Mutex<Vec<CompiledPattern>>,
    counters: ScanCounters,
}

impl FallbackBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatternBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn compile(&mut self, patterns: &[Pattern]) -> Result<CompileReport, PatternError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        let mut skipped = 0;

        for pattern in patterns {
            let source = pattern.to_regex();
            if !validate_pattern(&pattern.pattern, false) {
                error!(pattern_id = pattern.id, "Empty pattern, skipping");
                skipped += 1;
                continue;
            }
            match Regex::new(&source) {
                Ok(regex) => {
                    debug!(pattern_id = pattern.id, name = %pattern.name, "Compiled pattern");
                    compiled.push(CompiledPattern {
                        pattern: pattern.clone(),
                        regex,
                    });
                }
                Err(e) => {
                    error!(
                        pattern_id = pattern.id,
                        error = %e,
                        "Pattern compilation failed, skipping"
                    );
                    skipped += 1;
                }
            }
        }

        let count = compiled.len();
        *self.compiled.get_mut() = compiled;

        info!(compiled = count, skipped, "Compiled patterns with fallback backend");

        Ok(CompileReport {
            backend: self.name(),
            compiled: count,
            skipped,
        })
    }

    fn match_one(&self, text: &str, category: Option<&str>) -> PatternMatchResults {
        let start = Instant::now();
        let mut results = PatternMatchResults {
            texts_processed: 1,
            ..Default::default()
        };

        {
            let compiled = self.compiled.lock();
            results.patterns_checked = compiled.len();

            for entry in compiled.iter() {
                if !entry.pattern.in_category(category) {
                    continue;
                }
                if let Some(m) = entry.regex.find(text) {
                    results.push(PatternMatch::new(&entry.pattern, text, m.start(), m.end()));
                }
            }
        }

        results.evaluation_time = start.elapsed();
        self.counters.record(results.evaluation_time);
        results
    }

    fn counters(&self) -> &ScanCounters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_matches() {
        let mut backend = FallbackBackend::new();
        let report = backend
            .compile(&[
                Pattern::exact(1, "192.168.1.1", "blacklist"),
                Pattern::wildcard(2, "MERCH_*", "blacklist"),
                Pattern::regex(3, "(unclosed", "blacklist"),
                Pattern::exact(4, "MERCH_TRUSTED", "whitelist"),
            ])
            .unwrap();

        assert_eq!(report.compiled, 3);
        assert_eq!(report.skipped, 1);

        let results = backend.match_one("MERCH_999", None);
        assert_eq!(results.total_matches(), 1);
        assert_eq!(results.matches[0].start, 0);
        assert_eq!(results.matches[0].end, 9);
        assert_eq!(results.patterns_checked, 3);

        let results = backend.match_one("MERCH_TRUSTED", Some("whitelist"));
        assert_eq!(results.total_matches(), 1);
        assert_eq!(results.whitelist_matches.len(), 1);

        assert_eq!(backend.counters().scans(), 2);
    }

    #[test]
    fn test_exact_is_literal_substring() {
        let mut backend = FallbackBackend::new();
        backend
            .compile(&[Pattern::exact(1, "1.1", "blacklist")])
            .unwrap();

        assert_eq!(backend.match_one("ip 10.1.1.2", None).total_matches(), 1);
        // The dot is not a wildcard
        assert_eq!(backend.match_one("1x1", None).total_matches(), 0);
    }
}
