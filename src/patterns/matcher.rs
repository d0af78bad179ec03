use serde::Serialize;
use std::path::Path;
use tracing::{debug, error, info};

use crate::domain::Transaction;

use super::backend::{select_backend, BackendKind, CompileReport, PatternBackend, PatternError};
use super::parse::{extract_match_fields, parse_pattern_file};
use super::pattern::{Pattern, PatternMatchResults};

/// Snapshot of matcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatcherStatistics {
    pub total_patterns: usize,
    pub blacklist_patterns: usize,
    pub whitelist_patterns: usize,
    pub backend: &'static str,
    pub match_count: u64,
    pub avg_match_time_us: u64,
}

/// Screens transaction fields against blacklist and whitelist patterns.
///
/// Load or add patterns, then [`PatternMatcher::compile_patterns`], then
/// match. Compiling requires exclusive access; matching is shared and may
/// run from many threads at once.
pub struct PatternMatcher {
    backend: Box<dyn PatternBackend>,
    requested: BackendKind,
    patterns: Vec<Pattern>,
    next_id: u32,
    compiled: bool,
    last_error: Option<String>,
}

impl PatternMatcher {
    /// Create a matcher. The backend is chosen here and never changes.
    pub fn new(kind: BackendKind) -> Self {
        PatternMatcher {
            backend: select_backend(kind),
            requested: kind,
            patterns: Vec::new(),
            next_id: 1,
            compiled: false,
            last_error: None,
        }
    }

    /// Replace the pattern set with the contents of two pattern files.
    ///
    /// Ids run on from the blacklist into the whitelist so they stay unique.
    pub fn load_patterns(
        &mut self,
        blacklist: impl AsRef<Path>,
        whitelist: impl AsRef<Path>,
    ) -> Result<(), PatternError> {
        let blacklist = self.record(parse_pattern_file(blacklist, "blacklist", 1))?;
        let first_whitelist_id = blacklist.last().map_or(1, |p| p.id + 1);
        let whitelist =
            self.record(parse_pattern_file(whitelist, "whitelist", first_whitelist_id))?;

        info!(
            total = blacklist.len() + whitelist.len(),
            blacklist = blacklist.len(),
            whitelist = whitelist.len(),
            "Loaded patterns"
        );

        self.patterns = blacklist;
        self.patterns.extend(whitelist);
        self.next_id = self.patterns.last().map_or(1, |p| p.id + 1);
        self.compiled = false;
        Ok(())
    }

    /// Append one pattern. The matcher must be recompiled afterwards.
    pub fn add_pattern(&mut self, pattern: Pattern) {
        debug!(pattern_id = pattern.id, name = %pattern.name, "Added pattern");
        self.next_id = self.next_id.max(pattern.id.saturating_add(1));
        self.patterns.push(pattern);
        self.compiled = false;
    }

    /// Next unused pattern id.
    pub fn next_pattern_id(&self) -> u32 {
        self.next_id
    }

    /// Build the database from the current pattern set.
    pub fn compile_patterns(&mut self) -> Result<CompileReport, PatternError> {
        match self.backend.compile(&self.patterns) {
            Ok(report) => {
                self.compiled = true;
                self.last_error = None;
                info!(
                    backend = report.backend,
                    compiled = report.compiled,
                    skipped = report.skipped,
                    "Pattern compilation successful"
                );
                Ok(report)
            }
            Err(e) => {
                self.compiled = false;
                self.last_error = Some(e.to_string());
                error!(error = %e, "Pattern compilation failed");
                Err(e)
            }
        }
    }

    /// Screen the fixed transaction field set against every pattern.
    pub fn match_transaction(&self, tx: &Transaction) -> PatternMatchResults {
        if !self.compiled {
            error!("Pattern matcher not initialized");
            return PatternMatchResults::default();
        }

        let fields = extract_match_fields(tx);
        let mut aggregated = PatternMatchResults::default();

        for (_, value) in fields.iter().filter(|(_, value)| !value.is_empty()) {
            aggregated.merge(self.backend.match_one(value, None));
        }
        aggregated.texts_processed = fields.len();

        debug!(
            matches = aggregated.total_matches(),
            blacklist = aggregated.blacklist_matches.len(),
            whitelist = aggregated.whitelist_matches.len(),
            latency_us = aggregated.evaluation_time.as_micros() as u64,
            "Pattern matching complete"
        );

        aggregated
    }

    /// Match one text, optionally restricted to a category.
    pub fn match_text(&self, text: &str, category: Option<&str>) -> PatternMatchResults {
        if !self.compiled {
            error!("Pattern matcher not initialized");
            return PatternMatchResults::default();
        }
        self.backend.match_one(text, category)
    }

    /// Match several texts one after another and merge the results.
    pub fn match_batch(&self, texts: &[&str], category: Option<&str>) -> PatternMatchResults {
        if !self.compiled {
            error!("Pattern matcher not initialized");
            return PatternMatchResults::default();
        }
        self.backend.match_many(texts, category)
    }

    pub fn loaded_patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// Name of the backend actually in use.
    pub fn active_backend(&self) -> &'static str {
        self.backend.name()
    }

    pub fn requested_backend(&self) -> BackendKind {
        self.requested
    }

    pub fn statistics(&self) -> MatcherStatistics {
        let blacklist_patterns = self.patterns.iter().filter(|p| p.is_blacklist()).count();
        let whitelist_patterns = self.patterns.iter().filter(|p| p.is_whitelist()).count();
        let counters = self.backend.counters();

        MatcherStatistics {
            total_patterns: self.patterns.len(),
            blacklist_patterns,
            whitelist_patterns,
            backend: self.backend.name(),
            match_count: counters.scans(),
            avg_match_time_us: counters.avg_time_us(),
        }
    }

    pub fn reset_statistics(&self) {
        self.backend.counters().reset();
        info!("Pattern matcher statistics reset");
    }

    /// Whether the current pattern set has been compiled.
    pub fn is_initialized(&self) -> bool {
        self.compiled
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn record<T>(&mut self, result: Result<T, PatternError>) -> Result<T, PatternError> {
        if let Err(e) = &result {
            error!(error = %e, "Failed to load patterns");
            self.last_error = Some(e.to_string());
        }
        result
    }
}

impl std::fmt::Debug for PatternMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternMatcher")
            .field("backend", &self.backend.name())
            .field("patterns", &self.patterns.len())
            .field("compiled", &self.compiled)
            .finish()
    }
}
