use aho_corasick::AhoCorasick;
use regex::{Regex, RegexSet};
use std::cell::RefCell;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::patterns::parse::validate_pattern;
use crate::patterns::pattern::{Pattern, PatternMatch, PatternMatchResults};

use super::{CompileReport, PatternBackend, PatternError, ScanCounters};

/// Reusable per-thread scan workspace.
struct Scratch {
    stamp: u64,
    /// Last stamp at which each pattern index was reported
    seen: Vec<u64>,
    hits: Vec<(usize, usize, usize)>,
}

thread_local! {
    static SCRATCH: RefCell<Scratch> = const {
        RefCell::new(Scratch {
            stamp: 0,
            seen: Vec::new(),
            hits: Vec::new(),
        })
    };
}

#[derive(Default)]
struct Database {
    patterns: Vec<Pattern>,
    literals: Option<AhoCorasick>,
    /// Automaton pattern id to database index
    literal_index: Vec<usize>,
    set: Option<RegexSet>,
    regexes: Vec<Regex>,
    /// Set member to database index
    regex_index: Vec<usize>,
}

/// Single-pass multi-pattern scanning.
///
/// Case-sensitive literals go into one Aho-Corasick automaton; everything
/// else into one `RegexSet`. Spans are only extracted for patterns the set
/// reports as matching.
#[derive(Default)]
pub struct AcceleratedBackend {
    db: Database,
    counters: ScanCounters,
}

impl AcceleratedBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatternBackend for AcceleratedBackend {
    fn name(&self) -> &'static str {
        "accelerated"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn compile(&mut self, patterns: &[Pattern]) -> Result<CompileReport, PatternError> {
        let mut db = Database::default();
        let mut literals: Vec<&str> = Vec::new();
        let mut sources: Vec<String> = Vec::new();
        let mut skipped = 0;

        for pattern in patterns {
            if !validate_pattern(&pattern.pattern, false) {
                error!(pattern_id = pattern.id, "Empty pattern, skipping");
                skipped += 1;
                continue;
            }

            let index = db.patterns.len();
            if pattern.is_plain_literal() {
                literals.push(&pattern.pattern);
                db.literal_index.push(index);
            } else {
                let source = pattern.to_regex();
                match Regex::new(&source) {
                    Ok(regex) => {
                        db.regexes.push(regex);
                        db.regex_index.push(index);
                        sources.push(source);
                    }
                    Err(e) => {
                        error!(
                            pattern_id = pattern.id,
                            error = %e,
                            "Pattern compilation failed, skipping"
                        );
                        skipped += 1;
                        continue;
                    }
                }
            }

            debug!(pattern_id = pattern.id, name = %pattern.name, "Compiled pattern");
            db.patterns.push(pattern.clone());
        }

        if !literals.is_empty() {
            let automaton = AhoCorasick::builder()
                .build(&literals)
                .map_err(|e| PatternError::Compile(format!("literal automaton: {e}")))?;
            db.literals = Some(automaton);
        }

        if !sources.is_empty() {
            let set = RegexSet::new(&sources)
                .map_err(|e| PatternError::Compile(format!("regex set: {e}")))?;
            db.set = Some(set);
        }

        let count = db.patterns.len();
        self.db = db;

        info!(
            compiled = count,
            literals = literals.len(),
            regexes = sources.len(),
            skipped,
            "Compiled patterns with accelerated backend"
        );

        Ok(CompileReport {
            backend: self.name(),
            compiled: count,
            skipped,
        })
    }

    fn match_one(&self, text: &str, category: Option<&str>) -> PatternMatchResults {
        let start = Instant::now();
        let db = &self.db;
        let mut results = PatternMatchResults {
            texts_processed: 1,
            patterns_checked: db.patterns.len(),
            ..Default::default()
        };

        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            let Scratch { stamp, seen, hits } = &mut *scratch;

            *stamp += 1;
            if seen.len() < db.patterns.len() {
                seen.resize(db.patterns.len(), 0);
            }
            hits.clear();

            if let Some(automaton) = &db.literals {
                for m in automaton.find_overlapping_iter(text) {
                    let index = db.literal_index[m.pattern().as_usize()];
                    // First report per pattern is its leftmost occurrence
                    if seen[index] == *stamp {
                        continue;
                    }
                    seen[index] = *stamp;
                    if db.patterns[index].in_category(category) {
                        hits.push((index, m.start(), m.end()));
                    }
                }
            }

            if let Some(set) = &db.set {
                for member in set.matches(text).iter() {
                    let index = db.regex_index[member];
                    if !db.patterns[index].in_category(category) {
                        continue;
                    }
                    if let Some(m) = db.regexes[member].find(text) {
                        hits.push((index, m.start(), m.end()));
                    }
                }
            }

            // Report in database order regardless of which engine matched
            hits.sort_unstable_by_key(|(index, _, _)| *index);
            for &(index, from, to) in hits.iter() {
                results.push(PatternMatch::new(&db.patterns[index], text, from, to));
            }
        });

        results.evaluation_time = start.elapsed();
        self.counters.record(results.evaluation_time);
        results
    }

    fn counters(&self) -> &ScanCounters {
        &self.counters
    }
}
