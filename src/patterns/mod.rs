//! Blacklist and whitelist screening of transaction text fields.

pub mod backend;
pub mod matcher;
pub mod parse;
pub mod pattern;

pub use backend::{select_backend, BackendKind, CompileReport, PatternBackend, PatternError};
pub use matcher::{MatcherStatistics, PatternMatcher};
pub use parse::{
    cidr_to_regex, extract_match_fields, parse_pattern_file, parse_patterns, validate_pattern,
    wildcard_to_regex,
};
pub use pattern::{Pattern, PatternKind, PatternMatch, PatternMatchResults};
