//! Compiled pattern databases.

#[cfg(feature = "accelerated")]
pub mod accelerated;
pub mod fallback;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::pattern::{Pattern, PatternMatchResults};

#[cfg(feature = "accelerated")]
pub use accelerated::AcceleratedBackend;
pub use fallback::FallbackBackend;

/// Errors from pattern loading and compilation.
#[derive(Error, Debug)]
pub enum PatternError {
    #[error("failed to read pattern file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pattern compilation failed: {0}")]
    Compile(String),

    #[error("invalid CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("patterns not compiled")]
    NotCompiled,
}

/// Outcome of a successful compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompileReport {
    pub backend: &'static str,
    pub compiled: usize,
    /// Patterns dropped because they failed to compile
    pub skipped: usize,
}

/// Backend requested at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Auto,
    Accelerated,
    Fallback,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "accelerated" => Ok(BackendKind::Accelerated),
            "fallback" => Ok(BackendKind::Fallback),
            other => Err(format!("unknown pattern backend: {other}")),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Auto => "auto",
            BackendKind::Accelerated => "accelerated",
            BackendKind::Fallback => "fallback",
        };
        f.write_str(s)
    }
}

/// Scan counters shared by the backends.
#[derive(Debug, Default)]
pub struct ScanCounters {
    scans: AtomicU64,
    total_time_us: AtomicU64,
}

impl ScanCounters {
    #[inline]
    pub fn record(&self, elapsed: Duration) {
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.total_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    pub fn avg_time_us(&self) -> u64 {
        let scans = self.scans();
        if scans == 0 {
            return 0;
        }
        self.total_time_us.load(Ordering::Relaxed) / scans
    }

    pub fn reset(&self) {
        self.scans.store(0, Ordering::Relaxed);
        self.total_time_us.store(0, Ordering::Relaxed);
    }
}

/// A compiled pattern database plus the scan over it.
///
/// Compiling takes `&mut self` and scanning takes `&self`, so a database is
/// never rebuilt while it is being scanned.
pub trait PatternBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Replace the database with one built from `patterns`.
    ///
    /// Patterns that fail to compile are skipped and logged.
    fn compile(&mut self, patterns: &[Pattern]) -> Result<CompileReport, PatternError>;

    /// Scan one text, reporting at most one match per pattern.
    fn match_one(&self, text: &str, category: Option<&str>) -> PatternMatchResults;

    /// Scan several texts one after another and merge the results.
    fn match_many(&self, texts: &[&str], category: Option<&str>) -> PatternMatchResults {
        let mut aggregated = PatternMatchResults::default();
        for text in texts {
            aggregated.merge(self.match_one(text, category));
        }
        aggregated.texts_processed = texts.len();
        aggregated
    }

    fn counters(&self) -> &ScanCounters;
}

/// Pick the backend for a requested kind. Never fails.
pub fn select_backend(kind: BackendKind) -> Box<dyn PatternBackend> {
    match kind {
        BackendKind::Fallback => fallback(),
        BackendKind::Auto => accelerated().unwrap_or_else(fallback),
        BackendKind::Accelerated => accelerated().unwrap_or_else(|| {
            warn!("Accelerated pattern backend requested but not available, using fallback");
            fallback()
        }),
    }
}

fn fallback() -> Box<dyn PatternBackend> {
    info!("Selected fallback pattern backend");
    Box::new(FallbackBackend::new())
}

#[cfg(feature = "accelerated")]
fn accelerated() -> Option<Box<dyn PatternBackend>> {
    let backend = AcceleratedBackend::new();
    if backend.is_available() {
        info!("Selected accelerated pattern backend");
        Some(Box::new(backend))
    } else {
        None
    }
}

#[cfg(not(feature = "accelerated"))]
fn accelerated() -> Option<Box<dyn PatternBackend>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("AUTO".parse::<BackendKind>().unwrap(), BackendKind::Auto);
        assert_eq!(
            "fallback".parse::<BackendKind>().unwrap(),
            BackendKind::Fallback
        );
        assert!("hyperscan".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Accelerated.to_string(), "accelerated");
    }

    #[test]
    fn test_select_backend() {
        assert_eq!(select_backend(BackendKind::Fallback).name(), "fallback");

        let expected = if cfg!(feature = "accelerated") {
            "accelerated"
        } else {
            "fallback"
        };
        assert_eq!(select_backend(BackendKind::Auto).name(), expected);
        assert_eq!(select_backend(BackendKind::Accelerated).name(), expected);
    }

    #[test]
    fn test_scan_counters() {
        let counters = ScanCounters::default();
        counters.record(Duration::from_micros(10));
        counters.record(Duration::from_micros(30));

        assert_eq!(counters.scans(), 2);
        assert_eq!(counters.avg_time_us(), 20);

        counters.reset();
        assert_eq!(counters.scans(), 0);
        assert_eq!(counters.avg_time_us(), 0);
    }
}
