use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

use crate::domain::RuleDocument;

/// Errors that can occur while loading or reloading rules.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Hot reload error: {0}")]
    HotReload(String),
}

/// Change marker reported by a [`RuleSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMarker {
    Modified(SystemTime),
    Revision(u64),
}

/// Where rule documents come from.
pub trait RuleSource: Send + Sync {
    /// Read and parse the current document.
    fn read(&self) -> Result<RuleDocument, RuleError>;

    /// Marker that changes whenever the underlying document changes.
    fn modification_marker(&self) -> Result<SourceMarker, RuleError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Parse a rule document from JSON text.
pub fn parse_json(content: &str) -> Result<RuleDocument, RuleError> {
    Ok(serde_json::from_str(content)?)
}

/// Parse a rule document from YAML text.
pub fn parse_yaml(content: &str) -> Result<RuleDocument, RuleError> {
    Ok(serde_yaml::from_str(content)?)
}

/// Rule document stored on disk as JSON, or YAML for `.yaml`/`.yml` files.
#[derive(Debug, Clone)]
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileRuleSource { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_yaml(&self) -> bool {
        matches!(
            self.path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        )
    }
}

impl RuleSource for FileRuleSource {
    fn read(&self) -> Result<RuleDocument, RuleError> {
        let content = fs::read_to_string(&self.path)?;
        if self.is_yaml() {
            parse_yaml(&content)
        } else {
            parse_json(&content)
        }
    }

    fn modification_marker(&self) -> Result<SourceMarker, RuleError> {
        let modified = fs::metadata(&self.path)?.modified()?;
        Ok(SourceMarker::Modified(modified))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory rule document, mainly for embedding and tests.
///
/// Every [`MemoryRuleSource::replace`] bumps the revision marker.
#[derive(Debug, Default)]
pub struct MemoryRuleSource {
    inner: Mutex<(RuleDocument, u64)>,
}

impl MemoryRuleSource {
    pub fn new(doc: RuleDocument) -> Self {
        MemoryRuleSource {
            inner: Mutex::new((doc, 1)),
        }
    }

    /// Replace the document, signalling a change to pollers.
    pub fn replace(&self, doc: RuleDocument) {
        let mut guard = self.inner.lock();
        guard.0 = doc;
        guard.1 += 1;
    }
}

impl RuleSource for MemoryRuleSource {
    fn read(&self) -> Result<RuleDocument, RuleError> {
        Ok(self.inner.lock().0.clone())
    }

    fn modification_marker(&self) -> Result<SourceMarker, RuleError> {
        Ok(SourceMarker::Revision(self.inner.lock().1))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl<S: RuleSource + ?Sized> RuleSource for std::sync::Arc<S> {
    fn read(&self) -> Result<RuleDocument, RuleError> {
        (**self).read()
    }

    fn modification_marker(&self) -> Result<SourceMarker, RuleError> {
        (**self).modification_marker()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_source_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
  "version": "2025-01-01.1",
  "thresholds": {{"approve_threshold": 25.0, "review_threshold": 75.0}},
  "rules": [
    {{"id": "R1", "name": "High amount", "expression": "amount > 1000", "weight": 20}}
  ]
}}"#
        )
        .unwrap();

        let source = FileRuleSource::new(file.path());
        let doc = source.read().unwrap();

        assert_eq!(doc.version.as_deref(), Some("2025-01-01.1"));
        assert_eq!(doc.rules.len(), 1);
        assert_eq!(doc.rules[0].weight, Some(20.0));
        assert!(matches!(
            source.modification_marker().unwrap(),
            SourceMarker::Modified(_)
        ));
    }

    #[test]
    fn test_file_source_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
version: "y1"
rules:
  - id: R1
    expression: "amount > 1000"
    weight: 15
"#
        )
        .unwrap();

        let doc = FileRuleSource::new(file.path()).read().unwrap();
        assert_eq!(doc.version.as_deref(), Some("y1"));
        assert_eq!(doc.rules[0].id.as_deref(), Some("R1"));
    }

    #[test]
    fn test_missing_rules_array_is_error() {
        let result = parse_json(r#"{"version": "1"}"#);
        assert!(matches!(result, Err(RuleError::Json(_))));
    }

    #[test]
    fn test_missing_file() {
        let source = FileRuleSource::new("/nonexistent/rules.json");
        assert!(matches!(source.read(), Err(RuleError::Io(_))));
        assert!(source.modification_marker().is_err());
    }

    #[test]
    fn test_memory_source_revision() {
        let source = MemoryRuleSource::new(RuleDocument::default());
        let before = source.modification_marker().unwrap();

        source.replace(RuleDocument::default());

        assert_ne!(source.modification_marker().unwrap(), before);
    }
}
