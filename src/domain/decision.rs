use serde::{Deserialize, Serialize};
use std::fmt;

/// Risk decision outcome with severity ordering.
///
/// Decisions are ordered by severity from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Transaction approved
    Approve,
    /// Requires manual review
    Review,
    /// Transaction declined
    Decline,
}

impl Default for Decision {
    fn default() -> Self {
        Decision::Approve
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approve => write!(f, "APPROVE"),
            Decision::Review => write!(f, "REVIEW"),
            Decision::Decline => write!(f, "DECLINE"),
        }
    }
}
