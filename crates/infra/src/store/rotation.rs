//! Search rotation: the ordered list of brand searches that scheduled scrapes
//! cycle through.
//!
//! Exactly one entry carries the `last_searched` marker once the rotation has
//! advanced at least once. Advancing moves the marker to the next enabled entry
//! by id, wrapping around to the lowest enabled id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEntry {
    pub id: i64,
    pub brand: String,
    /// Search text sent to the scraper; the brand when absent.
    pub search_term: Option<String>,
    pub enabled: bool,
    pub last_searched: bool,
    pub last_searched_at: Option<DateTime<Utc>>,
}

impl RotationEntry {
    pub fn search(&self) -> RotationSearch {
        RotationSearch {
            brand: self.brand.clone(),
            search_term: self
                .search_term
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| self.brand.clone()),
        }
    }
}

/// A rotation entry to add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRotationEntry {
    pub brand: String,
    #[serde(default)]
    pub search_term: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// The brand and search text chosen by advancing the rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSearch {
    pub brand: String,
    pub search_term: String,
}

/// Index of the entry the rotation advances to, given entries sorted by id.
///
/// `None` when no entry is enabled.
pub(crate) fn next_index(entries: &[RotationEntry]) -> Option<usize> {
    let current = entries.iter().find(|e| e.last_searched).map(|e| e.id);
    let after_current = entries
        .iter()
        .position(|e| e.enabled && current.is_none_or(|c| e.id > c));
    after_current.or_else(|| entries.iter().position(|e| e.enabled))
}
