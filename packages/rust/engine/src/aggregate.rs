//! Deterministic merge of per-item outcomes.
//!
//! Everything here is a pure function of the outcome set: the same outcomes
//! in any order give the same result.

use newsdigest_shared::Outcome;

/// Joins successful outputs in the merged text.
pub const SEPARATOR: &str = "\n\n";

/// Result of merging a run's outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merge {
    /// At least one item produced non-blank output.
    Produced {
        text: String,
        succeeded: usize,
        total: usize,
    },
    /// The run finished but nothing usable came out of it.
    NothingProduced { total: usize },
}

impl Merge {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Produced { text, .. } => Some(text.as_str()),
            Self::NothingProduced { .. } => None,
        }
    }

    pub fn succeeded(&self) -> usize {
        match self {
            Self::Produced { succeeded, .. } => *succeeded,
            Self::NothingProduced { .. } => 0,
        }
    }

    pub fn total(&self) -> usize {
        match self {
            Self::Produced { total, .. } | Self::NothingProduced { total } => *total,
        }
    }
}

/// References to `outcomes` sorted by index.
fn sorted(outcomes: &[Outcome]) -> Vec<&Outcome> {
    let mut sorted: Vec<&Outcome> = outcomes.iter().collect();
    sorted.sort_by_key(|o| o.index);
    sorted
}

/// Sort by index, drop failures, join outputs with [`SEPARATOR`].
pub fn merge(outcomes: &[Outcome]) -> Merge {
    let total = outcomes.len();
    let successes: Vec<&str> = sorted(outcomes)
        .into_iter()
        .filter_map(Outcome::output)
        .collect();

    let text = successes.join(SEPARATOR);
    if text.trim().is_empty() {
        return Merge::NothingProduced { total };
    }

    Merge::Produced {
        text,
        succeeded: successes.len(),
        total,
    }
}

/// One manifest line per successful item, in index order.
pub fn manifest(outcomes: &[Outcome]) -> String {
    sorted(outcomes)
        .into_iter()
        .filter(|o| o.is_success())
        .map(|o| format!("{}\n", o.manifest_entry()))
        .collect()
}

/// Failed outcomes in index order.
pub fn failures(outcomes: &[Outcome]) -> Vec<&Outcome> {
    sorted(outcomes)
        .into_iter()
        .filter(|o| !o.is_success())
        .collect()
}
