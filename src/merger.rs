//! Incremental merge of agent status batches.

use crate::model::StatusMessage;
use std::collections::HashSet;

/// Result of merging one fetched batch into the known message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merged: Vec<StatusMessage>,
    /// Timestamp of the last merged message; `None` only while nothing is known.
    pub cursor: Option<String>,
}

/// Appends the messages of `incoming` that are not already known.
///
/// A message is known when an existing (or earlier incoming) entry has the same
/// `(timestamp, message)` pair. Appended entries keep `incoming` order. When
/// `incoming` is empty the cursor is the one `existing` already implied.
pub fn merge_messages(existing: &[StatusMessage], incoming: &[StatusMessage]) -> MergeOutcome {
    let mut seen: HashSet<(&str, &str)> = existing
        .iter()
        .map(|m| (m.timestamp.as_str(), m.message.as_str()))
        .collect();

    let mut merged = existing.to_vec();
    for message in incoming {
        if seen.insert((message.timestamp.as_str(), message.message.as_str())) {
            merged.push(message.clone());
        }
    }

    let cursor = merged.last().map(|m| m.timestamp.clone());
    MergeOutcome { merged, cursor }
}

#[cfg(test)]
#[path = "tests/merger_tests.rs"]
mod tests;
