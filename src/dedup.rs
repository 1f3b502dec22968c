use std::collections::HashSet;

use crate::extract::Record;

/// Snapshot of identity keys already present in the sink, read once at run
/// start and only mutated in memory afterwards.
#[derive(Debug, Default, Clone)]
pub struct ExistingIndex {
    keys: HashSet<String>,
}

impl ExistingIndex {
    pub fn from_keys(keys: HashSet<String>) -> Self {
        Self { keys }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Candidates split by the dedup pass, both sides in first-seen order.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// Genuinely new records, to be written.
    pub admitted: Vec<Record>,
    /// Records whose identity the sink already knows; kept around so sheet
    /// sinks in refresh mode can update their volatile value column.
    pub known: Vec<Record>,
}

/// Admit only genuinely new records, preserving encounter order. A key is
/// checked against the existing index *and* against keys admitted earlier in
/// this same call: scroll-based accumulation routinely yields the same item
/// twice, and the index alone cannot catch that. First seen wins.
pub fn filter_new(candidates: Vec<Record>, existing: &ExistingIndex) -> DedupOutcome {
    let mut admitted_keys = HashSet::new();
    let mut outcome = DedupOutcome::default();

    for record in candidates {
        let key = record.identity_key();
        if existing.contains(&key) {
            outcome.known.push(record);
            continue;
        }
        if admitted_keys.insert(key) {
            outcome.admitted.push(record);
        }
    }

    outcome
}
