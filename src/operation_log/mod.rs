use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::membership::ComplexConfig;
use crate::rsm::ReplicatedState;

/// Payload of an operation log entry. The variant determines which payload is
/// present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: ReplicatedState", deserialize = "S: ReplicatedState"))]
pub enum EntryContent<S: ReplicatedState> {
    /// A state machine change.
    Data(S::Change),

    /// A cluster configuration change. See Section 6 of the Raft paper.
    NewConfig(ComplexConfig),

    /// Carries no payload. Appended by a fresh leader so that commitment can
    /// advance in the new term. See Section 8 of the Raft paper.
    Noop,
}

/// An entry of the replicated operation log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: ReplicatedState", deserialize = "S: ReplicatedState"))]
pub struct LogEntry<S: ReplicatedState> {
    term: u64,
    content: EntryContent<S>,
}

impl<S: ReplicatedState> LogEntry<S> {
    pub fn new(term: u64, content: EntryContent<S>) -> LogEntry<S> {
        LogEntry { term, content }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn content(&self) -> &EntryContent<S> {
        &self.content
    }

    pub fn is_config_entry(&self) -> bool {
        match self.content {
            EntryContent::NewConfig(_) => true,
            _ => false,
        }
    }
}

/// A slice of the operation log, anchored by the entry just before it.
///
/// In a member's local state the anchor describes the last entry covered by
/// the snapshot. In an AppendEntries request it describes the entry the
/// leader expects right before the carried entries.
///
/// Index contracts are programming errors and panic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: ReplicatedState", deserialize = "S: ReplicatedState"))]
pub struct OperationLog<S: ReplicatedState> {
    prev_index: u64,
    prev_term: u64,
    entries: VecDeque<LogEntry<S>>,
}

impl<S: ReplicatedState> OperationLog<S> {
    pub fn new(prev_index: u64, prev_term: u64) -> OperationLog<S> {
        OperationLog {
            prev_index,
            prev_term,
            entries: VecDeque::new(),
        }
    }

    pub fn prev_index(&self) -> u64 {
        self.prev_index
    }

    pub fn prev_term(&self) -> u64 {
        self.prev_term
    }

    /// The latest index present in the log. If the log carries no entries,
    /// the index it is anchored on.
    pub fn latest_index(&self) -> u64 {
        self.prev_index + self.entries.len() as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Returns the entry at the given index.
    pub fn entry(&self, index: u64) -> &LogEntry<S> {
        if index <= self.prev_index {
            panic!("the log does not go back to index {}", index);
        }
        if index > self.latest_index() {
            panic!("the log does not go forward to index {}", index);
        }

        &self.entries[(index - self.prev_index - 1) as usize]
    }

    /// Returns the term of the entry at the given index. The index must be
    /// present in the log or be the anchor index right before it.
    pub fn entry_term(&self, index: u64) -> u64 {
        if index < self.prev_index {
            panic!("the log does not go back to index {}", index);
        }
        if index == self.prev_index {
            return self.prev_term;
        }

        self.entry(index).term()
    }

    /// Deletes the entry at the given index and every entry after it.
    pub fn truncate_from(&mut self, index: u64) {
        if index <= self.prev_index {
            panic!("cannot truncate the log suffix from index {}", index);
        }
        if index > self.latest_index() {
            panic!("the log does not go forward to index {}", index);
        }

        self.entries.truncate((index - self.prev_index - 1) as usize);
    }

    /// Deletes the entry at the given index and every entry before it,
    /// advancing the anchor to that index.
    pub fn truncate_to(&mut self, index: u64) {
        if index <= self.prev_index {
            panic!("cannot truncate the log prefix to index {}", index);
        }
        if index > self.latest_index() {
            panic!("the log does not go forward to index {}", index);
        }

        let index_term = self.entry_term(index);
        self.entries.drain(..(index - self.prev_index) as usize);
        self.prev_index = index;
        self.prev_term = index_term;
    }

    pub fn append(&mut self, entry: LogEntry<S>) {
        self.entries.push_back(entry);
    }

    /// Returns the log slice starting at `from_index`, anchored on the entry
    /// right before it. `from_index` may be `latest_index() + 1`, which
    /// yields an empty slice usable as a consistency probe.
    pub fn suffix(&self, from_index: u64) -> OperationLog<S> {
        if from_index <= self.prev_index {
            panic!("the log does not go back to index {}", from_index);
        }
        if from_index > self.latest_index() + 1 {
            panic!("the log does not go forward to index {}", from_index);
        }

        let mut slice = OperationLog::new(from_index - 1, self.entry_term(from_index - 1));
        for index in from_index..=self.latest_index() {
            slice.append(self.entry(index).clone());
        }

        slice
    }

    /// True if any configuration entry sits at an index greater than `index`.
    pub fn contains_config_entry_after(&self, index: u64) -> bool {
        let first = std::cmp::max(index, self.prev_index) + 1;
        (first..=self.latest_index()).any(|entry_index| self.entry(entry_index).is_config_entry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{ComplexConfig, Config};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
    struct Register {
        value: u64,
    }

    impl ReplicatedState for Register {
        type Change = u64;

        fn apply_change(&mut self, change: &u64) {
            self.value = *change;
        }
    }

    fn log_with_terms(prev_index: u64, prev_term: u64, terms: &[u64]) -> OperationLog<Register> {
        let mut log = OperationLog::new(prev_index, prev_term);
        for term in terms {
            log.append(LogEntry::new(*term, EntryContent::Noop));
        }

        log
    }

    #[test]
    fn latest_index_counts_from_the_anchor() {
        let log = log_with_terms(5, 2, &[2, 3]);

        assert_eq!(7, log.latest_index());
        assert_eq!(2, log.entry_count());
    }

    #[test]
    fn entry_term_of_the_anchor_is_prev_term() {
        let log = log_with_terms(5, 2, &[3]);

        assert_eq!(2, log.entry_term(5));
        assert_eq!(3, log.entry_term(6));
    }

    #[test]
    #[should_panic(expected = "does not go back")]
    fn entry_below_the_anchor_panics() {
        let log = log_with_terms(5, 2, &[3]);

        log.entry(5);
    }

    #[test]
    #[should_panic(expected = "does not go forward")]
    fn entry_past_the_latest_index_panics() {
        let log = log_with_terms(0, 0, &[1]);

        log.entry(2);
    }

    #[test]
    fn truncate_from_drops_the_suffix() {
        let mut log = log_with_terms(0, 0, &[1, 1, 2, 2]);

        log.truncate_from(3);

        assert_eq!(2, log.latest_index());
        assert_eq!(1, log.entry_term(2));
    }

    #[test]
    fn truncate_to_advances_the_anchor() {
        let mut log = log_with_terms(0, 0, &[1, 1, 2, 2]);

        log.truncate_to(3);

        assert_eq!(3, log.prev_index());
        assert_eq!(2, log.prev_term());
        assert_eq!(4, log.latest_index());
        assert_eq!(2, log.entry_term(4));
    }

    #[test]
    #[should_panic(expected = "does not go forward")]
    fn truncate_to_past_the_latest_index_panics() {
        let mut log = log_with_terms(0, 0, &[1]);

        log.truncate_to(2);
    }

    #[test]
    fn suffix_is_anchored_on_the_previous_entry() {
        let log = log_with_terms(2, 1, &[1, 2, 2]);

        let slice = log.suffix(4);

        assert_eq!(3, slice.prev_index());
        assert_eq!(1, slice.prev_term());
        assert_eq!(5, slice.latest_index());
    }

    #[test]
    fn suffix_past_the_end_is_an_empty_probe() {
        let log = log_with_terms(2, 1, &[1, 2]);

        let slice = log.suffix(5);

        assert_eq!(4, slice.prev_index());
        assert_eq!(2, slice.prev_term());
        assert_eq!(0, slice.entry_count());
    }

    #[test]
    fn detects_config_entries_after_an_index() {
        let mut log = log_with_terms(0, 0, &[1]);
        let config = ComplexConfig::single(Config::default());
        log.append(LogEntry::new(1, EntryContent::NewConfig(config)));
        log.append(LogEntry::new(1, EntryContent::Noop));

        assert!(log.contains_config_entry_after(0));
        assert!(log.contains_config_entry_after(1));
        assert!(!log.contains_config_entry_after(2));
    }
}
