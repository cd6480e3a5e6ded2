use raft_core::ReplicatedState;
use serde::{Deserialize, Serialize};

/// Minimal replicated state machine: a signed counter.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
    value: i64,
}

/// A change to the counter.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CounterChange {
    pub delta: i64,
}

impl CounterState {
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl ReplicatedState for CounterState {
    type Change = CounterChange;

    fn apply_change(&mut self, change: &CounterChange) {
        self.value += change.delta;
    }
}
