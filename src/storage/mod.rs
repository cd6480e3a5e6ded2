use serde::{Deserialize, Serialize};

use crate::common::cancellation::CancellationSignal;
use crate::errors::RaftError;
use crate::membership::{ComplexConfig, Config, MemberId};
use crate::operation_log::OperationLog;
use crate::rsm::ReplicatedState;

/// Everything a member must persist to stable storage.
///
/// `snapshot_state` and `snapshot_config` cover all entries up to and
/// including `log.prev_index()`; `log` carries the entries after that anchor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: ReplicatedState", deserialize = "S: ReplicatedState"))]
pub struct PersistentState<S: ReplicatedState> {
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<MemberId>,
    pub(crate) snapshot_state: S,
    pub(crate) snapshot_config: ComplexConfig,
    pub(crate) log: OperationLog<S>,
}

impl<S: ReplicatedState> PersistentState<S> {
    /// State for a member of a brand-new cluster. Every founding member must
    /// start from the same `initial_state` and `initial_config`.
    pub fn make_initial(initial_state: S, initial_config: Config) -> PersistentState<S> {
        PersistentState {
            current_term: 0,
            voted_for: None,
            snapshot_state: initial_state,
            snapshot_config: ComplexConfig::single(initial_config),
            log: OperationLog::new(0, 0),
        }
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<MemberId> {
        self.voted_for
    }

    pub fn log(&self) -> &OperationLog<S> {
        &self.log
    }

    pub fn snapshot_state(&self) -> &S {
        &self.snapshot_state
    }

    pub fn snapshot_config(&self) -> &ComplexConfig {
        &self.snapshot_config
    }
}

/// Durable storage collaborator.
pub trait Storage<S: ReplicatedState>: Send + Sync + 'static {
    /// Writes the member state to stable storage. Must not return `Ok` until
    /// the state is safely stored. The core always writes the full state;
    /// implementations may diff internally.
    fn write_persistent_state(
        &self,
        persistent_state: &PersistentState<S>,
        cancellation: &CancellationSignal,
    ) -> Result<(), RaftError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;

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

    #[test]
    fn initial_state_starts_before_the_first_entry() {
        let voting: BTreeSet<MemberId> = (0..3).map(|_| MemberId::new()).collect();
        let config = Config::with_voting(voting);

        let state = PersistentState::make_initial(Register { value: 3 }, config.clone());

        assert_eq!(0, state.current_term());
        assert_eq!(None, state.voted_for());
        assert_eq!(0, state.log().prev_index());
        assert_eq!(0, state.log().prev_term());
        assert_eq!(0, state.log().latest_index());
        assert_eq!(3, state.snapshot_state().value);
        assert_eq!(ComplexConfig::single(config), *state.snapshot_config());
    }
}
