use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::membership::ComplexConfig;
use crate::operation_log::{EntryContent, OperationLog};

/// The user-supplied replicated state machine.
///
/// The cluster stores a full `ReplicatedState` value when taking a snapshot
/// and `Change` values in the log entries. Applying the same changes in the
/// same order to equal states must produce equal states.
pub trait ReplicatedState:
    Clone + PartialEq + Debug + Send + Serialize + DeserializeOwned + 'static
{
    /// An operation on the state machine.
    type Change: Clone + PartialEq + Debug + Send + Serialize + DeserializeOwned + 'static;

    /// Applies the change to the state, mutating it in place.
    fn apply_change(&mut self, change: &Self::Change);
}

/// The cluster's state, configuration and log index, kept in one struct so
/// they can live in a single watch and stay in sync.
#[derive(Clone, Debug, PartialEq)]
pub struct StateAndConfig<S: ReplicatedState> {
    pub log_index: u64,
    pub state: S,
    pub config: ComplexConfig,
}

impl<S: ReplicatedState> StateAndConfig<S> {
    pub fn new(log_index: u64, state: S, config: ComplexConfig) -> StateAndConfig<S> {
        StateAndConfig {
            log_index,
            state,
            config,
        }
    }
}

/// Applies the log entries with indexes `first <= index <= last` to the
/// projection. An empty range (`first > last`) is a no-op.
pub fn apply_log_entries<S: ReplicatedState>(
    state_and_config: &mut StateAndConfig<S>,
    log: &OperationLog<S>,
    first: u64,
    last: u64,
) {
    for index in first..=last {
        match log.entry(index).content() {
            EntryContent::Data(change) => state_and_config.state.apply_change(change),
            EntryContent::NewConfig(config) => state_and_config.config = config.clone(),
            EntryContent::Noop => {}
        }
        state_and_config.log_index = index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Config;
    use crate::operation_log::LogEntry;
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

    #[test]
    fn applies_data_config_and_noop_entries() {
        let mut log: OperationLog<Register> = OperationLog::new(0, 0);
        let new_config = ComplexConfig::single(Config::default());
        log.append(LogEntry::new(1, EntryContent::Data(5)));
        log.append(LogEntry::new(1, EntryContent::Noop));
        log.append(LogEntry::new(2, EntryContent::NewConfig(new_config.clone())));

        let mut projection = StateAndConfig::new(
            0,
            Register::default(),
            ComplexConfig::single(Config::default()),
        );
        apply_log_entries(&mut projection, &log, 1, 3);

        assert_eq!(3, projection.log_index);
        assert_eq!(5, projection.state.value);
        assert_eq!(new_config, projection.config);
    }

    #[test]
    fn empty_range_is_a_noop() {
        let log: OperationLog<Register> = OperationLog::new(4, 2);
        let mut projection = StateAndConfig::new(
            4,
            Register { value: 9 },
            ComplexConfig::single(Config::default()),
        );

        apply_log_entries(&mut projection, &log, 5, 4);

        assert_eq!(4, projection.log_index);
        assert_eq!(9, projection.state.value);
    }
}
