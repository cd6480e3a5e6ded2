use std::time::Duration;

use rand::Rng;

use raft_core::{ElectionTimer, ELECTION_TIMEOUT_MAX_MS, ELECTION_TIMEOUT_MIN_MS};

/// Provides a uniformly random election timeout within a range.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RandomizedElectionTimer {
    range_start_ms: u64,
    range_stop_ms: u64,
}

impl RandomizedElectionTimer {
    /// Creates a new RandomizedElectionTimer with the time range in
    /// milliseconds.
    pub fn new(range_start_ms: u64, range_stop_ms: u64) -> RandomizedElectionTimer {
        if range_start_ms >= range_stop_ms || range_stop_ms == 0 {
            panic!(
                "Invalid params: range_start_ms : {}, range_stop_ms : {}",
                range_start_ms, range_stop_ms
            )
        }
        RandomizedElectionTimer {
            range_start_ms,
            range_stop_ms,
        }
    }
}

impl Default for RandomizedElectionTimer {
    /// The timeout range the member core exports.
    fn default() -> RandomizedElectionTimer {
        RandomizedElectionTimer::new(ELECTION_TIMEOUT_MIN_MS, ELECTION_TIMEOUT_MAX_MS)
    }
}

impl ElectionTimer for RandomizedElectionTimer {
    fn next_elections_timeout(&self) -> Duration {
        let mut rng = rand::thread_rng();

        Duration::from_millis(rng.gen_range(self.range_start_ms, self.range_stop_ms))
    }
}

/// Always yields the same election timeout. Useful for tests that need a
/// predictable (or effectively infinite) timer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FixedElectionTimer {
    timeout_ms: u64,
}

impl FixedElectionTimer {
    /// Creates a new FixedElectionTimer with the timeout in milliseconds.
    pub fn new(timeout_ms: u64) -> FixedElectionTimer {
        FixedElectionTimer { timeout_ms }
    }
}

impl ElectionTimer for FixedElectionTimer {
    fn next_elections_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
