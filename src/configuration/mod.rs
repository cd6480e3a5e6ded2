use std::time::Duration;

use crate::membership::MemberId;

/// Lower bound of the randomized election timeout. Transport-level
/// disconnection already triggers escalation to candidate, so this timeout
/// only spaces retries of failed elections. Relatively long bounds avoid
/// cycles of repeated split elections.
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 1000;

/// Upper bound of the randomized election timeout.
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 2000;

/// Source of election timeouts for the member's leadership lifecycle.
pub trait ElectionTimer: Send + Sync + 'static {
    /// Duration to wait before starting (or retrying) an election.
    fn next_elections_timeout(&self) -> Duration;
}

/// Everything needed to start a Raft member: its identity and its external
/// collaborators.
pub struct MemberConfiguration<St, Net, Et> {
    pub member_id: MemberId,
    pub storage: St,
    pub network: Net,
    pub election_timer: Et,
}
