//! Cross-member invariant checks for tests.
//!
//! `check_invariants` acquires every member's mutex in a fixed order, so it
//! may block, but it never modifies anything.

use std::cmp;
use std::sync::MutexGuard;

use crate::communication::peers::PeerRequestHandler;
use crate::configuration::ElectionTimer;
use crate::member::{MemberState, Mode, RaftMember};
use crate::operation_log::EntryContent;
use crate::rsm::ReplicatedState;
use crate::storage::Storage;

/// Asserts that the given cluster members are in a valid, consistent state:
/// each member's local invariants, election safety, log matching and state
/// machine safety.
pub fn check_invariants<S, St, Net, Et>(members: &[&RaftMember<S, St, Net, Et>])
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let mut ordered: Vec<&&RaftMember<S, St, Net, Et>> = members.iter().collect();
    ordered.sort_by_key(|member| member.member_id());

    let guards: Vec<MutexGuard<MemberState<S>>> = ordered
        .iter()
        .map(|member| member.lock_state())
        .collect();

    for state in &guards {
        check_local_invariants(state);
    }

    check_election_safety(&guards);

    for (left_position, left) in guards.iter().enumerate() {
        for right in &guards[left_position + 1..] {
            check_log_matching(left, right);
            check_state_machine_safety(left, right);
        }
    }
}

fn check_local_invariants<S: ReplicatedState>(state: &MemberState<S>) {
    let log = &state.ps.log;
    let committed = state.committed_state.get();
    let latest = state.latest_state.get();

    assert!(
        committed.log_index >= log.prev_index() && committed.log_index <= log.latest_index(),
        "the commit index must lie within the log bounds"
    );
    assert_eq!(
        latest.log_index,
        log.latest_index(),
        "the latest projection must cover the whole log"
    );
    assert!(
        committed.log_index <= latest.log_index,
        "the committed projection can never overtake the latest one"
    );

    if state.mode != Mode::Leader {
        assert!(
            state.match_indexes.is_empty(),
            "match indexes exist only on a leader"
        );
        assert!(
            state.change_tokens.is_empty(),
            "change tokens exist only on a leader"
        );
    }
    if state.mode == Mode::FollowerLed {
        assert!(
            state.last_leader_time.is_none(),
            "a led follower believes a leader exists right now"
        );
    }

    // log terms are monotonically non-decreasing and never from the future
    let mut previous_term = log.prev_term();
    for index in log.prev_index() + 1..=log.latest_index() {
        let term = log.entry_term(index);
        assert!(term >= previous_term, "log terms never decrease");
        assert!(
            term <= state.ps.current_term,
            "no entry can carry a term greater than the current one"
        );
        previous_term = term;
    }

    // both projections carry exactly the configuration their prefix implies
    let mut expected_config = state.ps.snapshot_config.clone();
    for index in log.prev_index() + 1..=committed.log_index {
        if let EntryContent::NewConfig(config) = log.entry(index).content() {
            expected_config = config.clone();
        }
    }
    assert_eq!(
        expected_config, committed.config,
        "the committed configuration must match the committed log prefix"
    );
    for index in committed.log_index + 1..=log.latest_index() {
        if let EntryContent::NewConfig(config) = log.entry(index).content() {
            expected_config = config.clone();
        }
    }
    assert_eq!(
        expected_config, latest.config,
        "the active configuration must match the whole log"
    );
}

/// At most one leader per term.
fn check_election_safety<S: ReplicatedState>(guards: &[MutexGuard<MemberState<S>>]) {
    let mut leader_terms: Vec<u64> = guards
        .iter()
        .filter(|state| state.mode == Mode::Leader)
        .map(|state| state.ps.current_term)
        .collect();
    let leader_count = leader_terms.len();
    leader_terms.sort();
    leader_terms.dedup();
    assert_eq!(
        leader_count,
        leader_terms.len(),
        "two members lead the same term"
    );
}

/// If two logs hold an entry with the same index and term, the logs are
/// identical up to that index.
fn check_log_matching<S: ReplicatedState>(left: &MemberState<S>, right: &MemberState<S>) {
    let left_log = &left.ps.log;
    let right_log = &right.ps.log;

    let first_shared = cmp::max(left_log.prev_index(), right_log.prev_index()) + 1;
    let last_shared = cmp::min(left_log.latest_index(), right_log.latest_index());

    for index in (first_shared..=last_shared).rev() {
        if left_log.entry_term(index) != right_log.entry_term(index) {
            continue;
        }
        for shared_index in first_shared..=index {
            assert_eq!(
                left_log.entry(shared_index),
                right_log.entry(shared_index),
                "logs agreeing at index {} diverge at index {}",
                index,
                shared_index
            );
        }
        break;
    }
}

/// Committed entries are identical across members at equal indices.
fn check_state_machine_safety<S: ReplicatedState>(left: &MemberState<S>, right: &MemberState<S>) {
    let left_log = &left.ps.log;
    let right_log = &right.ps.log;

    let first_shared = cmp::max(left_log.prev_index(), right_log.prev_index()) + 1;
    let last_committed = cmp::min(
        left.committed_state.read(|committed| committed.log_index),
        right.committed_state.read(|committed| committed.log_index),
    );

    for index in first_shared..=cmp::min(last_committed, cmp::min(left_log.latest_index(), right_log.latest_index())) {
        assert_eq!(
            left_log.entry(index),
            right_log.entry(index),
            "members committed different entries at index {}",
            index
        );
    }
}
