use std::cmp;
use std::sync::Arc;
use std::time::Instant;

use crate::common::cancellation::CancellationSignal;
use crate::communication::peers::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    PeerRequestHandler, RequestVoteRequest, RequestVoteResponse, StepDownRequest,
    StepDownResponse,
};
use crate::configuration::ElectionTimer;
use crate::errors::RaftError;
use crate::membership::MemberId;
use crate::operation_log::OperationLog;
use crate::rsm::{ReplicatedState, StateAndConfig};
use crate::storage::Storage;

use super::leadership::note_greater_term;
use super::state::{MemberState, Mode};
use super::MemberShared;

/// RequestVote RPC (Raft paper, Figure 2).
pub(crate) fn process_request_vote<S, St, Net, Et>(
    shared: &Arc<MemberShared<S, St, Net, Et>>,
    request: RequestVoteRequest,
    cancellation: &CancellationSignal,
) -> Result<RequestVoteResponse, RaftError>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let mut state = shared.lock_state();
    trace!(
        "Member {} Received vote request: {}",
        shared.member_id,
        request
    );

    let mut persistent_state_changed = false;
    if request.term > state.ps.current_term {
        note_greater_term(shared, &mut state, request.term);
        persistent_state_changed = true;
    }

    let candidate_log_up_to_date = {
        let last_log_index = state.ps.log.latest_index();
        let last_log_term = state.ps.log.entry_term(last_log_index);
        (request.last_log_term, request.last_log_index) >= (last_log_term, last_log_index)
    };
    let vote_granted = request.term == state.ps.current_term
        && (state.ps.voted_for.is_none() || state.ps.voted_for == Some(request.candidate_id))
        && candidate_log_up_to_date;

    if vote_granted {
        if state.ps.voted_for.is_none() {
            let _write = state.begin_log_write();
            state.ps.voted_for = Some(request.candidate_id);
            persistent_state_changed = true;
        }
        // a live candidate counts as leadership activity for the timer
        if state.mode == Mode::FollowerUnled {
            state.last_leader_time = Some(Instant::now());
        }
    }

    if persistent_state_changed {
        shared
            .storage
            .write_persistent_state(&state.ps, cancellation)?;
    }

    debug!(
        "Member {} Vote for candidate {} in term {}: granted - {}",
        shared.member_id, request.candidate_id, request.term, vote_granted
    );

    Ok(RequestVoteResponse {
        term: state.ps.current_term,
        vote_granted,
    })
}

/// AppendEntries RPC (Raft paper, Figure 2). Also serves as the consistency
/// probe when the entries slice is empty.
pub(crate) fn process_append_entries<S, St, Net, Et>(
    shared: &Arc<MemberShared<S, St, Net, Et>>,
    request: AppendEntriesRequest<S>,
    cancellation: &CancellationSignal,
) -> Result<AppendEntriesResponse, RaftError>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let mut state = shared.lock_state();
    trace!(
        "Member {} Received append entries request: {}",
        shared.member_id,
        request
    );

    if request.term < state.ps.current_term {
        return Ok(AppendEntriesResponse {
            term: state.ps.current_term,
            success: false,
        });
    }

    let mut persistent_state_changed = false;
    if request.term > state.ps.current_term {
        note_greater_term(shared, &mut state, request.term);
        persistent_state_changed = true;
    }
    acknowledge_leader(&mut state, request.leader_id);

    // Consistency check: the anchor entry must exist here with the same term.
    let local_anchor = state.ps.log.prev_index();
    let request_prev_index = request.entries.prev_index();
    let log_matches = if request_prev_index > state.ps.log.latest_index() {
        false
    } else if request_prev_index >= local_anchor {
        state.ps.log.entry_term(request_prev_index) == request.entries.prev_term()
    } else if request.entries.latest_index() >= local_anchor {
        // the request starts under our snapshot; judge the overlap against
        // the recorded anchor term
        request.entries.entry_term(local_anchor) == state.ps.log.prev_term()
    } else {
        // entirely covered by our snapshot, so already committed here
        true
    };

    if !log_matches {
        if persistent_state_changed {
            shared
                .storage
                .write_persistent_state(&state.ps, cancellation)?;
        }
        debug!(
            "Member {} Rejected append entries: no entry with term {} at index {}",
            shared.member_id,
            request.entries.prev_term(),
            request_prev_index
        );
        return Ok(AppendEntriesResponse {
            term: state.ps.current_term,
            success: false,
        });
    }

    // Append whatever is new. The suffix is truncated only on a true term
    // conflict, so a stale duplicate cannot drop entries appended after it.
    {
        let _write = state.begin_log_write();
        let first_new_index = cmp::max(request_prev_index, local_anchor) + 1;
        let mut log_changed = false;
        for index in first_new_index..=request.entries.latest_index() {
            let incoming = request.entries.entry(index);
            if index <= state.ps.log.latest_index() {
                if state.ps.log.entry_term(index) == incoming.term() {
                    continue;
                }
                warn!(
                    "Member {} Truncating conflicting log suffix from index {}",
                    shared.member_id, index
                );
                state.ps.log.truncate_from(index);
            }
            state.ps.log.append(incoming.clone());
            log_changed = true;
        }
        if log_changed {
            state.rebuild_latest_state();
            persistent_state_changed = true;
        }
    }

    if persistent_state_changed {
        shared
            .storage
            .write_persistent_state(&state.ps, cancellation)?;
    }

    // Commitment follows the leader once the entries are durable.
    let last_new_index = request.entries.latest_index();
    let new_commit_index = cmp::min(request.leader_commit, last_new_index);
    if new_commit_index > state.commit_index() {
        let _write = state.begin_log_write();
        state.update_commit_index(new_commit_index);
    }

    Ok(AppendEntriesResponse {
        term: state.ps.current_term,
        success: true,
    })
}

/// InstallSnapshot RPC (Raft paper, Figure 13), except the snapshot arrives
/// whole instead of in chunks.
pub(crate) fn process_install_snapshot<S, St, Net, Et>(
    shared: &Arc<MemberShared<S, St, Net, Et>>,
    request: InstallSnapshotRequest<S>,
    cancellation: &CancellationSignal,
) -> Result<InstallSnapshotResponse, RaftError>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let mut state = shared.lock_state();
    trace!(
        "Member {} Received install snapshot request: {}",
        shared.member_id,
        request
    );

    if request.term < state.ps.current_term {
        return Ok(InstallSnapshotResponse {
            term: state.ps.current_term,
        });
    }

    let mut persistent_state_changed = false;
    if request.term > state.ps.current_term {
        note_greater_term(shared, &mut state, request.term);
        persistent_state_changed = true;
    }
    acknowledge_leader(&mut state, request.leader_id);

    if request.last_included_index <= state.commit_index() {
        // everything the snapshot covers is already applied here
        if persistent_state_changed {
            shared
                .storage
                .write_persistent_state(&state.ps, cancellation)?;
        }
        debug!(
            "Member {} Ignoring snapshot up to index {}: commit index is {}",
            shared.member_id,
            request.last_included_index,
            state.commit_index()
        );
        return Ok(InstallSnapshotResponse {
            term: state.ps.current_term,
        });
    }

    let last_included_index = request.last_included_index;
    let last_included_term = request.last_included_term;
    {
        let _write = state.begin_log_write();
        state.ps.snapshot_state = request.snapshot_state;
        state.ps.snapshot_config = request.snapshot_config;

        // Keep the log suffix after the snapshot if it connects to it;
        // otherwise every retained entry would be unverifiable.
        let suffix_connects = last_included_index > state.ps.log.prev_index()
            && last_included_index <= state.ps.log.latest_index()
            && state.ps.log.entry_term(last_included_index) == last_included_term;
        if suffix_connects {
            state.ps.log.truncate_to(last_included_index);
        } else {
            state.ps.log = OperationLog::new(last_included_index, last_included_term);
        }
    }

    shared
        .storage
        .write_persistent_state(&state.ps, cancellation)?;

    {
        let _write = state.begin_log_write();
        let snapshot_projection = StateAndConfig::new(
            last_included_index,
            state.ps.snapshot_state.clone(),
            state.ps.snapshot_config.clone(),
        );
        state.committed_state.set(snapshot_projection);
        state.rebuild_latest_state();
        state.update_readiness();
    }

    info!(
        "Member {} Installed snapshot up to index {} (term {})",
        shared.member_id, last_included_index, last_included_term
    );

    Ok(InstallSnapshotResponse {
        term: state.ps.current_term,
    })
}

/// StepDown RPC. Not in the Raft paper: leader liveness is deduced from the
/// transport's connectivity, so a leader that stops leading while still
/// connected has to say so explicitly.
pub(crate) fn process_step_down<S, St, Net, Et>(
    shared: &Arc<MemberShared<S, St, Net, Et>>,
    request: StepDownRequest,
    cancellation: &CancellationSignal,
) -> Result<StepDownResponse, RaftError>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let mut state = shared.lock_state();
    trace!(
        "Member {} Received step down request: {}",
        shared.member_id,
        request
    );

    let mut persistent_state_changed = false;
    if request.term > state.ps.current_term {
        note_greater_term(shared, &mut state, request.term);
        persistent_state_changed = true;
    }

    if request.term == state.ps.current_term
        && state.current_term_leader_id == Some(request.leader_id)
    {
        if !state.current_term_leader_invalid {
            info!(
                "Member {} Leader {} stepped down in term {}",
                shared.member_id, request.leader_id, request.term
            );
        }
        state.current_term_leader_invalid = true;
        if state.mode == Mode::FollowerLed {
            state.become_follower_unled(true);
        }
    }

    if persistent_state_changed {
        shared
            .storage
            .write_persistent_state(&state.ps, cancellation)?;
    }

    Ok(StepDownResponse {})
}

/// Records the sender as this term's live leader and follows it, unless the
/// leader already renounced this term.
fn acknowledge_leader<S: ReplicatedState>(state: &mut MemberState<S>, leader_id: MemberId) {
    let leader_renounced = state.current_term_leader_invalid
        && state.current_term_leader_id == Some(leader_id);
    if leader_renounced {
        // keep processing its messages without treating them as liveness
        return;
    }
    state.become_follower_led(leader_id);
}
