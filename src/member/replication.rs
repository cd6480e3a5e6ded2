use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::common::cancellation::CancellationSignal;
use crate::communication::peers::{
    AppendEntriesRequest, InstallSnapshotRequest, PeerRequestHandler, RpcReply, RpcRequest,
};
use crate::configuration::ElectionTimer;
use crate::errors::RaftError;
use crate::membership::MemberId;
use crate::rsm::ReplicatedState;
use crate::storage::Storage;

use super::leadership::{leader_update_match_index, note_greater_term};
use super::state::{MemberState, Mode};
use super::MemberShared;

pub(crate) struct ReplicationWorkerParams<S, St, Net, Et>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    pub shared: Arc<MemberShared<S, St, Net, Et>>,
    pub peer_id: MemberId,
    pub term: u64,
    pub next_index: u64,
    pub kick_rx: Receiver<()>,
    pub cancellation: CancellationSignal,
}

enum ReplicationTask<S: ReplicatedState> {
    Append(AppendEntriesRequest<S>),
    InstallSnapshot(InstallSnapshotRequest<S>),
    Idle,
}

/// Pushes entries (or the snapshot) to one peer for as long as this member
/// leads `term`.
///
/// The worker sleeps on its kick channel once the peer is fully caught up:
/// its match index at the log head and the current commit index delivered.
/// Fresh appends, commit advances and connectivity changes kick it awake.
pub(crate) fn run_replication_worker<S, St, Net, Et>(params: ReplicationWorkerParams<S, St, Net, Et>)
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let shared = &params.shared;
    let peer_id = params.peer_id;
    let term = params.term;
    let mut next_index = params.next_index;
    // the commit index this peer last saw in a successful request
    let mut acked_commit: Option<u64> = None;

    debug!(
        "Member {} Replication worker for peer {} started in term {}",
        shared.member_id, peer_id, term
    );

    loop {
        if params.cancellation.is_cancelled() {
            break;
        }

        let task = {
            let state = shared.lock_state();
            if !leads_current_term(&state, term) || !state.replication_kicks.contains_key(&peer_id)
            {
                break;
            }

            if next_index <= state.ps.log.prev_index() {
                // the entries the peer needs are compacted away
                ReplicationTask::InstallSnapshot(InstallSnapshotRequest {
                    term,
                    leader_id: shared.member_id,
                    last_included_index: state.ps.log.prev_index(),
                    last_included_term: state.ps.log.prev_term(),
                    snapshot_state: state.ps.snapshot_state.clone(),
                    snapshot_config: state.ps.snapshot_config.clone(),
                })
            } else {
                let commit_index = state.commit_index();
                let match_index = state.match_indexes.get(&peer_id).copied().unwrap_or(0);
                if match_index < state.ps.log.latest_index() || acked_commit != Some(commit_index)
                {
                    ReplicationTask::Append(AppendEntriesRequest {
                        term,
                        leader_id: shared.member_id,
                        entries: state.ps.log.suffix(next_index),
                        leader_commit: commit_index,
                    })
                } else {
                    ReplicationTask::Idle
                }
            }
        };

        match task {
            ReplicationTask::Idle => {
                select!(
                    recv(params.kick_rx) -> message => {
                        if message.is_err() {
                            break;
                        }
                    },
                    recv(params.cancellation.receiver()) -> _ => break,
                );
                while params.kick_rx.try_recv().is_ok() {}
            }
            ReplicationTask::Append(request) => {
                let request_prev_index = request.entries.prev_index();
                let request_entry_count = request.entries.entry_count();
                let request_commit = request.leader_commit;

                match shared.network.send_rpc(
                    peer_id,
                    RpcRequest::AppendEntries(request),
                    &params.cancellation,
                ) {
                    Ok(RpcReply::AppendEntries(response)) => {
                        let mut state = shared.lock_state();
                        if !leads_current_term(&state, term) {
                            break;
                        }
                        if response.term > term {
                            supersede(shared, &mut state, response.term, &params.cancellation);
                            break;
                        }
                        if response.success {
                            let new_match_index = request_prev_index + request_entry_count;
                            next_index = new_match_index + 1;
                            acked_commit = Some(request_commit);
                            if leader_update_match_index(
                                &mut state,
                                &shared.storage,
                                peer_id,
                                new_match_index,
                                &params.cancellation,
                            )
                            .is_err()
                            {
                                break;
                            }
                        } else {
                            // walk one entry back; once the log runs out the
                            // snapshot branch takes over
                            if next_index > 1 {
                                next_index -= 1;
                            }
                            trace!(
                                "Member {} Peer {} rejected entries after index {}, backing off",
                                shared.member_id,
                                peer_id,
                                request_prev_index
                            );
                        }
                    }
                    Ok(reply) => {
                        warn!(
                            "Member {} Unexpected reply to append entries from {}: {:?}",
                            shared.member_id, peer_id, reply
                        );
                        break;
                    }
                    Err(err) => {
                        if !wait_for_reconnection(&params, err) {
                            break;
                        }
                    }
                }
            }
            ReplicationTask::InstallSnapshot(request) => {
                let last_included_index = request.last_included_index;

                match shared.network.send_rpc(
                    peer_id,
                    RpcRequest::InstallSnapshot(request),
                    &params.cancellation,
                ) {
                    Ok(RpcReply::InstallSnapshot(response)) => {
                        let mut state = shared.lock_state();
                        if !leads_current_term(&state, term) {
                            break;
                        }
                        if response.term > term {
                            supersede(shared, &mut state, response.term, &params.cancellation);
                            break;
                        }
                        debug!(
                            "Member {} Peer {} holds the snapshot up to index {}",
                            shared.member_id, peer_id, last_included_index
                        );
                        next_index = last_included_index + 1;
                        if leader_update_match_index(
                            &mut state,
                            &shared.storage,
                            peer_id,
                            last_included_index,
                            &params.cancellation,
                        )
                        .is_err()
                        {
                            break;
                        }
                    }
                    Ok(reply) => {
                        warn!(
                            "Member {} Unexpected reply to install snapshot from {}: {:?}",
                            shared.member_id, peer_id, reply
                        );
                        break;
                    }
                    Err(err) => {
                        if !wait_for_reconnection(&params, err) {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!(
        "Member {} Replication worker for peer {} stopped",
        shared.member_id, peer_id
    );
}

fn leads_current_term<S: ReplicatedState>(state: &MemberState<S>, term: u64) -> bool {
    state.mode == Mode::Leader && state.ps.current_term == term
}

/// A follower answered with a greater term: the leadership is over.
fn supersede<S, St, Net, Et>(
    shared: &Arc<MemberShared<S, St, Net, Et>>,
    state: &mut MemberState<S>,
    new_term: u64,
    cancellation: &CancellationSignal,
) where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    info!(
        "Member {} Observed term {} while replicating, stepping down",
        shared.member_id, new_term
    );
    note_greater_term(shared, state, new_term);
    let _ = shared
        .storage
        .write_persistent_state(&state.ps, cancellation);
}

/// Blocks until the peer shows up in the connectivity view again. Returns
/// false when the worker should exit instead of retrying.
fn wait_for_reconnection<S, St, Net, Et>(
    params: &ReplicationWorkerParams<S, St, Net, Et>,
    err: RaftError,
) -> bool
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    if err.is_cancelled() {
        return false;
    }
    trace!(
        "Member {} Peer {} unreachable, waiting for reconnection: {}",
        params.shared.member_id,
        params.peer_id,
        err
    );

    let connectivity = params.shared.network.connected_members();
    let updates_rx = connectivity.subscribe();
    loop {
        if connectivity.read(|connected| connected.contains(&params.peer_id)) {
            return true;
        }
        select!(
            recv(updates_rx) -> message => {
                if message.is_err() {
                    return false;
                }
            },
            // a closed kick channel means the peer left the configuration
            recv(params.kick_rx) -> message => {
                if message.is_err() {
                    return false;
                }
            },
            recv(params.cancellation.receiver()) -> _ => return false,
        );
    }
}
