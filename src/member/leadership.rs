use std::cmp;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::common::cancellation::CancellationSignal;
use crate::common::peer_requester::request_from_peers;
use crate::communication::peers::{
    PeerRequestHandler, RequestVoteRequest, RpcReply, RpcRequest, StepDownRequest,
};
use crate::configuration::{ElectionTimer, ELECTION_TIMEOUT_MAX_MS};
use crate::errors::{new_err, RaftError};
use crate::membership::{ComplexConfig, MemberId};
use crate::operation_log::{EntryContent, LogEntry};
use crate::rsm::{apply_log_entries, ReplicatedState};
use crate::storage::Storage;

use super::replication::{run_replication_worker, ReplicationWorkerParams};
use super::state::{MemberState, Mode};
use super::MemberShared;

/// How long a leader tolerates losing contact with a quorum before stepping
/// down voluntarily.
const QUORUM_LOSS_GRACE: Duration = Duration::from_millis(ELECTION_TIMEOUT_MAX_MS);

pub(crate) struct LeadershipWorkerParams<S, St, Net, Et>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    pub shared: Arc<MemberShared<S, St, Net, Et>>,
    pub wake_rx: Receiver<()>,
    pub cancellation: CancellationSignal,
}

enum ElectionOutcome {
    Won { term: u64, initial_next_index: u64 },
    Lost,
    Cancelled,
}

/// Runs the follower-unled, candidate and leader portions of the member
/// lifecycle on a dedicated thread.
///
/// Transitions out of candidate and leader can also happen in RPC handlers
/// (a greater term, an accepted leader), so this worker revalidates the mode
/// and term after every mutex reacquisition instead of relying on blocking
/// interruption handshakes.
pub(crate) fn run_leadership_worker<S, St, Net, Et>(params: LeadershipWorkerParams<S, St, Net, Et>)
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    info!(
        "Member {} Leadership worker started",
        params.shared.member_id
    );
    loop {
        if params.cancellation.is_cancelled() {
            break;
        }
        if !wait_for_election_due(&params) {
            break;
        }
        match run_election_round(&params) {
            ElectionOutcome::Won {
                term,
                initial_next_index,
            } => run_leader_loop(&params, term, initial_next_index),
            ElectionOutcome::Lost => {}
            ElectionOutcome::Cancelled => break,
        }
    }
    info!(
        "Member {} Leadership worker stopped",
        params.shared.member_id
    );
}

/// Blocks until an election is due: the member is an unled follower and a
/// randomized timeout has elapsed since it last believed a leader existed.
/// Returns false on cancellation.
fn wait_for_election_due<S, St, Net, Et>(params: &LeadershipWorkerParams<S, St, Net, Et>) -> bool
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    enum Wait {
        Due,
        Event,
        Timer(Duration),
    }

    // One timeout is drawn per distinct timer base so that spurious wakes do
    // not reshuffle the deadline.
    let mut drawn_timeout: Option<(Instant, Duration)> = None;
    loop {
        let wait = {
            let state = params.shared.lock_state();
            match state.mode {
                Mode::FollowerLed => {
                    drawn_timeout = None;
                    Wait::Event
                }
                Mode::FollowerUnled => {
                    let base = state
                        .last_leader_time
                        .expect("an unled follower has an election timer base");
                    let timeout = match drawn_timeout {
                        Some((drawn_base, timeout)) if drawn_base == base => timeout,
                        _ => {
                            let timeout = params.shared.election_timer.next_elections_timeout();
                            drawn_timeout = Some((base, timeout));
                            timeout
                        }
                    };
                    let deadline = base + timeout;
                    let now = Instant::now();
                    if now >= deadline {
                        Wait::Due
                    } else {
                        Wait::Timer(deadline - now)
                    }
                }
                // Candidate and leader belong to this worker; seeing them here
                // means a transition is still settling. Wait for the wake.
                Mode::Candidate | Mode::Leader => Wait::Event,
            }
        };

        match wait {
            Wait::Due => return true,
            Wait::Event => {
                select!(
                    recv(params.wake_rx) -> message => {
                        if message.is_err() {
                            return false;
                        }
                    },
                    recv(params.cancellation.receiver()) -> _ => return false,
                );
            }
            Wait::Timer(duration) => {
                select!(
                    recv(params.wake_rx) -> message => {
                        if message.is_err() {
                            return false;
                        }
                    },
                    recv(params.cancellation.receiver()) -> _ => return false,
                    default(duration) => {}
                );
            }
        }
        while params.wake_rx.try_recv().is_ok() {}
    }
}

/// Runs one election: term increment, self-vote, parallel vote requests and
/// the promotion or demotion that follows.
fn run_election_round<S, St, Net, Et>(
    params: &LeadershipWorkerParams<S, St, Net, Et>,
) -> ElectionOutcome
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let shared = &params.shared;

    let (vote_request, peers, config) = {
        let mut state = shared.lock_state();
        if state.mode != Mode::FollowerUnled {
            return ElectionOutcome::Lost;
        }

        let new_term = state.ps.current_term + 1;
        {
            let _write = state.begin_log_write();
            state.update_term(new_term);
            state.ps.voted_for = Some(shared.member_id);
        }
        state.mode = Mode::Candidate;
        info!(
            "Member {} Status changed to Candidate for term {}",
            shared.member_id, new_term
        );
        if shared
            .storage
            .write_persistent_state(&state.ps, &params.cancellation)
            .is_err()
        {
            return ElectionOutcome::Cancelled;
        }

        let last_log_index = state.ps.log.latest_index();
        let last_log_term = state.ps.log.entry_term(last_log_index);
        let config = state.active_config();
        let peers: Vec<MemberId> = config
            .all_members()
            .into_iter()
            .filter(|peer_id| *peer_id != shared.member_id)
            .collect();

        (
            RequestVoteRequest {
                term: new_term,
                candidate_id: shared.member_id,
                last_log_index,
                last_log_term,
            },
            peers,
            config,
        )
    };
    let term = vote_request.term;

    // The mutex is released around the fan-out.
    let responses = request_from_peers(vote_request, peers, |peer_id, request| {
        match shared
            .network
            .send_rpc(peer_id, RpcRequest::RequestVote(request), &params.cancellation)?
        {
            RpcReply::RequestVote(response) => Ok(response),
            reply => new_err(
                format!("Unexpected reply to a vote request: {:?}", reply),
                String::new(),
            ),
        }
    });

    let mut granted: BTreeSet<MemberId> = BTreeSet::new();
    granted.insert(shared.member_id);
    let mut greatest_term = term;
    for (peer_id, response) in responses {
        match response {
            Ok(response) => {
                if response.vote_granted && response.term == term {
                    granted.insert(peer_id);
                }
                greatest_term = cmp::max(greatest_term, response.term);
            }
            Err(err) => {
                if err.is_cancelled() {
                    return ElectionOutcome::Cancelled;
                }
                trace!(
                    "Member {} Vote request to {} failed: {}",
                    shared.member_id,
                    peer_id,
                    err
                );
            }
        }
    }

    let mut state = shared.lock_state();
    if state.mode != Mode::Candidate || state.ps.current_term != term {
        // deposed while collecting votes
        return ElectionOutcome::Lost;
    }

    if greatest_term > term {
        info!(
            "Member {} Observed term {} during elections, reverting to follower",
            shared.member_id, greatest_term
        );
        {
            let _write = state.begin_log_write();
            state.observe_greater_term(greatest_term);
            state.last_leader_time = Some(Instant::now());
        }
        if shared
            .storage
            .write_persistent_state(&state.ps, &params.cancellation)
            .is_err()
        {
            return ElectionOutcome::Cancelled;
        }
        return ElectionOutcome::Lost;
    }

    if config.is_quorum(&granted) && config.is_valid_leader(&shared.member_id) {
        match become_leader(shared, &mut state, &params.cancellation) {
            Ok(initial_next_index) => ElectionOutcome::Won {
                term,
                initial_next_index,
            },
            Err(_) => ElectionOutcome::Cancelled,
        }
    } else {
        info!(
            "Member {} Elections for term {} reached no quorum ({} votes)",
            shared.member_id,
            term,
            granted.len()
        );
        state.mode = Mode::FollowerUnled;
        state.last_leader_time = Some(Instant::now());
        state.update_readiness();
        ElectionOutcome::Lost
    }
}

/// Promotes the member to leader: appends the term-opening no-op entry and
/// seeds the replication bookkeeping. Returns the `next_index` replication
/// workers start from.
fn become_leader<S, St, Net, Et>(
    shared: &Arc<MemberShared<S, St, Net, Et>>,
    state: &mut MemberState<S>,
    cancellation: &CancellationSignal,
) -> Result<u64, RaftError>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let initial_next_index = state.ps.log.latest_index() + 1;
    state.mode = Mode::Leader;
    state.last_leader_time = None;
    info!(
        "Member {} Status changed to Leader for term {}",
        shared.member_id, state.ps.current_term
    );

    // The no-op lets commitment advance in the fresh term (Raft paper,
    // Section 8).
    let noop = LogEntry::new(state.ps.current_term, EntryContent::Noop);
    leader_append_log_entry(state, &shared.storage, noop, cancellation)?;

    for peer_id in replication_targets(state) {
        state.match_indexes.entry(peer_id).or_insert(0);
    }
    state.update_readiness();
    // a single-voter cluster commits without any peer traffic
    leader_try_advance_commit(state, &shared.storage, cancellation)?;

    Ok(initial_next_index)
}

/// The leader's reactive loop: keeps one replication worker per peer of the
/// active configuration, drives joint-consensus phases and enforces the
/// quorum-loss grace period.
fn run_leader_loop<S, St, Net, Et>(
    params: &LeadershipWorkerParams<S, St, Net, Et>,
    term: u64,
    initial_next_index: u64,
) where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    enum LeaderAction {
        StepDown,
        Wait(Option<Duration>),
        Stop,
    }

    let shared = &params.shared;
    let mut update_workers: HashMap<MemberId, JoinHandle<()>> = HashMap::new();

    loop {
        if params.cancellation.is_cancelled() {
            break;
        }

        let (action, stopped_workers) = {
            let mut state = shared.lock_state();
            if state.mode != Mode::Leader || state.ps.current_term != term {
                (LeaderAction::Stop, Vec::new())
            } else if leader_continue_reconfiguration(shared, &mut state, &params.cancellation)
                .is_err()
            {
                (LeaderAction::Stop, Vec::new())
            } else {
                let committed_config = state.committed_state.read(|c| c.config.clone());
                let excluded_by_config = !committed_config.is_joint_consensus()
                    && !committed_config.is_valid_leader(&shared.member_id);
                let grace_elapsed = state
                    .quorum_lost_since
                    .map(|since| since.elapsed() >= QUORUM_LOSS_GRACE)
                    .unwrap_or(false);

                if excluded_by_config || grace_elapsed {
                    if grace_elapsed {
                        warn!(
                            "Member {} Lost contact with a quorum for too long",
                            shared.member_id
                        );
                    }
                    leader_step_down(shared, &mut state);
                    (LeaderAction::StepDown, Vec::new())
                } else {
                    let stopped = reconcile_replication_workers(
                        params,
                        &mut state,
                        term,
                        initial_next_index,
                        &mut update_workers,
                    );
                    let wait = state.quorum_lost_since.map(|since| {
                        QUORUM_LOSS_GRACE
                            .checked_sub(since.elapsed())
                            .unwrap_or_else(|| Duration::from_millis(0))
                    });
                    (LeaderAction::Wait(wait), stopped)
                }
            }
        };

        // joining happens outside the mutex so the workers can finish their
        // own revalidation
        for (peer_id, handle) in stopped_workers {
            let _ = handle.join();
            trace!(
                "Member {} Replication worker for removed peer {} joined",
                shared.member_id,
                peer_id
            );
        }

        match action {
            LeaderAction::Stop | LeaderAction::StepDown => break,
            LeaderAction::Wait(None) => {
                select!(
                    recv(params.wake_rx) -> message => {
                        if message.is_err() {
                            break;
                        }
                    },
                    recv(params.cancellation.receiver()) -> _ => break,
                );
            }
            LeaderAction::Wait(Some(duration)) => {
                select!(
                    recv(params.wake_rx) -> message => {
                        if message.is_err() {
                            break;
                        }
                    },
                    recv(params.cancellation.receiver()) -> _ => break,
                    default(duration) => {}
                );
            }
        }
        while params.wake_rx.try_recv().is_ok() {}
    }

    for (peer_id, handle) in update_workers.drain() {
        let _ = handle.join();
        trace!(
            "Member {} Replication worker for peer {} joined",
            shared.member_id,
            peer_id
        );
    }
}

/// Spawns replication workers for peers that joined the active configuration
/// and retires the workers of peers that left it. Returns the handles of the
/// retired workers so the caller can join them outside the mutex.
fn reconcile_replication_workers<S, St, Net, Et>(
    params: &LeadershipWorkerParams<S, St, Net, Et>,
    state: &mut MemberState<S>,
    term: u64,
    initial_next_index: u64,
    update_workers: &mut HashMap<MemberId, JoinHandle<()>>,
) -> Vec<(MemberId, JoinHandle<()>)>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let shared = &params.shared;
    let targets: BTreeSet<MemberId> = replication_targets(state).into_iter().collect();

    let removed: Vec<MemberId> = update_workers
        .keys()
        .filter(|peer_id| !targets.contains(peer_id))
        .cloned()
        .collect();
    let mut stopped = Vec::new();
    for peer_id in removed {
        // dropping the kick sender wakes the worker, which then exits
        state.replication_kicks.remove(&peer_id);
        state.match_indexes.remove(&peer_id);
        if let Some(handle) = update_workers.remove(&peer_id) {
            stopped.push((peer_id, handle));
        }
        debug!(
            "Member {} Peer {} left the configuration, stopping replication",
            shared.member_id, peer_id
        );
    }

    for peer_id in targets {
        if update_workers.contains_key(&peer_id) {
            continue;
        }
        let (kick_tx, kick_rx) = crossbeam_channel::unbounded();
        state.replication_kicks.insert(peer_id, kick_tx);
        state.match_indexes.entry(peer_id).or_insert(0);
        let handle = thread::spawn({
            let worker_params = ReplicationWorkerParams {
                shared: shared.clone(),
                peer_id,
                term,
                next_index: initial_next_index,
                kick_rx,
                cancellation: params.cancellation.clone(),
            };
            move || run_replication_worker(worker_params)
        });
        update_workers.insert(peer_id, handle);
    }

    stopped
}

/// Checks whether the first phase of a reconfiguration completed (the joint
/// entry committed) and if so appends the second-phase entry carrying the
/// new configuration alone.
fn leader_continue_reconfiguration<S, St, Net, Et>(
    shared: &Arc<MemberShared<S, St, Net, Et>>,
    state: &mut MemberState<S>,
    cancellation: &CancellationSignal,
) -> Result<(), RaftError>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let committed_config = state.committed_state.read(|committed| committed.config.clone());
    if !committed_config.is_joint_consensus() {
        return Ok(());
    }
    if state.active_config() != committed_config {
        // the second phase is already in the log
        return Ok(());
    }

    let new_config = committed_config
        .new_config
        .expect("a joint consensus carries a new configuration");
    info!(
        "Member {} Joint consensus committed, appending the final configuration",
        shared.member_id
    );
    let entry = LogEntry::new(
        state.ps.current_term,
        EntryContent::NewConfig(ComplexConfig::single(new_config)),
    );
    leader_append_log_entry(state, &shared.storage, entry, cancellation)?;
    leader_try_advance_commit(state, &shared.storage, cancellation)?;

    Ok(())
}

/// Voluntary step-down: demotes to unled follower, fails outstanding change
/// tokens and notifies the peers that were being replicated to.
fn leader_step_down<S, St, Net, Et>(
    shared: &Arc<MemberShared<S, St, Net, Et>>,
    state: &mut MemberState<S>,
) where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let term = state.ps.current_term;
    let peers = replication_targets(state);
    info!(
        "Member {} Stepping down as leader for term {}",
        shared.member_id, term
    );
    state.become_follower_unled(true);
    spawn_step_down_broadcast(shared, term, peers);
}

/// Adopts a greater term observed from a reply or request, demoting to
/// follower. If we were leader the peers get a step-down notification for
/// the old term. The caller must flush persistent state before any reply
/// that reflects the new term.
pub(crate) fn note_greater_term<S, St, Net, Et>(
    shared: &Arc<MemberShared<S, St, Net, Et>>,
    state: &mut MemberState<S>,
    new_term: u64,
) where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let old_term = state.ps.current_term;
    let step_down_peers = if state.mode == Mode::Leader {
        Some(replication_targets(state))
    } else {
        None
    };

    {
        let _write = state.begin_log_write();
        state.observe_greater_term(new_term);
    }

    if let Some(peers) = step_down_peers {
        spawn_step_down_broadcast(shared, old_term, peers);
    }
}

/// Tells every peer that this member stopped acting as leader for `term`.
/// Best effort and fire-and-forget.
pub(crate) fn spawn_step_down_broadcast<S, St, Net, Et>(
    shared: &Arc<MemberShared<S, St, Net, Et>>,
    term: u64,
    peers: Vec<MemberId>,
) where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let shared = shared.clone();
    thread::spawn(move || {
        let request = StepDownRequest {
            term,
            leader_id: shared.member_id,
        };
        let responses = request_from_peers(request, peers, |peer_id, request| {
            shared
                .network
                .send_rpc(peer_id, RpcRequest::StepDown(request), &shared.member_cancellation)
        });
        for (peer_id, response) in responses {
            if let Err(err) = response {
                trace!(
                    "Member {} Step down notification to {} failed: {}",
                    shared.member_id,
                    peer_id,
                    err
                );
            }
        }
    });
}

/// Members of the active configuration that this member replicates to.
pub(crate) fn replication_targets<S: ReplicatedState>(state: &MemberState<S>) -> Vec<MemberId> {
    state
        .active_config()
        .all_members()
        .into_iter()
        .filter(|peer_id| *peer_id != state.member_id)
        .collect()
}

/// Appends an entry to the leader's log, updates `latest_state`, flushes and
/// kicks the replication workers. Returns the index of the new entry.
pub(crate) fn leader_append_log_entry<S, St>(
    state: &mut MemberState<S>,
    storage: &St,
    entry: LogEntry<S>,
    cancellation: &CancellationSignal,
) -> Result<u64, RaftError>
where
    S: ReplicatedState,
    St: Storage<S>,
{
    assert!(
        state.mode == Mode::Leader,
        "only the leader appends entries directly"
    );

    let new_index = {
        let _write = state.begin_log_write();
        state.ps.log.append(entry);
        let new_index = state.ps.log.latest_index();
        let mut latest = state.latest_state.get();
        apply_log_entries(&mut latest, &state.ps.log, new_index, new_index);
        state.latest_state.set(latest);
        new_index
    };
    let member_id = state.member_id;
    state.match_indexes.insert(member_id, new_index);

    storage.write_persistent_state(&state.ps, cancellation)?;

    state.kick_replication_workers();
    // a configuration entry changes the replication target set
    state.wake_leadership();
    state.update_readiness();
    trace!(
        "Member {} Appended entry {} in term {}",
        state.member_id,
        new_index,
        state.ps.current_term
    );

    Ok(new_index)
}

/// Advances the commit index to the greatest entry of the current term that
/// a quorum of the active configuration has replicated, resolving change
/// tokens for everything at or below it.
pub(crate) fn leader_try_advance_commit<S, St>(
    state: &mut MemberState<S>,
    storage: &St,
    cancellation: &CancellationSignal,
) -> Result<(), RaftError>
where
    S: ReplicatedState,
    St: Storage<S>,
{
    let config = state.active_config();
    let commit_index = state.commit_index();
    let latest_index = state.ps.log.latest_index();
    let current_term = state.ps.current_term;

    let mut new_commit = commit_index;
    for index in (commit_index + 1..=latest_index).rev() {
        let replicated: BTreeSet<MemberId> = state
            .match_indexes
            .iter()
            .filter(|(_, match_index)| **match_index >= index)
            .map(|(peer_id, _)| *peer_id)
            .collect();
        if !config.is_quorum(&replicated) {
            continue;
        }
        // Only entries of the current term commit by counting replicas
        // (Raft paper, Section 5.4.2); earlier ones commit transitively.
        if state.ps.log.entry_term(index) == current_term {
            new_commit = index;
        }
        break;
    }
    if new_commit == commit_index {
        return Ok(());
    }

    {
        let _write = state.begin_log_write();
        state.update_commit_index(new_commit);
    }
    storage.write_persistent_state(&state.ps, cancellation)?;
    state.resolve_change_tokens_up_to(new_commit);
    // followers learn the new commit index with the next entries batch
    state.kick_replication_workers();
    state.wake_leadership();

    Ok(())
}

/// Raises a peer's match index and attempts a commit advance.
pub(crate) fn leader_update_match_index<S, St>(
    state: &mut MemberState<S>,
    storage: &St,
    peer_id: MemberId,
    new_match_index: u64,
    cancellation: &CancellationSignal,
) -> Result<(), RaftError>
where
    S: ReplicatedState,
    St: Storage<S>,
{
    let match_index = state.match_indexes.entry(peer_id).or_insert(0);
    if new_match_index <= *match_index {
        return Ok(());
    }
    *match_index = new_match_index;

    leader_try_advance_commit(state, storage, cancellation)
}
