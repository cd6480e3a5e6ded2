use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::common::cancellation::{cancellation, CancellationSignal, Canceller};
use crate::common::run_worker_thread;
use crate::common::watch::WatchedValue;
use crate::communication::peers::{PeerRequestHandler, RpcReply, RpcRequest};
use crate::configuration::{ElectionTimer, MemberConfiguration};
use crate::errors::RaftError;
use crate::membership::MemberId;
use crate::rsm::{ReplicatedState, StateAndConfig};
use crate::storage::{PersistentState, Storage};

mod change;
mod handlers;
mod leadership;
mod replication;
mod state;


pub use change::{ChangeLock, ChangeToken};
pub(crate) use state::{MemberState, Mode};

use leadership::{run_leadership_worker, LeadershipWorkerParams};

/// Collaborators and state shared between the member's public surface, its
/// RPC handlers and its worker threads.
pub(crate) struct MemberShared<S, St, Net, Et>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    pub member_id: MemberId,
    pub storage: St,
    pub network: Net,
    pub election_timer: Et,
    pub state: Mutex<MemberState<S>>,

    /// Fires when the member is being torn down. Detached work holds this
    /// instead of the caller-provided signals.
    pub member_cancellation: CancellationSignal,
}

impl<S, St, Net, Et> MemberShared<S, St, Net, Et>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    pub fn lock_state(&self) -> MutexGuard<MemberState<S>> {
        self.state.lock().expect("member lock is not poisoned")
    }
}

/// A single member of a Raft cluster.
///
/// The member owns no networking or storage logic; it drives the abstract
/// `Storage` and `PeerRequestHandler` collaborators it is given. Inbound
/// requests are delivered through `on_rpc`; changes are proposed through a
/// `ChangeLock`.
///
/// If any blocking method observes its cancellation signal, the member's
/// volatile state becomes undefined. No invalid RPC is issued and no partial
/// persistent write can be observed on recovery, but the member must be
/// dropped rather than reused.
pub struct RaftMember<S, St, Net, Et>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    shared: Arc<MemberShared<S, St, Net, Et>>,
    committed_state: WatchedValue<StateAndConfig<S>>,
    latest_state: WatchedValue<StateAndConfig<S>>,
    readiness_for_change: WatchedValue<bool>,
    readiness_for_config_change: WatchedValue<bool>,
    canceller: Canceller,
    worker_handles: Vec<JoinHandle<()>>,
}

impl<S, St, Net, Et> RaftMember<S, St, Net, Et>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    /// Starts a member from its persisted state and spawns its workers. The
    /// member begins as an unled follower with a running election timer.
    pub fn start(
        configuration: MemberConfiguration<St, Net, Et>,
        persistent_state: PersistentState<S>,
    ) -> RaftMember<S, St, Net, Et> {
        let MemberConfiguration {
            member_id,
            storage,
            network,
            election_timer,
        } = configuration;

        let (canceller, member_cancellation) = cancellation();
        let (leadership_wake_tx, leadership_wake_rx) = crossbeam_channel::unbounded();

        let connected = network.connected_members().get();

        let placeholder = StateAndConfig::new(
            persistent_state.log().prev_index(),
            persistent_state.snapshot_state().clone(),
            persistent_state.snapshot_config().clone(),
        );
        let committed_state = WatchedValue::new(placeholder.clone());
        let latest_state = WatchedValue::new(placeholder);
        let readiness_for_change = WatchedValue::new(false);
        let readiness_for_config_change = WatchedValue::new(false);

        let state = MemberState::new(
            member_id,
            persistent_state,
            connected,
            committed_state.clone(),
            latest_state.clone(),
            readiness_for_change.clone(),
            readiness_for_config_change.clone(),
            leadership_wake_tx,
        );

        let shared = Arc::new(MemberShared {
            member_id,
            storage,
            network,
            election_timer,
            state: Mutex::new(state),
            member_cancellation: member_cancellation.clone(),
        });

        let leadership_handle = run_worker_thread(
            run_leadership_worker,
            LeadershipWorkerParams {
                shared: shared.clone(),
                wake_rx: leadership_wake_rx,
                cancellation: member_cancellation.clone(),
            },
        );
        let connectivity_handle = run_worker_thread(
            run_connectivity_worker,
            ConnectivityWorkerParams {
                shared: shared.clone(),
                cancellation: member_cancellation,
            },
        );

        info!("Member {} started", member_id);

        RaftMember {
            shared,
            committed_state,
            latest_state,
            readiness_for_change,
            readiness_for_config_change,
            canceller,
            worker_handles: vec![leadership_handle, connectivity_handle],
        }
    }

    pub fn member_id(&self) -> MemberId {
        self.shared.member_id
    }

    /// Delivers a request from a peer and blocks for the reply.
    pub fn on_rpc(
        &self,
        request: RpcRequest<S>,
        cancellation: &CancellationSignal,
    ) -> Result<RpcReply, RaftError> {
        match request {
            RpcRequest::RequestVote(request) => {
                handlers::process_request_vote(&self.shared, request, cancellation)
                    .map(RpcReply::RequestVote)
            }
            RpcRequest::AppendEntries(request) => {
                handlers::process_append_entries(&self.shared, request, cancellation)
                    .map(RpcReply::AppendEntries)
            }
            RpcRequest::InstallSnapshot(request) => {
                handlers::process_install_snapshot(&self.shared, request, cancellation)
                    .map(RpcReply::InstallSnapshot)
            }
            RpcRequest::StepDown(request) => {
                handlers::process_step_down(&self.shared, request, cancellation)
                    .map(RpcReply::StepDown)
            }
        }
    }

    /// State after applying all committed entries.
    pub fn committed_state(&self) -> WatchedValue<StateAndConfig<S>> {
        self.committed_state.clone()
    }

    /// State after applying every log entry, including uncommitted ones.
    pub fn latest_state(&self) -> WatchedValue<StateAndConfig<S>> {
        self.latest_state.clone()
    }

    /// True while this member is leader and in contact with a quorum. When
    /// true, `propose_change` will probably succeed.
    pub fn readiness_for_change(&self) -> WatchedValue<bool> {
        self.readiness_for_change.clone()
    }

    /// Like `readiness_for_change`, and additionally no reconfiguration is
    /// in flight.
    pub fn readiness_for_config_change(&self) -> WatchedValue<bool> {
        self.readiness_for_config_change.clone()
    }

    /// Freezes the member in preparation for proposing changes. While the
    /// lock exists the member processes no other traffic and `latest_state`
    /// cannot change, so a change can be issued conditionally on the state
    /// it will be applied to. Do not hold it longer than necessary.
    pub fn change_lock(&self) -> ChangeLock<S, St, Net, Et> {
        ChangeLock::new(self.shared.lock_state(), &self.shared)
    }

    /// Persistent state suitable for initializing a new member joining the
    /// cluster.
    pub fn persistent_state_for_init(&self) -> PersistentState<S> {
        self.shared.lock_state().ps.clone()
    }

    /// Folds every committed entry into the snapshot and discards the log
    /// prefix it covered. Called by the embedder when the log has grown
    /// large enough to be worth compacting.
    pub fn compact_log(&self, cancellation: &CancellationSignal) -> Result<(), RaftError> {
        let mut state = self.shared.lock_state();
        let committed = state.committed_state.get();
        if committed.log_index <= state.ps.log.prev_index() {
            return Ok(());
        }

        {
            let _write = state.begin_log_write();
            state.ps.snapshot_state = committed.state;
            state.ps.snapshot_config = committed.config;
            state.ps.log.truncate_to(committed.log_index);
        }
        self.shared
            .storage
            .write_persistent_state(&state.ps, cancellation)?;

        info!(
            "Member {} Log compacted up to index {}",
            self.shared.member_id, committed.log_index
        );

        Ok(())
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<MemberState<S>> {
        self.shared.lock_state()
    }
}

impl<S, St, Net, Et> Drop for RaftMember<S, St, Net, Et>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    fn drop(&mut self) {
        self.canceller.cancel();
        {
            let mut state = self.shared.lock_state();
            state.fail_change_tokens();
            state.replication_kicks.clear();
            state.wake_leadership();
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
        info!("Member {} stopped", self.shared.member_id);
    }
}

struct ConnectivityWorkerParams<S, St, Net, Et>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    shared: Arc<MemberShared<S, St, Net, Et>>,
    cancellation: CancellationSignal,
}

/// Mirrors the transport's connectivity view into the member state: detects
/// leader disconnection and keeps the readiness watches current.
fn run_connectivity_worker<S, St, Net, Et>(params: ConnectivityWorkerParams<S, St, Net, Et>)
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    let connectivity = params.shared.network.connected_members();
    let updates_rx = connectivity.subscribe();

    // pick up anything that changed between construction and subscription
    {
        let mut state = params.shared.lock_state();
        state.connected = connectivity.get();
        state.update_readiness();
    }

    debug!(
        "Member {} Connectivity watcher started",
        params.shared.member_id
    );
    loop {
        let connected: BTreeSet<MemberId> = select!(
            recv(updates_rx) -> update => match update {
                Ok(connected) => connected,
                Err(_) => break,
            },
            recv(params.cancellation.receiver()) -> _ => break,
        );

        let mut state = params.shared.lock_state();
        state.connected = connected;

        if state.mode == Mode::FollowerLed {
            let leader_connected = state
                .current_term_leader_id
                .map(|leader_id| state.connected.contains(&leader_id))
                .unwrap_or(false);
            if !leader_connected {
                info!(
                    "Member {} Leader {:?} disconnected in term {}",
                    params.shared.member_id, state.current_term_leader_id, state.ps.current_term
                );
                state.current_term_leader_invalid = true;
                state.become_follower_unled(true);
            }
        }

        state.update_readiness();
        state.wake_leadership();
    }
    debug!(
        "Member {} Connectivity watcher stopped",
        params.shared.member_id
    );
}
