use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::common::watch::WatchedValue;
use crate::membership::{ComplexConfig, MemberId};
use crate::rsm::{apply_log_entries, ReplicatedState, StateAndConfig};
use crate::storage::PersistentState;

/// Lifecycle state of a member. The Raft paper's "follower" state is split
/// in two depending on whether we believe a live leader exists.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Mode {
    FollowerLed,
    FollowerUnled,
    Candidate,
    Leader,
}

/// All member state guarded by the member mutex: the persistent variables,
/// the derived projections and the volatile leadership bookkeeping.
///
/// Every RPC handler and worker acquires the mutex before touching this
/// struct and releases it around any outbound RPC.
pub(crate) struct MemberState<S: ReplicatedState> {
    pub member_id: MemberId,

    /// The variables written to stable storage. Abbreviated because it is
    /// referenced constantly.
    pub ps: PersistentState<S>,

    pub mode: Mode,

    /// State after applying all committed entries. Its `log_index` is the
    /// commit index; entries are applied the moment they commit.
    pub committed_state: WatchedValue<StateAndConfig<S>>,

    /// State after applying every log entry, committed or not. A member
    /// always uses the latest configuration in its log, so this also carries
    /// the active configuration.
    pub latest_state: WatchedValue<StateAndConfig<S>>,

    /// The member acting as leader this term, if one was seen.
    pub current_term_leader_id: Option<MemberId>,

    /// True once the current term's leader stepped down or disconnected.
    /// Further messages from it are processed but no longer count as
    /// evidence of a live leader.
    pub current_term_leader_invalid: bool,

    /// When we last believed a leader or candidate existed. `None` means a
    /// leader exists right now (follower-led and leader modes); otherwise
    /// the timestamp the election timeout counts from.
    pub last_leader_time: Option<Instant>,

    /// Per-peer highest replicated index. Non-empty only while leader.
    pub match_indexes: BTreeMap<MemberId, u64>,

    /// Wake channels of the per-peer replication workers. Non-empty only
    /// while leader. Removing a sender tells its worker to exit.
    pub replication_kicks: BTreeMap<MemberId, Sender<()>>,

    pub readiness_for_change: WatchedValue<bool>,
    pub readiness_for_config_change: WatchedValue<bool>,

    /// Pending change observers keyed by the log index they wait on.
    /// Non-empty only while leader.
    pub change_tokens: BTreeMap<u64, Vec<Sender<bool>>>,

    /// Set while leader and out of contact with a quorum; the leadership
    /// worker steps down once the grace period elapses.
    pub quorum_lost_since: Option<Instant>,

    /// Peers currently reachable according to the transport.
    pub connected: BTreeSet<MemberId>,

    leadership_wake_tx: Sender<()>,
    log_write_flag: Arc<AtomicBool>,
}

/// Scope marker around writes to the persistent variables and the two
/// projections. Writers must never interleave; taking a second guard while
/// one is alive is a programming error.
pub(crate) struct LogWriteGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for LogWriteGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl<S: ReplicatedState> MemberState<S> {
    pub fn new(
        member_id: MemberId,
        persistent_state: PersistentState<S>,
        connected: BTreeSet<MemberId>,
        committed_state: WatchedValue<StateAndConfig<S>>,
        latest_state: WatchedValue<StateAndConfig<S>>,
        readiness_for_change: WatchedValue<bool>,
        readiness_for_config_change: WatchedValue<bool>,
        leadership_wake_tx: Sender<()>,
    ) -> MemberState<S> {
        let snapshot_projection = StateAndConfig::new(
            persistent_state.log.prev_index(),
            persistent_state.snapshot_state.clone(),
            persistent_state.snapshot_config.clone(),
        );
        // The commit index is volatile: after a restart it points back at the
        // snapshot anchor and is re-learned from the leader.
        committed_state.set(snapshot_projection.clone());

        let mut latest = snapshot_projection;
        apply_log_entries(
            &mut latest,
            &persistent_state.log,
            persistent_state.log.prev_index() + 1,
            persistent_state.log.latest_index(),
        );
        latest_state.set(latest);

        MemberState {
            member_id,
            ps: persistent_state,
            mode: Mode::FollowerUnled,
            committed_state,
            latest_state,
            current_term_leader_id: None,
            current_term_leader_invalid: false,
            last_leader_time: Some(Instant::now()),
            match_indexes: BTreeMap::new(),
            replication_kicks: BTreeMap::new(),
            readiness_for_change,
            readiness_for_config_change,
            change_tokens: BTreeMap::new(),
            quorum_lost_since: None,
            connected,
            leadership_wake_tx,
            log_write_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn begin_log_write(&self) -> LogWriteGuard {
        let already_held = self.log_write_flag.swap(true, Ordering::Acquire);
        assert!(!already_held, "log writes must not interleave");

        LogWriteGuard {
            flag: self.log_write_flag.clone(),
        }
    }

    /// The configuration every decision is made against: the newest one in
    /// the log, committed or not.
    pub fn active_config(&self) -> ComplexConfig {
        self.latest_state.read(|latest| latest.config.clone())
    }

    pub fn commit_index(&self) -> u64 {
        self.committed_state.read(|committed| committed.log_index)
    }

    /// Sets the term and resets all per-term variables. The caller must
    /// flush persistent state before emitting anything that depends on it.
    pub fn update_term(&mut self, new_term: u64) {
        assert!(
            new_term > self.ps.current_term,
            "terms are monotonically increasing"
        );
        self.ps.current_term = new_term;
        self.ps.voted_for = None;
        self.current_term_leader_id = None;
        self.current_term_leader_invalid = false;
    }

    /// Adopts a term greater than ours and demotes to follower. Returns true
    /// if we were leader, in which case the caller broadcasts a step-down
    /// notification. The caller must flush persistent state afterwards.
    pub fn observe_greater_term(&mut self, new_term: u64) -> bool {
        let previous_mode = self.mode;
        self.update_term(new_term);

        match previous_mode {
            Mode::FollowerLed | Mode::Leader => self.become_follower_unled(true),
            Mode::Candidate => self.become_follower_unled(false),
            // Already unled; the election timer keeps counting.
            Mode::FollowerUnled => false,
        }
    }

    /// Transition into the follower-led state after accepting a message from
    /// a live leader.
    pub fn become_follower_led(&mut self, leader_id: MemberId) {
        self.current_term_leader_id = Some(leader_id);
        if self.mode == Mode::FollowerLed {
            return;
        }

        info!(
            "Member {} Status changed to FollowerLed for term {} under leader {}",
            self.member_id, self.ps.current_term, leader_id
        );
        self.leave_leadership();
        self.mode = Mode::FollowerLed;
        self.last_leader_time = None;
        self.update_readiness();
        self.wake_leadership();
    }

    /// Transition into the follower-unled state. Returns true if we were
    /// leader before.
    pub fn become_follower_unled(&mut self, reset_last_leader_time: bool) -> bool {
        let was_leader = self.mode == Mode::Leader;

        if self.mode != Mode::FollowerUnled {
            info!(
                "Member {} Status changed to FollowerUnled for term {}",
                self.member_id, self.ps.current_term
            );
        }
        self.leave_leadership();
        self.mode = Mode::FollowerUnled;
        if reset_last_leader_time || self.last_leader_time.is_none() {
            self.last_leader_time = Some(Instant::now());
        }
        self.update_readiness();
        self.wake_leadership();

        was_leader
    }

    /// Clears every piece of leader-only state, failing outstanding change
    /// tokens. Safe to call in any mode.
    fn leave_leadership(&mut self) {
        self.match_indexes.clear();
        self.replication_kicks.clear();
        self.quorum_lost_since = None;
        self.fail_change_tokens();
    }

    /// Registers a change observer waiting on `log_index` to commit.
    pub fn register_change_token(&mut self, log_index: u64) -> Receiver<bool> {
        assert!(
            self.mode == Mode::Leader,
            "change tokens exist only on the leader"
        );
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.change_tokens.entry(log_index).or_default().push(tx);

        rx
    }

    /// Resolves every token at an index at or below `log_index` with
    /// success.
    pub fn resolve_change_tokens_up_to(&mut self, log_index: u64) {
        let resolved: Vec<u64> = self
            .change_tokens
            .range(..=log_index)
            .map(|(index, _)| *index)
            .collect();
        for index in resolved {
            if let Some(observers) = self.change_tokens.remove(&index) {
                for observer in observers {
                    let _ = observer.send(true);
                }
            }
        }
    }

    /// Resolves every outstanding token with failure. The changes may or may
    /// not commit later.
    pub fn fail_change_tokens(&mut self) {
        let failed: Vec<u64> = self.change_tokens.keys().cloned().collect();
        for index in failed {
            if let Some(observers) = self.change_tokens.remove(&index) {
                for observer in observers {
                    let _ = observer.send(false);
                }
            }
        }
    }

    pub fn kick_replication_workers(&self) {
        for kick in self.replication_kicks.values() {
            let _ = kick.send(());
        }
    }

    pub fn wake_leadership(&self) {
        let _ = self.leadership_wake_tx.send(());
    }

    /// Recomputes the readiness watches and the quorum-loss bookkeeping.
    /// Must be called whenever the mode, the connectivity view, the log or
    /// the commit index changes.
    pub fn update_readiness(&mut self) {
        let is_leader = self.mode == Mode::Leader;
        let config = self.active_config();

        let mut reachable = self.connected.clone();
        reachable.insert(self.member_id);
        let has_quorum = config.is_quorum(&reachable);

        let ready = is_leader && has_quorum;
        let reconfiguring = config.is_joint_consensus()
            || self.ps.log.contains_config_entry_after(self.commit_index());

        self.readiness_for_change.set(ready);
        self.readiness_for_config_change.set(ready && !reconfiguring);

        self.quorum_lost_since = if is_leader && !has_quorum {
            self.quorum_lost_since.or_else(|| Some(Instant::now()))
        } else {
            None
        };
    }

    /// Re-derives `latest_state` from `committed_state` and the log suffix
    /// after the commit index. Correct whenever the committed prefix of the
    /// log is intact, which the protocol guarantees.
    pub fn rebuild_latest_state(&mut self) {
        let mut latest = self.committed_state.get();
        let commit_index = latest.log_index;
        apply_log_entries(
            &mut latest,
            &self.ps.log,
            commit_index + 1,
            self.ps.log.latest_index(),
        );
        self.latest_state.set(latest);
    }

    /// Advances the commit index, applying the newly committed entries to
    /// `committed_state`. The covered entries must already be durable.
    pub fn update_commit_index(&mut self, new_commit_index: u64) {
        let current = self.commit_index();
        assert!(
            new_commit_index >= current,
            "the commit index never regresses"
        );
        assert!(
            new_commit_index <= self.ps.log.latest_index(),
            "cannot commit entries that are not in the log"
        );
        if new_commit_index == current {
            return;
        }

        let mut committed = self.committed_state.get();
        apply_log_entries(&mut committed, &self.ps.log, current + 1, new_commit_index);
        self.committed_state.set(committed);

        trace!(
            "Member {} Commit index advanced to {}",
            self.member_id,
            new_commit_index
        );
        self.update_readiness();
    }
}
