use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::common::cancellation::CancellationSignal;
use crate::communication::peers::PeerRequestHandler;
use crate::configuration::ElectionTimer;
use crate::errors::RaftError;
use crate::membership::{ComplexConfig, Config};
use crate::operation_log::{EntryContent, LogEntry};
use crate::rsm::{ReplicatedState, StateAndConfig};
use crate::storage::Storage;

use super::leadership::{leader_append_log_entry, leader_try_advance_commit};
use super::state::{MemberState, Mode};
use super::MemberShared;

/// Tracks the outcome of a proposed change.
///
/// Resolves exactly once: with success once the entry committed under the
/// leader that appended it, with failure if that leader stepped down or lost
/// quorum first. Failure does not preclude the change from committing later
/// anyway.
pub struct ChangeToken {
    log_index: u64,
    result_rx: Receiver<bool>,
}

impl ChangeToken {
    pub(crate) fn new(log_index: u64, result_rx: Receiver<bool>) -> ChangeToken {
        ChangeToken {
            log_index,
            result_rx,
        }
    }

    /// The log index the proposed change was appended at.
    pub fn log_index(&self) -> u64 {
        self.log_index
    }

    /// Blocks until the change resolves.
    pub fn wait(&self) -> bool {
        self.result_rx.recv().unwrap_or(false)
    }

    /// Blocks until the change resolves or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        self.result_rx.recv_timeout(timeout).ok()
    }

    /// Returns the resolution if it already happened.
    pub fn try_result(&self) -> Option<bool> {
        self.result_rx.try_recv().ok()
    }
}

/// Exclusive scope for proposing changes.
///
/// Holding the lock blocks the member's normal mutation, so `latest_state`
/// cannot move between acquisition and a propose call. Several data changes
/// may be proposed under one lock but no more than one configuration change.
pub struct ChangeLock<'a, S, St, Net, Et>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    state: MutexGuard<'a, MemberState<S>>,
    shared: &'a Arc<MemberShared<S, St, Net, Et>>,
    config_change_proposed: bool,
}

impl<'a, S, St, Net, Et> ChangeLock<'a, S, St, Net, Et>
where
    S: ReplicatedState,
    St: Storage<S>,
    Net: PeerRequestHandler<S>,
    Et: ElectionTimer,
{
    pub(crate) fn new(
        state: MutexGuard<'a, MemberState<S>>,
        shared: &'a Arc<MemberShared<S, St, Net, Et>>,
    ) -> ChangeLock<'a, S, St, Net, Et> {
        ChangeLock {
            state,
            shared,
            config_change_proposed: false,
        }
    }

    /// The state the next proposed change would be applied to.
    pub fn latest_state(&self) -> StateAndConfig<S> {
        self.state.latest_state.get()
    }

    /// Appends a state machine change to the log if this member is leader.
    /// Returns `None` when it is not; the caller should retry against the
    /// current leader.
    pub fn propose_change(
        &mut self,
        change: S::Change,
        cancellation: &CancellationSignal,
    ) -> Result<Option<ChangeToken>, RaftError> {
        if self.state.mode != Mode::Leader {
            debug!(
                "Member {} Rejected change proposal: not a leader",
                self.shared.member_id
            );
            return Ok(None);
        }

        let entry = LogEntry::new(self.state.ps.current_term, EntryContent::Data(change));
        let log_index =
            leader_append_log_entry(&mut self.state, &self.shared.storage, entry, cancellation)?;
        let result_rx = self.state.register_change_token(log_index);
        leader_try_advance_commit(&mut self.state, &self.shared.storage, cancellation)?;

        Ok(Some(ChangeToken::new(log_index, result_rx)))
    }

    /// Starts a joint-consensus reconfiguration toward `new_config` if this
    /// member is a ready leader. The token resolves when the joint entry
    /// commits; the leadership worker then drives the second phase.
    ///
    /// At most one configuration change may be proposed per lock.
    pub fn propose_config_change(
        &mut self,
        new_config: Config,
        cancellation: &CancellationSignal,
    ) -> Result<Option<ChangeToken>, RaftError> {
        assert!(
            !self.config_change_proposed,
            "at most one configuration change per change lock"
        );

        if self.state.mode != Mode::Leader || !self.state.readiness_for_config_change.get() {
            debug!(
                "Member {} Rejected configuration change proposal: not ready",
                self.shared.member_id
            );
            return Ok(None);
        }

        let active_config = self.state.active_config();
        assert!(
            !active_config.is_joint_consensus(),
            "readiness excludes an active joint consensus"
        );
        let joint = ComplexConfig::joint(active_config.config, new_config);
        info!(
            "Member {} Starting reconfiguration toward {:?}",
            self.shared.member_id,
            joint.new_config.as_ref().expect("just built as joint")
        );

        let entry = LogEntry::new(self.state.ps.current_term, EntryContent::NewConfig(joint));
        let log_index =
            leader_append_log_entry(&mut self.state, &self.shared.storage, entry, cancellation)?;
        let result_rx = self.state.register_change_token(log_index);
        leader_try_advance_commit(&mut self.state, &self.shared.storage, cancellation)?;
        self.config_change_proposed = true;

        Ok(Some(ChangeToken::new(log_index, result_rx)))
    }
}
