use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::cancellation::CancellationSignal;
use crate::common::watch::WatchedValue;
use crate::errors::RaftError;
use crate::membership::{ComplexConfig, MemberId};
use crate::operation_log::OperationLog;
use crate::rsm::ReplicatedState;

/// Leadership election vote request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Display)]
#[display(
    fmt = "Term {} Candidate {}, Last log: term {} index {}",
    term,
    candidate_id,
    last_log_term,
    last_log_index
)]
pub struct RequestVoteRequest {
    /// Current elections term.
    pub term: u64,

    /// Member id of the candidate requesting the vote.
    pub candidate_id: MemberId,

    /// Last operation log entry index of the candidate. Can affect the vote
    /// decision.
    pub last_log_index: u64,

    /// Last operation log entry term of the candidate. Can affect the vote
    /// decision.
    pub last_log_term: u64,
}

/// The reply to a leadership election vote request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Display)]
#[display(fmt = "Term {} Vote granted - {}", term, vote_granted)]
pub struct RequestVoteResponse {
    /// Current term of the responder.
    pub term: u64,

    /// Vote decision.
    pub vote_granted: bool,
}

/// Operation log replication request or consistency probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: ReplicatedState", deserialize = "S: ReplicatedState"))]
pub struct AppendEntriesRequest<S: ReplicatedState> {
    /// Current term of the leader.
    pub term: u64,

    /// Current leader id.
    pub leader_id: MemberId,

    /// Log slice to replicate. Its anchor carries what the Raft paper calls
    /// `prevLogIndex` and `prevLogTerm`; the slice can be empty for a pure
    /// consistency probe.
    pub entries: OperationLog<S>,

    /// Current commit index of the leader.
    pub leader_commit: u64,
}

impl<S: ReplicatedState> fmt::Display for AppendEntriesRequest<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Term {} Leader {}, Prev log: term {} index {}, Leader commit {}. Entries - {}",
            self.term,
            self.leader_id,
            self.entries.prev_term(),
            self.entries.prev_index(),
            self.leader_commit,
            self.entries.entry_count()
        )
    }
}

/// Operation log replication reply.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Display)]
#[display(fmt = "Term {} Success - {}", term, success)]
pub struct AppendEntriesResponse {
    /// Current term of the responder. Can convert the sender-leader to
    /// follower.
    pub term: u64,

    /// Consistency check result.
    pub success: bool,
}

/// Snapshot installation request. The snapshot is sent whole; callers that
/// need chunking must layer it above this interface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: ReplicatedState", deserialize = "S: ReplicatedState"))]
pub struct InstallSnapshotRequest<S: ReplicatedState> {
    /// Current term of the leader.
    pub term: u64,

    /// Current leader id.
    pub leader_id: MemberId,

    /// Index of the last entry the snapshot covers.
    pub last_included_index: u64,

    /// Term of the last entry the snapshot covers.
    pub last_included_term: u64,

    /// The snapshotted state machine.
    pub snapshot_state: S,

    /// The configuration as of `last_included_index`.
    pub snapshot_config: ComplexConfig,
}

impl<S: ReplicatedState> fmt::Display for InstallSnapshotRequest<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Term {} Leader {}, Last included: term {} index {}",
            self.term, self.leader_id, self.last_included_term, self.last_included_index
        )
    }
}

/// Snapshot installation reply.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Display)]
#[display(fmt = "Term {}", term)]
pub struct InstallSnapshotResponse {
    /// Current term of the responder.
    pub term: u64,
}

/// Notification that a leader stopped acting as leader. Not part of the Raft
/// paper: leader liveness is deduced from transport connectivity, so a leader
/// that steps down while still connected must tell its peers explicitly.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Display)]
#[display(fmt = "Term {} Leader {}", term, leader_id)]
pub struct StepDownRequest {
    /// The term the sender was acting as leader for.
    pub term: u64,

    /// Member id of the leader that is stepping down.
    pub leader_id: MemberId,
}

/// The (empty) reply to a step-down notification.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize, Display)]
#[display(fmt = "Step down acknowledged")]
pub struct StepDownResponse {}

/// A request one member sends to another, bundling the RPC variants for the
/// convenience of transports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: ReplicatedState", deserialize = "S: ReplicatedState"))]
pub enum RpcRequest<S: ReplicatedState> {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest<S>),
    InstallSnapshot(InstallSnapshotRequest<S>),
    StepDown(StepDownRequest),
}

/// The reply to an `RpcRequest`, variant for variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RpcReply {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
    StepDown(StepDownResponse),
}

/// Network collaborator used to reach peers.
pub trait PeerRequestHandler<S: ReplicatedState>: Clone + Send + Sync + 'static {
    /// Sends a request to the destination member and blocks for the reply.
    /// On `RaftError::PeerUnavailable` the request may or may not have been
    /// delivered; the caller should wait until the destination shows up in
    /// `connected_members` before retrying.
    fn send_rpc(
        &self,
        destination: MemberId,
        request: RpcRequest<S>,
        cancellation: &CancellationSignal,
    ) -> Result<RpcReply, RaftError>;

    /// Live view of the peers an RPC is likely to reach.
    fn connected_members(&self) -> WatchedValue<BTreeSet<MemberId>>;
}
