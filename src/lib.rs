#[macro_use]
extern crate log;
#[macro_use]
extern crate crossbeam_channel;
#[macro_use]
extern crate derive_more;

mod common;
mod communication;
mod configuration;
mod errors;
mod member;
mod membership;
mod operation_log;
mod rsm;
mod storage;

pub mod verification;

pub use common::cancellation::{cancellation, CancellationSignal, Canceller};
pub use common::peer_requester::request_from_peers;
pub use common::watch::WatchedValue;
pub use communication::peers::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    PeerRequestHandler, RequestVoteRequest, RequestVoteResponse, RpcReply, RpcRequest,
    StepDownRequest, StepDownResponse,
};
pub use configuration::{
    ElectionTimer, MemberConfiguration, ELECTION_TIMEOUT_MAX_MS, ELECTION_TIMEOUT_MIN_MS,
};
pub use errors::{new_err, new_multiple_err, new_unavailable_err, RaftError};
pub use member::{ChangeLock, ChangeToken, RaftMember};
pub use membership::{ComplexConfig, Config, MemberId};
pub use operation_log::{EntryContent, LogEntry, OperationLog};
pub use rsm::{apply_log_entries, ReplicatedState, StateAndConfig};
pub use storage::{PersistentState, Storage};
