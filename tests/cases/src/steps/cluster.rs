use std::sync::Arc;
use std::time::Duration;

use raft_core::{
    new_unavailable_err, Config, MemberConfiguration, MemberId, PersistentState, RaftMember,
};
use raft_core_modules::{CounterState, InProcNetwork, MemoryStorage, RandomizedElectionTimer};

use crate::steps;

/// Short election timeouts keep the cases fast; connectivity-triggered
/// escalation does the heavy lifting anyway.
const CASE_ELECTION_TIMEOUT_MIN_MS: u64 = 150;
const CASE_ELECTION_TIMEOUT_MAX_MS: u64 = 300;

pub type ClusterMember = RaftMember<
    CounterState,
    MemoryStorage<CounterState>,
    InProcNetwork<CounterState>,
    RandomizedElectionTimer,
>;

pub struct ClusterNode {
    pub member_id: MemberId,
    pub member: Arc<ClusterMember>,
    pub storage: MemoryStorage<CounterState>,
}

pub struct CaseCluster {
    pub network: InProcNetwork<CounterState>,
    pub nodes: Vec<ClusterNode>,
    pub founding_config: Config,
}

/// Starts a cluster of `voting_count` voting members over a fresh in-process
/// network.
pub fn start_initial_cluster(voting_count: usize) -> CaseCluster {
    let member_ids: Vec<MemberId> = (0..voting_count).map(|_| MemberId::new()).collect();
    let founding_config = Config::with_voting(member_ids.iter().cloned().collect());
    let network: InProcNetwork<CounterState> = InProcNetwork::new();

    let mut cluster = CaseCluster {
        network,
        nodes: Vec::new(),
        founding_config,
    };
    for member_id in member_ids {
        cluster.add_node(member_id);
    }

    cluster
}

impl CaseCluster {
    /// Starts one more member over this cluster's network. The member boots
    /// from the founding configuration and catches up through replication.
    pub fn add_node(&mut self, member_id: MemberId) -> &ClusterNode {
        let storage = MemoryStorage::new();
        let persistent_state =
            PersistentState::make_initial(CounterState::default(), self.founding_config.clone());
        let member = Arc::new(RaftMember::start(
            MemberConfiguration {
                member_id,
                storage: storage.clone(),
                network: self.network.handle_for(member_id),
                election_timer: RandomizedElectionTimer::new(
                    CASE_ELECTION_TIMEOUT_MIN_MS,
                    CASE_ELECTION_TIMEOUT_MAX_MS,
                ),
            },
            persistent_state,
        ));

        // the network must not keep a dropped member alive
        let dispatch_member = Arc::downgrade(&member);
        self.network.register(member_id, move |request, cancellation| {
            match dispatch_member.upgrade() {
                Some(member) => member.on_rpc(request, cancellation),
                None => new_unavailable_err("member is stopped".to_string()),
            }
        });

        self.nodes.push(ClusterNode {
            member_id,
            member,
            storage,
        });

        self.nodes.last().expect("just pushed")
    }

    pub fn node(&self, member_id: MemberId) -> &ClusterNode {
        self.nodes
            .iter()
            .find(|node| node.member_id == member_id)
            .unwrap_or_else(|| panic!("no node with member id {}", member_id))
    }

    /// Waits until some member reports readiness for changes and returns it.
    pub fn wait_for_leader(&self, timeout: Duration) -> &ClusterNode {
        let all: Vec<MemberId> = self.nodes.iter().map(|node| node.member_id).collect();

        self.wait_for_leader_among(&all, timeout)
    }

    /// Waits until one of the given members reports readiness for changes.
    pub fn wait_for_leader_among(&self, candidates: &[MemberId], timeout: Duration) -> &ClusterNode {
        let found = steps::wait_until(timeout, || {
            self.nodes.iter().any(|node| {
                candidates.contains(&node.member_id) && node.member.readiness_for_change().get()
            })
        });
        assert!(found, "no leader emerged within {:?}", timeout);

        let leader = self
            .nodes
            .iter()
            .find(|node| {
                candidates.contains(&node.member_id) && node.member.readiness_for_change().get()
            })
            .expect("a ready leader was just observed");
        info!("--Case cluster: leader is {}", leader.member_id);

        leader
    }

    /// Waits until every listed member has committed at least `log_index`.
    pub fn wait_for_commit_index_on(
        &self,
        member_ids: &[MemberId],
        log_index: u64,
        timeout: Duration,
    ) {
        let reached = steps::wait_until(timeout, || {
            member_ids.iter().all(|member_id| {
                self.node(*member_id)
                    .member
                    .committed_state()
                    .get()
                    .log_index
                    >= log_index
            })
        });
        assert!(
            reached,
            "not every member reached commit index {} within {:?}",
            log_index, timeout
        );
    }

    pub fn wait_for_commit_index(&self, log_index: u64, timeout: Duration) {
        let all: Vec<MemberId> = self.nodes.iter().map(|node| node.member_id).collect();

        self.wait_for_commit_index_on(&all, log_index, timeout);
    }

    /// Runs the cross-member invariant checks over every running member.
    pub fn check_invariants(&self) {
        let members: Vec<&ClusterMember> =
            self.nodes.iter().map(|node| node.member.as_ref()).collect();

        raft_core::verification::check_invariants(&members);
    }
}
