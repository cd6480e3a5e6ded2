use std::time::Duration;

use raft_core::{Config, MemberId};

use crate::steps;

/// Joint-consensus reconfiguration that replaces the leader: the joint entry
/// commits under both majorities, the final configuration follows, and the
/// excluded leader steps down.
pub fn run() {
    steps::init_logger();
    let mut cluster = steps::cluster::start_initial_cluster(3);

    let old_leader_id = cluster.wait_for_leader(Duration::from_secs(5)).member_id;

    // the new configuration keeps one old non-leader member and brings in
    // two fresh ones, dropping the current leader
    let kept_id = cluster
        .nodes
        .iter()
        .map(|node| node.member_id)
        .find(|member_id| *member_id != old_leader_id)
        .expect("the cluster has more members than the leader");
    let first_new_id = MemberId::new();
    let second_new_id = MemberId::new();
    cluster.add_node(first_new_id);
    cluster.add_node(second_new_id);

    let new_voting: Vec<MemberId> = vec![kept_id, first_new_id, second_new_id];
    let new_config = Config::with_voting(new_voting.iter().cloned().collect());

    let leader = cluster.node(old_leader_id);
    let token =
        steps::data::change_config(leader, new_config.clone()).expect("the leader is ready");
    // the joint entry commits only under majorities of both configurations
    assert!(token.wait());

    // the excluded leader finishes the second phase and steps down
    let demoted = steps::wait_until(Duration::from_secs(10), || {
        !cluster
            .node(old_leader_id)
            .member
            .readiness_for_change()
            .get()
    });
    assert!(demoted, "the excluded leader kept claiming leadership");

    // the members outside the new configuration are done; take them offline
    // so they stop disturbing elections with their retries
    let retired: Vec<Vec<MemberId>> = cluster
        .nodes
        .iter()
        .map(|node| node.member_id)
        .filter(|member_id| !new_voting.contains(member_id))
        .map(|member_id| vec![member_id])
        .collect();
    cluster.network.set_partitions(&retired);

    // the remaining members elect a leader from the new configuration and
    // agree on it being the committed one
    cluster.wait_for_leader_among(&new_voting, Duration::from_secs(10));
    let finalized = steps::wait_until(Duration::from_secs(10), || {
        new_voting.iter().all(|member_id| {
            let config = cluster.node(*member_id).member.committed_state().get().config;
            !config.is_joint_consensus() && config.config == new_config
        })
    });
    assert!(finalized, "the final configuration did not commit everywhere");

    cluster.check_invariants();
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_joint_consensus_reconfiguration() {
        crate::cases::joint_consensus::run()
    }
}
