use std::time::Duration;

use crate::steps;

/// Partition and healing: the majority side elects a fresh leader and keeps
/// committing; the deposed leader's proposal fails and its divergent suffix
/// is truncated once the partition heals.
pub fn run() {
    steps::init_logger();
    let cluster = steps::cluster::start_initial_cluster(3);

    let old_leader_id = {
        let leader = cluster.wait_for_leader(Duration::from_secs(5));
        let token = steps::data::add_delta(leader, 1).expect("the leader accepts the change");
        assert!(token.wait());
        leader.member_id
    };
    cluster.wait_for_commit_index(2, Duration::from_secs(5));

    // cut the leader off from the majority
    cluster.network.isolate(old_leader_id);

    // the old leader still appends locally, but the change must never commit
    let old_leader = cluster.node(old_leader_id);
    let orphaned_token =
        steps::data::add_delta(old_leader, 100).expect("the deposed leader has not noticed yet");

    // the majority side elects a fresh leader and commits
    let majority: Vec<_> = cluster
        .nodes
        .iter()
        .map(|node| node.member_id)
        .filter(|member_id| *member_id != old_leader_id)
        .collect();
    let new_leader = cluster.wait_for_leader_among(&majority, Duration::from_secs(5));
    let token = steps::data::add_delta(new_leader, 2).expect("the new leader accepts the change");
    assert!(token.wait());
    let majority_value = new_leader.member.committed_state().get().state.value();
    assert_eq!(3, majority_value);

    cluster.network.heal();

    // the orphaned proposal fails: its leader lost quorum and was superseded
    assert!(!orphaned_token.wait());

    // everyone converges on the majority history
    let target_index = new_leader.member.committed_state().get().log_index;
    cluster.wait_for_commit_index(target_index, Duration::from_secs(10));
    for node in &cluster.nodes {
        assert_eq!(3, node.member.committed_state().get().state.value());
    }

    cluster.check_invariants();
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_partition_and_healing() {
        crate::cases::partition::run()
    }
}
