use std::time::Duration;

use crate::steps;

/// Three connected members: a change proposed on the leader reaches every
/// log and commits everywhere.
pub fn run() {
    steps::init_logger();
    let cluster = steps::cluster::start_initial_cluster(3);

    let leader = cluster.wait_for_leader(Duration::from_secs(5));
    let token = steps::data::add_delta(leader, 7).expect("the leader accepts the change");
    assert!(token.wait());

    // index 1 is the leader's no-op, index 2 the change
    cluster.wait_for_commit_index(2, Duration::from_secs(5));
    for node in &cluster.nodes {
        let committed = node.member.committed_state().get();
        assert_eq!(2, committed.log_index);
        assert_eq!(7, committed.state.value());
    }

    cluster.check_invariants();
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_three_member_replication() {
        crate::cases::replication::run()
    }
}
