use std::time::Duration;

use crate::steps;

/// A single-voter cluster commits a change in one round without any peer
/// traffic: index 1 is the leader's no-op, index 2 the change itself.
pub fn run() {
    steps::init_logger();
    let cluster = steps::cluster::start_initial_cluster(1);

    let leader = cluster.wait_for_leader(Duration::from_secs(5));
    let token = steps::data::add_delta(leader, 1).expect("the leader accepts the change");
    assert!(token.wait());
    assert_eq!(2, token.log_index());

    let committed = leader.member.committed_state().get();
    assert_eq!(2, committed.log_index);
    assert_eq!(1, committed.state.value());
    assert_eq!(cluster.founding_config, committed.config.config);
    assert!(!committed.config.is_joint_consensus());

    cluster.check_invariants();
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_single_member_commit() {
        crate::cases::single_member::run()
    }
}
