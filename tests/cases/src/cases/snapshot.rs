use std::time::Duration;

use raft_core::{CancellationSignal, Config, MemberId};

use crate::steps;

/// Log compaction and snapshot installation: after a long committed history
/// is folded into the snapshot, a freshly joined member catches up through
/// InstallSnapshot instead of entry-by-entry replication.
pub fn run() {
    steps::init_logger();
    let mut cluster = steps::cluster::start_initial_cluster(3);

    let leader_id = {
        let leader = cluster.wait_for_leader(Duration::from_secs(5));

        // a long committed history, batched under one change lock
        let deltas = vec![1i64; 1000];
        let tokens = steps::data::add_deltas(leader, &deltas);
        assert!(tokens.last().expect("batch is not empty").wait());
        leader.member_id
    };
    // index 1 is the no-op, indexes 2..=1001 the changes
    cluster.wait_for_commit_index(1001, Duration::from_secs(30));

    // the embedder asks for compaction once the log has grown
    let leader = cluster.node(leader_id);
    leader
        .member
        .compact_log(&CancellationSignal::never())
        .expect("compaction is not cancelled");
    let compacted = leader.storage.stored_state().expect("compaction flushed");
    assert_eq!(1001, compacted.log().prev_index());
    assert_eq!(0, compacted.log().latest_index() - compacted.log().prev_index());

    // a new member joins through a configuration change
    let new_member_id = MemberId::new();
    cluster.add_node(new_member_id);
    let mut voting = cluster.founding_config.voting.clone();
    voting.insert(new_member_id);

    let leader = cluster.node(leader_id);
    let token = steps::data::change_config(leader, Config::with_voting(voting.clone()))
        .expect("the leader is ready for a configuration change");
    assert!(token.wait());

    // the reconfiguration finishes on every member
    let finalized = steps::wait_until(Duration::from_secs(30), || {
        cluster.nodes.iter().all(|node| {
            let config = node.member.committed_state().get().config;
            !config.is_joint_consensus() && config.config.voting == voting
        })
    });
    assert!(finalized, "the final configuration did not commit everywhere");

    // the newcomer was behind the leader's log anchor, so it must have been
    // caught up with a snapshot followed by ordinary replication
    let newcomer = cluster.node(new_member_id);
    let newcomer_state = newcomer.member.committed_state().get();
    assert_eq!(1000, newcomer_state.state.value());
    assert_eq!(voting, newcomer_state.config.config.voting);
    let newcomer_stored = newcomer.storage.stored_state().expect("snapshot flushed");
    assert!(
        newcomer_stored.log().prev_index() >= 1001,
        "the newcomer started from a snapshot, not from index zero"
    );

    cluster.check_invariants();
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_snapshot_install() {
        crate::cases::snapshot::run()
    }
}
