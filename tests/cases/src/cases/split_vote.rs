use std::time::Duration;

use crate::steps;

/// Split votes in an even-sized cluster: while every member is isolated no
/// election can win and terms keep climbing; after healing the randomized
/// timeouts let exactly one member win within a bounded number of retries.
pub fn run() {
    steps::init_logger();
    let cluster = steps::cluster::start_initial_cluster(4);

    let everybody: Vec<Vec<_>> = cluster
        .nodes
        .iter()
        .map(|node| vec![node.member_id])
        .collect();
    cluster.network.set_partitions(&everybody);

    // give everyone time to become a candidate a few times over
    steps::sleep_ms(1000);
    for node in &cluster.nodes {
        assert!(
            !node.member.readiness_for_change().get(),
            "nobody can win an election alone"
        );
    }

    cluster.network.heal();

    // candidates racing out of the partition can still depose each other a
    // few times; a committed change marks the end of the squabble
    let mut committed = false;
    for _ in 0..20 {
        let leader = cluster.wait_for_leader(Duration::from_secs(10));
        if let Some(token) = steps::data::add_delta(leader, 5) {
            if token.wait() {
                committed = true;
                break;
            }
        }
        steps::sleep_ms(100);
    }
    assert!(committed, "no change committed after the partition healed");

    let settled = steps::wait_until(Duration::from_secs(10), || {
        let ready_count = cluster
            .nodes
            .iter()
            .filter(|node| node.member.readiness_for_change().get())
            .count();
        ready_count == 1
    });
    assert!(settled, "exactly one member ends up leading");

    // election safety across the whole cluster
    cluster.check_invariants();
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_split_vote_recovery() {
        crate::cases::split_vote::run()
    }
}
