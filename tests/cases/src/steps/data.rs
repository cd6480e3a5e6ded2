use raft_core::{CancellationSignal, ChangeToken, Config};
use raft_core_modules::CounterChange;

use crate::steps::cluster::ClusterNode;

/// Proposes one counter change on the given node. `None` when the node is
/// not a ready leader.
pub fn add_delta(node: &ClusterNode, delta: i64) -> Option<ChangeToken> {
    let mut change_lock = node.member.change_lock();

    change_lock
        .propose_change(CounterChange { delta }, &CancellationSignal::never())
        .expect("the proposal is not cancelled")
}

/// Proposes a batch of counter changes under a single change lock.
pub fn add_deltas(node: &ClusterNode, deltas: &[i64]) -> Vec<ChangeToken> {
    let mut change_lock = node.member.change_lock();

    deltas
        .iter()
        .map(|delta| {
            change_lock
                .propose_change(CounterChange { delta: *delta }, &CancellationSignal::never())
                .expect("the proposal is not cancelled")
                .expect("the node stayed leader for the whole batch")
        })
        .collect()
}

/// Proposes a configuration change on the given node.
pub fn change_config(node: &ClusterNode, new_config: Config) -> Option<ChangeToken> {
    let mut change_lock = node.member.change_lock();

    change_lock
        .propose_config_change(new_config, &CancellationSignal::never())
        .expect("the proposal is not cancelled")
}
