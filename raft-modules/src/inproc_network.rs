use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use raft_core::{
    new_unavailable_err, CancellationSignal, MemberId, PeerRequestHandler, RaftError,
    ReplicatedState, RpcReply, RpcRequest, WatchedValue,
};

type RpcHandler<S> =
    Arc<dyn Fn(RpcRequest<S>, &CancellationSignal) -> Result<RpcReply, RaftError> + Send + Sync>;

/// In-process network of Raft members with partition control.
///
/// One `InProcNetwork` models the whole transport; every member gets its own
/// handle through `handle_for`, which pins the local member id so that
/// partition checks and the connectivity view apply to the right endpoint.
/// Requests are dispatched by calling the destination's registered handler
/// on the caller's thread.
pub struct InProcNetwork<S: ReplicatedState> {
    local_member_id: Option<MemberId>,
    inner: Arc<Mutex<NetworkInner<S>>>,
}

struct NetworkInner<S: ReplicatedState> {
    handlers: HashMap<MemberId, RpcHandler<S>>,
    partition_groups: HashMap<MemberId, u32>,
    next_isolation_group: u32,
    views: HashMap<MemberId, WatchedValue<BTreeSet<MemberId>>>,
}

impl<S: ReplicatedState> Clone for InProcNetwork<S> {
    fn clone(&self) -> InProcNetwork<S> {
        InProcNetwork {
            local_member_id: self.local_member_id,
            inner: self.inner.clone(),
        }
    }
}

impl<S: ReplicatedState> InProcNetwork<S> {
    pub fn new() -> InProcNetwork<S> {
        InProcNetwork {
            local_member_id: None,
            inner: Arc::new(Mutex::new(NetworkInner {
                handlers: HashMap::new(),
                partition_groups: HashMap::new(),
                next_isolation_group: 1,
                views: HashMap::new(),
            })),
        }
    }

    /// A handle bound to one member. Members must use their own handle so
    /// partitions cut both their outbound requests and their connectivity
    /// view.
    pub fn handle_for(&self, member_id: MemberId) -> InProcNetwork<S> {
        {
            let mut inner = self.lock_inner();
            inner
                .views
                .entry(member_id)
                .or_insert_with(|| WatchedValue::new(BTreeSet::new()));
        }

        InProcNetwork {
            local_member_id: Some(member_id),
            inner: self.inner.clone(),
        }
    }

    /// Registers the inbound dispatch function of a member, connecting it to
    /// everybody in its partition group.
    pub fn register<F>(&self, member_id: MemberId, handler: F)
    where
        F: Fn(RpcRequest<S>, &CancellationSignal) -> Result<RpcReply, RaftError>
            + Send
            + Sync
            + 'static,
    {
        let mut inner = self.lock_inner();
        inner.handlers.insert(member_id, Arc::new(handler));
        inner.partition_groups.entry(member_id).or_insert(0);
        inner
            .views
            .entry(member_id)
            .or_insert_with(|| WatchedValue::new(BTreeSet::new()));
        inner.recompute_views();
        debug!("Network: member {} registered", member_id);
    }

    /// Disconnects a member for good, as if its process died.
    pub fn unregister(&self, member_id: MemberId) {
        let mut inner = self.lock_inner();
        inner.handlers.remove(&member_id);
        inner.recompute_views();
        debug!("Network: member {} unregistered", member_id);
    }

    /// Splits the network into the given groups. Members of different groups
    /// cannot reach each other. Members not mentioned keep their group.
    pub fn set_partitions(&self, groups: &[Vec<MemberId>]) {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        for (group_number, group) in groups.iter().enumerate() {
            let fresh_group = inner.next_isolation_group + group_number as u32;
            for member_id in group {
                inner.partition_groups.insert(*member_id, fresh_group);
            }
        }
        inner.next_isolation_group += groups.len() as u32;
        inner.recompute_views();
        info!("Network: partitioned into {} groups", groups.len());
    }

    /// Cuts one member off from everybody else.
    pub fn isolate(&self, member_id: MemberId) {
        self.set_partitions(&[vec![member_id]]);
    }

    /// Removes every partition.
    pub fn heal(&self) {
        let mut inner = self.lock_inner();
        let members: Vec<MemberId> = inner.partition_groups.keys().cloned().collect();
        for member_id in members {
            inner.partition_groups.insert(member_id, 0);
        }
        inner.recompute_views();
        info!("Network: partitions healed");
    }

    fn lock_inner(&self) -> MutexGuard<NetworkInner<S>> {
        self.inner.lock().expect("network lock is not poisoned")
    }
}

impl<S: ReplicatedState> NetworkInner<S> {
    fn group_of(&self, member_id: &MemberId) -> u32 {
        self.partition_groups.get(member_id).copied().unwrap_or(0)
    }

    fn reachable(&self, from: &MemberId, to: &MemberId) -> bool {
        self.handlers.contains_key(to) && self.group_of(from) == self.group_of(to)
    }

    fn recompute_views(&self) {
        for (member_id, view) in &self.views {
            let connected: BTreeSet<MemberId> = self
                .handlers
                .keys()
                .filter(|peer_id| *peer_id != member_id)
                .filter(|peer_id| self.group_of(peer_id) == self.group_of(member_id))
                .cloned()
                .collect();
            view.set(connected);
        }
    }
}

impl<S: ReplicatedState> PeerRequestHandler<S> for InProcNetwork<S> {
    fn send_rpc(
        &self,
        destination: MemberId,
        request: RpcRequest<S>,
        cancellation: &CancellationSignal,
    ) -> Result<RpcReply, RaftError> {
        let local_member_id = self
            .local_member_id
            .expect("send_rpc requires a member-bound handle");

        // Resolve under the lock, dispatch outside it: the destination's
        // handler takes its own member mutex.
        let handler = {
            let inner = self.lock_inner();
            if !inner.reachable(&local_member_id, &destination) {
                return new_unavailable_err(format!(
                    "member {} is unreachable from {}",
                    destination, local_member_id
                ));
            }
            inner.handlers[&destination].clone()
        };

        if cancellation.is_cancelled() {
            return Err(RaftError::Cancelled);
        }

        handler(request, cancellation)
    }

    fn connected_members(&self) -> WatchedValue<BTreeSet<MemberId>> {
        let local_member_id = self
            .local_member_id
            .expect("connected_members requires a member-bound handle");
        let inner = self.lock_inner();

        inner.views[&local_member_id].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter_state::CounterState;
    use raft_core::StepDownRequest;

    fn step_down_request(leader_id: MemberId) -> RpcRequest<CounterState> {
        RpcRequest::StepDown(StepDownRequest { term: 1, leader_id })
    }

    #[test]
    fn dispatches_to_the_registered_handler() {
        let network: InProcNetwork<CounterState> = InProcNetwork::new();
        let sender = MemberId::new();
        let receiver = MemberId::new();
        network.register(receiver, |_request, _cancellation| {
            Ok(RpcReply::StepDown(Default::default()))
        });

        let handle = network.handle_for(sender);
        network.register(sender, |_request, _cancellation| {
            Ok(RpcReply::StepDown(Default::default()))
        });

        let reply = handle.send_rpc(
            receiver,
            step_down_request(sender),
            &CancellationSignal::never(),
        );

        assert!(reply.is_ok());
    }

    #[test]
    fn partitioned_members_cannot_reach_each_other() {
        let network: InProcNetwork<CounterState> = InProcNetwork::new();
        let left = MemberId::new();
        let right = MemberId::new();
        network.register(left, |_request, _cancellation| {
            Ok(RpcReply::StepDown(Default::default()))
        });
        network.register(right, |_request, _cancellation| {
            Ok(RpcReply::StepDown(Default::default()))
        });

        network.set_partitions(&[vec![left], vec![right]]);

        let handle = network.handle_for(left);
        let reply = handle.send_rpc(
            right,
            step_down_request(left),
            &CancellationSignal::never(),
        );
        assert!(reply.is_err());
        assert!(handle.connected_members().get().is_empty());

        network.heal();
        assert!(handle.connected_members().get().contains(&right));
    }

    #[test]
    fn connectivity_view_excludes_the_local_member() {
        let network: InProcNetwork<CounterState> = InProcNetwork::new();
        let first = MemberId::new();
        let second = MemberId::new();
        let handle = network.handle_for(first);
        network.register(first, |_request, _cancellation| {
            Ok(RpcReply::StepDown(Default::default()))
        });
        network.register(second, |_request, _cancellation| {
            Ok(RpcReply::StepDown(Default::default()))
        });

        let connected = handle.connected_members().get();

        assert!(!connected.contains(&first));
        assert!(connected.contains(&second));
    }
}
