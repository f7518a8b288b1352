//! The peer set a coordinator broadcasts to.
//!
//! A [`Network`] resolves "the current quorum set" to concrete
//! [`Pid`]s over a shared [`Fabric`]. The static constructor fixes
//! the set at creation; the watching constructor mirrors a
//! [`Group`]'s membership so the set follows the registry.

use std::collections::BTreeSet;

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use crate::group::Group;
use crate::protocol::ReplicaRequest;
use crate::transport::{Fabric, Pid};

pub struct Network {
    fabric: Fabric,
    peers: watch::Receiver<BTreeSet<Pid>>,
    _keeper: Keeper,
}

/// Keeps the peer channel's sender side alive.
enum Keeper {
    Static(#[allow(dead_code)] watch::Sender<BTreeSet<Pid>>),
    Watching(#[allow(dead_code)] DropGuard),
}

impl Network {
    /// A fixed peer set.
    #[must_use]
    pub fn new(fabric: Fabric, pids: impl IntoIterator<Item = Pid>) -> Self {
        let (sender, peers) = watch::channel(pids.into_iter().collect());
        Self {
            fabric,
            peers,
            _keeper: Keeper::Static(sender),
        }
    }

    /// A peer set that follows `group`'s membership.
    #[must_use]
    pub fn watching(fabric: Fabric, group: &Group) -> Self {
        let initial: BTreeSet<Pid> = group.members().iter().map(|m| m.pid().clone()).collect();
        let (sender, peers) = watch::channel(initial);
        let cancel = CancellationToken::new();
        tokio::spawn(mirror_membership(group.clone(), sender, cancel.clone()));
        Self {
            fabric,
            peers,
            _keeper: Keeper::Watching(cancel.drop_guard()),
        }
    }

    /// Snapshot of the current peer set.
    pub(crate) fn pids(&self) -> BTreeSet<Pid> {
        self.peers.borrow().clone()
    }

    /// Route a request to one peer. `false` means unreachable.
    pub(crate) fn send(&self, pid: &Pid, request: ReplicaRequest) -> bool {
        self.fabric.send(pid, request)
    }

    /// Suspend until at least `quorum` peers are known.
    pub(crate) async fn watch_quorum(&self, quorum: usize) {
        let mut peers = self.peers.clone();
        let _ = peers.wait_for(|pids| pids.len() >= quorum).await;
    }
}

async fn mirror_membership(
    group: Group,
    peers: watch::Sender<BTreeSet<Pid>>,
    cancel: CancellationToken,
) {
    let mut memberships = group.subscribe();
    loop {
        let pids: BTreeSet<Pid> = memberships
            .borrow_and_update()
            .iter()
            .map(|m| m.pid().clone())
            .collect();
        if *peers.borrow() != pids {
            debug!(peers = pids.len(), "membership changed, updating peer set");
            peers.send_replace(pids);
        }

        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            changed = memberships.changed() => {
                if changed.is_err() {
                    // Registry gone; keep the last known set until
                    // the network itself is dropped.
                    cancel.cancelled().await;
                    break;
                }
            }
        }
    }
    trace!("membership mirror stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn static_network_knows_its_peers() {
        let fabric = Fabric::new();
        let (a, _rx_a) = fabric.bind("replica");
        let (b, _rx_b) = fabric.bind("replica");

        let network = Network::new(fabric, [a.clone(), b.clone()]);
        let pids = network.pids();
        assert_eq!(pids.len(), 2);
        assert!(pids.contains(&a));
        assert!(pids.contains(&b));
    }

    #[tokio::test]
    async fn watch_quorum_resolves_once_enough_peers_join() {
        let fabric = Fabric::new();
        let group = Group::new();
        let network = Network::watching(fabric.clone(), &group);

        let pending =
            tokio::time::timeout(Duration::from_millis(20), network.watch_quorum(2)).await;
        assert!(pending.is_err(), "quorum must not be visible yet");

        let (a, _rx_a) = fabric.bind("replica");
        let (b, _rx_b) = fabric.bind("replica");
        group.join(a).await.unwrap();
        group.join(b).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), network.watch_quorum(2))
            .await
            .expect("quorum should become visible");
    }

    #[tokio::test]
    async fn watching_network_drops_expired_members() {
        let fabric = Fabric::new();
        let group = Group::new();
        let (a, _rx_a) = fabric.bind("replica");
        let membership = group.join(a.clone()).await.unwrap();

        let network = Network::watching(fabric, &group);
        network.watch_quorum(1).await;
        assert!(network.pids().contains(&a));

        group.expire(&membership);
        let mut peers = network.peers.clone();
        tokio::time::timeout(
            Duration::from_secs(1),
            peers.wait_for(std::collections::BTreeSet::is_empty),
        )
        .await
        .expect("peer set should empty out")
        .unwrap();
    }
}
