//! In-process naming service for replica membership.
//!
//! Stands in for an external registry: replicas [`join`](Group::join)
//! with their network identity, watchers observe the membership set
//! through a `watch` channel, and sessions can be cancelled or
//! expired. One [`Group`] value (and its clones) is one group.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use error_stack::Report;
use tokio::sync::watch;
use tracing::debug;

use strand_core::{LogError, OperationContext};

use crate::transport::Pid;

/// One registered membership session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Membership {
    sequence: u64,
    pid: Pid,
}

impl Membership {
    /// The network identity this session advertises.
    #[must_use]
    pub fn pid(&self) -> &Pid {
        &self.pid
    }
}

struct GroupShared {
    members: watch::Sender<BTreeSet<Membership>>,
    next_sequence: AtomicU64,
    closed: AtomicBool,
}

/// Handle to a membership group. Clones refer to the same group.
#[derive(Clone)]
pub struct Group {
    shared: Arc<GroupShared>,
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl Group {
    #[must_use]
    pub fn new() -> Self {
        let (members, initial) = watch::channel(BTreeSet::new());
        drop(initial);
        Self {
            shared: Arc::new(GroupShared {
                members,
                next_sequence: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register `pid` and return the new session.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Infrastructure`] once the registry has
    /// shut down.
    #[allow(clippy::unused_async)]
    pub async fn join(&self, pid: Pid) -> Result<Membership, Report<LogError>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Report::new(LogError::Infrastructure)
                .attach("the membership registry has shut down")
                .attach(OperationContext::JOINING_GROUP));
        }

        let membership = Membership {
            sequence: self.shared.next_sequence.fetch_add(1, Ordering::Relaxed),
            pid,
        };
        debug!(pid = %membership.pid, sequence = membership.sequence, "joined replica group");
        self.shared.members.send_modify(|members| {
            members.insert(membership.clone());
        });
        Ok(membership)
    }

    /// Withdraw a session deliberately.
    pub fn cancel(&self, membership: &Membership) {
        self.shared.members.send_modify(|members| {
            members.remove(membership);
        });
    }

    /// Drop a session the way a registry timeout would: the member
    /// is removed without its consent and must rejoin. Watchers see
    /// the same transition as [`cancel`](Self::cancel).
    pub fn expire(&self, membership: &Membership) {
        debug!(pid = %membership.pid, sequence = membership.sequence, "expired membership");
        self.cancel(membership);
    }

    /// Observe the membership set. Awaiting `changed()` on the
    /// returned receiver is the watch; re-arming is just awaiting it
    /// again.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<Membership>> {
        self.shared.members.subscribe()
    }

    /// Current membership snapshot.
    #[must_use]
    pub fn members(&self) -> BTreeSet<Membership> {
        self.shared.members.borrow().clone()
    }

    /// Shut the registry down; subsequent joins fail.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Fabric;

    fn pid(fabric: &Fabric) -> Pid {
        let (pid, _rx) = fabric.bind("replica");
        pid
    }

    #[tokio::test]
    async fn join_and_cancel_update_the_set() {
        let fabric = Fabric::new();
        let group = Group::new();

        let membership = group.join(pid(&fabric)).await.unwrap();
        assert_eq!(group.members().len(), 1);
        assert!(group.members().contains(&membership));

        group.cancel(&membership);
        assert!(group.members().is_empty());
    }

    #[tokio::test]
    async fn watch_observes_expiry() {
        let fabric = Fabric::new();
        let group = Group::new();
        let mut watch = group.subscribe();

        let membership = group.join(pid(&fabric)).await.unwrap();
        watch.changed().await.unwrap();
        assert!(watch.borrow_and_update().contains(&membership));

        group.expire(&membership);
        watch.changed().await.unwrap();
        assert!(!watch.borrow_and_update().contains(&membership));
    }

    #[tokio::test]
    async fn rejoin_after_expiry_gets_a_new_session() {
        let fabric = Fabric::new();
        let group = Group::new();
        let pid = pid(&fabric);

        let first = group.join(pid.clone()).await.unwrap();
        group.expire(&first);
        let second = group.join(pid).await.unwrap();

        assert_ne!(first, second);
        assert!(group.members().contains(&second));
    }

    #[tokio::test]
    async fn closed_registry_rejects_joins() {
        let fabric = Fabric::new();
        let group = Group::new();
        group.close();

        let joined = group.join(pid(&fabric)).await;
        assert_eq!(
            *joined.unwrap_err().current_context(),
            LogError::Infrastructure
        );
    }

    #[tokio::test]
    async fn clones_share_the_group() {
        let fabric = Fabric::new();
        let group = Group::new();
        let clone = group.clone();

        let membership = group.join(pid(&fabric)).await.unwrap();
        assert!(clone.members().contains(&membership));
    }
}
