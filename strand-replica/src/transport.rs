//! In-process message fabric.
//!
//! Replicas bind a mailbox on a shared [`Fabric`] and are addressed
//! by [`Pid`]. The fabric carries the full replica wire protocol, so
//! swapping it for a socket transport changes routing, not
//! semantics.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::protocol::ReplicaRequest;

/// Mailbox depth per replica. Senders that observe a full mailbox
/// treat the peer as unreachable.
const MAILBOX_DEPTH: usize = 256;

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Opaque network identity of a bound mailbox.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid {
    id: u64,
    label: Arc<str>,
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.label, self.id)
    }
}

/// Cloneable registry of live mailboxes.
#[derive(Clone, Default)]
pub struct Fabric {
    routes: Arc<RwLock<HashMap<Pid, mpsc::Sender<ReplicaRequest>>>>,
}

impl Fabric {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new mailbox under a fresh [`Pid`].
    pub(crate) fn bind(&self, label: &str) -> (Pid, mpsc::Receiver<ReplicaRequest>) {
        let pid = Pid {
            id: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            label: Arc::from(label),
        };
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        self.routes
            .write()
            .expect("fabric routes lock poisoned")
            .insert(pid.clone(), tx);
        (pid, rx)
    }

    pub(crate) fn unbind(&self, pid: &Pid) {
        self.routes
            .write()
            .expect("fabric routes lock poisoned")
            .remove(pid);
    }

    /// Route a request to `pid`. Returns `false` when the mailbox is
    /// gone or full; the peer counts as unreachable either way.
    pub(crate) fn send(&self, pid: &Pid, request: ReplicaRequest) -> bool {
        let Some(tx) = self
            .routes
            .read()
            .expect("fabric routes lock poisoned")
            .get(pid)
            .cloned()
        else {
            return false;
        };
        tx.try_send(request).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn bind_send_receive() {
        let fabric = Fabric::new();
        let (pid, mut rx) = fabric.bind("replica");

        let (reply, _keep) = oneshot::channel();
        assert!(fabric.send(
            &pid,
            ReplicaRequest::Recover { reply },
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ReplicaRequest::Recover { .. })
        ));
    }

    #[tokio::test]
    async fn send_to_unbound_pid_fails() {
        let fabric = Fabric::new();
        let (pid, rx) = fabric.bind("replica");
        drop(rx);
        fabric.unbind(&pid);

        let (reply, _keep) = oneshot::channel();
        assert!(!fabric.send(&pid, ReplicaRequest::Recover { reply }));
    }

    #[test]
    fn pids_are_unique_and_display_their_label() {
        let fabric = Fabric::new();
        let (a, _rx_a) = fabric.bind("replica");
        let (b, _rx_b) = fabric.bind("replica");
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("replica("));
    }
}
