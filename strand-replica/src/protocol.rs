//! Wire protocol between coordinators/recovery and replicas.

use tokio::sync::oneshot;

use strand_core::Action;

use crate::transport::Pid;

/// Requests served by a replica's acceptor task.
#[derive(Debug)]
pub(crate) enum ReplicaRequest {
    /// Phase-1 ballot request. `position: None` is the implicit
    /// promise used by elections and covers every slot; `Some` asks
    /// for one slot and returns its accepted value for catch-up.
    Promise {
        proposal: u64,
        position: Option<u64>,
        reply: oneshot::Sender<PromiseResponse>,
    },
    /// Phase-2 accept request for one slot.
    Write {
        proposal: u64,
        action: Action,
        reply: oneshot::Sender<WriteResponse>,
    },
    /// A quorum has confirmed this action. Acknowledged only when an
    /// ack channel is supplied.
    Learned {
        action: Action,
        ack: Option<oneshot::Sender<()>>,
    },
    /// Report the learned range boundaries for peer recovery.
    Recover {
        reply: oneshot::Sender<RecoverResponse>,
    },
    /// Return the learned actions in `[from, to]`.
    Fetch {
        from: u64,
        to: u64,
        reply: oneshot::Sender<Vec<Action>>,
    },
}

#[derive(Debug)]
pub(crate) enum PromiseResponse {
    Okay {
        proposal: u64,
        /// First position this replica still holds.
        begin: u64,
        /// Highest slot this replica has stored, learned or not.
        end: u64,
        /// For explicit promises: the slot's accepted value, if any.
        action: Option<Action>,
    },
    Reject {
        /// The ballot that outranks the request.
        higher: u64,
    },
}

#[derive(Debug)]
pub(crate) enum WriteResponse {
    Okay { position: u64 },
    Reject { higher: u64 },
}

#[derive(Debug)]
pub(crate) struct RecoverResponse {
    pub pid: Pid,
    pub begin: u64,
    pub end: u64,
}
