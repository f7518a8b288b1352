//! The log actor: recovery lifecycle, shared handles, membership.
//!
//! One [`Log`] owns one local replica. On startup the actor joins
//! the replica group (when one is configured), spawns recovery, and
//! queues every reader/writer gate request until recovery resolves.
//! Recovery failure is terminal for the instance; shutdown fails all
//! queued requests and releases the replica and network only after
//! every shared handle has been dropped.

use std::collections::BTreeSet;
use std::path::Path;

use error_stack::Report;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};

use strand_core::{LogError, Owner, Shared};
use strand_replica::replica::Replica;
use strand_replica::{Fabric, Group, Membership, Network, Pid, recover};

/// Everything a gated operation needs once recovery has finished.
pub(crate) struct Recovered {
    pub replica: Shared<Replica>,
    pub network: Shared<Network>,
    pub quorum: usize,
}

/// A failure kept for replay: later gate requests receive the same
/// kind and detail that the original observer saw.
pub(crate) struct StoredFailure {
    kind: LogError,
    detail: String,
}

impl StoredFailure {
    pub(crate) fn of(report: &Report<LogError>) -> Self {
        Self {
            kind: *report.current_context(),
            detail: format!("{report:?}"),
        }
    }

    pub(crate) fn closing(detail: &'static str) -> Self {
        Self {
            kind: LogError::Closing,
            detail: detail.to_owned(),
        }
    }

    pub(crate) fn to_report(&self) -> Report<LogError> {
        Report::new(self.kind).attach(self.detail.clone())
    }
}

pub(crate) enum LogRequest {
    /// Resolve once the local replica is recovered. Readers and
    /// writers gate every operation on this.
    Recover {
        reply: oneshot::Sender<Result<Recovered, Report<LogError>>>,
    },
}

enum RecoveryState {
    Recovering,
    Recovered(Owner<Replica>),
    Failed(StoredFailure),
}

struct LogActor {
    quorum: usize,
    pid: Pid,
    replica: Option<Replica>,
    network: Owner<Network>,
    request_rx: mpsc::Receiver<LogRequest>,
    cancel: CancellationToken,
    recovery: RecoveryState,
    recovery_task: Option<JoinHandle<Result<Replica, Report<LogError>>>>,
    waiters: Vec<oneshot::Sender<Result<Recovered, Report<LogError>>>>,
    group: Option<Group>,
    membership: Option<Membership>,
    membership_rx: Option<watch::Receiver<BTreeSet<Membership>>>,
}

impl LogActor {
    async fn run(mut self) {
        if !self.join_group().await {
            self.fail_waiters(&StoredFailure::closing(
                "log could not join the replica group",
            ));
            self.shutdown().await;
            return;
        }

        let replica = self
            .replica
            .take()
            .expect("the unrecovered replica is exclusively ours");
        self.recovery_task = Some(tokio::spawn(recover(
            self.quorum,
            replica,
            self.network.share(),
        )));

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                result = async { self.recovery_task.as_mut().expect("recovery in flight").await },
                    if self.recovery_task.is_some() =>
                {
                    self.recovery_task = None;
                    self.on_recovery_complete(result);
                }

                changed = async { self.membership_rx.as_mut().expect("watching").changed().await },
                    if self.membership_rx.is_some() =>
                {
                    let renewed = match changed {
                        Ok(()) => self.on_membership_change().await,
                        Err(_) => {
                            error!("the membership registry went away");
                            false
                        }
                    };
                    if !renewed {
                        self.fail_waiters(&StoredFailure::closing(
                            "log lost its replica group membership",
                        ));
                        break;
                    }
                }

                request = self.request_rx.recv() => {
                    let Some(request) = request else { break };
                    self.handle(request);
                }
            }
        }

        self.shutdown().await;
    }

    /// Join the configured group and install the membership watch.
    /// Returns `false` on failure, which is fatal to the actor.
    async fn join_group(&mut self) -> bool {
        let Some(group) = &self.group else {
            return true;
        };

        info!(pid = %self.pid, "joining the replica group");
        match group.join(self.pid.clone()).await {
            Ok(membership) => {
                self.membership = Some(membership);
                self.membership_rx = Some(group.subscribe());
                true
            }
            Err(report) => {
                error!(?report, "failed to join the replica group");
                false
            }
        }
    }

    fn handle(&mut self, request: LogRequest) {
        match request {
            LogRequest::Recover { reply } => match &self.recovery {
                RecoveryState::Recovering => self.waiters.push(reply),
                RecoveryState::Recovered(owner) => {
                    let _ = reply.send(Ok(Recovered {
                        replica: owner.share(),
                        network: self.network.share(),
                        quorum: self.quorum,
                    }));
                }
                RecoveryState::Failed(failure) => {
                    let _ = reply.send(Err(failure.to_report()));
                }
            },
        }
    }

    fn on_recovery_complete(
        &mut self,
        result: Result<Result<Replica, Report<LogError>>, tokio::task::JoinError>,
    ) {
        match result {
            Ok(Ok(replica)) => {
                info!("local replica recovered");
                let owner = Owner::new(replica);
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Ok(Recovered {
                        replica: owner.share(),
                        network: self.network.share(),
                        quorum: self.quorum,
                    }));
                }
                self.recovery = RecoveryState::Recovered(owner);
            }
            Ok(Err(report)) => {
                error!(?report, "replica recovery failed");
                let failure = StoredFailure::of(&report);
                self.fail_waiters(&failure);
                self.recovery = RecoveryState::Failed(failure);
            }
            Err(join_error) => {
                error!(%join_error, "replica recovery stopped unexpectedly");
                let failure = StoredFailure {
                    kind: LogError::RecoveryFailed,
                    detail: join_error.to_string(),
                };
                self.fail_waiters(&failure);
                self.recovery = RecoveryState::Failed(failure);
            }
        }
    }

    /// Rejoin the group when our membership record has expired.
    /// Returns `false` on a failed rejoin, which is fatal.
    async fn on_membership_change(&mut self) -> bool {
        let memberships = self
            .membership_rx
            .as_mut()
            .expect("watching")
            .borrow_and_update()
            .clone();

        let expired = self
            .membership
            .as_ref()
            .is_some_and(|membership| !memberships.contains(membership));
        if !expired {
            return true;
        }

        info!(pid = %self.pid, "renewing replica group membership");
        let group = self.group.as_ref().expect("membership implies a group");
        match group.join(self.pid.clone()).await {
            Ok(membership) => {
                self.membership = Some(membership);
                true
            }
            Err(report) => {
                error!(?report, "failed to renew replica group membership");
                false
            }
        }
    }

    fn fail_waiters(&mut self, failure: &StoredFailure) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(failure.to_report()));
        }
    }

    async fn shutdown(mut self) {
        if let Some(task) = self.recovery_task.take() {
            task.abort();
            let _ = task.await;
        }

        // Late dispatches must observe "closing" rather than wait on
        // a mailbox nobody drains.
        self.request_rx.close();
        while let Ok(request) = self.request_rx.try_recv() {
            let LogRequest::Recover { reply } = request;
            let _ = reply.send(Err(
                StoredFailure::closing("log is being deleted").to_report()
            ));
        }

        self.fail_waiters(&StoredFailure::closing("log is being deleted"));

        if let Some(membership) = self.membership.take()
            && let Some(group) = self.group.take()
        {
            group.cancel(&membership);
        }
        drop(self.membership_rx.take());

        // Release the replica and the network only once nothing else
        // holds them; in-flight reads and proposals finish first.
        if let RecoveryState::Recovered(owner) = self.recovery {
            drop(owner.reclaim().await);
        }
        drop(self.network.reclaim().await);
        debug!("log actor stopped");
    }
}

/// A replicated append-only log backed by a local replica and a
/// quorum of peers.
///
/// Dropping the handle cancels the actor without waiting; use
/// [`close`](Self::close) to wait for an orderly teardown.
pub struct Log {
    request_tx: mpsc::Sender<LogRequest>,
    pid: Pid,
    actor: Option<JoinHandle<()>>,
    cancel_guard: DropGuard,
}

impl Log {
    /// Open a log over a fixed set of peer replicas. The local
    /// replica's own identity is added to the set.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Infrastructure`] if the local replica
    /// cannot be opened or `quorum` is zero.
    pub async fn open(
        quorum: usize,
        path: impl AsRef<Path>,
        fabric: &Fabric,
        peers: impl IntoIterator<Item = Pid>,
    ) -> Result<Self, Report<LogError>> {
        let replica = Self::open_replica(quorum, path, fabric).await?;
        let pid = replica.pid();
        let network = Network::new(
            fabric.clone(),
            peers.into_iter().chain([pid.clone()]),
        );
        Ok(Self::spawn(quorum, pid, replica, network, None))
    }

    /// Open a log whose peer set follows a membership group. The
    /// actor joins the group with the replica's identity and renews
    /// the membership whenever it expires.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Infrastructure`] if the local replica
    /// cannot be opened or `quorum` is zero.
    pub async fn open_with_group(
        quorum: usize,
        path: impl AsRef<Path>,
        fabric: &Fabric,
        group: &Group,
    ) -> Result<Self, Report<LogError>> {
        let replica = Self::open_replica(quorum, path, fabric).await?;
        let pid = replica.pid();
        let network = Network::watching(fabric.clone(), group);
        Ok(Self::spawn(quorum, pid, replica, network, Some(group.clone())))
    }

    async fn open_replica(
        quorum: usize,
        path: impl AsRef<Path>,
        fabric: &Fabric,
    ) -> Result<Replica, Report<LogError>> {
        if quorum == 0 {
            return Err(Report::new(LogError::Infrastructure)
                .attach("quorum must be at least one replica"));
        }
        Replica::open(path, fabric).await
    }

    fn spawn(
        quorum: usize,
        pid: Pid,
        replica: Replica,
        network: Network,
        group: Option<Group>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let actor = LogActor {
            quorum,
            pid: pid.clone(),
            replica: Some(replica),
            network: Owner::new(network),
            request_rx,
            cancel: cancel.clone(),
            recovery: RecoveryState::Recovering,
            recovery_task: None,
            waiters: Vec::new(),
            group,
            membership: None,
            membership_rx: None,
        };
        let actor = tokio::spawn(actor.run());

        Self {
            request_tx,
            pid,
            actor: Some(actor),
            cancel_guard: cancel.drop_guard(),
        }
    }

    /// The local replica's network identity.
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid.clone()
    }

    pub(crate) fn request_tx(&self) -> mpsc::Sender<LogRequest> {
        self.request_tx.clone()
    }

    /// Shut the log down and wait for teardown: pending gated
    /// operations are failed, and the replica and network are
    /// destroyed once no reader, writer, or in-flight operation
    /// still holds them.
    pub async fn close(mut self) {
        self.cancel_guard.disarm().cancel();
        if let Some(actor) = self.actor.take() {
            let _ = actor.await;
        }
    }
}
