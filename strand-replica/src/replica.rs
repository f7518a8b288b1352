//! The local replica: persistent action store plus the acceptor
//! task that serves the replica wire protocol.
//!
//! A [`Replica`] is opened exclusively, recovered, and only then
//! shared read-only with readers and writers. The acceptor task is
//! the sole writer of the underlying store once the replica is live;
//! it runs until the last handle to the replica drops.

use std::path::Path;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use strand_core::{Action, LogError, OperationContext};

use crate::protocol::{PromiseResponse, RecoverResponse, ReplicaRequest, WriteResponse};
use crate::storage::ActionStorage;
use crate::transport::{Fabric, Pid};

/// Local persistent store of log actions, addressable by peers
/// through its [`Pid`].
pub struct Replica {
    storage: Arc<ActionStorage>,
    pid: Pid,
    _serve: DropGuard,
}

impl Replica {
    /// Open the store at `path` and start serving the wire protocol
    /// on `fabric`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Infrastructure`] if the store cannot be
    /// opened.
    pub async fn open(path: impl AsRef<Path>, fabric: &Fabric) -> Result<Self, Report<LogError>> {
        let path = path.as_ref().to_owned();
        let storage = tokio::task::spawn_blocking(move || ActionStorage::open_sync(&path))
            .await
            .expect("spawn_blocking panicked")
            .change_context(LogError::Infrastructure)
            .attach(OperationContext::OPENING_STORAGE)?;
        let storage = Arc::new(storage);

        let (pid, request_rx) = fabric.bind("replica");
        let cancel = CancellationToken::new();
        tokio::spawn(serve(
            Arc::clone(&storage),
            fabric.clone(),
            pid.clone(),
            request_rx,
            cancel.clone(),
        ));

        debug!(%pid, "replica serving");
        Ok(Self {
            storage,
            pid,
            _serve: cancel.drop_guard(),
        })
    }

    /// Network identity used for group registration and routing.
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid.clone()
    }

    /// First reader-visible position; 0 when the log is empty.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Infrastructure`] on a storage failure.
    pub async fn beginning(&self) -> Result<u64, Report<LogError>> {
        self.blocking(ActionStorage::beginning).await
    }

    /// Last reader-visible position; 0 when the log is empty.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Infrastructure`] on a storage failure.
    pub async fn ending(&self) -> Result<u64, Report<LogError>> {
        self.blocking(ActionStorage::ending).await
    }

    /// Stored actions in the inclusive range, in position order.
    /// Missing slots are absent; unlearned slots are included so the
    /// reader can reject ranges that cross them.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Infrastructure`] on a storage failure.
    pub async fn read(&self, from: u64, to: u64) -> Result<Vec<Action>, Report<LogError>> {
        self.blocking(move |storage| storage.range(from, to)).await
    }

    /// Highest ballot promised by this replica.
    pub(crate) async fn promised(&self) -> Result<u64, Report<LogError>> {
        self.blocking(ActionStorage::promised).await
    }

    /// Install a quorum-confirmed action directly. Recovery-only:
    /// the replica must not be shared yet.
    pub(crate) async fn install(&self, action: Action) -> Result<(), Report<LogError>> {
        self.blocking(move |storage| storage.apply_learned(action))
            .await
    }

    /// Raise the retention watermark to match an already-truncated
    /// peer. Recovery-only.
    pub(crate) async fn raise_begin(&self, begin: u64) -> Result<(), Report<LogError>> {
        self.blocking(move |storage| storage.raise_begin(begin).map(|_| ()))
            .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, Report<LogError>>
    where
        T: Send + 'static,
        F: FnOnce(&ActionStorage) -> Result<T, fjall::Error> + Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .expect("spawn_blocking panicked")
            .change_context(LogError::Infrastructure)
    }
}

async fn serve(
    storage: Arc<ActionStorage>,
    fabric: Fabric,
    pid: Pid,
    mut request_rx: mpsc::Receiver<ReplicaRequest>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            request = request_rx.recv() => {
                let Some(request) = request else { break };
                handle(&storage, &pid, request).await;
            }
        }
    }

    fabric.unbind(&pid);
    trace!(%pid, "replica stopped serving");
}

async fn handle(storage: &Arc<ActionStorage>, pid: &Pid, request: ReplicaRequest) {
    match request {
        ReplicaRequest::Promise {
            proposal,
            position,
            reply,
        } => {
            let response = run(storage, move |storage| {
                promise(storage, proposal, position)
            })
            .await;
            if let Some(response) = response {
                let _ = reply.send(response);
            }
        }
        ReplicaRequest::Write {
            proposal,
            action,
            reply,
        } => {
            let response = run(storage, move |storage| write(storage, proposal, action)).await;
            if let Some(response) = response {
                let _ = reply.send(response);
            }
        }
        ReplicaRequest::Learned { action, ack } => {
            let position = action.position;
            let applied = run(storage, move |storage| {
                storage.apply_learned(action).map(|()| position)
            })
            .await;
            if applied.is_some()
                && let Some(ack) = ack
            {
                let _ = ack.send(());
            }
        }
        ReplicaRequest::Recover { reply } => {
            let pid = pid.clone();
            let response = run(storage, move |storage| {
                let begin = storage.beginning()?;
                let end = storage.ending()?;
                Ok(RecoverResponse { pid, begin, end })
            })
            .await;
            if let Some(response) = response {
                let _ = reply.send(response);
            }
        }
        ReplicaRequest::Fetch { from, to, reply } => {
            let actions = run(storage, move |storage| {
                let actions = storage.range(from, to)?;
                Ok(actions
                    .into_iter()
                    .filter(|a| a.learned)
                    .collect::<Vec<Action>>())
            })
            .await;
            if let Some(actions) = actions {
                let _ = reply.send(actions);
            }
        }
    }
}

/// Run a storage closure off the async thread. A storage failure is
/// logged and the request goes unanswered; the caller counts this
/// replica as unreachable.
async fn run<T, F>(storage: &Arc<ActionStorage>, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce(&ActionStorage) -> Result<T, fjall::Error> + Send + 'static,
{
    let storage = Arc::clone(storage);
    match tokio::task::spawn_blocking(move || f(&storage))
        .await
        .expect("spawn_blocking panicked")
    {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(%error, "replica storage operation failed");
            None
        }
    }
}

fn promise(
    storage: &ActionStorage,
    proposal: u64,
    position: Option<u64>,
) -> Result<PromiseResponse, fjall::Error> {
    let promised = storage.promised()?;

    let Some(position) = position else {
        // Implicit promise: covers every slot.
        if proposal > promised {
            storage.set_promised(proposal)?;
            return Ok(PromiseResponse::Okay {
                proposal,
                begin: storage.beginning()?,
                end: storage.highest_slot()?.unwrap_or(0),
                action: None,
            });
        }
        return Ok(PromiseResponse::Reject { higher: promised });
    };

    // Explicit promise for one slot.
    if proposal < promised {
        return Ok(PromiseResponse::Reject { higher: promised });
    }
    let mut action = storage.get(position)?.unwrap_or_else(|| Action::bare(position));
    if proposal > action.promised {
        action.promised = proposal;
        storage.put(&action)?;
        let accepted = action.is_performed().then_some(action);
        Ok(PromiseResponse::Okay {
            proposal,
            begin: storage.beginning()?,
            end: storage.highest_slot()?.unwrap_or(0),
            action: accepted,
        })
    } else {
        Ok(PromiseResponse::Reject {
            higher: action.promised,
        })
    }
}

fn write(
    storage: &ActionStorage,
    proposal: u64,
    action: Action,
) -> Result<WriteResponse, fjall::Error> {
    let promised = storage.promised()?;
    if proposal < promised {
        return Ok(WriteResponse::Reject { higher: promised });
    }

    let position = action.position;
    if position < storage.begin()? {
        // The slot was truncated away; the write is moot but not a
        // ballot conflict.
        return Ok(WriteResponse::Okay { position });
    }

    if let Some(existing) = storage.get(position)? {
        if existing.learned {
            return Ok(WriteResponse::Okay { position });
        }
        if existing.promised > proposal {
            return Ok(WriteResponse::Reject {
                higher: existing.promised,
            });
        }
        if let Some(performed) = existing.performed
            && performed > proposal
        {
            return Ok(WriteResponse::Reject { higher: performed });
        }
    }

    storage.put(&Action {
        promised: proposal.max(promised),
        ..action
    })?;
    Ok(WriteResponse::Okay { position })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::oneshot;

    use strand_core::ActionKind;

    use super::*;

    async fn open_replica(dir: &tempfile::TempDir, fabric: &Fabric) -> Replica {
        Replica::open(dir.path(), fabric).await.unwrap()
    }

    async fn request<T>(
        fabric: &Fabric,
        pid: &Pid,
        make: impl FnOnce(oneshot::Sender<T>) -> ReplicaRequest,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        assert!(fabric.send(pid, make(tx)));
        rx.await.expect("replica dropped the request")
    }

    #[tokio::test]
    async fn implicit_promise_grants_and_rejects_by_ballot() {
        let dir = tempfile::tempdir().unwrap();
        let fabric = Fabric::new();
        let replica = open_replica(&dir, &fabric).await;
        let pid = replica.pid();

        let granted = request(&fabric, &pid, |reply| ReplicaRequest::Promise {
            proposal: 1,
            position: None,
            reply,
        })
        .await;
        assert!(matches!(
            granted,
            PromiseResponse::Okay { proposal: 1, begin: 0, end: 0, .. }
        ));

        let rejected = request(&fabric, &pid, |reply| ReplicaRequest::Promise {
            proposal: 1,
            position: None,
            reply,
        })
        .await;
        assert!(matches!(rejected, PromiseResponse::Reject { higher: 1 }));

        assert_eq!(replica.promised().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn write_then_learn_becomes_visible() {
        let dir = tempfile::tempdir().unwrap();
        let fabric = Fabric::new();
        let replica = open_replica(&dir, &fabric).await;
        let pid = replica.pid();

        let action = Action::performed(
            1,
            1,
            ActionKind::Append {
                bytes: Bytes::from_static(b"hello"),
            },
        );

        let written = request(&fabric, &pid, |reply| ReplicaRequest::Write {
            proposal: 1,
            action: action.clone(),
            reply,
        })
        .await;
        assert!(matches!(written, WriteResponse::Okay { position: 1 }));

        // Accepted but unlearned: stored, not reader-visible.
        assert_eq!(replica.ending().await.unwrap(), 0);
        let pending = replica.read(1, 1).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].learned);

        let (ack_tx, ack_rx) = oneshot::channel();
        assert!(fabric.send(
            &pid,
            ReplicaRequest::Learned {
                action: action.into_learned(),
                ack: Some(ack_tx),
            },
        ));
        ack_rx.await.unwrap();

        assert_eq!(replica.beginning().await.unwrap(), 1);
        assert_eq!(replica.ending().await.unwrap(), 1);
        let learned = replica.read(1, 1).await.unwrap();
        assert!(learned[0].learned);
        assert_eq!(learned[0].append_bytes().unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn write_rejected_by_higher_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let fabric = Fabric::new();
        let replica = open_replica(&dir, &fabric).await;
        let pid = replica.pid();

        let granted = request(&fabric, &pid, |reply| ReplicaRequest::Promise {
            proposal: 5,
            position: None,
            reply,
        })
        .await;
        assert!(matches!(granted, PromiseResponse::Okay { .. }));

        let rejected = request(&fabric, &pid, |reply| ReplicaRequest::Write {
            proposal: 3,
            action: Action::performed(1, 3, ActionKind::Nop),
            reply,
        })
        .await;
        assert!(matches!(rejected, WriteResponse::Reject { higher: 5 }));
    }

    #[tokio::test]
    async fn explicit_promise_returns_the_accepted_value() {
        let dir = tempfile::tempdir().unwrap();
        let fabric = Fabric::new();
        let replica = open_replica(&dir, &fabric).await;
        let pid = replica.pid();

        let action = Action::performed(
            2,
            1,
            ActionKind::Append {
                bytes: Bytes::from_static(b"kept"),
            },
        );
        let written = request(&fabric, &pid, |reply| ReplicaRequest::Write {
            proposal: 1,
            action,
            reply,
        })
        .await;
        assert!(matches!(written, WriteResponse::Okay { .. }));

        let response = request(&fabric, &pid, |reply| ReplicaRequest::Promise {
            proposal: 2,
            position: Some(2),
            reply,
        })
        .await;
        let PromiseResponse::Okay { action: Some(accepted), .. } = response else {
            panic!("expected a grant carrying the accepted value");
        };
        assert_eq!(accepted.append_bytes().unwrap().as_ref(), b"kept");
    }

    #[tokio::test]
    async fn recover_and_fetch_serve_the_learned_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let fabric = Fabric::new();
        let replica = open_replica(&dir, &fabric).await;
        let pid = replica.pid();

        for position in 1..=2 {
            let action = Action::performed(
                position,
                1,
                ActionKind::Append {
                    bytes: Bytes::from(format!("e{position}")),
                },
            )
            .into_learned();
            replica.install(action).await.unwrap();
        }
        // An unlearned tail slot is excluded from recovery.
        let (tx, rx) = oneshot::channel();
        assert!(fabric.send(
            &pid,
            ReplicaRequest::Write {
                proposal: 1,
                action: Action::performed(3, 1, ActionKind::Nop),
                reply: tx,
            },
        ));
        rx.await.unwrap();

        let report = request(&fabric, &pid, |reply| ReplicaRequest::Recover { reply }).await;
        assert_eq!(report.begin, 1);
        assert_eq!(report.end, 2);
        assert_eq!(report.pid, pid);

        let fetched = request(&fabric, &pid, |reply| ReplicaRequest::Fetch {
            from: 1,
            to: 3,
            reply,
        })
        .await;
        assert_eq!(fetched.len(), 2);
        assert!(fetched.iter().all(|a| a.learned));
    }

    #[tokio::test]
    async fn dropping_the_replica_stops_the_acceptor() {
        let dir = tempfile::tempdir().unwrap();
        let fabric = Fabric::new();
        let replica = open_replica(&dir, &fabric).await;
        let pid = replica.pid();
        drop(replica);

        // The serve task unbinds on cancellation; give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (tx, _rx) = oneshot::channel();
        assert!(!fabric.send(&pid, ReplicaRequest::Recover { reply: tx }));
    }
}
