//! Read access to the recovered log.
//!
//! Every operation gates on the log's recovery: requests that arrive
//! before the gate opens are parked in order and dispatched (or
//! failed) when it transitions. Once open, each read runs as its own
//! task over the shared replica, so reads proceed in parallel and
//! teardown waits for them.

use std::time::Duration;

use error_stack::Report;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use strand_core::{Action, LogError, OperationContext, Shared};
use strand_replica::replica::Replica;

use crate::log::{Log, LogRequest, Recovered, StoredFailure};
use crate::position::{Entry, Position};

enum ReaderRequest {
    Beginning {
        reply: oneshot::Sender<Result<Position, Report<LogError>>>,
    },
    Ending {
        reply: oneshot::Sender<Result<Position, Report<LogError>>>,
    },
    Read {
        from: Position,
        to: Position,
        reply: oneshot::Sender<Result<Vec<Entry>, Report<LogError>>>,
    },
}

enum Gate {
    Waiting,
    Open(Shared<Replica>),
    Failed(StoredFailure),
}

struct ReaderActor {
    log_tx: mpsc::Sender<LogRequest>,
    request_rx: mpsc::Receiver<ReaderRequest>,
    cancel: CancellationToken,
    gate_rx: Option<oneshot::Receiver<Result<Recovered, Report<LogError>>>>,
    gate: Gate,
    parked: Vec<ReaderRequest>,
}

impl ReaderActor {
    async fn run(mut self) {
        let (reply, gate_rx) = oneshot::channel();
        if self
            .log_tx
            .send(LogRequest::Recover { reply })
            .await
            .is_ok()
        {
            self.gate_rx = Some(gate_rx);
        } else {
            self.gate = Gate::Failed(StoredFailure::closing("log is being deleted"));
        }

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                result = async { self.gate_rx.as_mut().expect("gate pending").await },
                    if self.gate_rx.is_some() =>
                {
                    self.gate_rx = None;
                    self.on_gate(result);
                }

                request = self.request_rx.recv() => {
                    let Some(request) = request else { break };
                    self.handle(request);
                }
            }
        }

        let closing = StoredFailure::closing("log reader is being deleted");
        for request in self.parked.drain(..) {
            fail(request, &closing);
        }
    }

    fn on_gate(
        &mut self,
        result: Result<Result<Recovered, Report<LogError>>, oneshot::error::RecvError>,
    ) {
        match result {
            Ok(Ok(recovered)) => {
                debug!("reader gate open");
                // Only the replica is read from; the network share
                // is released immediately.
                let replica = recovered.replica;
                for request in self.parked.drain(..) {
                    dispatch(request, replica.clone());
                }
                self.gate = Gate::Open(replica);
            }
            Ok(Err(report)) => {
                let failure = StoredFailure::of(&report);
                for request in self.parked.drain(..) {
                    fail(request, &failure);
                }
                self.gate = Gate::Failed(failure);
            }
            Err(_) => {
                let failure = StoredFailure::closing("log is being deleted");
                for request in self.parked.drain(..) {
                    fail(request, &failure);
                }
                self.gate = Gate::Failed(failure);
            }
        }
    }

    fn handle(&mut self, request: ReaderRequest) {
        match &self.gate {
            Gate::Waiting => self.parked.push(request),
            Gate::Open(replica) => dispatch(request, replica.clone()),
            Gate::Failed(failure) => fail(request, failure),
        }
    }
}

fn dispatch(request: ReaderRequest, replica: Shared<Replica>) {
    tokio::spawn(async move {
        match request {
            ReaderRequest::Beginning { reply } => {
                let _ = reply.send(replica.beginning().await.map(Position::new));
            }
            ReaderRequest::Ending { reply } => {
                let _ = reply.send(replica.ending().await.map(Position::new));
            }
            ReaderRequest::Read { from, to, reply } => {
                let result = match replica.read(from.value(), to.value()).await {
                    Ok(actions) => entries(from.value(), to.value(), actions),
                    Err(report) => Err(report.attach(OperationContext::READING)),
                };
                let _ = reply.send(result);
            }
        }
    });
}

fn fail(request: ReaderRequest, failure: &StoredFailure) {
    match request {
        ReaderRequest::Beginning { reply } | ReaderRequest::Ending { reply } => {
            let _ = reply.send(Err(failure.to_report()));
        }
        ReaderRequest::Read { reply, .. } => {
            let _ = reply.send(Err(failure.to_report()));
        }
    }
}

/// Validate a contiguous learned range and keep only the appends.
fn entries(from: u64, to: u64, actions: Vec<Action>) -> Result<Vec<Entry>, Report<LogError>> {
    let mut entries = Vec::new();
    let mut expected = from;

    for action in actions {
        if !action.is_performed() || !action.learned {
            return Err(Report::new(LogError::BadRange)
                .attach("bad read range (includes pending entries)"));
        }
        if action.position != expected {
            return Err(Report::new(LogError::BadRange)
                .attach("bad read range (includes missing entries)"));
        }
        expected += 1;

        if let Some(bytes) = action.append_bytes() {
            entries.push(Entry {
                position: Position::new(action.position),
                bytes: bytes.clone(),
            });
        }
    }

    if expected <= to {
        return Err(
            Report::new(LogError::BadRange).attach("bad read range (includes missing entries)")
        );
    }

    Ok(entries)
}

/// Read access to a [`Log`].
///
/// Operations block until the log's recovery has finished; `read`
/// additionally takes a timeout and returns `Ok(None)` when it
/// elapses.
pub struct Reader {
    request_tx: mpsc::Sender<ReaderRequest>,
    _cancel: DropGuard,
}

impl Reader {
    #[must_use]
    pub fn new(log: &Log) -> Self {
        let (request_tx, request_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let actor = ReaderActor {
            log_tx: log.request_tx(),
            request_rx,
            cancel: cancel.clone(),
            gate_rx: None,
            gate: Gate::Waiting,
            parked: Vec::new(),
        };
        tokio::spawn(actor.run());

        Self {
            request_tx,
            _cancel: cancel.drop_guard(),
        }
    }

    /// First position of the log. Blocks until recovery resolves.
    ///
    /// # Errors
    ///
    /// Propagates recovery and storage failures.
    pub async fn beginning(&self) -> Result<Position, Report<LogError>> {
        self.dispatch(|reply| ReaderRequest::Beginning { reply })
            .await
    }

    /// Last position of the log. Blocks until recovery resolves.
    ///
    /// # Errors
    ///
    /// Propagates recovery and storage failures.
    pub async fn ending(&self) -> Result<Position, Report<LogError>> {
        self.dispatch(|reply| ReaderRequest::Ending { reply }).await
    }

    /// Read the entries in `[from, to]`. Returns `Ok(None)` when
    /// `timeout` elapses first; the underlying read still completes
    /// and is simply abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::BadRange`] when the range crosses pending
    /// or missing entries, and propagates recovery failures.
    pub async fn read(
        &self,
        from: Position,
        to: Position,
        timeout: Duration,
    ) -> Result<Option<Vec<Entry>>, Report<LogError>> {
        let read = self.dispatch(|reply| ReaderRequest::Read { from, to, reply });
        match tokio::time::timeout(timeout, read).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                info!("timed out while trying to read the log");
                Ok(None)
            }
        }
    }

    async fn dispatch<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, Report<LogError>>>) -> ReaderRequest,
    ) -> Result<T, Report<LogError>> {
        let (reply, response) = oneshot::channel();
        self.request_tx
            .send(make(reply))
            .await
            .map_err(|_| closing())?;
        response.await.map_err(|_| closing())?
    }
}

fn closing() -> Report<LogError> {
    Report::new(LogError::Closing).attach("log reader is being deleted")
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use strand_core::ActionKind;

    use super::*;

    fn learned_append(position: u64, payload: &'static [u8]) -> Action {
        Action::performed(
            position,
            1,
            ActionKind::Append {
                bytes: Bytes::from_static(payload),
            },
        )
        .into_learned()
    }

    #[test]
    fn entries_translate_appends_in_order() {
        let actions = vec![learned_append(2, b"a"), learned_append(3, b"b")];
        let entries = entries(2, 3, actions).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].position, Position::new(2));
        assert_eq!(entries[0].bytes.as_ref(), b"a");
        assert_eq!(entries[1].position, Position::new(3));
    }

    #[test]
    fn entries_filter_nops_and_truncates() {
        let actions = vec![
            Action::performed(1, 1, ActionKind::Nop).into_learned(),
            learned_append(2, b"kept"),
            Action::performed(3, 1, ActionKind::Truncate { to: 1 }).into_learned(),
        ];
        let entries = entries(1, 3, actions).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].position, Position::new(2));
    }

    #[test]
    fn entries_reject_pending_slots() {
        let actions = vec![
            learned_append(1, b"ok"),
            Action::performed(2, 1, ActionKind::Nop), // not learned
        ];
        let error = entries(1, 2, actions).unwrap_err();
        assert_eq!(*error.current_context(), LogError::BadRange);

        let unperformed = vec![Action::bare(1)];
        let error = entries(1, 1, unperformed).unwrap_err();
        assert_eq!(*error.current_context(), LogError::BadRange);
    }

    #[test]
    fn entries_reject_gaps() {
        let actions = vec![learned_append(1, b"a"), learned_append(3, b"c")];
        let error = entries(1, 3, actions).unwrap_err();
        assert_eq!(*error.current_context(), LogError::BadRange);
    }

    #[test]
    fn entries_reject_a_missing_tail() {
        let actions = vec![learned_append(1, b"a")];
        let error = entries(1, 2, actions).unwrap_err();
        assert_eq!(*error.current_context(), LogError::BadRange);

        let error = entries(1, 1, Vec::new()).unwrap_err();
        assert_eq!(*error.current_context(), LogError::BadRange);
    }

    #[test]
    fn entries_allow_an_empty_inverted_range() {
        assert!(entries(3, 2, Vec::new()).unwrap().is_empty());
    }
}
