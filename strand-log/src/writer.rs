//! Write access to the log through an elected coordinator.
//!
//! A writer owns at most one coordinator, created fresh on every
//! election. Append and truncate requests are processed in arrival
//! order and delegated to the coordinator, which submits ballots
//! serially. Any proposal failure poisons the writer, so every
//! subsequent write returns the stored error until the next
//! election installs a clean coordinator.

use std::time::Duration;

use bytes::Bytes;
use error_stack::Report;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};

use strand_core::LogError;
use strand_replica::Coordinator;

use crate::config::BackoffConfig;
use crate::log::{Log, LogRequest, Recovered, StoredFailure};
use crate::position::Position;

enum WriterRequest {
    Elect {
        reply: oneshot::Sender<Result<Option<Position>, Report<LogError>>>,
    },
    Append {
        bytes: Bytes,
        reply: oneshot::Sender<Result<Position, Report<LogError>>>,
    },
    Truncate {
        to: Position,
        reply: oneshot::Sender<Result<Position, Report<LogError>>>,
    },
}

enum Gate {
    Waiting,
    Open(Recovered),
    Failed(StoredFailure),
}

struct WriterActor {
    log_tx: mpsc::Sender<LogRequest>,
    request_rx: mpsc::Receiver<WriterRequest>,
    cancel: CancellationToken,
    gate_rx: Option<oneshot::Receiver<Result<Recovered, Report<LogError>>>>,
    gate: Gate,
    /// Elections parked until the recovery gate opens.
    parked: Vec<oneshot::Sender<Result<Option<Position>, Report<LogError>>>>,
    coordinator: Option<Coordinator>,
    /// Poison: set on any proposal failure, cleared by election.
    error: Option<StoredFailure>,
}

impl WriterActor {
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
                    self.on_gate(result).await;
                }

                request = self.request_rx.recv() => {
                    let Some(request) = request else { break };
                    self.handle(request).await;
                }
            }
        }

        let closing = StoredFailure::closing("log writer is being deleted");
        for reply in self.parked.drain(..) {
            let _ = reply.send(Err(closing.to_report()));
        }
    }

    async fn on_gate(
        &mut self,
        result: Result<Result<Recovered, Report<LogError>>, oneshot::error::RecvError>,
    ) {
        match result {
            Ok(Ok(recovered)) => {
                debug!("writer gate open");
                self.gate = Gate::Open(recovered);
                let parked = std::mem::take(&mut self.parked);
                for reply in parked {
                    self.elect(reply).await;
                }
            }
            Ok(Err(report)) => {
                let failure = StoredFailure::of(&report);
                for reply in self.parked.drain(..) {
                    let _ = reply.send(Err(failure.to_report()));
                }
                self.gate = Gate::Failed(failure);
            }
            Err(_) => {
                let failure = StoredFailure::closing("log is being deleted");
                for reply in self.parked.drain(..) {
                    let _ = reply.send(Err(failure.to_report()));
                }
                self.gate = Gate::Failed(failure);
            }
        }
    }

    async fn handle(&mut self, request: WriterRequest) {
        match request {
            WriterRequest::Elect { reply } => {
                if matches!(self.gate, Gate::Waiting) {
                    self.parked.push(reply);
                } else if let Gate::Failed(failure) = &self.gate {
                    let _ = reply.send(Err(failure.to_report()));
                } else {
                    self.elect(reply).await;
                }
            }
            WriterRequest::Append { bytes, reply } => {
                let result = match self.writable() {
                    Ok(coordinator) => coordinator.append(bytes).await,
                    Err(report) => Err(report),
                };
                let _ = reply.send(self.observed(result.map(Position::new)));
            }
            WriterRequest::Truncate { to, reply } => {
                let result = match self.writable() {
                    Ok(coordinator) => coordinator.truncate(to.value()).await,
                    Err(report) => Err(report),
                };
                let _ = reply.send(self.observed(result.map(Position::new)));
            }
        }
    }

    /// Tear down any previous coordinator and run a fresh election.
    async fn elect(
        &mut self,
        reply: oneshot::Sender<Result<Option<Position>, Report<LogError>>>,
    ) {
        let Gate::Open(recovered) = &self.gate else {
            unreachable!("elections only run behind an open gate");
        };

        self.coordinator = None;
        self.error = None;

        let mut coordinator = Coordinator::new(
            recovered.quorum,
            recovered.replica.clone(),
            recovered.network.clone(),
        );
        let result = coordinator.elect().await;
        self.coordinator = Some(coordinator);

        let result = match result {
            Ok(position) => Ok(position.map(Position::new)),
            Err(report) => {
                self.error = Some(StoredFailure::of(&report));
                Err(report)
            }
        };
        let _ = reply.send(result);
    }

    /// The coordinator, if this writer holds one and is not
    /// poisoned.
    fn writable(&mut self) -> Result<&mut Coordinator, Report<LogError>> {
        if let Some(error) = &self.error {
            return Err(error.to_report());
        }
        match &mut self.coordinator {
            Some(coordinator) => Ok(coordinator),
            None => Err(Report::new(LogError::NotElected)
                .attach("no election has been performed")),
        }
    }

    /// Record a proposal failure as the poison for later writes.
    fn observed<T>(&mut self, result: Result<T, Report<LogError>>) -> Result<T, Report<LogError>> {
        if let Err(report) = &result
            && self.error.is_none()
            && !matches!(report.current_context(), LogError::NotElected)
        {
            self.error = Some(StoredFailure::of(report));
        }
        result
    }
}

/// Write access to a [`Log`].
///
/// Construction runs leader election with retries; a writer whose
/// election never succeeded still exists, but every operation on it
/// returns an error. Operations return `Ok(None)` when their timeout
/// elapses; the proposal itself still runs to completion and is
/// merely abandoned.
pub struct Writer {
    request_tx: mpsc::Sender<WriterRequest>,
    position: Option<Position>,
    _cancel: DropGuard,
}

impl Writer {
    /// Spawn a writer and try to get it elected, awaiting each
    /// attempt for `election_timeout` and retrying a lost or timed
    /// out election up to `retries` times.
    pub async fn new(log: &Log, election_timeout: Duration, retries: u32) -> Self {
        let (request_tx, request_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let actor = WriterActor {
            log_tx: log.request_tx(),
            request_rx,
            cancel: cancel.clone(),
            gate_rx: None,
            gate: Gate::Waiting,
            parked: Vec::new(),
            coordinator: None,
            error: None,
        };
        tokio::spawn(actor.run());

        let mut writer = Self {
            request_tx,
            position: None,
            _cancel: cancel.drop_guard(),
        };

        let backoff = BackoffConfig::default();
        let mut rng = rand::rng();
        let mut remaining = i64::from(retries);
        let mut attempt = 0u32;

        loop {
            info!(timeout = ?election_timeout, "attempting to get elected");
            let (reply, response) = oneshot::channel();
            if writer
                .request_tx
                .send(WriterRequest::Elect { reply })
                .await
                .is_err()
            {
                error!("failed to get elected: the log is being deleted");
                break;
            }

            match tokio::time::timeout(election_timeout, response).await {
                Err(_) => {
                    // Abandon the attempt; the election may still
                    // finish in the actor, and rerunning it is safe.
                    info!("timed out while trying to get elected");
                }
                Ok(Err(_)) => {
                    error!("failed to get elected: the writer is being deleted");
                    break;
                }
                Ok(Ok(Err(report))) => {
                    error!(?report, "failed to get elected");
                    break;
                }
                Ok(Ok(Ok(Some(position)))) => {
                    info!(%position, "elected with current position");
                    writer.position = Some(position);
                    break;
                }
                Ok(Ok(Ok(None))) => {
                    info!("lost an election, but can be retried");
                    tokio::time::sleep(backoff.duration(attempt, &mut rng)).await;
                    attempt += 1;
                }
            }

            remaining -= 1;
            if remaining < 0 {
                error!("retry limit has been reached during election");
                break;
            }
        }

        writer
    }

    /// The log's ending position at election time, when the writer
    /// was successfully elected.
    #[must_use]
    pub fn position(&self) -> Option<Position> {
        self.position
    }

    /// Append `bytes` as a new entry. `Ok(None)` means the timeout
    /// elapsed first.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::NotElected`] without a prior successful
    /// election and the stored poison after any proposal failure.
    pub async fn append(
        &self,
        bytes: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Option<Position>, Report<LogError>> {
        let bytes = bytes.into();
        debug!(len = bytes.len(), "attempting to append to the log");
        self.dispatch(
            |reply| WriterRequest::Append { bytes, reply },
            timeout,
            "timed out while trying to append the log",
        )
        .await
    }

    /// Discard every entry at or below `to`. `Ok(None)` means the
    /// timeout elapsed first.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::NotElected`] without a prior successful
    /// election, [`LogError::BadRange`] when `to` lies beyond the
    /// log, and the stored poison after any proposal failure.
    pub async fn truncate(
        &self,
        to: Position,
        timeout: Duration,
    ) -> Result<Option<Position>, Report<LogError>> {
        debug!(%to, "attempting to truncate the log");
        self.dispatch(
            |reply| WriterRequest::Truncate { to, reply },
            timeout,
            "timed out while trying to truncate the log",
        )
        .await
    }

    async fn dispatch(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<Position, Report<LogError>>>) -> WriterRequest,
        timeout: Duration,
        timeout_message: &'static str,
    ) -> Result<Option<Position>, Report<LogError>> {
        let (reply, response) = oneshot::channel();
        self.request_tx
            .send(make(reply))
            .await
            .map_err(|_| closing())?;

        match tokio::time::timeout(timeout, response).await {
            Err(_) => {
                info!("{timeout_message}");
                Ok(None)
            }
            Ok(Err(_)) => Err(closing()),
            Ok(Ok(result)) => result
                .map(Some)
                .inspect_err(|report| error!(?report, "log write failed")),
        }
    }
}

fn closing() -> Report<LogError> {
    Report::new(LogError::Closing).attach("log writer is being deleted")
}
