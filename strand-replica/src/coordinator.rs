//! The Paxos proposer bound to one writer's ballot.
//!
//! A coordinator is built after recovery from a shared replica and
//! network, wins a ballot with [`elect`](Coordinator::elect), and
//! then drives [`append`](Coordinator::append) /
//! [`truncate`](Coordinator::truncate) rounds serially. Once any
//! round is rejected the ballot is stale and the coordinator demotes
//! itself; the owning writer must run a fresh election.

use bytes::Bytes;
use error_stack::Report;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use strand_core::{Action, ActionKind, LogError, OperationContext, Shared};

use crate::network::Network;
use crate::protocol::{PromiseResponse, ReplicaRequest, WriteResponse};
use crate::replica::Replica;

/// Largest accepted append payload.
pub const MAX_ENTRY_SIZE: usize = 10 * 1024 * 1024;

pub struct Coordinator {
    quorum: usize,
    replica: Shared<Replica>,
    network: Shared<Network>,
    proposal: u64,
    /// Last position assigned or caught up under our ballot.
    index: u64,
    elected: bool,
}

impl Coordinator {
    #[must_use]
    pub fn new(quorum: usize, replica: Shared<Replica>, network: Shared<Network>) -> Self {
        Self {
            quorum,
            replica,
            network,
            proposal: 0,
            index: 0,
            elected: false,
        }
    }

    /// Run leader election. `Ok(Some(position))` carries the current
    /// ending position on a win; `Ok(None)` means a competing
    /// proposer outranked us and a retry may succeed.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Infrastructure`] when a quorum cannot be
    /// assembled.
    pub async fn elect(&mut self) -> Result<Option<u64>, Report<LogError>> {
        self.elected = false;
        let promised = self.replica.promised().await?;
        self.proposal = promised + 1;
        debug!(proposal = self.proposal, "starting election");

        let proposal = self.proposal;
        let mut responses = self.broadcast(|reply| ReplicaRequest::Promise {
            proposal,
            position: None,
            reply,
        });

        let mut grants: Vec<(u64, u64)> = Vec::new();
        while let Some(response) = responses.next().await {
            match response {
                Ok(PromiseResponse::Okay { begin, end, .. }) => {
                    grants.push((begin, end));
                    if grants.len() >= self.quorum {
                        break;
                    }
                }
                Ok(PromiseResponse::Reject { higher }) => {
                    debug!(proposal, higher, "election lost to a higher ballot");
                    return Ok(None);
                }
                Err(_) => {} // peer went away without answering
            }
        }
        drop(responses);
        if grants.len() < self.quorum {
            return Err(Report::new(LogError::Infrastructure)
                .attach("failed to assemble a quorum of promises")
                .attach(OperationContext::ELECTING));
        }

        let begin = grants.iter().map(|&(b, _)| b).max().unwrap_or(0).max(1);
        let end = grants.iter().map(|&(_, e)| e).max().unwrap_or(0);

        // Catch up every slot the quorum knows about that the local
        // replica has not learned.
        if end >= begin {
            let local = self.replica.read(begin, end).await?;
            let learned: std::collections::BTreeSet<u64> = local
                .iter()
                .filter(|action| action.learned)
                .map(|action| action.position)
                .collect();
            for position in begin..=end {
                if !learned.contains(&position) && !self.fill(position).await? {
                    debug!(position, "election superseded during catch-up");
                    return Ok(None);
                }
            }
        }

        self.index = end;
        self.elected = true;
        info!(proposal = self.proposal, position = end, "elected");
        Ok(Some(end))
    }

    /// Append an entry under the current ballot; returns its
    /// position.
    ///
    /// # Errors
    ///
    /// [`LogError::NotElected`] without a won election;
    /// [`LogError::Infrastructure`] when the ballot was superseded
    /// or a quorum is unreachable; either way the coordinator is
    /// demoted.
    pub async fn append(&mut self, bytes: Bytes) -> Result<u64, Report<LogError>> {
        if !self.elected {
            return Err(Report::new(LogError::NotElected).attach("coordinator holds no ballot"));
        }
        if bytes.len() > MAX_ENTRY_SIZE {
            return Err(Report::new(LogError::Infrastructure)
                .attach(format!(
                    "entry of {} bytes exceeds the {MAX_ENTRY_SIZE} byte limit",
                    bytes.len()
                ))
                .attach(OperationContext::APPENDING));
        }

        let position = self.index + 1;
        let action = Action::performed(position, self.proposal, ActionKind::Append { bytes });
        match self.write(action).await {
            Ok(true) => {
                self.index = position;
                Ok(position)
            }
            Ok(false) => {
                self.elected = false;
                Err(Report::new(LogError::Infrastructure)
                    .attach("ballot superseded by a newer election")
                    .attach(OperationContext::APPENDING))
            }
            Err(report) => {
                self.elected = false;
                Err(report.attach(OperationContext::APPENDING))
            }
        }
    }

    /// Discard every position at or below `to`. Returns `to`, the
    /// new `beginning - 1`.
    ///
    /// # Errors
    ///
    /// [`LogError::NotElected`] without a won election;
    /// [`LogError::BadRange`] when `to` lies beyond the log;
    /// [`LogError::Infrastructure`] on a superseded ballot or an
    /// unreachable quorum.
    pub async fn truncate(&mut self, to: u64) -> Result<u64, Report<LogError>> {
        if !self.elected {
            return Err(Report::new(LogError::NotElected).attach("coordinator holds no ballot"));
        }
        if to > self.index {
            return Err(Report::new(LogError::BadRange)
                .attach(format!(
                    "cannot truncate through {to}: the log ends at {}",
                    self.index
                ))
                .attach(OperationContext::TRUNCATING));
        }

        let position = self.index + 1;
        let action = Action::performed(position, self.proposal, ActionKind::Truncate { to });
        match self.write(action).await {
            Ok(true) => {
                self.index = position;
                Ok(to)
            }
            Ok(false) => {
                self.elected = false;
                Err(Report::new(LogError::Infrastructure)
                    .attach("ballot superseded by a newer election")
                    .attach(OperationContext::TRUNCATING))
            }
            Err(report) => {
                self.elected = false;
                Err(report.attach(OperationContext::TRUNCATING))
            }
        }
    }

    /// Run one full round for a slot the quorum knows but the local
    /// replica has not learned: collect per-slot promises, adopt the
    /// highest accepted value (or `Nop`), and write it through.
    /// `Ok(false)` means the ballot was outranked.
    async fn fill(&mut self, position: u64) -> Result<bool, Report<LogError>> {
        trace!(position, "catching up slot");
        let proposal = self.proposal;
        let mut responses = self.broadcast(|reply| ReplicaRequest::Promise {
            proposal,
            position: Some(position),
            reply,
        });

        let mut grants = 0usize;
        let mut adopted: Option<Action> = None;
        while let Some(response) = responses.next().await {
            match response {
                Ok(PromiseResponse::Okay { action, .. }) => {
                    grants += 1;
                    if let Some(action) = action {
                        let ballot = action.performed.unwrap_or(0);
                        if adopted
                            .as_ref()
                            .is_none_or(|a| a.performed.unwrap_or(0) < ballot)
                        {
                            adopted = Some(action);
                        }
                    }
                    if grants >= self.quorum {
                        break;
                    }
                }
                Ok(PromiseResponse::Reject { .. }) => return Ok(false),
                Err(_) => {}
            }
        }
        drop(responses);
        if grants < self.quorum {
            return Err(Report::new(LogError::Infrastructure)
                .attach("failed to assemble a quorum of promises")
                .attach(OperationContext::ELECTING));
        }

        let kind = adopted.and_then(|a| a.kind).unwrap_or(ActionKind::Nop);
        self.write(Action::performed(position, self.proposal, kind))
            .await
    }

    /// Phase-2 round: broadcast the write, wait for a quorum of
    /// acknowledgements, then publish the learned action. `Ok(false)`
    /// means the ballot was outranked.
    async fn write(&mut self, action: Action) -> Result<bool, Report<LogError>> {
        let proposal = self.proposal;
        let position = action.position;
        let mut responses = {
            let action = action.clone();
            self.broadcast(move |reply| ReplicaRequest::Write {
                proposal,
                action: action.clone(),
                reply,
            })
        };

        let mut okays = 0usize;
        while let Some(response) = responses.next().await {
            match response {
                Ok(WriteResponse::Okay { .. }) => {
                    okays += 1;
                    if okays >= self.quorum {
                        break;
                    }
                }
                Ok(WriteResponse::Reject { higher }) => {
                    debug!(position, proposal, higher, "write rejected");
                    return Ok(false);
                }
                Err(_) => {}
            }
        }
        drop(responses);
        if okays < self.quorum {
            return Err(Report::new(LogError::Infrastructure)
                .attach("failed to assemble a quorum of write acknowledgements"));
        }

        self.learn(action.into_learned()).await;
        Ok(true)
    }

    /// Publish a quorum-confirmed action. Remote replicas learn
    /// fire-and-forget; the local replica's ack is awaited so a
    /// successful proposal is immediately readable through it.
    async fn learn(&self, action: Action) {
        let local = self.replica.pid();
        let mut local_ack = None;
        for pid in self.network.pids() {
            if pid == local {
                let (tx, rx) = oneshot::channel();
                if self.network.send(
                    &pid,
                    ReplicaRequest::Learned {
                        action: action.clone(),
                        ack: Some(tx),
                    },
                ) {
                    local_ack = Some(rx);
                }
            } else {
                self.network.send(
                    &pid,
                    ReplicaRequest::Learned {
                        action: action.clone(),
                        ack: None,
                    },
                );
            }
        }
        if let Some(ack) = local_ack {
            let _ = ack.await;
        }
    }

    fn broadcast<R>(
        &self,
        make: impl Fn(oneshot::Sender<R>) -> ReplicaRequest,
    ) -> FuturesUnordered<oneshot::Receiver<R>> {
        let responses = FuturesUnordered::new();
        for pid in self.network.pids() {
            let (tx, rx) = oneshot::channel();
            if self.network.send(&pid, make(tx)) {
                responses.push(rx);
            }
        }
        responses
    }
}
