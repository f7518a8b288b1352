//! Bring a freshly opened replica up to the quorum's learned prefix.

use error_stack::Report;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::oneshot;
use tracing::{debug, info};

use strand_core::{LogError, OperationContext, Shared};

use crate::network::Network;
use crate::protocol::ReplicaRequest;
use crate::replica::Replica;

/// Drive `replica` to quorum-consistent state.
///
/// Suspends until the network knows at least `quorum` peers, asks
/// them for their learned boundaries, and copies the largest learned
/// prefix into the local store. Unlearned tail slots are left for
/// the next elected coordinator's catch-up. The replica is consumed:
/// recovery requires the private, not-yet-shared replica, and an
/// abandoned recovery takes the replica down with it.
///
/// # Errors
///
/// Returns [`LogError::RecoveryFailed`] when a quorum cannot be
/// assembled or the chosen peer disappears mid-transfer, and
/// [`LogError::Infrastructure`] on local storage failures.
pub async fn recover(
    quorum: usize,
    replica: Replica,
    network: Shared<Network>,
) -> Result<Replica, Report<LogError>> {
    info!(quorum, "waiting for a quorum of peers");
    network.watch_quorum(quorum).await;

    let mut responses = {
        let stream = FuturesUnordered::new();
        for pid in network.pids() {
            let (tx, rx) = oneshot::channel();
            if network.send(&pid, ReplicaRequest::Recover { reply: tx }) {
                stream.push(rx);
            }
        }
        stream
    };

    let mut reports = Vec::new();
    while let Some(response) = responses.next().await {
        if let Ok(report) = response {
            reports.push(report);
            if reports.len() >= quorum {
                break;
            }
        }
    }
    drop(responses);
    if reports.len() < quorum {
        return Err(Report::new(LogError::RecoveryFailed)
            .attach("a quorum of replicas did not report their state")
            .attach(OperationContext::RECOVERING));
    }

    let best = reports
        .iter()
        .max_by_key(|report| report.end)
        .expect("a quorum of reports is non-empty");

    if best.begin > 0 {
        replica.raise_begin(best.begin).await?;
    }

    let local_end = replica.ending().await?;
    if best.pid != replica.pid() && best.end > local_end {
        debug!(peer = %best.pid, end = best.end, "fetching learned actions");
        let (tx, rx) = oneshot::channel();
        if !network.send(
            &best.pid,
            ReplicaRequest::Fetch {
                from: best.begin.max(1),
                to: best.end,
                reply: tx,
            },
        ) {
            return Err(Report::new(LogError::RecoveryFailed)
                .attach("the peer with the longest log became unreachable")
                .attach(OperationContext::RECOVERING));
        }
        let actions = rx.await.map_err(|_| {
            Report::new(LogError::RecoveryFailed)
                .attach("the peer with the longest log dropped the transfer")
                .attach(OperationContext::RECOVERING)
        })?;
        for action in actions {
            replica.install(action).await?;
        }
    }

    let recovered_end = replica.ending().await.unwrap_or(0);
    info!(end = recovered_end, "replica recovered");
    Ok(replica)
}
