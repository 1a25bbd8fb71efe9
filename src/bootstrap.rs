//! Connecting to the configured bootstrap peers.
//!
//! Every peer is dialed concurrently and the call returns once all attempts
//! have finished, successful or not. Individual failures are logged and
//! never abort the others: a node with zero reachable bootstrap peers still
//! starts, it just has an empty routing table.

use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::identity::PeerDescriptor;
use crate::protocols::Dialer;

/// Dials every peer in `peers` in parallel and waits for all of them.
pub async fn connect_bootstrap_set<D>(
    dialer: &D,
    peers: &[PeerDescriptor],
    dial_timeout: Duration,
    cancel: &CancellationToken,
) where
    D: Dialer + Clone,
{
    if peers.is_empty() {
        return;
    }

    let mut attempts = JoinSet::new();
    for peer in peers {
        let dialer = dialer.clone();
        let peer = peer.clone();
        let cancel = cancel.clone();
        attempts.spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = tokio::time::timeout(dial_timeout, dialer.dial(&peer)) => outcome,
            };
            match outcome {
                Ok(Ok(_)) => {
                    info!(peer = %peer, "connection established with bootstrap node");
                }
                Ok(Err(e)) => {
                    warn!(peer = %peer, error = %format!("{e:#}"), "failed to connect to bootstrap node");
                }
                Err(_) => {
                    warn!(peer = %peer, timeout_ms = dial_timeout.as_millis(), "bootstrap dial timed out");
                }
            }
        });
    }

    while let Some(joined) = attempts.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "bootstrap dial task failed");
        }
    }
}
