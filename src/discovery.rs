//! # Rendezvous Discovery
//!
//! Drives the node from "connected to a few bootstrap peers" to "chatting
//! with everyone advertising the same tag":
//!
//! 1. bootstrap the DHT (fatal on error)
//! 2. advertise under the tag (advisory, refreshed in the background)
//! 3. query providers of the tag and consume the result channel
//! 4. for every new peer: dial, open a chat stream, hand it to the handlers
//!
//! Each connect attempt runs in its own task, bounded by a semaphore. A
//! [`PeerTable`] remembers who we are connecting or connected to, so a peer
//! that shows up again in a later lookup is not dialed twice. Entries are
//! dropped when an attempt fails or the connection closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{DiscoveryConfig, Timeouts};
use crate::identity::{Identity, PeerDescriptor};
use crate::messages::CHAT_PROTOCOL;
use crate::protocols::{Dialer, Rendezvous};
use crate::stream::StreamHandlers;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
}

/// Identity -> connection state for peers found through discovery.
#[derive(Clone, Default)]
pub struct PeerTable {
    inner: Arc<Mutex<HashMap<Identity, PeerState>>>,
}

impl PeerTable {
    fn with<T>(&self, f: impl FnOnce(&mut HashMap<Identity, PeerState>) -> T) -> T {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut map)
    }

    /// Marks `peer` as connecting. `false` if it is already known.
    fn try_claim(&self, peer: Identity) -> bool {
        self.with(|map| {
            if map.contains_key(&peer) {
                false
            } else {
                map.insert(peer, PeerState::Connecting);
                true
            }
        })
    }

    fn mark_connected(&self, peer: Identity) {
        self.with(|map| map.insert(peer, PeerState::Connected));
    }

    /// Records a peer that reached us first. An entry from our own dial is
    /// left untouched.
    pub(crate) fn note_inbound(&self, peer: Identity) {
        self.with(|map| {
            map.entry(peer).or_insert(PeerState::Connected);
        });
    }

    pub(crate) fn release(&self, peer: &Identity) {
        self.with(|map| map.remove(peer));
    }

    pub fn state(&self, peer: &Identity) -> Option<PeerState> {
        self.with(|map| map.get(peer).copied())
    }

    pub fn connected(&self) -> Vec<Identity> {
        self.with(|map| {
            map.iter()
                .filter(|(_, state)| **state == PeerState::Connected)
                .map(|(id, _)| *id)
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.with(|map| map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Discovery<R, D> {
    rendezvous: Arc<R>,
    dialer: D,
    handlers: StreamHandlers,
    local: Identity,
    protocol: String,
    config: DiscoveryConfig,
    timeouts: Timeouts,
    peers: PeerTable,
}

impl<R, D> Discovery<R, D>
where
    R: Rendezvous,
    D: Dialer + Clone,
{
    pub fn new(rendezvous: Arc<R>, dialer: D, handlers: StreamHandlers, local: Identity) -> Self {
        Self {
            rendezvous,
            dialer,
            handlers,
            local,
            protocol: CHAT_PROTOCOL.to_string(),
            config: DiscoveryConfig::default(),
            timeouts: Timeouts::default(),
            peers: PeerTable::default(),
        }
    }

    pub fn with_config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Protocol opened on every discovered peer. Defaults to chat.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_peer_table(mut self, peers: PeerTable) -> Self {
        self.peers = peers;
        self
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Runs until the lookup is exhausted (or forever with a rediscover
    /// interval). Returns `Ok(())` when `cancel` fires. Only a failed DHT
    /// bootstrap or a lookup that cannot start is an error.
    pub async fn run(&self, tag: &str, cancel: CancellationToken) -> Result<()> {
        self.config.validate()?;

        info!(tag, "bootstrapping the DHT");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = self.rendezvous.bootstrap() => result.context("DHT bootstrap failed")?,
        }

        info!(tag, "announcing ourselves");
        self.advertise_once(tag, &cancel).await;
        self.spawn_readvertise(tag.to_string(), cancel.child_token());

        self.discover(tag, &cancel).await
    }

    async fn advertise_once(&self, tag: &str, cancel: &CancellationToken) {
        advertise(self.rendezvous.as_ref(), tag, &self.timeouts, cancel).await;
    }

    fn spawn_readvertise(&self, tag: String, cancel: CancellationToken) {
        let rendezvous = self.rendezvous.clone();
        let timeouts = self.timeouts.clone();
        let period = self.config.readvertise_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        advertise(rendezvous.as_ref(), &tag, &timeouts, &cancel).await;
                    }
                }
            }
        });
    }

    async fn discover(&self, tag: &str, cancel: &CancellationToken) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_dials));
        let mut attempts: JoinSet<()> = JoinSet::new();

        loop {
            info!(tag, "searching for other peers");
            let mut found = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.rendezvous.find_peers(tag) => {
                    result.context("failed to start peer lookup")?
                }
            };

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = found.recv() => next,
                };
                let Some(peer) = next else {
                    break;
                };
                self.consider(peer, &mut attempts, &permits, cancel);
                while let Some(joined) = attempts.try_join_next() {
                    log_join_error(joined);
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let Some(period) = self.config.rediscover_interval else {
                debug!(tag, "peer lookup exhausted, waiting for outstanding dials");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        joined = attempts.join_next() => match joined {
                            Some(joined) => log_join_error(joined),
                            None => return Ok(()),
                        },
                    }
                }
                break;
            };

            debug!(tag, next_in_secs = period.as_secs(), "peer lookup exhausted");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }

        attempts.shutdown().await;
        Ok(())
    }

    fn consider(
        &self,
        peer: PeerDescriptor,
        attempts: &mut JoinSet<()>,
        permits: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) {
        if peer.identity == self.local {
            trace!("skipping our own advertisement");
            return;
        }
        let usable = peer.identity.is_valid()
            && peer.validate_structure()
            && peer.socket_addrs().next().is_some();
        if !usable {
            warn!(peer = %peer.identity.short(), "skipping invalid peer descriptor");
            return;
        }
        if !self.peers.try_claim(peer.identity) {
            debug!(peer = %peer.identity.short(), "already connecting or connected");
            return;
        }

        let dialer = self.dialer.clone();
        let handlers = self.handlers.clone();
        let peers = self.peers.clone();
        let protocol = self.protocol.clone();
        let timeouts = self.timeouts.clone();
        let permits = permits.clone();
        let cancel = cancel.clone();

        attempts.spawn(async move {
            let attempt = async {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow!("dial limiter closed"))?;
                connect_peer(&dialer, &handlers, &peer, &protocol, &timeouts).await
            };
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    peers.release(&peer.identity);
                    return;
                }
                outcome = attempt => outcome,
            };

            match outcome {
                Ok(conn) => {
                    info!(peer = %peer, "connected to peer");
                    peers.mark_connected(peer.identity);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = dialer.closed(&conn) => {
                                debug!(peer = %peer.identity.short(), "peer connection closed");
                            }
                        }
                        peers.release(&peer.identity);
                    });
                }
                Err(e) => {
                    peers.release(&peer.identity);
                    warn!(peer = %peer, error = %format!("{e:#}"), "failed to connect to discovered peer");
                }
            }
        });
    }
}

async fn advertise<R: Rendezvous + ?Sized>(
    rendezvous: &R,
    tag: &str,
    timeouts: &Timeouts,
    cancel: &CancellationToken,
) {
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio::time::timeout(timeouts.advertise, rendezvous.advertise(tag)) => result,
    };
    match result {
        Ok(Ok(())) => info!(tag, "successfully announced"),
        Ok(Err(e)) => warn!(tag, error = %format!("{e:#}"), "advertise failed"),
        Err(_) => warn!(tag, timeout_secs = timeouts.advertise.as_secs(), "advertise timed out"),
    }
}

async fn connect_peer<D: Dialer>(
    dialer: &D,
    handlers: &StreamHandlers,
    peer: &PeerDescriptor,
    protocol: &str,
    timeouts: &Timeouts,
) -> Result<D::Connection> {
    let conn = tokio::time::timeout(timeouts.dial, dialer.dial(peer))
        .await
        .map_err(|_| anyhow!("dial timed out"))??;
    let stream = tokio::time::timeout(timeouts.stream_open, dialer.open_stream(&conn, protocol))
        .await
        .map_err(|_| anyhow!("stream open timed out"))?
        .context("failed to open stream")?;
    handlers.dispatch(stream)?;
    Ok(conn)
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        warn!(error = %e, "connect task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;
    use crate::testing::{FakeDialer, FakeRendezvous, LogCapture, descriptor, identity};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn recording_handlers() -> (StreamHandlers, Arc<Mutex<Vec<Identity>>>) {
        let handlers = StreamHandlers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        handlers.register(
            CHAT_PROTOCOL,
            Arc::new(move |stream: Stream| {
                sink.lock().unwrap().push(stream.peer);
            }),
        );
        (handlers, seen)
    }

    fn discovery(
        rendezvous: FakeRendezvous,
        dialer: FakeDialer,
        handlers: StreamHandlers,
    ) -> Discovery<FakeRendezvous, FakeDialer> {
        Discovery::new(Arc::new(rendezvous), dialer, handlers, identity(0)).with_timeouts(Timeouts {
            dial: Duration::from_millis(500),
            stream_open: Duration::from_millis(500),
            ..Timeouts::default()
        })
    }

    #[tokio::test]
    async fn skips_self_and_survives_unreachable_peer() {
        let (logs, _guard) = LogCapture::warnings();
        let me = descriptor(0);
        let peer_b = descriptor(2);
        let peer_c = descriptor(3);
        let dialer = FakeDialer::default();
        dialer.set_unreachable(peer_b.identity);
        let (handlers, seen) = recording_handlers();

        let rendezvous =
            FakeRendezvous::with_peers(vec![me.clone(), peer_b.clone(), peer_c.clone()]);
        let discovery = discovery(rendezvous, dialer.clone(), handlers);
        discovery
            .run("rendezvous", CancellationToken::new())
            .await
            .expect("discovery completes");

        assert_eq!(dialer.dial_count(&me.identity), 0);
        assert_eq!(dialer.dial_count(&peer_b.identity), 1);
        assert_eq!(dialer.dial_count(&peer_c.identity), 1);
        assert_eq!(dialer.connected(), vec![peer_c.identity]);
        assert_eq!(*seen.lock().unwrap(), vec![peer_c.identity]);
        assert_eq!(discovery.peers().connected(), vec![peer_c.identity]);
        assert_eq!(discovery.peers().state(&peer_b.identity), None);

        let failure = "failed to connect to discovered peer";
        assert_eq!(logs.count(&[failure]), 1, "{:?}", logs.lines());
        assert_eq!(logs.count(&[failure, &peer_b.identity.to_hex()]), 1);
    }

    #[tokio::test]
    async fn zero_rediscover_interval_is_rejected() {
        let rendezvous = FakeRendezvous::with_peers(vec![descriptor(1)]);
        let dialer = FakeDialer::default();
        let discovery = discovery(rendezvous, dialer.clone(), StreamHandlers::new())
            .with_config(DiscoveryConfig {
                rediscover_interval: Some(Duration::ZERO),
                ..DiscoveryConfig::default()
            });

        let err = discovery
            .run("rendezvous", CancellationToken::new())
            .await
            .expect_err("zero interval rejected");
        assert!(format!("{err:#}").contains("rediscover_interval"));
        assert_eq!(discovery.rendezvous.bootstraps.load(Ordering::SeqCst), 0);
        assert!(dialer.dialed().is_empty());
    }

    #[tokio::test]
    async fn zero_readvertise_interval_is_rejected() {
        let rendezvous = FakeRendezvous::with_peers(vec![descriptor(1)]);
        let discovery = discovery(rendezvous, FakeDialer::default(), StreamHandlers::new())
            .with_config(DiscoveryConfig {
                readvertise_interval: Duration::ZERO,
                ..DiscoveryConfig::default()
            });

        let result = discovery.run("rendezvous", CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(discovery.rendezvous.advertises.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bootstrap_failure_is_fatal() {
        let rendezvous = FakeRendezvous::with_peers(vec![descriptor(1)]);
        rendezvous.fail_bootstrap();
        let dialer = FakeDialer::default();
        let discovery = discovery(rendezvous, dialer.clone(), StreamHandlers::new());

        let err = discovery
            .run("rendezvous", CancellationToken::new())
            .await
            .expect_err("bootstrap error propagates");
        assert!(format!("{err:#}").contains("DHT bootstrap failed"));
        assert!(dialer.dialed().is_empty());
    }

    #[tokio::test]
    async fn advertise_failure_is_advisory() {
        let rendezvous = FakeRendezvous::with_peers(vec![descriptor(1)]);
        rendezvous.fail_advertise();
        let dialer = FakeDialer::default();
        let (handlers, _) = recording_handlers();
        let discovery = discovery(rendezvous, dialer.clone(), handlers);

        discovery
            .run("rendezvous", CancellationToken::new())
            .await
            .expect("advertise errors are logged only");
        assert_eq!(discovery.rendezvous.advertises.load(Ordering::SeqCst), 1);
        assert_eq!(dialer.connected(), vec![identity(1)]);
    }

    #[tokio::test]
    async fn duplicate_descriptors_dial_once() {
        let peer = descriptor(4);
        let dialer = FakeDialer::default();
        let (handlers, seen) = recording_handlers();
        let rendezvous = FakeRendezvous::with_peers(vec![peer.clone(), peer.clone(), peer.clone()]);

        discovery(rendezvous, dialer.clone(), handlers)
            .run("rendezvous", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(dialer.dial_count(&peer.identity), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stream_refusal_releases_peer() {
        let peer = descriptor(5);
        let dialer = FakeDialer::default();
        dialer.refuse_streams(peer.identity);
        let (handlers, seen) = recording_handlers();

        let discovery = discovery(
            FakeRendezvous::with_peers(vec![peer.clone()]),
            dialer.clone(),
            handlers,
        );
        discovery
            .run("rendezvous", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(dialer.dial_count(&peer.identity), 1);
        assert!(seen.lock().unwrap().is_empty());
        assert!(discovery.peers().is_empty());
    }

    #[tokio::test]
    async fn rediscovery_of_connected_peer_is_a_no_op() {
        let peer = descriptor(6);
        let dialer = FakeDialer::default();
        let (handlers, _) = recording_handlers();
        let discovery = Arc::new(
            discovery(
                FakeRendezvous::with_peers(vec![peer.clone()]),
                dialer.clone(),
                handlers,
            )
            .with_config(DiscoveryConfig {
                rediscover_interval: Some(Duration::from_millis(20)),
                ..DiscoveryConfig::default()
            }),
        );

        let cancel = CancellationToken::new();
        let running = {
            let discovery = discovery.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { discovery.run("rendezvous", cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(discovery.rendezvous.lookups.load(Ordering::SeqCst) >= 3);
        assert_eq!(dialer.dial_count(&peer.identity), 1);

        // Once the connection drops, the next round dials again.
        dialer.disconnect(&peer.identity);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dialer.dial_count(&peer.identity), 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("discovery stops on cancel")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_slow_dial() {
        let peer = descriptor(7);
        let dialer = FakeDialer::default();
        dialer.set_delay(peer.identity, Duration::from_secs(30));
        let discovery = Arc::new(
            Discovery::new(
                Arc::new(FakeRendezvous::with_peers(vec![peer.clone()])),
                dialer.clone(),
                StreamHandlers::new(),
                identity(0),
            )
            .with_timeouts(Timeouts {
                dial: Duration::from_secs(60),
                ..Timeouts::default()
            }),
        );

        let cancel = CancellationToken::new();
        let running = {
            let discovery = discovery.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { discovery.run("rendezvous", cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(discovery.peers().state(&peer.identity), Some(PeerState::Connecting));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("discovery stops on cancel")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn outbound_stream_reaches_chat_handler() {
        use crate::stream::{ChatHandler, ChatLine};
        use tokio::sync::{broadcast, mpsc};

        let peer = descriptor(8);
        let dialer = FakeDialer::default();
        let (out_tx, _) = broadcast::channel(8);
        let (in_tx, mut in_rx) = mpsc::channel::<ChatLine>(8);
        let handlers = StreamHandlers::new();
        handlers.register(
            CHAT_PROTOCOL,
            Arc::new(ChatHandler::new(
                identity(0),
                out_tx.clone(),
                in_tx,
                CancellationToken::new(),
                Duration::from_secs(1),
            )),
        );

        discovery(
            FakeRendezvous::with_peers(vec![peer.clone()]),
            dialer.clone(),
            handlers,
        )
        .run("rendezvous", CancellationToken::new())
        .await
        .unwrap();

        let mut remote = dialer.take_remote(&peer.identity).expect("stream opened");
        remote.write_all(b"hey\n").await.unwrap();
        let line = in_rx.recv().await.unwrap();
        assert_eq!(line.from, peer.identity);
        assert_eq!(line.text, "hey");

        out_tx.send("back".into()).unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back\n");
    }
}
