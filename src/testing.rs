//! In-memory implementations of [`Dialer`] and [`Rendezvous`] for unit tests,
//! plus a log capture for asserting on warnings.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::subscriber::DefaultGuard;

use crate::identity::{Identity, PeerDescriptor};
use crate::protocols::{Dialer, Rendezvous};
use crate::stream::{Direction, Stream};

pub fn identity(index: u32) -> Identity {
    let mut seed = [0u8; 32];
    seed[..4].copy_from_slice(&index.to_be_bytes());
    Identity::from_bytes(SigningKey::from_bytes(&seed).verifying_key().to_bytes())
}

pub fn descriptor(index: u32) -> PeerDescriptor {
    PeerDescriptor::new(identity(index), vec![format!("127.0.0.1:{}", 10_000 + index)])
}

#[derive(Clone)]
pub struct FakeConnection {
    pub peer: Identity,
    closed: CancellationToken,
}

#[derive(Default)]
struct DialerState {
    delays: HashMap<Identity, Duration>,
    unreachable: HashSet<Identity>,
    no_streams: HashSet<Identity>,
    dialed: Vec<Identity>,
    connected: Vec<Identity>,
    opened: Vec<(Identity, String)>,
    connections: Vec<FakeConnection>,
    /// Remote ends of opened streams, kept so the local halves stay open.
    remotes: Vec<(Identity, DuplexStream)>,
}

#[derive(Clone, Default)]
pub struct FakeDialer {
    state: Arc<Mutex<DialerState>>,
}

impl FakeDialer {
    fn with_state<T>(&self, f: impl FnOnce(&mut DialerState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn set_delay(&self, peer: Identity, delay: Duration) {
        self.with_state(|s| s.delays.insert(peer, delay));
    }

    pub fn set_unreachable(&self, peer: Identity) {
        self.with_state(|s| s.unreachable.insert(peer));
    }

    pub fn refuse_streams(&self, peer: Identity) {
        self.with_state(|s| s.no_streams.insert(peer));
    }

    pub fn dialed(&self) -> Vec<Identity> {
        self.with_state(|s| s.dialed.clone())
    }

    pub fn connected(&self) -> Vec<Identity> {
        self.with_state(|s| s.connected.clone())
    }

    pub fn opened(&self) -> Vec<(Identity, String)> {
        self.with_state(|s| s.opened.clone())
    }

    pub fn dial_count(&self, peer: &Identity) -> usize {
        self.with_state(|s| s.dialed.iter().filter(|d| *d == peer).count())
    }

    /// Simulates the remote side dropping every connection to `peer`.
    pub fn disconnect(&self, peer: &Identity) {
        self.with_state(|s| {
            for conn in s.connections.iter().filter(|c| c.peer == *peer) {
                conn.closed.cancel();
            }
        });
    }

    pub fn take_remote(&self, peer: &Identity) -> Option<DuplexStream> {
        self.with_state(|s| {
            let pos = s.remotes.iter().position(|(id, _)| id == peer)?;
            Some(s.remotes.remove(pos).1)
        })
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    type Connection = FakeConnection;

    async fn dial(&self, peer: &PeerDescriptor) -> Result<FakeConnection> {
        let delay = self.with_state(|s| {
            s.dialed.push(peer.identity);
            s.delays.get(&peer.identity).copied()
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.with_state(|s| s.unreachable.contains(&peer.identity)) {
            bail!("connection refused");
        }
        let conn = FakeConnection {
            peer: peer.identity,
            closed: CancellationToken::new(),
        };
        self.with_state(|s| {
            s.connected.push(peer.identity);
            s.connections.push(conn.clone());
        });
        Ok(conn)
    }

    async fn open_stream(&self, conn: &FakeConnection, protocol: &str) -> Result<Stream> {
        if self.with_state(|s| s.no_streams.contains(&conn.peer)) {
            bail!("protocol not supported");
        }
        let (local, remote) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        self.with_state(|s| {
            s.opened.push((conn.peer, protocol.to_string()));
            s.remotes.push((conn.peer, remote));
        });
        Ok(Stream::new(
            conn.peer,
            "127.0.0.1:9".parse()?,
            protocol,
            Direction::Outbound,
            reader,
            writer,
        ))
    }

    async fn closed(&self, conn: &FakeConnection) {
        conn.closed.cancelled().await;
    }
}

#[derive(Default)]
pub struct FakeRendezvous {
    peers: Mutex<Vec<PeerDescriptor>>,
    bootstrap_fails: AtomicBool,
    advertise_fails: AtomicBool,
    pub bootstraps: AtomicUsize,
    pub advertises: AtomicUsize,
    pub lookups: AtomicUsize,
}

impl FakeRendezvous {
    pub fn with_peers(peers: Vec<PeerDescriptor>) -> Self {
        Self {
            peers: Mutex::new(peers),
            ..Default::default()
        }
    }

    pub fn fail_bootstrap(&self) {
        self.bootstrap_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_advertise(&self) {
        self.advertise_fails.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Rendezvous for FakeRendezvous {
    async fn bootstrap(&self) -> Result<()> {
        self.bootstraps.fetch_add(1, Ordering::SeqCst);
        if self.bootstrap_fails.load(Ordering::SeqCst) {
            bail!("routing table unavailable");
        }
        Ok(())
    }

    async fn advertise(&self, _tag: &str) -> Result<()> {
        self.advertises.fetch_add(1, Ordering::SeqCst);
        if self.advertise_fails.load(Ordering::SeqCst) {
            bail!("no peers to store the record");
        }
        Ok(())
    }

    async fn find_peers(&self, _tag: &str) -> Result<mpsc::Receiver<PeerDescriptor>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(async move {
            for peer in peers {
                if tx.send(peer).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Collects formatted `WARN` and `ERROR` events emitted on the current
/// thread while the returned guard is alive. `#[tokio::test]` runs spawned
/// tasks on the test thread, so their events are captured too.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn warnings() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (capture, tracing::subscriber::set_default(subscriber))
    }

    pub fn lines(&self) -> Vec<String> {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).lines().map(str::to_owned).collect()
    }

    /// Number of captured lines containing every one of `needles`.
    pub fn count(&self, needles: &[&str]) -> usize {
        self.lines()
            .iter()
            .filter(|line| needles.iter().all(|needle| line.contains(needle)))
            .count()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
