//! # RPC Layer
//!
//! Connection management and the Kademlia request/response protocol.
//!
//! ## Connection cache
//!
//! [`Connections`] is a cheap-to-clone handle over an actor that owns an LRU
//! of authenticated QUIC connections keyed by identity. Concurrent requests
//! for the same peer share one dial: the first caller triggers it, later
//! callers wait for its outcome. Dials run in spawned tasks so a slow peer
//! never stalls the actor.
//!
//! ## DHT RPC
//!
//! Each RPC opens a fresh stream tagged with the DHT protocol id of the
//! instance (WAN or LAN), writes one [`DhtRequest`] frame, finishes its
//! send side and reads one [`DhtResponse`] frame.
//!
//! ## Security
//!
//! - The `from` field of a request must match the TLS-verified identity of
//!   the connection, otherwise the request is answered with an error.
//! - The observed remote address is put first in the sender's descriptor;
//!   self-reported addresses are kept after it, bounded and validated.
//! - Frames are size-capped by [`crate::messages`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use lru::LruCache;
use quinn::Connection;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::dht::{DhtNode, Key, MAX_CONTACTS_PER_RESPONSE};
use crate::identity::{Identity, MAX_ADDRS, PeerDescriptor};
use crate::messages::{DhtRequest, DhtResponse, read_frame, write_frame};
use crate::protocols::DhtNodeRpc;
use crate::stream::{Stream, StreamHandler};
use crate::transport::Transport;

const MAX_CACHED_CONNECTIONS: usize = 1_000;
const RPC_COMMAND_CHANNEL_SIZE: usize = 256;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

type ConnectReply = oneshot::Sender<Result<Connection>>;

enum ConnectionCommand {
    GetOrConnect {
        peer: PeerDescriptor,
        reply: ConnectReply,
    },
    Connected {
        identity: Identity,
        result: Result<Connection>,
    },
    Invalidate(Identity),
    Quit,
}

struct ConnectionCacheActor {
    transport: Transport,
    connections: LruCache<Identity, Connection>,
    pending: HashMap<Identity, Vec<ConnectReply>>,
    cmd_rx: mpsc::Receiver<ConnectionCommand>,
    cmd_tx: mpsc::Sender<ConnectionCommand>,
}

impl ConnectionCacheActor {
    async fn run(mut self) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ConnectionCommand::GetOrConnect { peer, reply }) => {
                            self.get_or_connect(peer, reply);
                        }
                        Some(ConnectionCommand::Connected { identity, result }) => {
                            self.connected(identity, result);
                        }
                        Some(ConnectionCommand::Invalidate(identity)) => {
                            if self.connections.pop(&identity).is_some() {
                                trace!(peer = %identity.short(), "invalidated cached connection");
                            }
                        }
                        Some(ConnectionCommand::Quit) | None => {
                            for (_, conn) in self.connections.iter() {
                                conn.close(0u32.into(), b"shutdown");
                            }
                            debug!("connection cache shutting down");
                            break;
                        }
                    }
                }
                _ = cleanup.tick() => self.evict_closed(),
            }
        }
    }

    fn get_or_connect(&mut self, peer: PeerDescriptor, reply: ConnectReply) {
        let identity = peer.identity;

        if let Some(conn) = self.connections.get(&identity) {
            if conn.close_reason().is_none() {
                let _ = reply.send(Ok(conn.clone()));
                return;
            }
            self.connections.pop(&identity);
        }

        if let Some(waiters) = self.pending.get_mut(&identity) {
            waiters.push(reply);
            return;
        }
        self.pending.insert(identity, vec![reply]);

        let transport = self.transport.clone();
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = transport.dial(&peer).await;
            let _ = tx
                .send(ConnectionCommand::Connected { identity, result })
                .await;
        });
    }

    fn connected(&mut self, identity: Identity, result: Result<Connection>) {
        let waiters = self.pending.remove(&identity).unwrap_or_default();
        match result {
            Ok(conn) => {
                self.connections.put(identity, conn.clone());
                for waiter in waiters {
                    let _ = waiter.send(Ok(conn.clone()));
                }
            }
            Err(e) => {
                let message = format!("{e:#}");
                for waiter in waiters {
                    let _ = waiter.send(Err(anyhow!("{message}")));
                }
            }
        }
    }

    fn evict_closed(&mut self) {
        let closed: Vec<Identity> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.close_reason().is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in &closed {
            self.connections.pop(id);
        }
        if !closed.is_empty() {
            trace!(count = closed.len(), "evicted closed connections");
        }
    }
}

/// Handle to the shared connection cache.
#[derive(Clone)]
pub struct Connections {
    cmd_tx: mpsc::Sender<ConnectionCommand>,
}

impl Connections {
    pub fn spawn(transport: Transport) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);
        let cap = NonZeroUsize::new(MAX_CACHED_CONNECTIONS).unwrap_or(NonZeroUsize::MIN);
        let actor = ConnectionCacheActor {
            transport,
            connections: LruCache::new(cap),
            pending: HashMap::new(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(actor.run());
        Self { cmd_tx }
    }

    /// Returns a live cached connection or dials a new one.
    pub async fn get_or_connect(&self, peer: &PeerDescriptor) -> Result<Connection> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnectionCommand::GetOrConnect {
                peer: peer.clone(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("connection cache closed"))?;
        rx.await.map_err(|_| anyhow!("connection cache closed"))?
    }

    pub async fn invalidate(&self, identity: Identity) {
        let _ = self
            .cmd_tx
            .send(ConnectionCommand::Invalidate(identity))
            .await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(ConnectionCommand::Quit).await;
    }
}

/// Client side of the DHT protocol for one DHT instance.
#[derive(Clone)]
pub struct RpcNode {
    connections: Connections,
    transport: Transport,
    self_descriptor: PeerDescriptor,
    protocol: &'static str,
    request_timeout: Duration,
}

impl RpcNode {
    pub fn new(
        connections: Connections,
        transport: Transport,
        self_descriptor: PeerDescriptor,
        protocol: &'static str,
        request_timeout: Duration,
    ) -> Self {
        Self {
            connections,
            transport,
            self_descriptor,
            protocol,
            request_timeout,
        }
    }

    async fn rpc(&self, to: &PeerDescriptor, request: DhtRequest) -> Result<DhtResponse> {
        let conn = self.connections.get_or_connect(to).await?;
        match tokio::time::timeout(self.request_timeout, self.rpc_inner(&conn, &request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                if conn.close_reason().is_some() {
                    self.connections.invalidate(to.identity).await;
                }
                Err(e)
            }
            Err(_) => Err(anyhow!("rpc to {} timed out", to.identity.short())),
        }
    }

    async fn rpc_inner(&self, conn: &Connection, request: &DhtRequest) -> Result<DhtResponse> {
        let mut stream = self.transport.open_stream(conn, self.protocol).await?;
        write_frame(&mut stream.writer, request).await?;
        stream
            .writer
            .shutdown()
            .await
            .context("failed to finish request stream")?;
        read_frame(&mut stream.reader).await
    }

    fn truncate_contacts(
        mut contacts: Vec<PeerDescriptor>,
        from: &PeerDescriptor,
    ) -> Vec<PeerDescriptor> {
        if contacts.len() > MAX_CONTACTS_PER_RESPONSE {
            warn!(
                peer = %from.identity.short(),
                count = contacts.len(),
                "truncating oversized contact list"
            );
            contacts.truncate(MAX_CONTACTS_PER_RESPONSE);
        }
        contacts
    }
}

#[async_trait]
impl DhtNodeRpc for RpcNode {
    async fn find_node(
        &self,
        to: &PeerDescriptor,
        target: Identity,
    ) -> Result<Vec<PeerDescriptor>> {
        let request = DhtRequest::FindNode {
            from: self.self_descriptor.clone(),
            target,
        };
        match self.rpc(to, request).await? {
            DhtResponse::Nodes(nodes) => Ok(Self::truncate_contacts(nodes, to)),
            DhtResponse::Error { message } => bail!("find_node rejected: {message}"),
            other => bail!("unexpected response to find_node: {other:?}"),
        }
    }

    async fn get_providers(
        &self,
        to: &PeerDescriptor,
        key: Key,
    ) -> Result<(Vec<PeerDescriptor>, Vec<PeerDescriptor>)> {
        let request = DhtRequest::GetProviders {
            from: self.self_descriptor.clone(),
            key,
        };
        match self.rpc(to, request).await? {
            DhtResponse::Providers { providers, closer } => {
                Ok((providers, Self::truncate_contacts(closer, to)))
            }
            DhtResponse::Error { message } => bail!("get_providers rejected: {message}"),
            other => bail!("unexpected response to get_providers: {other:?}"),
        }
    }

    async fn add_provider(&self, to: &PeerDescriptor, key: Key) -> Result<()> {
        let request = DhtRequest::AddProvider {
            from: self.self_descriptor.clone(),
            key,
        };
        match self.rpc(to, request).await? {
            DhtResponse::Ack => Ok(()),
            DhtResponse::Error { message } => bail!("add_provider rejected: {message}"),
            other => bail!("unexpected response to add_provider: {other:?}"),
        }
    }

    async fn ping(&self, to: &PeerDescriptor) -> Result<()> {
        let request = DhtRequest::Ping {
            from: self.self_descriptor.clone(),
        };
        match self.rpc(to, request).await? {
            DhtResponse::Ack => Ok(()),
            other => bail!("unexpected response to ping: {other:?}"),
        }
    }
}

/// Server side of the DHT protocol: answers one request per stream from
/// the local [`DhtNode`].
pub struct DhtRpcHandler<N: DhtNodeRpc> {
    dht: DhtNode<N>,
}

impl<N: DhtNodeRpc> DhtRpcHandler<N> {
    pub fn new(dht: DhtNode<N>) -> Self {
        Self { dht }
    }
}

impl<N: DhtNodeRpc> StreamHandler for DhtRpcHandler<N> {
    fn handle(&self, stream: Stream) {
        let dht = self.dht.clone();
        tokio::spawn(async move {
            let peer = stream.peer;
            if let Err(e) = serve_dht_stream(dht, stream).await {
                debug!(peer = %peer.short(), error = %e, "DHT request failed");
            }
        });
    }
}

async fn serve_dht_stream<N: DhtNodeRpc>(dht: DhtNode<N>, mut stream: Stream) -> Result<()> {
    let request: DhtRequest =
        tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame(&mut stream.reader))
            .await
            .map_err(|_| anyhow!("request read timed out"))??;

    let response = if request.sender_identity() != stream.peer {
        warn!(
            claimed = %request.sender_identity().short(),
            actual = %stream.peer.short(),
            "DHT request sender does not match connection identity"
        );
        DhtResponse::Error {
            message: "sender identity does not match connection identity".to_string(),
        }
    } else {
        let from = observed_descriptor(stream.peer, stream.remote_addr, request.sender());
        tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, handle_dht_request(&dht, from, request))
            .await
            .unwrap_or_else(|_| DhtResponse::Error {
                message: "request processing timed out".to_string(),
            })
    };

    write_frame(&mut stream.writer, &response).await?;
    stream
        .writer
        .shutdown()
        .await
        .context("failed to finish response stream")?;
    Ok(())
}

/// Observed address first, then the sender's own specified addresses.
fn observed_descriptor(
    identity: Identity,
    remote: SocketAddr,
    claimed: &PeerDescriptor,
) -> PeerDescriptor {
    let mut addrs = vec![remote.to_string()];
    if claimed.validate_structure() {
        for addr in claimed.socket_addrs() {
            if addrs.len() >= MAX_ADDRS {
                break;
            }
            if addr.ip().is_unspecified() || addr.port() == 0 {
                continue;
            }
            let addr = addr.to_string();
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
    }
    PeerDescriptor::new(identity, addrs)
}

async fn handle_dht_request<N: DhtNodeRpc>(
    dht: &DhtNode<N>,
    from: PeerDescriptor,
    request: DhtRequest,
) -> DhtResponse {
    match request {
        DhtRequest::Ping { .. } => {
            trace!(from = %from.identity.short(), "DHT ping");
            dht.observe_direct_peer(from).await;
            DhtResponse::Ack
        }
        DhtRequest::FindNode { target, .. } => {
            trace!(from = %from.identity.short(), target = %target.short(), "DHT find_node");
            DhtResponse::Nodes(dht.handle_find_node_request(&from, target).await)
        }
        DhtRequest::GetProviders { key, .. } => {
            trace!(from = %from.identity.short(), key = %hex::encode(&key[..8]), "DHT get_providers");
            let (providers, closer) = dht.handle_get_providers_request(&from, key).await;
            DhtResponse::Providers { providers, closer }
        }
        DhtRequest::AddProvider { key, .. } => {
            debug!(from = %from.identity.short(), key = %hex::encode(&key[..8]), "DHT add_provider");
            dht.handle_add_provider_request(&from, key).await;
            DhtResponse::Ack
        }
    }
}
