//! # High-Level Node API
//!
//! A [`Node`] wires the transport, connection cache, DHT instances and
//! stream handlers together. Typical use:
//!
//! ```ignore
//! let node = Node::bind(NodeConfig::default()).await?;
//! let mut chat = node.enable_chat();
//!
//! node.connect_bootstrap_set().await;
//! node.run_discovery().await?;
//!
//! chat.outgoing.send("hello".into())?;
//! while let Some(line) = chat.incoming.recv().await {
//!     println!("{}: {}", line.from, line.text);
//! }
//! ```
//!
//! ## Component Integration
//!
//! - **Transport**: QUIC endpoints, protocol negotiation, inbound dispatch
//! - **Connections**: LRU connection cache shared by DHT RPCs and dials
//! - **DhtHandle**: one or two Kademlia instances used for rendezvous
//! - **StreamHandlers**: protocol id -> handler, for both stream directions
//!
//! Everything long-running hangs off one [`CancellationToken`];
//! [`Node::shutdown`] cancels it and closes the endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quinn::Connection;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bootstrap;
use crate::config::{DhtMode, NodeConfig};
use crate::dht::{AddressScope, DhtHandle, DhtNode, DhtNodeConfig};
use crate::discovery::{Discovery, PeerTable};
use crate::identity::{Identity, Keypair, MAX_ADDRS, PeerDescriptor};
use crate::messages::{CHAT_PROTOCOL, DHT_LAN_PROTOCOL, DHT_PROTOCOL};
use crate::protocols::Dialer;
use crate::rpc::{Connections, DhtRpcHandler, RpcNode};
use crate::stream::{ChatHandler, ChatLine, Stream, StreamHandler, StreamHandlers};
use crate::transport::Transport;

const CHAT_BACKLOG: usize = 256;

/// Both ends of the local chat console.
pub struct ChatSession {
    /// Lines published here are written to every open chat stream.
    pub outgoing: broadcast::Sender<String>,
    /// Lines received from any peer.
    pub incoming: mpsc::Receiver<ChatLine>,
}

pub struct Node {
    keypair: Keypair,
    config: NodeConfig,
    descriptor: PeerDescriptor,
    transport: Transport,
    connections: Connections,
    dht: DhtHandle<RpcNode>,
    handlers: StreamHandlers,
    peers: PeerTable,
    cancel: CancellationToken,
}

impl Node {
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        Self::bind_with_keypair(config, Keypair::generate()).await
    }

    pub async fn bind_with_keypair(config: NodeConfig, keypair: Keypair) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let handlers = StreamHandlers::new();

        let (transport, observed) =
            Transport::bind(&config, &keypair, handlers.clone(), cancel.child_token())
                .context("failed to start transport")?;
        let identity = transport.identity();
        let descriptor = PeerDescriptor::new(identity, transport.advertised_addrs());
        let connections = Connections::spawn(transport.clone());

        let instance = |scope: AddressScope, protocol: &'static str| {
            let self_descriptor = scope
                .restrict(&descriptor)
                .unwrap_or_else(|| descriptor.clone());
            let rpc = RpcNode::new(
                connections.clone(),
                transport.clone(),
                self_descriptor.clone(),
                protocol,
                config.timeouts.dht_query,
            );
            let node = DhtNode::new(
                identity,
                self_descriptor,
                rpc,
                DhtNodeConfig {
                    k: config.dht.k,
                    alpha: config.dht.alpha,
                    query_timeout: config.timeouts.dht_query,
                    provider_ttl: config.dht.provider_ttl,
                    scope,
                },
            );
            handlers.register(protocol, Arc::new(DhtRpcHandler::new(node.clone())));
            node
        };

        let capacity = config.discovery.peer_channel_capacity;
        let dht = match config.dht.mode {
            DhtMode::Single => {
                DhtHandle::single(instance(AddressScope::Any, DHT_PROTOCOL), capacity)
            }
            DhtMode::Dual => DhtHandle::dual(
                instance(AddressScope::Wan, DHT_PROTOCOL),
                instance(AddressScope::Lan, DHT_LAN_PROTOCOL),
                capacity,
            ),
        };

        tokio::spawn(forward_observed_peers(observed, dht.clone(), cancel.clone()));

        info!(identity = %identity, mode = ?config.dht.mode, "host created");
        for addr in &descriptor.addrs {
            info!("listening on {addr}/{identity}");
        }

        Ok(Self {
            keypair,
            config,
            descriptor,
            transport,
            connections,
            dht,
            handlers,
            peers: PeerTable::default(),
            cancel,
        })
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Identity plus advertised addresses; what other nodes put in their
    /// bootstrap lists.
    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.transport.local_addrs()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn dht(&self) -> &DhtHandle<RpcNode> {
        &self.dht
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers `handler` for streams tagged `protocol`, in both directions.
    pub fn on_stream<H: StreamHandler>(&self, protocol: impl Into<String>, handler: H) {
        self.handlers.register(protocol, Arc::new(handler));
    }

    /// Installs the chat handler and returns the console channels. Peers that
    /// open a chat stream to us show up in [`Node::peers`].
    pub fn enable_chat(&self) -> ChatSession {
        let (outgoing, _) = broadcast::channel(CHAT_BACKLOG);
        let (incoming_tx, incoming) = mpsc::channel(CHAT_BACKLOG);
        self.on_stream(
            CHAT_PROTOCOL,
            ChatHandler::new(
                self.identity(),
                outgoing.clone(),
                incoming_tx,
                self.cancel.child_token(),
                self.config.timeouts.stream_write,
            )
            .with_peer_table(self.peers.clone()),
        );
        ChatSession { outgoing, incoming }
    }

    pub fn dialer(&self) -> PeerDialer {
        PeerDialer {
            connections: self.connections.clone(),
            transport: self.transport.clone(),
            dht: self.dht.clone(),
        }
    }

    /// Dials every configured bootstrap peer and waits for all attempts.
    pub async fn connect_bootstrap_set(&self) {
        bootstrap::connect_bootstrap_set(
            &self.dialer(),
            &self.config.bootstrap,
            self.config.timeouts.dial,
            &self.cancel,
        )
        .await;
    }

    /// Connects to `peer` and opens a stream for `protocol`. The stream is
    /// returned to the caller instead of going through the handlers.
    pub async fn open_stream(&self, peer: &PeerDescriptor, protocol: &str) -> Result<Stream> {
        let dialer = self.dialer();
        let conn = tokio::time::timeout(self.config.timeouts.dial, dialer.dial(peer))
            .await
            .context("dial timed out")??;
        tokio::time::timeout(
            self.config.timeouts.stream_open,
            dialer.open_stream(&conn, protocol),
        )
        .await
        .context("stream open timed out")?
    }

    /// Bootstrap, advertise and connect to every peer found under the
    /// configured rendezvous tag.
    pub async fn run_discovery(&self) -> Result<()> {
        Discovery::new(
            Arc::new(self.dht.clone()),
            self.dialer(),
            self.handlers.clone(),
            self.identity(),
        )
        .with_config(self.config.discovery.clone())
        .with_timeouts(self.config.timeouts.clone())
        .with_peer_table(self.peers.clone())
        .run(&self.config.rendezvous_tag, self.cancel.child_token())
        .await
    }

    pub async fn shutdown(&self) {
        debug!("shutting down node");
        self.cancel.cancel();
        self.dht.quit().await;
        self.connections.quit().await;
        self.transport.close();
    }
}

async fn forward_observed_peers(
    mut observed: mpsc::Receiver<PeerDescriptor>,
    dht: DhtHandle<RpcNode>,
    cancel: CancellationToken,
) {
    loop {
        let peer = tokio::select! {
            _ = cancel.cancelled() => break,
            peer = observed.recv() => peer,
        };
        let Some(peer) = peer else {
            break;
        };
        dht.observe_peer(peer).await;
    }
}

/// [`Dialer`] over the shared connection cache. A successful dial seeds the
/// DHT routing tables with the peer.
#[derive(Clone)]
pub struct PeerDialer {
    connections: Connections,
    transport: Transport,
    dht: DhtHandle<RpcNode>,
}

#[async_trait]
impl Dialer for PeerDialer {
    type Connection = Connection;

    async fn dial(&self, peer: &PeerDescriptor) -> Result<Connection> {
        let conn = self.connections.get_or_connect(peer).await?;

        let mut addrs = vec![conn.remote_address().to_string()];
        for addr in &peer.addrs {
            if addrs.len() >= MAX_ADDRS {
                break;
            }
            if !addrs.contains(addr) {
                addrs.push(addr.clone());
            }
        }
        self.dht
            .observe_peer(PeerDescriptor::new(peer.identity, addrs))
            .await;
        Ok(conn)
    }

    async fn open_stream(&self, conn: &Connection, protocol: &str) -> Result<Stream> {
        self.transport.open_stream(conn, protocol).await
    }

    async fn closed(&self, conn: &Connection) {
        conn.closed().await;
    }
}
