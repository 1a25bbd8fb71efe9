//! # QUIC Transport
//!
//! One `quinn::Endpoint` per configured [`TransportKind`], each acting as
//! both server and client on the same UDP socket. Every connection is
//! mutually authenticated with the node's Ed25519 certificate, so a
//! connection always carries the verified [`Identity`] of the remote side.
//!
//! Streams are protocol-tagged (see [`crate::messages`]). Accepted streams
//! are routed through the shared [`StreamHandlers`] registry; streams we
//! open are returned to the caller after the remote side acknowledged the
//! protocol. Both inbound and outbound connections accept streams, so a
//! peer may open protocols on a connection we dialed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{NodeConfig, TransportKind};
use crate::crypto::{
    create_client_config, create_server_config, extract_verified_identity,
    generate_ed25519_cert, identity_to_sni,
};
use crate::identity::{Identity, Keypair, PeerDescriptor};
use crate::messages::{
    read_protocol_ack, read_protocol_header, write_protocol_ack, write_protocol_header,
};
use crate::stream::{Direction, Stream, StreamHandlers};

/// Capacity of the channel reporting authenticated inbound peers.
const OBSERVED_PEER_CHANNEL_SIZE: usize = 256;

#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    identity: Identity,
    endpoints: Vec<(TransportKind, quinn::Endpoint)>,
    client_config: quinn::ClientConfig,
    handlers: StreamHandlers,
    observed_tx: mpsc::Sender<PeerDescriptor>,
    cancel: CancellationToken,
    dial_timeout: Duration,
    negotiation_timeout: Duration,
}

fn bind_addr(kind: TransportKind, host: IpAddr, port: u16) -> SocketAddr {
    let ip = match (kind, host) {
        (TransportKind::Quic, IpAddr::V4(_)) | (TransportKind::Quic6, IpAddr::V6(_)) => host,
        (TransportKind::Quic, IpAddr::V6(v6)) if v6.is_loopback() => Ipv4Addr::LOCALHOST.into(),
        (TransportKind::Quic, IpAddr::V6(_)) => Ipv4Addr::UNSPECIFIED.into(),
        (TransportKind::Quic6, IpAddr::V4(v4)) if v4.is_loopback() => Ipv6Addr::LOCALHOST.into(),
        (TransportKind::Quic6, IpAddr::V4(_)) => Ipv6Addr::UNSPECIFIED.into(),
    };
    SocketAddr::new(ip, port)
}

impl Transport {
    /// Binds every configured transport and starts accepting connections.
    ///
    /// The returned receiver yields a descriptor for each authenticated
    /// inbound connection (identity plus observed remote address). Reports
    /// are dropped when the receiver falls behind.
    pub fn bind(
        config: &NodeConfig,
        keypair: &Keypair,
        handlers: StreamHandlers,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<PeerDescriptor>)> {
        if config.transports.is_empty() {
            bail!("at least one transport must be enabled");
        }

        let (certs, key) = generate_ed25519_cert(keypair)?;
        let server_config = create_server_config(certs.clone(), key.clone_key())?;
        let client_config = create_client_config(certs, key)?;

        let mut endpoints: Vec<(TransportKind, quinn::Endpoint)> = Vec::new();
        for kind in &config.transports {
            if endpoints.iter().any(|(k, _)| k == kind) {
                continue;
            }
            let addr = bind_addr(*kind, config.listen_host, config.listen_port);
            let endpoint = quinn::Endpoint::server(server_config.clone(), addr)
                .with_context(|| format!("failed to bind {kind} endpoint on {addr}"))?;
            debug!(transport = %kind, addr = %endpoint.local_addr()?, "endpoint bound");
            endpoints.push((*kind, endpoint));
        }

        let (observed_tx, observed_rx) = mpsc::channel(OBSERVED_PEER_CHANNEL_SIZE);
        let transport = Self {
            inner: Arc::new(TransportInner {
                identity: keypair.identity(),
                endpoints,
                client_config,
                handlers,
                observed_tx,
                cancel,
                dial_timeout: config.timeouts.dial,
                negotiation_timeout: config.timeouts.negotiation,
            }),
        };

        for (_, endpoint) in &transport.inner.endpoints {
            tokio::spawn(transport.clone().accept_loop(endpoint.clone()));
        }

        Ok((transport, observed_rx))
    }

    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .endpoints
            .iter()
            .filter_map(|(_, endpoint)| endpoint.local_addr().ok())
            .collect()
    }

    /// Addresses other nodes can use to reach us. Wildcard binds are
    /// resolved to the interface that routes to the public internet, with
    /// loopback appended as a fallback.
    pub fn advertised_addrs(&self) -> Vec<String> {
        let mut addrs = Vec::new();
        for local in self.local_addrs() {
            if local.ip().is_unspecified() {
                for addr in enumerate_local_addresses(local.port(), local.is_ipv4()) {
                    if !addrs.contains(&addr) {
                        addrs.push(addr);
                    }
                }
            } else {
                addrs.push(local.to_string());
            }
        }
        addrs
    }

    fn endpoint_for(&self, addr: &SocketAddr) -> Option<&quinn::Endpoint> {
        self.inner
            .endpoints
            .iter()
            .find(|(kind, _)| kind.accepts(addr))
            .map(|(_, endpoint)| endpoint)
    }

    /// Connects to `peer`, trying each address in order. Addresses whose
    /// family has no endpoint are skipped. The connection must authenticate
    /// as `peer.identity`.
    pub async fn dial(&self, peer: &PeerDescriptor) -> Result<quinn::Connection> {
        if peer.identity == self.inner.identity {
            bail!("refusing to dial ourselves");
        }

        let sni = identity_to_sni(&peer.identity);
        let mut last_err = None;
        for addr in peer.socket_addrs() {
            if addr.ip().is_unspecified() || addr.port() == 0 {
                continue;
            }
            let Some(endpoint) = self.endpoint_for(&addr) else {
                trace!(addr = %addr, "no transport for address family");
                continue;
            };

            match self
                .connect_and_verify(endpoint, addr, &sni, &peer.identity)
                .await
            {
                Ok(conn) => {
                    debug!(peer = %peer.identity.short(), addr = %addr, "outbound connection established");
                    tokio::spawn(self.clone().serve_connection(conn.clone(), peer.identity));
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(peer = %peer.identity.short(), addr = %addr, error = %e, "dial attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            anyhow!(
                "no dialable address for peer {}",
                peer.identity.short()
            )
        }))
    }

    async fn connect_and_verify(
        &self,
        endpoint: &quinn::Endpoint,
        addr: SocketAddr,
        sni: &str,
        expected: &Identity,
    ) -> Result<quinn::Connection> {
        let connecting = endpoint
            .connect_with(self.inner.client_config.clone(), addr, sni)
            .with_context(|| format!("failed to initiate connection to {addr}"))?;

        let conn = tokio::select! {
            _ = self.inner.cancel.cancelled() => bail!("dial cancelled"),
            result = tokio::time::timeout(self.inner.dial_timeout, connecting) => result
                .map_err(|_| anyhow!("dial to {addr} timed out"))?
                .with_context(|| format!("handshake with {addr} failed"))?,
        };

        match extract_verified_identity(&conn) {
            Some(actual) if actual == *expected => Ok(conn),
            Some(actual) => {
                conn.close(1u32.into(), b"identity mismatch");
                bail!(
                    "peer at {addr} authenticated as {} instead of {}",
                    actual.short(),
                    expected.short()
                )
            }
            None => {
                conn.close(1u32.into(), b"no identity");
                bail!("peer at {addr} presented no usable identity")
            }
        }
    }

    /// Opens a stream on `conn` and negotiates `protocol`.
    pub async fn open_stream(&self, conn: &quinn::Connection, protocol: &str) -> Result<Stream> {
        let peer = extract_verified_identity(conn)
            .ok_or_else(|| anyhow!("connection has no verified identity"))?;

        let (mut send, mut recv) = conn.open_bi().await.context("failed to open stream")?;
        write_protocol_header(&mut send, protocol).await?;

        let accepted = tokio::time::timeout(
            self.inner.negotiation_timeout,
            read_protocol_ack(&mut recv),
        )
        .await
        .map_err(|_| anyhow!("protocol negotiation with {} timed out", peer.short()))??;

        if !accepted {
            let _ = send.finish();
            bail!("peer {} does not support {protocol}", peer.short());
        }

        Ok(Stream::new(
            peer,
            conn.remote_address(),
            protocol,
            Direction::Outbound,
            recv,
            send,
        ))
    }

    async fn accept_loop(self, endpoint: quinn::Endpoint) {
        loop {
            let incoming = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                incoming = endpoint.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                break;
            };

            let transport = self.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.handle_incoming(incoming).await {
                    debug!(error = %e, "inbound connection failed");
                }
            });
        }
        debug!("accept loop stopped");
    }

    async fn handle_incoming(self, incoming: quinn::Incoming) -> Result<()> {
        let conn = incoming.await.context("inbound handshake failed")?;
        let remote = conn.remote_address();

        let Some(peer) = extract_verified_identity(&conn) else {
            warn!(remote = %remote, "rejecting connection without verified identity");
            conn.close(1u32.into(), b"no identity");
            return Ok(());
        };

        info!(peer = %peer.short(), addr = %remote, "inbound connection");
        if self
            .inner
            .observed_tx
            .try_send(PeerDescriptor::single(peer, remote))
            .is_err()
        {
            trace!(peer = %peer.short(), "observed-peer channel full, dropping report");
        }

        self.serve_connection(conn, peer).await;
        Ok(())
    }

    async fn serve_connection(self, conn: quinn::Connection, peer: Identity) {
        let remote = conn.remote_address();
        loop {
            let accepted = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = conn.accept_bi() => accepted,
            };
            match accepted {
                Ok((send, recv)) => {
                    let transport = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.accept_stream(peer, remote, send, recv).await {
                            debug!(peer = %peer.short(), error = %e, "inbound stream failed");
                        }
                    });
                }
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed) => {
                    debug!(peer = %peer.short(), "connection closed");
                    break;
                }
                Err(e) => {
                    debug!(peer = %peer.short(), error = %e, "connection ended");
                    break;
                }
            }
        }
    }

    async fn accept_stream(
        &self,
        peer: Identity,
        remote: SocketAddr,
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
    ) -> Result<()> {
        let protocol = tokio::time::timeout(
            self.inner.negotiation_timeout,
            read_protocol_header(&mut recv),
        )
        .await
        .map_err(|_| anyhow!("protocol negotiation timed out"))??;

        let Some(handler) = self.inner.handlers.get(&protocol) else {
            debug!(peer = %peer.short(), protocol = %protocol, "rejecting unsupported protocol");
            write_protocol_ack(&mut send, false).await?;
            let _ = send.finish();
            return Ok(());
        };

        write_protocol_ack(&mut send, true).await?;
        trace!(peer = %peer.short(), protocol = %protocol, "inbound stream negotiated");
        handler.handle(Stream::new(
            peer,
            remote,
            protocol,
            Direction::Inbound,
            recv,
            send,
        ));
        Ok(())
    }

    pub fn close(&self) {
        for (_, endpoint) in &self.inner.endpoints {
            endpoint.close(0u32.into(), b"shutdown");
        }
    }
}

/// Finds the local address used for outbound traffic by "connecting" a UDP
/// socket to well-known resolvers. No packets are sent.
fn enumerate_local_addresses(port: u16, ipv4: bool) -> Vec<String> {
    let (bind, targets, loopback): (&str, &[&str], IpAddr) = if ipv4 {
        (
            "0.0.0.0:0",
            &["8.8.8.8:53", "1.1.1.1:53", "9.9.9.9:53"],
            Ipv4Addr::LOCALHOST.into(),
        )
    } else {
        (
            "[::]:0",
            &["[2001:4860:4860::8888]:53", "[2606:4700:4700::1111]:53"],
            Ipv6Addr::LOCALHOST.into(),
        )
    };

    let mut addresses = Vec::new();
    for target in targets {
        if let Ok(socket) = std::net::UdpSocket::bind(bind)
            && socket.connect(target).is_ok()
            && let Ok(local) = socket.local_addr()
        {
            let ip = local.ip();
            if !ip.is_loopback() && !ip.is_unspecified() {
                let addr = SocketAddr::new(ip, port).to_string();
                if !addresses.contains(&addr) {
                    addresses.push(addr);
                }
            }
        }
    }

    addresses.push(SocketAddr::new(loopback, port).to_string());
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn bind_local(
        handlers: StreamHandlers,
    ) -> (Transport, Keypair, mpsc::Receiver<PeerDescriptor>) {
        let keypair = Keypair::generate();
        let (transport, observed) = Transport::bind(
            &NodeConfig::local(),
            &keypair,
            handlers,
            CancellationToken::new(),
        )
        .expect("bind loopback transport");
        (transport, keypair, observed)
    }

    fn descriptor_of(transport: &Transport) -> PeerDescriptor {
        PeerDescriptor::new(
            transport.identity(),
            transport
                .local_addrs()
                .iter()
                .map(|a| a.to_string())
                .collect(),
        )
    }

    #[test]
    fn bind_addr_follows_family() {
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(bind_addr(TransportKind::Quic, v4, 5).to_string(), "127.0.0.1:5");
        assert_eq!(bind_addr(TransportKind::Quic6, v4, 5).to_string(), "[::1]:5");
        assert!(
            bind_addr(TransportKind::Quic, IpAddr::V6(Ipv6Addr::UNSPECIFIED), 5)
                .ip()
                .is_unspecified()
        );
    }

    #[tokio::test]
    async fn loopback_advertises_bound_address() {
        let (transport, _, _) = bind_local(StreamHandlers::new());
        let local = transport.local_addrs();
        assert_eq!(local.len(), 1);
        assert_ne!(local[0].port(), 0);
        assert_eq!(transport.advertised_addrs(), vec![local[0].to_string()]);
        transport.close();
    }

    #[tokio::test]
    async fn stream_negotiation_and_echo() {
        let server_handlers = StreamHandlers::new();
        server_handlers.register(
            "/echo/1",
            Arc::new(|mut stream: Stream| {
                tokio::spawn(async move {
                    let mut buf = [0u8; 5];
                    if stream.reader.read_exact(&mut buf).await.is_ok() {
                        let _ = stream.writer.write_all(&buf).await;
                        let _ = stream.writer.shutdown().await;
                    }
                });
            }),
        );
        let (server, _, mut observed) = bind_local(server_handlers);
        let (client, client_key, _) = bind_local(StreamHandlers::new());

        let conn = client.dial(&descriptor_of(&server)).await.expect("dial");
        let mut stream = client.open_stream(&conn, "/echo/1").await.expect("open");
        assert_eq!(stream.peer, server.identity());
        assert_eq!(stream.direction, Direction::Outbound);

        stream.writer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let seen = observed.recv().await.expect("inbound peer reported");
        assert_eq!(seen.identity, client_key.identity());

        client.close();
        server.close();
    }

    #[tokio::test]
    async fn unsupported_protocol_is_rejected() {
        let (server, _, _) = bind_local(StreamHandlers::new());
        let (client, _, _) = bind_local(StreamHandlers::new());

        let conn = client.dial(&descriptor_of(&server)).await.expect("dial");
        let err = client
            .open_stream(&conn, "/missing/1")
            .await
            .expect_err("no handler registered");
        assert!(err.to_string().contains("does not support"));
    }

    #[tokio::test]
    async fn dial_rejects_wrong_identity() {
        let (server, _, _) = bind_local(StreamHandlers::new());
        let (client, _, _) = bind_local(StreamHandlers::new());

        let impostor = PeerDescriptor::new(
            Keypair::generate().identity(),
            descriptor_of(&server).addrs,
        );
        assert!(client.dial(&impostor).await.is_err());
    }

    #[tokio::test]
    async fn dial_skips_addresses_without_transport() {
        let (client, _, _) = bind_local(StreamHandlers::new());
        let v6_only =
            PeerDescriptor::new(Keypair::generate().identity(), vec!["[::1]:4001".into()]);
        let err = client.dial(&v6_only).await.expect_err("no IPv6 endpoint");
        assert!(err.to_string().contains("no dialable address"));
    }
}
