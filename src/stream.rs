//! Protocol-tagged streams and the handlers that own them.
//!
//! A [`Stream`] is one negotiated bidirectional channel to an authenticated
//! peer. Inbound and outbound streams are handed to the same
//! [`StreamHandler`], so both sides of a chat run identical code.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::PeerTable;
use crate::identity::Identity;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

pub struct Stream {
    pub peer: Identity,
    pub remote_addr: SocketAddr,
    pub protocol: String,
    pub direction: Direction,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Stream {
    pub fn new<R, W>(
        peer: Identity,
        remote_addr: SocketAddr,
        protocol: impl Into<String>,
        direction: Direction,
        reader: R,
        writer: W,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer,
            remote_addr,
            protocol: protocol.into(),
            direction,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("peer", &self.peer)
            .field("remote_addr", &self.remote_addr)
            .field("protocol", &self.protocol)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Takes ownership of a negotiated stream. Implementations must not block:
/// long-running work goes into spawned tasks.
pub trait StreamHandler: Send + Sync + 'static {
    fn handle(&self, stream: Stream);
}

impl<F> StreamHandler for F
where
    F: Fn(Stream) + Send + Sync + 'static,
{
    fn handle(&self, stream: Stream) {
        self(stream)
    }
}

/// Protocol id -> handler. Shared by the transport (inbound streams) and the
/// discovery loop (outbound streams).
#[derive(Clone, Default)]
pub struct StreamHandlers {
    inner: Arc<RwLock<HashMap<String, Arc<dyn StreamHandler>>>>,
}

impl StreamHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any handler already registered for `protocol`.
    pub fn register(&self, protocol: impl Into<String>, handler: Arc<dyn StreamHandler>) {
        let protocol = protocol.into();
        debug!(protocol = %protocol, "registered stream handler");
        if let Ok(mut map) = self.inner.write() {
            map.insert(protocol, handler);
        }
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
        self.inner.read().ok()?.get(protocol).cloned()
    }

    pub fn supports(&self, protocol: &str) -> bool {
        self.get(protocol).is_some()
    }

    pub fn dispatch(&self, stream: Stream) -> Result<()> {
        let handler = self
            .get(&stream.protocol)
            .ok_or_else(|| anyhow!("no handler for protocol {}", stream.protocol))?;
        handler.handle(stream);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ChatLine {
    pub from: Identity,
    pub text: String,
}

/// Longest chat line accepted from a peer, excluding the newline.
pub const MAX_CHAT_LINE_LENGTH: usize = 64 * 1024;

struct LiveSession {
    id: u64,
    opener: Identity,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SessionMap {
    next_id: u64,
    live: HashMap<Identity, LiveSession>,
}

/// At most one chat session per peer. When both sides open a stream to each
/// other, the one opened by the lower identity is kept on both ends.
#[derive(Clone, Default)]
struct ChatSessions {
    inner: Arc<Mutex<SessionMap>>,
}

impl ChatSessions {
    fn with<T>(&self, f: impl FnOnce(&mut SessionMap) -> T) -> T {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut map)
    }

    /// Registers a session for a stream to `peer` opened by `opener`.
    /// Returns `None` when an existing session takes precedence.
    fn open(
        &self,
        local: Identity,
        peer: Identity,
        opener: Identity,
        parent: &CancellationToken,
    ) -> Option<(u64, CancellationToken)> {
        let preferred = local.min(peer);
        self.with(|map| {
            if let Some(existing) = map.live.get(&peer)
                && existing.opener == preferred
                && opener != preferred
            {
                return None;
            }
            map.next_id += 1;
            let id = map.next_id;
            let cancel = parent.child_token();
            let session = LiveSession {
                id,
                opener,
                cancel: cancel.clone(),
            };
            if let Some(replaced) = map.live.insert(peer, session) {
                debug!(peer = %peer.short(), "replacing duplicate chat stream");
                replaced.cancel.cancel();
            }
            Some((id, cancel))
        })
    }

    /// Removes the session for `peer` if it is still `id`.
    fn close(&self, peer: &Identity, id: u64) -> bool {
        self.with(|map| match map.live.get(peer) {
            Some(session) if session.id == id => {
                map.live.remove(peer);
                true
            }
            _ => false,
        })
    }

    fn contains(&self, peer: &Identity) -> bool {
        self.with(|map| map.live.contains_key(peer))
    }
}

/// Ends a chat session when the reader task exits.
struct SessionGuard {
    sessions: ChatSessions,
    peer: Identity,
    id: u64,
    inbound_entry: Option<PeerTable>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.sessions.close(&self.peer, self.id)
            && let Some(peers) = &self.inbound_entry
        {
            peers.release(&self.peer);
        }
    }
}

/// Newline-delimited chat. Every stream gets a reader task that forwards
/// non-empty lines to `incoming`, and a writer task that sends every line
/// published on `outgoing`. The two tasks fail independently.
///
/// A second stream to a peer that already has a session is either dropped
/// or replaces the old one, so each line reaches every peer once.
#[derive(Clone)]
pub struct ChatHandler {
    local: Identity,
    outgoing: broadcast::Sender<String>,
    incoming: mpsc::Sender<ChatLine>,
    cancel: CancellationToken,
    write_timeout: Duration,
    sessions: ChatSessions,
    peers: Option<PeerTable>,
}

impl ChatHandler {
    pub fn new(
        local: Identity,
        outgoing: broadcast::Sender<String>,
        incoming: mpsc::Sender<ChatLine>,
        cancel: CancellationToken,
        write_timeout: Duration,
    ) -> Self {
        Self {
            local,
            outgoing,
            incoming,
            cancel,
            write_timeout,
            sessions: ChatSessions::default(),
            peers: None,
        }
    }

    /// Records peers that open a chat stream to us as connected, so
    /// discovery does not dial them back.
    pub fn with_peer_table(mut self, peers: PeerTable) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn has_session(&self, peer: &Identity) -> bool {
        self.sessions.contains(peer)
    }
}

impl StreamHandler for ChatHandler {
    fn handle(&self, stream: Stream) {
        let opener = match stream.direction {
            Direction::Outbound => self.local,
            Direction::Inbound => stream.peer,
        };
        let Some((id, cancel)) = self
            .sessions
            .open(self.local, stream.peer, opener, &self.cancel)
        else {
            debug!(
                peer = %stream.peer.short(),
                direction = ?stream.direction,
                "dropping duplicate chat stream"
            );
            return;
        };

        info!(
            peer = %stream.peer.short(),
            addr = %stream.remote_addr,
            direction = ?stream.direction,
            "chat stream open"
        );

        let inbound_entry = match (&self.peers, stream.direction) {
            (Some(peers), Direction::Inbound) => {
                peers.note_inbound(stream.peer);
                Some(peers.clone())
            }
            _ => None,
        };
        let guard = SessionGuard {
            sessions: self.sessions.clone(),
            peer: stream.peer,
            id,
            inbound_entry,
        };

        // Subscribe before spawning so nothing published after `handle`
        // returns is missed.
        let lines = self.outgoing.subscribe();

        tokio::spawn(read_chat(
            stream.peer,
            stream.reader,
            self.incoming.clone(),
            cancel.clone(),
            guard,
        ));
        tokio::spawn(write_chat(
            stream.peer,
            stream.writer,
            lines,
            cancel,
            self.write_timeout,
        ));
    }
}

async fn read_chat(
    peer: Identity,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    incoming: mpsc::Sender<ChatLine>,
    cancel: CancellationToken,
    _guard: SessionGuard,
) {
    let codec = LinesCodec::new_with_max_length(MAX_CHAT_LINE_LENGTH);
    let mut lines = FramedRead::new(reader, codec);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = lines.next() => next,
        };
        match next {
            Some(Ok(text)) => {
                if text.trim().is_empty() {
                    continue;
                }
                if incoming.send(ChatLine { from: peer, text }).await.is_err() {
                    return;
                }
            }
            None => {
                debug!(peer = %peer.short(), "chat stream closed by peer");
                return;
            }
            Some(Err(e)) => {
                warn!(peer = %peer.short(), error = %e, "error reading from chat stream");
                return;
            }
        }
    }
}

async fn write_chat(
    peer: Identity,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut lines: broadcast::Receiver<String>,
    cancel: CancellationToken,
    write_timeout: Duration,
) {
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.recv() => line,
        };
        let mut line = match line {
            Ok(line) => line,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(peer = %peer.short(), skipped, "chat writer fell behind, dropped lines");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(peer = %peer.short(), error = %e, "error writing to chat stream");
                return;
            }
            Err(_) => {
                warn!(peer = %peer.short(), "timed out writing to chat stream");
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}
