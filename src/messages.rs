//! # Wire Protocol Messages
//!
//! Every stream opened between two meshchat nodes starts with a protocol
//! header so the acceptor can route it to the right handler:
//!
//! ```text
//! opener   -> [len: u8][protocol id: len bytes]
//! acceptor -> [1 = accepted | 0 = unsupported]
//! ```
//!
//! After the header, each protocol owns the stream. The DHT protocol uses
//! one request/response exchange per stream, framed as a big-endian `u32`
//! length followed by a bincode body. The chat protocol is raw
//! newline-delimited UTF-8.
//!
//! All deserialization goes through [`deserialize_bounded`], which caps the
//! allocation a peer can force on us.

use anyhow::{Context, Result, bail};
use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dht::Key;
use crate::identity::{Identity, PeerDescriptor};

/// Line-based chat between two peers.
pub const CHAT_PROTOCOL: &str = "/meshchat/chat/1.0.0";
/// Kademlia RPC for the public (WAN) DHT.
pub const DHT_PROTOCOL: &str = "/meshchat/kad/1.0.0";
/// Kademlia RPC for the LAN DHT in dual mode.
pub const DHT_LAN_PROTOCOL: &str = "/meshchat/kad/lan/1.0.0";

pub const MAX_PROTOCOL_LEN: usize = 128;
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

const PROTOCOL_ACCEPTED: u8 = 1;
const PROTOCOL_UNSUPPORTED: u8 = 0;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub async fn write_protocol_header<W>(writer: &mut W, protocol: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        bail!("protocol id length {} out of range", protocol.len());
    }
    let mut header = Vec::with_capacity(1 + protocol.len());
    header.push(protocol.len() as u8);
    header.extend_from_slice(protocol.as_bytes());
    writer
        .write_all(&header)
        .await
        .context("failed to write protocol header")?;
    writer.flush().await.context("failed to flush protocol header")
}

pub async fn read_protocol_header<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader
        .read_u8()
        .await
        .context("failed to read protocol header length")? as usize;
    if len == 0 || len > MAX_PROTOCOL_LEN {
        bail!("protocol id length {len} out of range");
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .context("failed to read protocol id")?;
    String::from_utf8(buf).context("protocol id is not UTF-8")
}

pub async fn write_protocol_ack<W>(writer: &mut W, accepted: bool) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let byte = if accepted {
        PROTOCOL_ACCEPTED
    } else {
        PROTOCOL_UNSUPPORTED
    };
    writer
        .write_all(&[byte])
        .await
        .context("failed to write protocol ack")?;
    writer.flush().await.context("failed to flush protocol ack")
}

/// Returns `Ok(false)` when the remote side does not speak the protocol.
pub async fn read_protocol_ack<R>(reader: &mut R) -> Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader
        .read_u8()
        .await
        .context("failed to read protocol ack")?
    {
        PROTOCOL_ACCEPTED => Ok(true),
        PROTOCOL_UNSUPPORTED => Ok(false),
        other => bail!("unexpected protocol ack byte {other}"),
    }
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = serialize(value).context("failed to serialize frame")?;
    if bytes.len() > MAX_FRAME_SIZE {
        bail!("frame of {} bytes exceeds limit", bytes.len());
    }
    writer
        .write_all(&(bytes.len() as u32).to_be_bytes())
        .await
        .context("failed to write frame length")?;
    writer
        .write_all(&bytes)
        .await
        .context("failed to write frame body")?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let len = reader
        .read_u32()
        .await
        .context("failed to read frame length")? as usize;
    if len > MAX_FRAME_SIZE {
        bail!("frame of {len} bytes exceeds limit");
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .context("failed to read frame body")?;
    deserialize_bounded(&buf).context("failed to decode frame")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping {
        from: PeerDescriptor,
    },
    FindNode {
        from: PeerDescriptor,
        target: Identity,
    },
    GetProviders {
        from: PeerDescriptor,
        key: Key,
    },
    /// Registers `from` as a provider of `key` on the receiving node.
    AddProvider {
        from: PeerDescriptor,
        key: Key,
    },
}

impl DhtRequest {
    pub fn sender(&self) -> &PeerDescriptor {
        match self {
            DhtRequest::Ping { from }
            | DhtRequest::FindNode { from, .. }
            | DhtRequest::GetProviders { from, .. }
            | DhtRequest::AddProvider { from, .. } => from,
        }
    }

    pub fn sender_identity(&self) -> Identity {
        self.sender().identity
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtResponse {
    Ack,
    Nodes(Vec<PeerDescriptor>),
    Providers {
        providers: Vec<PeerDescriptor>,
        closer: Vec<PeerDescriptor>,
    },
    Error {
        message: String,
    },
}
