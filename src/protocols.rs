//! Collaborator traits for meshchat's networking layer.
//!
//! The discovery and bootstrap logic never touches QUIC or the Kademlia
//! actor directly. It sees these narrow seams instead, which the node wires
//! to real implementations and the tests wire to in-memory fakes.
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`DhtNodeRpc`] | `RpcNode` | Kademlia RPCs to a single remote node |
//! | [`Dialer`] | `PeerDialer` | Connect to a peer and open protocol streams |
//! | [`Rendezvous`] | `DhtHandle` | Bootstrap, advertise under a tag, find peers |

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::dht::Key;
use crate::identity::{Identity, PeerDescriptor};
use crate::stream::Stream;

/// Kademlia operations against one remote node.
#[async_trait]
pub trait DhtNodeRpc: Send + Sync + 'static {
    async fn find_node(
        &self,
        to: &PeerDescriptor,
        target: Identity,
    ) -> Result<Vec<PeerDescriptor>>;

    /// Returns `(providers, closer_nodes)`.
    async fn get_providers(
        &self,
        to: &PeerDescriptor,
        key: Key,
    ) -> Result<(Vec<PeerDescriptor>, Vec<PeerDescriptor>)>;

    async fn add_provider(&self, to: &PeerDescriptor, key: Key) -> Result<()>;

    async fn ping(&self, to: &PeerDescriptor) -> Result<()>;
}

/// Outbound half of the transport: authenticated connections and
/// protocol-tagged streams on top of them.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    /// Establishes an authenticated connection. The remote side must prove
    /// ownership of `peer.identity`.
    async fn dial(&self, peer: &PeerDescriptor) -> Result<Self::Connection>;

    /// Opens a stream and negotiates `protocol` on it.
    async fn open_stream(&self, conn: &Self::Connection, protocol: &str) -> Result<Stream>;

    /// Resolves once the connection is gone, for whatever reason.
    async fn closed(&self, conn: &Self::Connection);
}

/// DHT-backed rendezvous: publish presence under a tag and look up others
/// that did the same.
#[async_trait]
pub trait Rendezvous: Send + Sync + 'static {
    /// Populates the routing table from the peers already connected.
    async fn bootstrap(&self) -> Result<()>;

    async fn advertise(&self, tag: &str) -> Result<()>;

    /// Starts a provider lookup. Descriptors arrive on the returned channel
    /// as they are found; the channel closes when the lookup is exhausted.
    /// May yield the local node itself.
    async fn find_peers(&self, tag: &str) -> Result<mpsc::Receiver<PeerDescriptor>>;
}
