//! # meshchat - Rendezvous Chat over a Kademlia Overlay
//!
//! A meshchat node:
//!
//! - creates an Ed25519 identity and binds QUIC endpoints authenticated with it
//! - connects to a small set of bootstrap peers, tolerating failures
//! - advertises itself in the DHT under a shared rendezvous tag and looks up
//!   every other node advertising the same tag
//! - opens a line-based chat stream to each peer it finds
//!
//! ## Architecture
//!
//! Stateful components use the actor pattern: a cheap-to-clone handle sends
//! commands over a bounded channel to a task that owns the state
//! (`DhtNode`, `Connections`). The discovery loop only sees the [`Dialer`]
//! and [`Rendezvous`] traits, so it runs unchanged against in-memory fakes.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Wires everything together behind [`Node`] |
//! | `config` | [`NodeConfig`] and its sections |
//! | `identity` | Keypairs, identities, peer descriptors |
//! | `crypto` | Self-signed Ed25519 certificates and pinned TLS verification |
//! | `transport` | QUIC endpoints, dialing, protocol negotiation |
//! | `stream` | Streams, the handler registry, the chat handler |
//! | `rpc` | Connection cache and the Kademlia RPC protocol |
//! | `dht` | Routing table, provider records, iterative lookups |
//! | `bootstrap` | Parallel bootstrap connector |
//! | `discovery` | Rendezvous discovery loop |
//! | `protocols` | Collaborator traits |
//! | `messages` | Wire framing and DHT message types |

mod bootstrap;
mod config;
mod crypto;
mod dht;
mod discovery;
mod identity;
mod messages;
mod node;
mod protocols;
mod rpc;
mod stream;
mod transport;

#[cfg(test)]
mod testing;

pub use bootstrap::connect_bootstrap_set;
pub use config::{
    DEFAULT_RENDEZVOUS_TAG, DhtConfig, DhtMode, DiscoveryConfig, NodeConfig, Timeouts,
    TransportKind,
};
pub use dht::{AddressScope, DhtHandle, rendezvous_key};
pub use discovery::{Discovery, PeerState, PeerTable};
pub use identity::{Identity, Keypair, PeerDescriptor, PeerDescriptorError};
pub use messages::{CHAT_PROTOCOL, DHT_LAN_PROTOCOL, DHT_PROTOCOL};
pub use node::{ChatSession, Node, PeerDialer};
pub use protocols::{Dialer, Rendezvous};
pub use rpc::RpcNode;
pub use stream::{
    ChatHandler, ChatLine, Direction, MAX_CHAT_LINE_LENGTH, Stream, StreamHandler, StreamHandlers,
};
