//! # Node Configuration
//!
//! Everything a node needs to start is collected in [`NodeConfig`]. All
//! sections implement `Default`, so callers override only what they care
//! about:
//!
//! ```ignore
//! let config = NodeConfig {
//!     listen_port: 4001,
//!     dht: DhtConfig { mode: DhtMode::Dual, ..Default::default() },
//!     ..Default::default()
//! };
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::identity::PeerDescriptor;

pub const DEFAULT_RENDEZVOUS_TAG: &str = "rendezvous";

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ADVERTISE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_K: usize = 20;
pub const DEFAULT_ALPHA: usize = 3;
pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_READVERTISE_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_CONCURRENT_DIALS: usize = 16;
pub const DEFAULT_PEER_CHANNEL_CAPACITY: usize = 64;

/// Transports a node listens and dials on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// QUIC over UDP/IPv4.
    Quic,
    /// QUIC over UDP/IPv6.
    Quic6,
}

impl TransportKind {
    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            TransportKind::Quic => addr.is_ipv4(),
            TransportKind::Quic6 => addr.is_ipv6(),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quic" | "quic4" => Ok(TransportKind::Quic),
            "quic6" => Ok(TransportKind::Quic6),
            other => Err(format!("unknown transport '{other}' (expected quic or quic6)")),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Quic => write!(f, "quic"),
            TransportKind::Quic6 => write!(f, "quic6"),
        }
    }
}

/// `Single` runs one DHT over every peer. `Dual` splits the keyspace into a
/// LAN table (private and loopback addresses) and a WAN table (public
/// addresses) and queries both.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DhtMode {
    #[default]
    Single,
    Dual,
}

impl FromStr for DhtMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(DhtMode::Single),
            "dual" => Ok(DhtMode::Dual),
            other => Err(format!("unknown DHT mode '{other}' (expected single or dual)")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub mode: DhtMode,
    /// Bucket size and replication factor.
    pub k: usize,
    /// Parallel queries per lookup round.
    pub alpha: usize,
    pub provider_ttl: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            mode: DhtMode::default(),
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            provider_ttl: DEFAULT_PROVIDER_TTL,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Timeouts {
    pub dial: Duration,
    pub stream_open: Duration,
    /// Per-RPC bound inside DHT lookups.
    pub dht_query: Duration,
    pub advertise: Duration,
    pub stream_write: Duration,
    /// Bound on reading the protocol header of an inbound stream.
    pub negotiation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            dial: DEFAULT_DIAL_TIMEOUT,
            stream_open: DEFAULT_STREAM_OPEN_TIMEOUT,
            dht_query: DEFAULT_DHT_QUERY_TIMEOUT,
            advertise: DEFAULT_ADVERTISE_TIMEOUT,
            stream_write: DEFAULT_STREAM_WRITE_TIMEOUT,
            negotiation: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// When set, the provider query is re-issued on this interval and
    /// discovery runs until cancelled. When `None`, discovery returns once
    /// the first query is exhausted and its connects have finished.
    pub rediscover_interval: Option<Duration>,
    pub readvertise_interval: Duration,
    pub max_concurrent_dials: usize,
    pub peer_channel_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rediscover_interval: None,
            readvertise_interval: DEFAULT_READVERTISE_INTERVAL,
            max_concurrent_dials: DEFAULT_MAX_CONCURRENT_DIALS,
            peer_channel_capacity: DEFAULT_PEER_CHANNEL_CAPACITY,
        }
    }
}

impl DiscoveryConfig {
    /// Rejects intervals and limits the discovery loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.readvertise_interval.is_zero() {
            bail!("readvertise_interval must be non-zero");
        }
        if self.rediscover_interval.is_some_and(|period| period.is_zero()) {
            bail!("rediscover_interval must be non-zero (None runs discovery once)");
        }
        if self.max_concurrent_dials == 0 {
            bail!("max_concurrent_dials must be at least 1");
        }
        if self.peer_channel_capacity == 0 {
            bail!("peer_channel_capacity must be at least 1");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub listen_host: IpAddr,
    /// `0` picks an ephemeral port.
    pub listen_port: u16,
    pub transports: Vec<TransportKind>,
    pub bootstrap: Vec<PeerDescriptor>,
    pub rendezvous_tag: String,
    pub dht: DhtConfig,
    pub timeouts: Timeouts,
    pub discovery: DiscoveryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 0,
            transports: vec![TransportKind::Quic],
            bootstrap: Vec::new(),
            rendezvous_tag: DEFAULT_RENDEZVOUS_TAG.to_string(),
            dht: DhtConfig::default(),
            timeouts: Timeouts::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loopback on an ephemeral port. Used by tests and local demos.
    pub fn local() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.transports.is_empty() {
            bail!("at least one transport must be enabled");
        }
        self.discovery
            .validate()
            .context("invalid discovery configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_everywhere_on_ephemeral_port() {
        let config = NodeConfig::default();
        assert!(config.listen_host.is_unspecified());
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.transports, vec![TransportKind::Quic]);
        assert_eq!(config.rendezvous_tag, "rendezvous");
        assert_eq!(config.dht.mode, DhtMode::Single);
        assert!(config.discovery.rediscover_interval.is_none());
    }

    #[test]
    fn transport_parsing() {
        assert_eq!("quic".parse::<TransportKind>(), Ok(TransportKind::Quic));
        assert_eq!("quic6".parse::<TransportKind>(), Ok(TransportKind::Quic6));
        assert!("tcp".parse::<TransportKind>().is_err());
    }

    #[test]
    fn transport_matches_address_family() {
        let v4: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let v6: SocketAddr = "[::1]:1".parse().unwrap();
        assert!(TransportKind::Quic.accepts(&v4));
        assert!(!TransportKind::Quic.accepts(&v6));
        assert!(TransportKind::Quic6.accepts(&v6));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(NodeConfig::default().validate().is_ok());

        let mut config = NodeConfig::default();
        config.discovery.readvertise_interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("readvertise_interval"));

        let mut config = NodeConfig::default();
        config.discovery.rediscover_interval = Some(Duration::ZERO);
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.discovery.max_concurrent_dials = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.transports.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn dht_mode_parsing() {
        assert_eq!("dual".parse::<DhtMode>(), Ok(DhtMode::Dual));
        assert!("triple".parse::<DhtMode>().is_err());
    }
}
