//! # Node Identity and Peer Descriptors
//!
//! - [`Keypair`]: Ed25519 signing keypair, generated from the OS CSPRNG once
//!   per process start.
//! - [`Identity`]: the 32-byte public key. It names the node on the wire, in
//!   TLS certificates, and in the DHT keyspace.
//! - [`PeerDescriptor`]: an identity together with the addresses it can be
//!   dialed on. This is what bootstrap lists and rendezvous queries yield.
//!
//! Descriptors have a textual form `IP:PORT/IDENTITY_HEX`, accepted on the
//! command line for bootstrap peers.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Upper bound on addresses carried by one descriptor received off the wire.
pub const MAX_ADDRS: usize = 16;
const MAX_ADDR_LEN: usize = 64;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identity) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// Short form used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Rejects the all-zero and all-ones patterns and anything that is not a
    /// point on the Ed25519 curve.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

/// Lexicographic comparison of two XOR distances.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A remote node and the addresses it may be reached on.
///
/// Equality and hashing go by identity only: two descriptors for the same
/// node with different address lists describe the same peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub identity: Identity,
    pub addrs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerDescriptorError {
    /// The `/IDENTITY` suffix is absent.
    MissingIdentity,
    InvalidAddress(String),
    InvalidIdentity(String),
}

impl fmt::Display for PeerDescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerDescriptorError::MissingIdentity => {
                write!(f, "peer must include identity (format: IP:PORT/IDENTITY)")
            }
            PeerDescriptorError::InvalidAddress(addr) => {
                write!(f, "invalid socket address '{addr}'")
            }
            PeerDescriptorError::InvalidIdentity(reason) => {
                write!(f, "invalid identity: {reason}")
            }
        }
    }
}

impl std::error::Error for PeerDescriptorError {}

impl PeerDescriptor {
    pub fn new(identity: Identity, addrs: Vec<String>) -> Self {
        Self { identity, addrs }
    }

    pub fn single(identity: Identity, addr: SocketAddr) -> Self {
        Self::new(identity, vec![addr.to_string()])
    }

    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(String::as_str)
    }

    /// Addresses that parse as socket addresses, in listed order.
    pub fn socket_addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.addrs.iter().filter_map(|a| a.parse().ok())
    }

    /// Bounds and format check for descriptors received from other nodes.
    pub fn validate_structure(&self) -> bool {
        if self.addrs.len() > MAX_ADDRS {
            return false;
        }
        self.addrs
            .iter()
            .all(|addr| !addr.is_empty() && addr.len() <= MAX_ADDR_LEN)
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for PeerDescriptor {}

impl std::hash::Hash for PeerDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

impl FromStr for PeerDescriptor {
    type Err = PeerDescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, identity_hex) = s
            .rsplit_once('/')
            .ok_or(PeerDescriptorError::MissingIdentity)?;

        let addr: SocketAddr = addr_str
            .parse()
            .map_err(|_| PeerDescriptorError::InvalidAddress(addr_str.to_string()))?;

        if identity_hex.is_empty() {
            return Err(PeerDescriptorError::MissingIdentity);
        }
        let identity = Identity::from_hex(identity_hex)
            .map_err(|e| PeerDescriptorError::InvalidIdentity(e.to_string()))?;
        if !identity.is_valid() {
            return Err(PeerDescriptorError::InvalidIdentity(
                "not an Ed25519 public key".to_string(),
            ));
        }

        Ok(Self::single(identity, addr))
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primary_addr() {
            Some(addr) => write!(f, "{}/{}", addr, self.identity),
            None => write!(f, "{}", self.identity),
        }
    }
}
