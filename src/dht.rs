//! # Kademlia DHT with Provider Records
//!
//! The DHT is only used for rendezvous: a node *advertises* itself as a
//! provider of a key derived from a shared tag, and other nodes *find
//! providers* of that key.
//!
//! ## Layout
//!
//! - [`RoutingTable`]: 256 k-buckets keyed by XOR distance, ping-the-oldest
//!   eviction, stale-bucket refresh with random targets.
//! - `ProviderStore`: bounded LRU of `key -> provider records`, expired
//!   after a TTL.
//! - [`DhtNode`]: cheap-to-clone handle over a private actor that owns the
//!   routing table and provider store. Iterative lookups run on the handle
//!   so the actor never blocks on the network.
//! - [`DhtHandle`]: one or two `DhtNode`s (single or dual mode) exposed
//!   through the [`Rendezvous`] trait.
//!
//! ## Address scopes
//!
//! In dual mode a LAN instance only keeps peers reachable on private or
//! loopback addresses and a WAN instance only keeps public ones. The filter
//! is applied on every insertion, so the two routing tables never mix.
//!
//! ## Trust
//!
//! Only peers we have exchanged an authenticated RPC with are inserted into
//! the routing table. Contacts learned from responses are queried during the
//! lookup but are not trusted until they answer.

use std::collections::{BinaryHeap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::config::{DEFAULT_ALPHA, DEFAULT_DHT_QUERY_TIMEOUT, DEFAULT_K, DEFAULT_PROVIDER_TTL};
use crate::identity::{Identity, PeerDescriptor, distance_cmp};
use crate::protocols::{DhtNodeRpc, Rendezvous};

pub type Key = [u8; 32];

/// Domain prefix for deriving DHT keys from rendezvous tags.
pub const RENDEZVOUS_KEY_DOMAIN: &[u8] = b"meshchat-rendezvous-v1:";

const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);
const BUCKET_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
const PROVIDER_EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

const MAX_PROVIDER_KEYS: usize = 10_000;
pub const MAX_PROVIDERS_PER_KEY: usize = 64;
pub const MAX_CONTACTS_PER_RESPONSE: usize = 100;

const MAX_LOOKUP_ITERATIONS: usize = 20;
const LOOKUP_TOTAL_TIMEOUT: Duration = Duration::from_secs(20);
const COMMAND_CHANNEL_SIZE: usize = 100;

pub fn rendezvous_key(tag: &str) -> Key {
    let mut hasher = blake3::Hasher::new();
    hasher.update(RENDEZVOUS_KEY_DOMAIN);
    hasher.update(tag.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Private, loopback and link-local ranges.
pub fn is_lan_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Which peer addresses a DHT instance is willing to route to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressScope {
    Any,
    Lan,
    Wan,
}

impl AddressScope {
    pub fn admits(&self, addr: &SocketAddr) -> bool {
        if addr.ip().is_unspecified() || addr.port() == 0 {
            return false;
        }
        match self {
            AddressScope::Any => true,
            AddressScope::Lan => is_lan_ip(&addr.ip()),
            AddressScope::Wan => !is_lan_ip(&addr.ip()),
        }
    }

    /// Drops the addresses outside this scope. `None` when nothing is left.
    pub fn restrict(&self, peer: &PeerDescriptor) -> Option<PeerDescriptor> {
        let mut addrs: Vec<String> = Vec::new();
        for addr in peer.socket_addrs().filter(|a| self.admits(a)) {
            let addr = addr.to_string();
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        if addrs.is_empty() {
            None
        } else {
            Some(PeerDescriptor::new(peer.identity, addrs))
        }
    }
}

#[derive(Debug, Clone)]
struct RoutingBucket {
    contacts: Vec<PeerDescriptor>,
    last_refresh: Instant,
}

#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full {
        new_contact: Box<PeerDescriptor>,
        oldest: Box<PeerDescriptor>,
    },
}

#[derive(Clone, Debug)]
struct PendingBucketUpdate {
    bucket_index: usize,
    oldest: PeerDescriptor,
    new_contact: PeerDescriptor,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    /// Most recently seen contacts live at the tail.
    fn touch(&mut self, contact: PeerDescriptor, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self
            .contacts
            .iter()
            .position(|c| c.identity == contact.identity)
        {
            self.contacts.remove(pos);
            self.contacts.push(contact);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push(contact);
            self.mark_refreshed();
            return BucketTouchOutcome::Inserted;
        }

        match self.contacts.first() {
            Some(oldest) => BucketTouchOutcome::Full {
                oldest: Box::new(oldest.clone()),
                new_contact: Box::new(contact),
            },
            // k == 0
            None => BucketTouchOutcome::Refreshed,
        }
    }

    fn refresh(&mut self, id: &Identity) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.identity == id) {
            let existing = self.contacts.remove(pos);
            self.contacts.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &Identity) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.identity == id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }
}

fn bucket_index(self_id: &Identity, other: &Identity) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    255
}

/// A random identity that lands in bucket `bucket_idx` relative to `self_id`.
fn random_id_for_bucket(self_id: &Identity, bucket_idx: usize) -> Identity {
    let self_bytes = self_id.as_bytes();

    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self_bytes[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
        }
    }

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;
    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_bytes[i] ^ distance[i];
    }
    Identity::from_bytes(target)
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: Identity,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: Identity, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: (0..256).map(|_| RoutingBucket::new()).collect(),
        }
    }

    #[cfg(test)]
    pub fn update(&mut self, contact: PeerDescriptor) {
        let _ = self.update_with_pending(contact);
    }

    fn update_with_pending(&mut self, contact: PeerDescriptor) -> Option<PendingBucketUpdate> {
        if contact.identity == self.self_id || !contact.identity.is_valid() {
            return None;
        }
        let idx = bucket_index(&self.self_id, &contact.identity);
        match self.buckets[idx].touch(contact, self.k) {
            BucketTouchOutcome::Inserted | BucketTouchOutcome::Refreshed => None,
            BucketTouchOutcome::Full {
                new_contact,
                oldest,
            } => Some(PendingBucketUpdate {
                bucket_index: idx,
                oldest: *oldest,
                new_contact: *new_contact,
            }),
        }
    }

    pub fn closest(&self, target: &Identity, k: usize) -> Vec<PeerDescriptor> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct ByDistance {
            dist: [u8; 32],
            contact: PeerDescriptor,
        }

        impl Ord for ByDistance {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for ByDistance {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<ByDistance> = BinaryHeap::with_capacity(k + 1);
        for contact in self.buckets.iter().flat_map(|b| b.contacts.iter()) {
            let dist = contact.identity.xor_distance(target);
            if heap.len() < k {
                heap.push(ByDistance {
                    dist,
                    contact: contact.clone(),
                });
            } else if let Some(max_entry) = heap.peek()
                && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
            {
                heap.push(ByDistance {
                    dist,
                    contact: contact.clone(),
                });
                heap.pop();
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|entry| entry.contact)
            .collect()
    }

    fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.identity);
            return;
        }

        bucket.remove(&pending.oldest.identity);
        let already_present = bucket
            .contacts
            .iter()
            .any(|c| c.identity == pending.new_contact.identity);
        if !already_present && bucket.contacts.len() < self.k {
            bucket.contacts.push(pending.new_contact);
        }
    }

    fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.contacts.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }

    #[cfg(test)]
    fn lookup(&self, identity: &Identity) -> Option<PeerDescriptor> {
        if *identity == self.self_id {
            return None;
        }
        self.buckets[bucket_index(&self.self_id, identity)]
            .contacts
            .iter()
            .find(|c| c.identity == *identity)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ProviderRecord {
    provider: PeerDescriptor,
    published_at: Instant,
}

impl ProviderRecord {
    fn is_live(&self, ttl: Duration) -> bool {
        self.published_at.elapsed() < ttl
    }
}

struct ProviderStore {
    records: LruCache<Key, Vec<ProviderRecord>>,
    ttl: Duration,
}

impl ProviderStore {
    fn new(ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(MAX_PROVIDER_KEYS).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: LruCache::new(cap),
            ttl,
        }
    }

    fn add(&mut self, key: Key, provider: PeerDescriptor) {
        let record = ProviderRecord {
            provider,
            published_at: Instant::now(),
        };
        let Some(list) = self.records.get_mut(&key) else {
            self.records.put(key, vec![record]);
            return;
        };

        if let Some(existing) = list
            .iter_mut()
            .find(|r| r.provider.identity == record.provider.identity)
        {
            *existing = record;
            return;
        }
        if list.len() >= MAX_PROVIDERS_PER_KEY
            && let Some(oldest) = list
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.published_at)
                .map(|(i, _)| i)
        {
            list.swap_remove(oldest);
        }
        list.push(record);
    }

    fn get(&mut self, key: &Key) -> Vec<PeerDescriptor> {
        let ttl = self.ttl;
        self.records
            .get(key)
            .map(|list| {
                list.iter()
                    .filter(|r| r.is_live(ttl))
                    .map(|r| r.provider.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn expire(&mut self) -> usize {
        let ttl = self.ttl;
        let mut removed = 0;
        let mut empty_keys = Vec::new();
        for (key, list) in self.records.iter_mut() {
            let before = list.len();
            list.retain(|r| r.is_live(ttl));
            removed += before - list.len();
            if list.is_empty() {
                empty_keys.push(*key);
            }
        }
        for key in empty_keys {
            self.records.pop(&key);
        }
        removed
    }
}

#[derive(Clone, Debug)]
pub struct DhtNodeConfig {
    pub k: usize,
    pub alpha: usize,
    pub query_timeout: Duration,
    pub provider_ttl: Duration,
    pub scope: AddressScope,
}

impl Default for DhtNodeConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            query_timeout: DEFAULT_DHT_QUERY_TIMEOUT,
            provider_ttl: DEFAULT_PROVIDER_TTL,
            scope: AddressScope::Any,
        }
    }
}

pub struct DhtNode<N: DhtNodeRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: Identity,
    self_descriptor: PeerDescriptor,
    network: Arc<N>,
    query_timeout: Duration,
    scope: AddressScope,
}

impl<N: DhtNodeRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            self_descriptor: self.self_descriptor.clone(),
            network: self.network.clone(),
            query_timeout: self.query_timeout,
            scope: self.scope,
        }
    }
}

struct DhtNodeActor<N: DhtNodeRpc> {
    routing: RoutingTable,
    providers: ProviderStore,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    id: Identity,
    k: usize,
    alpha: usize,
    scope: AddressScope,
}

type ProvidersReply = (Vec<PeerDescriptor>, Vec<PeerDescriptor>);

enum Command {
    /// A peer that just proved its identity over an authenticated connection.
    ObserveDirectPeer(PeerDescriptor),
    GetLookupParams(Identity, oneshot::Sender<(usize, usize, Vec<PeerDescriptor>)>),
    RoutingSize(oneshot::Sender<usize>),

    HandleFindNode(PeerDescriptor, Identity, oneshot::Sender<Vec<PeerDescriptor>>),
    HandleGetProviders(PeerDescriptor, Key, oneshot::Sender<ProvidersReply>),
    HandleAddProvider(PeerDescriptor, Key),

    AddLocalProvider(Key, PeerDescriptor),
    LocalProviders(Key, oneshot::Sender<Vec<PeerDescriptor>>),

    GetStaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    ApplyPingResult(PendingBucketUpdate, bool),

    Quit,
}

#[derive(Clone, Copy)]
enum LookupKind {
    Nodes,
    Providers(Key),
}

impl<N: DhtNodeRpc> DhtNode<N> {
    pub fn new(
        id: Identity,
        self_descriptor: PeerDescriptor,
        network: N,
        config: DhtNodeConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let network = Arc::new(network);

        let actor = DhtNodeActor {
            routing: RoutingTable::new(id, config.k),
            providers: ProviderStore::new(config.provider_ttl),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            id,
            k: config.k,
            alpha: config.alpha.max(1),
            scope: config.scope,
        };
        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            id,
            self_descriptor,
            network,
            query_timeout: config.query_timeout,
            scope: config.scope,
        };
        node.spawn_periodic_bucket_refresh();
        node
    }

    pub fn identity(&self) -> Identity {
        self.id
    }

    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.self_descriptor
    }

    pub fn scope(&self) -> AddressScope {
        self.scope
    }

    async fn send_cmd(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("DHT actor closed"))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(make(tx)).await?;
        rx.await.map_err(|_| anyhow!("DHT actor closed"))
    }

    pub async fn observe_direct_peer(&self, peer: PeerDescriptor) {
        let _ = self.cmd_tx.send(Command::ObserveDirectPeer(peer)).await;
    }

    pub async fn routing_size(&self) -> Result<usize> {
        self.request(Command::RoutingSize).await
    }

    pub async fn handle_find_node_request(
        &self,
        from: &PeerDescriptor,
        target: Identity,
    ) -> Vec<PeerDescriptor> {
        self.request(|tx| Command::HandleFindNode(from.clone(), target, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_get_providers_request(
        &self,
        from: &PeerDescriptor,
        key: Key,
    ) -> (Vec<PeerDescriptor>, Vec<PeerDescriptor>) {
        self.request(|tx| Command::HandleGetProviders(from.clone(), key, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_add_provider_request(&self, from: &PeerDescriptor, key: Key) {
        let _ = self
            .cmd_tx
            .send(Command::HandleAddProvider(from.clone(), key))
            .await;
    }

    fn spawn_periodic_bucket_refresh(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BUCKET_REFRESH_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;

                let Ok(stale_buckets) = node
                    .request(|tx| Command::GetStaleBuckets(BUCKET_STALE_THRESHOLD, tx))
                    .await
                else {
                    break;
                };
                if stale_buckets.is_empty() {
                    continue;
                }

                debug!(count = stale_buckets.len(), "refreshing stale routing buckets");
                for bucket_idx in stale_buckets {
                    let target = random_id_for_bucket(&node.id, bucket_idx);
                    if let Err(e) = node.iterative_find_node(target).await {
                        debug!(bucket = bucket_idx, error = %e, "bucket refresh lookup failed");
                    }
                    let _ = node
                        .cmd_tx
                        .send(Command::MarkBucketRefreshed(bucket_idx))
                        .await;
                }
            }
        });
    }

    /// Self-lookup seeded from whatever is already in the routing table.
    /// An empty table is not an error: the node may be the first one up.
    pub async fn bootstrap(&self) -> Result<Vec<PeerDescriptor>> {
        if self.routing_size().await? == 0 {
            warn!(scope = ?self.scope, "routing table is empty, nothing to bootstrap from");
            return Ok(Vec::new());
        }
        let closest = self.iterative_find_node(self.id).await?;
        debug!(scope = ?self.scope, found = closest.len(), "DHT bootstrap lookup finished");
        Ok(closest)
    }

    pub async fn iterative_find_node(&self, target: Identity) -> Result<Vec<PeerDescriptor>> {
        self.iterative_lookup(target, LookupKind::Nodes, None, &mut HashSet::new())
            .await
    }

    /// Stores a local provider record and pushes it to the `k` nodes closest
    /// to `key`. Returns how many remote nodes accepted it.
    pub async fn advertise(&self, key: Key) -> Result<usize> {
        self.send_cmd(Command::AddLocalProvider(key, self.self_descriptor.clone()))
            .await?;

        let closest = self.iterative_find_node(Identity::from_bytes(key)).await?;
        if closest.is_empty() {
            bail!("no peers known to hold the provider record");
        }

        let mut join_set = JoinSet::new();
        for peer in closest {
            let net = self.network.clone();
            let query_timeout = self.query_timeout;
            join_set.spawn(async move {
                let result = tokio::time::timeout(query_timeout, net.add_provider(&peer, key))
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("add_provider timed out")));
                (peer, result)
            });
        }

        let mut stored = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => stored += 1,
                Ok((peer, Err(e))) => {
                    debug!(peer = %peer.identity.short(), error = %e, "add_provider failed");
                }
                Err(e) => debug!(error = %e, "add_provider task failed"),
            }
        }

        if stored == 0 {
            bail!("no peer accepted the provider record");
        }
        debug!(key = %hex::encode(&key[..8]), stored, "provider record published");
        Ok(stored)
    }

    /// Streams providers of `key` into `sink`: local records first, then
    /// whatever the iterative lookup turns up. Each identity is sent once.
    /// Returns early if the receiver is dropped.
    pub async fn get_providers(&self, key: Key, sink: mpsc::Sender<PeerDescriptor>) -> Result<()> {
        let mut emitted = HashSet::new();
        for provider in self.request(|tx| Command::LocalProviders(key, tx)).await? {
            if emitted.insert(provider.identity) && sink.send(provider).await.is_err() {
                return Ok(());
            }
        }
        self.iterative_lookup(
            Identity::from_bytes(key),
            LookupKind::Providers(key),
            Some(&sink),
            &mut emitted,
        )
        .await?;
        Ok(())
    }

    async fn iterative_lookup(
        &self,
        target: Identity,
        kind: LookupKind,
        sink: Option<&mpsc::Sender<PeerDescriptor>>,
        emitted: &mut HashSet<Identity>,
    ) -> Result<Vec<PeerDescriptor>> {
        let lookup_start = Instant::now();
        let (k, alpha, mut shortlist) = self
            .request(|tx| Command::GetLookupParams(target, tx))
            .await?;

        let mut seen: HashSet<Identity> = shortlist.iter().map(|c| c.identity).collect();
        let mut queried: HashSet<Identity> = HashSet::new();
        let mut best_distance = shortlist
            .first()
            .map(|c| c.identity.xor_distance(&target))
            .unwrap_or([0xff; 32]);
        let mut iteration = 0;

        loop {
            iteration += 1;
            if iteration > MAX_LOOKUP_ITERATIONS {
                warn!(
                    target = %target.short(),
                    iterations = iteration,
                    "iterative lookup exceeded max iterations"
                );
                break;
            }
            if lookup_start.elapsed() > LOOKUP_TOTAL_TIMEOUT {
                debug!(
                    target = %target.short(),
                    elapsed_ms = lookup_start.elapsed().as_millis(),
                    "iterative lookup timeout, returning current results"
                );
                break;
            }

            let candidates: Vec<PeerDescriptor> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.identity) && c.identity != self.id)
                .take(alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.identity);
            }

            let mut join_set = JoinSet::new();
            for peer in candidates {
                let net = self.network.clone();
                let query_timeout = self.query_timeout;
                join_set.spawn(async move {
                    let query = async {
                        match kind {
                            LookupKind::Nodes => net
                                .find_node(&peer, target)
                                .await
                                .map(|closer| (closer, Vec::new())),
                            LookupKind::Providers(key) => net
                                .get_providers(&peer, key)
                                .await
                                .map(|(providers, closer)| (closer, providers)),
                        }
                    };
                    let result = tokio::time::timeout(query_timeout, query)
                        .await
                        .unwrap_or_else(|_| Err(anyhow!("query timeout")));
                    (peer, result)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let Ok((peer, result)) = joined else {
                    continue;
                };
                let (closer, providers) = match result {
                    Ok(reply) => reply,
                    Err(e) => {
                        trace!(peer = %peer.identity.short(), error = %e, "lookup query failed");
                        continue;
                    }
                };

                self.observe_direct_peer(peer).await;

                if let Some(sink) = sink {
                    for provider in providers.into_iter().take(MAX_PROVIDERS_PER_KEY) {
                        if !provider.validate_structure() || !emitted.insert(provider.identity) {
                            continue;
                        }
                        if sink.send(provider).await.is_err() {
                            return Ok(shortlist);
                        }
                    }
                }

                for node in closer.into_iter().take(MAX_CONTACTS_PER_RESPONSE) {
                    if node.identity == self.id
                        || !node.identity.is_valid()
                        || !node.validate_structure()
                    {
                        continue;
                    }
                    let Some(node) = self.scope.restrict(&node) else {
                        continue;
                    };
                    if seen.insert(node.identity) {
                        shortlist.push(node);
                    }
                }
            }

            shortlist.sort_by(|a, b| {
                distance_cmp(
                    &a.identity.xor_distance(&target),
                    &b.identity.xor_distance(&target),
                )
            });
            shortlist.truncate(k);

            let improved = shortlist.first().is_some_and(|first| {
                let new_best = first.identity.xor_distance(&target);
                if distance_cmp(&new_best, &best_distance) == std::cmp::Ordering::Less {
                    best_distance = new_best;
                    true
                } else {
                    false
                }
            });
            if !improved {
                // Nothing closer appeared, but unqueried entries may remain
                // from earlier rounds.
                let pending = shortlist
                    .iter()
                    .any(|c| !queried.contains(&c.identity) && c.identity != self.id);
                if !pending {
                    break;
                }
            }
        }

        debug!(
            target = %target.short(),
            found = shortlist.len(),
            queried = queried.len(),
            "iterative lookup completed"
        );
        Ok(shortlist)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<N: DhtNodeRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        let mut expiry = tokio::time::interval(PROVIDER_EXPIRY_INTERVAL);
        expiry.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit) | None => {
                            debug!(scope = ?self.scope, "DHT actor shutting down");
                            break;
                        }
                        Some(cmd) => self.handle(cmd),
                    }
                }
                _ = expiry.tick() => {
                    let removed = self.providers.expire();
                    if removed > 0 {
                        trace!(removed, "expired provider records");
                    }
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::ObserveDirectPeer(peer) => self.observe(peer),
            Command::GetLookupParams(target, reply) => {
                let closest = self.routing.closest(&target, self.k);
                let _ = reply.send((self.k, self.alpha, closest));
            }
            Command::RoutingSize(reply) => {
                let _ = reply.send(self.routing.len());
            }
            Command::HandleFindNode(from, target, reply) => {
                self.observe(from);
                let _ = reply.send(self.routing.closest(&target, self.k));
            }
            Command::HandleGetProviders(from, key, reply) => {
                self.observe(from);
                let providers = self.providers.get(&key);
                let closer = self
                    .routing
                    .closest(&Identity::from_bytes(key), self.k);
                let _ = reply.send((providers, closer));
            }
            Command::HandleAddProvider(from, key) => {
                if let Some(provider) = self.scope.restrict(&from) {
                    debug!(
                        provider = %provider.identity.short(),
                        key = %hex::encode(&key[..8]),
                        "stored provider record"
                    );
                    self.providers.add(key, provider);
                }
                self.observe(from);
            }
            Command::AddLocalProvider(key, descriptor) => {
                self.providers.add(key, descriptor);
            }
            Command::LocalProviders(key, reply) => {
                let _ = reply.send(self.providers.get(&key));
            }
            Command::GetStaleBuckets(threshold, reply) => {
                let _ = reply.send(self.routing.stale_bucket_indices(threshold));
            }
            Command::MarkBucketRefreshed(idx) => self.routing.mark_bucket_refreshed(idx),
            Command::ApplyPingResult(pending, alive) => {
                self.routing.apply_ping_result(pending, alive);
            }
            Command::Quit => {}
        }
    }

    fn observe(&mut self, peer: PeerDescriptor) {
        if peer.identity == self.id || !peer.identity.is_valid() {
            return;
        }
        let Some(peer) = self.scope.restrict(&peer) else {
            trace!(
                peer = %peer.identity.short(),
                scope = ?self.scope,
                "peer has no address in scope"
            );
            return;
        };

        if let Some(update) = self.routing.update_with_pending(peer) {
            let network = self.network.clone();
            let tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let alive = network.ping(&update.oldest).await.is_ok();
                let _ = tx.send(Command::ApplyPingResult(update, alive)).await;
            });
        }
    }
}

/// The node's DHT presence: one WAN (or catch-all) instance plus an
/// optional LAN instance in dual mode.
pub struct DhtHandle<N: DhtNodeRpc> {
    wan: DhtNode<N>,
    lan: Option<DhtNode<N>>,
    channel_capacity: usize,
}

impl<N: DhtNodeRpc> Clone for DhtHandle<N> {
    fn clone(&self) -> Self {
        Self {
            wan: self.wan.clone(),
            lan: self.lan.clone(),
            channel_capacity: self.channel_capacity,
        }
    }
}

impl<N: DhtNodeRpc> DhtHandle<N> {
    pub fn single(node: DhtNode<N>, channel_capacity: usize) -> Self {
        Self {
            wan: node,
            lan: None,
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub fn dual(wan: DhtNode<N>, lan: DhtNode<N>, channel_capacity: usize) -> Self {
        Self {
            wan,
            lan: Some(lan),
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub fn instances(&self) -> impl Iterator<Item = &DhtNode<N>> {
        std::iter::once(&self.wan).chain(self.lan.as_ref())
    }

    /// Offers an authenticated peer to every instance; each one keeps it only
    /// if it has an address in scope.
    pub async fn observe_peer(&self, peer: PeerDescriptor) {
        for node in self.instances() {
            node.observe_direct_peer(peer.clone()).await;
        }
    }

    pub async fn routing_size(&self) -> usize {
        let mut total = 0;
        for node in self.instances() {
            total += node.routing_size().await.unwrap_or(0);
        }
        total
    }

    pub async fn quit(&self) {
        for node in self.instances() {
            node.quit().await;
        }
    }
}

#[async_trait]
impl<N: DhtNodeRpc> Rendezvous for DhtHandle<N> {
    async fn bootstrap(&self) -> Result<()> {
        for node in self.instances() {
            node.bootstrap()
                .await
                .with_context(|| format!("{:?} DHT bootstrap failed", node.scope()))?;
        }
        Ok(())
    }

    async fn advertise(&self, tag: &str) -> Result<()> {
        let key = rendezvous_key(tag);
        let mut last_err = None;
        let mut stored = 0;
        for node in self.instances() {
            match node.advertise(key).await {
                Ok(n) => stored += n,
                Err(e) => {
                    debug!(scope = ?node.scope(), error = %e, "advertise failed on DHT instance");
                    last_err = Some(e);
                }
            }
        }
        if stored == 0
            && let Some(e) = last_err
        {
            return Err(e);
        }
        info!(tag, stored, "advertised rendezvous tag");
        Ok(())
    }

    async fn find_peers(&self, tag: &str) -> Result<mpsc::Receiver<PeerDescriptor>> {
        let key = rendezvous_key(tag);
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        for node in self.instances() {
            let node = node.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = node.get_providers(key, tx).await {
                    debug!(scope = ?node.scope(), error = %e, "provider lookup failed");
                }
            });
        }
        Ok(rx)
    }
}
