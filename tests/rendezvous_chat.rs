//! End-to-end rendezvous: nodes that only know a bootstrap node find each
//! other through the DHT and exchange chat lines.

use std::sync::Arc;
use std::time::{Duration, Instant};

use meshchat::{ChatSession, DiscoveryConfig, Identity, Node, NodeConfig, PeerDescriptor};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

fn config(tag: &str, bootstrap: Vec<PeerDescriptor>) -> NodeConfig {
    NodeConfig {
        bootstrap,
        rendezvous_tag: tag.to_string(),
        discovery: DiscoveryConfig {
            rediscover_interval: Some(Duration::from_millis(200)),
            readvertise_interval: Duration::from_millis(500),
            ..DiscoveryConfig::default()
        },
        ..NodeConfig::local()
    }
}

struct Running {
    node: Arc<Node>,
    chat: ChatSession,
    discovery: JoinHandle<anyhow::Result<()>>,
}

async fn start(config: NodeConfig) -> Running {
    let node = Arc::new(Node::bind(config).await.expect("bind"));
    let chat = node.enable_chat();
    node.connect_bootstrap_set().await;
    let discovery = {
        let node = node.clone();
        tokio::spawn(async move { node.run_discovery().await })
    };
    Running {
        node,
        chat,
        discovery,
    }
}

impl Running {
    async fn stop(self) {
        self.node.shutdown().await;
        timeout(TEST_TIMEOUT, self.discovery)
            .await
            .expect("discovery stops")
            .expect("discovery task")
            .expect("discovery result");
    }
}

async fn wait_for_link(a: &Running, b: &Running) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        let a_knows_b = a.node.peers().connected().contains(&b.node.identity());
        let b_knows_a = b.node.peers().connected().contains(&a.node.identity());
        if a_knows_b || b_knows_a {
            return;
        }
        assert!(Instant::now() < deadline, "nodes never connected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Publishes `text` on `from` until `to` reports a line from it.
async fn deliver(from: &Running, to: &mut Running, text: &str) -> Identity {
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        let _ = from.chat.outgoing.send(text.to_string());
        if let Ok(Some(line)) = timeout(Duration::from_millis(200), to.chat.incoming.recv()).await
            && line.text == text
        {
            return line.from;
        }
        assert!(Instant::now() < deadline, "line never delivered");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peers_find_each_other_and_chat() {
    let hub = start(config("lobby", vec![])).await;
    let hub_descriptor = hub.node.descriptor().clone();
    let b = start(config("lobby", vec![hub_descriptor.clone()])).await;
    let mut c = start(config("lobby", vec![hub_descriptor])).await;

    wait_for_link(&b, &c).await;

    let sender = deliver(&b, &mut c, "hello from b").await;
    assert_eq!(sender, b.node.identity());

    hub.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutual_discovery_delivers_each_line_once() {
    let mut a = start(config("lobby", vec![])).await;
    let mut b = start(config("lobby", vec![a.node.descriptor().clone()])).await;

    // Both sides end up knowing each other, whoever dialed.
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !(a.node.peers().connected().contains(&b.node.identity())
        && b.node.peers().connected().contains(&a.node.identity()))
    {
        assert!(Instant::now() < deadline, "peers never recorded each other");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    deliver(&a, &mut b, "warm up").await;
    deliver(&b, &mut a, "warm up").await;
    // Let a few rediscovery rounds pass, then drop retried warm-up lines.
    tokio::time::sleep(Duration::from_millis(600)).await;
    while b.chat.incoming.try_recv().is_ok() {}

    a.chat.outgoing.send("once".to_string()).expect("chat session open");
    let mut copies = 0;
    while let Ok(Some(line)) = timeout(Duration::from_secs(1), b.chat.incoming.recv()).await {
        if line.text == "once" {
            assert_eq!(line.from, a.node.identity());
            copies += 1;
        }
    }
    assert_eq!(copies, 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_tags_do_not_connect() {
    let hub = start(config("lobby", vec![])).await;
    let hub_descriptor = hub.node.descriptor().clone();
    let b = start(config("blue", vec![hub_descriptor.clone()])).await;
    let c = start(config("green", vec![hub_descriptor])).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!b.node.peers().connected().contains(&c.node.identity()));
    assert!(!c.node.peers().connected().contains(&b.node.identity()));

    hub.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rediscovery_keeps_a_single_entry_per_peer() {
    let hub = start(config("lobby", vec![])).await;
    let b = start(config("lobby", vec![hub.node.descriptor().clone()])).await;

    wait_for_link(&hub, &b).await;
    // several rediscovery rounds
    tokio::time::sleep(Duration::from_secs(1)).await;

    let hub_peers = hub.node.peers().connected();
    let b_peers = b.node.peers().connected();
    assert!(hub_peers.len() <= 1);
    assert!(b_peers.len() <= 1);
    assert!(!b_peers.contains(&b.node.identity()), "never connects to itself");

    hub.stop().await;
    b.stop().await;
}
