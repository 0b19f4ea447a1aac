use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

mod common;
use common::{fast_config, wait_until, TestNode};
use truman_core::crypto::NodeIdentity;
use truman_core::network::{Discovery, EventKind, MemoryNetwork, MemorySegment, PING_FAILED};
use truman_core::node::{Backend, NodeConfig};
use truman_core::types::{Tag, TrustTier};

#[tokio::test]
async fn test_p2p_peering() {
    let net = MemoryNetwork::new();
    let node1 = TestNode::start(&net, "mem://1", fast_config(&[]), vec![]).await;
    let node2 = TestNode::start(&net, "mem://2", fast_config(&["mem://1"]), vec![]).await;
    node1.node.start_gossip_loop();
    node2.node.start_gossip_loop();

    let connected = wait_until(Duration::from_secs(5), || {
        node1.is_connected_to(&node2) && node2.is_connected_to(&node1)
    })
    .await;
    assert!(connected, "Nodes failed to peer within timeout");

    // Keepalive traffic must not produce duplicate connection events.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(node1.count(EventKind::Connection), 1);
    assert_eq!(node2.count(EventKind::Connection), 1);

    node1.stop().await;
    node2.stop().await;
}

#[tokio::test]
async fn test_peer_exchange_builds_mesh() {
    let net = MemoryNetwork::new();
    let hub = TestNode::start(&net, "mem://hub", fast_config(&[]), vec![]).await;
    let a = TestNode::start(&net, "mem://a", fast_config(&["mem://hub"]), vec![]).await;
    let b = TestNode::start(&net, "mem://b", fast_config(&["mem://hub"]), vec![]).await;
    for node in [&hub, &a, &b] {
        node.node.start_gossip_loop();
    }

    // a and b only know the hub, they find each other through it.
    let meshed = wait_until(Duration::from_secs(5), || a.is_connected_to(&b) && b.is_connected_to(&a)).await;
    assert!(meshed);

    let mut expected = vec![a.id().to_string(), b.id().to_string()];
    expected.sort();
    assert_eq!(hub.node.get_peers(), expected);
}

#[tokio::test]
async fn test_ttl_bounded_dissemination_delivers_once() {
    let net = MemoryNetwork::new();
    net.set_duplicate_delivery(true);

    // Line a - b - c - d - e, enforced by whitelists.
    let ids: Vec<NodeIdentity> = (0..5).map(|_| NodeIdentity::generate().unwrap()).collect();
    let hex: Vec<String> = ids.iter().map(|i| i.peer_id().to_string()).collect();
    let addrs = ["mem://a", "mem://b", "mem://c", "mem://d", "mem://e"];

    let mut nodes = Vec::new();
    for (i, identity) in ids.into_iter().enumerate() {
        let mut whitelist = Vec::new();
        if i > 0 {
            whitelist.push(hex[i - 1].clone());
        }
        if i < 4 {
            whitelist.push(hex[i + 1].clone());
        }
        let bootstrap: Vec<&str> = if i > 0 { vec![addrs[i - 1]] } else { vec![] };
        let mut config = fast_config(&bootstrap);
        config.gossip.max_hops = 3;
        nodes.push(TestNode::start_with(&net, identity, addrs[i], config, whitelist).await);
    }
    for node in &nodes {
        node.node.start_gossip_loop();
    }

    let linked = wait_until(Duration::from_secs(5), || {
        nodes.windows(2).all(|pair| pair[0].is_connected_to(&pair[1]) && pair[1].is_connected_to(&pair[0]))
    })
    .await;
    assert!(linked, "line topology did not form");
    assert!(!nodes[0].is_connected_to(&nodes[2]));

    assert!(nodes[0].node.broadcast_message("fire", Tag::Emergency));

    let reached = wait_until(Duration::from_secs(5), || nodes[3].count(EventKind::Message) >= 1).await;
    assert!(reached, "broadcast did not reach depth 3");

    // Leave time for duplicates, relays and retransmissions to settle.
    sleep(Duration::from_millis(300)).await;

    let origin = nodes[0].id();
    for node in &nodes[..4] {
        let messages: Vec<_> = node
            .events()
            .into_iter()
            .filter(|e| e.kind == EventKind::Message)
            .collect();
        assert_eq!(messages.len(), 1, "node {} delivered {} copies", node.addr, messages.len());
        assert_eq!(messages[0].peer, origin);
        let body = messages[0].message.as_ref().unwrap();
        assert_eq!(body.message, "fire");
        assert_eq!(body.tags, Tag::Emergency);
    }

    // Hop budget is spent at depth 3.
    assert_eq!(nodes[4].count(EventKind::Message), 0);
    assert!(nodes[1].node.stats().gossip.duplicates > 0);
}

#[tokio::test]
async fn test_whitelist_rejects_unlisted_peer() {
    let net = MemoryNetwork::new();
    let friend_identity = NodeIdentity::generate().unwrap();
    let friend_id = friend_identity.peer_id().to_string();

    let gate = TestNode::start(&net, "mem://gate", fast_config(&[]), vec![friend_id]).await;
    let friend =
        TestNode::start_with(&net, friend_identity, "mem://friend", fast_config(&["mem://gate"]), vec![]).await;
    let stranger = TestNode::start(&net, "mem://stranger", fast_config(&["mem://gate"]), vec![]).await;
    for node in [&gate, &friend, &stranger] {
        node.node.start_gossip_loop();
    }

    assert!(wait_until(Duration::from_secs(5), || gate.is_connected_to(&friend)).await);

    // The stranger keeps redialing every tick.
    sleep(Duration::from_millis(500)).await;
    assert!(!gate.is_connected_to(&stranger));
    assert!(!stranger.is_connected_to(&gate));
    assert!(!gate.node.peer_manager().contains(&stranger.id()));
    assert_eq!(gate.count_for(EventKind::Connection, &stranger.id()), 0);

    // The friend may learn about the stranger but the gate never admits it.
    assert_eq!(gate.node.get_peers(), vec![friend.id().to_string()]);
}

#[tokio::test]
async fn test_promotion_requires_wolf_and_propagates() {
    let net = MemoryNetwork::new();
    let wolf_identity = NodeIdentity::generate().unwrap();
    let wolf_id = wolf_identity.peer_id().to_string();

    let mut wolf_config = fast_config(&[]);
    wolf_config.identity.tier = TrustTier::Wolf;
    let wolf = TestNode::start_with(&net, wolf_identity, "mem://wolf", wolf_config, vec![]).await;

    let mut sheep_config = fast_config(&["mem://wolf"]);
    sheep_config.trust.wolves = vec![wolf_id];
    let sheep1 = TestNode::start(&net, "mem://s1", sheep_config.clone(), vec![]).await;
    let sheep2 = TestNode::start(&net, "mem://s2", sheep_config, vec![]).await;
    for node in [&wolf, &sheep1, &sheep2] {
        node.node.start_gossip_loop();
    }

    let meshed = wait_until(Duration::from_secs(5), || {
        wolf.node.get_peers().len() == 2 && sheep1.is_connected_to(&sheep2)
    })
    .await;
    assert!(meshed);

    // A sheep has no authority.
    assert!(!sheep1.node.new_wolf(&sheep2.id()));
    assert_eq!(sheep1.count(EventKind::TrustChange), 0);

    // The wolf promotes sheep1; repeating is a no-op.
    assert!(wolf.node.new_wolf(&sheep1.id()));
    assert!(wolf.node.new_wolf(&sheep1.id()));
    assert_eq!(wolf.count_for(EventKind::TrustChange, &sheep1.id()), 1);

    let propagated = wait_until(Duration::from_secs(5), || {
        sheep1.node.local_tier() == TrustTier::Wolf
            && sheep2.count_for(EventKind::TrustChange, &sheep1.id()) == 1
    })
    .await;
    assert!(propagated, "promotion notice did not propagate");
    assert_eq!(sheep1.count_for(EventKind::TrustChange, &sheep1.id()), 1);

    // The new wolf can promote in turn.
    assert!(sheep1.node.new_wolf(&sheep2.id()));
    let accepted = wait_until(Duration::from_secs(5), || {
        sheep2.node.local_tier() == TrustTier::Wolf
            && wolf.node.peer_manager().tier_of(&sheep2.id()) == TrustTier::Wolf
    })
    .await;
    assert!(accepted);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(wolf.count_for(EventKind::TrustChange, &sheep1.id()), 1);
    assert_eq!(sheep2.count_for(EventKind::TrustChange, &sheep2.id()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ping_simulated_latency() {
    let net = MemoryNetwork::new();
    net.set_latency("mem://a", "mem://b", Duration::from_millis(100));

    let a = TestNode::start(&net, "mem://a", fast_config(&[]), vec![]).await;
    let b = TestNode::start(&net, "mem://b", fast_config(&["mem://a"]), vec![]).await;

    assert!(wait_until(Duration::from_secs(5), || a.is_connected_to(&b) && b.is_connected_to(&a)).await);

    let rtt = a.node.ping(&b.id()).await;
    assert!((190..=260).contains(&rtt), "rtt was {}", rtt);

    let record = a.node.peer_manager().get_peer(&b.id()).unwrap();
    assert!(record.rtt.is_some());

    let all = a.node.ping_all().await;
    assert_eq!(all.len(), 1);
    assert!((190..=260).contains(&all[0].1));
}

#[tokio::test(start_paused = true)]
async fn test_ping_unreachable_peer_times_out() {
    let net = MemoryNetwork::new();
    let mut config = fast_config(&[]);
    config.probe.timeout_ms = 500;

    let a = TestNode::start(&net, "mem://a", config, vec![]).await;
    let b = TestNode::start(&net, "mem://b", fast_config(&["mem://a"]), vec![]).await;
    assert!(wait_until(Duration::from_secs(5), || a.is_connected_to(&b)).await);

    net.set_reachable("mem://b", false);

    let started = Instant::now();
    assert_eq!(a.node.ping(&b.id()).await, PING_FAILED);
    assert!(started.elapsed() >= Duration::from_millis(500));

    // Unknown peers fail without waiting.
    let started = Instant::now();
    assert_eq!(a.node.ping(&NodeIdentity::generate().unwrap().peer_id()).await, PING_FAILED);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_releases_pending_ping() {
    let net = MemoryNetwork::new();
    let mut config = fast_config(&[]);
    config.probe.timeout_ms = 5_000;

    let a = Arc::new(TestNode::start(&net, "mem://a", config, vec![]).await);
    let b = TestNode::start(&net, "mem://b", fast_config(&["mem://a"]), vec![]).await;
    assert!(wait_until(Duration::from_secs(5), || a.is_connected_to(&b)).await);

    net.set_reachable("mem://b", false);

    let started = Instant::now();
    let ping = tokio::spawn({
        let a = Arc::clone(&a);
        let b = b.id();
        async move { a.node.ping(&b).await }
    });
    sleep(Duration::from_millis(100)).await;
    a.stop().await;

    assert_eq!(ping.await.unwrap(), PING_FAILED);
    assert!(started.elapsed() < Duration::from_secs(1), "ping waited {:?}", started.elapsed());
}

#[tokio::test]
async fn test_lan_discovery_without_bootstrap() {
    let net = MemoryNetwork::new();
    let segment = MemorySegment::new();
    let ids: Vec<NodeIdentity> = (0..4).map(|_| NodeIdentity::generate().unwrap()).collect();
    let peer_ids: Vec<_> = ids.iter().map(|i| i.peer_id()).collect();

    // a admits b and c only
    let whitelist_a = vec![peer_ids[1].to_string(), peer_ids[2].to_string()];
    let c_discovery = Arc::new(segment.discovery());

    let mut ids = ids.into_iter();
    let mut next = |addr: &str, whitelist: Vec<String>, discovery: Arc<dyn Discovery>| {
        let identity = ids.next().unwrap();
        let net = Arc::clone(&net);
        let addr = addr.to_string();
        async move {
            TestNode::start_discovering(&net, identity, &addr, fast_config(&[]), whitelist, discovery)
                .await
        }
    };
    let a = next("mem://a", whitelist_a, Arc::new(segment.discovery())).await;
    let b = next("mem://b", vec![], Arc::new(segment.discovery())).await;
    let c = next("mem://c", vec![], c_discovery.clone()).await;
    let d = next("mem://d", vec![], Arc::new(segment.discovery())).await;
    for node in [&a, &b, &c, &d] {
        node.node.start_gossip_loop();
    }

    let meshed = wait_until(Duration::from_secs(5), || {
        a.is_connected_to(&b)
            && a.is_connected_to(&c)
            && b.is_connected_to(&c)
            && b.is_connected_to(&d)
            && c.is_connected_to(&d)
    })
    .await;
    assert!(meshed, "nodes on one segment did not find each other");

    sleep(Duration::from_millis(200)).await;
    assert!(!a.is_connected_to(&d));
    assert!(!d.is_connected_to(&a));
    assert_eq!(a.count_for(EventKind::Connection, &d.id()), 0);

    // c's announcement expires while it stays silent
    net.set_reachable("mem://c", false);
    c_discovery.shutdown();

    let expired = wait_until(Duration::from_secs(5), || {
        a.count_for(EventKind::Disconnection, &c.id()) == 1
            && b.count_for(EventKind::Disconnection, &c.id()) == 1
    })
    .await;
    assert!(expired);
    assert!(!a.is_connected_to(&c));
    assert!(!b.is_connected_to(&c));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(a.count_for(EventKind::Disconnection, &c.id()), 1);

    for node in [&a, &b, &c, &d] {
        node.stop().await;
    }
    assert!(segment.is_empty());
}

#[tokio::test]
async fn test_silent_peer_goes_stale_then_evicted() {
    let net = MemoryNetwork::new();
    let mut config = fast_config(&[]);
    config.membership.stale_after_ms = 100;
    config.membership.evict_after_ms = 200;

    let a = TestNode::start(&net, "mem://a", config.clone(), vec![]).await;
    config.network.bootstrap_peers = vec!["mem://a".to_string()];
    let b = TestNode::start(&net, "mem://b", config, vec![]).await;
    a.node.start_gossip_loop();
    b.node.start_gossip_loop();

    assert!(wait_until(Duration::from_secs(5), || a.is_connected_to(&b)).await);

    // Keepalive holds the link open well past the stale timeout.
    sleep(Duration::from_millis(300)).await;
    assert!(a.is_connected_to(&b));
    assert_eq!(a.count(EventKind::Disconnection), 0);

    net.set_reachable("mem://b", false);

    let evicted = wait_until(Duration::from_secs(5), || {
        a.count_for(EventKind::Disconnection, &b.id()) == 1
    })
    .await;
    assert!(evicted, "silent peer was never evicted");
    assert!(a.node.get_peers().is_empty());
    assert!(!a.node.peer_manager().contains(&b.id()));
    assert!(wait_until(Duration::from_secs(1), || !a.transport.is_linked("mem://b")).await);
}

#[tokio::test]
async fn test_goodbye_on_cleanup() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "mem://a", fast_config(&[]), vec![]).await;
    let b = TestNode::start(&net, "mem://b", fast_config(&["mem://a"]), vec![]).await;
    assert!(wait_until(Duration::from_secs(5), || a.is_connected_to(&b) && b.is_connected_to(&a)).await);

    b.stop().await;
    b.stop().await;

    assert!(a.transport.is_linked("mem://b"));
    let left = wait_until(Duration::from_secs(5), || a.count_for(EventKind::Disconnection, &b.id()) == 1).await;
    assert!(left);
    assert!(wait_until(Duration::from_secs(1), || !a.transport.is_linked("mem://b")).await);
    assert!(a.node.get_peers().is_empty());
    assert!(b.node.get_peers().is_empty());
    assert!(!b.node.broadcast_message("after", Tag::General));
}

#[test]
fn test_backend_scenario() {
    let net = MemoryNetwork::new();
    let backend = Backend::with_transport(NodeConfig::default(), Arc::new(net.endpoint("mem://host"))).unwrap();

    assert!(backend.init(vec![]));
    assert!(backend.broadcast_message("fire", "emergency"));

    let events = backend.collect_events();
    assert_eq!(events.len(), 1);
    let event: serde_json::Value = serde_json::from_str(&events[0]).unwrap();
    assert_eq!(event["type"], "message");
    assert_eq!(event["data"]["peer"], backend.get_local_peer_id());
    assert_eq!(event["data"]["message"]["message"], "fire");
    assert_eq!(event["data"]["message"]["tags"], "emergency");

    assert!(backend.collect_events().is_empty());
    assert!(backend.collect_events().is_empty());

    backend.cleanup();
    backend.cleanup();
}

#[test]
fn test_backend_over_tcp() {
    let mut config = NodeConfig::default();
    config.network.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.gossip.tick_interval_ms = 50;
    config.discovery.mdns = false;

    let first = Backend::new(config.clone()).unwrap();
    assert!(first.init(vec![]));
    let first_addr = first.node().unwrap().listen_addr();

    config.network.bootstrap_peers = vec![first_addr];
    let second = Backend::new(config).unwrap();
    assert!(second.init(vec![]));
    first.start_gossip_loop();
    second.start_gossip_loop();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while std::time::Instant::now() < deadline
        && (first.get_peers().is_empty() || second.get_peers().is_empty())
    {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(first.get_peers(), vec![second.get_local_peer_id()]);
    assert_eq!(second.get_peers(), vec![first.get_local_peer_id()]);

    let rtt = first.ping(&second.get_local_peer_id());
    assert!(rtt >= 0, "ping over loopback failed");

    assert!(second.broadcast_message("water at the school", "important"));
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut delivered = Vec::new();
    while std::time::Instant::now() < deadline && delivered.is_empty() {
        delivered = first
            .collect_events()
            .into_iter()
            .filter(|e| e.contains("water at the school"))
            .collect();
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].contains("\"tags\":\"important\""));

    second.cleanup();
    first.cleanup();
}
