//! Several engines on one in-process network, with discovery and the clock
//! driven by hand.

use std::time::{Duration, Instant};

use zre_core::{
    CommandError, DiscoveryEvent, EngineConfig, Event, MemoryNetwork, NodeEngine, PeerId,
};

fn node(net: &MemoryNetwork, name: &str, endpoint: &str) -> NodeEngine {
    net.bind(endpoint);
    NodeEngine::new(
        PeerId::generate(),
        name,
        endpoint,
        Box::new(net.clone()),
        EngineConfig::default(),
    )
}

/// Deliver queued frames until every inbox is empty.
fn pump(net: &MemoryNetwork, nodes: &mut [&mut NodeEngine], now: Instant) {
    loop {
        let mut moved = false;
        for node in nodes.iter_mut() {
            let endpoint = node.endpoint().to_string();
            while let Some((routing_id, frames)) = net.recv(&endpoint) {
                node.recv_peer(&routing_id, frames, now);
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }
}

/// `at` hears a beacon from `from`.
fn beacon(at: &mut NodeEngine, from: &NodeEngine, now: Instant) {
    at.on_discovery(
        DiscoveryEvent::Found {
            peer: from.id(),
            endpoint: from.endpoint().to_string(),
        },
        now,
    );
}

fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::kind).collect()
}

/// Two nodes in group G that know each other, event queues drained.
fn joined_pair(net: &MemoryNetwork, now: Instant) -> (NodeEngine, NodeEngine) {
    let mut n1 = node(net, "node1", "inproc://node1");
    let mut n2 = node(net, "node2", "inproc://node2");
    n1.join("G").unwrap();
    n2.join("G").unwrap();
    beacon(&mut n2, &n1, now);
    beacon(&mut n1, &n2, now);
    pump(net, &mut [&mut n1, &mut n2], now);
    n1.drain_events();
    n2.drain_events();
    (n1, n2)
}

#[test]
fn enter_then_join_after_discovery() {
    let net = MemoryNetwork::new();
    let now = Instant::now();
    let mut n1 = node(&net, "node1", "inproc://node1");
    n1.set_header("X-HELLO", "World").unwrap();
    n1.join("G").unwrap();
    let mut n2 = node(&net, "node2", "inproc://node2");
    n2.join("G").unwrap();

    beacon(&mut n2, &n1, now);
    beacon(&mut n1, &n2, now);
    pump(&net, &mut [&mut n1, &mut n2], now);

    let events = n2.drain_events();
    assert_eq!(kinds(&events), vec!["ENTER", "JOIN"]);
    match &events[0] {
        Event::Enter {
            peer,
            name,
            headers,
            endpoint,
        } => {
            assert_eq!(*peer, n1.id());
            assert_eq!(name, "node1");
            assert_eq!(headers.len(), 1);
            assert_eq!(headers.get("X-HELLO").map(String::as_str), Some("World"));
            assert_eq!(endpoint, "inproc://node1");
        }
        other => panic!("expected ENTER, got {other:?}"),
    }
    assert_eq!(
        events[1],
        Event::Join {
            peer: n1.id(),
            name: "node1".into(),
            group: "G".into(),
        }
    );
    assert_eq!(n2.peers(), vec![n1.id()]);
    assert_eq!(n1.peers(), vec![n2.id()]);
}

#[test]
fn one_sided_discovery_is_enough() {
    let net = MemoryNetwork::new();
    let now = Instant::now();
    let mut n1 = node(&net, "node1", "inproc://node1");
    let mut n2 = node(&net, "node2", "inproc://node2");

    beacon(&mut n2, &n1, now);
    pump(&net, &mut [&mut n1, &mut n2], now);

    assert_eq!(kinds(&n1.drain_events()), vec!["ENTER"]);
    assert_eq!(kinds(&n2.drain_events()), vec!["ENTER"]);
    assert_eq!(n1.peer_name(&n2.id()).as_deref(), Some("node2"));
}

#[test]
fn shout_reaches_group_once() {
    let net = MemoryNetwork::new();
    let now = Instant::now();
    let (mut n1, mut n2) = joined_pair(&net, now);

    n1.shout("G", vec![b"hi".to_vec()]);
    pump(&net, &mut [&mut n1, &mut n2], now);

    let events = n2.drain_events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::Shout {
            peer,
            group,
            content,
            ..
        } => {
            assert_eq!(*peer, n1.id());
            assert_eq!(group, "G");
            assert_eq!(content, &vec![b"hi".to_vec()]);
        }
        other => panic!("expected SHOUT, got {other:?}"),
    }
    assert!(n1.drain_events().is_empty());
}

#[test]
fn whisper_needs_no_group() {
    let net = MemoryNetwork::new();
    let now = Instant::now();
    let mut n1 = node(&net, "node1", "inproc://node1");
    let mut n2 = node(&net, "node2", "inproc://node2");
    beacon(&mut n1, &n2, now);
    pump(&net, &mut [&mut n1, &mut n2], now);
    n2.drain_events();

    n1.whisper(n2.id(), vec![b"hi".to_vec()]);
    pump(&net, &mut [&mut n1, &mut n2], now);

    assert_eq!(
        n2.drain_events(),
        vec![Event::Whisper {
            peer: n1.id(),
            name: "node1".into(),
            content: vec![b"hi".to_vec()],
        }]
    );
}

#[test]
fn silent_peer_expires_with_one_exit() {
    let net = MemoryNetwork::new();
    let start = Instant::now();
    let (n1, mut n2) = joined_pair(&net, start);

    // Node1 never answers: nothing is pumped to it.
    n2.reap(start + Duration::from_secs(6));
    assert_eq!(kinds(&n2.drain_events()), vec!["EVASIVE"]);
    n2.reap(start + Duration::from_secs(20));
    assert!(n2.drain_events().is_empty());
    n2.reap(start + Duration::from_secs(31));
    n2.reap(start + Duration::from_secs(32));

    let events = n2.drain_events();
    assert_eq!(kinds(&events), vec!["EXIT", "LEAVE"]);
    assert_eq!(events[0].peer(), Some(n1.id()));
    assert_eq!(events[1].group(), Some("G"));
    assert!(n2.peers().is_empty());
    assert!(n2.peers_in_group("G").is_empty());
}

#[test]
fn evasive_peer_that_answers_stays() {
    let net = MemoryNetwork::new();
    let start = Instant::now();
    let (mut n1, mut n2) = joined_pair(&net, start);

    let later = start + Duration::from_secs(6);
    n2.reap(later);
    pump(&net, &mut [&mut n1, &mut n2], later);
    assert_eq!(kinds(&n2.drain_events()), vec!["EVASIVE"]);

    // The PING_OK pushed both deadlines out from `later`.
    n2.reap(start + Duration::from_secs(10));
    assert!(n2.drain_events().is_empty());
    n2.reap(start + Duration::from_secs(31));
    assert_eq!(kinds(&n2.drain_events()), vec!["EVASIVE"]);
    assert_eq!(n2.peers(), vec![n1.id()]);
}

#[test]
fn hello_carries_only_current_membership() {
    let net = MemoryNetwork::new();
    let now = Instant::now();
    let mut n1 = node(&net, "node1", "inproc://node1");
    n1.join("G").unwrap();
    n1.leave("G");
    n1.join("G").unwrap();
    assert_eq!(n1.status(), 3);
    let mut n2 = node(&net, "node2", "inproc://node2");

    beacon(&mut n2, &n1, now);
    pump(&net, &mut [&mut n1, &mut n2], now);

    let events = n2.drain_events();
    assert_eq!(kinds(&events), vec!["ENTER", "JOIN"]);
    assert_eq!(events[1].group(), Some("G"));
    assert_eq!(n2.peers_in_group("G"), vec![n1.id()]);

    n1.leave("G");
    pump(&net, &mut [&mut n1, &mut n2], now);
    assert_eq!(kinds(&n2.drain_events()), vec!["LEAVE"]);
    assert!(n2.peer_groups().is_empty());
}

#[test]
fn lost_message_drops_the_peer() {
    let net = MemoryNetwork::new();
    let now = Instant::now();
    let (mut n1, mut n2) = joined_pair(&net, now);

    n1.whisper(n2.id(), vec![b"one".to_vec()]);
    n1.whisper(n2.id(), vec![b"two".to_vec()]);
    assert!(net.recv("inproc://node2").is_some());
    pump(&net, &mut [&mut n1, &mut n2], now);

    let events = n2.drain_events();
    assert_eq!(kinds(&events), vec!["EXIT", "LEAVE"]);
    assert!(n2.peers().is_empty());
}

#[test]
fn restarted_node_replaces_old_identity() {
    let net = MemoryNetwork::new();
    let now = Instant::now();
    let (n1, mut n2) = joined_pair(&net, now);
    let old = n1.id();
    drop(n1);

    let mut reborn = node(&net, "node1", "inproc://node1");
    beacon(&mut n2, &reborn, now);
    pump(&net, &mut [&mut reborn, &mut n2], now);

    let events = n2.drain_events();
    assert_eq!(kinds(&events), vec!["EXIT", "LEAVE", "ENTER"]);
    assert_eq!(events[0].peer(), Some(old));
    assert_eq!(events[2].peer(), Some(reborn.id()));
    assert_eq!(n2.peers(), vec![reborn.id()]);
}

#[test]
fn shutdown_then_withdraw_beacon() {
    let net = MemoryNetwork::new();
    let now = Instant::now();
    let (mut n1, mut n2) = joined_pair(&net, now);

    n1.shutdown();
    assert_eq!(n1.drain_events(), vec![Event::Stop]);
    n2.on_discovery(DiscoveryEvent::Lost { peer: n1.id() }, now);
    assert_eq!(kinds(&n2.drain_events()), vec!["EXIT", "LEAVE"]);
}

#[test]
fn peer_leaving_unreachable_endpoint_is_removed_on_send() {
    let net = MemoryNetwork::new();
    let now = Instant::now();
    let (n1, mut n2) = joined_pair(&net, now);
    net.unbind(n1.endpoint());

    n2.shout("G", vec![b"anyone?".to_vec()]);
    let events = n2.drain_events();
    assert_eq!(kinds(&events), vec!["EXIT", "LEAVE"]);
    assert_eq!(events[0].peer(), Some(n1.id()));
}

#[test]
fn refused_header_does_not_hide_the_node() {
    let net = MemoryNetwork::new();
    let now = Instant::now();
    let mut n1 = node(&net, "node1", "inproc://node1");
    assert!(matches!(
        n1.set_header("K", "v".repeat(300)),
        Err(CommandError::HeaderTooLong { .. })
    ));
    let mut n2 = node(&net, "node2", "inproc://node2");
    beacon(&mut n1, &n2, now);
    beacon(&mut n2, &n1, now);
    pump(&net, &mut [&mut n1, &mut n2], now);

    assert_eq!(n2.peers(), vec![n1.id()]);
    n1.whisper(n2.id(), vec![b"hi".to_vec()]);
    pump(&net, &mut [&mut n1, &mut n2], now);
    let events = n2.drain_events();
    assert_eq!(kinds(&events), vec!["ENTER", "WHISPER"]);
}

#[test]
fn group_limit_keeps_hello_encodable() {
    let net = MemoryNetwork::new();
    let now = Instant::now();
    let mut n1 = node(&net, "node1", "inproc://node1");
    for i in 0..256 {
        let joined = n1.join(&format!("G{i}"));
        assert_eq!(joined.is_err(), i == 255);
    }
    let mut n2 = node(&net, "node2", "inproc://node2");
    beacon(&mut n2, &n1, now);
    pump(&net, &mut [&mut n1, &mut n2], now);

    assert_eq!(n2.peers(), vec![n1.id()]);
    assert_eq!(n2.peer_groups().len(), 255);
}
