//! Two nodes on loopback TCP, introduced to each other explicitly.

use std::time::Duration;

use zre_node::{Config, Event, Node, NodeError};

fn config(name: &str) -> Config {
    Config {
        name: Some(name.to_string()),
        beacon_enabled: false,
        bind_host: "127.0.0.1".to_string(),
        ..Config::default()
    }
}

async fn next_event(node: &mut Node) -> Event {
    tokio::time::timeout(Duration::from_secs(5), node.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn next_of(node: &mut Node, kind: &str) -> Event {
    loop {
        let event = next_event(node).await;
        if event.kind() == kind {
            return event;
        }
    }
}

#[tokio::test]
async fn two_nodes_meet_and_talk() {
    let mut n1 = Node::new(config("node1"));
    n1.set_header("X-HELLO", "World").unwrap();
    n1.join("G").unwrap();
    n1.start().await.unwrap();

    let mut n2 = Node::new(config("node2"));
    n2.join("G").unwrap();
    n2.start().await.unwrap();
    assert!(n2.endpoint().unwrap().starts_with("tcp://127.0.0.1:"));

    n2.require_peer(n1.id(), n1.endpoint().unwrap()).unwrap();

    match next_event(&mut n2).await {
        Event::Enter {
            peer,
            name,
            headers,
            endpoint,
        } => {
            assert_eq!(peer, n1.id());
            assert_eq!(name, "node1");
            assert_eq!(headers.get("X-HELLO").map(String::as_str), Some("World"));
            assert_eq!(Some(endpoint.as_str()), n1.endpoint());
        }
        other => panic!("expected ENTER, got {other:?}"),
    }
    let join = next_event(&mut n2).await;
    assert_eq!(join.kind(), "JOIN");
    assert_eq!(join.group(), Some("G"));

    let enter = next_of(&mut n1, "ENTER").await;
    assert_eq!(enter.peer(), Some(n2.id()));
    next_of(&mut n1, "JOIN").await;

    n1.shouts("G", "hi").unwrap();
    let shout = next_of(&mut n2, "SHOUT").await;
    assert_eq!(shout.peer(), Some(n1.id()));
    assert_eq!(shout.content(), Some(&vec![b"hi".to_vec()]));

    n2.whispers(n1.id(), "psst").unwrap();
    let whisper = next_of(&mut n1, "WHISPER").await;
    assert_eq!(whisper.peer(), Some(n2.id()));
    assert_eq!(whisper.content(), Some(&vec![b"psst".to_vec()]));

    assert_eq!(n2.peers().await.unwrap(), vec![n1.id()]);
    assert_eq!(n2.peers_in_group("G").await.unwrap(), vec![n1.id()]);
    assert_eq!(n2.own_groups().await.unwrap(), vec!["G".to_string()]);
    assert_eq!(n2.peer_groups().await.unwrap(), vec!["G".to_string()]);
    assert_eq!(n2.peer_name(n1.id()).await.unwrap().as_deref(), Some("node1"));
    assert_eq!(
        n2.peer_header(n1.id(), "X-HELLO").await.unwrap().as_deref(),
        Some("World")
    );
    assert_eq!(
        n2.peer_endpoint(n1.id()).await.unwrap().as_deref(),
        n1.endpoint()
    );

    n1.stop().await;
    let mut last = None;
    while let Some(event) = n1.recv().await {
        last = Some(event);
    }
    assert_eq!(last, Some(Event::Stop));
    assert!(matches!(n1.shouts("G", "late"), Err(NodeError::Stopped)));
    assert!(matches!(n1.start().await, Err(NodeError::Stopped)));

    n2.stop().await;
}

#[tokio::test]
async fn leave_is_seen_by_peer() {
    let mut n1 = Node::new(config("node1"));
    n1.join("G").unwrap();
    n1.start().await.unwrap();
    let mut n2 = Node::new(config("node2"));
    n2.start().await.unwrap();

    n1.require_peer(n2.id(), n2.endpoint().unwrap()).unwrap();
    next_of(&mut n2, "JOIN").await;

    n1.leave("G").unwrap();
    let leave = next_of(&mut n2, "LEAVE").await;
    assert_eq!(leave.peer(), Some(n1.id()));
    assert_eq!(leave.group(), Some("G"));
    assert!(n2.peer_groups().await.unwrap().is_empty());

    n1.stop().await;
    n2.stop().await;
}
