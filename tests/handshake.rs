mod common;

use std::time::Duration;

use common::*;
use mesh_chat::NodeEvent;

#[tokio::test]
async fn hello_exchange_fills_both_directories() {
    let (alice, mut alice_events) = start_node(test_config("alice")).await;
    let (bob, mut bob_events) = start_node(test_config("bob")).await;

    alice.connect("127.0.0.1", bob.listen_port());

    // The dial status and the handshake race each other; take them in either order
    let expected = format!("Connected to 127.0.0.1:{}", bob.listen_port());
    let mut saw_status = false;
    let mut seen_bob = None;
    while !saw_status || seen_bob.is_none() {
        match wait_for(&mut alice_events, |_| true).await {
            NodeEvent::Status(s) if s == expected => saw_status = true,
            NodeEvent::PeerConnected(peer) => seen_bob = Some(peer),
            _ => {}
        }
    }
    let seen_bob = seen_bob.unwrap();

    let bob_id = bob.id().to_string();
    assert_eq!(seen_bob.id, bob_id);
    assert_eq!(seen_bob.name, "bob");

    let event = wait_for(&mut bob_events, |e| matches!(e, NodeEvent::PeerConnected(_))).await;
    let NodeEvent::PeerConnected(seen_alice) = event else { unreachable!() };
    assert_eq!(seen_alice.id, alice.id());

    // The dialer sees the port it dialed; the acceptor sees the socket's source
    let bob_in_alice = alice.known_peers().into_iter().find(|p| p.id == bob_id).unwrap();
    assert_eq!(bob_in_alice.host, "127.0.0.1");
    assert_eq!(bob_in_alice.port, bob.listen_port());

    let alice_in_bob = bob.known_peers().into_iter().find(|p| p.id == alice.id()).unwrap();
    assert_eq!(alice_in_bob.host, "127.0.0.1");
    assert_ne!(alice_in_bob.port, 0);

    assert_eq!(alice.connected_peers().len(), 1);
    eventually("bob registers alice", || bob.connected_peers().len() == 1).await;
    assert_eq!(alice.pending_count(), 0);
    eventually("bob has no pending", || bob.pending_count() == 0).await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn node_sends_hello_first_on_inbound_connections() {
    let (node, _events) = start_node(test_config("carol")).await;

    let mut peer = FakePeer::connect(node.listen_port(), "fake").await;
    let hello = peer.expect_type("HELLO").await;

    assert_eq!(hello["fromId"], node.id());
    assert_eq!(hello["fromName"], "carol");
    assert_eq!(hello["port"], node.listen_port());
    assert!(hello["peers"].as_array().unwrap().is_empty());
    assert!(hello["timestamp"].as_i64().unwrap() > 0);

    node.shutdown().await;
}

#[tokio::test]
async fn connecting_to_ourselves_is_dropped() {
    let (node, mut events) = start_node(test_config("narcissus")).await;

    node.connect("127.0.0.1", node.listen_port());
    wait_for(&mut events, |e| matches!(e, NodeEvent::Status(s) if s.starts_with("Connected to"))).await;

    // Both ends of the loop receive their own HELLO and close
    eventually("self-connection closed", || node.pending_count() == 0).await;
    assert!(node.connected_peers().is_empty());
    assert!(node.known_peers().is_empty());

    let later = drain_for(&mut events, Duration::from_millis(200)).await;
    assert!(!later.iter().any(|e| matches!(e, NodeEvent::PeerConnected(_))));

    node.shutdown().await;
}

#[tokio::test]
async fn unreachable_peer_reports_failure() {
    let (node, mut events) = start_node(test_config("dora")).await;

    // Grab a free port, then release it so nothing listens there
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    node.connect("127.0.0.1", port);

    let prefix = format!("Failed to connect to 127.0.0.1:{}:", port);
    wait_for(&mut events, |e| matches!(e, NodeEvent::Status(s) if s.starts_with(&prefix))).await;
    assert_eq!(node.pending_count(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn a_newer_connection_takes_over_the_peer_id() {
    let (node, mut events) = start_node(test_config("erin")).await;

    let mut first = FakePeer::handshake(node.listen_port(), "twin").await;
    wait_for(&mut events, |e| matches!(e, NodeEvent::PeerConnected(_))).await;

    let mut second = FakePeer::handshake(node.listen_port(), "twin").await;

    // The pending count is 1 both before and after the takeover, so wait on the
    // registered address instead
    let second_port = second.local_port;
    eventually("twin now reached via the second socket", || {
        node.connected_peers().iter().any(|p| p.id == "twin" && p.port == second_port)
    })
    .await;
    assert_eq!(node.connected_peers().len(), 1);
    assert_eq!(node.pending_count(), 1);
    assert_ne!(second_port, first.local_port);

    // Floods only reach the newest connection
    node.broadcast_chat("who gets this").unwrap();
    second.expect_type("CHAT").await;
    let to_first = first.drain(Duration::from_millis(300)).await;
    assert!(to_first.iter().all(|m| m["type"] != "CHAT"));

    // No second PeerConnected for the same id
    let later = drain_for(&mut events, Duration::from_millis(100)).await;
    assert!(!later.iter().any(|e| matches!(e, NodeEvent::PeerConnected(_))));

    // The parked one is still closed on shutdown
    node.shutdown().await;
    assert!(first.sees_eof().await);
    assert!(second.sees_eof().await);
}
