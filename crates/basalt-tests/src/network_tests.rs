//! Network integration tests.
//!
//! Each test runs a real server on an ephemeral localhost port and talks
//! to it with raw protocol clients from the harness.

use crate::harness::*;
use basalt_network::{negotiate, Capability, Server};
use bytes::Bytes;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

fn tx() -> Capability {
    Capability::new("tx", 1)
}

#[tokio::test]
async fn test_duplicate_node_id_admits_exactly_one() {
    let (proto, _probe) = probe_protocol(tx());
    let server = Server::new(test_server_config(0xAA));
    server.register_protocol(proto).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    server
        .discovery()
        .unwrap()
        .insert(test_node(0x01, "127.0.0.1:1".parse().unwrap()));

    // Two clients both claiming the same node id, concurrently.
    let (c1, c2) = tokio::join!(
        TestClient::connect(addr, test_id(0x01), vec![tx()]),
        TestClient::connect(addr, test_id(0x01), vec![tx()]),
    );
    let mut c1 = c1.unwrap();
    let mut c2 = c2.unwrap();

    let window = Duration::from_secs(2);
    let (d1, d2) = tokio::join!(c1.read_until_disc(window), c2.read_until_disc(window));

    // Exactly one side is told it is already connected.
    let discs: Vec<u8> = [d1, d2].into_iter().flatten().collect();
    assert_eq!(discs, vec![10]);
    assert_eq!(server.peer_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_heartbeat_cadence() {
    let server = Server::new(test_server_config(0xAB));
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    server
        .discovery()
        .unwrap()
        .insert(test_node(0x02, "127.0.0.1:1".parse().unwrap()));

    let mut client = TestClient::connect(addr, test_id(0x02), Vec::new())
        .await
        .unwrap();

    // Ping interval is 100 ms; a silent peer still gets a steady stream.
    let (pings, disced) = client.count_pings(Duration::from_millis(900)).await;
    assert!(pings >= 5, "expected at least 5 pings, got {pings}");
    assert!(!disced, "heartbeat must not disconnect an idle peer");

    server.stop().await;
}

#[tokio::test]
async fn test_graceful_shutdown_notifies_peers_and_protocols() {
    let (proto, mut probe) = probe_protocol(tx());
    let server = Server::new(test_server_config(0xAC));
    server.register_protocol(proto).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    let db = server.discovery().unwrap();

    let mut clients = Vec::new();
    for byte in [0x11, 0x12, 0x13] {
        db.insert(test_node(byte, "127.0.0.1:1".parse().unwrap()));
        clients.push(
            TestClient::connect(addr, test_id(byte), vec![tx()])
                .await
                .unwrap(),
        );
    }
    assert!(wait_for(|| server.peer_count() == 3, Duration::from_secs(3)).await);

    let mut c3 = clients.pop().unwrap();
    let mut c2 = clients.pop().unwrap();
    let mut c1 = clients.pop().unwrap();

    let window = Duration::from_secs(5);
    let (_, d1, d2, d3) = tokio::join!(
        server.stop(),
        c1.read_until_disc(window),
        c2.read_until_disc(window),
        c3.read_until_disc(window),
    );
    assert_eq!(d1, Some(11));
    assert_eq!(d2, Some(11));
    assert_eq!(d3, Some(11));
    assert!(!server.is_running());
    assert_eq!(server.peer_count(), 0);

    // The sub-protocol saw every peer come and go, then its queues closed.
    let mut added = 0;
    let mut removed = 0;
    while let Some(event) = probe.recv().await {
        match event {
            ProbeEvent::Added(_) => added += 1,
            ProbeEvent::Removed(_) => removed += 1,
            ProbeEvent::Message { .. } => {}
        }
    }
    assert_eq!(added, 3);
    assert_eq!(removed, 3);
}

#[tokio::test]
async fn test_capability_intersection_routes_messages() {
    let (tx_proto, mut tx_probe) = probe_protocol(tx());
    let (chain_proto, mut chain_probe) = probe_protocol(Capability::new("chain", 1));
    let server = Server::new(test_server_config(0xAD));
    server.register_protocol(tx_proto).unwrap();
    server.register_protocol(chain_proto).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    server
        .discovery()
        .unwrap()
        .insert(test_node(0x21, "127.0.0.1:1".parse().unwrap()));

    let client_caps = vec![Capability::new("light", 1), tx()];
    let mut client = TestClient::connect(addr, test_id(0x21), client_caps.clone())
        .await
        .unwrap();

    // Both endpoints derive the same table: control=1, tx/1=2.
    let tables = negotiate(&client_caps, &client.hello.remote.capabilities);
    assert_eq!(tables.by_cap.get("tx/1"), Some(&2));
    assert_eq!(tables.by_code.len(), 1);

    client.send(2, 9, b"gossip").await.unwrap();

    let message = loop {
        let event = timeout(Duration::from_secs(3), tx_probe.recv())
            .await
            .expect("tx protocol should hear the message")
            .unwrap();
        if let ProbeEvent::Message {
            from,
            msg_code,
            payload,
        } = event
        {
            break (from, msg_code, payload);
        }
    };
    assert_eq!(
        message,
        (test_id(0x21), 9, Bytes::from_static(b"gossip"))
    );

    drop(client);
    server.stop().await;

    // The chain protocol observed the peer but never a message.
    while let Some(event) = chain_probe.recv().await {
        assert!(
            !matches!(event, ProbeEvent::Message { .. }),
            "chain protocol must not receive tx traffic"
        );
    }
}

#[tokio::test]
async fn test_unknown_inbound_node_id_rejected() {
    let (proto, mut probe) = probe_protocol(tx());
    let server = Server::new(test_server_config(0xAE));
    server.register_protocol(proto).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    // Node 0x31 is not in the discovery snapshot.
    let mut client = TestClient::connect(addr, test_id(0x31), vec![tx()])
        .await
        .unwrap();

    // The server aborts the handshake: no disc frame, just a closed
    // connection, and nothing is admitted.
    let result = timeout(Duration::from_secs(3), client.reader.recv_frame()).await;
    assert!(matches!(result, Ok(Err(_))));
    assert_eq!(server.peer_count(), 0);

    server.stop().await;
    assert!(probe.recv().await.is_none(), "no peer-added may be delivered");
}

#[tokio::test]
async fn test_admission_tokens_recycle_after_stalled_handshake() {
    let mut config = test_server_config(0xAF);
    config.max_pending_peers = 1;
    config.conn.read_timeout = Duration::from_millis(500);
    let server = Server::new(config);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    server
        .discovery()
        .unwrap()
        .insert(test_node(0x41, "127.0.0.1:1".parse().unwrap()));

    // A silent connection occupies the only admission slot until its
    // handshake read deadline fires and the token is returned.
    let stalled = TcpStream::connect(addr).await.unwrap();

    let client = TestClient::connect(addr, test_id(0x41), Vec::new())
        .await
        .unwrap();
    assert!(
        wait_for(|| server.peer_count() == 1, Duration::from_secs(3)).await,
        "second handshake should proceed once the slot frees up"
    );

    drop(stalled);
    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_event_ordering_added_message_removed() {
    let (proto, mut probe) = probe_protocol(tx());
    let server = Server::new(test_server_config(0xB0));
    server.register_protocol(proto).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    server
        .discovery()
        .unwrap()
        .insert(test_node(0x51, "127.0.0.1:1".parse().unwrap()));

    let mut client = TestClient::connect(addr, test_id(0x51), vec![tx()])
        .await
        .unwrap();
    client.send(2, 5, b"one").await.unwrap();
    client.send(2, 6, b"two").await.unwrap();
    sleep(Duration::from_millis(100)).await;
    drop(client);

    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(3), probe.recv())
            .await
            .expect("peer departure must reach the protocol")
            .unwrap();
        let done = matches!(event, ProbeEvent::Removed(_));
        events.push(event);
        if done {
            break;
        }
    }

    assert_eq!(
        events,
        vec![
            ProbeEvent::Added(test_id(0x51)),
            ProbeEvent::Message {
                from: test_id(0x51),
                msg_code: 5,
                payload: Bytes::from_static(b"one"),
            },
            ProbeEvent::Message {
                from: test_id(0x51),
                msg_code: 6,
                payload: Bytes::from_static(b"two"),
            },
            ProbeEvent::Removed(test_id(0x51)),
        ]
    );

    server.stop().await;
}

#[tokio::test]
async fn test_two_servers_dial_and_mesh() {
    let (proto_a, _probe_a) = probe_protocol(tx());
    let (proto_b, _probe_b) = probe_protocol(tx());

    let server_b = Server::new(test_server_config(0xB2));
    server_b.register_protocol(proto_b).unwrap();
    server_b.start().await.unwrap();
    let b_addr = server_b.local_addr().unwrap();

    // A learns B as a static node and dials it on the next tick.
    let mut config_a = test_server_config(0xB1);
    config_a.static_nodes = vec![test_node(0xB2, b_addr)];
    let server_a = Server::new(config_a);
    server_a.register_protocol(proto_a).unwrap();
    server_a.start().await.unwrap();

    // B resolves A's inbound handshake against its own discovery.
    server_b
        .discovery()
        .unwrap()
        .insert(test_node(0xB1, "127.0.0.1:1".parse().unwrap()));

    assert!(
        wait_for(
            || server_a.peer_count() == 1 && server_b.peer_count() == 1,
            Duration::from_secs(5),
        )
        .await,
        "both servers should admit exactly one peer"
    );

    tokio::join!(server_a.stop(), server_b.stop());
    assert_eq!(server_a.peer_count(), 0);
    assert_eq!(server_b.peer_count(), 0);
}
