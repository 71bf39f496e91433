mod support;

use p2p_ping::p2p::wire::codes;
use p2p_ping::p2p::{
    DisconnectReason, Frame, HandshakeConfig, MessageCounter, MessageKey, NodeKey,
    NodeRecord, Prober, ProtocolSpec, Responder, ResponderConfig,
};
use std::time::Duration;
use support::{
    refused_record, sample_status, spawn_delayed_peer, spawn_peer, spawn_peer_with,
    spawn_raw_peer, test_prober, test_prober_with,
};
use tokio::time::sleep;

#[tokio::test]
async fn test_successful_handshake_captures_hello_and_status() {
    let status = sample_status(1);
    let expected = status.clone();
    let peer = spawn_peer(move |mut conn| async move {
        conn.accept_peer(Some(&status)).await.unwrap();
        // hold the connection until the prober leaves
        let _ = conn.read_frame().await;
    })
    .await;

    let outcome = test_prober()
        .probe(&peer.record, false, &MessageCounter::new())
        .await;

    assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
    let hello = outcome.hello.expect("hello should be captured");
    assert_eq!(&hello.node_key, peer.record.public_key());
    assert!(hello.client_id.starts_with("p2p_ping/v"));
    assert_eq!(outcome.status, Some(expected));

    peer.handle.abort();
}

#[tokio::test]
async fn test_peer_closing_before_hello_fails_handshake() {
    let peer = spawn_peer(|conn| async move {
        drop(conn);
    })
    .await;

    let outcome = test_prober()
        .probe(&peer.record, true, &MessageCounter::new())
        .await;

    let error = outcome.error.expect("probe should fail");
    assert!(error.starts_with("handshake failed"), "{}", error);
    assert!(outcome.hello.is_none());
    assert!(outcome.status.is_none());
}

#[tokio::test]
async fn test_missing_hello_fails_handshake() {
    let peer = spawn_peer(|mut conn| async move {
        conn.write_frame(&Frame::empty(codes::PING)).await.unwrap();
        let _ = conn.read_frame().await;
    })
    .await;

    let outcome = test_prober()
        .probe(&peer.record, true, &MessageCounter::new())
        .await;

    let error = outcome.error.expect("probe should fail");
    assert!(error.contains("expected hello"), "{}", error);
    assert!(outcome.hello.is_none());

    peer.handle.abort();
}

#[tokio::test]
async fn test_stalled_peer_times_out() {
    let peer = spawn_raw_peer(|stream| async move {
        sleep(Duration::from_secs(10)).await;
        drop(stream);
    })
    .await;

    let prober = test_prober_with(|config| {
        config.handshake_timeout = Duration::from_millis(300);
    });
    let outcome = prober
        .probe(&peer.record, true, &MessageCounter::new())
        .await;

    let error = outcome.error.expect("probe should time out");
    assert!(error.contains("timed out"), "{}", error);

    peer.handle.abort();
}

#[tokio::test]
async fn test_handshake_timeout_spans_noise_and_hello() {
    // each step alone fits the limit, together they exceed it
    let status = sample_status(1);
    let peer = spawn_delayed_peer(
        HandshakeConfig::default(),
        Duration::from_millis(800),
        move |mut conn| async move {
            sleep(Duration::from_millis(800)).await;
            let _ = conn.accept_peer(Some(&status)).await;
            let _ = conn.read_frame().await;
        },
    )
    .await;

    let prober = test_prober_with(|config| {
        config.handshake_timeout = Duration::from_secs(1);
    });
    let outcome = prober
        .probe(&peer.record, false, &MessageCounter::new())
        .await;

    assert_eq!(
        outcome.error.as_deref(),
        Some("handshake failed: timed out after 1s")
    );
    assert!(outcome.hello.is_none());
    assert!(outcome.status.is_none());

    peer.handle.abort();
}

#[tokio::test]
async fn test_disconnect_instead_of_hello() {
    let peer = spawn_peer(|mut conn| async move {
        let _ = conn.read_frame().await;
        conn.disconnect(DisconnectReason::TooManyPeers).await;
    })
    .await;

    let outcome = test_prober()
        .probe(&peer.record, true, &MessageCounter::new())
        .await;

    assert_eq!(
        outcome.error.as_deref(),
        Some("handshake failed: peer disconnected: too many peers")
    );
    assert!(outcome.hello.is_none());
}

#[tokio::test]
async fn test_disconnect_before_status_keeps_hello() {
    let peer = spawn_peer(|mut conn| async move {
        conn.exchange_hello().await.unwrap();
        conn.disconnect(DisconnectReason::UselessPeer).await;
    })
    .await;

    let outcome = test_prober()
        .probe(&peer.record, true, &MessageCounter::new())
        .await;

    assert_eq!(
        outcome.error.as_deref(),
        Some("handshake failed: peer disconnected: useless peer")
    );
    assert!(outcome.hello.is_some());
    assert!(outcome.status.is_none());
}

#[tokio::test]
async fn test_second_hello_before_status() {
    let peer = spawn_peer(|mut conn| async move {
        conn.exchange_hello().await.unwrap();
        let again = HandshakeConfig::default().hello(&NodeKey::generate());
        conn.write_frame(&Frame::hello(&again).unwrap()).await.unwrap();
        let _ = conn.read_frame().await;
    })
    .await;

    let outcome = test_prober()
        .probe(&peer.record, true, &MessageCounter::new())
        .await;

    assert_eq!(
        outcome.error.as_deref(),
        Some("handshake failed: duplicate hello")
    );
    assert!(outcome.hello.is_some());
    assert!(outcome.status.is_none());

    peer.handle.abort();
}

#[tokio::test]
async fn test_read_failure_keeps_handshake_results_and_counts() {
    let status = sample_status(1);
    let expected = status.clone();
    let peer = spawn_peer(move |mut conn| async move {
        conn.accept_peer(Some(&status)).await.unwrap();
        conn.write_frame(&Frame::empty(0x11)).await.unwrap();
        // go quiet without closing
        let _ = conn.read_frame().await;
    })
    .await;

    let prober = test_prober_with(|config| {
        config.read_timeout = Some(Duration::from_millis(300));
    });
    let counter = MessageCounter::new();
    let outcome = prober.probe(&peer.record, true, &counter).await;

    assert_eq!(
        outcome.error.as_deref(),
        Some("read failed: no message received for 300ms")
    );
    assert!(outcome.hello.is_some());
    assert_eq!(outcome.status, Some(expected));
    assert_eq!(counter.snapshot_and_reset().get(&MessageKey::new("eth", 0x01)), 1);

    peer.handle.abort();
}

#[tokio::test]
async fn test_no_common_capabilities() {
    let les_only = HandshakeConfig {
        protocols: vec![ProtocolSpec {
            name: "les",
            version: 4,
            length: 23,
            has_status: true,
        }],
        ..HandshakeConfig::default()
    };
    let peer = spawn_peer_with(les_only, |mut conn| async move {
        let _ = conn.exchange_hello().await;
    })
    .await;

    let outcome = test_prober()
        .probe(&peer.record, true, &MessageCounter::new())
        .await;

    assert_eq!(
        outcome.error.as_deref(),
        Some("handshake failed: no common capabilities")
    );
    assert!(outcome.hello.is_some());
    assert!(outcome.status.is_none());
}

#[tokio::test]
async fn test_status_out_of_order() {
    let peer = spawn_peer(|mut conn| async move {
        conn.exchange_hello().await.unwrap();
        // eth message 0x01 before any status
        conn.write_frame(&Frame::empty(0x11)).await.unwrap();
        let _ = conn.read_frame().await;
    })
    .await;

    let outcome = test_prober()
        .probe(&peer.record, true, &MessageCounter::new())
        .await;

    assert_eq!(
        outcome.error.as_deref(),
        Some("handshake failed: status out of order")
    );
    assert!(outcome.hello.is_some());
    assert!(outcome.status.is_none());

    peer.handle.abort();
}

#[tokio::test]
async fn test_connection_refused() {
    let record = refused_record().await;

    let outcome = test_prober()
        .probe(&record, true, &MessageCounter::new())
        .await;

    let error = outcome.error.expect("dial should fail");
    assert!(error.starts_with("dial 127.0.0.1:"), "{}", error);
    assert!(outcome.hello.is_none());
}

#[tokio::test]
async fn test_responder_key_must_match_record() {
    let peer = spawn_peer(|mut conn| async move {
        let _ = conn.read_frame().await;
    })
    .await;
    let impostor = NodeRecord::new(
        *NodeKey::generate().public(),
        peer.record.host(),
        peer.record.port(),
    );

    let outcome = test_prober()
        .probe(&impostor, true, &MessageCounter::new())
        .await;

    let error = outcome.error.expect("key check should fail");
    assert!(error.contains("does not match node key"), "{}", error);

    peer.handle.abort();
}

#[tokio::test]
async fn test_ping_is_answered_and_not_counted() {
    let status = sample_status(1);
    let peer = spawn_peer(move |mut conn| async move {
        conn.accept_peer(Some(&status)).await.unwrap();
        conn.write_frame(&Frame::empty(codes::PING)).await.unwrap();
        let reply = conn.read_frame().await.unwrap();
        assert_eq!(reply.code, codes::PONG);
        conn.write_frame(&Frame::empty(0x11)).await.unwrap();
        conn.disconnect(DisconnectReason::ClientQuitting).await;
    })
    .await;

    let counter = MessageCounter::new();
    let outcome = test_prober().probe(&peer.record, true, &counter).await;

    assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
    let snapshot = counter.snapshot_and_reset();
    assert_eq!(snapshot.get(&MessageKey::new("eth", 0x01)), 1);
    assert_eq!(snapshot.get(&MessageKey::new("p2p", codes::PING)), 0);
    assert_eq!(snapshot.total(), 1);

    // the peer task asserts on the pong
    peer.handle.await.unwrap();
}

#[tokio::test]
async fn test_probe_against_responder() {
    let key = NodeKey::generate();
    let responder = Responder::bind(
        "127.0.0.1:0".parse().unwrap(),
        key,
        ResponderConfig::new(7),
    )
    .await
    .unwrap();
    let record = responder.record().unwrap();
    let server_handle = tokio::spawn(responder.run());

    let outcome = test_prober()
        .probe(&record, false, &MessageCounter::new())
        .await;

    assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
    let hello = outcome.hello.unwrap();
    assert_eq!(hello.listen_port, record.port());
    let status = outcome.status.unwrap();
    assert_eq!(status.network_id, 7);
    assert_eq!(status.protocol_version, 68);

    server_handle.abort();
}
