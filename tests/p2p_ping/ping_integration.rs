mod support;

use p2p_ping::p2p::{
    Coordinator, CoordinatorConfig, DisconnectReason, FlushStats, Frame, HandshakeConfig,
    MessageKey, ProtocolSpec,
};
use p2p_ping::report::render_report;
use std::sync::Arc;
use std::time::Duration;
use support::{
    refused_record, sample_status, spawn_peer, spawn_peer_with, test_prober, test_prober_with,
};
use tokio::sync::mpsc;
use tokio::time::sleep;

#[tokio::test]
async fn test_end_to_end_flush_reports_counts_once() {
    let status = sample_status(1);
    let peer = spawn_peer(move |mut conn| async move {
        conn.accept_peer(Some(&status)).await.unwrap();
        for code in [0x11, 0x11, 0x11, 0x12, 0x12] {
            conn.write_frame(&Frame::empty(code)).await.unwrap();
        }
        sleep(Duration::from_millis(700)).await;
        conn.disconnect(DisconnectReason::ClientQuitting).await;
    })
    .await;

    let config = CoordinatorConfig {
        max_concurrency: 4,
        listen: true,
        flush_interval: Duration::from_millis(250),
    };
    let (sink, mut flushed) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(config, Arc::new(test_prober())).with_flush_sink(sink);
    let report = coordinator.run(vec![peer.record.clone()]).await;

    assert_eq!(report.results.len(), 1);
    let outcome = report.results.get(&peer.record.id()).unwrap();
    assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
    assert!(outcome.status.is_some());

    assert_eq!(
        report.flush_stats,
        FlushStats {
            flushes: 1,
            messages: 5
        }
    );
    drop(coordinator);
    let flush = flushed.recv().await.unwrap();
    assert_eq!(flush.get(&MessageKey::new("eth", 0x01)), 3);
    assert_eq!(flush.get(&MessageKey::new("eth", 0x02)), 2);
    assert!(flushed.recv().await.is_none());
}

#[tokio::test]
async fn test_failures_stay_with_their_node() {
    let status = sample_status(1);
    let good = spawn_peer(move |mut conn| async move {
        conn.accept_peer(Some(&status)).await.unwrap();
        conn.write_frame(&Frame::empty(0x11)).await.unwrap();
        conn.disconnect(DisconnectReason::ClientQuitting).await;
    })
    .await;
    let useless = spawn_peer_with(
        HandshakeConfig {
            protocols: vec![ProtocolSpec {
                name: "les",
                version: 4,
                length: 23,
                has_status: true,
            }],
            ..HandshakeConfig::default()
        },
        |mut conn| async move {
            let _ = conn.exchange_hello().await;
        },
    )
    .await;
    let refused = refused_record().await;

    let coordinator = Coordinator::new(CoordinatorConfig::default(), Arc::new(test_prober()));
    let report = coordinator
        .run(vec![
            good.record.clone(),
            useless.record.clone(),
            refused.clone(),
        ])
        .await;

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.results.successful_count(), 1);
    assert!(report.results.get(&good.record.id()).unwrap().is_success());
    assert_eq!(
        report
            .results
            .get(&useless.record.id())
            .unwrap()
            .error
            .as_deref(),
        Some("handshake failed: no common capabilities")
    );
    let refused_error = report.results.get(&refused.id()).unwrap().error.clone();
    assert!(refused_error.unwrap().starts_with("dial "));

    // final drain picks up the good peer's message
    assert_eq!(report.flush_stats.messages, 1);

    let json: serde_json::Value =
        serde_json::from_slice(&render_report(&report.results).unwrap()).unwrap();
    let refused_entry = &json[refused.id().to_string()];
    assert_eq!(refused_entry["record"], refused.to_string());
    assert!(refused_entry.get("hello").is_none());
}

#[tokio::test]
async fn test_without_listen_nothing_is_counted() {
    let status = sample_status(1);
    let peer = spawn_peer(move |mut conn| async move {
        conn.accept_peer(Some(&status)).await.unwrap();
        for _ in 0..3 {
            let _ = conn.write_frame(&Frame::empty(0x11)).await;
        }
        let _ = conn.read_frame().await;
    })
    .await;

    let config = CoordinatorConfig {
        listen: false,
        flush_interval: Duration::from_millis(100),
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::new(config, Arc::new(test_prober()));
    let report = coordinator.run(vec![peer.record.clone()]).await;

    let outcome = report.results.get(&peer.record.id()).unwrap();
    assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
    assert!(outcome.hello.is_some());
    assert_eq!(report.flush_stats, FlushStats::default());

    peer.handle.abort();
}

#[tokio::test]
async fn test_silent_peer_does_not_hold_up_its_sibling() {
    let status = sample_status(1);
    let good = spawn_peer(move |mut conn| async move {
        conn.accept_peer(Some(&status)).await.unwrap();
        conn.write_frame(&Frame::empty(0x13)).await.unwrap();
        conn.disconnect(DisconnectReason::ClientQuitting).await;
    })
    .await;
    // completes the secure channel, never sends hello
    let silent = spawn_peer(|mut conn| async move {
        let _ = conn.read_frame().await;
        sleep(Duration::from_secs(10)).await;
    })
    .await;

    let prober = test_prober_with(|config| {
        config.handshake_timeout = Duration::from_millis(500);
    });
    let config = CoordinatorConfig {
        max_concurrency: 2,
        ..CoordinatorConfig::default()
    };
    let report = Coordinator::new(config, Arc::new(prober))
        .run(vec![silent.record.clone(), good.record.clone()])
        .await;

    assert_eq!(report.results.len(), 2);
    let good_outcome = report.results.get(&good.record.id()).unwrap();
    assert!(good_outcome.is_success(), "unexpected error: {:?}", good_outcome.error);
    assert!(good_outcome.status.is_some());

    let silent_outcome = report.results.get(&silent.record.id()).unwrap();
    assert_eq!(
        silent_outcome.error.as_deref(),
        Some("handshake failed: timed out after 500ms")
    );
    assert!(silent_outcome.hello.is_none());
    assert_eq!(report.flush_stats.messages, 1);

    silent.handle.abort();
}
