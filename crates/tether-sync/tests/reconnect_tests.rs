mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tether_crypto::KeyPair;
use tether_sync::{KeyMaterial, ReconnectPolicy, StaticCredentials, SyncError};
use tether_types::events::SyncConnectionState;

use common::*;

fn fast_reconnect(max_attempts: u32) -> tether_sync::SyncConfig {
    let mut cfg = config();
    cfg.reconnect = ReconnectPolicy {
        enabled: true,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
        max_attempts,
    };
    cfg
}

#[tokio::test(start_paused = true)]
async fn dropped_stream_reconnects_with_backoff() {
    let mut h = harness(fast_reconnect(10));
    h.service.connect().await.unwrap();
    let mut server = h.next_server().await;

    let started = tokio::time::Instant::now();
    server.hang_up();
    let _server = h.next_server().await;

    assert!(started.elapsed() >= Duration::from_millis(100));
    settle().await;
    assert_eq!(h.service.status(), SyncConnectionState::Connected);
    assert_eq!(h.connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn transport_error_triggers_reconnect() {
    let mut h = harness(fast_reconnect(10));
    h.service.connect().await.unwrap();
    let server = h.next_server().await;

    server.push_error("connection reset by peer");
    let _server = h.next_server().await;
    settle().await;
    assert_eq!(h.service.status(), SyncConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn failed_keepalive_reconnects_and_restores_subscriptions() {
    let mut cfg = fast_reconnect(10);
    cfg.ping_interval = Duration::from_secs(5);
    let mut h = harness(cfg);

    h.service.subscribe("session-a").await.unwrap();
    h.service.connect().await.unwrap();
    let mut server = h.next_server().await;
    assert_eq!(
        server.next_control().await,
        json!({"type": "subscribe", "session_id": "session-a"})
    );

    // Inbound side stays open; only writes fail
    server.stop_reading();
    let mut server = h.next_server().await;
    assert_eq!(
        server.next_control().await,
        json!({"type": "subscribe", "session_id": "session-a"})
    );
    assert_eq!(h.connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn attempt_counter_resets_after_successful_connect() {
    let mut h = harness(fast_reconnect(10));
    let mut status = h.service.status_changes();

    h.service.connect().await.unwrap();
    let mut server = h.next_server().await;

    for _ in 0..3 {
        server.hang_up();
        let seen = *status
            .wait_for(|s| matches!(s, SyncConnectionState::Reconnecting(_)))
            .await
            .unwrap();
        assert_eq!(seen, SyncConnectionState::Reconnecting(1));

        server = h.next_server().await;
        settle().await;
        assert_eq!(h.service.status(), SyncConnectionState::Connected);
    }
}

#[tokio::test(start_paused = true)]
async fn reconnection_gives_up_after_max_attempts() {
    let mut h = harness(fast_reconnect(3));
    let mut errors = h.service.sync_errors();
    h.connector.refuse(true);

    let err = h.service.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::ConnectionFailed(_)));
    assert_eq!(h.service.status(), SyncConnectionState::Reconnecting(1));

    let fatal = tokio::time::timeout(WAIT, errors.recv())
        .await
        .unwrap()
        .unwrap();
    match fatal {
        SyncError::ConnectionFailed(reason) => assert!(reason.contains("giving up after 3")),
        other => panic!("unexpected error {:?}", other),
    }

    // One caller attempt plus three reconnections
    assert_eq!(h.connector.opens(), 4);
    assert_eq!(h.service.status(), SyncConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.opens(), 4);

    // An explicit connect starts over
    h.connector.refuse(false);
    h.service.connect().await.unwrap();
    let _server = h.next_server().await;
    assert_eq!(h.service.status(), SyncConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn disabled_reconnect_stays_down() {
    let mut cfg = fast_reconnect(10);
    cfg.reconnect.enabled = false;
    let mut h = harness(cfg);

    h.service.connect().await.unwrap();
    let mut server = h.next_server().await;
    server.hang_up();
    settle().await;

    assert_eq!(h.service.status(), SyncConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let h = harness(fast_reconnect(10));
    h.connector.refuse(true);

    assert!(h.service.connect().await.is_err());
    assert_eq!(h.service.status(), SyncConnectionState::Reconnecting(1));

    h.service.disconnect().await;
    assert_eq!(h.service.status(), SyncConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.opens(), 1);
    assert_eq!(h.service.status(), SyncConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_loops_and_keeps_subscriptions() {
    let mut cfg = fast_reconnect(10);
    cfg.ping_interval = Duration::from_secs(5);
    let mut h = harness(cfg);

    h.service.subscribe("session-a").await.unwrap();
    h.service.connect().await.unwrap();
    let mut server = h.next_server().await;
    server.next_control().await;

    h.service.disconnect().await;
    assert_eq!(h.service.status(), SyncConnectionState::Disconnected);

    // No keepalive and no reconnect after disconnect
    server.assert_quiet(Duration::from_secs(30)).await;
    assert_eq!(h.connector.opens(), 1);
    assert_eq!(h.service.subscriptions().await, vec!["session-a"]);

    // Disconnect is safe to repeat
    h.service.disconnect().await;

    h.service.connect().await.unwrap();
    let mut server = h.next_server().await;
    assert_eq!(
        server.next_control().await,
        json!({"type": "subscribe", "session_id": "session-a"})
    );
}

#[tokio::test(start_paused = true)]
async fn logout_forgets_subscriptions() {
    let mut h = harness(config());
    h.service.subscribe("session-a").await.unwrap();
    h.service.connect().await.unwrap();
    let _server = h.next_server().await;

    h.service.logout().await;
    assert!(h.service.subscriptions().await.is_empty());
    assert_eq!(h.service.status(), SyncConnectionState::Disconnected);

    h.service.connect().await.unwrap();
    let mut server = h.next_server().await;
    server.assert_quiet(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn missing_token_is_reported() {
    let ours = KeyPair::generate();
    let theirs = KeyPair::generate();
    let credentials = Arc::new(StaticCredentials::default());
    credentials.set_key_material(KeyMaterial::new(ours.secret_key(), theirs.public_key()));
    let server_key = KeyMaterial::new(theirs.secret_key(), ours.public_key())
        .derive()
        .unwrap();
    let h = harness_with(config(), credentials, server_key);

    let err = h.service.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::ConnectionFailed(_)));
    assert_eq!(h.connector.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_transport_does_not_block_disconnect() {
    let mut h = harness(fast_reconnect(10));
    h.connector.stall_writes(true);
    h.service.connect().await.unwrap();
    let _server = h.next_server().await;

    let first = tokio::spawn({
        let service = h.service.clone();
        async move { service.subscribe("a").await }
    });
    let second = tokio::spawn({
        let service = h.service.clone();
        async move { service.subscribe("b").await }
    });
    settle().await;

    // Both are recorded even though neither write can complete
    assert_eq!(h.service.subscriptions().await, vec!["a", "b"]);

    tokio::time::timeout(Duration::from_secs(5), h.service.disconnect())
        .await
        .expect("disconnect blocked on a stalled transport");
    assert_eq!(h.service.status(), SyncConnectionState::Disconnected);

    assert!(matches!(first.await.unwrap(), Err(SyncError::SendFailed(_))));
    assert!(matches!(second.await.unwrap(), Err(SyncError::SendFailed(_))));
    assert_eq!(h.service.subscriptions().await, vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn stalled_keepalive_times_out_and_reconnects() {
    let mut cfg = fast_reconnect(10);
    cfg.ping_interval = Duration::from_secs(5);
    cfg.send_timeout = Duration::from_secs(3);
    let mut h = harness(cfg);
    let mut status = h.service.status_changes();

    h.connector.stall_writes(true);
    h.service.connect().await.unwrap();
    let _stalled = h.next_server().await;
    let started = tokio::time::Instant::now();
    h.connector.stall_writes(false);

    // First ping is queued at 5s and abandoned at 8s
    status
        .wait_for(|s| matches!(s, SyncConnectionState::Reconnecting(_)))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(8));

    let mut server = h.next_server().await;
    settle().await;
    assert_eq!(h.service.status(), SyncConnectionState::Connected);
    assert_eq!(h.connector.opens(), 2);

    // The fresh transport carries keepalives again
    assert_eq!(server.next_control().await, json!({"type": "ping"}));
}
