//! Integration tests for the device connection against the mock server.

use std::time::{Duration, Instant};

use scope_acq::device::{ConnectionConfig, ConnectionState, DeviceConnection, MockMicroscopeServer};
use scope_acq::ScopeError;

fn fast_config(port: u16) -> ConnectionConfig {
    let mut config = ConnectionConfig::new("127.0.0.1", port);
    config.connect_timeout = Duration::from_millis(500);
    config.read_timeout = Duration::from_millis(300);
    config.reconnect.delay = Duration::from_millis(20);
    config.reconnect.max_attempts = 3;
    config.health.enabled = false;
    config
}

#[tokio::test]
async fn test_stage_round_trip() {
    let server = MockMicroscopeServer::start().await.unwrap();
    let conn = DeviceConnection::new(fast_config(server.port()));
    conn.connect().await.unwrap();

    conn.move_stage_xy(-1250.5, 3300.25).await.unwrap();
    conn.move_stage_z(12.75).await.unwrap();
    conn.move_rotation(-90.0).await.unwrap();

    assert_eq!(conn.get_stage_xy().await.unwrap(), (-1250.5, 3300.25));
    assert_eq!(conn.get_stage_z().await.unwrap(), 12.75);
    assert_eq!(conn.get_rotation().await.unwrap(), -90.0);
    assert_eq!(
        server.commands(),
        vec!["move____", "movez___", "mover___", "getxy___", "getz____", "getr____"]
    );
    conn.close().await;
}

#[tokio::test]
async fn test_reconnect_exhaustion_then_fail_fast() {
    let server = MockMicroscopeServer::start().await.unwrap();
    let conn = DeviceConnection::new(fast_config(server.port()));
    conn.connect().await.unwrap();
    conn.get_stage_xy().await.unwrap();

    server.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the dropped socket surfaces on the in-flight command
    assert!(conn.get_stage_xy().await.is_err());

    // the next command waits for the reconnection loop, which gives up
    let err = conn.get_stage_xy().await.unwrap_err();
    assert!(
        matches!(err, ScopeError::ReconnectExhausted { attempts: 3 }),
        "unexpected error: {err}"
    );
    assert_eq!(conn.reconnect_attempts(), 3);

    // afterwards commands fail immediately without a fourth attempt
    let started = Instant::now();
    let err = conn.get_stage_z().await.unwrap_err();
    assert!(matches!(err, ScopeError::ReconnectExhausted { .. }));
    assert!(started.elapsed() < Duration::from_millis(20));
    assert_eq!(conn.reconnect_attempts(), 3);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_explicit_connect_recovers_after_exhaustion() {
    let server = MockMicroscopeServer::start().await.unwrap();
    let port = server.port();
    let conn = DeviceConnection::new(fast_config(port));
    conn.connect().await.unwrap();

    server.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = conn.get_stage_xy().await;
    assert!(conn.get_stage_xy().await.is_err());

    let restarted = MockMicroscopeServer::start_on(&format!("127.0.0.1:{port}"))
        .await
        .unwrap();
    restarted.set_position(5.0, 6.0, 0.0);
    conn.connect().await.unwrap();
    assert_eq!(conn.get_stage_xy().await.unwrap(), (5.0, 6.0));
}

#[tokio::test]
async fn test_read_timeout_with_silent_server() {
    let server = MockMicroscopeServer::start().await.unwrap();
    let conn = DeviceConnection::new(fast_config(server.port()));
    conn.connect().await.unwrap();
    server.set_silent(true);

    let started = Instant::now();
    let err = conn.get_stage_xy().await.unwrap_err();
    assert!(matches!(err, ScopeError::Timeout { .. }), "unexpected error: {err}");
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_hardware_fault_keeps_connection() {
    let server = MockMicroscopeServer::start().await.unwrap();
    let conn = DeviceConnection::new(fast_config(server.port()));
    conn.connect().await.unwrap();
    server.set_hardware_fault(Some("stage not loaded"));

    let err = conn.get_stage_xy().await.unwrap_err();
    assert!(matches!(err, ScopeError::HardwareFault(_)));
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.reconnect_attempts(), 0);

    server.set_hardware_fault(None);
    assert!(conn.get_field_of_view().await.is_ok());
    assert_eq!(server.connection_count(), 1);
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_idle_connection_sends_heartbeat() {
    let server = MockMicroscopeServer::start().await.unwrap();
    let mut config = fast_config(server.port());
    config.health.enabled = true;
    config.health.interval = Duration::from_millis(50);
    let conn = DeviceConnection::new(config);
    conn.connect().await.unwrap();

    // no caller command was issued
    wait_until(|| conn.health_status().checks >= 1).await;
    assert!(server.commands().iter().any(|c| c == "getxy___"));
    assert!(conn.health_status().last_success.is_some());
    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.close().await;
}

#[tokio::test]
async fn test_failed_heartbeat_disconnects_and_reconnects() {
    let server = MockMicroscopeServer::start().await.unwrap();
    let mut config = fast_config(server.port());
    config.health.enabled = true;
    config.health.interval = Duration::from_millis(50);
    let conn = DeviceConnection::new(config);
    conn.connect().await.unwrap();

    server.stop();
    wait_until(|| conn.reconnect_attempts() > 0).await;
    assert_ne!(conn.state(), ConnectionState::Connected);
    let health = conn.health_status();
    assert!(health.consecutive_failures >= 1);
    assert!(health.last_error_message.is_some());
}

#[tokio::test]
async fn test_shutdown_server_then_fail_fast() {
    let server = MockMicroscopeServer::start().await.unwrap();
    let conn = DeviceConnection::new(fast_config(server.port()));
    conn.connect().await.unwrap();

    conn.shutdown_server().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), server.wait_for_shutdown())
        .await
        .unwrap();
    assert!(matches!(
        conn.get_stage_xy().await,
        Err(ScopeError::ReconnectExhausted { .. })
    ));
}

#[tokio::test]
#[ignore = "needs a non-routable address; slow on some networks"]
async fn test_connect_timeout_against_black_hole() {
    let mut config = ConnectionConfig::new("10.255.255.1", 5000);
    config.connect_timeout = Duration::from_millis(250);
    let conn = DeviceConnection::new(config);

    let started = Instant::now();
    let err = conn.connect().await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, ScopeError::Timeout { .. }), "unexpected error: {err}");
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed < Duration::from_secs(2));
}
