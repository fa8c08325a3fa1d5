mod common;

use common::{Calls, StubDriver, drain, fast_config, next_action};
use rtermtel::config::CoreConfig;
use rtermtel::driver::{DriverRegistry, Platform};
use rtermtel::envelope::{Emitter, OutboundReceiver, outbound_channel};
use rtermtel::error::{DriverError, SessionError};
use rtermtel::session::{Session, TelemetrySession};
use serde_json::json;

fn session(registry: DriverRegistry) -> (TelemetrySession, OutboundReceiver, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let (tx, rx) = outbound_channel();
    let session = TelemetrySession::new(
        Emitter::new("telemetry", tx),
        registry,
        fast_config(&dir.path().join("theme.json")),
    );
    (session, rx, dir)
}

fn connect_payload(driver_type: &str) -> serde_json::Value {
    json!({
        "host": "192.0.2.10",
        "username": "admin",
        "password": "secret",
        "driver_type": driver_type,
    })
}

#[tokio::test]
async fn connect_reports_success_then_first_update() {
    let stub = StubDriver::sw1();
    let (session, mut rx, _dir) = session(stub.registry(Platform::Eos));

    session
        .handle("connect", connect_payload("eos"))
        .await
        .expect("connect");
    assert!(session.is_active());

    let connected = next_action(&mut rx, "connected").await;
    assert_eq!(connected.session_id, "telemetry");
    assert_eq!(connected.payload, json!({"status": "success"}));

    let update = next_action(&mut rx, "telemetry_update").await;
    assert_eq!(update.payload["device_info"]["hostname"], "sw1");
    assert_eq!(update.payload["device_info"]["uptime"], "0d 1h 1m");
    assert_eq!(update.payload["interfaces"][0]["status"], "UP");
    assert_eq!(update.payload["routing_table"][0]["next_hop"], "10.0.0.254");
    for key in ["device_info", "interfaces", "neighbors", "routing_table", "environment"] {
        assert!(update.payload.get(key).is_some(), "missing {}", key);
    }
    assert!(!update.to_json().contains("_raw_line"));

    session.disconnect().await;
}

#[tokio::test]
async fn only_one_collector_per_session() {
    let stub = StubDriver::sw1();
    let calls = stub.calls.clone();
    let (session, mut rx, _dir) = session(stub.registry(Platform::Eos));

    session.handle("connect", connect_payload("eos")).await.expect("connect");
    next_action(&mut rx, "telemetry_update").await;

    for _ in 0..3 {
        session.collect_all_telemetry().await.expect("collect");
    }
    assert!(session.is_monitoring().await);
    assert_eq!(Calls::get(&calls.facts), 1);
    assert_eq!(Calls::get(&calls.open), 1);

    session.disconnect().await;
    assert!(!session.is_monitoring().await);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let stub = StubDriver::sw1();
    let calls = stub.calls.clone();
    let (session, mut rx, _dir) = session(stub.registry(Platform::Eos));

    session.handle("connect", connect_payload("eos")).await.expect("connect");
    next_action(&mut rx, "telemetry_update").await;

    session.handle("disconnect", json!({})).await.expect("disconnect");
    let disconnected = next_action(&mut rx, "disconnected").await;
    assert_eq!(disconnected.payload, json!({"status": "success"}));
    assert!(!session.is_active());
    assert_eq!(Calls::get(&calls.close), 1);

    session.handle("disconnect", json!({})).await.expect("second disconnect");
    assert!(drain(&mut rx).is_empty());
    assert_eq!(Calls::get(&calls.close), 1);
}

#[tokio::test]
async fn failed_open_leaves_session_inactive() {
    let stub = StubDriver {
        fail_open: true,
        ..StubDriver::sw1()
    };
    let calls = stub.calls.clone();
    let (session, mut rx, _dir) = session(stub.registry(Platform::Eos));

    let err = session
        .handle("connect", connect_payload("eos"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Driver(DriverError::Command { .. })));
    assert!(!session.is_active());
    assert!(!session.is_monitoring().await);
    assert_eq!(Calls::get(&calls.close), 1);
    assert!(drain(&mut rx).iter().all(|e| e.action != "connected"));
}

#[tokio::test]
async fn unknown_driver_type_is_rejected() {
    let (session, _rx, _dir) = session(DriverRegistry::with_builtin());

    let err = session
        .handle("connect", connect_payload("vyos"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Driver(DriverError::UnsupportedPlatform(ref p)) if p == "vyos"
    ));

    let err = session
        .handle("connect", connect_payload("eos"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Driver(DriverError::NoDriver(_))));
    assert!(!session.is_active());
}

#[tokio::test]
async fn refresh_requires_a_connection() {
    let (session, _rx, _dir) = session(DriverRegistry::with_builtin());

    for action in ["get_device_info", "get_environment", "start_monitoring"] {
        let err = session.handle(action, json!({})).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected), "{}", action);
    }
}

#[tokio::test]
async fn device_info_refresh_keeps_other_categories() {
    let stub = StubDriver::sw1();
    let (session, mut rx, _dir) = session(stub.registry(Platform::Eos));

    session.handle("connect", connect_payload("eos")).await.expect("connect");
    let first = next_action(&mut rx, "telemetry_update").await;

    session
        .handle("get_device_info", json!({}))
        .await
        .expect("device info");
    let merged = next_action(&mut rx, "telemetry_update").await;
    assert_eq!(merged.payload["device_info"], first.payload["device_info"]);
    assert_eq!(merged.payload["interfaces"], first.payload["interfaces"]);
    assert_eq!(merged.payload["neighbors"], first.payload["neighbors"]);

    session.disconnect().await;
}

#[tokio::test]
async fn reconnect_replaces_the_previous_driver() {
    let stub = StubDriver::sw1();
    let calls = stub.calls.clone();
    let (session, mut rx, _dir) = session(stub.registry(Platform::Eos));

    session.handle("connect", connect_payload("eos")).await.expect("connect");
    next_action(&mut rx, "telemetry_update").await;
    session.handle("connect", connect_payload("eos")).await.expect("reconnect");
    next_action(&mut rx, "telemetry_update").await;

    assert_eq!(Calls::get(&calls.open), 2);
    assert_eq!(Calls::get(&calls.close), 1);
    assert!(session.is_monitoring().await);

    session.disconnect().await;
    assert_eq!(Calls::get(&calls.close), 2);
}

#[tokio::test]
async fn unknown_action_is_an_error() {
    let (session, _rx, _dir) = session(DriverRegistry::with_builtin());

    let err = session.handle("reboot", json!({})).await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownAction { ref action, .. } if action == "reboot"));
}

#[tokio::test]
async fn connect_without_host_is_invalid() {
    let (session, _rx, _dir) = session(DriverRegistry::with_builtin());

    let err = session
        .handle("connect", json!({"username": "admin"}))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidPayload(_)));
}

fn session_without_polling(
    registry: DriverRegistry,
) -> (TelemetrySession, OutboundReceiver, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let (tx, rx) = outbound_channel();
    let config = CoreConfig {
        refresh_rate_secs: 0,
        ..fast_config(&dir.path().join("theme.json"))
    };
    let session = TelemetrySession::new(Emitter::new("telemetry", tx), registry, config);
    (session, rx, dir)
}

#[tokio::test]
async fn collector_start_failure_sends_minimal_telemetry() {
    for (reply, hostname) in [(Some("leaf7".to_string()), "leaf7"), (None, "unknown")] {
        let stub = StubDriver {
            hostname_reply: reply,
            ..StubDriver::sw1()
        };
        let calls = stub.calls.clone();
        let (session, mut rx, _dir) = session_without_polling(stub.registry(Platform::Eos));

        session
            .handle("connect", connect_payload("eos"))
            .await
            .expect("connect");
        assert!(session.is_active());
        assert!(!session.is_monitoring().await);

        let actions = drain(&mut rx);
        let names: Vec<&str> = actions.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(names, ["connected", "error", "telemetry_update"]);

        let error = &actions[1];
        assert!(
            error.payload["message"]
                .as_str()
                .is_some_and(|m| m.starts_with("Failed to start telemetry collection"))
        );

        let update = &actions[2].payload;
        for key in ["device_info", "interfaces", "neighbors", "routing_table", "environment"] {
            assert!(update.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(update["device_info"]["hostname"], hostname);
        assert_eq!(update["device_info"]["os_version"], "eos");
        assert_eq!(update["interfaces"], json!([]));
        assert_eq!(Calls::get(&calls.facts), 0);

        session.disconnect().await;
    }
}

#[tokio::test]
async fn environment_refresh_merges_into_minimal_snapshot() {
    let stub = StubDriver {
        hostname_reply: Some("leaf7".to_string()),
        ..StubDriver::sw1()
    };
    let (session, mut rx, _dir) = session_without_polling(stub.registry(Platform::Eos));

    session
        .handle("connect", connect_payload("eos"))
        .await
        .expect("connect");
    next_action(&mut rx, "telemetry_update").await;

    session
        .handle("get_environment", json!({}))
        .await
        .expect("environment");
    let merged = next_action(&mut rx, "telemetry_update").await;
    assert_eq!(merged.payload["device_info"]["hostname"], "leaf7");
    assert_eq!(merged.payload["environment"]["cpu"]["average_usage"], 15.0);
    assert_eq!(merged.payload["environment"]["cpu"]["num_cpus"], 2);
    assert_eq!(merged.payload["environment"]["temperature"][0]["location"], "Inlet");
    assert_eq!(merged.payload["interfaces"], json!([]));

    session.disconnect().await;
}

#[tokio::test]
async fn environment_refresh_keeps_other_categories() {
    let stub = StubDriver::sw1();
    let (session, mut rx, _dir) = session(stub.registry(Platform::Eos));

    session.handle("connect", connect_payload("eos")).await.expect("connect");
    let first = next_action(&mut rx, "telemetry_update").await;

    session
        .handle("get_environment", json!({}))
        .await
        .expect("environment");
    let merged = next_action(&mut rx, "telemetry_update").await;
    assert_eq!(merged.payload, first.payload);

    session.disconnect().await;
}
