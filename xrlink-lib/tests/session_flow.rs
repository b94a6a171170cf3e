//! Connection, handshake and pairing scenarios against the simulated glasses.

mod common;
use common::*;

use tokio_stream::StreamExt;
use xrlink_lib::command::{DeviceInfoReader, GetBrightness, GetVersionList, ReadBattery};
use xrlink_lib::session::SessionRegistry;
use xrlink_lib::telemetry::{SensorKind, TelemetrySample};
use xrlink_lib::token::HandshakeToken;
use xrlink_lib::DeviceEvent;

const SHOW_LONG_PRESS: &str = "454d000000000000";
const REQUEST_PHONE_MODEL: &str = "454d67000100020001";

#[tokio::test(start_paused = true)]
async fn test_first_time_pairing_reaches_connected() {
    let (session, sim) = session_with(SimConfig::default(), SessionConfig::default().with_user_id(777));
    let mut events = session.events();

    assert_eq!(connect(&session).await, ConnectionState::Connected);
    assert_eq!(sim.handshake_attempts(), 1);
    assert_eq!(session.mtu(), 247);

    let writes: Vec<String> = sim.command_writes().iter().map(hex::encode).collect();
    assert_eq!(writes[0], SHOW_LONG_PRESS);
    assert_eq!(writes[1], REQUEST_PHONE_MODEL);

    assert_eq!(
        events.recv().await.unwrap(),
        DeviceEvent::Paired {
            user_id: 777,
            device_token: sim.config().device_token
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_handshake_token_written_once_per_attempt() {
    let (session, sim) = connected_session(SimConfig::default()).await;
    let tokens: Vec<_> = sim
        .writes()
        .into_iter()
        .filter(|(channel, _)| *channel == ChannelId::Handshake)
        .map(|(_, data)| data)
        .collect();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].len(), 27);
    assert_eq!(tokens[0][3], 0xE0);
    assert_eq!(&tokens[0][4..8], &session.config().user_id.to_le_bytes());
}

#[tokio::test(start_paused = true)]
async fn test_three_rejections_disconnect() {
    let sim = SimConfig {
        handshake: HandshakeScript::Reject,
        ..Default::default()
    };
    let (session, accessory) = session_with(sim, SessionConfig::default());

    assert_eq!(connect(&session).await, ConnectionState::Disconnected);
    assert_eq!(accessory.handshake_attempts(), 3);
    assert!(!accessory.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_responses_disconnect() {
    let sim = SimConfig {
        handshake: HandshakeScript::Malformed,
        ..Default::default()
    };
    let (session, accessory) = session_with(sim, SessionConfig::default());

    assert_eq!(connect(&session).await, ConnectionState::Disconnected);
    assert_eq!(accessory.handshake_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_accept_on_last_attempt() {
    let sim = SimConfig {
        handshake: HandshakeScript::RejectThenAccept(2),
        ..Default::default()
    };
    let (session, accessory) = session_with(sim, SessionConfig::default());

    assert_eq!(connect(&session).await, ConnectionState::Connected);
    assert_eq!(accessory.handshake_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_user_declines_pairing() {
    let sim = SimConfig {
        user_accepts: false,
        ..Default::default()
    };
    let (session, _accessory) = session_with(sim, SessionConfig::default());
    let mut events = session.events();

    assert_eq!(connect(&session).await, ConnectionState::Available);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_returning_device_skips_long_press() {
    let device_token = [0x11, 0x22, 0x33, 0x44];
    let sim = SimConfig {
        device_token,
        ..Default::default()
    };
    let config = SessionConfig::default().with_retrieve_token(device_token);
    let (session, accessory) = session_with(sim, config);

    assert_eq!(connect(&session).await, ConnectionState::Connected);

    let (_, token) = accessory
        .writes()
        .into_iter()
        .find(|(channel, _)| *channel == ChannelId::Handshake)
        .unwrap();
    let expected = HandshakeToken::retrieve(session.config().user_id, device_token);
    assert_eq!(token.as_ref(), expected.as_bytes());

    let writes: Vec<String> = accessory.command_writes().iter().map(hex::encode).collect();
    assert_eq!(writes, vec![REQUEST_PHONE_MODEL.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_state_stream_sees_transitions() {
    let (session, _sim) = session_with(SimConfig::default(), SessionConfig::default());
    let mut states = session.state_stream();
    assert_eq!(states.next().await, Some(ConnectionState::Available));

    session.connect().await.unwrap();
    let mut seen = Vec::new();
    while let Some(state) = states.next().await {
        seen.push(state);
        if state == ConnectionState::Connected {
            break;
        }
    }
    assert!(!seen.contains(&ConnectionState::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn test_commands_after_connect() {
    let (session, _sim) = connected_session(SimConfig::default()).await;

    assert_eq!(session.execute(GetBrightness).await.unwrap(), 5);
    let versions = session.execute(GetVersionList).await.unwrap();
    assert_eq!(versions.get(&1).map(String::as_str), Some("1.0.0"));
}

#[tokio::test(start_paused = true)]
async fn test_device_info_read_in_sequence() {
    let (session, _sim) = connected_session(SimConfig::default()).await;

    let info = DeviceInfoReader::read(&session).await.unwrap();
    assert_eq!(info.version, "1.0.0");
    assert_eq!(info.device_type, "0701");
    assert_eq!(info.mac_address, "C0:FF:EE:00:12:34");
    assert_eq!(info.serial_number, "XR24A0001");
}

#[tokio::test(start_paused = true)]
async fn test_battery_reports_and_reads() {
    let (session, sim) = connected_session(SimConfig::default()).await;
    let mut battery = session.battery();

    sim.report_battery(64);
    battery.changed().await.unwrap();
    assert_eq!(*battery.borrow_and_update(), Some(64));

    // The read completes on the battery acknowledgment itself.
    session.execute(ReadBattery).await.unwrap();
    assert_eq!(*battery.borrow(), Some(87));
}

#[tokio::test(start_paused = true)]
async fn test_device_events_forwarded() {
    let (session, sim) = connected_session(SimConfig::default()).await;
    let mut events = session.events();

    sim.notify(ChannelId::Response, hex_to_bytes("454dcc000100020001"));
    sim.notify(ChannelId::Response, hex_to_bytes("454d8f00120024000000"));
    assert_eq!(events.recv().await.unwrap(), DeviceEvent::EnterAgent);
    assert_eq!(events.recv().await.unwrap(), DeviceEvent::LeaveNavigation);
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_stream() {
    let (session, sim) = connected_session(SimConfig::default()).await;
    let mut stream = Box::pin(session.telemetry());

    let samples = [
        TelemetrySample::new(SensorKind::Accelerometer, 10, [0.0, 0.0, 9.8]),
        TelemetrySample::new(SensorKind::Gyroscope, 11, [0.5, 0.0, -0.5]),
    ];
    sim.push_telemetry(&samples);
    assert_eq!(stream.next().await.unwrap(), samples[0]);
    assert_eq!(stream.next().await.unwrap(), samples[1]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_pairing_returns_to_available() {
    let (session, sim) = connected_session(SimConfig::default()).await;
    sim.notify(ChannelId::Response, hex_to_bytes("4f420000010002001c"));

    let state = session
        .wait_for_state(|s| s != ConnectionState::Connected)
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::Available);
    assert!(!sim.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_link_drop_disconnects_and_rejects_commands() {
    let (session, sim) = connected_session(SimConfig::default()).await;
    sim.drop_link();

    let state = session
        .wait_for_state(|s| s == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::Disconnected);
    assert!(matches!(session.execute(GetBrightness).await, Err(XrError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_disconnects() {
    let (session, sim) = connected_session(SimConfig::default()).await;
    settle().await;
    sim.set_fail_writes(true);

    let err = session.execute(GetBrightness).await.unwrap_err();
    assert!(err.is_transport());
    session
        .wait_for_state(|s| s == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert!(!sim.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let (session, sim) = connected_session(SimConfig::default()).await;
    session.disconnect().await.unwrap();
    session.disconnect().await.unwrap();
    assert_eq!(session.current_state(), ConnectionState::Disconnected);
    assert!(!sim.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_disconnect() {
    let (session, sim) = connected_session(SimConfig::default()).await;
    session.disconnect().await.unwrap();
    assert_eq!(connect(&session).await, ConnectionState::Connected);
    assert_eq!(sim.handshake_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_racing_disconnect_settles_disconnected() {
    for _ in 0..50 {
        let (session, sim) = session_with(SimConfig::default(), SessionConfig::default());
        let (opened, closed) = tokio::join!(session.connect(), session.disconnect());
        opened.unwrap();
        closed.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(session.current_state(), ConnectionState::Disconnected);
        assert!(!sim.is_open());
        assert_eq!(sim.handshake_attempts(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_closes_old_link() {
    let (session, sim) = connected_session(SimConfig::default()).await;
    assert_eq!(sim.link_ops(), [LinkOp::Open]);

    assert_eq!(connect(&session).await, ConnectionState::Connected);
    assert_eq!(sim.link_ops(), [LinkOp::Open, LinkOp::Close, LinkOp::Open]);
    assert!(sim.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_decline_closes_old_link() {
    let sim = SimConfig {
        user_accepts: false,
        ..Default::default()
    };
    let (session, sim) = session_with(sim, SessionConfig::default());
    assert_eq!(connect(&session).await, ConnectionState::Available);
    assert!(sim.is_open());

    connect(&session).await;
    assert_eq!(sim.link_ops(), [LinkOp::Open, LinkOp::Close, LinkOp::Open]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_glasses_time_out_commands() {
    let sim = SimConfig {
        silent: true,
        ..Default::default()
    };
    let (session, _sim) = connected_session(sim).await;

    let start = tokio::time::Instant::now();
    let err = session.execute(GetBrightness).await.unwrap_err();
    assert!(matches!(err, XrError::CommandTimeout { command: "GetBrightness", .. }));
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_send_binary_frames_for_mtu() {
    let (session, sim) = connected_session(SimConfig::default()).await;
    settle().await;
    let before = sim.command_writes().len();

    let payload = vec![0x42; 600];
    let pending = session.send_binary(0x07, &payload, None).unwrap();
    // (25 + 600) bytes in chunks of 247 - 18
    assert_eq!(pending.len(), 3);
    for p in pending {
        p.await.unwrap();
    }
    assert_eq!(sim.command_writes().len(), before + 3);
}

#[tokio::test(start_paused = true)]
async fn test_registry_owns_sessions() {
    let registry = SessionRegistry::new();
    let (session, sim) = connected_session(SimConfig::default()).await;

    assert!(registry.insert(session.clone()).is_none());
    assert_eq!(registry.len(), 1);
    assert!(registry.get("AA:BB:CC:DD:EE:FF").is_some());

    registry.disconnect_all().await;
    assert_eq!(session.current_state(), ConnectionState::Disconnected);
    assert!(!sim.is_open());

    assert!(registry.remove("AA:BB:CC:DD:EE:FF").is_some());
    assert!(registry.is_empty());
}
