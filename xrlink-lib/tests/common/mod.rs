//! Common test utilities and shared imports

// Shared across test files; not every item is used in every file
#![allow(dead_code, unused_imports)]

pub use bytes::Bytes;
pub use hex;
pub use std::sync::Arc;
pub use std::time::Duration;
pub use xrlink_lib::error::XrError;
pub use xrlink_lib::link::{ChannelId, Link};
pub use xrlink_lib::ota::{BagHeader, FirmwareFile, FirmwareSection, SectionHeader};
pub use xrlink_lib::sim::{HandshakeScript, LinkOp, SimConfig, SimulatedAccessory};
pub use xrlink_lib::{ConnectionState, DeviceSession, SessionConfig};

/// Decode hex string to bytes for testing
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Honors RUST_LOG when debugging a failing test.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_test_writer())
        .try_init();
}

pub fn session_with(sim: SimConfig, config: SessionConfig) -> (DeviceSession, Arc<SimulatedAccessory>) {
    init_tracing();
    let accessory = Arc::new(SimulatedAccessory::new(sim));
    let link: Arc<dyn Link> = accessory.clone();
    let session = DeviceSession::new("AA:BB:CC:DD:EE:FF", link, config).expect("valid config");
    (session, accessory)
}

/// Connects and waits for the session to settle in a terminal state.
pub async fn connect(session: &DeviceSession) -> ConnectionState {
    session.connect().await.expect("connect");
    tokio::time::timeout(
        Duration::from_secs(30),
        session.wait_for_state(|s| {
            matches!(
                s,
                ConnectionState::Connected | ConnectionState::Disconnected | ConnectionState::Available
            )
        }),
    )
    .await
    .expect("session never settled")
    .expect("session alive")
}

/// A connected first-time session against default glasses.
pub async fn connected_session(sim: SimConfig) -> (DeviceSession, Arc<SimulatedAccessory>) {
    let (session, accessory) = session_with(sim, SessionConfig::default());
    assert_eq!(connect(&session).await, ConnectionState::Connected);
    (session, accessory)
}

/// Lets the pairing follow-up commands finish so the queue is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(2)).await;
}

pub fn section(data_type: u32, version: u32, data: Vec<u8>) -> FirmwareSection {
    let header = SectionHeader {
        data_type,
        version,
        start_addr: 0x0800_0000,
        ..Default::default()
    };
    FirmwareSection::new(header, data).expect("section")
}

/// Two sections: type 1 at version 2 (1200 bytes) and type 2 at version 1 (300 bytes).
pub fn sample_firmware() -> FirmwareFile {
    let main: Vec<u8> = (0..1200u32).map(|i| (i * 7 % 251) as u8).collect();
    let aux = vec![0xA5; 300];
    FirmwareFile::new(
        BagHeader::new(0x0002_0001, 0x10, 1_700_000_000),
        vec![section(1, 2, main), section(2, 1, aux)],
    )
    .expect("firmware")
}
