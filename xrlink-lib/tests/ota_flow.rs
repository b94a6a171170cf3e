//! Firmware update runs against the simulated glasses.

mod common;
use common::*;

use std::collections::BTreeMap;
use xrlink_lib::OtaConfig;
use xrlink_lib::frame::{CmdHeader, Frame};
use xrlink_lib::framer::OtaDataFramer;
use xrlink_lib::ota::{OtaState, OtaUpdater};

fn glasses_at(main: &str, aux: &str) -> SimConfig {
    let mut versions = BTreeMap::new();
    versions.insert(1, main.to_string());
    versions.insert(2, aux.to_string());
    SimConfig {
        versions,
        ..Default::default()
    }
}

fn packets_for(file: &FirmwareFile, types: &[u32], mtu: usize) -> usize {
    file.sections
        .iter()
        .filter(|s| types.contains(&s.header.data_type))
        .map(|s| OtaDataFramer::new(s.bin_type(), s.full_data(), mtu).packet_count())
        .sum()
}

/// Command codes written after the pairing exchange settled.
fn codes_after(sim: &SimulatedAccessory, skip: usize) -> Vec<u16> {
    sim.command_writes()
        .iter()
        .skip(skip)
        .filter_map(|w| CmdHeader::parse(w).ok())
        .map(|h| h.cmd)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_update_sends_outdated_sections() {
    let file = sample_firmware();
    // Type 1 is behind (0.0.1 < 2), type 2 is current (1 == 1).
    let (session, sim) = connected_session(glasses_at("0.0.1", "1")).await;
    settle().await;
    let skip = sim.command_writes().len();

    let updater = OtaUpdater::new(session.clone(), OtaConfig::default());
    let progress = updater.progress();
    updater.update_file(&file).await.unwrap();

    assert_eq!(*updater.state().borrow(), OtaState::Completed);
    assert_eq!(*progress.borrow(), 1.0);
    assert!(sim.rebooted());

    let expected_packets = packets_for(&file, &[1], session.mtu());
    assert_eq!(sim.ota_packets() as usize, expected_packets);

    let codes = codes_after(&sim, skip);
    assert_eq!(codes[0], 0x29);
    assert_eq!(codes[1], 0x7B);
    assert!(codes[2..2 + expected_packets].iter().all(|c| *c == 0x1A));
    assert_eq!(&codes[2 + expected_packets..], &[0x7D, 0x2B, 0x1B]);
}

#[tokio::test(start_paused = true)]
async fn test_start_announces_total_with_heads() {
    let file = sample_firmware();
    let (session, sim) = connected_session(glasses_at("0", "0")).await;
    settle().await;
    let skip = sim.command_writes().len();

    OtaUpdater::new(session, OtaConfig::default())
        .update_file(&file)
        .await
        .unwrap();

    let start = sim
        .command_writes()
        .into_iter()
        .skip(skip)
        .find(|w| CmdHeader::parse(w).map(|h| h.cmd == 0x7B).unwrap_or(false))
        .unwrap();
    let total = u32::from_le_bytes(start[8..12].try_into().unwrap());
    assert_eq!(total, 48 + 1200 + 48 + 300);
}

#[tokio::test(start_paused = true)]
async fn test_data_packets_verify_and_reassemble() {
    let file = sample_firmware();
    let (session, sim) = connected_session(glasses_at("9", "9")).await;
    settle().await;
    let skip = sim.command_writes().len();

    OtaUpdater::new(session, OtaConfig::default().with_force_update(true))
        .update_file(&file)
        .await
        .unwrap();

    let frames: Vec<Frame> = sim
        .command_writes()
        .iter()
        .skip(skip)
        .filter(|w| CmdHeader::parse(w).map(|h| h.cmd == 0x1A).unwrap_or(false))
        .map(|w| Frame::parse(w).unwrap())
        .collect();
    let main: Vec<_> = frames.iter().filter(|f| f.bin_type == 1).cloned().collect();
    let data = xrlink_lib::frame::reassemble(&main).unwrap();
    assert_eq!(data, file.sections[0].full_data());
    assert!(frames.iter().all(|f| f.encoded_len() <= 247 - 3));
}

#[tokio::test(start_paused = true)]
async fn test_up_to_date_completes_without_start() {
    let file = sample_firmware();
    let (session, sim) = connected_session(glasses_at("2", "1")).await;
    settle().await;
    let skip = sim.command_writes().len();

    let updater = OtaUpdater::new(session, OtaConfig::default());
    updater.update_file(&file).await.unwrap();

    assert_eq!(*updater.state().borrow(), OtaState::Completed);
    assert_eq!(codes_after(&sim, skip), vec![0x29]);
    assert_eq!(sim.ota_packets(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_nak_aborts_update() {
    let file = sample_firmware();
    let sim = SimConfig {
        nak_packet: Some(2),
        ..glasses_at("0", "0")
    };
    let (session, accessory) = connected_session(sim).await;
    settle().await;

    let updater = OtaUpdater::new(session, OtaConfig::default());
    let err = updater.update_file(&file).await.unwrap_err();

    assert!(matches!(err, XrError::Ota(_)));
    assert!(matches!(*updater.state().borrow(), OtaState::Failed(_)));
    assert_eq!(accessory.ota_packets(), 3);
    assert!(!accessory.rebooted());
}

#[tokio::test(start_paused = true)]
async fn test_update_requires_connection() {
    let (session, _sim) = session_with(SimConfig::default(), SessionConfig::default());
    let updater = OtaUpdater::new(session, OtaConfig::default());
    assert!(matches!(
        updater.update_file(&sample_firmware()).await,
        Err(XrError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_update_from_path() {
    let dir = std::env::temp_dir().join(format!("xrlink-ota-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("firmware.bag");
    std::fs::write(&path, sample_firmware().to_bytes()).unwrap();

    let (session, sim) = connected_session(glasses_at("0", "5")).await;
    OtaUpdater::new(session, OtaConfig::default()).update(&path).await.unwrap();
    assert!(sim.rebooted());

    std::fs::write(&path, b"not a container").unwrap();
    let (session, _sim) = connected_session(SimConfig::default()).await;
    let updater = OtaUpdater::new(session, OtaConfig::default());
    assert!(updater.update(&path).await.unwrap_err().is_integrity());
    assert!(matches!(*updater.state().borrow(), OtaState::Failed(_)));
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_notifies_glasses() {
    let file = sample_firmware();
    let (session, sim) = connected_session(glasses_at("0", "0")).await;
    settle().await;

    let updater = OtaUpdater::new(session, OtaConfig::default());
    let mut state = updater.state();
    let handle = updater.start(file);
    state.wait_for(|s| *s == OtaState::Updating).await.unwrap();

    handle.cancel();
    assert!(matches!(handle.wait().await, Err(XrError::Cancelled)));
    assert_eq!(*updater.state().borrow(), OtaState::Idle);

    let last = sim.command_writes().last().cloned().unwrap();
    assert_eq!(CmdHeader::parse(&last).unwrap().cmd, 0x7C);
    assert!(!sim.rebooted());
}
