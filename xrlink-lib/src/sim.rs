//! In-memory glasses that speak the accessory side of the protocol.
//!
//! [`SimulatedAccessory`] implements [`Link`] and answers every request
//! immediately on the session's event mailbox: the handshake, the pairing
//! dialogue, command acknowledgments, version queries and OTA packet acks.
//! Used by the integration tests and the `simulate` CLI command.

use crate::command::CommandCode;
use crate::constants::{ACK_MAGIC, CMD_BINARY_PACKET, CMD_MAGIC, HANDSHAKE_RESPONSE_SIZE, TOKEN_SIZE};
use crate::crc::crc8_maxim;
use crate::error::{Result, XrError};
use crate::frame::{CmdHeader, Frame};
use crate::link::{ChannelId, ChannelInfo, Link, LinkEvent};
use crate::telemetry::{self, TelemetrySample};
use crate::token::DeviceToken;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// How the glasses answer handshake tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeScript {
    Accept,
    Reject,
    /// Answers with a short frame that is neither accept nor reject
    Malformed,
    /// Rejects the first `n` tokens, then accepts
    RejectThenAccept(u32),
}

/// Link lifecycle calls seen by the glasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOp {
    Open,
    Close,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Largest MTU the glasses agree to
    pub max_mtu: u16,
    pub handshake: HandshakeScript,
    /// Sub-token handed out on an accepted handshake
    pub device_token: DeviceToken,
    /// Answer to the first-time pairing dialog
    pub user_accepts: bool,
    /// Reported firmware versions by data type
    pub versions: BTreeMap<u32, String>,
    pub battery: u16,
    pub brightness: u8,
    pub mac_address: [u8; 6],
    /// Four-digit model code, reported after the `0215` marker
    pub model: u16,
    pub serial_number: String,
    /// Negative-acknowledge the n-th OTA packet (0-based, counted across sections)
    pub nak_packet: Option<u32>,
    /// Never acknowledge commands. Pairing notifications still go out.
    pub silent: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(1, "1.0.0".to_string());
        Self {
            max_mtu: 247,
            handshake: HandshakeScript::Accept,
            device_token: [0x5A, 0x17, 0xC3, 0x09],
            user_accepts: true,
            versions,
            battery: 87,
            brightness: 5,
            mac_address: [0xC0, 0xFF, 0xEE, 0x00, 0x12, 0x34],
            model: 0x0701,
            serial_number: "XR24A0001".to_string(),
            nak_packet: None,
            silent: false,
        }
    }
}

#[derive(Default)]
struct SimState {
    events: Option<mpsc::UnboundedSender<LinkEvent>>,
    handshake_attempts: u32,
    handshake_response: Option<Bytes>,
    accepted: bool,
    awaiting_confirmation: bool,
    fail_writes: bool,
    rebooted: bool,
    ota_packets: u32,
    writes: Vec<(ChannelId, Bytes)>,
    link_ops: Vec<LinkOp>,
    /// Acknowledgments are swallowed; unsolicited notifications still go out.
    silent: bool,
}

impl SimState {
    fn emit(&self, event: LinkEvent) {
        trace!(?event, "sim event");
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn notify(&self, channel: ChannelId, value: impl Into<Bytes>) {
        self.emit(LinkEvent::FrameReceived(channel, value.into()));
    }

    fn reply(&self, frame: Vec<u8>) {
        if !self.silent {
            self.notify(ChannelId::Response, frame);
        }
    }

    fn ack(&self, code: u16, payload: &[u8]) {
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&ACK_MAGIC.to_le_bytes());
        frame.extend_from_slice(&code.to_le_bytes());
        frame.extend_from_slice(&[0; 4]);
        frame.extend_from_slice(payload);
        self.reply(frame);
    }
}

pub struct SimulatedAccessory {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimulatedAccessory {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Every write received so far, in order.
    pub fn writes(&self) -> Vec<(ChannelId, Bytes)> {
        self.state().writes.clone()
    }

    /// Writes on the command channel.
    pub fn command_writes(&self) -> Vec<Bytes> {
        self.state()
            .writes
            .iter()
            .filter(|(channel, _)| *channel == ChannelId::Write)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn handshake_attempts(&self) -> u32 {
        self.state().handshake_attempts
    }

    pub fn ota_packets(&self) -> u32 {
        self.state().ota_packets
    }

    pub fn rebooted(&self) -> bool {
        self.state().rebooted
    }

    /// Every open and close, in order. Survives reconnects.
    pub fn link_ops(&self) -> Vec<LinkOp> {
        self.state().link_ops.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state().events.is_some()
    }

    /// Makes every following write fail as if the radio went away.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Sends an arbitrary notification.
    pub fn notify(&self, channel: ChannelId, value: impl Into<Bytes>) {
        self.state().notify(channel, value);
    }

    pub fn push_telemetry(&self, samples: &[TelemetrySample]) {
        self.notify(ChannelId::Telemetry, telemetry::encode_frame(samples));
    }

    /// Unsolicited battery report.
    pub fn report_battery(&self, level: u16) {
        let mut frame = vec![0x45, 0x4D, 0x10, 0x00, 0x02, 0x00, 0x04, 0x00];
        frame.extend_from_slice(&level.to_le_bytes());
        self.notify(ChannelId::Response, frame);
    }

    /// The glasses go out of range.
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.emit(LinkEvent::Disconnected);
        state.events = None;
    }

    fn handshake_answer(&self, state: &mut SimState, token: &[u8]) -> Bytes {
        state.handshake_attempts += 1;
        let valid = token.len() == TOKEN_SIZE && crc8_maxim(&token[..TOKEN_SIZE - 1]) == token[TOKEN_SIZE - 1];
        let accept = valid
            && match self.config.handshake {
                HandshakeScript::Accept => true,
                HandshakeScript::Reject | HandshakeScript::Malformed => false,
                HandshakeScript::RejectThenAccept(n) => state.handshake_attempts > n,
            };

        if accept {
            state.accepted = true;
            let mut response = vec![0u8; HANDSHAKE_RESPONSE_SIZE];
            response[0] = 0x64;
            response[12..16].copy_from_slice(&self.config.device_token);
            return Bytes::from(response);
        }
        if self.config.handshake == HandshakeScript::Malformed {
            return Bytes::from_static(&[0x02, 0x00, 0x00]);
        }
        let mut response = vec![0u8; HANDSHAKE_RESPONSE_SIZE];
        response[0] = 0x01;
        Bytes::from(response)
    }

    fn command(&self, state: &mut SimState, data: &[u8]) {
        let Ok(header) = CmdHeader::parse(data) else {
            debug!(bytes = %hex::encode(data), "sim ignored short write");
            return;
        };
        if header.magic != CMD_MAGIC {
            return;
        }

        if header.cmd == CMD_BINARY_PACKET {
            let index = state.ota_packets;
            state.ota_packets += 1;
            let (status, bin_type, packet_index) = match Frame::parse(data) {
                Ok(frame) if self.config.nak_packet == Some(index) => (0x12, frame.bin_type, frame.index),
                Ok(frame) => (0x00, frame.bin_type, frame.index),
                Err(_) => (0x13, 0, 0),
            };
            let mut ack = vec![0x4F, 0x42, 0x1A, 0x00, 0x06, status, bin_type];
            ack.extend_from_slice(&packet_index.to_le_bytes());
            ack.push(0);
            state.reply(ack);
            return;
        }

        match CommandCode::try_from(header.cmd) {
            Ok(CommandCode::ShowLongPress) => {
                state.awaiting_confirmation = true;
                state.notify(ChannelId::Response, vec![0x4F, 0x42, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00]);
            }
            Ok(CommandCode::RequestPhoneModel) => {
                state.ack(header.cmd, &[]);
                if std::mem::take(&mut state.awaiting_confirmation) {
                    let answer = u8::from(self.config.user_accepts);
                    state.notify(
                        ChannelId::Response,
                        vec![0x45, 0x4D, 0x68, 0x00, 0x01, 0x00, 0x02, 0x00, answer],
                    );
                }
            }
            Ok(CommandCode::ReadBattery) => {
                let mut frame = vec![0x4F, 0x42, 0x10, 0x00, 0x03, 0x00, 0x06, 0x00, 0x00];
                frame.extend_from_slice(&self.config.battery.to_le_bytes());
                state.reply(frame);
            }
            Ok(CommandCode::GetBrightness) => {
                state.ack(header.cmd, &[0x00, self.config.brightness]);
            }
            Ok(CommandCode::GetVersionList) => {
                let mut payload = vec![0x00];
                for (data_type, version) in &self.config.versions {
                    let mut parts = version.split('.').map(|p| p.parse::<u8>().unwrap_or(0));
                    payload.extend([
                        parts.next().unwrap_or(0),
                        parts.next().unwrap_or(0),
                        parts.next().unwrap_or(0),
                        *data_type as u8,
                    ]);
                }
                state.ack(header.cmd, &payload);
            }
            Ok(CommandCode::GetMacAddress) => {
                let mut frame = vec![0x4F, 0x42, 0x19, 0x00, 0x06];
                frame.extend_from_slice(&self.config.mac_address);
                state.reply(frame);
            }
            Ok(CommandCode::GetDeviceType) => {
                let mut frame = vec![0x4F, 0x42, 0x2A, 0x00, 0x05, 0x02, 0x15];
                frame.extend_from_slice(&self.config.model.to_be_bytes());
                frame.push(0x00);
                state.reply(frame);
            }
            Ok(CommandCode::GetSerialNumber) => {
                let serial = self.config.serial_number.as_bytes();
                let mut frame = vec![0x4F, 0x42, 0x4A, 0x00, serial.len() as u8];
                frame.extend_from_slice(serial);
                state.reply(frame);
            }
            Ok(CommandCode::Reboot) => {
                state.rebooted = true;
                state.ack(header.cmd, &[]);
            }
            Ok(_) => state.ack(header.cmd, &[]),
            Err(_) => debug!(cmd = header.cmd, "sim ignored unknown command"),
        }
    }
}

#[async_trait::async_trait]
impl Link for SimulatedAccessory {
    async fn open(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<()> {
        let mut state = self.state();
        // Each connection starts fresh; the logs survive.
        let writes = std::mem::take(&mut state.writes);
        let mut link_ops = std::mem::take(&mut state.link_ops);
        link_ops.push(LinkOp::Open);
        *state = SimState {
            events: Some(events),
            writes,
            link_ops,
            silent: self.config.silent,
            ..SimState::default()
        };
        state.emit(LinkEvent::Connected);
        Ok(())
    }

    async fn request_mtu(&self, mtu: u16) -> Result<()> {
        self.state().emit(LinkEvent::MtuChanged(mtu.min(self.config.max_mtu)));
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        self.state().emit(LinkEvent::ServicesDiscovered(vec![
            ChannelInfo::new(ChannelId::Write, false),
            ChannelInfo::new(ChannelId::Response, true),
            ChannelInfo::new(ChannelId::Handshake, true),
            ChannelInfo::new(ChannelId::Telemetry, true),
        ]));
        Ok(())
    }

    async fn write_descriptor(&self, channel: ChannelId) -> Result<()> {
        let state = self.state();
        state.emit(LinkEvent::DescriptorWritten(channel));
        if channel == ChannelId::Response && state.accepted {
            state.notify(ChannelId::Response, vec![0x01]);
        }
        Ok(())
    }

    async fn write(&self, channel: ChannelId, data: Bytes) -> Result<()> {
        let mut state = self.state();
        if state.events.is_none() {
            return Err(XrError::LinkClosed);
        }
        if state.fail_writes {
            return Err(XrError::Transport("simulated write failure".to_string()));
        }
        state.writes.push((channel, data.clone()));
        match channel {
            ChannelId::Handshake => {
                let answer = self.handshake_answer(&mut state, &data);
                state.handshake_response = Some(answer);
            }
            ChannelId::Write => self.command(&mut state, &data),
            _ => {}
        }
        Ok(())
    }

    async fn read(&self, channel: ChannelId) -> Result<()> {
        let state = self.state();
        if channel == ChannelId::Handshake {
            let value = state
                .handshake_response
                .clone()
                .unwrap_or_else(|| Bytes::from(vec![0u8; HANDSHAKE_RESPONSE_SIZE]));
            state.notify(ChannelId::Handshake, value);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state();
        state.events = None;
        state.link_ops.push(LinkOp::Close);
        Ok(())
    }
}
