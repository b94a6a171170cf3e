//! Commands of the firmware update sequence.

use super::device::{CommandCode, request};
use super::{Command, CommandContext, require_len, void_command};
use crate::error::{Result, XrError};
use bytes::Bytes;

/// Announces an update of `total` bytes (section heads included).
#[derive(Debug, Clone, Copy)]
pub struct OtaStart(pub u32);
void_command!(OtaStart, "OtaStart", |this| request(CommandCode::OtaStart, &this.0.to_le_bytes()));

#[derive(Debug, Clone, Copy, Default)]
pub struct SetOtaMode;
void_command!(SetOtaMode, "SetOtaMode", |_| request(CommandCode::SetOtaMode, &[]));

/// Writes the container version. Unlike other values it travels big-endian.
#[derive(Debug, Clone, Copy)]
pub struct SetVersion(pub u32);
void_command!(SetVersion, "SetVersion", |this| request(CommandCode::SetVersion, &this.0.to_be_bytes()));

#[derive(Debug, Clone, Copy, Default)]
pub struct Reboot;
void_command!(Reboot, "Reboot", |_| request(CommandCode::Reboot, &[0x10]));

/// Tells the glasses the update was abandoned.
#[derive(Debug, Clone, Copy, Default)]
pub struct OtaFailed;
void_command!(OtaFailed, "OtaFailed", |_| request(CommandCode::OtaFailed, &[]));

/// Per-packet acknowledgment of an OTA data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaPacketAck {
    pub status: u8,
    pub bin_type: u8,
    pub index: u32,
}

/// One pre-framed OTA data packet.
#[derive(Debug, Clone)]
pub struct SendOtaData {
    packet: Bytes,
    index: u32,
}

impl SendOtaData {
    pub fn new(packet: Bytes, index: u32) -> Self {
        Self { packet, index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Command for SendOtaData {
    type Output = OtaPacketAck;

    fn name(&self) -> &'static str {
        "SendOtaData"
    }

    fn payload(&self, _ctx: &CommandContext) -> Result<Bytes> {
        Ok(self.packet.clone())
    }

    fn parse(&self, data: &[u8]) -> Result<OtaPacketAck> {
        require_len(self.name(), data, 11)?;
        let ack = OtaPacketAck {
            status: data[5],
            bin_type: data[6],
            index: u32::from_le_bytes(data[7..11].try_into()?),
        };
        if ack.status != 0 {
            return Err(XrError::DeviceStatus {
                command: self.name(),
                status: ack.status,
            });
        }
        Ok(ack)
    }
}
