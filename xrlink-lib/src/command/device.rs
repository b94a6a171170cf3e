//! Vendor device commands and the pairing replies sent by the session.

use super::{Command, CommandContext, require_len, void_command};
use crate::constants::{ACK_MAGIC, CMD_MAGIC};
use crate::error::{Result, XrError};
use crate::frame::command_frame;
use crate::session::DeviceSession;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Vendor command codes (second field of the cmd head).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum CommandCode {
    ShowLongPress = 0x00,
    Unbind = 0x01,
    ToggleNotification = 0x05,
    ReadBattery = 0x10,
    GetMacAddress = 0x19,
    Reboot = 0x1B,
    SetBrightness = 0x21,
    GetBrightness = 0x22,
    GetVersionList = 0x29,
    GetDeviceType = 0x2A,
    SetVersion = 0x2B,
    GetScreenTimeout = 0x3B,
    SetScreenTimeout = 0x3C,
    GetSerialNumber = 0x4A,
    RequestPhoneModel = 0x67,
    ConnectSucceeded = 0x68,
    DisconnectDevice = 0x73,
    OtaStart = 0x7B,
    OtaFailed = 0x7C,
    SetOtaMode = 0x7D,
    GetPowerSaving = 0x9B,
}

pub(crate) fn request(code: CommandCode, value: &[u8]) -> Result<Bytes> {
    command_frame(CMD_MAGIC, code.into(), value)
}

/// Pairing reply: ask the glasses to show the long-press prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShowLongPress;
void_command!(ShowLongPress, "ShowLongPress", |_| request(CommandCode::ShowLongPress, &[]));

/// Pairing reply: ask the glasses to request the phone model.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestPhoneModel;
void_command!(RequestPhoneModel, "RequestPhoneModel", |_| request(
    CommandCode::RequestPhoneModel,
    &[0x01]
));

/// Acknowledges the user's pairing confirmation. Sent with the response magic.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectSucceeded;
void_command!(ConnectSucceeded, "ConnectSucceeded", |_| command_frame(
    ACK_MAGIC,
    CommandCode::ConnectSucceeded.into(),
    &[]
));

/// Requests a battery notification; the level arrives on the response channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadBattery;
void_command!(ReadBattery, "ReadBattery", |_| request(CommandCode::ReadBattery, &[]));

#[derive(Debug, Clone, Copy, Default)]
pub struct Unbind;
void_command!(Unbind, "Unbind", |_| request(CommandCode::Unbind, &[]));

#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectDevice;
void_command!(DisconnectDevice, "DisconnectDevice", |_| request(CommandCode::DisconnectDevice, &[]));

#[derive(Debug, Clone, Copy)]
pub struct SetBrightness(pub u8);
void_command!(SetBrightness, "SetBrightness", |this| request(CommandCode::SetBrightness, &[this.0]));

/// Screen timeout in seconds.
#[derive(Debug, Clone, Copy)]
pub struct SetScreenTimeout(pub u32);
void_command!(SetScreenTimeout, "SetScreenTimeout", |this| request(
    CommandCode::SetScreenTimeout,
    &this.0.to_le_bytes()
));

#[derive(Debug, Clone, Copy)]
pub struct ToggleNotification(pub bool);
void_command!(ToggleNotification, "ToggleNotification", |this| request(
    CommandCode::ToggleNotification,
    &[this.0 as u8]
));

#[derive(Debug, Clone, Copy, Default)]
pub struct GetBrightness;

impl Command for GetBrightness {
    type Output = u8;

    fn name(&self) -> &'static str {
        "GetBrightness"
    }

    fn payload(&self, _ctx: &CommandContext) -> Result<Bytes> {
        request(CommandCode::GetBrightness, &[])
    }

    fn parse(&self, data: &[u8]) -> Result<u8> {
        require_len(self.name(), data, 10)?;
        if data[8] != 0 {
            return Err(XrError::DeviceStatus {
                command: self.name(),
                status: data[8],
            });
        }
        Ok(data[9])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetScreenTimeout;

impl Command for GetScreenTimeout {
    type Output = u32;

    fn name(&self) -> &'static str {
        "GetScreenTimeout"
    }

    fn payload(&self, _ctx: &CommandContext) -> Result<Bytes> {
        request(CommandCode::GetScreenTimeout, &[])
    }

    fn parse(&self, data: &[u8]) -> Result<u32> {
        require_len(self.name(), data, 13)?;
        if data[8] != 0 {
            return Err(XrError::DeviceStatus {
                command: self.name(),
                status: data[8],
            });
        }
        Ok(u32::from_le_bytes(data[9..13].try_into()?))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetPowerSaving;

impl Command for GetPowerSaving {
    type Output = bool;

    fn name(&self) -> &'static str {
        "GetPowerSaving"
    }

    fn payload(&self, _ctx: &CommandContext) -> Result<Bytes> {
        request(CommandCode::GetPowerSaving, &[])
    }

    fn parse(&self, data: &[u8]) -> Result<bool> {
        data.last()
            .map(|&b| b == 0x01)
            .ok_or_else(|| XrError::InvalidResponse("GetPowerSaving: empty response".to_string()))
    }
}

/// Bluetooth address formatted as `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetMacAddress;

impl Command for GetMacAddress {
    type Output = String;

    fn name(&self) -> &'static str {
        "GetMacAddress"
    }

    fn payload(&self, _ctx: &CommandContext) -> Result<Bytes> {
        request(CommandCode::GetMacAddress, &[])
    }

    fn parse(&self, data: &[u8]) -> Result<String> {
        require_len(self.name(), data, 11)?;
        let octets: Vec<String> = data[5..11].iter().map(|b| format!("{b:02X}")).collect();
        Ok(octets.join(":"))
    }
}

/// Four-digit model code.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetDeviceType;

impl GetDeviceType {
    /// Takes the four hex digits after a `0215` marker, else the first four, else `0000`.
    pub fn model_code(hex_payload: &str) -> String {
        hex_payload
            .find("0215")
            .and_then(|pos| hex_payload.get(pos + 4..pos + 8))
            .or_else(|| hex_payload.get(..4))
            .unwrap_or("0000")
            .to_string()
    }
}

impl Command for GetDeviceType {
    type Output = String;

    fn name(&self) -> &'static str {
        "GetDeviceType"
    }

    fn payload(&self, _ctx: &CommandContext) -> Result<Bytes> {
        request(CommandCode::GetDeviceType, &[])
    }

    fn parse(&self, data: &[u8]) -> Result<String> {
        require_len(self.name(), data, 6)?;
        let payload = hex::encode_upper(&data[5..data.len() - 1]);
        Ok(Self::model_code(&payload))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetSerialNumber;

impl Command for GetSerialNumber {
    type Output = String;

    fn name(&self) -> &'static str {
        "GetSerialNumber"
    }

    fn payload(&self, _ctx: &CommandContext) -> Result<Bytes> {
        request(CommandCode::GetSerialNumber, &[])
    }

    fn parse(&self, data: &[u8]) -> Result<String> {
        require_len(self.name(), data, 6)?;
        let payload = &data[5..];
        let start = payload
            .iter()
            .position(|b| (0x20..=0x7E).contains(b))
            .unwrap_or(0);
        let text = String::from_utf8_lossy(&payload[start..]);
        Ok(text
            .trim()
            .trim_matches('\0')
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace() || ".-_".contains(*c))
            .collect())
    }
}

/// Firmware versions reported by the glasses, keyed by section data type.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetVersionList;

impl Command for GetVersionList {
    type Output = BTreeMap<u32, String>;

    fn name(&self) -> &'static str {
        "GetVersionList"
    }

    fn payload(&self, _ctx: &CommandContext) -> Result<Bytes> {
        request(CommandCode::GetVersionList, &[])
    }

    fn parse(&self, data: &[u8]) -> Result<Self::Output> {
        require_len(self.name(), data, 7)?;
        if data[5] != 0 {
            return Err(XrError::DeviceStatus {
                command: self.name(),
                status: data[5],
            });
        }
        let entries = data.get(9..).unwrap_or(&[]);
        Ok(entries
            .chunks_exact(4)
            .map(|e| (e[3] as u32, format!("{}.{}.{}", e[0], e[1], e[2])))
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub version: String,
    pub device_type: String,
    pub mac_address: String,
    pub serial_number: String,
}

/// Queries version, model, address and serial number in sequence.
pub struct DeviceInfoReader;

impl DeviceInfoReader {
    pub async fn read(session: &DeviceSession) -> Result<DeviceInfo> {
        let versions = session.execute(GetVersionList).await?;
        // The main firmware is the entry with the lowest type key.
        let version = versions
            .iter()
            .next()
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| "Unknown".to_string());
        let device_type = session.execute(GetDeviceType).await?;
        let mac_address = session.execute(GetMacAddress).await?;
        let serial_number = session.execute(GetSerialNumber).await?;
        debug!(%version, %device_type, %mac_address, %serial_number, "device info");
        Ok(DeviceInfo {
            version,
            device_type,
            mac_address,
            serial_number,
        })
    }
}
