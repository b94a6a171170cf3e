//! Handshake token written to the accessory's handshake channel.
//!
//! # Layout (27 bytes)
//!
//! - Bytes 0-3: prefix. A first-time token uses the three low bytes of the
//!   rolling cloud timestamp followed by the `0xE0` marker; a retrieve token
//!   uses the 4-byte device sub-token captured from an earlier handshake.
//! - Bytes 4-7: user id, little-endian
//! - Bytes 8-25: fixed vendor constant
//! - Byte 26: CRC-8/Maxim over bytes 0-25

use crate::constants::{TOKEN_MARKER, TOKEN_SIZE};
use crate::crc::crc8_maxim;

/// Fixed vendor bytes embedded in every token
pub const VENDOR_CONSTANT: [u8; 18] = [
    0x10, 0x01, 0xEB, 0xE9, 0xBE, 0xF7, 0xFA, 0x4B, 0x47, 0x74, 0xA2, 0xF6, 0xB3, 0x2A, 0x79, 0xC5, 0xF2, 0x73,
];

/// User id used when none is configured
pub const DEFAULT_USER_ID: u32 = 23412;

/// 4-byte sub-token returned by the accessory on an accepted handshake.
pub type DeviceToken = [u8; 4];

/// Rolling cloud token: low 24 bits of the epoch seconds with the marker in the top byte.
pub fn cloud_token(epoch_secs: u64) -> u32 {
    ((epoch_secs as u32) & 0x00FF_FFFF) | ((TOKEN_MARKER as u32) << 24)
}

/// Cloud token for the current wall-clock time.
pub fn current_cloud_token() -> u32 {
    cloud_token(chrono::Utc::now().timestamp().max(0) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeToken {
    bytes: [u8; TOKEN_SIZE],
}

impl HandshakeToken {
    fn build(prefix: [u8; 4], user_id: u32) -> Self {
        let mut bytes = [0u8; TOKEN_SIZE];
        bytes[0..4].copy_from_slice(&prefix);
        bytes[4..8].copy_from_slice(&user_id.to_le_bytes());
        bytes[8..26].copy_from_slice(&VENDOR_CONSTANT);
        bytes[26] = crc8_maxim(&bytes[..26]);
        Self { bytes }
    }

    /// First-time pairing token derived from the rolling cloud timestamp.
    pub fn connection(user_id: u32, cloud_token: u32) -> Self {
        let time = cloud_token.to_le_bytes();
        Self::build([time[0], time[1], time[2], TOKEN_MARKER], user_id)
    }

    /// Reconnection token for an accessory paired earlier.
    pub fn retrieve(user_id: u32, device_token: DeviceToken) -> Self {
        Self::build(device_token, user_id)
    }

    pub fn user_id(&self) -> u32 {
        u32::from_le_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]])
    }

    /// Trailing checksum matches the preceding 26 bytes.
    pub fn is_consistent(&self) -> bool {
        crc8_maxim(&self.bytes[..26]) == self.bytes[26]
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Display for HandshakeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.bytes))
    }
}
