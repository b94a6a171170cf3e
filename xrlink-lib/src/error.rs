use std::array::TryFromSliceError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for link operations.
pub type Result<T, E = XrError> = std::result::Result<T, E>;

/// The primary error type for the `xrlink-lib` library.
#[derive(Error, Debug)]
pub enum XrError {
    #[error("Link closed")]
    LinkClosed,

    #[error("Not connected: no write channel available")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake rejected after {attempts} attempt(s)")]
    HandshakeRejected { attempts: u32 },

    #[error("Malformed handshake response: {len} bytes, first byte {first:#04x}")]
    HandshakeMalformed { len: usize, first: u8 },

    #[error("Command {command} timed out after {timeout:?}")]
    CommandTimeout { command: &'static str, timeout: Duration },

    #[error("Command {command} failed with device status {status:#04x}")]
    DeviceStatus { command: &'static str, status: u8 },

    #[error("Command dropped before completion")]
    Cancelled,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("CRC mismatch in {context}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        context: String,
        expected: u32,
        actual: u32,
    },

    #[error("Invalid magic in {context}: expected {expected:#010x}, got {actual:#010x}")]
    InvalidMagic {
        context: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Length mismatch in {context}: expected {expected}, got {actual}")]
    LengthMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Transmission unit too small: {0} (must exceed the 18-byte frame overhead)")]
    InvalidMtu(usize),

    #[error("OTA error: {0}")]
    Ota(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

impl XrError {
    /// Data failed an integrity check and must not be used.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            XrError::CrcMismatch { .. }
                | XrError::InvalidMagic { .. }
                | XrError::LengthMismatch { .. }
                | XrError::InsufficientData { .. }
                | XrError::InvalidPacket(_)
        )
    }

    /// The link itself is gone or unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, XrError::LinkClosed | XrError::NotConnected | XrError::Transport(_))
    }
}

impl From<TryFromSliceError> for XrError {
    fn from(_: TryFromSliceError) -> Self {
        XrError::InvalidPacket("Failed to convert slice to array".to_string())
    }
}
