//! Commands executed one at a time against the accessory.
//!
//! A command knows how to build its wire payload and how to interpret the
//! acknowledgment frame (`4F 42 ...`) that completes it.

use crate::constants::{ACK_MAGIC, CMD_HEADER_SIZE};
use crate::error::{Result, XrError};
use bytes::Bytes;

/// Link facts a command may need while building its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandContext {
    pub mtu: usize,
}

pub trait Command: Send + 'static {
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn payload(&self, ctx: &CommandContext) -> Result<Bytes>;

    fn parse(&self, response: &[u8]) -> Result<Self::Output>;
}

/// Implements [`Command`] for types whose acknowledgment carries nothing of interest.
macro_rules! void_command {
    ($ty:ty, $name:literal, |$this:pat_param| $payload:expr) => {
        impl $crate::command::Command for $ty {
            type Output = ();

            fn name(&self) -> &'static str {
                $name
            }

            fn payload(&self, _ctx: &$crate::command::CommandContext) -> $crate::error::Result<bytes::Bytes> {
                let $this = self;
                $payload
            }

            fn parse(&self, _response: &[u8]) -> $crate::error::Result<()> {
                Ok(())
            }
        }
    };
}
pub(crate) use void_command;

pub mod device;
pub mod ota;

pub use device::*;
pub use ota::*;

/// A pre-built frame written as-is; any acknowledgment completes it.
#[derive(Debug, Clone)]
pub struct RawCommand {
    name: &'static str,
    frame: Bytes,
}

impl RawCommand {
    pub fn new(name: &'static str, frame: impl Into<Bytes>) -> Self {
        Self {
            name,
            frame: frame.into(),
        }
    }
}

impl Command for RawCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        self.name
    }

    fn payload(&self, _ctx: &CommandContext) -> Result<Bytes> {
        Ok(self.frame.clone())
    }

    fn parse(&self, _response: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Read-only view of an inbound acknowledgment: `4F 42 | code u16 | len u16 | field u16 | payload`.
#[derive(Debug, Clone, Copy)]
pub struct AckFrame<'a> {
    raw: &'a [u8],
}

impl<'a> AckFrame<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        if raw.len() < 4 {
            return Err(XrError::InsufficientData {
                expected: 4,
                actual: raw.len(),
            });
        }
        let magic = u16::from_le_bytes([raw[0], raw[1]]);
        if magic != ACK_MAGIC {
            return Err(XrError::InvalidMagic {
                context: "ack frame",
                expected: ACK_MAGIC as u32,
                actual: magic as u32,
            });
        }
        Ok(Self { raw })
    }

    pub fn is_ack(raw: &[u8]) -> bool {
        raw.len() >= 2 && u16::from_le_bytes([raw[0], raw[1]]) == ACK_MAGIC
    }

    pub fn code(&self) -> u16 {
        u16::from_le_bytes([self.raw[2], self.raw[3]])
    }

    pub fn value_len(&self) -> Option<u16> {
        self.raw.get(4..6).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn payload(&self) -> &'a [u8] {
        self.raw.get(CMD_HEADER_SIZE..).unwrap_or(&[])
    }

    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }
}

/// Fails with `InvalidResponse` unless `data` holds at least `len` bytes.
pub(crate) fn require_len(command: &'static str, data: &[u8], len: usize) -> Result<()> {
    if data.len() < len {
        return Err(XrError::InvalidResponse(format!(
            "{command}: response too short ({} < {len} bytes)",
            data.len()
        )));
    }
    Ok(())
}
