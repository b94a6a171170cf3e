//! Wire frames of the binary-packet transport.
//!
//! Every frame is `[cmd head (8)] [packet head (10)] [sub-payload]`. The
//! generic framer additionally prefixes the whole logical payload with a
//! 25-byte common-data head before slicing.

use crate::constants::{
    CMD_BINARY_PACKET, CMD_HEADER_SIZE, CMD_MAGIC, COMMON_DATA_HEADER_SIZE, FRAME_OVERHEAD, MAX_VALUE_LEN,
    PACKET_HEADER_SIZE,
};
use crate::crc::crc32;
use crate::error::{Result, XrError};
use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::Display;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Position of a chunk within a sliced payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SliceTag {
    Begin = 0,
    Middle = 1,
    End = 2,
}

impl SliceTag {
    /// First chunk (including a lone chunk) is `Begin`, last is `End`.
    pub fn for_position(index: usize, count: usize) -> Self {
        if index == 0 {
            SliceTag::Begin
        } else if index + 1 == count {
            SliceTag::End
        } else {
            SliceTag::Middle
        }
    }
}

/// Trailing 16 bits of the cmd head: a continuation flag and the value length.
#[bitfield(bytes = 2)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LengthField {
    /// Set on continuation packets of a multi-packet command; binary packets never set it.
    pub left: bool,
    pub value_len: B15,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CmdHeaderRaw {
    pub magic: U16,
    pub cmd: U16,
    pub value_len: U16,
    pub length_field: [u8; 2],
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PacketHeaderRaw {
    pub bin_type: u8,
    pub slice: u8,
    pub crc: U32,
    pub index: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CommonDataHeaderRaw {
    pub bin_type: u8,
    pub len: U32,
    pub crc: U32,
    pub reserved: [U32; 4],
}

/// 8-byte vendor command head shared by every outbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    pub magic: u16,
    pub cmd: u16,
    pub value_len: u16,
}

impl CmdHeader {
    pub fn request(cmd: u16, value_len: u16) -> Self {
        Self {
            magic: CMD_MAGIC,
            cmd,
            value_len,
        }
    }

    /// The duplicated length field: `value_len << 1` with the continuation bit clear.
    pub fn length_field(&self) -> LengthField {
        LengthField::new().with_left(false).with_value_len(self.value_len & 0x7FFF)
    }

    pub fn to_raw(&self) -> CmdHeaderRaw {
        CmdHeaderRaw {
            magic: U16::new(self.magic),
            cmd: U16::new(self.cmd),
            value_len: U16::new(self.value_len),
            length_field: self.length_field().into_bytes(),
        }
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        out.put_slice(self.to_raw().as_bytes());
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let (raw, _) = CmdHeaderRaw::ref_from_prefix(data).map_err(|_| XrError::InsufficientData {
            expected: CMD_HEADER_SIZE,
            actual: data.len(),
        })?;
        Ok(Self {
            magic: raw.magic.get(),
            cmd: raw.cmd.get(),
            value_len: raw.value_len.get(),
        })
    }
}

/// Builds a complete command frame: head followed by `value`.
pub fn command_frame(magic: u16, cmd: u16, value: &[u8]) -> Result<Bytes> {
    let value_len = u16::try_from(value.len())
        .ok()
        .filter(|len| usize::from(*len) <= MAX_VALUE_LEN)
        .ok_or(XrError::LengthMismatch {
            context: "command value",
            expected: MAX_VALUE_LEN,
            actual: value.len(),
        })?;
    let header = CmdHeader {
        magic,
        cmd,
        value_len,
    };
    let mut out = BytesMut::with_capacity(CMD_HEADER_SIZE + value.len());
    header.encode_into(&mut out);
    out.put_slice(value);
    Ok(out.freeze())
}

/// One binary-packet frame: packet head fields plus the sub-payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bin_type: u8,
    pub slice: SliceTag,
    pub index: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(bin_type: u8, slice: SliceTag, index: u32, payload: Bytes) -> Self {
        Self {
            bin_type,
            slice,
            index,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let value_len = (PACKET_HEADER_SIZE + self.payload.len()) as u16;
        let mut out = BytesMut::with_capacity(self.encoded_len());
        CmdHeader::request(CMD_BINARY_PACKET, value_len).encode_into(&mut out);
        let packet = PacketHeaderRaw {
            bin_type: self.bin_type,
            slice: self.slice.into(),
            crc: U32::new(crc32(&self.payload, 0)),
            index: U32::new(self.index),
        };
        out.put_slice(packet.as_bytes());
        out.put_slice(&self.payload);
        out.freeze()
    }

    /// Parses and verifies one frame: magic, command class, both length
    /// fields and the sub-payload CRC.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_OVERHEAD {
            return Err(XrError::InsufficientData {
                expected: FRAME_OVERHEAD,
                actual: data.len(),
            });
        }
        let (cmd, rest) =
            CmdHeaderRaw::ref_from_prefix(data).map_err(|_| XrError::InvalidPacket("cmd head".to_string()))?;
        if cmd.magic.get() != CMD_MAGIC {
            return Err(XrError::InvalidMagic {
                context: "cmd head",
                expected: CMD_MAGIC as u32,
                actual: cmd.magic.get() as u32,
            });
        }
        if cmd.cmd.get() != CMD_BINARY_PACKET {
            return Err(XrError::InvalidPacket(format!(
                "unexpected command class {:#06x}",
                cmd.cmd.get()
            )));
        }
        let value_len = cmd.value_len.get() as usize;
        if value_len != rest.len() {
            return Err(XrError::LengthMismatch {
                context: "cmd head value length",
                expected: value_len,
                actual: rest.len(),
            });
        }
        let field = LengthField::from_bytes(cmd.length_field);
        if field.value_len() as usize != value_len {
            return Err(XrError::LengthMismatch {
                context: "cmd head length field",
                expected: value_len,
                actual: field.value_len() as usize,
            });
        }

        let (packet, payload) =
            PacketHeaderRaw::ref_from_prefix(rest).map_err(|_| XrError::InvalidPacket("packet head".to_string()))?;
        let slice = SliceTag::try_from(packet.slice)
            .map_err(|_| XrError::InvalidPacket(format!("unknown slice tag {}", packet.slice)))?;
        let actual = crc32(payload, 0);
        if actual != packet.crc.get() {
            return Err(XrError::CrcMismatch {
                context: format!("frame {}", packet.index.get()),
                expected: packet.crc.get(),
                actual,
            });
        }

        Ok(Self {
            bin_type: packet.bin_type,
            slice,
            index: packet.index.get(),
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// 25-byte head the generic framer puts in front of the caller payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonDataHeader {
    pub bin_type: u8,
    pub len: u32,
    pub crc: u32,
    pub reserved: [u32; 4],
}

impl CommonDataHeader {
    pub fn for_payload(bin_type: u8, payload: &[u8], reserved: [u32; 4]) -> Self {
        Self {
            bin_type,
            len: payload.len() as u32,
            crc: crc32(payload, 0),
            reserved,
        }
    }

    pub fn to_raw(&self) -> CommonDataHeaderRaw {
        CommonDataHeaderRaw {
            bin_type: self.bin_type,
            len: U32::new(self.len),
            crc: U32::new(self.crc),
            reserved: self.reserved.map(U32::new),
        }
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        out.put_slice(self.to_raw().as_bytes());
    }

    /// Splits a reassembled common-data buffer and verifies the declared length and CRC.
    pub fn split(data: &[u8]) -> Result<(Self, Bytes)> {
        let (raw, payload) = CommonDataHeaderRaw::ref_from_prefix(data).map_err(|_| XrError::InsufficientData {
            expected: COMMON_DATA_HEADER_SIZE,
            actual: data.len(),
        })?;
        let header = Self {
            bin_type: raw.bin_type,
            len: raw.len.get(),
            crc: raw.crc.get(),
            reserved: raw.reserved.map(|r| r.get()),
        };
        if header.len as usize != payload.len() {
            return Err(XrError::LengthMismatch {
                context: "common data",
                expected: header.len as usize,
                actual: payload.len(),
            });
        }
        let actual = crc32(payload, 0);
        if actual != header.crc {
            return Err(XrError::CrcMismatch {
                context: "common data".to_string(),
                expected: header.crc,
                actual,
            });
        }
        Ok((header, Bytes::copy_from_slice(payload)))
    }
}

/// Concatenates sub-payloads after checking indices run `0..n` without gaps
/// and slice tags match each position.
pub fn reassemble(frames: &[Frame]) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(frames.iter().map(|f| f.payload.len()).sum());
    for (position, frame) in frames.iter().enumerate() {
        if frame.index as usize != position {
            return Err(XrError::InvalidPacket(format!(
                "frame index {} at position {}",
                frame.index, position
            )));
        }
        let expected = SliceTag::for_position(position, frames.len());
        if frame.slice != expected {
            return Err(XrError::InvalidPacket(format!(
                "frame {} tagged {} instead of {}",
                frame.index, frame.slice, expected
            )));
        }
        out.put_slice(&frame.payload);
    }
    Ok(out.freeze())
}
