//! Slicing of large payloads into link-sized binary-packet frames.

use crate::constants::{ATT_WRITE_OVERHEAD, FRAME_OVERHEAD, MAX_FRAME_MTU, OTA_MIN_EFFECTIVE_MTU};
use crate::error::{Result, XrError};
use crate::frame::{CommonDataHeader, Frame, SliceTag};
use bytes::{Bytes, BytesMut};
use tracing::debug;

fn slice(bin_type: u8, data: &Bytes, chunk: usize) -> Vec<Frame> {
    let count = data.len().div_ceil(chunk);
    (0..count)
        .map(|i| {
            let start = i * chunk;
            let end = (start + chunk).min(data.len());
            Frame::new(
                bin_type,
                SliceTag::for_position(i, count),
                i as u32,
                data.slice(start..end),
            )
        })
        .collect()
}

/// Generic framer: prefixes the payload with a common-data head, then slices
/// the combined buffer into `mtu - 18` byte chunks. The MTU must leave every
/// frame within the 15-bit length field.
#[derive(Debug, Clone, Copy)]
pub struct BinaryPacketFramer {
    mtu: usize,
}

impl BinaryPacketFramer {
    pub fn new(mtu: usize) -> Result<Self> {
        if mtu <= FRAME_OVERHEAD || mtu > MAX_FRAME_MTU {
            return Err(XrError::InvalidMtu(mtu));
        }
        Ok(Self { mtu })
    }

    pub fn chunk_size(&self) -> usize {
        (self.mtu - FRAME_OVERHEAD).max(1)
    }

    pub fn frames(&self, bin_type: u8, inner: &[u8], reserved: Option<[u32; 4]>) -> Vec<Frame> {
        let header = CommonDataHeader::for_payload(bin_type, inner, reserved.unwrap_or_default());
        let mut common = BytesMut::with_capacity(crate::constants::COMMON_DATA_HEADER_SIZE + inner.len());
        header.encode_into(&mut common);
        common.extend_from_slice(inner);
        let frames = slice(bin_type, &common.freeze(), self.chunk_size());
        debug!(bin_type, inner_len = inner.len(), mtu = self.mtu, frames = frames.len(), "framed binary packet");
        frames
    }

    /// Encoded frames ready to write.
    pub fn build(&self, bin_type: u8, inner: &[u8], reserved: Option<[u32; 4]>) -> Vec<Bytes> {
        self.frames(bin_type, inner, reserved).iter().map(Frame::encode).collect()
    }
}

/// OTA framer: slices raw section bytes without a common-data head and
/// reserves the link-layer write overhead on top of the frame heads.
#[derive(Debug, Clone)]
pub struct OtaDataFramer {
    bin_type: u8,
    frames: Vec<Frame>,
}

impl OtaDataFramer {
    pub fn chunk_size(mtu: usize) -> usize {
        let effective = mtu
            .saturating_sub(ATT_WRITE_OVERHEAD)
            .clamp(OTA_MIN_EFFECTIVE_MTU, MAX_FRAME_MTU);
        effective.saturating_sub(FRAME_OVERHEAD).max(1)
    }

    pub fn new(bin_type: u8, data: Bytes, mtu: usize) -> Self {
        let frames = slice(bin_type, &data, Self::chunk_size(mtu));
        debug!(bin_type, len = data.len(), mtu, packets = frames.len(), "framed ota section");
        Self { bin_type, frames }
    }

    pub fn bin_type(&self) -> u8 {
        self.bin_type
    }

    pub fn packet_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn packet(&self, index: usize) -> Option<Bytes> {
        self.frames.get(index).map(Frame::encode)
    }

    pub fn packets(&self) -> impl Iterator<Item = Bytes> + '_ {
        self.frames.iter().map(Frame::encode)
    }
}
