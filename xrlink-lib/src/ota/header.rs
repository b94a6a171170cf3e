//! Fixed heads of the firmware container. All fields are u32 little-endian.

use crate::constants::{BAG_HEADER_SIZE, BAG_MAGIC, OTA_SECTION_HEADER_SIZE, OTA_SECTION_MAGIC};
use crate::error::{Result, XrError};
use bytes::{BufMut, BytesMut};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BagHeaderRaw {
    pub magic: U32,
    pub version: U32,
    pub device_type: U32,
    pub timestamp: U32,
    pub length: U32,
    pub reserved: [U32; 3],
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SectionHeaderRaw {
    pub magic: U32,
    pub start_addr: U32,
    pub length: U32,
    pub crc: U32,
    pub sec_info_len: U32,
    pub max_size: U32,
    pub force_update: U32,
    pub reserved: U32,
    pub version: U32,
    pub data_type: U32,
    pub storage_type: U32,
    pub image_id: U32,
}

/// Container head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BagHeader {
    pub version: u32,
    pub device_type: u32,
    pub timestamp: u32,
    /// Sum of (section head + section data) over all sections
    pub length: u32,
    pub reserved: [u32; 3],
}

impl BagHeader {
    pub fn new(version: u32, device_type: u32, timestamp: u32) -> Self {
        Self {
            version,
            device_type,
            timestamp,
            length: 0,
            reserved: [0; 3],
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let (raw, _) = BagHeaderRaw::ref_from_prefix(data).map_err(|_| XrError::InsufficientData {
            expected: BAG_HEADER_SIZE,
            actual: data.len(),
        })?;
        if raw.magic.get() != BAG_MAGIC {
            return Err(XrError::InvalidMagic {
                context: "firmware container",
                expected: BAG_MAGIC,
                actual: raw.magic.get(),
            });
        }
        Ok(Self {
            version: raw.version.get(),
            device_type: raw.device_type.get(),
            timestamp: raw.timestamp.get(),
            length: raw.length.get(),
            reserved: raw.reserved.map(|r| r.get()),
        })
    }

    pub fn to_raw(&self) -> BagHeaderRaw {
        BagHeaderRaw {
            magic: U32::new(BAG_MAGIC),
            version: U32::new(self.version),
            device_type: U32::new(self.device_type),
            timestamp: U32::new(self.timestamp),
            length: U32::new(self.length),
            reserved: self.reserved.map(U32::new),
        }
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        out.put_slice(self.to_raw().as_bytes());
    }
}

/// Head of one firmware section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionHeader {
    pub start_addr: u32,
    pub length: u32,
    /// CRC-32 of the section data
    pub crc: u32,
    pub sec_info_len: u32,
    pub max_size: u32,
    pub force_update: u32,
    pub reserved: u32,
    pub version: u32,
    /// Which firmware image this is; the low byte doubles as the binary type on the wire
    pub data_type: u32,
    pub storage_type: u32,
    pub image_id: u32,
}

impl SectionHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (raw, _) = SectionHeaderRaw::ref_from_prefix(data).map_err(|_| XrError::InsufficientData {
            expected: OTA_SECTION_HEADER_SIZE,
            actual: data.len(),
        })?;
        if raw.magic.get() != OTA_SECTION_MAGIC {
            return Err(XrError::InvalidMagic {
                context: "firmware section",
                expected: OTA_SECTION_MAGIC,
                actual: raw.magic.get(),
            });
        }
        Ok(Self {
            start_addr: raw.start_addr.get(),
            length: raw.length.get(),
            crc: raw.crc.get(),
            sec_info_len: raw.sec_info_len.get(),
            max_size: raw.max_size.get(),
            force_update: raw.force_update.get(),
            reserved: raw.reserved.get(),
            version: raw.version.get(),
            data_type: raw.data_type.get(),
            storage_type: raw.storage_type.get(),
            image_id: raw.image_id.get(),
        })
    }

    pub fn to_raw(&self) -> SectionHeaderRaw {
        SectionHeaderRaw {
            magic: U32::new(OTA_SECTION_MAGIC),
            start_addr: U32::new(self.start_addr),
            length: U32::new(self.length),
            crc: U32::new(self.crc),
            sec_info_len: U32::new(self.sec_info_len),
            max_size: U32::new(self.max_size),
            force_update: U32::new(self.force_update),
            reserved: U32::new(self.reserved),
            version: U32::new(self.version),
            data_type: U32::new(self.data_type),
            storage_type: U32::new(self.storage_type),
            image_id: U32::new(self.image_id),
        }
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        out.put_slice(self.to_raw().as_bytes());
    }

    pub fn is_forced(&self) -> bool {
        self.force_update > 0
    }

    pub fn bin_type(&self) -> u8 {
        (self.data_type & 0xFF) as u8
    }
}
