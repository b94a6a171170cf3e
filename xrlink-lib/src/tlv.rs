//! Type-length-value records: 1-byte type, 2-byte little-endian length, value.

use crate::error::{Result, XrError};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the type and length fields preceding every value
pub const TLV_HEADER_SIZE: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: u8,
    pub value: Bytes,
}

impl Tlv {
    pub fn new(tag: u8, value: impl Into<Bytes>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }

    pub fn from_u8(tag: u8, value: u8) -> Self {
        Self::new(tag, vec![value])
    }

    pub fn from_u16(tag: u8, value: u16) -> Self {
        Self::new(tag, value.to_le_bytes().to_vec())
    }

    pub fn from_u32(tag: u8, value: u32) -> Self {
        Self::new(tag, value.to_le_bytes().to_vec())
    }

    pub fn from_text(tag: u8, value: &str) -> Self {
        Self::new(tag, Bytes::copy_from_slice(value.as_bytes()))
    }

    pub fn encoded_len(&self) -> usize {
        TLV_HEADER_SIZE + self.value.len()
    }

    /// Fails if the value does not fit the 16-bit length field.
    pub fn encode_into(&self, out: &mut BytesMut) -> Result<()> {
        let len = u16::try_from(self.value.len()).map_err(|_| XrError::LengthMismatch {
            context: "tlv value",
            expected: u16::MAX as usize,
            actual: self.value.len(),
        })?;
        out.reserve(self.encoded_len());
        out.put_u8(self.tag);
        out.put_u16_le(len);
        out.put_slice(&self.value);
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out.freeze())
    }

    /// Decodes one record from the front of `data`, returning it and the bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < TLV_HEADER_SIZE {
            return Err(XrError::InsufficientData {
                expected: TLV_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let len = u16::from_le_bytes([data[1], data[2]]) as usize;
        let end = TLV_HEADER_SIZE + len;
        if data.len() < end {
            return Err(XrError::InsufficientData {
                expected: end,
                actual: data.len(),
            });
        }
        let tlv = Tlv::new(data[0], Bytes::copy_from_slice(&data[TLV_HEADER_SIZE..end]));
        Ok((tlv, end))
    }
}

/// Concatenates encoded records in order.
pub fn concat(records: &[Tlv]) -> Result<Bytes> {
    let total = records.iter().map(Tlv::encoded_len).sum();
    let mut out = BytesMut::with_capacity(total);
    for record in records {
        record.encode_into(&mut out)?;
    }
    Ok(out.freeze())
}

/// Splits a buffer of back-to-back records.
pub fn parse_all(mut data: &[u8]) -> Result<Vec<Tlv>> {
    let mut records = Vec::new();
    while !data.is_empty() {
        let (record, used) = Tlv::decode(data)?;
        records.push(record);
        data = &data[used..];
    }
    Ok(records)
}
