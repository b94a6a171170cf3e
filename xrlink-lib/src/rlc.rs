//! Run-length compression for bandwidth-limited image payloads.
//!
//! A compressed buffer is a sequence of sections. Each section starts with a
//! one-byte [`SectionHeader`]: a 7-bit length and a literal flag in the top bit.
//! A run section (flag clear) is followed by the single repeated byte, a
//! literal section (flag set) by `len` raw bytes.

use crate::constants::RLC_SECTION_MAX;
use modular_bitfield::prelude::*;
use tracing::trace;

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectionHeader {
    pub len: B7,
    pub literal: bool,
}

impl SectionHeader {
    pub fn run(len: u8) -> Self {
        Self::new().with_len(len).with_literal(false)
    }

    pub fn literal_of(len: u8) -> Self {
        Self::new().with_len(len).with_literal(true)
    }

    pub fn to_byte(self) -> u8 {
        self.into_bytes()[0]
    }

    pub fn from_byte(byte: u8) -> Self {
        Self::from_bytes([byte])
    }
}

/// Encoder state: sections written so far and the pending literal span.
struct Encoder<'a> {
    src: &'a [u8],
    out: Vec<u8>,
    literal_start: usize,
    encoded: usize,
}

impl<'a> Encoder<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            out: Vec::with_capacity(src.len() + src.len() / RLC_SECTION_MAX + 1),
            literal_start: 0,
            encoded: 0,
        }
    }

    fn flush_literal(&mut self, end: usize) {
        let mut start = self.literal_start;
        while start < end {
            let len = (end - start).min(RLC_SECTION_MAX);
            self.out.push(SectionHeader::literal_of(len as u8).to_byte());
            self.out.extend_from_slice(&self.src[start..start + len]);
            self.encoded += len;
            start += len;
        }
        self.literal_start = end;
    }

    fn push_run(&mut self, value: u8, len: usize) {
        self.out.push(SectionHeader::run(len as u8).to_byte());
        self.out.push(value);
        self.encoded += len;
    }
}

/// Compresses `src`. Returns an empty buffer when the input is a single byte
/// or less, or when the encoded sections would not cover the input exactly;
/// callers send the raw form in that case.
pub fn compress(src: &[u8]) -> Vec<u8> {
    if src.len() <= 1 {
        return Vec::new();
    }

    let mut enc = Encoder::new(src);
    let mut pos = 0;
    while pos < src.len() {
        let value = src[pos];
        let run = src[pos..].iter().take_while(|&&b| b == value).count();
        if run < 2 {
            pos += 1;
            continue;
        }

        enc.flush_literal(pos);
        let mut remaining = run;
        while remaining >= 2 {
            let len = remaining.min(RLC_SECTION_MAX);
            // Never leave a lone byte behind when splitting a long run.
            let len = if remaining - len == 1 { len - 1 } else { len };
            enc.push_run(value, len);
            remaining -= len;
        }
        pos += run;
        enc.literal_start = pos;
    }
    enc.flush_literal(src.len());

    if enc.encoded != src.len() {
        trace!(encoded = enc.encoded, input = src.len(), "rlc coverage mismatch");
        return Vec::new();
    }
    trace!(input = src.len(), output = enc.out.len(), "rlc compressed");
    enc.out
}

/// Inverse of [`compress`]. Returns `None` on a truncated section, on output
/// overflowing `expected_len`, or when the result is not exactly `expected_len` bytes.
pub fn decompress(src: &[u8], expected_len: usize) -> Option<Vec<u8>> {
    if src.len() <= 1 || expected_len == 0 {
        return None;
    }

    let mut out = Vec::with_capacity(expected_len);
    let mut offset = 0;
    while offset < src.len() {
        let header = SectionHeader::from_byte(src[offset]);
        offset += 1;
        let len = header.len() as usize;
        if out.len() + len > expected_len {
            return None;
        }

        if header.literal() {
            let data = src.get(offset..offset + len)?;
            out.extend_from_slice(data);
            offset += len;
        } else {
            let value = *src.get(offset)?;
            out.resize(out.len() + len, value);
            offset += 1;
        }
    }

    (out.len() == expected_len).then_some(out)
}
