//! Firmware container ("BAG") parsing, serialization and section selection.
//!
//! ```text
//! [bag head (32)] [section head (48)] [data] [section head (48)] [data] ...
//! ```

use super::header::{BagHeader, SectionHeader};
use crate::constants::{BAG_HEADER_SIZE, OTA_SECTION_HEADER_SIZE};
use crate::crc::crc32;
use crate::error::{Result, XrError};
use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSection {
    pub header: SectionHeader,
    pub data: Bytes,
}

impl FirmwareSection {
    /// Fills in the length and CRC of `header` from `data`.
    pub fn new(mut header: SectionHeader, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        header.length = u32::try_from(data.len()).map_err(|_| XrError::LengthMismatch {
            context: "section data",
            expected: u32::MAX as usize,
            actual: data.len(),
        })?;
        header.crc = crc32(&data, 0);
        Ok(Self { header, data })
    }

    /// Section head followed by the data: the unit that is framed and sent.
    pub fn full_data(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.transfer_len());
        self.header.encode_into(&mut out);
        out.put_slice(&self.data);
        out.freeze()
    }

    pub fn transfer_len(&self) -> usize {
        OTA_SECTION_HEADER_SIZE + self.data.len()
    }

    pub fn bin_type(&self) -> u8 {
        self.header.bin_type()
    }

    /// Whether the glasses should receive this section given the version they
    /// report for its data type.
    pub fn needs_update(&self, device_version: Option<&str>, force: bool) -> bool {
        let current = device_version.unwrap_or("0");
        let target = self.header.version.to_string();
        force || self.header.is_forced() || compare_version(current, &target) == Ordering::Less
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareFile {
    pub header: BagHeader,
    pub sections: Vec<FirmwareSection>,
}

impl FirmwareFile {
    /// Assembles a container, computing its declared length.
    pub fn new(mut header: BagHeader, sections: Vec<FirmwareSection>) -> Result<Self> {
        let total = total_transfer_len(&sections);
        header.length = u32::try_from(total).map_err(|_| XrError::LengthMismatch {
            context: "container length",
            expected: u32::MAX as usize,
            actual: total,
        })?;
        Ok(Self { header, sections })
    }

    pub fn parse(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        let header = BagHeader::parse(&bytes)?;

        let mut sections = Vec::new();
        let mut offset = BAG_HEADER_SIZE;
        let mut total = 0usize;
        while offset + OTA_SECTION_HEADER_SIZE <= bytes.len() {
            let section = SectionHeader::parse(&bytes[offset..])?;
            let start = offset + OTA_SECTION_HEADER_SIZE;
            let end = start
                .checked_add(section.length as usize)
                .filter(|end| *end <= bytes.len())
                .ok_or(XrError::LengthMismatch {
                    context: "section data",
                    expected: section.length as usize,
                    actual: bytes.len() - start,
                })?;

            let data = bytes.slice(start..end);
            let actual = crc32(&data, 0);
            if actual != section.crc {
                return Err(XrError::CrcMismatch {
                    context: format!("section {}", sections.len()),
                    expected: section.crc,
                    actual,
                });
            }
            debug!(
                index = sections.len(),
                data_type = section.data_type,
                version = section.version,
                len = section.length,
                "firmware section"
            );
            total += OTA_SECTION_HEADER_SIZE + data.len();
            sections.push(FirmwareSection { header: section, data });
            offset = end;
        }

        if total != header.length as usize {
            return Err(XrError::LengthMismatch {
                context: "container length",
                expected: header.length as usize,
                actual: total,
            });
        }
        Ok(Self { header, sections })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(std::fs::read(path)?)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(BAG_HEADER_SIZE + total_transfer_len(&self.sections));
        self.header.encode_into(&mut out);
        for section in &self.sections {
            section.header.encode_into(&mut out);
            out.put_slice(&section.data);
        }
        out.freeze()
    }

    /// Sections to send, in container order. `device_versions` maps data
    /// type to the dotted version the glasses report.
    pub fn select_sections(&self, device_versions: &BTreeMap<u32, String>, force: bool) -> Vec<&FirmwareSection> {
        self.sections
            .iter()
            .filter(|s| s.needs_update(device_versions.get(&s.header.data_type).map(String::as_str), force))
            .collect()
    }
}

/// Bytes announced by the start-of-update command: heads included.
pub fn total_transfer_len<S: std::borrow::Borrow<FirmwareSection>>(sections: &[S]) -> usize {
    sections.iter().map(|s| s.borrow().transfer_len()).sum()
}

/// Compares dotted versions numerically. Missing or non-numeric components count as 0.
pub fn compare_version(current: &str, target: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> { v.split('.').map(|p| p.trim().parse().unwrap_or(0)).collect() };
    let (current, target) = (parts(current), parts(target));
    let len = current.len().max(target.len());
    (0..len)
        .map(|i| {
            let c = current.get(i).copied().unwrap_or(0);
            let t = target.get(i).copied().unwrap_or(0);
            c.cmp(&t)
        })
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(data_type: u32, version: u32, data: &[u8]) -> FirmwareSection {
        let header = SectionHeader {
            data_type,
            version,
            ..Default::default()
        };
        FirmwareSection::new(header, data.to_vec()).unwrap()
    }

    fn container() -> FirmwareFile {
        FirmwareFile::new(
            BagHeader::new(0x0001_0002, 3, 0),
            vec![section(1, 5, &[1, 2, 3, 4, 5]), section(2, 2, &[9; 100])],
        )
        .unwrap()
    }

    #[test]
    fn test_parse_serialized_container() {
        let file = container();
        assert_eq!(file.header.length, 48 + 5 + 48 + 100);
        let bytes = file.to_bytes();
        assert_eq!(bytes.len(), 32 + 201);
        assert_eq!(FirmwareFile::parse(bytes).unwrap(), file);
    }

    #[test]
    fn test_corrupt_data_fails_crc() {
        let mut bytes = container().to_bytes().to_vec();
        bytes[32 + 48 + 2] ^= 0x01;
        let err = FirmwareFile::parse(bytes).unwrap_err();
        assert!(matches!(err, XrError::CrcMismatch { .. }));
        assert!(err.is_integrity());
    }

    #[test]
    fn test_declared_length_checked() {
        let mut file = container();
        file.header.length += 1;
        assert!(matches!(
            FirmwareFile::parse(file.to_bytes()),
            Err(XrError::LengthMismatch {
                context: "container length",
                ..
            })
        ));
    }

    #[test]
    fn test_truncated_and_bad_magic() {
        let bytes = container().to_bytes();
        assert!(matches!(
            FirmwareFile::parse(bytes.slice(..bytes.len() - 10)),
            Err(XrError::LengthMismatch {
                context: "section data",
                ..
            })
        ));
        let mut bad = bytes.to_vec();
        bad[32] = 0;
        assert!(matches!(FirmwareFile::parse(bad), Err(XrError::InvalidMagic { .. })));
        assert!(matches!(FirmwareFile::parse(vec![0u8; 10]), Err(XrError::InsufficientData { .. })));
    }

    #[test]
    fn test_compare_version() {
        assert_eq!(compare_version("1.2.3", "1.2.4"), Ordering::Less);
        assert_eq!(compare_version("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_version("2", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_version("x.1", "0.1"), Ordering::Equal);
        assert_eq!(compare_version("0", "5"), Ordering::Less);
    }

    #[test]
    fn test_select_sections() {
        let file = container();
        let mut versions = BTreeMap::new();
        versions.insert(1, "5".to_string());
        versions.insert(2, "1.9".to_string());
        let selected = file.select_sections(&versions, false);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].header.data_type, 2);

        assert_eq!(file.select_sections(&versions, true).len(), 2);
        // Unreported types compare against "0".
        assert_eq!(file.select_sections(&BTreeMap::new(), false).len(), 2);
        assert_eq!(total_transfer_len(&selected), 148);
    }

    #[test]
    fn test_full_data_prefixes_head() {
        let s = section(0x0107, 1, &[0xAA; 3]);
        let full = s.full_data();
        assert_eq!(full.len(), 51);
        assert_eq!(SectionHeader::parse(&full).unwrap(), s.header);
        assert_eq!(&full[48..], &[0xAA; 3]);
        assert_eq!(s.bin_type(), 0x07);
    }
}
