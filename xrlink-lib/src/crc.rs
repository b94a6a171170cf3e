//! Checksums used across the link: reflected CRC-32 for frames, RLC and
//! firmware sections, and Dallas/Maxim CRC-8 for the handshake token.

/// Standard reflected CRC-32 (IEEE), continuing from `seed` (0 for a fresh checksum).
pub fn crc32(data: &[u8], seed: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

/// CRC-8 with polynomial 0x31 and initial value 0x00, processed MSB-first.
pub fn crc8_maxim(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, &byte| {
        (0..8).fold(crc ^ byte, |crc, _| {
            if crc & 0x80 != 0 { (crc << 1) ^ 0x31 } else { crc << 1 }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789", 0), 0xCBF4_3926);
        assert_eq!(crc32(&[], 0), 0);
    }

    #[test]
    fn test_crc32_seed_chains() {
        let whole = crc32(b"hello world", 0);
        let first = crc32(b"hello ", 0);
        assert_eq!(crc32(b"world", first), whole);
    }

    #[test]
    fn test_crc8_maxim_reference_values() {
        // A zero byte never sets the high bit, so the register stays zero.
        assert_eq!(crc8_maxim(&[0x00]), 0x00);
        // Bit 7 is only reached on the final round.
        assert_eq!(crc8_maxim(&[0x01]), 0x31);
        assert_eq!(crc8_maxim(&[0x80]), 0x7A);
        assert_eq!(crc8_maxim(b"123456789"), crc8_slow(b"123456789"));
    }

    fn crc8_slow(data: &[u8]) -> u8 {
        let mut crc: u32 = 0;
        for &b in data {
            crc = (crc ^ b as u32) & 0xFF;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 { ((crc << 1) ^ 0x31) & 0xFF } else { (crc << 1) & 0xFF };
            }
        }
        crc as u8
    }
}
