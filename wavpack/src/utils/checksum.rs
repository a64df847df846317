/// Running checksum over little-endian 16-bit words of a block.
///
/// The stored value is either the full 32-bit sum or, in the short form,
/// the sum folded to 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChecksum(u32);

impl Default for BlockChecksum {
    fn default() -> Self {
        Self(u32::MAX)
    }
}

impl BlockChecksum {
    pub const fn update(mut self, bytes: &[u8]) -> Self {
        let mut i = 0;
        while i + 1 < bytes.len() {
            let word = u16::from_le_bytes([bytes[i], bytes[i + 1]]) as u32;
            self.0 = self.0.wrapping_mul(3).wrapping_add(word);
            i += 2;
        }
        self
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn folded(self) -> u16 {
        (self.0 ^ (self.0 >> 16)) as u16
    }

    /// Compares against a stored checksum of `size` bytes (2 or 4).
    pub fn matches(self, stored: u32, size: usize) -> bool {
        match size {
            2 => self.folded() as u32 == stored,
            4 => self.0 == stored,
            _ => false,
        }
    }
}

/// Sample CRC stored in every block header.
///
/// Covers the reconstructed integer samples in decode order, before any
/// shift, 32-bit integer or float fixups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleCrc(u32);

impl Default for SampleCrc {
    fn default() -> Self {
        Self(u32::MAX)
    }
}

impl SampleCrc {
    #[inline(always)]
    pub const fn update(self, sample: i32) -> Self {
        Self(self.0.wrapping_mul(3).wrapping_add(sample as u32))
    }

    pub fn extend(self, samples: &[i32]) -> Self {
        samples.iter().fold(self, |crc, &s| crc.update(s))
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

/// CRC over the extended-precision data carried in a WVX bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedCrc(u32);

impl Default for ExtendedCrc {
    fn default() -> Self {
        Self(u32::MAX)
    }
}

impl ExtendedCrc {
    #[inline(always)]
    pub const fn update_int32(self, value: i32) -> Self {
        let value = value as u32;
        Self(
            self.0
                .wrapping_mul(9)
                .wrapping_add((value & 0xffff).wrapping_mul(3))
                .wrapping_add((value >> 16) & 0xffff),
        )
    }

    #[inline(always)]
    pub const fn update_float(self, mantissa: u32, exp: u32, sign: u32) -> Self {
        Self(
            self.0
                .wrapping_mul(27)
                .wrapping_add(mantissa.wrapping_mul(9))
                .wrapping_add(exp.wrapping_mul(3))
                .wrapping_add(sign),
        )
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

#[test]
fn block_checksum_words() {
    let sum = BlockChecksum::default().update(&[0x01, 0x00, 0x02, 0x00]);
    let expected = 0xffff_ffffu32
        .wrapping_mul(3)
        .wrapping_add(1)
        .wrapping_mul(3)
        .wrapping_add(2);
    assert_eq!(sum.value(), expected);
    assert!(sum.matches(expected, 4));
    assert!(sum.matches((expected ^ (expected >> 16)) & 0xffff, 2));
    assert!(!sum.matches(expected, 3));
}

#[test]
fn sample_crc_wraps() {
    let crc = SampleCrc::default().extend(&[1, -1, i32::MIN]);
    let mut expected = u32::MAX;
    for s in [1i32, -1, i32::MIN] {
        expected = expected.wrapping_mul(3).wrapping_add(s as u32);
    }
    assert_eq!(crc.value(), expected);
}
