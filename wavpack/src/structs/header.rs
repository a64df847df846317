//! WavPack block header.
//!
//! Every block starts with a fixed 32-byte little-endian header:
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0 | 4 | `"wvpk"` |
//! | 4 | 4 | block size minus 8 |
//! | 8 | 2 | stream version |
//! | 10 | 1 | block index, upper 8 bits |
//! | 11 | 1 | total samples, upper 8 bits |
//! | 12 | 4 | total samples, lower 32 bits |
//! | 16 | 4 | block index, lower 32 bits |
//! | 20 | 4 | samples in this block |
//! | 24 | 4 | flags |
//! | 28 | 4 | sample CRC |

use anyhow::{Result, bail};
use bitflags::bitflags;

use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::{MalformedBlockError, UnsupportedFeatureError};

pub const HEADER_SIZE: usize = 32;
pub const SIGNATURE: &[u8; 4] = b"wvpk";

pub const MIN_STREAM_VERSION: u16 = 0x402;
pub const MAX_STREAM_VERSION: u16 = 0x410;

pub const MAX_BLOCK_SAMPLES: u32 = 0x30000;
const MAX_CK_SIZE: u32 = 0x100_0000;

const SAMPLE_RATES: [u32; 15] = [
    6000, 8000, 9600, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 64000, 88200, 96000,
    192000,
];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockFlags: u32 {
        const BYTES_STORED = 0x3;
        const MONO = 0x4;
        const HYBRID = 0x8;
        const JOINT_STEREO = 0x10;
        const CROSS_DECORR = 0x20;
        const HYBRID_SHAPE = 0x40;
        const FLOAT_DATA = 0x80;
        const INT32_DATA = 0x100;
        const HYBRID_BITRATE = 0x200;
        const HYBRID_BALANCE = 0x400;
        const INITIAL_BLOCK = 0x800;
        const FINAL_BLOCK = 0x1000;
        const SHIFT = 0x1f << 13;
        const MAG = 0x1f << 18;
        const SRATE = 0xf << 23;
        const HAS_CHECKSUM = 0x1000_0000;
        const NEW_SHAPING = 0x2000_0000;
        const FALSE_STEREO = 0x4000_0000;
        const DSD = 0x8000_0000;

        const _ = !0;
    }
}

impl BlockFlags {
    /// Bytes per integer sample, 1 through 4.
    pub fn bytes_per_sample(self) -> u32 {
        (self.bits() & Self::BYTES_STORED.bits()) + 1
    }

    pub fn shift(self) -> u32 {
        (self.bits() & Self::SHIFT.bits()) >> 13
    }

    pub fn magnitude(self) -> u32 {
        (self.bits() & Self::MAG.bits()) >> 18
    }

    pub fn sample_rate_index(self) -> usize {
        ((self.bits() & Self::SRATE.bits()) >> 23) as usize
    }

    /// Sample rate from the table index, `None` for a custom rate.
    pub fn sample_rate(self) -> Option<u32> {
        SAMPLE_RATES.get(self.sample_rate_index()).copied()
    }

    /// True when the block's bitstream carries a single channel.
    pub fn is_mono_data(self) -> bool {
        self.intersects(Self::MONO | Self::FALSE_STEREO)
    }

    /// Output channels this block contributes.
    pub fn channels(self) -> usize {
        if self.contains(Self::MONO) { 1 } else { 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block size in bytes, header included.
    pub block_size: u32,
    pub version: u16,
    pub block_index: u64,
    pub total_samples: Option<u64>,
    pub block_samples: u32,
    pub flags: BlockFlags,
    pub crc: u32,
}

impl BlockHeader {
    pub fn read(reader: &mut BsIoSliceReader) -> Result<Self> {
        let mut signature = [0u8; 4];
        for byte in signature.iter_mut() {
            *byte = reader.get_n(8)?;
        }

        if &signature != SIGNATURE {
            bail!(MalformedBlockError::InvalidHeader(0));
        }

        let ck_size: u32 = reader.get_n(32)?;
        let version: u16 = reader.get_n(16)?;
        let block_index_u8: u8 = reader.get_n(8)?;
        let total_samples_u8: u8 = reader.get_n(8)?;
        let total_samples: u32 = reader.get_n(32)?;
        let block_index: u32 = reader.get_n(32)?;
        let block_samples: u32 = reader.get_n(32)?;
        let flags = BlockFlags::from_bits_retain(reader.get_n(32)?);
        let crc: u32 = reader.get_n(32)?;

        if ck_size & 1 != 0 || !(24..MAX_CK_SIZE).contains(&ck_size) {
            bail!(MalformedBlockError::InvalidHeader(0));
        }

        if !(MIN_STREAM_VERSION..=MAX_STREAM_VERSION).contains(&version) {
            bail!(UnsupportedFeatureError::Version(version));
        }

        if block_samples >= MAX_BLOCK_SAMPLES {
            bail!(MalformedBlockError::InvalidHeader(0));
        }

        let total_samples = if total_samples == u32::MAX {
            None
        } else {
            let high = total_samples_u8 as u64;
            Some(total_samples as u64 + (high << 32) - high)
        };

        Ok(Self {
            block_size: ck_size + 8,
            version,
            block_index: block_index as u64 + ((block_index_u8 as u64) << 32),
            total_samples,
            block_samples,
            flags,
            crc,
        })
    }

    pub fn is_initial(&self) -> bool {
        self.flags.contains(BlockFlags::INITIAL_BLOCK)
    }

    pub fn is_final(&self) -> bool {
        self.flags.contains(BlockFlags::FINAL_BLOCK)
    }

    pub fn end_index(&self) -> u64 {
        self.block_index + self.block_samples as u64
    }
}

/// Quick validity check used while scanning for block boundaries.
///
/// Returns the block size in bytes when `bytes` starts with a plausible header.
pub fn block_size(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_SIZE || &bytes[..4] != SIGNATURE {
        return None;
    }

    let le32 = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let ck_size = le32(4);
    let version = u16::from_le_bytes([bytes[8], bytes[9]]);
    let block_samples = le32(20);

    if ck_size & 1 != 0
        || !(24..MAX_CK_SIZE).contains(&ck_size)
        || !(MIN_STREAM_VERSION..=MAX_STREAM_VERSION).contains(&version)
        || block_samples >= MAX_BLOCK_SAMPLES
    {
        return None;
    }

    Some(ck_size as usize + 8)
}

/// Offset of the first plausible header in `bytes`.
pub fn find(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(4)
        .enumerate()
        .filter(|(_, w)| w == SIGNATURE)
        .map(|(i, _)| i)
        .find(|&i| block_size(&bytes[i..]).is_some())
}

#[cfg(test)]
pub(crate) fn encode_for_test(
    ck_size: u32,
    version: u16,
    block_index: u64,
    total_samples: Option<u64>,
    block_samples: u32,
    flags: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE);
    out.extend_from_slice(SIGNATURE);
    out.extend_from_slice(&ck_size.to_le_bytes());
    out.extend_from_slice(&version.to_le_bytes());
    out.push((block_index >> 32) as u8);
    let (total_u8, total) = match total_samples {
        None => (0, u32::MAX),
        Some(total) => {
            let high = (total >> 32) as u8;
            let low = (total - ((high as u64) << 32) + high as u64) as u32;
            (high, low)
        }
    };
    out.push(total_u8);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&(block_index as u32).to_le_bytes());
    out.extend_from_slice(&block_samples.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

#[test]
fn header_40_bit_fields() -> anyhow::Result<()> {
    let bytes = encode_for_test(
        24,
        0x407,
        (3 << 32) | 0x10,
        Some((2 << 32) + 5),
        1000,
        0x1800 | 0x4 | 0x1,
    );
    let header = BlockHeader::read(&mut BsIoSliceReader::from_slice(&bytes))?;

    assert_eq!(header.block_size, 32);
    assert_eq!(header.block_index, (3 << 32) | 0x10);
    assert_eq!(header.total_samples, Some((2 << 32) + 5));
    assert_eq!(header.block_samples, 1000);
    assert!(header.is_initial() && header.is_final());
    assert_eq!(header.flags.bytes_per_sample(), 2);
    assert_eq!(header.flags.channels(), 1);
    assert_eq!(block_size(&bytes), Some(32));

    Ok(())
}

#[test]
fn unknown_length() -> anyhow::Result<()> {
    let bytes = encode_for_test(24, 0x410, 0, None, 0, 0);
    let header = BlockHeader::read(&mut BsIoSliceReader::from_slice(&bytes))?;
    assert_eq!(header.total_samples, None);
    assert_eq!(header.flags.sample_rate(), Some(6000));

    Ok(())
}

#[test]
fn rejects_bad_headers() {
    let odd = encode_for_test(25, 0x407, 0, None, 0, 0);
    assert!(BlockHeader::read(&mut BsIoSliceReader::from_slice(&odd)).is_err());
    assert_eq!(block_size(&odd), None);

    let old = encode_for_test(24, 0x401, 0, None, 0, 0);
    let err = BlockHeader::read(&mut BsIoSliceReader::from_slice(&old)).unwrap_err();
    assert!(err.downcast_ref::<UnsupportedFeatureError>().is_some());

    let long = encode_for_test(24, 0x407, 0, None, MAX_BLOCK_SAMPLES, 0);
    assert_eq!(block_size(&long), None);

    let mut shifted = vec![0u8, b'w', b'v'];
    shifted.extend(encode_for_test(24, 0x407, 0, None, 0, 0));
    assert_eq!(find(&shifted), Some(3));
}
