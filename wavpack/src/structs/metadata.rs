//! Metadata sub-chunks carried inside a block after the header.
//!
//! Each sub-chunk starts with an id byte and a length counted in 16-bit
//! words: one length byte, or three when [`ID_LARGE`] is set. With
//! [`ID_ODD_SIZE`] the last stored byte is padding.

use std::ops::Range;

use anyhow::{Result, bail};

use crate::utils::errors::{MalformedBlockError, UnsupportedFeatureError};

pub const ID_UNIQUE: u8 = 0x3f;
pub const ID_OPTIONAL_DATA: u8 = 0x20;
pub const ID_ODD_SIZE: u8 = 0x40;
pub const ID_LARGE: u8 = 0x80;

pub const ID_DUMMY: u8 = 0x0;
pub const ID_ENCODER_INFO: u8 = 0x1;
pub const ID_DECORR_TERMS: u8 = 0x2;
pub const ID_DECORR_WEIGHTS: u8 = 0x3;
pub const ID_DECORR_SAMPLES: u8 = 0x4;
pub const ID_ENTROPY_VARS: u8 = 0x5;
pub const ID_HYBRID_PROFILE: u8 = 0x6;
pub const ID_SHAPING_WEIGHTS: u8 = 0x7;
pub const ID_FLOAT_INFO: u8 = 0x8;
pub const ID_INT32_INFO: u8 = 0x9;
pub const ID_WV_BITSTREAM: u8 = 0xa;
pub const ID_WVC_BITSTREAM: u8 = 0xb;
pub const ID_WVX_BITSTREAM: u8 = 0xc;
pub const ID_CHANNEL_INFO: u8 = 0xd;
pub const ID_DSD_BLOCK: u8 = 0xe;

pub const ID_RIFF_HEADER: u8 = ID_OPTIONAL_DATA | 0x1;
pub const ID_RIFF_TRAILER: u8 = ID_OPTIONAL_DATA | 0x2;
pub const ID_ALT_HEADER: u8 = ID_OPTIONAL_DATA | 0x3;
pub const ID_ALT_TRAILER: u8 = ID_OPTIONAL_DATA | 0x4;
pub const ID_CONFIG_BLOCK: u8 = ID_OPTIONAL_DATA | 0x5;
pub const ID_MD5_CHECKSUM: u8 = ID_OPTIONAL_DATA | 0x6;
pub const ID_SAMPLE_RATE: u8 = ID_OPTIONAL_DATA | 0x7;
pub const ID_ALT_EXTENSION: u8 = ID_OPTIONAL_DATA | 0x8;
pub const ID_ALT_MD5_CHECKSUM: u8 = ID_OPTIONAL_DATA | 0x9;
pub const ID_NEW_CONFIG_BLOCK: u8 = ID_OPTIONAL_DATA | 0xa;
pub const ID_CHANNEL_IDENTITIES: u8 = ID_OPTIONAL_DATA | 0xb;
pub const ID_WVX_NEW_BITSTREAM: u8 = ID_OPTIONAL_DATA | 0xc;
pub const ID_BLOCK_CHECKSUM: u8 = ID_OPTIONAL_DATA | 0xf;

/// Decoded sub-chunk kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubChunkKind {
    Dummy,
    EncoderInfo,
    DecorrTerms,
    DecorrWeights,
    DecorrSamples,
    EntropyVars,
    HybridProfile,
    ShapingWeights,
    FloatInfo,
    Int32Info,
    WvBitstream,
    WvcBitstream,
    WvxBitstream,
    ChannelInfo,
    DsdBlock,
    RiffHeader,
    RiffTrailer,
    AltHeader,
    AltTrailer,
    ConfigBlock,
    Md5Checksum,
    SampleRate,
    AltExtension,
    AltMd5Checksum,
    NewConfigBlock,
    ChannelIdentities,
    /// Extended-precision data in the newer layout, not decoded.
    WvxNewBitstream,
    BlockChecksum,
    /// Unrecognised sub-chunk flagged optional; kept opaque.
    Unknown(u8),
}

impl SubChunkKind {
    /// Maps a unique id (flags above bit 5 stripped except optional) to its kind.
    pub fn from_id(id: u8) -> Result<Self> {
        let kind = match id & ID_UNIQUE {
            ID_DUMMY => Self::Dummy,
            ID_ENCODER_INFO => Self::EncoderInfo,
            ID_DECORR_TERMS => Self::DecorrTerms,
            ID_DECORR_WEIGHTS => Self::DecorrWeights,
            ID_DECORR_SAMPLES => Self::DecorrSamples,
            ID_ENTROPY_VARS => Self::EntropyVars,
            ID_HYBRID_PROFILE => Self::HybridProfile,
            ID_SHAPING_WEIGHTS => Self::ShapingWeights,
            ID_FLOAT_INFO => Self::FloatInfo,
            ID_INT32_INFO => Self::Int32Info,
            ID_WV_BITSTREAM => Self::WvBitstream,
            ID_WVC_BITSTREAM => Self::WvcBitstream,
            ID_WVX_BITSTREAM => Self::WvxBitstream,
            ID_CHANNEL_INFO => Self::ChannelInfo,
            ID_DSD_BLOCK => Self::DsdBlock,
            ID_RIFF_HEADER => Self::RiffHeader,
            ID_RIFF_TRAILER => Self::RiffTrailer,
            ID_ALT_HEADER => Self::AltHeader,
            ID_ALT_TRAILER => Self::AltTrailer,
            ID_CONFIG_BLOCK => Self::ConfigBlock,
            ID_MD5_CHECKSUM => Self::Md5Checksum,
            ID_SAMPLE_RATE => Self::SampleRate,
            ID_ALT_EXTENSION => Self::AltExtension,
            ID_ALT_MD5_CHECKSUM => Self::AltMd5Checksum,
            ID_NEW_CONFIG_BLOCK => Self::NewConfigBlock,
            ID_CHANNEL_IDENTITIES => Self::ChannelIdentities,
            ID_WVX_NEW_BITSTREAM => Self::WvxNewBitstream,
            ID_BLOCK_CHECKSUM => Self::BlockChecksum,
            unique if unique & ID_OPTIONAL_DATA != 0 => Self::Unknown(unique),
            unique => bail!(UnsupportedFeatureError::SubChunk(unique)),
        };

        Ok(kind)
    }
}

/// A sub-chunk located within its block's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubChunk {
    pub id: u8,
    pub kind: SubChunkKind,
    /// Offset of the id byte within the block.
    pub start: usize,
    /// Payload range within the block, padding excluded.
    pub data: Range<usize>,
}

impl SubChunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_odd_size(&self) -> bool {
        self.id & ID_ODD_SIZE != 0
    }
}

/// Splits the bytes following a block header into sub-chunks.
///
/// `offset` is where the sub-chunk area begins within `block`.
pub fn split(block: &[u8], offset: usize) -> Result<Vec<SubChunk>> {
    let mut chunks = Vec::new();
    let mut pos = offset;

    while pos < block.len() {
        let start = pos;
        let id = block[pos];
        let header_len = if id & ID_LARGE != 0 { 4 } else { 2 };

        if pos + header_len > block.len() {
            bail!(MalformedBlockError::SubChunkOverrun {
                id,
                offset: pos,
                len: header_len,
            });
        }

        let words = if id & ID_LARGE != 0 {
            block[pos + 1] as usize | (block[pos + 2] as usize) << 8 | (block[pos + 3] as usize) << 16
        } else {
            block[pos + 1] as usize
        };
        pos += header_len;

        let stored = words * 2;
        if pos + stored > block.len() {
            bail!(MalformedBlockError::SubChunkOverrun {
                id,
                offset: start,
                len: stored,
            });
        }

        let len = if id & ID_ODD_SIZE != 0 {
            if stored == 0 {
                bail!(MalformedBlockError::SubChunkSize {
                    what: "odd-sized",
                    size: 0,
                });
            }
            stored - 1
        } else {
            stored
        };

        chunks.push(SubChunk {
            id,
            kind: SubChunkKind::from_id(id)?,
            start,
            data: pos..pos + len,
        });

        pos += stored;
    }

    Ok(chunks)
}

#[cfg(test)]
pub(crate) fn encode_for_test(id: u8, data: &[u8]) -> Vec<u8> {
    let mut id = id;
    let padded = data.len().div_ceil(2) * 2;
    if data.len() & 1 != 0 {
        id |= ID_ODD_SIZE;
    }

    let words = padded / 2;
    let mut out = Vec::with_capacity(padded + 4);
    if words > 0xff {
        out.extend_from_slice(&[id | ID_LARGE, words as u8, (words >> 8) as u8, (words >> 16) as u8]);
    } else {
        out.extend_from_slice(&[id, words as u8]);
    }
    out.extend_from_slice(data);
    out.resize(out.len() + padded - data.len(), 0);
    out
}

#[test]
fn sub_chunk_framing() -> anyhow::Result<()> {
    let mut bytes = encode_for_test(ID_DECORR_TERMS, &[0x11, 0x22, 0x33]);
    bytes.extend(encode_for_test(ID_WV_BITSTREAM, &vec![0xaa; 600]));
    bytes.extend(encode_for_test(ID_OPTIONAL_DATA | 0x1e, &[1, 2]));

    let chunks = split(&bytes, 0)?;
    assert_eq!(chunks.len(), 3);

    assert_eq!(chunks[0].kind, SubChunkKind::DecorrTerms);
    assert!(chunks[0].is_odd_size());
    assert_eq!(&bytes[chunks[0].data.clone()], &[0x11, 0x22, 0x33]);

    assert_eq!(chunks[1].kind, SubChunkKind::WvBitstream);
    assert_eq!(chunks[1].len(), 600);
    assert_eq!(chunks[1].start, 6);

    assert_eq!(chunks[2].kind, SubChunkKind::Unknown(0x3e));

    Ok(())
}

#[test]
fn newer_extended_bitstream_is_recognised() -> anyhow::Result<()> {
    let chunks = split(&encode_for_test(ID_WVX_NEW_BITSTREAM, &[0; 8]), 0)?;
    assert_eq!(chunks[0].kind, SubChunkKind::WvxNewBitstream);
    Ok(())
}

#[test]
fn sub_chunk_errors() {
    let overrun = [ID_WV_BITSTREAM, 4, 0, 0];
    let err = split(&overrun, 0).unwrap_err();
    assert!(err.downcast_ref::<MalformedBlockError>().is_some());

    let unknown = encode_for_test(0x1e, &[0, 0]);
    let err = split(&unknown, 0).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<UnsupportedFeatureError>(),
        Some(UnsupportedFeatureError::SubChunk(0x1e))
    ));
}
