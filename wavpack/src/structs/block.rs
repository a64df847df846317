//! Parsed WavPack blocks.
//!
//! A block is a header plus an ordered list of sub-chunks. Parsing only
//! frames the sub-chunks and checks the optional block checksum; the
//! payloads are interpreted by the decoder.

use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::log_or_err;
use crate::process::extract::RawBlock;
use crate::process::parse::ParserState;
use crate::structs::header::{BlockFlags, BlockHeader, HEADER_SIZE};
use crate::structs::metadata::{self, SubChunk, SubChunkKind};
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::checksum::BlockChecksum;
use crate::utils::errors::{ChecksumError, MalformedBlockError};

#[derive(Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,
    /// Absolute offset of the block in its stream.
    pub offset: u64,
    pub data: Arc<[u8]>,
    pub chunks: Vec<SubChunk>,
    /// False when the block checksum failed and the failure was only logged.
    pub intact: bool,
}

impl Block {
    pub fn read(state: &mut ParserState, raw: &RawBlock) -> Result<Self> {
        let bytes = raw.as_ref();
        let reader = &mut BsIoSliceReader::from_slice(bytes);
        let header = BlockHeader::read(reader)
            .with_context(|| MalformedBlockError::InvalidHeader(raw.offset))?;

        if header.block_size as usize != bytes.len() {
            bail!(MalformedBlockError::InvalidHeader(raw.offset));
        }

        let chunks = metadata::split(bytes, HEADER_SIZE)
            .with_context(|| format!("Block at offset {}", raw.offset))?;

        let mut block = Self {
            header,
            offset: raw.offset,
            data: raw.data.clone(),
            chunks,
            intact: true,
        };

        if state.verify_checksums {
            if let Err(err) = block.verify_checksum() {
                state.checksum_failures += 1;
                block.intact = false;
                log_or_err!(state, log::Level::Error, err);
            }
        }

        Ok(block)
    }

    fn verify_checksum(&self) -> Result<(), ChecksumError> {
        let chunk = self
            .chunks
            .iter()
            .find(|c| c.kind == SubChunkKind::BlockChecksum);

        let Some(chunk) = chunk else {
            if self.header.flags.contains(BlockFlags::HAS_CHECKSUM) {
                return Err(ChecksumError::MissingBlockChecksum(self.offset));
            }
            return Ok(());
        };

        let size = chunk.len();
        if chunk.is_odd_size() || (size != 2 && size != 4) {
            return Err(ChecksumError::InvalidBlockChecksum);
        }

        let stored = self.bytes(chunk)
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32);
        let computed = BlockChecksum::default().update(&self.data[..chunk.start]);

        if !computed.matches(stored, size) {
            return Err(ChecksumError::Block {
                offset: self.offset,
                stored,
                computed: if size == 2 {
                    computed.folded() as u32
                } else {
                    computed.value()
                },
            });
        }

        Ok(())
    }

    pub fn flags(&self) -> BlockFlags {
        self.header.flags
    }

    pub fn bytes(&self, chunk: &SubChunk) -> &[u8] {
        &self.data[chunk.data.clone()]
    }

    /// Payload of the first sub-chunk of `kind`.
    pub fn find(&self, kind: SubChunkKind) -> Option<&[u8]> {
        self.chunks
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| self.bytes(c))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The blocks sharing one block index, from `INITIAL_BLOCK` to `FINAL_BLOCK`.
///
/// One block per mono or stereo stream.
#[derive(Debug, Clone)]
pub struct BlockGroup {
    pub blocks: Vec<Block>,
}

impl BlockGroup {
    pub fn block_index(&self) -> u64 {
        self.blocks.first().map_or(0, |b| b.header.block_index)
    }

    pub fn block_samples(&self) -> u32 {
        self.blocks.first().map_or(0, |b| b.header.block_samples)
    }

    pub fn end_index(&self) -> u64 {
        self.block_index() + self.block_samples() as u64
    }

    pub fn offset(&self) -> u64 {
        self.blocks.first().map_or(0, |b| b.offset)
    }

    /// Total encoded size in bytes.
    pub fn size(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    /// Output channels before any reduction.
    pub fn channels(&self) -> usize {
        self.blocks.iter().map(|b| b.flags().channels()).sum()
    }

    pub fn is_intact(&self) -> bool {
        self.blocks.iter().all(|b| b.intact)
    }
}
