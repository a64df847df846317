//! Pass-through of the source file's container bytes.
//!
//! Encoders store the original RIFF (or alternate format) header and
//! trailer in optional sub-chunks so the file can be restored byte for
//! byte. They are collected here as-is, never interpreted.

use std::collections::BTreeSet;

use crate::structs::block::Block;
use crate::structs::metadata::SubChunkKind;

#[derive(Debug, Clone, Default)]
pub struct WrapperCollector {
    data: Vec<u8>,
    seen: BTreeSet<u64>,
}

impl WrapperCollector {
    /// Appends the wrapper sub-chunks of `block`. A block already absorbed
    /// (same stream offset) is ignored, so re-reading after a seek does not
    /// duplicate data.
    pub fn absorb(&mut self, block: &Block) {
        if !self.seen.insert(block.offset) {
            return;
        }

        for chunk in &block.chunks {
            if matches!(
                chunk.kind,
                SubChunkKind::RiffHeader
                    | SubChunkKind::RiffTrailer
                    | SubChunkKind::AltHeader
                    | SubChunkKind::AltTrailer
            ) {
                self.data.extend_from_slice(block.bytes(chunk));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Hands over the collected bytes and starts empty. Blocks already seen
    /// stay seen.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}
