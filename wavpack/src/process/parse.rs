use anyhow::Result;
use log::LevelFilter;

use crate::process::extract::RawBlock;
use crate::structs::block::Block;

/// Parses raw blocks into structured [`Block`]s.
///
/// Frames the header and sub-chunks and verifies the block checksum when
/// present. The payloads stay untouched until decoding.
#[derive(Default)]
pub struct Parser {
    state: ParserState,
}

impl Parser {
    pub fn parse(&mut self, raw: &RawBlock) -> Result<Block> {
        Block::read(&mut self.state, raw)
    }

    /// Sets the failure level for validation errors.
    ///
    /// - `LevelFilter::Off`: never fail, corrupt blocks are only flagged
    /// - `LevelFilter::Error`: fail on Error level messages (default)
    /// - `LevelFilter::Warn`: fail on Warning level and above (strict mode)
    pub fn set_fail_level(&mut self, level: LevelFilter) {
        self.state.fail_level = level;
    }

    pub fn set_verify_checksums(&mut self, verify: bool) {
        self.state.verify_checksums = verify;
    }

    pub fn checksum_failures(&self) -> usize {
        self.state.checksum_failures
    }
}

#[derive(Debug, Clone)]
pub struct ParserState {
    pub fail_level: LevelFilter,
    pub verify_checksums: bool,
    pub checksum_failures: usize,
}

impl Default for ParserState {
    fn default() -> Self {
        Self {
            fail_level: LevelFilter::Error,
            verify_checksums: true,
            checksum_failures: 0,
        }
    }
}
