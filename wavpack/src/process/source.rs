//! Block groups read from a seekable byte source.
//!
//! Wraps an [`Extractor`] and [`Parser`] around a reader, assembles blocks
//! into groups and maintains a sparse index of group offsets for seeking.

use std::io::{Read, Seek, SeekFrom};

use anyhow::{Context, Result, bail};
use log::{LevelFilter, debug, warn};

use crate::log_or_err;
use crate::process::extract::Extractor;
use crate::process::parse::Parser;
use crate::structs::block::{Block, BlockGroup};
use crate::structs::header::{self, BlockHeader, HEADER_SIZE};
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::{MalformedBlockError, SeekError, TruncatedStreamError};

const READ_SIZE: usize = 1 << 16;
const TAIL_WINDOW: u64 = 1 << 20;

/// Where a block group starts and which samples it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub block_index: u64,
    pub block_samples: u32,
}

impl IndexEntry {
    fn contains(&self, sample: u64) -> bool {
        (self.block_index..self.block_index + self.block_samples as u64).contains(&sample)
    }
}

/// Initial blocks seen so far, ordered by block index.
#[derive(Debug, Clone, Default)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
}

impl BlockIndex {
    pub fn record(&mut self, header: &BlockHeader, offset: u64) {
        if !header.is_initial() || header.block_samples == 0 {
            return;
        }

        let entry = IndexEntry {
            offset,
            block_index: header.block_index,
            block_samples: header.block_samples,
        };

        if let Err(at) = self
            .entries
            .binary_search_by_key(&entry.block_index, |e| e.block_index)
        {
            self.entries.insert(at, entry);
        }
    }

    /// The entry holding `sample`, or the last one starting before it.
    pub fn lookup(&self, sample: u64) -> Result<IndexEntry, Option<IndexEntry>> {
        let at = self.entries.partition_point(|e| e.block_index <= sample);
        match at.checked_sub(1).map(|i| self.entries[i]) {
            Some(entry) if entry.contains(sample) => Ok(entry),
            nearest => Err(nearest),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct BlockSource<R: Read + Seek> {
    reader: R,
    extractor: Extractor,
    parser: Parser,
    index: BlockIndex,
    peeked: Option<Block>,
    held: Option<BlockGroup>,
    eof: bool,
    size: u64,
    pub(crate) fail_level: LevelFilter,
}

impl<R: Read + Seek> BlockSource<R> {
    pub fn new(mut reader: R, fail_level: LevelFilter, verify_checksums: bool) -> Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut extractor = Extractor::default();
        extractor.set_fail_level(fail_level);
        let mut parser = Parser::default();
        parser.set_fail_level(fail_level);
        parser.set_verify_checksums(verify_checksums);

        Ok(Self {
            reader,
            extractor,
            parser,
            index: BlockIndex::default(),
            peeked: None,
            held: None,
            eof: false,
            size,
            fail_level,
        })
    }

    /// Total size of the underlying stream in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    /// Resynchronisations so far.
    pub fn resyncs(&self) -> usize {
        self.extractor.error_count()
    }

    pub fn checksum_failures(&self) -> usize {
        self.parser.checksum_failures()
    }

    /// Offset of the next block to be returned.
    pub fn next_offset(&self) -> u64 {
        self.held
            .as_ref()
            .map(BlockGroup::offset)
            .or(self.peeked.as_ref().map(|b| b.offset))
            .unwrap_or(self.extractor.offset())
    }

    /// Continues reading at absolute `offset`, dropping anything buffered.
    pub fn reposition(&mut self, offset: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.extractor.reset(offset);
        self.peeked = None;
        self.held = None;
        self.eof = false;
        Ok(())
    }

    fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }

        let mut buf = vec![0u8; READ_SIZE];
        let n = self.reader.read(&mut buf)?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }

        self.extractor.push_bytes(&buf[..n]);
        Ok(true)
    }

    pub fn next_block(&mut self) -> Result<Option<Block>> {
        if let Some(block) = self.peeked.take() {
            return Ok(Some(block));
        }

        loop {
            match self.extractor.next() {
                Some(Ok(raw)) => match self.parser.parse(&raw) {
                    Ok(block) => {
                        self.index.record(&block.header, block.offset);
                        return Ok(Some(block));
                    }
                    Err(err) if self.fail_level == LevelFilter::Off => {
                        warn!("Skipping unreadable block at offset {}: {err:#}", raw.offset);
                    }
                    Err(err) => return Err(err),
                },
                Some(Err(err)) => return Err(err.into()),
                None => {
                    if !self.fill()? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Reads the next complete group, from an initial to a final block.
    pub fn next_group(&mut self) -> Result<Option<BlockGroup>> {
        if let Some(group) = self.held.take() {
            return Ok(Some(group));
        }

        while let Some(first) = self.next_block()? {
            if !first.header.is_initial() {
                let offset = first.offset;
                log_or_err!(self, log::Level::Warn, MalformedBlockError::MissingInitial { offset });
                continue;
            }

            if let Some(group) = self.finish_group(first)? {
                return Ok(Some(group));
            }
        }

        Ok(None)
    }

    /// Collects the rest of the group started by `first`. Returns `None` when
    /// the group is incomplete and the failure was only logged.
    fn finish_group(&mut self, first: Block) -> Result<Option<BlockGroup>> {
        let offset = first.offset;
        let index = first.header.block_index;
        let samples = first.header.block_samples;
        let mut blocks = vec![first];

        while !blocks.last().is_some_and(|b| b.header.is_final()) {
            let Some(block) = self.next_block()? else {
                log_or_err!(self, log::Level::Error, TruncatedStreamError::PartialGroup(offset));
                return Ok(None);
            };

            if block.header.is_initial() {
                self.peeked = Some(block);
                log_or_err!(self, log::Level::Error, TruncatedStreamError::PartialGroup(offset));
                return Ok(None);
            }

            if block.header.block_index != index || block.header.block_samples != samples {
                log_or_err!(
                    self,
                    log::Level::Error,
                    MalformedBlockError::GroupMismatch {
                        index: block.header.block_index,
                        samples: block.header.block_samples,
                        expected_index: index,
                        expected_samples: samples,
                    }
                );
                return Ok(None);
            }

            blocks.push(block);
        }

        Ok(Some(BlockGroup { blocks }))
    }

    /// The group with block index `index`, reading forward. Groups before it
    /// are skipped; a later group is kept for the next call.
    pub fn group_at(&mut self, index: u64) -> Result<Option<BlockGroup>> {
        while let Some(group) = self.next_group()? {
            if group.block_index() == index {
                return Ok(Some(group));
            }
            if group.block_index() > index {
                self.held = Some(group);
                return Ok(None);
            }
        }

        Ok(None)
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        self.reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Runs `f` with the reader free for random access, then puts it back
    /// where buffered extraction expects it.
    fn detached<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let resume = self.reader.stream_position()?;
        let result = f(self);
        self.reader.seek(SeekFrom::Start(resume))?;
        result
    }

    /// Offset of the group holding absolute block index `sample`.
    ///
    /// Uses the index when it already covers `sample`, otherwise hops from
    /// header to header starting at the nearest known group, recording every
    /// initial block on the way.
    pub fn locate(&mut self, sample: u64) -> Result<u64> {
        let start = match self.index.lookup(sample) {
            Ok(entry) => return Ok(entry.offset),
            Err(nearest) => nearest.map_or(0, |e| e.offset),
        };

        debug!("Scanning for sample {sample} from offset {start}");
        self.detached(|source| source.scan(start, sample))
    }

    fn scan(&mut self, mut pos: u64, sample: u64) -> Result<u64> {
        while pos + HEADER_SIZE as u64 <= self.size {
            let bytes = self.read_at(pos, HEADER_SIZE)?;

            let Some(size) = header::block_size(&bytes) else {
                let window = self.read_at(pos, READ_SIZE)?;
                match header::find(&window[1.min(window.len())..]) {
                    Some(skip) => pos += skip as u64 + 1,
                    None if window.len() < READ_SIZE => break,
                    None => pos += (READ_SIZE - 3) as u64,
                }
                continue;
            };

            let header = BlockHeader::read(&mut BsIoSliceReader::from_slice(&bytes))
                .with_context(|| MalformedBlockError::InvalidHeader(pos))?;
            self.index.record(&header, pos);

            if header.is_initial()
                && (header.block_index..header.end_index()).contains(&sample)
            {
                return Ok(pos);
            }

            if header.is_initial() && header.block_index > sample {
                break;
            }

            pos += size as u64;
        }

        bail!(SeekError::NotFound(sample))
    }

    /// Parsed blocks found near the end of the stream.
    fn tail_blocks(&mut self) -> Result<Vec<Block>> {
        let mut window = TAIL_WINDOW.min(self.size);

        loop {
            let start = self.size - window;
            let bytes = self.read_at(start, window as usize)?;

            let mut extractor = Extractor::default();
            extractor.set_fail_level(LevelFilter::Off);
            extractor.reset(start);
            extractor.push_bytes(&bytes);

            let mut parser = Parser::default();
            parser.set_fail_level(LevelFilter::Off);

            let blocks: Vec<Block> = extractor
                .by_ref()
                .filter_map(|raw| raw.ok())
                .filter_map(|raw| parser.parse(&raw).ok())
                .collect();

            if !blocks.is_empty() || window == self.size {
                return Ok(blocks);
            }
            window = (window * 4).min(self.size);
        }
    }

    /// Block index just past the last audio block in the stream.
    pub fn final_index(&mut self) -> Result<Option<u64>> {
        self.detached(|source| {
            Ok(source
                .tail_blocks()?
                .iter()
                .filter(|b| b.header.block_samples > 0)
                .map(|b| b.header.end_index())
                .max())
        })
    }

    /// Metadata-only blocks after the last audio block.
    pub fn trailing_blocks(&mut self) -> Result<Vec<Block>> {
        self.detached(|source| {
            let blocks = source.tail_blocks()?;
            let last_audio = blocks.iter().rposition(|b| b.header.block_samples > 0);
            Ok(match last_audio {
                Some(at) => blocks[at + 1..].to_vec(),
                None => blocks,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn block(index: u64, samples: u32, flags: u32) -> Vec<u8> {
        header::encode_for_test(24, 0x407, index, Some(400), samples, flags)
    }

    fn stream() -> Vec<u8> {
        // four groups of 100 samples, two mono blocks each
        let mut bytes = Vec::new();
        for g in 0..4u64 {
            bytes.extend(block(g * 100, 100, 0x4 | 0x800));
            bytes.extend(block(g * 100, 100, 0x4 | 0x1000));
        }
        bytes.extend(block(400, 0, 0x4 | 0x1800));
        bytes
    }

    #[test]
    fn groups_in_order() -> anyhow::Result<()> {
        let mut source = BlockSource::new(Cursor::new(stream()), LevelFilter::Error, true)?;

        let mut starts = Vec::new();
        while let Some(group) = source.next_group()? {
            assert_eq!(group.blocks.len(), if group.block_samples() > 0 { 2 } else { 1 });
            starts.push(group.block_index());
        }

        assert_eq!(starts, vec![0, 100, 200, 300, 400]);
        assert_eq!(source.index().len(), 4);
        Ok(())
    }

    #[test]
    fn locate_scans_forward() -> anyhow::Result<()> {
        let mut source = BlockSource::new(Cursor::new(stream()), LevelFilter::Error, true)?;

        assert_eq!(source.locate(250)?, 2 * 64);
        assert_eq!(source.locate(99)?, 0);
        assert_eq!(source.locate(300)?, 3 * 64);

        let err = source.locate(400).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SeekError>(),
            Some(SeekError::NotFound(400))
        ));

        let offset = source.locate(150)?;
        source.reposition(offset)?;
        assert_eq!(source.next_group()?.map(|g| g.block_index()), Some(100));
        Ok(())
    }

    #[test]
    fn partial_group_is_truncation() -> anyhow::Result<()> {
        let mut bytes = block(0, 10, 0x4 | 0x800);
        bytes.extend(block(10, 10, 0x4 | 0x1800));

        let mut source = BlockSource::new(Cursor::new(bytes.clone()), LevelFilter::Error, true)?;
        let err = source.next_group().unwrap_err();
        assert!(err.downcast_ref::<TruncatedStreamError>().is_some());

        let mut lenient = BlockSource::new(Cursor::new(bytes), LevelFilter::Off, true)?;
        assert_eq!(lenient.next_group()?.map(|g| g.block_index()), Some(10));
        assert!(lenient.next_group()?.is_none());
        Ok(())
    }

    #[test]
    fn final_index_from_tail() -> anyhow::Result<()> {
        let mut source = BlockSource::new(Cursor::new(stream()), LevelFilter::Error, true)?;
        assert_eq!(source.final_index()?, Some(400));
        assert_eq!(source.trailing_blocks()?.len(), 1);

        // random access leaves sequential reading untouched
        assert_eq!(source.next_group()?.map(|g| g.block_index()), Some(0));
        Ok(())
    }

    #[test]
    fn correction_groups_by_index() -> anyhow::Result<()> {
        let mut source = BlockSource::new(Cursor::new(stream()), LevelFilter::Error, true)?;

        assert_eq!(source.group_at(100)?.map(|g| g.block_index()), Some(100));
        assert!(source.group_at(150)?.is_none());
        assert_eq!(source.group_at(200)?.map(|g| g.block_index()), Some(200));
        Ok(())
    }
}
