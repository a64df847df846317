use crate::log_or_err;
use crate::structs::header::{self, HEADER_SIZE, SIGNATURE};
use crate::utils::errors::ExtractError;
use log::{LevelFilter, debug};
use std::collections::VecDeque;
use std::sync::Arc;

/// Extracts WavPack blocks from a continuous byte stream.
///
/// Block boundaries are found by scanning for the `wvpk` signature followed
/// by a plausible header. Anything in between (tags, garbage, the remains of
/// a damaged block) is skipped and counted.
///
/// # Example
///
/// ```rust,no_run
/// use wavpack::process::extract::Extractor;
///
/// let mut extractor = Extractor::default();
/// extractor.push_bytes(&std::fs::read("track.wv")?);
///
/// for block in extractor.by_ref() {
///     let block = block?;
///     println!("block at {} with {} bytes", block.offset, block.as_ref().len());
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct Extractor {
    buffer: VecDeque<u8>,
    /// Absolute stream offset of `buffer[0]`.
    offset: u64,
    locked: bool,
    error_count: usize,
    skipped_bytes: u64,
    pending_skip: u64,
    blocks_extracted: usize,
    pub(crate) fail_level: LevelFilter,
}

impl Default for Extractor {
    fn default() -> Self {
        Self {
            buffer: VecDeque::with_capacity(1 << 16),
            offset: 0,
            locked: false,
            error_count: 0,
            skipped_bytes: 0,
            pending_skip: 0,
            blocks_extracted: 0,
            fail_level: LevelFilter::Error,
        }
    }
}

impl Extractor {
    /// Adds raw stream bytes to the internal buffer.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend(data);
    }

    /// Drops buffered data and restarts extraction at absolute `offset`.
    pub fn reset(&mut self, offset: u64) {
        self.buffer.clear();
        self.offset = offset;
        self.locked = false;
        self.pending_skip = 0;
    }

    /// Absolute offset of the next unconsumed byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of times unrecognised data had to be skipped.
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }

    pub fn blocks_extracted(&self) -> usize {
        self.blocks_extracted
    }

    /// - `LevelFilter::Warn`: skipping data between blocks is an error (strict)
    /// - `LevelFilter::Error`: skipped data is only logged (default)
    pub fn set_fail_level(&mut self, level: LevelFilter) {
        self.fail_level = level;
    }

    fn consume_front(&mut self, cnt: usize) {
        self.buffer.drain(..cnt);
        self.offset += cnt as u64;
    }

    fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        for (dst, src) in bytes.iter_mut().zip(self.buffer.iter()) {
            *dst = *src;
        }
        bytes
    }

    /// Moves the buffer front to the next plausible header.
    ///
    /// Returns false when the buffer holds no complete candidate yet.
    fn resync(&mut self) -> bool {
        loop {
            if self.buffer.len() < HEADER_SIZE {
                return false;
            }

            if header::block_size(&self.header_bytes()).is_some() {
                self.locked = true;
                return true;
            }

            let search_end = self.buffer.len() - SIGNATURE.len() + 1;
            let next = self
                .buffer
                .range(1..)
                .zip(self.buffer.range(2..))
                .zip(self.buffer.range(3..).zip(self.buffer.range(4..)))
                .take(search_end.saturating_sub(1))
                .position(|((&a, &b), (&c, &d))| [a, b, c, d] == *SIGNATURE)
                .map(|i| i + 1);

            let cnt = next.unwrap_or(search_end);
            self.pending_skip += cnt as u64;
            self.skipped_bytes += cnt as u64;
            self.consume_front(cnt);

            if next.is_none() {
                return false;
            }
        }
    }

    fn report_skip(&mut self) -> Result<(), ExtractError> {
        let skipped = std::mem::take(&mut self.pending_skip);
        if skipped == 0 {
            return Ok(());
        }

        let error = ExtractError::Resync {
            skipped,
            offset: self.offset,
        };

        if self.blocks_extracted == 0 {
            // leading data before the first block is not a stream error
            debug!("{error}");
            return Ok(());
        }

        self.error_count += 1;
        log_or_err!(self, log::Level::Warn, error);
        Ok(())
    }
}

impl Iterator for Extractor {
    type Item = Result<RawBlock, ExtractError>;

    /// Returns the next complete block, or `None` when more bytes are needed.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.locked {
            if !self.resync() {
                return None;
            }

            if let Err(err) = self.report_skip() {
                return Some(Err(err));
            }
        }

        let size = header::block_size(&self.header_bytes())?;
        if self.buffer.len() < size {
            return None;
        }

        let offset = self.offset;
        let data: Vec<u8> = self.buffer.drain(..size).collect();
        self.offset += size as u64;
        self.locked = false;
        self.blocks_extracted += 1;

        Some(Ok(RawBlock {
            offset,
            data: data.into(),
        }))
    }
}

/// The raw bytes of one block and where it was found.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub offset: u64,
    pub data: Arc<[u8]>,
}

impl AsRef<[u8]> for RawBlock {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl RawBlock {
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        Self {
            offset,
            data: data.into(),
        }
    }
}

#[cfg(test)]
fn minimal_block(block_index: u32) -> Vec<u8> {
    crate::structs::header::encode_for_test(24, 0x407, block_index as u64, Some(0), 0, 0x1804)
}

#[test]
fn extract_split_pushes() -> anyhow::Result<()> {
    let mut stream = minimal_block(0);
    stream.extend(minimal_block(1));

    let mut extractor = Extractor::default();
    extractor.push_bytes(&stream[..20]);
    assert!(extractor.next().is_none());

    extractor.push_bytes(&stream[20..40]);
    let first = extractor.next().expect("first block")?;
    assert_eq!(first.offset, 0);
    assert_eq!(first.as_ref().len(), 32);
    assert!(extractor.next().is_none());

    extractor.push_bytes(&stream[40..]);
    let second = extractor.next().expect("second block")?;
    assert_eq!(second.offset, 32);
    assert_eq!(extractor.error_count(), 0);

    Ok(())
}

#[test]
fn extract_resyncs_past_garbage() -> anyhow::Result<()> {
    let mut stream = b"ID3\x03garbage".to_vec();
    stream.extend(minimal_block(0));
    stream.extend_from_slice(b"wvpkwv\xffjunk");
    stream.extend(minimal_block(1));

    let mut extractor = Extractor::default();
    extractor.push_bytes(&stream);

    let offsets = extractor
        .by_ref()
        .map(|b| b.map(|b| b.offset))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(offsets, vec![11, 11 + 32 + 11]);
    assert_eq!(extractor.error_count(), 1);
    assert_eq!(extractor.skipped_bytes(), 22);

    Ok(())
}

#[test]
fn extract_strict_reports_resync() {
    let mut stream = minimal_block(0);
    stream.extend_from_slice(&[0u8; 7]);
    stream.extend(minimal_block(1));

    let mut extractor = Extractor::default();
    extractor.set_fail_level(LevelFilter::Warn);
    extractor.push_bytes(&stream);

    assert!(matches!(extractor.next(), Some(Ok(_))));
    assert!(matches!(
        extractor.next(),
        Some(Err(ExtractError::Resync { skipped: 7, .. }))
    ));
    assert!(matches!(extractor.next(), Some(Ok(_))));
}
