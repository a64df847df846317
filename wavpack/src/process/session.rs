//! Sequential and random access decoding of a WavPack file.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use anyhow::{Context, Result, bail};
use log::{LevelFilter, debug, info, warn};

use crate::log_or_err;
use crate::process::decode::{DecodeOptions, Decoder, OutputMode};
use crate::process::source::BlockSource;
use crate::structs::block::{Block, BlockGroup};
use crate::structs::descriptor::{ModeFlags, QualifyMode, StreamDescriptor};
use crate::structs::header::{BlockFlags, MAX_BLOCK_SAMPLES};
use crate::structs::metadata::SubChunkKind;
use crate::structs::wrapper::WrapperCollector;
use crate::utils::errors::{
    DecodeError, MalformedBlockError, MissingCorrectionDataError, OpenError, SeekError,
    TruncatedStreamError, UseAfterCloseError,
};

/// How a correction stream is found when opening by path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrectionMode {
    /// Use `<path>c` when it exists.
    #[default]
    Auto,
    /// Fail when `<path>c` cannot be opened.
    Require,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub correction: CorrectionMode,
    pub output: OutputMode,
    pub fail_level: LevelFilter,
    pub verify_checksums: bool,
    pub normalize_float: bool,
    pub norm_offset: i32,
    pub max_channels: Option<usize>,
    pub keep_wrapper: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            correction: CorrectionMode::Auto,
            output: OutputMode::Exact,
            fail_level: LevelFilter::Error,
            verify_checksums: true,
            normalize_float: false,
            norm_offset: 0,
            max_channels: None,
            keep_wrapper: false,
        }
    }
}

impl OpenOptions {
    pub fn correction(mut self, mode: CorrectionMode) -> Self {
        self.correction = mode;
        self
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// - `LevelFilter::Off`: best effort, damaged blocks decode to silence
    /// - `LevelFilter::Error`: fail on errors (default)
    /// - `LevelFilter::Warn`: also fail on warnings such as resynchronisation
    pub fn fail_level(mut self, level: LevelFilter) -> Self {
        self.fail_level = level;
        self
    }

    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Rescales float samples so that full scale is `2^norm_offset`.
    pub fn normalize_float(mut self, norm_offset: i32) -> Self {
        self.normalize_float = true;
        self.norm_offset = norm_offset;
        self
    }

    pub fn max_channels(mut self, max: usize) -> Self {
        self.max_channels = Some(max);
        self
    }

    pub fn keep_wrapper(mut self, keep: bool) -> Self {
        self.keep_wrapper = keep;
        self
    }

    fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            fail_level: self.fail_level,
            output: self.output,
            normalize: self.normalize_float.then_some(self.norm_offset),
            max_channels: self.max_channels,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Ready,
    Decoding,
    Seeking,
    Closed,
}

/// Frames returned by [`Session::decode`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedSamples {
    /// `frames * channels` samples, interleaved.
    pub samples: Vec<i32>,
    pub frames: usize,
    pub channels: usize,
}

/// A whole file decoded by [`read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStream {
    pub samples: Vec<i32>,
    pub frames: usize,
    pub channels: usize,
    pub sample_rate: u32,
}

/// Decoded frames not yet handed out.
#[derive(Debug, Default)]
struct Pending {
    samples: Vec<i32>,
    frames: usize,
    consumed: usize,
}

impl Pending {
    fn silence(frames: usize, channels: usize) -> Self {
        Self {
            samples: vec![0; frames * channels],
            frames,
            consumed: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.frames - self.consumed
    }
}

/// Encoded size of the most recently decoded block group.
#[derive(Debug, Clone, Copy, Default)]
struct GroupSize {
    main: usize,
    correction: usize,
    samples: u32,
}

/// Where a failed `decode` call rolls back to.
///
/// The decoder and buffers are moved in only when a refill is about to
/// replace them, so a call served from buffered frames saves nothing else.
struct Checkpoint {
    cursor: u64,
    consumed: usize,
    main: u64,
    correction: Option<u64>,
    last_group: Option<GroupSize>,
    replaced: Option<Replaced>,
}

struct Replaced {
    decoder: Decoder,
    pending: Pending,
    queued: Option<BlockGroup>,
}

struct SessionInner<R: Read + Seek> {
    options: OpenOptions,
    descriptor: StreamDescriptor,
    main: BlockSource<R>,
    correction: Option<BlockSource<R>>,
    decoder: Decoder,
    pending: Pending,
    /// Group read past a gap, decoded once the gap is filled.
    queued: Option<BlockGroup>,
    /// Samples per channel since `initial_index`.
    cursor: u64,
    failed_decodes: usize,
    wrapper: WrapperCollector,
    md5: Option<[u8; 16]>,
    last_group: Option<GroupSize>,
    checkpoint: Option<Checkpoint>,
}

/// An open WavPack stream, optionally paired with its correction stream.
///
/// # Example
///
/// ```rust,no_run
/// use wavpack::process::session::{OpenOptions, Session};
///
/// let mut session = Session::open("track.wv", OpenOptions::default())?;
/// let descriptor = session.descriptor()?;
/// println!("{} channels at {} Hz", descriptor.channels, descriptor.sample_rate);
///
/// loop {
///     let decoded = session.decode(4096)?;
///     if decoded.frames == 0 {
///         break;
///     }
///     // decoded.samples holds decoded.frames * decoded.channels values
/// }
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Session<R: Read + Seek = BufReader<File>> {
    state: SessionState,
    inner: Option<SessionInner<R>>,
    last_error: Option<String>,
}

impl Session<BufReader<File>> {
    /// Opens `path`, and `path` with a `c` appended as the correction stream
    /// according to `options.correction`.
    pub fn open<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let main = File::open(path).with_context(|| OpenError::Io {
            path: path.display().to_string(),
        })?;

        let mut wvc_path = path.as_os_str().to_owned();
        wvc_path.push("c");

        let correction = match options.correction {
            CorrectionMode::Ignore => None,
            CorrectionMode::Auto => File::open(&wvc_path).ok(),
            CorrectionMode::Require => Some(File::open(&wvc_path).with_context(|| {
                OpenError::MissingCorrectionFile(Path::new(&wvc_path).display().to_string())
            })?),
        };

        Self::from_reader(
            BufReader::new(main),
            correction.map(BufReader::new),
            options,
        )
    }
}

impl<R: Read + Seek> Session<R> {
    pub fn from_reader(reader: R, correction: Option<R>, options: OpenOptions) -> Result<Self> {
        let inner = SessionInner::open(reader, correction, options).context(OpenError::InvalidStream)?;

        Ok(Self {
            state: SessionState::Ready,
            inner: Some(inner),
            last_error: None,
        })
    }

    fn inner(&self, call: &'static str) -> Result<&SessionInner<R>> {
        match &self.inner {
            Some(inner) => Ok(inner),
            None => bail!(UseAfterCloseError::Closed(call)),
        }
    }

    fn inner_mut(&mut self, call: &'static str) -> Result<&mut SessionInner<R>> {
        match &mut self.inner {
            Some(inner) => Ok(inner),
            None => bail!(UseAfterCloseError::Closed(call)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn descriptor(&self) -> Result<StreamDescriptor> {
        Ok(self.inner("descriptor")?.descriptor.clone())
    }

    /// Decodes up to `count` frames.
    ///
    /// Fewer frames are returned only at the end of the stream. On failure
    /// nothing is consumed: position, buffered samples and decoder state are
    /// as before the call.
    pub fn decode(&mut self, count: usize) -> Result<DecodedSamples> {
        let Some(inner) = self.inner.as_mut() else {
            bail!(UseAfterCloseError::Closed("decode"));
        };

        self.state = SessionState::Decoding;
        inner.begin_decode();
        let result = inner.decode(count);
        self.state = SessionState::Ready;

        match result {
            Ok(decoded) => {
                inner.checkpoint = None;
                Ok(decoded)
            }
            Err(err) => {
                inner.rollback()?;
                inner.failed_decodes += 1;
                let errors = inner.num_errors();
                self.last_error = Some(format!("{err:#}"));
                Err(err.context(DecodeError::Failed { errors }))
            }
        }
    }

    /// Moves the position to `sample`. Decoding resumes there; nothing is
    /// decoded by the seek itself.
    pub fn seek(&mut self, sample: u64) -> Result<()> {
        let Some(inner) = self.inner.as_mut() else {
            bail!(UseAfterCloseError::Closed("seek"));
        };

        self.state = SessionState::Seeking;
        let result = inner.seek(sample);
        self.state = SessionState::Ready;

        if let Err(err) = &result {
            self.last_error = Some(format!("{err:#}"));
        }
        result
    }

    /// Samples per channel decoded since the start of the stream.
    pub fn position(&self) -> Result<u64> {
        Ok(self.inner("position")?.cursor)
    }

    pub fn close(&mut self) -> Result<()> {
        if self.inner.take().is_none() {
            bail!(UseAfterCloseError::Closed("close"));
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    /// Text of the last failed `decode` or `seek`. Still available after close.
    pub fn error_message(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Blocks replaced with silence plus failed decode calls.
    pub fn num_errors(&self) -> Result<usize> {
        Ok(self.inner("num_errors")?.num_errors())
    }

    /// Hybrid blocks decoded without correction data.
    pub fn lossy_blocks(&self) -> Result<usize> {
        Ok(self.inner("lossy_blocks")?.decoder.lossy_blocks())
    }

    /// Fraction of the stream decoded, `None` when the length is unknown.
    pub fn progress(&self) -> Result<Option<f64>> {
        let inner = self.inner("progress")?;
        Ok(inner
            .descriptor
            .total_samples
            .filter(|&total| total > 0)
            .map(|total| inner.cursor as f64 / total as f64))
    }

    /// Encoded size over the size of the decoded PCM.
    pub fn ratio(&self) -> Result<Option<f64>> {
        let inner = self.inner("ratio")?;
        let descriptor = &inner.descriptor;
        let output = descriptor.total_samples.unwrap_or(0) as f64
            * descriptor.channels as f64
            * descriptor.bytes_per_sample as f64;
        let input = inner.file_size() as f64;

        Ok((output >= 1.0 && input >= 1.0).then(|| input / output))
    }

    /// Bits per second over the whole file, optionally counting the
    /// correction stream.
    pub fn average_bitrate(&self, count_correction: bool) -> Result<Option<f64>> {
        let inner = self.inner("average_bitrate")?;
        let descriptor = &inner.descriptor;
        let Some(total) = descriptor.total_samples else {
            return Ok(None);
        };
        if descriptor.sample_rate == 0 {
            return Ok(None);
        }

        let seconds = total as f64 / descriptor.sample_rate as f64;
        let mut input = inner.main.size() as f64;
        if count_correction {
            input += inner.correction.as_ref().map_or(0, |c| c.size()) as f64;
        }

        Ok((seconds >= 0.1 && input >= 1.0).then(|| input * 8.0 / seconds))
    }

    /// Bits per second of the block group decoded last.
    pub fn instant_bitrate(&self) -> Result<Option<f64>> {
        let inner = self.inner("instant_bitrate")?;
        let rate = inner.descriptor.sample_rate;

        Ok(inner
            .last_group
            .filter(|group| group.samples > 0 && rate > 0)
            .map(|group| {
                let seconds = group.samples as f64 / rate as f64;
                (group.main + group.correction) as f64 * 8.0 / seconds
            }))
    }

    /// Wrapper bytes collected so far, with `OpenOptions::keep_wrapper`.
    pub fn wrapper_bytes(&self) -> Result<usize> {
        Ok(self.inner("wrapper_bytes")?.wrapper.len())
    }

    pub fn wrapper_data(&self) -> Result<&[u8]> {
        Ok(self.inner("wrapper_data")?.wrapper.bytes())
    }

    pub fn take_wrapper(&mut self) -> Result<Vec<u8>> {
        Ok(self.inner_mut("take_wrapper")?.wrapper.take())
    }

    /// Collects the wrapper trailer and MD5 sum stored after the audio
    /// without decoding up to them. The position is unchanged.
    pub fn seek_trailing_wrapper(&mut self) -> Result<()> {
        let inner = self.inner_mut("seek_trailing_wrapper")?;

        for block in inner.main.trailing_blocks()? {
            inner.absorb_metadata(&block);
        }
        Ok(())
    }

    /// Bytes in the main and correction streams.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.inner("file_size")?.file_size())
    }

    pub fn mode(&self) -> Result<ModeFlags> {
        let inner = self.inner("mode")?;
        Ok(inner
            .descriptor
            .mode(inner.correction.is_some(), inner.decoder.lossy_blocks() > 0))
    }

    pub fn qualify_mode(&self) -> Result<QualifyMode> {
        Ok(self.inner("qualify_mode")?.descriptor.qualify_mode)
    }

    /// Stored MD5 sum of the decoded audio, once a block carrying it was read.
    pub fn md5_sum(&self) -> Result<Option<[u8; 16]>> {
        Ok(self.inner("md5_sum")?.md5)
    }
}

impl<R: Read + Seek> SessionInner<R> {
    fn open(reader: R, correction: Option<R>, options: OpenOptions) -> Result<Self> {
        let mut main = BlockSource::new(reader, options.fail_level, options.verify_checksums)?;
        let correction = correction
            .map(|r| BlockSource::new(r, options.fail_level, options.verify_checksums))
            .transpose()?;

        let mut wrapper = WrapperCollector::default();
        let mut md5 = None;
        let mut fallback = None;

        let first = loop {
            match main.next_group()? {
                Some(group) => {
                    for block in &group.blocks {
                        if options.keep_wrapper {
                            wrapper.absorb(block);
                        }
                        md5 = md5.or(stored_md5(block));
                    }
                    if group.block_samples() > 0 {
                        break group;
                    }
                    fallback.get_or_insert(group);
                }
                None => match fallback.take() {
                    Some(group) => break group,
                    None => bail!(OpenError::NoBlocks),
                },
            }
        };

        let mut descriptor = StreamDescriptor::from_group(&first, options.max_channels)?;
        if descriptor.total_samples.is_none() {
            descriptor.total_samples = main
                .final_index()?
                .map(|end| end.saturating_sub(descriptor.initial_index));
        }
        md5 = md5.or(descriptor.md5);

        main.reposition(first.offset())?;

        info!(
            "Opened WavPack stream: {} channels at {} Hz, {} bits, {} samples{}",
            descriptor.channels,
            descriptor.sample_rate,
            descriptor.bits_per_sample,
            descriptor
                .total_samples
                .map_or_else(|| "unknown".to_string(), |n| n.to_string()),
            if correction.is_some() { " with correction" } else { "" },
        );

        Ok(Self {
            decoder: Decoder::new(options.decode_options()),
            options,
            descriptor,
            main,
            correction,
            pending: Pending::default(),
            queued: None,
            cursor: 0,
            failed_decodes: 0,
            wrapper,
            md5,
            last_group: None,
            checkpoint: None,
        })
    }

    fn num_errors(&self) -> usize {
        self.decoder.errors() + self.failed_decodes
    }

    fn file_size(&self) -> u64 {
        self.main.size() + self.correction.as_ref().map_or(0, |c| c.size())
    }

    fn begin_decode(&mut self) {
        self.checkpoint = Some(Checkpoint {
            cursor: self.cursor,
            consumed: self.pending.consumed,
            main: self.main.next_offset(),
            correction: self.correction.as_ref().map(BlockSource::next_offset),
            last_group: self.last_group,
            replaced: None,
        });
    }

    /// Moves what a refill overwrites into the open checkpoint, once per call.
    fn preserve(&mut self) {
        if let Some(checkpoint) = self.checkpoint.as_mut().filter(|c| c.replaced.is_none()) {
            checkpoint.replaced = Some(Replaced {
                decoder: self.decoder.clone(),
                pending: std::mem::take(&mut self.pending),
                queued: self.queued.clone(),
            });
        }
    }

    fn rollback(&mut self) -> Result<()> {
        let Some(checkpoint) = self.checkpoint.take() else {
            return Ok(());
        };

        if let Some(replaced) = checkpoint.replaced {
            self.decoder = replaced.decoder;
            self.pending = replaced.pending;
            self.queued = replaced.queued;
        }
        self.pending.consumed = checkpoint.consumed;
        self.cursor = checkpoint.cursor;
        self.last_group = checkpoint.last_group;

        self.main.reposition(checkpoint.main)?;
        if let (Some(source), Some(offset)) = (self.correction.as_mut(), checkpoint.correction) {
            source.reposition(offset)?;
        }
        Ok(())
    }

    fn absorb_metadata(&mut self, block: &Block) {
        if self.options.keep_wrapper {
            self.wrapper.absorb(block);
        }
        self.md5 = self.md5.or(stored_md5(block));
    }

    fn decode(&mut self, count: usize) -> Result<DecodedSamples> {
        let channels = self.descriptor.reduced_channels;
        let total = self.descriptor.total_samples;
        let limit = match total {
            Some(total) => count.min(total.saturating_sub(self.cursor) as usize),
            None => count,
        };

        let mut samples = Vec::with_capacity(limit * channels);
        let mut frames = 0;

        while frames < limit {
            if self.pending.remaining() == 0 {
                if self.refill()? {
                    continue;
                }

                if let Some(expected) = total {
                    if frames == 0 {
                        log_or_err!(
                            self.options,
                            log::Level::Error,
                            TruncatedStreamError::EarlyEnd {
                                found: self.cursor,
                                expected,
                            }
                        );
                    }
                }
                break;
            }

            let take = (limit - frames).min(self.pending.remaining());
            let start = self.pending.consumed * channels;
            samples.extend_from_slice(&self.pending.samples[start..start + take * channels]);

            self.pending.consumed += take;
            self.cursor += take as u64;
            frames += take;
        }

        Ok(DecodedSamples {
            samples,
            frames,
            channels,
        })
    }

    /// Fills `pending` from the next block group. Returns false at the end
    /// of the stream.
    fn refill(&mut self) -> Result<bool> {
        self.preserve();

        let (group, queued) = match self.queued.take() {
            Some(group) => (group, true),
            None => match self.main.next_group()? {
                Some(group) => (group, false),
                None => return Ok(false),
            },
        };

        if !queued {
            for block in &group.blocks {
                self.absorb_metadata(block);
            }
        }

        let channels = self.descriptor.reduced_channels;
        let position = self.descriptor.initial_index + self.cursor;

        if group.block_samples() == 0 || group.end_index() <= position {
            return Ok(true);
        }

        if let Some(total) = self.descriptor.total_samples.filter(|_| !queued) {
            let end = self.descriptor.initial_index + total;
            if group.end_index() > end {
                log_or_err!(
                    self.options,
                    log::Level::Error,
                    MalformedBlockError::PastEnd {
                        index: group.block_index(),
                        total,
                    }
                );
                if group.block_index() >= end {
                    return Ok(true);
                }
            }
        }

        if group.block_index() > position {
            let gap = group.block_index() - position;
            if !queued {
                log_or_err!(
                    self.options,
                    log::Level::Error,
                    TruncatedStreamError::MissingSamples {
                        expected: position,
                        found: group.block_index(),
                    }
                );
            }

            if self.descriptor.total_samples.is_none() && gap > MAX_BLOCK_SAMPLES as u64 {
                warn!(
                    "Dropping block group {} after a gap of {gap} samples",
                    group.block_index()
                );
                return Ok(true);
            }

            // silence is handed out one block's worth at a time
            let frames = gap.min(MAX_BLOCK_SAMPLES as u64) as usize;
            self.pending = Pending::silence(frames, channels);
            self.queued = Some(group);
            return Ok(true);
        }

        let skip = (position - group.block_index()) as usize;
        let found = self.decoder.output_channels(&group);
        if found != channels {
            log_or_err!(
                self.options,
                log::Level::Error,
                MalformedBlockError::ChannelCount {
                    found,
                    expected: channels,
                }
            );
            self.pending = Pending::silence(group.block_samples() as usize, channels);
            self.pending.consumed = skip;
            return Ok(true);
        }

        let correction = self.correction_for(&group)?;
        let decoded = self.decoder.decode_group(&group, correction.as_ref())?;

        self.last_group = Some(GroupSize {
            main: group.size(),
            correction: correction.as_ref().map_or(0, BlockGroup::size),
            samples: group.block_samples(),
        });

        debug!(
            "Block group {} ready, skipping {skip} of {} frames",
            group.block_index(),
            decoded.frames
        );

        self.pending = Pending {
            samples: decoded.samples,
            frames: decoded.frames,
            consumed: skip,
        };
        Ok(true)
    }

    fn correction_for(&mut self, group: &BlockGroup) -> Result<Option<BlockGroup>> {
        let hybrid = group
            .blocks
            .iter()
            .any(|b| b.flags().contains(BlockFlags::HYBRID));

        let Some(source) = self.correction.as_mut().filter(|_| hybrid) else {
            return Ok(None);
        };

        let found = source.group_at(group.block_index())?;
        if found.is_none() && self.options.output == OutputMode::Exact {
            bail!(MissingCorrectionDataError::MissingBlock(group.block_index()));
        }
        Ok(found)
    }

    fn seek(&mut self, sample: u64) -> Result<()> {
        let initial = self.descriptor.initial_index;

        if let Some(total) = self.descriptor.total_samples {
            if sample > total {
                bail!(SeekError::PastEnd {
                    target: sample,
                    total,
                });
            }

            if sample == total {
                self.pending = Pending::default();
                self.queued = None;
                self.cursor = sample;
                self.decoder.reset();
                return Ok(());
            }
        }

        let target = initial + sample;
        let offset = self
            .main
            .locate(target)
            .with_context(|| SeekError::Failed(sample))?;

        let correction_offset = match self.correction.as_mut().map(|c| c.locate(target)) {
            None => None,
            Some(Ok(offset)) => Some(offset),
            Some(Err(err)) => {
                log_or_err!(
                    self.options,
                    log::Level::Error,
                    err.context(SeekError::Correction(sample))
                );
                // `group_at` skips forward from the start by index
                Some(0)
            }
        };

        self.main.reposition(offset)?;
        if let (Some(source), Some(offset)) = (self.correction.as_mut(), correction_offset) {
            source.reposition(offset)?;
        }

        self.decoder.reset();
        self.pending = Pending::default();
        self.queued = None;
        self.cursor = sample;

        info!("Seeked to sample {sample} (block group at offset {offset})");
        Ok(())
    }
}

fn stored_md5(block: &Block) -> Option<[u8; 16]> {
    block
        .find(SubChunkKind::Md5Checksum)
        .and_then(|data| data.try_into().ok())
}

/// Decodes a whole file in one call.
pub fn read<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<DecodedStream> {
    let mut session = Session::open(path, options)?;
    let descriptor = session.descriptor()?;

    let mut samples = Vec::new();
    let mut frames = 0;
    loop {
        let decoded = session.decode(1 << 16)?;
        if decoded.frames == 0 {
            break;
        }
        samples.extend(decoded.samples);
        frames += decoded.frames;
    }

    Ok(DecodedStream {
        samples,
        frames,
        channels: descriptor.reduced_channels,
        sample_rate: descriptor.native_sample_rate,
    })
}
