use anyhow::{Context, Result, bail};
use log::{LevelFilter, debug, trace, warn};

use crate::log_or_err;
use crate::structs::block::{Block, BlockGroup};
use crate::structs::decorrelation::{DecorrState, joint_stereo_inverse};
use crate::structs::entropy::{EntropyState, Residuals, WordMode};
use crate::structs::float::{
    ExtendedStream, FloatInfo, Int32Info, fixup_integers, float_values, normalize_floats,
};
use crate::structs::header::{BlockFlags, MIN_STREAM_VERSION};
use crate::structs::hybrid::{HybridState, merge_channel};
use crate::structs::metadata::SubChunkKind;
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::checksum::SampleCrc;
use crate::utils::errors::{
    ChecksumError, MalformedBlockError, MissingCorrectionDataError, TruncatedStreamError,
    UnsupportedFeatureError,
};

/// Which reconstruction the caller accepts for hybrid streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Hybrid blocks must be completed from a correction stream.
    #[default]
    Exact,
    /// Hybrid blocks without correction data decode to their lossy version.
    Lossy,
}

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub fail_level: LevelFilter,
    pub output: OutputMode,
    /// Exponent offset for float normalisation, `None` to leave floats as coded.
    pub normalize: Option<i32>,
    /// Streams that would push the output past this many channels are skipped.
    pub max_channels: Option<usize>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            fail_level: LevelFilter::Error,
            output: OutputMode::Exact,
            normalize: None,
            max_channels: None,
        }
    }
}

/// Decodes block groups to interleaved samples.
///
/// Holds the adaptive state of every stream in the group. The decoder is
/// cheap to clone, which is how a session rolls back a failed decode.
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    options: DecodeOptions,
    state: DecoderState,
}

impl Decoder {
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            options,
            state: DecoderState::default(),
        }
    }

    /// Decodes one block group.
    ///
    /// `correction` is the matching group of the correction stream, if any.
    /// Blocks are matched by their position within the group.
    pub fn decode_group(
        &mut self,
        group: &BlockGroup,
        correction: Option<&BlockGroup>,
    ) -> Result<DecodedGroup> {
        let frames = group.block_samples() as usize;
        let channels = self.output_channels(group);
        let mut samples = vec![0i32; frames * channels];
        let mut lossy = false;

        if self.state.streams.len() < group.blocks.len() {
            self.state
                .streams
                .resize_with(group.blocks.len(), StreamState::default);
        }

        let mut offset = 0;
        for (i, block) in group.blocks.iter().enumerate() {
            let width = block.flags().channels();
            if offset + width > channels {
                break;
            }

            let wvc = correction.and_then(|c| c.blocks.get(i));
            let stream = &mut self.state.streams[i];

            let output = if !block.intact || wvc.is_some_and(|b| !b.intact) {
                None
            } else {
                match stream.decode_block(&self.options, block, wvc) {
                    Ok(output) => Some(output).filter(|o| o.intact),
                    Err(err) if self.options.fail_level == LevelFilter::Off && is_damage(&err) => {
                        warn!("Block at offset {} replaced with silence: {err:#}", block.offset);
                        None
                    }
                    Err(err) => return Err(err),
                }
            };

            match output {
                Some(output) => {
                    for (frame, values) in output.samples.chunks_exact(width).enumerate() {
                        let at = frame * channels + offset;
                        samples[at..at + width].copy_from_slice(values);
                    }
                    if output.lossy {
                        self.state.lossy_blocks += 1;
                        lossy = true;
                    }
                }
                None => {
                    self.state.errors += 1;
                    *stream = StreamState::default();
                }
            }

            offset += width;
        }

        debug!(
            "Decoded block group {}: {frames} frames, {channels} channels",
            group.block_index()
        );

        Ok(DecodedGroup {
            block_index: group.block_index(),
            frames,
            channels,
            samples,
            lossy,
        })
    }

    /// Channels `decode_group` returns for `group` under the channel limit.
    pub fn output_channels(&self, group: &BlockGroup) -> usize {
        let limit = self.options.max_channels.unwrap_or(usize::MAX).max(1);
        group
            .blocks
            .iter()
            .map(|b| b.flags().channels())
            .scan(0, |sum, n| {
                *sum += n;
                Some(*sum)
            })
            .take_while(|&sum| sum <= limit)
            .last()
            .unwrap_or(0)
    }

    /// Forgets all adaptive state, as at a seek.
    pub fn reset(&mut self) {
        self.state.streams.clear();
    }

    /// Blocks replaced with silence so far.
    pub fn errors(&self) -> usize {
        self.state.errors
    }

    /// Hybrid blocks decoded without their correction data.
    pub fn lossy_blocks(&self) -> usize {
        self.state.lossy_blocks
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }
}

/// Whether `err` comes from damaged block data. Only these are replaced
/// with silence in best-effort mode.
fn is_damage(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ChecksumError>().is_some()
        || err.downcast_ref::<TruncatedStreamError>().is_some()
        || err.downcast_ref::<MalformedBlockError>().is_some()
}

/// One decoded block group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedGroup {
    /// Block index of the first frame.
    pub block_index: u64,

    pub frames: usize,

    /// Interleave width of `samples`.
    pub channels: usize,

    /// Samples right-justified in `i32`, interleaved by channel. Float
    /// streams carry IEEE 754 bit patterns.
    pub samples: Vec<i32>,

    /// True when at least one block is the lossy version of a hybrid block.
    pub lossy: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DecoderState {
    pub streams: Vec<StreamState>,
    pub errors: usize,
    pub lossy_blocks: usize,
}

/// Adaptive state of one mono or stereo stream.
///
/// Sub-chunks overwrite the parts they carry; everything else continues
/// from the previous block of the same stream.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    /// `MONO | FALSE_STEREO` of the block that loaded this state.
    layout: Option<BlockFlags>,
    pub decorr: DecorrState,
    pub entropy: EntropyState,
    pub hybrid: HybridState,
    pub float_info: FloatInfo,
    pub int32_info: Int32Info,
}

#[derive(Debug, Default)]
struct BlockOutput {
    /// Interleaved over the block's output channels.
    samples: Vec<i32>,
    lossy: bool,
    intact: bool,
}

impl StreamState {
    fn load(&mut self, block: &Block) -> Result<()> {
        let flags = block.flags();
        let mono = flags.is_mono_data();

        for chunk in &block.chunks {
            let data = block.bytes(chunk);
            trace!("Sub-chunk {:?}: {} bytes", chunk.kind, data.len());

            match chunk.kind {
                SubChunkKind::DecorrTerms => self.decorr.read_terms(data, mono)?,
                SubChunkKind::DecorrWeights => self.decorr.read_weights(data, mono)?,
                SubChunkKind::DecorrSamples => {
                    let mut data = data;
                    if block.header.version == MIN_STREAM_VERSION
                        && flags.contains(BlockFlags::HYBRID_SHAPE)
                    {
                        let used = self.hybrid.read_legacy_shaping_errors(data, mono)?;
                        data = &data[used..];
                    }
                    self.decorr.read_samples(data, mono)?;
                }
                SubChunkKind::EntropyVars => self.entropy.read_vars(data, mono)?,
                SubChunkKind::HybridProfile => self.hybrid.read_profile(
                    data,
                    mono,
                    flags.contains(BlockFlags::HYBRID_BITRATE),
                )?,
                SubChunkKind::ShapingWeights => self.hybrid.read_shaping(data, mono)?,
                SubChunkKind::FloatInfo => self.float_info = FloatInfo::read(data)?,
                SubChunkKind::Int32Info => self.int32_info = Int32Info::read(data)?,
                SubChunkKind::DsdBlock => bail!(UnsupportedFeatureError::Dsd),
                _ => {}
            }
        }

        Ok(())
    }

    fn decode_block(
        &mut self,
        options: &DecodeOptions,
        block: &Block,
        correction: Option<&Block>,
    ) -> Result<BlockOutput> {
        let flags = block.flags();
        let index = block.header.block_index;

        if flags.contains(BlockFlags::DSD) {
            bail!(UnsupportedFeatureError::Dsd);
        }

        let layout = flags & (BlockFlags::MONO | BlockFlags::FALSE_STEREO);
        if self.layout != Some(layout) {
            *self = Self {
                layout: Some(layout),
                ..Default::default()
            };
        }

        self.load(block)
            .with_context(|| format!("Block {index} at offset {}", block.offset))?;

        let mono = flags.is_mono_data();
        let coded = if mono { 1 } else { 2 };
        let count = block.header.block_samples as usize * coded;

        if count == 0 {
            return Ok(BlockOutput {
                intact: true,
                ..Default::default()
            });
        }

        let wv = match block.find(SubChunkKind::WvBitstream) {
            Some(data) if data.len() % 2 != 0 => {
                bail!(MalformedBlockError::OddBitstream(data.len()))
            }
            Some(data) if !data.is_empty() => data,
            _ => bail!(MalformedBlockError::MissingBitstream(block.header.block_samples)),
        };

        let hybrid = flags.contains(BlockFlags::HYBRID);
        let wvc = correction
            .filter(|_| hybrid)
            .and_then(|c| c.find(SubChunkKind::WvcBitstream))
            .filter(|data| !data.is_empty());

        if hybrid && wvc.is_none() && options.output == OutputMode::Exact {
            match correction {
                None => bail!(MissingCorrectionDataError::NoCorrectionStream(index)),
                Some(_) => bail!(MissingCorrectionDataError::MissingBitstream(index)),
            }
        }

        let mut wv_reader = BsIoSliceReader::from_slice(wv);
        let mut wvc_reader = wvc.map(BsIoSliceReader::from_slice);
        let merging = wvc_reader.is_some();

        let mut lossy = Vec::with_capacity(count);
        let mut corrections = Vec::with_capacity(if merging { count } else { 0 });

        let residuals = Residuals::new(
            &mut self.entropy,
            &mut self.hybrid,
            &mut wv_reader,
            wvc_reader.as_mut(),
            WordMode::from_flags(flags),
            count,
        );
        for residual in residuals {
            let residual = residual.with_context(|| format!("Block {index} residuals"))?;
            lossy.push(residual.value);
            if merging {
                corrections.push(residual.correction);
            }
        }

        self.decorr.reconstruct(&mut lossy, !mono);

        let mut exact = merging.then(|| lossy.clone());
        if let Some(exact) = exact.as_mut() {
            let shaping = flags.contains(BlockFlags::HYBRID_SHAPE);
            let new_shaping = flags.contains(BlockFlags::NEW_SHAPING);
            let [left, right] = &mut self.hybrid.shaping;

            for (ch, state) in [left, right].into_iter().take(coded).enumerate() {
                let state = shaping.then_some((state, new_shaping));
                merge_channel(exact, &corrections, coded, ch, state);
            }
        }

        if !mono && flags.contains(BlockFlags::JOINT_STEREO) {
            joint_stereo_inverse(&mut lossy);
            if let Some(exact) = exact.as_mut() {
                joint_stereo_inverse(exact);
            }
        }

        let mut intact = true;

        let computed = SampleCrc::default().extend(&lossy).value();
        if computed != block.header.crc {
            intact = false;
            log_or_err!(
                options,
                log::Level::Error,
                ChecksumError::Samples {
                    index,
                    stored: block.header.crc,
                    computed,
                }
            );
        }

        if let (Some(exact), Some(correction)) = (exact.as_ref(), correction) {
            let computed = SampleCrc::default().extend(exact).value();
            if computed != correction.header.crc {
                intact = false;
                log_or_err!(
                    options,
                    log::Level::Error,
                    ChecksumError::Samples {
                        index,
                        stored: correction.header.crc,
                        computed,
                    }
                );
            }
        }

        let lossy_output = hybrid && exact.is_none();
        let mut samples = exact.unwrap_or(lossy);

        let new_wvx = block
            .find(SubChunkKind::WvxNewBitstream)
            .or_else(|| correction.and_then(|c| c.find(SubChunkKind::WvxNewBitstream)));
        if new_wvx.is_some() && !lossy_output {
            bail!(UnsupportedFeatureError::ExtendedBitstream(index));
        }

        let wvx = block
            .find(SubChunkKind::WvxBitstream)
            .or_else(|| correction.and_then(|c| c.find(SubChunkKind::WvxBitstream)))
            .filter(|_| !lossy_output);
        let mut extended = wvx.map(ExtendedStream::open).transpose()?;

        if flags.contains(BlockFlags::FLOAT_DATA) {
            float_values(&mut samples, &self.float_info, extended.as_mut())?;
            if let Some(offset) = options.normalize {
                normalize_floats(&mut samples, 127 - self.float_info.norm_exp + offset);
            }
        } else {
            fixup_integers(
                &mut samples,
                flags,
                &self.int32_info,
                extended.as_mut(),
                lossy_output,
            )?;
        }

        if extended.as_ref().is_some_and(|e| !e.crc_matches()) {
            intact = false;
            log_or_err!(options, log::Level::Error, ChecksumError::Extended { index });
        }

        if flags.contains(BlockFlags::FALSE_STEREO) {
            samples = samples.iter().flat_map(|&s| [s, s]).collect();
        }

        Ok(BlockOutput {
            samples,
            lossy: lossy_output,
            intact,
        })
    }
}
