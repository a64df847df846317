//! Stream-wide properties gathered from the first block group.

use anyhow::{Result, bail};
use bitflags::bitflags;

use crate::structs::block::{Block, BlockGroup};
use crate::structs::float::FloatInfo;
use crate::structs::header::BlockFlags;
use crate::structs::metadata::SubChunkKind;
use crate::utils::errors::{MalformedBlockError, UnsupportedFeatureError};

pub const MAX_CHANNELS: usize = 4096;

bitflags! {
    /// Summary of how the stream was encoded.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModeFlags: u32 {
        const WVC = 0x1;
        const LOSSLESS = 0x2;
        const HYBRID = 0x4;
        const FLOAT = 0x8;
        const HIGH = 0x20;
        const FAST = 0x40;
        const EXTRA = 0x80;
        const SFX = 0x200;
        const VERY_HIGH = 0x400;
        const MD5 = 0x800;
        const XMODE = 0x7000;
        const DNS = 0x8000;
    }
}

bitflags! {
    /// Encoder configuration. The low byte mirrors the first block's
    /// header flags, the rest comes from the config sub-chunk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConfigFlags: u32 {
        const HYBRID = 0x8;
        const JOINT_STEREO = 0x10;
        const CROSS_DECORR = 0x20;
        const HYBRID_SHAPE = 0x40;
        const FLOAT_DATA = 0x80;
        const FAST = 0x200;
        const HIGH = 0x800;
        const VERY_HIGH = 0x1000;
        const BITRATE_KBPS = 0x2000;
        const AUTO_SHAPING = 0x4000;
        const SHAPE_OVERRIDE = 0x8000;
        const JOINT_OVERRIDE = 0x1_0000;
        const DYNAMIC_SHAPING = 0x2_0000;
        const CREATE_EXE = 0x4_0000;
        const CREATE_WVC = 0x8_0000;
        const OPTIMIZE_WVC = 0x10_0000;
        const COMPATIBLE_WRITE = 0x40_0000;
        const CALC_NOISE = 0x80_0000;
        const LOSSY_MODE = 0x100_0000;
        const EXTRA_MODE = 0x200_0000;
        const SKIP_WVX = 0x400_0000;
        const MD5_CHECKSUM = 0x800_0000;
        const MERGE_BLOCKS = 0x1000_0000;
        const PAIR_UNDEF_CHANS = 0x2000_0000;
        const OPTIMIZE_32BIT = 0x4000_0000;
        const OPTIMIZE_MONO = 0x8000_0000;

        const _ = !0;
    }
}

bitflags! {
    /// Properties of the source file the stream was encoded from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QualifyMode: u32 {
        const BIG_ENDIAN = 0x1;
        const SIGNED_BYTES = 0x2;
        const UNSIGNED_WORDS = 0x4;
        const REORDERED_CHANS = 0x8;
        const DSD_LSB_FIRST = 0x10;
        const DSD_MSB_FIRST = 0x20;
        const DSD_IN_BLOCKS = 0x40;
        const DSD_AUDIO = 0x80;

        const _ = !0;
    }
}

/// Container format the stream was converted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    #[default]
    Wav,
    W64,
    Caf,
    Dff,
    Dsf,
    Aif,
    Other(u8),
}

impl From<u8> for FileFormat {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Wav,
            1 => Self::W64,
            2 => Self::Caf,
            3 => Self::Dff,
            4 => Self::Dsf,
            5 => Self::Aif,
            other => Self::Other(other),
        }
    }
}

/// What a [`Session`](crate::process::session::Session) decodes.
///
/// Built once at open time; later blocks never change it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Channels in the stream.
    pub channels: usize,
    /// Channels actually returned by `decode`, after the `max_channels` limit.
    pub reduced_channels: usize,
    /// Speaker mask in `WAVEFORMATEXTENSIBLE` order.
    pub channel_mask: u32,
    pub sample_rate: u32,
    pub native_sample_rate: u32,
    /// Valid bits in each sample, before any shift back to full width.
    pub bits_per_sample: u32,
    pub bytes_per_sample: u32,
    /// Samples per channel, `None` when the encoder did not know.
    pub total_samples: Option<u64>,
    /// Block index of the first block; positions count from here.
    pub initial_index: u64,
    pub float_data: bool,
    pub float_norm_exp: i32,
    pub hybrid: bool,
    pub lossless: bool,
    pub version: u16,
    pub config: ConfigFlags,
    /// Extra mode level, zero unless `ConfigFlags::EXTRA_MODE` is set.
    pub xmode: u8,
    pub qualify_mode: QualifyMode,
    pub file_format: FileFormat,
    pub file_extension: String,
    /// Layout tag in the upper bits, channel count in the low 8.
    pub channel_layout: u32,
    pub channel_reordering: Vec<u8>,
    pub channel_identities: Vec<u8>,
    /// Blocks in each block group.
    pub streams: usize,
    pub md5: Option<[u8; 16]>,
}

impl StreamDescriptor {
    pub fn from_group(group: &BlockGroup, max_channels: Option<usize>) -> Result<Self> {
        let Some(first) = group.blocks.first() else {
            bail!(MalformedBlockError::MissingInitial { offset: 0 });
        };

        let flags = first.flags();
        if flags.contains(BlockFlags::DSD) {
            bail!(UnsupportedFeatureError::Dsd);
        }

        let mut descriptor = Self {
            channels: 0,
            reduced_channels: 0,
            channel_mask: 0,
            sample_rate: flags.sample_rate().unwrap_or(44100),
            native_sample_rate: 0,
            bits_per_sample: flags.bytes_per_sample() * 8 - flags.shift(),
            bytes_per_sample: flags.bytes_per_sample(),
            total_samples: first.header.total_samples,
            initial_index: first.header.block_index,
            float_data: flags.contains(BlockFlags::FLOAT_DATA),
            float_norm_exp: 0,
            hybrid: flags.contains(BlockFlags::HYBRID),
            lossless: !flags.contains(BlockFlags::HYBRID),
            version: first.header.version,
            config: ConfigFlags::from_bits_retain(flags.bits() & 0xff),
            xmode: 0,
            qualify_mode: QualifyMode::empty(),
            file_format: FileFormat::Wav,
            file_extension: String::new(),
            channel_layout: 0,
            channel_reordering: Vec::new(),
            channel_identities: Vec::new(),
            streams: group.blocks.len(),
            md5: None,
        };

        for block in &group.blocks {
            descriptor.update_from_block(block)?;
        }

        if descriptor.channels == 0 {
            descriptor.channels = group.channels();
            descriptor.channel_mask = if descriptor.channels == 1 { 0x4 } else { 0x3 };
        }

        if descriptor.channels < group.channels() {
            bail!(MalformedBlockError::ChannelCount {
                found: group.channels(),
                expected: descriptor.channels,
            });
        }

        descriptor.reduced_channels = match max_channels {
            Some(max) => group
                .blocks
                .iter()
                .map(|b| b.flags().channels())
                .scan(0, |sum, n| {
                    *sum += n;
                    Some(*sum)
                })
                .take_while(|&sum| sum <= max.max(1))
                .last()
                .unwrap_or(0),
            None => descriptor.channels,
        };

        descriptor.native_sample_rate = descriptor.sample_rate;
        Ok(descriptor)
    }

    /// Applies the stream-level sub-chunks of one block.
    pub fn update_from_block(&mut self, block: &Block) -> Result<()> {
        for chunk in &block.chunks {
            let data = block.bytes(chunk);

            match chunk.kind {
                SubChunkKind::ChannelInfo => self.read_channel_info(data)?,
                SubChunkKind::ConfigBlock => self.read_config(data),
                SubChunkKind::NewConfigBlock => self.read_new_config(data)?,
                SubChunkKind::SampleRate => {
                    if let [b0, b1, b2, rest @ ..] = data {
                        let mut rate = u32::from_le_bytes([*b0, *b1, *b2, 0]);
                        if let [b3] = rest {
                            rate |= ((b3 & 0x7f) as u32) << 24;
                        }
                        if rest.len() <= 1 {
                            self.sample_rate = rate;
                        }
                    }
                }
                SubChunkKind::FloatInfo => {
                    self.float_norm_exp = FloatInfo::read(data)?.norm_exp;
                }
                SubChunkKind::Md5Checksum => {
                    if let Ok(sum) = <[u8; 16]>::try_from(data) {
                        self.md5 = Some(sum);
                    }
                }
                SubChunkKind::AltExtension => {
                    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                    self.file_extension = String::from_utf8_lossy(&data[..end.min(7)]).into();
                }
                SubChunkKind::ChannelIdentities => {
                    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                    self.channel_identities = data[..end].to_vec();
                }
                SubChunkKind::DsdBlock => bail!(UnsupportedFeatureError::Dsd),
                _ => {}
            }
        }

        Ok(())
    }

    fn read_channel_info(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > 7 {
            bail!(MalformedBlockError::ChannelInfo("size"));
        }

        if self.channels != 0 {
            return Ok(());
        }

        let (channels, streams, mask) = if data.len() >= 6 {
            let channels = (data[0] as usize | ((data[2] & 0xf) as usize) << 8) + 1;
            let streams = (data[1] as usize | ((data[2] & 0xf0) as usize) << 4) + 1;
            let mask = data[3..]
                .iter()
                .enumerate()
                .fold(0u32, |mask, (i, &b)| mask | (b as u32) << (i * 8));
            (channels, Some(streams), mask)
        } else {
            let mask = data[1..]
                .iter()
                .enumerate()
                .fold(0u32, |mask, (i, &b)| mask | (b as u32) << (i * 8));
            (data[0] as usize, None, mask)
        };

        if streams.is_some_and(|streams| channels < streams) {
            bail!(MalformedBlockError::ChannelInfo("fewer channels than streams"));
        }
        if channels > MAX_CHANNELS {
            bail!(MalformedBlockError::ChannelInfo("too many channels"));
        }
        if mask.count_ones() as usize > channels {
            bail!(MalformedBlockError::ChannelInfo("mask has more speakers than channels"));
        }

        self.channels = channels;
        self.channel_mask = mask;
        Ok(())
    }

    fn read_config(&mut self, data: &[u8]) {
        let [b1, b2, b3, rest @ ..] = data else {
            return;
        };

        let high = u32::from_le_bytes([0, *b1, *b2, *b3]);
        self.config = ConfigFlags::from_bits_retain(self.config.bits() & 0xff | high);

        let mut rest = rest.iter();
        if self.config.contains(ConfigFlags::EXTRA_MODE) {
            if let Some(&xmode) = rest.next() {
                self.xmode = xmode;
            }
        }
        if let Some(&qmode) = rest.next() {
            self.qualify_mode = QualifyMode::from_bits_retain(
                self.qualify_mode.bits() & !0xff | qmode as u32,
            );
        }
    }

    fn read_new_config(&mut self, data: &[u8]) -> Result<()> {
        self.file_format = FileFormat::Wav;
        self.qualify_mode = QualifyMode::from_bits_retain(self.qualify_mode.bits() & !0xff);
        self.channel_layout = 0;
        self.channel_reordering.clear();

        let [format, qmode, rest @ ..] = data else {
            return Ok(());
        };

        self.file_format = FileFormat::from(*format);
        self.qualify_mode =
            QualifyMode::from_bits_retain(self.qualify_mode.bits() | *qmode as u32);

        let Some((&layout, rest)) = rest.split_first() else {
            return Ok(());
        };
        self.channel_layout = (layout as u32) << 16;

        let Some((&count, order)) = rest.split_first() else {
            self.channel_layout += self.channels as u32;
            return Ok(());
        };
        self.channel_layout += count as u32;

        if !order.is_empty() {
            if order.len() > count as usize {
                bail!(MalformedBlockError::ChannelInfo("reorder table longer than layout"));
            }

            self.channel_reordering = (0..count)
                .map(|i| match order.get(i as usize) {
                    Some(&c) if c < count => c,
                    Some(_) => 0,
                    None => i,
                })
                .collect();
        }

        Ok(())
    }

    /// Mode summary as of now; `lossy_blocks` and `correction` reflect what
    /// decoding has seen so far.
    pub fn mode(&self, correction: bool, lossy_blocks: bool) -> ModeFlags {
        let config = self.config;
        let mut mode = ModeFlags::empty();

        if config.contains(ConfigFlags::HYBRID) {
            mode |= ModeFlags::HYBRID;
        } else if !config.contains(ConfigFlags::LOSSY_MODE) {
            mode |= ModeFlags::LOSSLESS;
        }

        if correction {
            mode |= ModeFlags::LOSSLESS | ModeFlags::WVC;
        }
        if lossy_blocks {
            mode -= ModeFlags::LOSSLESS;
        }
        if config.contains(ConfigFlags::FLOAT_DATA) {
            mode |= ModeFlags::FLOAT;
        }
        if config.intersects(ConfigFlags::HIGH | ConfigFlags::VERY_HIGH) {
            mode |= ModeFlags::HIGH;
            if config.contains(ConfigFlags::VERY_HIGH) || self.version < 0x405 {
                mode |= ModeFlags::VERY_HIGH;
            }
        }
        if config.contains(ConfigFlags::FAST) {
            mode |= ModeFlags::FAST;
        }
        if config.contains(ConfigFlags::EXTRA_MODE) {
            mode |= ModeFlags::EXTRA | ModeFlags::from_bits_truncate((self.xmode as u32) << 12);
        }
        if config.contains(ConfigFlags::CREATE_EXE) {
            mode |= ModeFlags::SFX;
        }
        if config.contains(ConfigFlags::MD5_CHECKSUM) {
            mode |= ModeFlags::MD5;
        }
        if config.contains(
            ConfigFlags::HYBRID | ConfigFlags::DYNAMIC_SHAPING | ConfigFlags::HYBRID_SHAPE,
        ) {
            mode |= ModeFlags::DNS;
        }

        mode
    }

    /// File extension of the source, `"wav"` unless the stream names one.
    pub fn extension(&self) -> &str {
        if self.file_extension.is_empty() {
            "wav"
        } else {
            &self.file_extension
        }
    }
}
