#[macro_export]
macro_rules! log_or_err {
    ($state:expr, $level:expr, $err:expr $(,)?) => {{
        if $level <= $state.fail_level {
            return Err($err.into());
        } else {
            match $level {
                ::log::Level::Error => ::log::error!("{}", $err),
                ::log::Level::Warn => ::log::warn!("{}", $err),
                ::log::Level::Info => ::log::info!("{}", $err),
                ::log::Level::Debug => ::log::debug!("{}", $err),
                ::log::Level::Trace => ::log::trace!("{}", $err),
            }
        }
    }};
}

#[derive(thiserror::Error, Debug)]
pub enum OpenError {
    #[error("Cannot open {path}")]
    Io { path: String },

    #[error("Correction file required but not found: {0}")]
    MissingCorrectionFile(String),

    #[error("No WavPack blocks found")]
    NoBlocks,

    #[error("Cannot open stream")]
    InvalidStream,
}

#[derive(thiserror::Error, Debug)]
pub enum TruncatedStreamError {
    #[error("Bitstream exhausted: {requested} bits requested at bit {position}")]
    Bits { requested: u32, position: u64 },

    #[error("Bitstream exhausted while skipping {0} bits")]
    Skip(u64),

    #[error("Stream ended inside a block group at offset {0}")]
    PartialGroup(u64),

    #[error("Stream ended after {found} samples, expected {expected}")]
    EarlyEnd { found: u64, expected: u64 },

    #[error("Samples {expected}..{found} are missing from the stream")]
    MissingSamples { expected: u64, found: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum MalformedBlockError {
    #[error("Invalid block header at offset {0}")]
    InvalidHeader(u64),

    #[error("Sub-chunk 0x{id:02x} overruns the block ({len} bytes at {offset})")]
    SubChunkOverrun { id: u8, offset: usize, len: usize },

    #[error("Invalid {what} sub-chunk size: {size} bytes")]
    SubChunkSize { what: &'static str, size: usize },

    #[error("Invalid decorrelation term {0}")]
    InvalidTerm(i32),

    #[error("Cross-channel term {0} in a mono block")]
    CrossTermInMono(i32),

    #[error("Too many decorrelation terms: {0}")]
    TooManyTerms(usize),

    #[error("More decorrelation weights ({weights}) than terms ({terms})")]
    TooManyWeights { weights: usize, terms: usize },

    #[error("Decorrelation samples do not fit the terms")]
    DecorrSamples,

    #[error("Unary code longer than {0} ones")]
    UnaryOverflow(u32),

    #[error("Residual magnitude overflows 32 bits")]
    MagnitudeOverflow,

    #[error("Block has {0} samples but no WavPack bitstream")]
    MissingBitstream(u32),

    #[error("Bitstream sub-chunk has odd size {0}")]
    OddBitstream(usize),

    #[error("Invalid channel info: {0}")]
    ChannelInfo(&'static str),

    #[error("Block group mismatch: block {index} has {samples} samples, expected {expected_index} with {expected_samples}")]
    GroupMismatch {
        index: u64,
        samples: u32,
        expected_index: u64,
        expected_samples: u32,
    },

    #[error("Block group decodes {found} channels, descriptor has {expected}")]
    ChannelCount { found: usize, expected: usize },

    #[error("Block group at {offset} has no initial block")]
    MissingInitial { offset: u64 },

    #[error("Block {index} extends past the stream length {total}")]
    PastEnd { index: u64, total: u64 },

    #[error("Invalid shift of {0} bits")]
    InvalidShift(u32),

    #[error("Invalid float info")]
    FloatInfo,
}

#[derive(thiserror::Error, Debug)]
pub enum ChecksumError {
    #[error("Block checksum mismatch at offset {offset}: stored {stored:#x}, computed {computed:#x}")]
    Block {
        offset: u64,
        stored: u32,
        computed: u32,
    },

    #[error("Block at offset {0} is flagged for a checksum but has none")]
    MissingBlockChecksum(u64),

    #[error("Invalid checksum sub-chunk")]
    InvalidBlockChecksum,

    #[error("Sample CRC mismatch in block {index}: stored {stored:#x}, computed {computed:#x}")]
    Samples { index: u64, stored: u32, computed: u32 },

    #[error("Extended precision CRC mismatch in block {index}")]
    Extended { index: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum UnsupportedFeatureError {
    #[error("Unsupported stream version 0x{0:03x}")]
    Version(u16),

    #[error("DSD audio is not supported")]
    Dsd,

    #[error("Unknown mandatory sub-chunk 0x{0:02x}")]
    SubChunk(u8),

    #[error("Unsupported bytes per sample: {0}")]
    BytesPerSample(u32),

    #[error("Block {0} carries extended precision data in an unsupported layout")]
    ExtendedBitstream(u64),
}

#[derive(thiserror::Error, Debug)]
pub enum MissingCorrectionDataError {
    #[error("Block {0} is hybrid-lossy and no correction stream is available")]
    NoCorrectionStream(u64),

    #[error("Correction stream has no block for index {0}")]
    MissingBlock(u64),

    #[error("Correction block {0} has no correction bitstream")]
    MissingBitstream(u64),
}

#[derive(thiserror::Error, Debug)]
pub enum UseAfterCloseError {
    #[error("Session used after close: {0}")]
    Closed(&'static str),
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("Decode failed ({errors} errors so far)")]
    Failed { errors: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum SeekError {
    #[error("Seek target {target} is past the end of the stream ({total} samples)")]
    PastEnd { target: u64, total: u64 },

    #[error("No block contains sample {0}")]
    NotFound(u64),

    #[error("Seek to sample {0} failed")]
    Failed(u64),

    #[error("Correction stream cannot be positioned at sample {0}")]
    Correction(u64),
}

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("Insufficient buffer data for block extraction")]
    InsufficientData,

    #[error("Skipped {skipped} bytes of unrecognised data before offset {offset}")]
    Resync { skipped: u64, offset: u64 },
}
