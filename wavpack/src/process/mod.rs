/// Block extraction from byte streams.
///
/// Provides the [`Extractor`](extract::Extractor) for finding block headers and
/// extracting individual [`RawBlock`](extract::RawBlock) objects from continuous
/// stream data, skipping tags and garbage in between.
pub mod extract;

/// Block parsing into structured blocks.
///
/// Provides the [`Parser`](parse::Parser) for converting raw blocks into
/// [`Block`](crate::structs::block::Block) objects with framed sub-chunks.
pub mod parse;

/// Audio decoding to PCM samples.
///
/// Provides the [`Decoder`](decode::Decoder) for converting block groups into
/// [`DecodedGroup`](decode::DecodedGroup) objects containing interleaved samples.
pub mod decode;

/// Block groups and seeking over a reader.
///
/// Provides the [`BlockSource`](source::BlockSource), which drives extraction and
/// parsing from any `Read + Seek` and keeps the index used for seeking.
pub mod source;

/// Whole-file decoding sessions.
///
/// Provides the [`Session`](session::Session) for opening a stream with its
/// optional correction stream, decoding frames and seeking.
pub mod session;
