#![doc = include_str!("../README.md")]
//!
//! ## Technical Overview
//!
//! Parser and decoder for WavPack 4 block streams (stream versions `0x402` to `0x410`).
//!
//! ### Bitstream Organization
//!
//! **External Structure**: Self-describing blocks, each starting with a 32-byte `wvpk` header.
//! **Internal Structure**: Sub-chunks carrying decorrelation, entropy and hybrid state plus
//! the coded residuals.
//!
//! ### Block Groups
//!
//! Each block holds one mono or stereo stream. Multichannel audio is a group of blocks
//! sharing one block index, from the `INITIAL_BLOCK` to the `FINAL_BLOCK`.
//!
//! ### Hybrid Mode
//!
//! Hybrid streams store a lossy approximation in the `.wv` file and the difference to the
//! exact signal in a separate `.wvc` correction file. Without the correction file the
//! lossy version can still be decoded on request.
//!
//! ## Quick Start
//!
//! Steps for processing a file:
//!
//! 1. Open the file with [`process::session::Session::open`]
//! 2. Inspect the stream with [`process::session::Session::descriptor`]
//! 3. Decode frames with [`process::session::Session::decode`]
//!
//! ```rust,no_run
//! use wavpack::process::session::{OpenOptions, Session};
//!
//! let mut session = Session::open("track.wv", OpenOptions::default())?;
//! let descriptor = session.descriptor()?;
//!
//! loop {
//!     let decoded = session.decode(4096)?;
//!     if decoded.frames == 0 {
//!         break;
//!     }
//!
//!     // Interleaved samples, right-justified in i32
//!     let pcm_samples = &decoded.samples;
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Lower-level access is available through [`process::extract::Extractor`],
//! [`process::parse::Parser`] and [`process::decode::Decoder`].

/// Processing functionality for WavPack streams.
///
/// 1. **Block Extraction** ([`process::extract`]): Finds blocks in stream data.
///
/// 2. **Parsing** ([`process::parse`]): Frames headers and sub-chunks.
///
/// 3. **Decoding** ([`process::decode`]): Entropy decoding, decorrelation and hybrid merge.
///
/// 4. **Sessions** ([`process::session`]): File-level decoding and seeking.
pub mod process;

/// Data structures representing WavPack format components.
///
/// - **Headers** ([`structs::header`]): Block header and flags
/// - **Sub-chunks** ([`structs::metadata`]): Metadata framing
/// - **Blocks** ([`structs::block`]): Parsed blocks and block groups
/// - **Entropy** ([`structs::entropy`]): Adaptive residual decoding
/// - **Decorrelation** ([`structs::decorrelation`]): Prediction passes
/// - **Hybrid** ([`structs::hybrid`]): Error limits and noise shaping
/// - **Descriptor** ([`structs::descriptor`]): Stream properties
pub mod structs;

/// Utility functions and supporting infrastructure.
///
/// - **Bitstream I/O** ([`utils::bitstream_io`]): Bit-level reading
/// - **Checksums** ([`utils::checksum`]): Block checksums and sample CRCs
/// - **Math** ([`utils::math`]): Fixed-point log and exp
/// - **Error Handling** ([`utils::errors`]): Error types
pub mod utils;
