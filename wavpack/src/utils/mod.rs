//! Utility functions and supporting infrastructure.
//!
//! Provides bitstream reading, block and sample checksums, the fixed-point
//! log/exp arithmetic shared by the entropy and decorrelation stages, and
//! error handling.

pub mod bitstream_io;
pub mod checksum;
pub mod errors;
pub mod math;
