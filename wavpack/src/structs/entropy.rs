//! Adaptive entropy decoding of residuals.
//!
//! Each residual is coded as a unary "ones count" selecting one of several
//! magnitude ranges, sized by three running medians per channel, then an
//! offset within the range and a sign bit. Long stretches of silence are
//! coded as zero runs once both channels' first median has collapsed.
//!
//! In hybrid mode the offset is replaced by a bisection that stops once the
//! range is narrower than the channel's error limit. The matching
//! correction stream carries the exact offset within that final range.

use anyhow::{Result, bail};

use crate::structs::header::BlockFlags;
use crate::structs::hybrid::HybridState;
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::MalformedBlockError;
use crate::utils::math::{exp2s, log2};

pub const LIMIT_ONES: u32 = 16;
const MAX_RUN_BITS: u32 = 33;
const MAX_MAGNITUDE: u64 = i32::MAX as u64;

/// The three running medians of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Medians(pub [u32; 3]);

impl Medians {
    #[inline(always)]
    pub fn get(&self, n: usize) -> u32 {
        (self.0[n] >> 4) + 1
    }

    #[inline(always)]
    pub fn dec(&mut self, n: usize) {
        let div = 128 >> n;
        let m = self.0[n];
        self.0[n] = m.wrapping_sub((m.wrapping_add(div - 2) / div).wrapping_mul(2));
    }

    #[inline(always)]
    pub fn inc(&mut self, n: usize) {
        let div = 128 >> n;
        let m = self.0[n];
        self.0[n] = m.wrapping_add((m.wrapping_add(div) / div).wrapping_mul(5));
    }
}

/// Per-stream entropy state carried from block to block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntropyState {
    pub medians: [Medians; 2],
}

impl EntropyState {
    /// Loads the medians from an entropy variables sub-chunk.
    pub fn read_vars(&mut self, data: &[u8], mono: bool) -> Result<()> {
        let expected = if mono { 6 } else { 12 };
        if data.len() != expected {
            bail!(MalformedBlockError::SubChunkSize {
                what: "entropy variables",
                size: data.len(),
            });
        }

        for (i, word) in data.chunks_exact(2).enumerate() {
            let value = u16::from_le_bytes([word[0], word[1]]) as i32;
            self.medians[i / 3].0[i % 3] = exp2s(value) as u32;
        }

        Ok(())
    }
}

/// Block-level coding switches taken from the header flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WordMode {
    pub stereo: bool,
    pub hybrid: bool,
    pub bitrate: bool,
    pub balance: bool,
}

impl WordMode {
    pub fn from_flags(flags: BlockFlags) -> Self {
        Self {
            stereo: !flags.is_mono_data(),
            hybrid: flags.contains(BlockFlags::HYBRID),
            bitrate: flags.contains(BlockFlags::HYBRID_BITRATE),
            balance: flags.contains(BlockFlags::HYBRID_BALANCE),
        }
    }
}

/// One decoded residual and, when a correction stream is present, the
/// signed offset from the lossy value to the exact one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Residual {
    pub value: i32,
    pub correction: i32,
}

/// Lazily decodes the residuals of one block.
///
/// Yields exactly `count` values (interleaved for stereo), or stops after
/// the first error. The holding and zero-run state lives only as long as
/// the iterator since it is tied to the block's bitstream.
pub struct Residuals<'a, 'b> {
    entropy: &'a mut EntropyState,
    hybrid: &'a mut HybridState,
    wv: &'a mut BsIoSliceReader<'b>,
    wvc: Option<&'a mut BsIoSliceReader<'b>>,
    mode: WordMode,
    zeros_acc: u32,
    holding_one: bool,
    holding_zero: bool,
    index: usize,
    count: usize,
    failed: bool,
}

impl<'a, 'b> Residuals<'a, 'b> {
    pub fn new(
        entropy: &'a mut EntropyState,
        hybrid: &'a mut HybridState,
        wv: &'a mut BsIoSliceReader<'b>,
        wvc: Option<&'a mut BsIoSliceReader<'b>>,
        mode: WordMode,
        count: usize,
    ) -> Self {
        Self {
            entropy,
            hybrid,
            wv,
            wvc,
            mode,
            zeros_acc: 0,
            holding_one: false,
            holding_zero: false,
            index: 0,
            count,
            failed: false,
        }
    }

    /// Unary-prefixed length used by zero runs and escaped ones counts.
    fn read_escape(&mut self) -> Result<u32> {
        let bits = self.wv.get_unary(MAX_RUN_BITS)?;

        if bits == MAX_RUN_BITS {
            bail!(MalformedBlockError::UnaryOverflow(MAX_RUN_BITS));
        }

        if bits < 2 {
            return Ok(bits);
        }

        let low: u32 = self.wv.get_n(bits - 1)?;
        Ok(low | 1 << (bits - 1))
    }

    fn decay(&mut self, chan: usize) {
        let channel = &mut self.hybrid.channels[chan];
        channel.slow_level -= (channel.slow_level + 128) >> 8;
    }

    fn read_word(&mut self, chan: usize) -> Result<Residual> {
        let medians = &self.entropy.medians;
        if !self.holding_zero && !self.holding_one && medians[0].0[0] < 2 && medians[1].0[0] < 2
        {
            if self.zeros_acc > 0 {
                self.zeros_acc -= 1;
                if self.zeros_acc > 0 {
                    self.decay(chan);
                    return Ok(Residual::default());
                }
            } else {
                self.zeros_acc = self.read_escape()?;
                if self.zeros_acc > 0 {
                    self.decay(chan);
                    self.entropy.medians = [Medians::default(); 2];
                    return Ok(Residual::default());
                }
            }
        }

        let ones = if self.holding_zero {
            self.holding_zero = false;
            0
        } else {
            let mut count = self.wv.get_unary(LIMIT_ONES + 1)?;

            if count == LIMIT_ONES + 1 {
                bail!(MalformedBlockError::UnaryOverflow(LIMIT_ONES + 1));
            }

            if count == LIMIT_ONES {
                count = self
                    .read_escape()?
                    .checked_add(LIMIT_ONES)
                    .ok_or(MalformedBlockError::MagnitudeOverflow)?;
            }

            let ones = if self.holding_one {
                (count >> 1) + 1
            } else {
                count >> 1
            };
            self.holding_one = count & 1 != 0;
            self.holding_zero = !self.holding_one;
            ones
        };

        if self.mode.hybrid && chan == 0 {
            self.hybrid
                .update_error_limit(self.mode.stereo, self.mode.bitrate, self.mode.balance);
        }

        let m = &mut self.entropy.medians[chan];
        let (low, high) = match ones {
            0 => {
                let high = m.get(0) as u64 - 1;
                m.dec(0);
                (0, high)
            }
            1 => {
                let low = m.get(0) as u64;
                m.inc(0);
                let high = low + m.get(1) as u64 - 1;
                m.dec(1);
                (low, high)
            }
            _ => {
                let mut low = m.get(0) as u64;
                m.inc(0);
                low += m.get(1) as u64;
                m.inc(1);

                if ones == 2 {
                    let high = low + m.get(2) as u64 - 1;
                    m.dec(2);
                    (low, high)
                } else {
                    low += (ones as u64 - 2) * m.get(2) as u64;
                    let high = low + m.get(2) as u64 - 1;
                    m.inc(2);
                    (low, high)
                }
            }
        };

        if high > MAX_MAGNITUDE {
            bail!(MalformedBlockError::MagnitudeOverflow);
        }

        let (mut low, mut high) = (low as u32, high as u32);
        let error_limit = self.hybrid.channels[chan].error_limit;

        let mid = if error_limit == 0 {
            low + read_code(self.wv, high - low)?
        } else {
            let mut mid = (high + low + 1) >> 1;
            while high - low > error_limit {
                if self.wv.get()? {
                    low = mid;
                } else {
                    high = mid - 1;
                }
                mid = (high + low + 1) >> 1;
            }
            mid
        };

        let sign = self.wv.get()?;

        let mut correction = 0;
        if let Some(wvc) = self.wvc.as_deref_mut() {
            if error_limit != 0 {
                let value = low + read_code(wvc, high - low)?;
                correction = if sign {
                    mid as i32 - value as i32
                } else {
                    value as i32 - mid as i32
                };
            }
        }

        if self.mode.bitrate {
            let channel = &mut self.hybrid.channels[chan];
            channel.slow_level -= (channel.slow_level + 128) >> 8;
            channel.slow_level += log2(mid);
        }

        let value = if sign { !(mid as i32) } else { mid as i32 };
        Ok(Residual { value, correction })
    }
}

impl Iterator for Residuals<'_, '_> {
    type Item = Result<Residual>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.count {
            return None;
        }

        let chan = if self.mode.stereo { self.index & 1 } else { 0 };
        let word = self.read_word(chan);

        self.index += 1;
        if word.is_err() {
            self.failed = true;
        }

        Some(word)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.failed { 0 } else { self.count - self.index };
        (0, Some(remaining))
    }
}

/// Truncated binary code for a value in `0..=max_code`.
pub fn read_code(reader: &mut BsIoSliceReader, max_code: u32) -> Result<u32> {
    if max_code < 2 {
        return if max_code == 0 {
            Ok(0)
        } else {
            Ok(reader.get()? as u32)
        };
    }

    let bits = 32 - max_code.leading_zeros();
    let extras = ((1u64 << bits) - max_code as u64 - 1) as u32;
    let mut code: u32 = reader.get_n(bits - 1)?;

    if code >= extras {
        code = (code << 1) - extras + reader.get()? as u32;
    }

    Ok(code)
}
