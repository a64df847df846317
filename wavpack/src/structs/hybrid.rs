//! Hybrid mode state and correction merging.
//!
//! A hybrid block codes each residual only to within an error limit derived
//! from a slowly varying bitrate target. A correction block in the paired
//! `.wvc` stream supplies the remaining offsets, which are added back after
//! decorrelation, optionally through a noise-shaping filter.

use anyhow::{Result, bail};

use crate::structs::decorrelation::apply_weight;
use crate::utils::errors::MalformedBlockError;
use crate::utils::math::{exp2s, restore_weight};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HybridChannel {
    pub slow_level: i32,
    pub bitrate_acc: i32,
    pub bitrate_delta: i32,
    pub error_limit: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShapingChannel {
    pub acc: i32,
    pub delta: i32,
    pub error: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HybridState {
    pub channels: [HybridChannel; 2],
    pub shaping: [ShapingChannel; 2],
}

fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

impl HybridState {
    pub fn read_profile(&mut self, data: &[u8], mono: bool, bitrate: bool) -> Result<()> {
        let channels = if mono { 1 } else { 2 };
        let step = channels * 2;
        let invalid = || MalformedBlockError::SubChunkSize {
            what: "hybrid profile",
            size: data.len(),
        };
        let mut pos = 0;

        if bitrate {
            if data.len() < step {
                bail!(invalid());
            }
            for ch in 0..channels {
                self.channels[ch].slow_level = exp2s(le16(data, pos) as i32);
                pos += 2;
            }
        }

        if data.len() < pos + step {
            bail!(invalid());
        }
        for ch in 0..channels {
            self.channels[ch].bitrate_acc = (le16(data, pos) as i32).wrapping_shl(16);
            pos += 2;
        }

        if pos < data.len() {
            if data.len() != pos + step {
                bail!(invalid());
            }
            for ch in 0..channels {
                self.channels[ch].bitrate_delta = exp2s(le16(data, pos) as i16 as i32);
                pos += 2;
            }
        } else {
            self.channels[0].bitrate_delta = 0;
            self.channels[1].bitrate_delta = 0;
        }

        Ok(())
    }

    pub fn read_shaping(&mut self, data: &[u8], mono: bool) -> Result<()> {
        if data.len() == 2 {
            self.shaping[0].acc = restore_weight(data[0] as i8) << 16;
            self.shaping[1].acc = restore_weight(data[1] as i8) << 16;
            return Ok(());
        }

        let channels = if mono { 1 } else { 2 };
        if data.len() < channels * 4 {
            bail!(MalformedBlockError::SubChunkSize {
                what: "shaping weights",
                size: data.len(),
            });
        }

        let signed = |at: usize| exp2s(le16(data, at) as i16 as i32);
        for ch in 0..channels {
            self.shaping[ch].error = signed(ch * 4);
            self.shaping[ch].acc = signed(ch * 4 + 2);
        }

        if data.len() == channels * 6 {
            for ch in 0..channels {
                self.shaping[ch].delta = signed(channels * 4 + ch * 2);
            }
        }

        Ok(())
    }

    /// Noise-shaping errors prefixed to the decorrelation samples of version
    /// 0x402 streams. Returns the number of bytes consumed.
    pub fn read_legacy_shaping_errors(&mut self, data: &[u8], mono: bool) -> Result<usize> {
        let channels = if mono { 1 } else { 2 };
        if data.len() < channels * 2 {
            bail!(MalformedBlockError::DecorrSamples);
        }

        for ch in 0..channels {
            self.shaping[ch].error = exp2s(le16(data, ch * 2) as i16 as i32);
        }

        Ok(channels * 2)
    }

    /// Advances the bitrate accumulators and recomputes both channels' error
    /// limits. Called once per sample, before channel 0 is decoded.
    pub fn update_error_limit(&mut self, stereo: bool, bitrate: bool, balance: bool) {
        let [c0, c1] = &mut self.channels;

        c0.bitrate_acc = c0.bitrate_acc.wrapping_add(c0.bitrate_delta);
        let mut bitrate_0 = c0.bitrate_acc >> 16;

        if !stereo {
            c0.error_limit = if bitrate {
                limit_from_slow_level((c0.slow_level + 128) >> 8, bitrate_0)
            } else {
                exp2s(bitrate_0) as u32
            };
            return;
        }

        c1.bitrate_acc = c1.bitrate_acc.wrapping_add(c1.bitrate_delta);
        let mut bitrate_1 = c1.bitrate_acc >> 16;

        if !bitrate {
            c0.error_limit = exp2s(bitrate_0) as u32;
            c1.error_limit = exp2s(bitrate_1) as u32;
            return;
        }

        let slow_log_0 = (c0.slow_level + 128) >> 8;
        let slow_log_1 = (c1.slow_level + 128) >> 8;

        if balance {
            let balance = (slow_log_1 - slow_log_0 + bitrate_1 + 1) >> 1;

            if balance > bitrate_0 {
                bitrate_1 = bitrate_0 * 2;
                bitrate_0 = 0;
            } else if -balance > bitrate_0 {
                bitrate_0 *= 2;
                bitrate_1 = 0;
            } else {
                bitrate_1 = bitrate_0 + balance;
                bitrate_0 -= balance;
            }
        }

        c0.error_limit = limit_from_slow_level(slow_log_0, bitrate_0);
        c1.error_limit = limit_from_slow_level(slow_log_1, bitrate_1);
    }
}

fn limit_from_slow_level(slow_log: i32, bitrate: i32) -> u32 {
    if slow_log - bitrate > -0x100 {
        exp2s(slow_log - bitrate + 0x100) as u32
    } else {
        0
    }
}

/// Adds correction residuals onto lossy samples of one channel.
///
/// `samples` and `corrections` are interleaved with `stride` channels;
/// `shaping` feeds back the quantisation error when the block was encoded
/// with noise shaping.
pub fn merge_channel(
    samples: &mut [i32],
    corrections: &[i32],
    stride: usize,
    offset: usize,
    shaping: Option<(&mut ShapingChannel, bool)>,
) {
    let pairs = samples
        .iter_mut()
        .skip(offset)
        .step_by(stride)
        .zip(corrections.iter().skip(offset).step_by(stride));

    match shaping {
        None => {
            for (sample, &correction) in pairs {
                *sample = sample.wrapping_add(correction);
            }
        }
        Some((state, new_shaping)) => {
            for (sample, &correction) in pairs {
                state.acc = state.acc.wrapping_add(state.delta);
                let weight = state.acc >> 16;
                let mut temp = apply_weight(weight, state.error).wrapping_neg();

                if new_shaping && weight < 0 && temp != 0 {
                    if temp == state.error {
                        temp += if temp < 0 { 1 } else { -1 };
                    }
                    state.error = temp.wrapping_sub(correction);
                } else {
                    state.error = correction.wrapping_neg();
                }

                *sample = sample.wrapping_add(correction).wrapping_sub(temp);
            }
        }
    }
}
