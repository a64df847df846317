//! Inverse decorrelation.
//!
//! The encoder whitens each channel with a cascade of adaptive predictors
//! ("terms"). Decoding runs the cascade in the opposite order, adding each
//! prediction back onto the residual.
//!
//! ## Terms
//!
//! - **1..=8**: predict from the sample `term` positions back, kept in an
//!   8-entry circular history per channel
//! - **17**: linear extrapolation `2a - b` from the last two samples
//! - **18**: damped extrapolation `(3a - b) >> 1`
//! - **-1, -2, -3**: stereo only, predict one channel from the other
//!
//! Weights are 10-bit fixed point (1024 = 1.0) and adapt by `delta` after
//! every sample.

use anyhow::{Result, bail};

use crate::utils::errors::MalformedBlockError;
use crate::utils::math::{exp2s, restore_weight};

pub const MAX_TERM: i32 = 8;
pub const MAX_NTERMS: usize = 16;
const HISTORY: usize = MAX_TERM as usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecorrPass {
    pub term: i32,
    pub delta: i32,
    pub weight_a: i32,
    pub weight_b: i32,
    pub samples_a: [i32; HISTORY],
    pub samples_b: [i32; HISTORY],
}

#[inline(always)]
pub fn apply_weight(weight: i32, sample: i32) -> i32 {
    ((weight as i64 * sample as i64 + 512) >> 10) as i32
}

#[inline(always)]
fn update_weight(weight: &mut i32, delta: i32, source: i32, result: i32) {
    if source != 0 && result != 0 {
        if (source ^ result) < 0 {
            *weight = weight.wrapping_sub(delta);
        } else {
            *weight = weight.wrapping_add(delta);
        }
    }
}

#[inline(always)]
fn update_weight_clip(weight: &mut i32, delta: i32, source: i32, result: i32) {
    if source != 0 && result != 0 {
        if (source ^ result) < 0 {
            *weight = weight.saturating_sub(delta).max(-1024);
        } else {
            *weight = weight.saturating_add(delta).min(1024);
        }
    }
}

#[inline(always)]
fn extrapolate(term: i32, history: &[i32; HISTORY]) -> i32 {
    if term & 1 != 0 {
        history[0].wrapping_mul(2).wrapping_sub(history[1])
    } else {
        history[0].wrapping_mul(3).wrapping_sub(history[1]) >> 1
    }
}

fn le16(bytes: &[u8], at: usize) -> i32 {
    i16::from_le_bytes([bytes[at], bytes[at + 1]]) as i32
}

impl DecorrPass {
    fn is_valid_term(term: i32) -> bool {
        (1..=MAX_TERM).contains(&term) || term == 17 || term == 18 || (-3..=-1).contains(&term)
    }

    fn mono(&mut self, buffer: &mut [i32]) {
        match self.term {
            17 | 18 => {
                for sample in buffer.iter_mut() {
                    let sam = extrapolate(self.term, &self.samples_a);
                    self.samples_a[1] = self.samples_a[0];
                    self.samples_a[0] = apply_weight(self.weight_a, sam).wrapping_add(*sample);
                    update_weight(&mut self.weight_a, self.delta, sam, *sample);
                    *sample = self.samples_a[0];
                }
            }
            term => {
                let mut m = 0;
                for sample in buffer.iter_mut() {
                    let k = (m + term as usize) & (HISTORY - 1);
                    let sam = self.samples_a[m];
                    self.samples_a[k] = apply_weight(self.weight_a, sam).wrapping_add(*sample);
                    update_weight(&mut self.weight_a, self.delta, sam, *sample);
                    *sample = self.samples_a[k];
                    m = (m + 1) & (HISTORY - 1);
                }
                self.samples_a.rotate_left(m);
            }
        }
    }

    fn stereo(&mut self, buffer: &mut [i32]) {
        match self.term {
            17 | 18 => {
                for pair in buffer.chunks_exact_mut(2) {
                    let sam_a = extrapolate(self.term, &self.samples_a);
                    self.samples_a[1] = self.samples_a[0];
                    self.samples_a[0] = apply_weight(self.weight_a, sam_a).wrapping_add(pair[0]);
                    update_weight(&mut self.weight_a, self.delta, sam_a, pair[0]);
                    pair[0] = self.samples_a[0];

                    let sam_b = extrapolate(self.term, &self.samples_b);
                    self.samples_b[1] = self.samples_b[0];
                    self.samples_b[0] = apply_weight(self.weight_b, sam_b).wrapping_add(pair[1]);
                    update_weight(&mut self.weight_b, self.delta, sam_b, pair[1]);
                    pair[1] = self.samples_b[0];
                }
            }
            -1 => {
                for pair in buffer.chunks_exact_mut(2) {
                    let source = self.samples_a[0];
                    let left = apply_weight(self.weight_a, source).wrapping_add(pair[0]);
                    update_weight_clip(&mut self.weight_a, self.delta, source, pair[0]);

                    let right = apply_weight(self.weight_b, left).wrapping_add(pair[1]);
                    update_weight_clip(&mut self.weight_b, self.delta, left, pair[1]);

                    self.samples_a[0] = right;
                    pair[0] = left;
                    pair[1] = right;
                }
            }
            -2 | -3 => {
                for pair in buffer.chunks_exact_mut(2) {
                    let source = self.samples_b[0];
                    let right = apply_weight(self.weight_b, source).wrapping_add(pair[1]);
                    update_weight_clip(&mut self.weight_b, self.delta, source, pair[1]);

                    let source = if self.term == -3 {
                        std::mem::replace(&mut self.samples_a[0], right)
                    } else {
                        right
                    };
                    let left = apply_weight(self.weight_a, source).wrapping_add(pair[0]);
                    update_weight_clip(&mut self.weight_a, self.delta, source, pair[0]);

                    self.samples_b[0] = left;
                    pair[0] = left;
                    pair[1] = right;
                }
            }
            term => {
                let mut m = 0;
                for pair in buffer.chunks_exact_mut(2) {
                    let k = (m + term as usize) & (HISTORY - 1);

                    let sam_a = self.samples_a[m];
                    self.samples_a[k] = apply_weight(self.weight_a, sam_a).wrapping_add(pair[0]);
                    update_weight(&mut self.weight_a, self.delta, sam_a, pair[0]);
                    pair[0] = self.samples_a[k];

                    let sam_b = self.samples_b[m];
                    self.samples_b[k] = apply_weight(self.weight_b, sam_b).wrapping_add(pair[1]);
                    update_weight(&mut self.weight_b, self.delta, sam_b, pair[1]);
                    pair[1] = self.samples_b[k];

                    m = (m + 1) & (HISTORY - 1);
                }
                self.samples_a.rotate_left(m);
                self.samples_b.rotate_left(m);
            }
        }
    }
}

/// Decorrelation passes of one stream, in the order they are undone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecorrState {
    pub passes: Vec<DecorrPass>,
}

impl DecorrState {
    /// Replaces the cascade from a terms sub-chunk. Weights and histories
    /// start at zero.
    pub fn read_terms(&mut self, data: &[u8], mono: bool) -> Result<()> {
        if data.len() > MAX_NTERMS {
            bail!(MalformedBlockError::TooManyTerms(data.len()));
        }

        let mut passes = Vec::with_capacity(data.len());
        for &byte in data.iter().rev() {
            let term = (byte & 0x1f) as i32 - 5;
            let delta = ((byte >> 5) & 0x7) as i32;

            if !DecorrPass::is_valid_term(term) {
                bail!(MalformedBlockError::InvalidTerm(term));
            }
            if mono && term < 0 {
                bail!(MalformedBlockError::CrossTermInMono(term));
            }

            passes.push(DecorrPass {
                term,
                delta,
                ..Default::default()
            });
        }

        self.passes = passes;
        Ok(())
    }

    /// Sets the weights; passes not covered by the sub-chunk restart at zero.
    pub fn read_weights(&mut self, data: &[u8], mono: bool) -> Result<()> {
        let count = if mono { data.len() } else { data.len() / 2 };

        if count > self.passes.len() {
            bail!(MalformedBlockError::TooManyWeights {
                weights: count,
                terms: self.passes.len(),
            });
        }

        for pass in self.passes.iter_mut() {
            pass.weight_a = 0;
            pass.weight_b = 0;
        }

        let mut bytes = data.iter().map(|&b| restore_weight(b as i8));
        for pass in self.passes.iter_mut().rev().take(count) {
            pass.weight_a = bytes.next().unwrap_or(0);
            if !mono {
                pass.weight_b = bytes.next().unwrap_or(0);
            }
        }

        Ok(())
    }

    /// Sets the histories; passes not covered restart at zero.
    pub fn read_samples(&mut self, data: &[u8], mono: bool) -> Result<()> {
        for pass in self.passes.iter_mut() {
            pass.samples_a = [0; HISTORY];
            pass.samples_b = [0; HISTORY];
        }

        let mut pos = 0;
        for pass in self.passes.iter_mut().rev() {
            if pos >= data.len() {
                break;
            }

            let needed = match pass.term {
                term if term > MAX_TERM => {
                    if mono {
                        4
                    } else {
                        8
                    }
                }
                term if term < 0 => 4,
                term => term as usize * if mono { 2 } else { 4 },
            };

            if pos + needed > data.len() {
                bail!(MalformedBlockError::DecorrSamples);
            }

            match pass.term {
                term if term > MAX_TERM => {
                    pass.samples_a[0] = exp2s(le16(data, pos));
                    pass.samples_a[1] = exp2s(le16(data, pos + 2));
                    pos += 4;
                    if !mono {
                        pass.samples_b[0] = exp2s(le16(data, pos));
                        pass.samples_b[1] = exp2s(le16(data, pos + 2));
                        pos += 4;
                    }
                }
                term if term < 0 => {
                    pass.samples_a[0] = exp2s(le16(data, pos));
                    pass.samples_b[0] = exp2s(le16(data, pos + 2));
                    pos += 4;
                }
                term => {
                    for m in 0..term as usize {
                        pass.samples_a[m] = exp2s(le16(data, pos));
                        pos += 2;
                        if !mono {
                            pass.samples_b[m] = exp2s(le16(data, pos));
                            pos += 2;
                        }
                    }
                }
            }
        }

        if pos != data.len() {
            bail!(MalformedBlockError::DecorrSamples);
        }

        Ok(())
    }

    /// Undoes the cascade over one block of residuals in place.
    ///
    /// `buffer` is interleaved when `stereo`. Histories are rotated at the
    /// end so a following block continues where this one stopped.
    pub fn reconstruct(&mut self, buffer: &mut [i32], stereo: bool) {
        for pass in self.passes.iter_mut() {
            if stereo {
                pass.stereo(buffer);
            } else {
                pass.mono(buffer);
            }
        }
    }
}

/// Undoes mid/side coding: `R -= L >> 1; L += R`.
pub fn joint_stereo_inverse(buffer: &mut [i32]) {
    for pair in buffer.chunks_exact_mut(2) {
        pair[1] = pair[1].wrapping_sub(pair[0] >> 1);
        pair[0] = pair[0].wrapping_add(pair[1]);
    }
}
