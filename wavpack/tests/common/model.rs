//! Encoder-side fixed-point arithmetic. Shares no code with the decoder;
//! the log tables are computed from their definitions.

/// Fractional part of `2^(i / 256)` in 1/256 steps.
fn exp2_fraction(i: u32) -> u32 {
    (256.0 * 2f64.powf(i as f64 / 256.0)).round() as u32 - 256
}

/// `log2(1 + i / 256)` in 1/256 steps.
fn log2_fraction(i: u32) -> u32 {
    (256.0 * (1.0 + i as f64 / 256.0).log2()).round() as u32
}

pub fn exp2s(log: i32) -> i32 {
    if log < 0 {
        return -exp2s(-log);
    }

    let mantissa = exp2_fraction(log as u32 & 0xff) + 256;
    match log >> 8 {
        whole @ 0..=9 => (mantissa >> (9 - whole)) as i32,
        whole => mantissa.wrapping_shl(whole as u32 - 9) as i32,
    }
}

pub fn log2(value: u32) -> i32 {
    let value = value.wrapping_add(value >> 9);
    if value == 0 {
        return 0;
    }

    let bits = 32 - value.leading_zeros();
    // top nine bits, leading one included
    let top = if bits > 9 {
        value >> (bits - 9)
    } else {
        value << (9 - bits)
    };
    (bits * 256 + log2_fraction(top & 0xff)) as i32
}

pub fn log2s(value: i32) -> i32 {
    match value {
        v if v < 0 => -log2(v.unsigned_abs()),
        v => log2(v as u32),
    }
}

/// Round trip through the 8.8 log form a decoder reloads values from.
pub fn quantise(value: i32) -> i32 {
    exp2s(log2s(value))
}

pub fn store_weight(weight: i32) -> i8 {
    let mut weight = weight.clamp(-1024, 1024);
    if weight > 0 {
        weight -= (weight + 64) >> 7;
    }
    ((weight + 4) >> 3) as i8
}

pub fn restore_weight(byte: i8) -> i32 {
    let weight = byte as i32 * 8;
    if weight > 0 {
        weight + ((weight + 64) >> 7)
    } else {
        weight
    }
}

pub fn weighted(weight: i32, sample: i32) -> i32 {
    ((weight as i64 * sample as i64 + 512) >> 10) as i32
}

/// Moves `weight` toward agreement between the signs of `input` and
/// `residual`.
pub fn adapt(weight: i32, delta: i32, input: i32, residual: i32, clip: bool) -> i32 {
    if input == 0 || residual == 0 {
        return weight;
    }
    let step = if (input < 0) == (residual < 0) { delta } else { -delta };
    if clip {
        (weight + step).clamp(-1024, 1024)
    } else {
        weight.wrapping_add(step)
    }
}

/// One predictor of the cascade. Histories hold the pass input, most
/// recent first.
#[derive(Debug, Clone)]
pub struct Predictor {
    pub term: i32,
    pub delta: i32,
    pub weight: [i32; 2],
    pub history: [[i32; 8]; 2],
}

impl Predictor {
    pub fn new(term: i32, delta: i32) -> Self {
        Self {
            term,
            delta,
            weight: [0; 2],
            history: [[0; 8]; 2],
        }
    }

    fn guess(&self, ch: usize) -> i32 {
        let h = &self.history[ch];
        match self.term {
            17 => h[0].wrapping_mul(2).wrapping_sub(h[1]),
            18 => h[0].wrapping_mul(3).wrapping_sub(h[1]) >> 1,
            term => h[term as usize - 1],
        }
    }

    fn remember(&mut self, ch: usize, value: i32) {
        self.history[ch].rotate_right(1);
        self.history[ch][0] = value;
    }

    /// Residuals this pass hands to the next one, without touching state.
    pub fn residuals(&self, input: &[i32]) -> Vec<i32> {
        if input.len() == 1 || self.term > 0 {
            return input
                .iter()
                .enumerate()
                .map(|(ch, &x)| x.wrapping_sub(weighted(self.weight[ch], self.guess(ch))))
                .collect();
        }

        let (left, right) = (input[0], input[1]);
        let (prev_right, prev_left) = (self.history[0][0], self.history[1][0]);
        match self.term {
            -1 => vec![
                left.wrapping_sub(weighted(self.weight[0], prev_right)),
                right.wrapping_sub(weighted(self.weight[1], left)),
            ],
            -2 => vec![
                left.wrapping_sub(weighted(self.weight[0], right)),
                right.wrapping_sub(weighted(self.weight[1], prev_left)),
            ],
            _ => vec![
                left.wrapping_sub(weighted(self.weight[0], prev_right)),
                right.wrapping_sub(weighted(self.weight[1], prev_left)),
            ],
        }
    }

    /// Rebuilds this pass's input from `residuals` the way a decoder does,
    /// adapting weights and histories.
    pub fn rebuild(&mut self, residuals: &[i32]) -> Vec<i32> {
        if residuals.len() == 1 || self.term > 0 {
            let mut out = Vec::with_capacity(residuals.len());
            for (ch, &r) in residuals.iter().enumerate() {
                let guess = self.guess(ch);
                let value = weighted(self.weight[ch], guess).wrapping_add(r);
                self.weight[ch] = adapt(self.weight[ch], self.delta, guess, r, false);
                self.remember(ch, value);
                out.push(value);
            }
            return out;
        }

        // cross terms: history[0][0] is the previous right sample,
        // history[1][0] the previous left one
        let (r_left, r_right) = (residuals[0], residuals[1]);
        let d = self.delta;
        let (left, right) = match self.term {
            -1 => {
                let source = self.history[0][0];
                let left = weighted(self.weight[0], source).wrapping_add(r_left);
                self.weight[0] = adapt(self.weight[0], d, source, r_left, true);
                let right = weighted(self.weight[1], left).wrapping_add(r_right);
                self.weight[1] = adapt(self.weight[1], d, left, r_right, true);
                (left, right)
            }
            -2 => {
                let source = self.history[1][0];
                let right = weighted(self.weight[1], source).wrapping_add(r_right);
                self.weight[1] = adapt(self.weight[1], d, source, r_right, true);
                let left = weighted(self.weight[0], right).wrapping_add(r_left);
                self.weight[0] = adapt(self.weight[0], d, right, r_left, true);
                (left, right)
            }
            _ => {
                let source = self.history[1][0];
                let right = weighted(self.weight[1], source).wrapping_add(r_right);
                self.weight[1] = adapt(self.weight[1], d, source, r_right, true);
                let source = self.history[0][0];
                let left = weighted(self.weight[0], source).wrapping_add(r_left);
                self.weight[0] = adapt(self.weight[0], d, source, r_left, true);
                (left, right)
            }
        };
        self.history[0][0] = right;
        self.history[1][0] = left;
        vec![left, right]
    }
}

/// Predictors in coding order: the first one sees the raw samples.
#[derive(Debug, Clone, Default)]
pub struct Cascade(pub Vec<Predictor>);

impl Cascade {
    pub fn residuals(&self, frame: &[i32]) -> Vec<i32> {
        self.0.iter().fold(frame.to_vec(), |values, p| p.residuals(&values))
    }

    /// Decoder-side rebuild of a frame from its final residuals, adapting
    /// every pass on the way.
    pub fn rebuild(&mut self, coded: &[i32]) -> Vec<i32> {
        self.0
            .iter_mut()
            .rev()
            .fold(coded.to_vec(), |values, p| p.rebuild(&values))
    }
}

/// Three running medians of one channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Medians(pub [u32; 3]);

impl Medians {
    pub fn step(&self, n: usize) -> u32 {
        (self.0[n] >> 4) + 1
    }

    pub fn grow(&mut self, n: usize) {
        let div = 128 >> n;
        self.0[n] = self.0[n].wrapping_add((self.0[n].wrapping_add(div) / div) * 5);
    }

    pub fn shrink(&mut self, n: usize) {
        let div = 128 >> n;
        self.0[n] = self.0[n].wrapping_sub((self.0[n].wrapping_add(div - 2) / div) * 2);
    }

    /// Reloaded from the stored logs.
    pub fn quantised(&self) -> Self {
        Self(self.0.map(|m| exp2s(log2(m)) as u32))
    }
}

/// Error limit bookkeeping of one hybrid channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Budget {
    pub slow_level: i32,
    pub acc: i32,
    pub limit: u32,
}

impl Budget {
    pub fn settle(&mut self) {
        self.slow_level -= (self.slow_level + 128) >> 8;
    }

    pub fn track(&mut self, magnitude: u32) {
        self.settle();
        self.slow_level += log2(magnitude);
    }
}

fn limit_for(slow_level: i32, bitrate: i32) -> u32 {
    let slow_log = (slow_level + 128) >> 8;
    if slow_log - bitrate > -256 {
        exp2s(slow_log - bitrate + 256) as u32
    } else {
        0
    }
}

/// Recomputes the error limits before a frame's first word.
pub fn refresh_limits(budgets: &mut [Budget; 2], stereo: bool, bitrate: bool, balance: bool) {
    let channels = if stereo { 2 } else { 1 };
    let mut rates = [budgets[0].acc >> 16, budgets[1].acc >> 16];

    if !bitrate {
        for ch in 0..channels {
            budgets[ch].limit = exp2s(rates[ch]) as u32;
        }
        return;
    }

    if stereo && balance {
        let shift = (((budgets[1].slow_level + 128) >> 8) - ((budgets[0].slow_level + 128) >> 8)
            + rates[1]
            + 1)
            >> 1;
        rates = if shift > rates[0] {
            [0, rates[0] * 2]
        } else if -shift > rates[0] {
            [rates[0] * 2, 0]
        } else {
            [rates[0] - shift, rates[0] + shift]
        };
    }

    for ch in 0..channels {
        budgets[ch].limit = limit_for(budgets[ch].slow_level, rates[ch]);
    }
}

/// Noise shaping feedback of one channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Shaper {
    pub acc: i32,
    pub delta: i32,
    pub error: i32,
}

impl Shaper {
    /// Advances the filter and returns the offset the decoder subtracts
    /// from the next sample.
    pub fn offset(&mut self, new_shaping: bool) -> i32 {
        self.acc = self.acc.wrapping_add(self.delta);
        let mut offset = -weighted(self.acc >> 16, self.error);
        if new_shaping && self.acc >> 16 < 0 && offset != 0 && offset == self.error {
            offset += if offset < 0 { 1 } else { -1 };
        }
        offset
    }

    /// Records the correction that went out with the sample.
    pub fn settle(&mut self, offset: i32, correction: i32, new_shaping: bool) {
        self.error = if new_shaping && self.acc >> 16 < 0 && offset != 0 {
            offset - correction
        } else {
            -correction
        };
    }
}

pub fn block_checksum(bytes: &[u8]) -> u32 {
    bytes
        .chunks_exact(2)
        .fold(u32::MAX, |sum, w| {
            sum.wrapping_mul(3)
                .wrapping_add(u16::from_le_bytes([w[0], w[1]]) as u32)
        })
}

pub fn sample_crc(samples: &[i32]) -> u32 {
    samples
        .iter()
        .fold(u32::MAX, |crc, &s| crc.wrapping_mul(3).wrapping_add(s as u32))
}
