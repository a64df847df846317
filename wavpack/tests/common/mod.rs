//! Reference encoder producing WavPack 4 streams for the integration tests.
//!
//! Covers what the decoder has to handle rather than what compresses well:
//! every block carries its full decorrelation and entropy state, so any
//! block group can be decoded after a seek.

#![allow(dead_code)]

pub mod model;

use std::io::Cursor;

use anyhow::Result;
use bitstream_io::{BitWrite, BitWriter, LittleEndian};

use model::{Budget, Cascade, Medians, Predictor, Shaper};
use wavpack::process::session::{OpenOptions, Session};

const VERSION: u16 = 0x407;

const BYTES_STORED: u32 = 0x3;
const MONO: u32 = 0x4;
const HYBRID: u32 = 0x8;
const JOINT_STEREO: u32 = 0x10;
const CROSS_DECORR: u32 = 0x20;
const HYBRID_SHAPE: u32 = 0x40;
const FLOAT_DATA: u32 = 0x80;
const HYBRID_BITRATE: u32 = 0x200;
const HYBRID_BALANCE: u32 = 0x400;
const INITIAL_BLOCK: u32 = 0x800;
const FINAL_BLOCK: u32 = 0x1000;
const HAS_CHECKSUM: u32 = 0x1000_0000;
const NEW_SHAPING: u32 = 0x2000_0000;

const ID_ODD_SIZE: u8 = 0x40;
const ID_LARGE: u8 = 0x80;
const ID_DECORR_TERMS: u8 = 0x2;
const ID_DECORR_WEIGHTS: u8 = 0x3;
const ID_DECORR_SAMPLES: u8 = 0x4;
const ID_ENTROPY_VARS: u8 = 0x5;
const ID_HYBRID_PROFILE: u8 = 0x6;
const ID_SHAPING_WEIGHTS: u8 = 0x7;
const ID_FLOAT_INFO: u8 = 0x8;
const ID_WV_BITSTREAM: u8 = 0xa;
const ID_WVC_BITSTREAM: u8 = 0xb;
const ID_CHANNEL_INFO: u8 = 0xd;
const ID_RIFF_HEADER: u8 = 0x21;
const ID_RIFF_TRAILER: u8 = 0x22;
const ID_MD5_CHECKSUM: u8 = 0x26;
const ID_SAMPLE_RATE: u8 = 0x27;
const ID_BLOCK_CHECKSUM: u8 = 0x2f;

const LIMIT_ONES: u32 = 16;

const SAMPLE_RATES: [u32; 15] = [
    6000, 8000, 9600, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 64000, 88200, 96000,
    192000,
];

/// Noise shaping of the hybrid quantisation error.
#[derive(Debug, Clone, Copy)]
pub struct Shaping {
    /// Starting filter weight, 1024 = 1.0.
    pub weight: i32,
    /// Added to the 16.16 weight accumulator every sample.
    pub delta: i32,
    pub new_shaping: bool,
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub channels: usize,
    pub channel_mask: Option<u32>,
    pub bytes_per_sample: u32,
    /// Samples are 24-bit integers standing for `value * 2^-23` floats.
    pub float: bool,
    pub sample_rate: u32,
    pub block_samples: usize,
    /// Decorrelation passes as `(term, delta)` in encode order.
    pub terms: Vec<(i32, i32)>,
    pub joint_stereo: bool,
    /// Hybrid bitrate in 8.8 fixed-point log2 units; the error limit is
    /// `exp2s(bitrate)`.
    pub hybrid: Option<u16>,
    /// Error limits follow the signal level.
    pub hybrid_bitrate: bool,
    /// Channel 1 profile word in balance mode: an offset moving the budget
    /// between the channels.
    pub hybrid_balance: Option<u16>,
    pub shaping: Option<Shaping>,
    pub block_checksum: bool,
    pub initial_index: u64,
    pub total_known: bool,
    pub riff_header: Option<Vec<u8>>,
    pub riff_trailer: Option<Vec<u8>>,
    pub md5: Option<[u8; 16]>,
    /// Sub-chunks appended to every audio block.
    pub extra_chunks: Vec<(u8, Vec<u8>)>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            channels: 2,
            channel_mask: None,
            bytes_per_sample: 2,
            float: false,
            sample_rate: 44100,
            block_samples: 1000,
            terms: vec![(18, 2), (17, 2), (2, 2), (1, 2)],
            joint_stereo: false,
            hybrid: None,
            hybrid_bitrate: false,
            hybrid_balance: None,
            shaping: None,
            block_checksum: false,
            initial_index: 0,
            total_known: true,
            riff_header: None,
            riff_trailer: None,
            md5: None,
            extra_chunks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Encoded {
    pub wv: Vec<u8>,
    /// Correction stream, for hybrid configurations.
    pub wvc: Option<Vec<u8>>,
    /// What a decoder returns without the correction stream.
    pub lossy: Vec<i32>,
    /// Offset and length of every block in `wv`.
    pub blocks: Vec<(usize, usize)>,
}

/// Deterministic test signal: a few sines plus noise, interleaved.
pub fn signal(frames: usize, channels: usize, amplitude: i32, seed: u32) -> Vec<i32> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    let mut noise = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        (state >> 16) as i32 - 0x8000
    };

    let mut out = Vec::with_capacity(frames * channels);
    for n in 0..frames {
        for ch in 0..channels {
            let t = n as f64 / 44100.0;
            let tone = (t * (220.0 + 110.0 * ch as f64) * std::f64::consts::TAU).sin() * 0.6
                + (t * 1375.0 * std::f64::consts::TAU).sin() * 0.3;
            let value = tone * amplitude as f64 + (noise() as f64 / 32768.0) * amplitude as f64 * 0.05;
            out.push((value as i32).clamp(-amplitude, amplitude));
        }
    }

    out
}

fn frame_chunk(id: u8, data: &[u8]) -> Vec<u8> {
    let mut data = data.to_vec();
    let mut id = id;
    if data.len() % 2 != 0 {
        id |= ID_ODD_SIZE;
        data.push(0);
    }

    let words = data.len() / 2;
    let mut out = if words > 0xff {
        vec![
            id | ID_LARGE,
            words as u8,
            (words >> 8) as u8,
            (words >> 16) as u8,
        ]
    } else {
        vec![id, words as u8]
    };
    out.extend(data);
    out
}

struct BlockSpec<'a> {
    index: u64,
    samples: u32,
    total: Option<u64>,
    flags: u32,
    crc: u32,
    chunks: &'a [(u8, Vec<u8>)],
    checksum: bool,
}

fn build_block(spec: BlockSpec) -> Vec<u8> {
    let body: Vec<u8> = spec
        .chunks
        .iter()
        .flat_map(|(id, data)| frame_chunk(*id, data))
        .collect();
    let checksum_len = if spec.checksum { 6 } else { 0 };
    let ck_size = (24 + body.len() + checksum_len) as u32;
    let flags = spec.flags | if spec.checksum { HAS_CHECKSUM } else { 0 };

    let (total_u8, total) = match spec.total {
        None => (0u8, u32::MAX),
        Some(total) => {
            let high = (total >> 32) as u8;
            (high, (total - ((high as u64) << 32) + high as u64) as u32)
        }
    };

    let mut out = Vec::with_capacity(ck_size as usize + 8);
    out.extend_from_slice(b"wvpk");
    out.extend_from_slice(&ck_size.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.push((spec.index >> 32) as u8);
    out.push(total_u8);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&(spec.index as u32).to_le_bytes());
    out.extend_from_slice(&spec.samples.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&spec.crc.to_le_bytes());
    out.extend(body);

    if spec.checksum {
        let sum = model::block_checksum(&out);
        out.extend(frame_chunk(ID_BLOCK_CHECKSUM, &sum.to_le_bytes()));
    }

    out
}

/// Bits waiting to be written, as `(value, width)` pairs.
type Bits = Vec<(u32, u32)>;

fn push_unary(bits: &mut Bits, count: u32) {
    for _ in 0..count {
        bits.push((1, 1));
    }
    bits.push((0, 1));
}

fn push_escape(bits: &mut Bits, value: u32) {
    if value < 2 {
        push_unary(bits, value);
        return;
    }

    let width = 32 - value.leading_zeros();
    push_unary(bits, width);
    bits.push((value & ((1 << (width - 1)) - 1), width - 1));
}

fn push_count(bits: &mut Bits, count: u32) {
    if count < LIMIT_ONES {
        push_unary(bits, count);
    } else {
        push_unary(bits, LIMIT_ONES);
        push_escape(bits, count - LIMIT_ONES);
    }
}

fn push_code(bits: &mut Bits, value: u32, max_code: u32) {
    if max_code < 2 {
        if max_code == 1 {
            bits.push((value, 1));
        }
        return;
    }

    let width = 32 - max_code.leading_zeros();
    let extras = ((1u64 << width) - max_code as u64 - 1) as u32;
    if value < extras {
        bits.push((value, width - 1));
    } else {
        let value = value + extras;
        bits.push((value >> 1, width - 1));
        bits.push((value & 1, 1));
    }
}

fn pack(bits: &Bits) -> Result<Vec<u8>> {
    let mut writer = BitWriter::endian(Vec::new(), LittleEndian);
    for &(value, width) in bits {
        if width > 0 {
            writer.write_var(width, value)?;
        }
    }
    writer.byte_align()?;

    let mut bytes = writer.into_writer();
    if bytes.len() % 2 != 0 {
        bytes.push(0);
    }
    if bytes.is_empty() {
        bytes.extend([0, 0]);
    }
    Ok(bytes)
}

struct PendingWord {
    count: u32,
    tail: Bits,
}

/// Which coding features a block's words use.
#[derive(Debug, Clone, Copy, Default)]
struct Coding {
    stereo: bool,
    hybrid: bool,
    bitrate: bool,
    balance: bool,
}

/// Entropy coder producing the bitstreams a decoder's word reader expects.
struct WordWriter {
    medians: [Medians; 2],
    budgets: [Budget; 2],
    coding: Coding,
    wv: Bits,
    wvc: Bits,
    pending: Option<PendingWord>,
    zeros: u32,
}

impl WordWriter {
    /// Codes `value` on `chan` and returns the value the decoder will see.
    /// `run` is how many zero words start here.
    fn write(&mut self, chan: usize, value: i32, run: u32) -> i32 {
        if self.pending.is_none() && self.medians[0].0[0] < 2 && self.medians[1].0[0] < 2 {
            if self.zeros > 0 {
                self.zeros -= 1;
                if self.zeros > 0 {
                    assert_eq!(value, 0);
                    self.budgets[chan].settle();
                    return 0;
                }
            } else {
                push_escape(&mut self.wv, run);
                self.zeros = run;
                if run > 0 {
                    assert_eq!(value, 0);
                    self.budgets[chan].settle();
                    self.medians = [Medians::default(); 2];
                    return 0;
                }
            }
        }

        if self.coding.hybrid && chan == 0 {
            let Coding {
                stereo,
                bitrate,
                balance,
                ..
            } = self.coding;
            model::refresh_limits(&mut self.budgets, stereo, bitrate, balance);
        }

        let sign = value < 0;
        let magnitude = (if sign { !value } else { value }) as u32;

        let m = &mut self.medians[chan];
        let steps = [m.step(0), m.step(1), m.step(2)];
        let (ones, mut low, mut high) = if magnitude < steps[0] {
            m.shrink(0);
            (0, 0, steps[0] - 1)
        } else if magnitude - steps[0] < steps[1] {
            m.grow(0);
            m.shrink(1);
            (1, steps[0], steps[0] + steps[1] - 1)
        } else {
            let base = steps[0] + steps[1];
            let ones = 2 + (magnitude - base) / steps[2];
            m.grow(0);
            m.grow(1);
            if ones == 2 {
                m.shrink(2);
            } else {
                m.grow(2);
            }
            let low = base + (ones - 2) * steps[2];
            (ones, low, low + steps[2] - 1)
        };

        let mut holding_zero = false;
        let mut holding_one = false;
        if let Some(pending) = self.pending.take() {
            push_count(&mut self.wv, pending.count + (ones > 0) as u32);
            self.wv.extend(pending.tail);
            holding_zero = ones == 0;
            holding_one = ones > 0;
        }

        let mut tail = Bits::new();
        let limit = self.budgets[chan].limit;
        let mid = if !self.coding.hybrid || limit == 0 {
            push_code(&mut tail, magnitude - low, high - low);
            magnitude
        } else {
            let mut mid = (high + low + 1) >> 1;
            while high - low > limit {
                if magnitude >= mid {
                    tail.push((1, 1));
                    low = mid;
                } else {
                    tail.push((0, 1));
                    high = mid - 1;
                }
                mid = (high + low + 1) >> 1;
            }
            push_code(&mut self.wvc, magnitude - low, high - low);
            mid
        };
        tail.push((sign as u32, 1));

        if holding_zero {
            self.wv.extend(tail);
        } else {
            let count = if holding_one { 2 * (ones - 1) } else { 2 * ones };
            self.pending = Some(PendingWord { count, tail });
        }

        if self.coding.bitrate {
            self.budgets[chan].track(mid);
        }

        if sign { !(mid as i32) } else { mid as i32 }
    }

    fn finish(mut self) -> Result<([Medians; 2], [Budget; 2], Vec<u8>, Vec<u8>)> {
        if let Some(pending) = self.pending.take() {
            push_count(&mut self.wv, pending.count);
            self.wv.extend(pending.tail);
        }
        Ok((self.medians, self.budgets, pack(&self.wv)?, pack(&self.wvc)?))
    }
}

fn le16s(values: impl IntoIterator<Item = i32>) -> Vec<u8> {
    values
        .into_iter()
        .flat_map(|v| (v as u16).to_le_bytes())
        .collect()
}

/// Undoes mid/side coding in place.
fn unjoin(buffer: &mut [i32]) {
    for pair in buffer.chunks_exact_mut(2) {
        pair[1] = pair[1].wrapping_sub(pair[0] >> 1);
        pair[0] = pair[0].wrapping_add(pair[1]);
    }
}

#[derive(Default)]
struct StreamEncoder {
    cascade: Option<Cascade>,
    medians: [Medians; 2],
    budgets: [Budget; 2],
    shapers: Option<[Shaper; 2]>,
}

struct StreamBlock {
    chunks: Vec<(u8, Vec<u8>)>,
    wvc: Option<Vec<u8>>,
    crc: u32,
    exact_crc: u32,
    /// Interleaved over the stream's channels.
    lossy: Vec<i32>,
}

impl StreamEncoder {
    /// Writes the carried state as sub-chunks and rounds it the way a
    /// decoder reloading them would, so both sides start the block alike.
    fn state_chunks(&mut self, config: &EncoderConfig, mono: bool) -> Vec<(u8, Vec<u8>)> {
        let channels = if mono { 1 } else { 2 };
        let cascade = self.cascade.get_or_insert_with(|| {
            Cascade(
                config
                    .terms
                    .iter()
                    .map(|&(term, delta)| Predictor::new(term, delta))
                    .collect(),
            )
        });

        let terms: Vec<u8> = cascade
            .0
            .iter()
            .map(|p| ((p.term + 5) as u8 & 0x1f) | ((p.delta as u8) << 5))
            .collect();

        let mut weights = Vec::new();
        let mut history = Vec::new();
        for p in cascade.0.iter_mut() {
            for ch in 0..channels {
                let stored = model::store_weight(p.weight[ch]);
                weights.push(stored as u8);
                p.weight[ch] = model::restore_weight(stored);
            }

            // oldest first for the short terms; both channels' latest for
            // cross terms
            let slots: Vec<(usize, usize)> = match p.term {
                17 | 18 => (0..channels).flat_map(|ch| [(ch, 0), (ch, 1)]).collect(),
                term if term < 0 => vec![(0, 0), (1, 0)],
                term => (0..term as usize)
                    .flat_map(|m| (0..channels).map(move |ch| (ch, term as usize - 1 - m)))
                    .collect(),
            };
            for (ch, at) in slots {
                let log = model::log2s(p.history[ch][at]);
                history.extend((log as i16).to_le_bytes());
                p.history[ch][at] = model::exp2s(log);
            }
        }

        let mut vars = Vec::new();
        for m in &mut self.medians[..channels] {
            vars.extend(le16s(m.0.map(model::log2)));
            *m = m.quantised();
        }

        let mut chunks = vec![
            (ID_DECORR_TERMS, terms),
            (ID_DECORR_WEIGHTS, weights),
            (ID_DECORR_SAMPLES, history),
            (ID_ENTROPY_VARS, vars),
        ];

        if let Some(bitrate) = config.hybrid {
            let mut profile = Vec::new();
            if config.hybrid_bitrate {
                for budget in &mut self.budgets[..channels] {
                    let log = model::log2(budget.slow_level as u32);
                    profile.extend(le16s([log]));
                    budget.slow_level = model::exp2s(log);
                }
            }

            let rates = [bitrate, config.hybrid_balance.unwrap_or(bitrate)];
            for (budget, rate) in self.budgets[..channels].iter_mut().zip(rates) {
                profile.extend(rate.to_le_bytes());
                budget.acc = (rate as i32) << 16;
            }
            chunks.push((ID_HYBRID_PROFILE, profile));
        }

        if let Some(shaping) = config.shaping {
            let shapers = self.shapers.get_or_insert_with(|| {
                [Shaper {
                    acc: shaping.weight << 16,
                    delta: shaping.delta,
                    error: 0,
                }; 2]
            });

            let mut weights = Vec::new();
            for shaper in &mut shapers[..channels] {
                weights.extend(le16s([model::log2s(shaper.error), model::log2s(shaper.acc)]));
                shaper.error = model::quantise(shaper.error);
                shaper.acc = model::quantise(shaper.acc);
            }
            if shaping.delta != 0 {
                for shaper in &mut shapers[..channels] {
                    weights.extend(le16s([model::log2s(shaper.delta)]));
                    shaper.delta = model::quantise(shaper.delta);
                }
            }
            chunks.push((ID_SHAPING_WEIGHTS, weights));
        }

        chunks
    }

    /// Encodes `frames` (interleaved over 1 or 2 channels, already mid/side
    /// when joint stereo is on).
    fn encode_block(&mut self, config: &EncoderConfig, frames: &[i32], mono: bool) -> Result<StreamBlock> {
        let mut chunks = self.state_chunks(config, mono);
        let width = if mono { 1 } else { 2 };
        let hybrid = config.hybrid.is_some();
        let joint = !mono && config.joint_stereo;

        assert!(
            !hybrid || config.terms.iter().all(|&(term, _)| term > 0),
            "cross-channel terms are lossless only"
        );

        let mut words = WordWriter {
            medians: self.medians,
            budgets: self.budgets,
            coding: Coding {
                stereo: !mono,
                hybrid,
                bitrate: hybrid && config.hybrid_bitrate,
                balance: hybrid && config.hybrid_balance.is_some(),
            },
            wv: Bits::new(),
            wvc: Bits::new(),
            pending: None,
            zeros: 0,
        };

        let cascade = self.cascade.get_or_insert_with(Cascade::default);
        let new_shaping = config.shaping.is_some_and(|s| s.new_shaping);
        let mut lossy = Vec::with_capacity(frames.len());

        if hybrid {
            for frame in frames.chunks_exact(width) {
                // the decoder takes `offsets` back off after adding the
                // correction, so they are folded into what gets coded
                let mut offsets = [0; 2];
                if let Some(shapers) = self.shapers.as_mut() {
                    for (offset, shaper) in offsets.iter_mut().zip(shapers.iter_mut()).take(width) {
                        *offset = shaper.offset(new_shaping);
                    }
                }

                let target: Vec<i32> = frame
                    .iter()
                    .zip(offsets)
                    .map(|(&x, offset)| x.wrapping_add(offset))
                    .collect();
                let residuals = cascade.residuals(&target);

                let mut coded = Vec::with_capacity(width);
                for (chan, &r) in residuals.iter().enumerate() {
                    let sent = words.write(chan, r, (r == 0) as u32);
                    if let Some(shapers) = self.shapers.as_mut() {
                        shapers[chan].settle(offsets[chan], r.wrapping_sub(sent), new_shaping);
                    }
                    coded.push(sent);
                }
                lossy.extend(cascade.rebuild(&coded));
            }
        } else {
            let mut residuals = Vec::with_capacity(frames.len());
            for frame in frames.chunks_exact(width) {
                let values = cascade.residuals(frame);
                assert_eq!(cascade.rebuild(&values), frame, "decorrelation does not invert");
                residuals.extend(values);
            }

            for (i, &r) in residuals.iter().enumerate() {
                let run = residuals[i..].iter().take_while(|&&v| v == 0).count() as u32;
                words.write(if mono { 0 } else { i & 1 }, r, run);
            }
            lossy.extend_from_slice(frames);
        }

        let (medians, budgets, wv, wvc) = words.finish()?;
        self.medians = medians;
        self.budgets = budgets;

        let mut exact = frames.to_vec();
        if joint {
            unjoin(&mut lossy);
            unjoin(&mut exact);
        }

        if config.float {
            chunks.push((ID_FLOAT_INFO, vec![0, 0, 127, 127]));
        }
        chunks.push((ID_WV_BITSTREAM, wv));

        Ok(StreamBlock {
            chunks,
            wvc: hybrid.then_some(wvc),
            crc: model::sample_crc(&lossy),
            exact_crc: model::sample_crc(&exact),
            lossy,
        })
    }
}

/// Encodes interleaved `samples` into a main stream and, for hybrid
/// configurations, a correction stream.
pub fn encode(samples: &[i32], config: &EncoderConfig) -> Result<Encoded> {
    let channels = config.channels;
    let frames = samples.len() / channels;
    let layout: Vec<usize> = (0..channels).step_by(2).map(|ch| (channels - ch).min(2)).collect();
    let mut streams: Vec<StreamEncoder> = layout.iter().map(|_| StreamEncoder::default()).collect();

    let rate_index = SAMPLE_RATES
        .iter()
        .position(|&rate| rate == config.sample_rate)
        .unwrap_or(15) as u32;
    let total = config.total_known.then_some(frames as u64);

    let mut base_flags = (config.bytes_per_sample - 1) & BYTES_STORED;
    base_flags |= (config.bytes_per_sample * 8 - 1) << 18;
    base_flags |= rate_index << 23;
    if config.float {
        base_flags |= FLOAT_DATA;
    }
    if config.hybrid.is_some() {
        base_flags |= HYBRID;
        if config.hybrid_bitrate {
            base_flags |= HYBRID_BITRATE;
        }
        if config.hybrid_balance.is_some() {
            base_flags |= HYBRID_BALANCE;
        }
        if let Some(shaping) = config.shaping {
            base_flags |= HYBRID_SHAPE;
            if shaping.new_shaping {
                base_flags |= NEW_SHAPING;
            }
        }
    }

    let mut out = Encoded {
        wvc: config.hybrid.map(|_| Vec::new()),
        lossy: vec![0; samples.len()],
        ..Default::default()
    };

    let mut start = 0;
    while start < frames {
        let count = config.block_samples.min(frames - start);
        let index = config.initial_index + start as u64;
        let mut first_channel = 0;

        for (s, (&width, stream)) in layout.iter().zip(streams.iter_mut()).enumerate() {
            let mono = width == 1;
            let mut frame_data = Vec::with_capacity(count * width);
            for n in start..start + count {
                let at = n * channels + first_channel;
                frame_data.extend_from_slice(&samples[at..at + width]);
            }
            if !mono && config.joint_stereo {
                for pair in frame_data.chunks_exact_mut(2) {
                    pair[0] = pair[0].wrapping_sub(pair[1]);
                    pair[1] = pair[1].wrapping_add(pair[0] >> 1);
                }
            }

            let mut block = stream.encode_block(config, &frame_data, mono)?;

            for (i, values) in block.lossy.chunks_exact(width).enumerate() {
                let at = (start + i) * channels + first_channel;
                for (dst, &value) in out.lossy[at..at + width].iter_mut().zip(values) {
                    *dst = if config.hybrid.is_some() {
                        clip(value, config.bytes_per_sample)
                    } else {
                        value
                    };
                }
            }

            let mut flags = base_flags;
            if mono {
                flags |= MONO;
            } else if config.joint_stereo {
                flags |= JOINT_STEREO;
            }
            if config.terms.iter().any(|&(term, _)| term < 0) {
                flags |= CROSS_DECORR;
            }
            if s == 0 {
                flags |= INITIAL_BLOCK;
            }
            if s + 1 == layout.len() {
                flags |= FINAL_BLOCK;
            }

            let mut chunks = Vec::new();
            if s == 0 && (channels > 2 || config.channel_mask.is_some()) {
                let mask = config.channel_mask.unwrap_or((1 << channels.min(18)) - 1);
                let mask_bytes = (32 - mask.leading_zeros()).div_ceil(8) as usize;
                let mut info = vec![channels as u8];
                info.extend_from_slice(&mask.to_le_bytes()[..mask_bytes]);
                chunks.push((ID_CHANNEL_INFO, info));
            }
            if s == 0 && rate_index == 15 {
                chunks.push((ID_SAMPLE_RATE, config.sample_rate.to_le_bytes()[..3].to_vec()));
            }
            if s == 0 && start == 0 {
                if let Some(header) = &config.riff_header {
                    chunks.push((ID_RIFF_HEADER, header.clone()));
                }
            }
            chunks.append(&mut block.chunks);
            chunks.extend(config.extra_chunks.iter().cloned());

            let bytes = build_block(BlockSpec {
                index,
                samples: count as u32,
                total,
                flags,
                crc: block.crc,
                chunks: &chunks,
                checksum: config.block_checksum,
            });
            out.blocks.push((out.wv.len(), bytes.len()));
            out.wv.extend(bytes);

            if let (Some(wvc), Some(bits)) = (out.wvc.as_mut(), block.wvc) {
                wvc.extend(build_block(BlockSpec {
                    index,
                    samples: count as u32,
                    total,
                    flags,
                    crc: block.exact_crc,
                    chunks: &[(ID_WVC_BITSTREAM, bits)],
                    checksum: config.block_checksum,
                }));
            }

            first_channel += width;
        }

        start += count;
    }

    if config.riff_trailer.is_some() || config.md5.is_some() {
        let mut chunks = Vec::new();
        if let Some(trailer) = &config.riff_trailer {
            chunks.push((ID_RIFF_TRAILER, trailer.clone()));
        }
        if let Some(md5) = config.md5 {
            chunks.push((ID_MD5_CHECKSUM, md5.to_vec()));
        }

        let bytes = build_block(BlockSpec {
            index: config.initial_index + frames as u64,
            samples: 0,
            total,
            flags: base_flags | MONO | INITIAL_BLOCK | FINAL_BLOCK,
            crc: model::sample_crc(&[]),
            chunks: &chunks,
            checksum: config.block_checksum,
        });
        out.blocks.push((out.wv.len(), bytes.len()));
        out.wv.extend(bytes);
    }

    Ok(out)
}

fn clip(value: i32, bytes_per_sample: u32) -> i32 {
    match bytes_per_sample {
        1 => value.clamp(-128, 127),
        2 => value.clamp(-32768, 32767),
        3 => value.clamp(-8388608, 8388607),
        _ => value,
    }
}

/// Session over in-memory streams.
pub fn session(encoded: &Encoded, options: OpenOptions) -> Result<Session<Cursor<Vec<u8>>>> {
    Session::from_reader(
        Cursor::new(encoded.wv.clone()),
        encoded.wvc.clone().map(Cursor::new),
        options,
    )
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Decodes everything left in `session` in calls of `chunk` frames.
pub fn decode_all<R: std::io::Read + std::io::Seek>(
    session: &mut Session<R>,
    chunk: usize,
) -> Result<Vec<i32>> {
    let mut out = Vec::new();
    loop {
        let decoded = session.decode(chunk)?;
        if decoded.frames == 0 {
            return Ok(out);
        }
        out.extend(decoded.samples);
    }
}
