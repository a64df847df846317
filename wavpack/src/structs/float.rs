//! Post-processing that turns decorrelated integers into output samples.
//!
//! Integer streams may have had low bits removed before coding (a plain
//! shift from the header, or the zeros/ones/dups patterns of 32-bit
//! streams). Float streams are coded as 24-bit integers scaled to the
//! block's maximum exponent and rebuilt as IEEE 754 singles here. The
//! bits that do not fit, when kept at all, arrive in a separate
//! extended-precision (WVX) bitstream.

use anyhow::{Result, bail};
use bitflags::bitflags;

use crate::structs::header::BlockFlags;
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::checksum::ExtendedCrc;
use crate::utils::errors::MalformedBlockError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FloatFlags: u8 {
        const SHIFT_ONES = 0x1;
        const SHIFT_SAME = 0x2;
        const SHIFT_SENT = 0x4;
        const ZEROS_SENT = 0x8;
        const NEG_ZEROS = 0x10;
        const EXCEPTIONS = 0x20;

        const _ = !0;
    }
}

const MANTISSA_MASK: u32 = 0x7f_ffff;
const IMPLICIT_ONE: u32 = 0x80_0000;
const EXPONENT_MAX: i32 = 0xff;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FloatInfo {
    pub flags: FloatFlags,
    pub shift: u32,
    pub max_exp: i32,
    pub norm_exp: i32,
}

impl FloatInfo {
    pub fn read(data: &[u8]) -> Result<Self> {
        let &[flags, shift, max_exp, norm_exp] = data else {
            bail!(MalformedBlockError::SubChunkSize {
                what: "float info",
                size: data.len(),
            });
        };

        if shift >= 32 {
            bail!(MalformedBlockError::FloatInfo);
        }

        Ok(Self {
            flags: FloatFlags::from_bits_retain(flags),
            shift: shift as u32,
            max_exp: max_exp as i32,
            norm_exp: norm_exp as i32,
        })
    }
}

/// How 32-bit integer samples were reduced before coding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Int32Info {
    pub sent_bits: u32,
    pub zeros: u32,
    pub ones: u32,
    pub dups: u32,
}

impl Int32Info {
    pub fn read(data: &[u8]) -> Result<Self> {
        let &[sent_bits, zeros, ones, dups] = data else {
            bail!(MalformedBlockError::SubChunkSize {
                what: "int32 info",
                size: data.len(),
            });
        };

        let info = Self {
            sent_bits: sent_bits as u32,
            zeros: zeros as u32,
            ones: ones as u32,
            dups: dups as u32,
        };

        let total = info.sent_bits + info.zeros + info.ones + info.dups;
        if total >= 32 {
            bail!(MalformedBlockError::InvalidShift(total));
        }

        Ok(info)
    }

    fn restore(&self, value: i32) -> i32 {
        if self.zeros > 0 {
            value.wrapping_shl(self.zeros)
        } else if self.ones > 0 {
            value.wrapping_add(1).wrapping_shl(self.ones).wrapping_sub(1)
        } else if self.dups > 0 {
            let low = value & 1;
            value.wrapping_add(low).wrapping_shl(self.dups).wrapping_sub(low)
        } else {
            value
        }
    }
}

/// The extended-precision bitstream of one block and its running CRC.
pub struct ExtendedStream<'a> {
    reader: BsIoSliceReader<'a>,
    stored_crc: u32,
    crc: ExtendedCrc,
}

impl<'a> ExtendedStream<'a> {
    /// Opens a WVX sub-chunk: a little-endian CRC followed by the bits.
    pub fn open(data: &'a [u8]) -> Result<Self> {
        if data.len() <= 4 || data.len() % 2 != 0 {
            bail!(MalformedBlockError::SubChunkSize {
                what: "extended bitstream",
                size: data.len(),
            });
        }

        Ok(Self {
            reader: BsIoSliceReader::from_slice(&data[4..]),
            stored_crc: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            crc: ExtendedCrc::default(),
        })
    }

    pub fn crc_matches(&self) -> bool {
        self.crc.value() == self.stored_crc
    }

    fn bits(&mut self, n: u32) -> Result<u32> {
        self.reader.get_n(n)
    }

    fn bit(&mut self) -> Result<bool> {
        self.reader.get()
    }
}

fn compose(sign: bool, exp: i32, mantissa: u32) -> u32 {
    (sign as u32) << 31 | ((exp & EXPONENT_MAX) as u32) << 23 | (mantissa & MANTISSA_MASK)
}

/// Rebuilds IEEE 754 bit patterns in place from the coded integers.
pub fn float_values(
    samples: &mut [i32],
    info: &FloatInfo,
    mut wvx: Option<&mut ExtendedStream>,
) -> Result<()> {
    for sample in samples.iter_mut() {
        let mut exp = info.max_exp;
        let mut sign = false;
        let mut mantissa = 0u32;

        if *sample == 0 {
            if let Some(wvx) = wvx.as_deref_mut() {
                if info.flags.contains(FloatFlags::ZEROS_SENT) {
                    if wvx.bit()? {
                        mantissa = wvx.bits(23)?;
                        if exp < 25 {
                            exp = 0;
                        } else {
                            exp = wvx.bits(8)? as i32;
                        }
                        sign = wvx.bit()?;
                    } else {
                        exp = 0;
                        if info.flags.contains(FloatFlags::NEG_ZEROS) {
                            sign = wvx.bit()?;
                        }
                    }
                } else {
                    exp = 0;
                }
            } else {
                exp = 0;
            }
        } else {
            let shifted = sample.wrapping_shl(info.shift);
            sign = shifted < 0;
            let mut value = shifted.unsigned_abs();

            match wvx.as_deref_mut() {
                Some(wvx) if value == 0x100_0000 => {
                    if wvx.bit()? {
                        mantissa = wvx.bits(23)?;
                    }
                    exp = EXPONENT_MAX;
                }
                None if value >= 0x100_0000 => {
                    while value & 0xf00_0000 != 0 {
                        value >>= 1;
                        exp += 1;
                    }
                    if exp > EXPONENT_MAX {
                        exp = EXPONENT_MAX;
                        value = 0;
                    }
                    mantissa = value;
                }
                wvx => {
                    let mut shift_count = 0;
                    if exp > 0 {
                        while value & IMPLICIT_ONE == 0 {
                            exp -= 1;
                            if exp == 0 {
                                break;
                            }
                            shift_count += 1;
                            value <<= 1;
                        }
                    }

                    if shift_count > 0 {
                        let fill = (1u32 << shift_count) - 1;
                        if info.flags.contains(FloatFlags::SHIFT_ONES) {
                            value |= fill;
                        } else if let Some(wvx) = wvx {
                            if info.flags.contains(FloatFlags::SHIFT_SAME) {
                                if wvx.bit()? {
                                    value |= fill;
                                }
                            } else if info.flags.contains(FloatFlags::SHIFT_SENT) {
                                value |= wvx.bits(shift_count)? & fill;
                            }
                        }
                    }

                    mantissa = value;
                }
            }
        }

        if let Some(wvx) = wvx.as_deref_mut() {
            wvx.crc = wvx.crc.update_float(
                mantissa & MANTISSA_MASK,
                (exp & EXPONENT_MAX) as u32,
                sign as u32,
            );
        }

        *sample = compose(sign, exp, mantissa) as i32;
    }

    Ok(())
}

/// Restores integer samples to their full width.
///
/// `lossy` clips to the range of the stored sample width before shifting,
/// so hybrid overshoot cannot wrap.
pub fn fixup_integers(
    samples: &mut [i32],
    flags: BlockFlags,
    int32: &Int32Info,
    mut wvx: Option<&mut ExtendedStream>,
    lossy: bool,
) -> Result<()> {
    let mut shift = flags.shift();

    if flags.contains(BlockFlags::INT32_DATA) {
        let mut info = *int32;

        if let Some(wvx) = wvx.as_deref_mut() {
            let mask = ((1u64 << info.sent_bits) - 1) as u32;
            for sample in samples.iter_mut() {
                let low = wvx.bits(info.sent_bits)? & mask;
                *sample = (sample.wrapping_shl(info.sent_bits) as u32 | low) as i32;
                *sample = info.restore(*sample);
                wvx.crc = wvx.crc.update_int32(*sample);
            }
        } else if info.sent_bits == 0 && info.zeros + info.ones + info.dups > 0 {
            while lossy && flags.bytes_per_sample() == 4 && shift < 8 {
                if info.zeros > 0 {
                    info.zeros -= 1;
                } else if info.ones > 0 {
                    info.ones -= 1;
                } else if info.dups > 0 {
                    info.dups -= 1;
                } else {
                    break;
                }
                shift += 1;
            }

            for sample in samples.iter_mut() {
                *sample = info.restore(*sample);
            }
        } else {
            shift += info.zeros + info.sent_bits + info.ones + info.dups;
        }
    }

    if shift >= 32 {
        bail!(MalformedBlockError::InvalidShift(shift));
    }

    if lossy {
        let (min_value, max_value) = match flags.bytes_per_sample() {
            1 => (-128 >> shift, 127 >> shift),
            2 => (-32768 >> shift, 32767 >> shift),
            3 => (-8388608 >> shift, 8388607 >> shift),
            _ => (i32::MIN >> shift, i32::MAX >> shift),
        };

        for sample in samples.iter_mut() {
            *sample = (*sample).clamp(min_value, max_value) << shift;
        }
    } else if shift > 0 {
        for sample in samples.iter_mut() {
            *sample = sample.wrapping_shl(shift);
        }
    }

    Ok(())
}

/// Moves float exponents by `delta_exp`, flushing underflow to zero and
/// overflow to infinity.
pub fn normalize_floats(samples: &mut [i32], delta_exp: i32) {
    if delta_exp == 0 {
        return;
    }

    for sample in samples.iter_mut() {
        let bits = *sample as u32;
        let exp = ((bits >> 23) & 0xff) as i32;

        *sample = if exp == 0 || exp + delta_exp <= 0 {
            0
        } else if exp == EXPONENT_MAX || exp + delta_exp >= EXPONENT_MAX {
            (bits & 0x8000_0000 | 0x7f80_0000) as i32
        } else {
            (bits & !0x7f80_0000 | ((exp + delta_exp) as u32) << 23) as i32
        };
    }
}
