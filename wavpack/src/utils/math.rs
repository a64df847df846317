//! Fixed-point base-2 logarithm and exponential used by WavPack.
//!
//! Values are in 8.8 fixed point: `log2s(x) = round(256 * log2(x))` up to the
//! mantissa precision of the 256-entry tables.

#[rustfmt::skip]
const EXP2_TABLE: [u8; 256] = [
    0x00, 0x01, 0x01, 0x02, 0x03, 0x03, 0x04, 0x05, 0x06, 0x06, 0x07, 0x08, 0x08, 0x09, 0x0a, 0x0b,
    0x0b, 0x0c, 0x0d, 0x0e, 0x0e, 0x0f, 0x10, 0x10, 0x11, 0x12, 0x13, 0x13, 0x14, 0x15, 0x16, 0x16,
    0x17, 0x18, 0x19, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1d, 0x1e, 0x1f, 0x20, 0x20, 0x21, 0x22, 0x23,
    0x24, 0x24, 0x25, 0x26, 0x27, 0x28, 0x28, 0x29, 0x2a, 0x2b, 0x2c, 0x2c, 0x2d, 0x2e, 0x2f, 0x30,
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x3a, 0x3b, 0x3c, 0x3d,
    0x3e, 0x3f, 0x40, 0x41, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x48, 0x49, 0x4a, 0x4b,
    0x4c, 0x4d, 0x4e, 0x4f, 0x50, 0x51, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a,
    0x5b, 0x5c, 0x5d, 0x5e, 0x5e, 0x5f, 0x60, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69,
    0x6a, 0x6b, 0x6c, 0x6d, 0x6e, 0x6f, 0x70, 0x71, 0x72, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79,
    0x7a, 0x7b, 0x7c, 0x7d, 0x7e, 0x7f, 0x80, 0x81, 0x82, 0x83, 0x84, 0x85, 0x87, 0x88, 0x89, 0x8a,
    0x8b, 0x8c, 0x8d, 0x8e, 0x8f, 0x90, 0x91, 0x92, 0x93, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9a, 0x9b,
    0x9c, 0x9d, 0x9f, 0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa8, 0xa9, 0xaa, 0xab, 0xac, 0xad,
    0xaf, 0xb0, 0xb1, 0xb2, 0xb3, 0xb4, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xbc, 0xbd, 0xbe, 0xbf, 0xc0,
    0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc8, 0xc9, 0xca, 0xcb, 0xcd, 0xce, 0xcf, 0xd0, 0xd2, 0xd3, 0xd4,
    0xd6, 0xd7, 0xd8, 0xd9, 0xdb, 0xdc, 0xdd, 0xde, 0xe0, 0xe1, 0xe2, 0xe4, 0xe5, 0xe6, 0xe8, 0xe9,
    0xea, 0xec, 0xed, 0xee, 0xf0, 0xf1, 0xf2, 0xf4, 0xf5, 0xf6, 0xf8, 0xf9, 0xfa, 0xfc, 0xfd, 0xff,
];

#[rustfmt::skip]
const LOG2_TABLE: [u8; 256] = [
    0x00, 0x01, 0x03, 0x04, 0x06, 0x07, 0x09, 0x0a, 0x0b, 0x0d, 0x0e, 0x10, 0x11, 0x12, 0x14, 0x15,
    0x16, 0x18, 0x19, 0x1a, 0x1c, 0x1d, 0x1e, 0x20, 0x21, 0x22, 0x24, 0x25, 0x26, 0x28, 0x29, 0x2a,
    0x2c, 0x2d, 0x2e, 0x2f, 0x31, 0x32, 0x33, 0x34, 0x36, 0x37, 0x38, 0x39, 0x3b, 0x3c, 0x3d, 0x3e,
    0x3f, 0x41, 0x42, 0x43, 0x44, 0x45, 0x47, 0x48, 0x49, 0x4a, 0x4b, 0x4d, 0x4e, 0x4f, 0x50, 0x51,
    0x52, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x5c, 0x5d, 0x5e, 0x5f, 0x60, 0x61, 0x62, 0x63,
    0x64, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x6b, 0x6c, 0x6d, 0x6e, 0x6f, 0x70, 0x71, 0x72, 0x74, 0x75,
    0x76, 0x77, 0x78, 0x79, 0x7a, 0x7b, 0x7c, 0x7d, 0x7e, 0x7f, 0x80, 0x81, 0x82, 0x83, 0x84, 0x85,
    0x86, 0x87, 0x88, 0x89, 0x8a, 0x8b, 0x8c, 0x8d, 0x8e, 0x8f, 0x90, 0x91, 0x92, 0x93, 0x94, 0x95,
    0x96, 0x97, 0x98, 0x99, 0x9a, 0x9b, 0x9b, 0x9c, 0x9d, 0x9e, 0x9f, 0xa0, 0xa1, 0xa2, 0xa3, 0xa4,
    0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xa9, 0xaa, 0xab, 0xac, 0xad, 0xae, 0xaf, 0xb0, 0xb1, 0xb2, 0xb2,
    0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xb9, 0xba, 0xbb, 0xbc, 0xbd, 0xbe, 0xbf, 0xc0, 0xc0,
    0xc1, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xcb, 0xcb, 0xcc, 0xcd, 0xce,
    0xcf, 0xd0, 0xd0, 0xd1, 0xd2, 0xd3, 0xd4, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd8, 0xd9, 0xda, 0xdb,
    0xdc, 0xdc, 0xdd, 0xde, 0xdf, 0xe0, 0xe0, 0xe1, 0xe2, 0xe3, 0xe4, 0xe4, 0xe5, 0xe6, 0xe7, 0xe7,
    0xe8, 0xe9, 0xea, 0xea, 0xeb, 0xec, 0xed, 0xee, 0xee, 0xef, 0xf0, 0xf1, 0xf1, 0xf2, 0xf3, 0xf4,
    0xf4, 0xf5, 0xf6, 0xf7, 0xf7, 0xf8, 0xf9, 0xf9, 0xfa, 0xfb, 0xfc, 0xfc, 0xfd, 0xfe, 0xff, 0xff,
];

/// Inverse of [`log2s`]: `2^(log / 256)`, sign-symmetric.
#[inline]
pub fn exp2s(log: i32) -> i32 {
    if log < 0 {
        return exp2s(log.saturating_neg()).wrapping_neg();
    }

    let value = EXP2_TABLE[(log & 0xff) as usize] as u32 | 0x100;
    let exp = log >> 8;

    if exp <= 9 {
        (value >> (9 - exp)) as i32
    } else {
        // shift count wraps at 32
        value.wrapping_shl((exp - 9) as u32) as i32
    }
}

/// Fixed-point `log2` of an unsigned magnitude, `0` for zero.
#[inline]
pub fn log2(value: u32) -> i32 {
    let value = value.wrapping_add(value >> 9);
    let bits = 32 - value.leading_zeros();

    if bits == 0 {
        return 0;
    }

    let mantissa = if bits <= 9 {
        value << (9 - bits)
    } else {
        value >> (bits - 9)
    };

    ((bits << 8) + LOG2_TABLE[(mantissa & 0xff) as usize] as u32) as i32
}

/// Signed fixed-point `log2`.
#[inline]
pub fn log2s(value: i32) -> i32 {
    if value < 0 {
        -log2(value.unsigned_abs())
    } else {
        log2(value as u32)
    }
}

/// Expands an 8-bit stored decorrelation weight to its 1024-based value.
#[inline]
pub fn restore_weight(weight: i8) -> i32 {
    let mut result = (weight as i32) << 3;

    if result > 0 {
        result += (result + 64) >> 7;
    }

    result
}

/// Quantises a decorrelation weight to the 8-bit form [`restore_weight`] expands.
#[inline]
pub fn store_weight(weight: i32) -> i8 {
    let mut weight = weight.clamp(-1024, 1024);

    if weight > 0 {
        weight -= (weight + 64) >> 7;
    }

    ((weight + 4) >> 3) as i8
}

#[test]
fn exp2_log2_tables() {
    assert_eq!(log2(0), 0);
    assert_eq!(log2(1), 256);
    assert_eq!(log2(2), 512);
    assert_eq!(log2(3), 512 + 150);
    assert_eq!(exp2s(256), 1);
    assert_eq!(exp2s(512), 2);
    assert_eq!(exp2s(8 << 8), 128);
    assert_eq!(exp2s(-(8 << 8)), -128);
    assert_eq!(exp2s(0), 0);
    assert_eq!(exp2s(31 << 8), 1 << 30);
    assert_eq!(exp2s(40 << 8), 0);
    assert_eq!(exp2s(42 << 8), 0x200);
    assert_eq!(exp2s((41 << 8) | 0x80), 0x16a);

    for value in [5, 100, 1000, 12345, 1 << 20] {
        let back = exp2s(log2s(value));
        let err = (back - value).abs() as f64 / value as f64;
        assert!(err < 0.01, "{value} -> {back}");
    }

    assert_eq!(log2s(-1000), -log2s(1000));
}

#[test]
fn tables_follow_their_definitions() {
    for i in 0..256usize {
        let fraction = i as f64 / 256.0;
        let exp = (256.0 * fraction.exp2()).round() as u32 - 256;
        let log = (256.0 * (1.0 + fraction).log2()).round() as u32;
        assert_eq!(EXP2_TABLE[i] as u32, exp, "exp2 entry {i}");
        assert_eq!(LOG2_TABLE[i] as u32, log, "log2 entry {i}");
    }
}

#[test]
fn weight_quantisation() {
    assert_eq!(restore_weight(0), 0);
    assert_eq!(restore_weight(1), 8);
    assert_eq!(restore_weight(127), 1024);
    assert_eq!(restore_weight(-128), -1024);

    for weight in [-1024, -500, -8, 0, 8, 500, 1024] {
        let stored = store_weight(weight);
        assert!((restore_weight(stored) - weight).abs() <= 8, "{weight}");
    }
}
