//! Bit-level reading for WavPack bitstreams.
//!
//! WavPack packs its bitstreams least-significant bit first within
//! little-endian 16-bit words, which is the same order as reading bytes
//! LSB first. Every read past the end of the buffer fails with
//! [`TruncatedStreamError`].

use std::io;

use anyhow::{Result, bail};
use bitstream_io::{BitRead, BitReader, LittleEndian, SignedInteger, UnsignedInteger};

use crate::utils::errors::TruncatedStreamError;

#[derive(Debug)]
pub struct BitstreamIoReader<R: io::Read + io::Seek> {
    bs: BitReader<R, LittleEndian>,
    len: u64,
}

pub type BsIoSliceReader<'a> = BitstreamIoReader<io::Cursor<&'a [u8]>>;

impl<R> BitstreamIoReader<R>
where
    R: io::Read + io::Seek,
{
    pub fn new(read: R, len_bytes: u64) -> Self {
        Self {
            bs: BitReader::new(read),
            len: len_bytes << 3,
        }
    }

    #[inline(always)]
    pub fn get(&mut self) -> Result<bool> {
        match self.bs.read_bit() {
            Ok(bit) => Ok(bit),
            Err(e) => self.truncated(e, 1),
        }
    }

    #[inline(always)]
    pub fn get_n<I: UnsignedInteger>(&mut self, n: u32) -> Result<I> {
        if n == 0 {
            return Ok(I::default());
        }

        match self.bs.read_unsigned_var(n) {
            Ok(val) => Ok(val),
            Err(e) => self.truncated(e, n),
        }
    }

    #[inline(always)]
    pub fn get_s<S: SignedInteger>(&mut self, n: u32) -> Result<S> {
        match self.bs.read_signed_var(n) {
            Ok(val) => Ok(val),
            Err(e) => self.truncated(e, n),
        }
    }

    /// Counts consecutive one bits up to `limit`, consuming the terminating
    /// zero when one is found before the limit.
    #[inline(always)]
    pub fn get_unary(&mut self, limit: u32) -> Result<u32> {
        let mut count = 0;

        while count < limit && self.get()? {
            count += 1;
        }

        Ok(count)
    }

    #[inline(always)]
    pub fn align(&mut self) {
        self.bs.byte_align();
    }

    #[inline(always)]
    pub fn read_le16(&mut self) -> Result<u16> {
        self.align();
        self.get_n::<u16>(16)
    }

    #[inline(always)]
    pub fn read_le32(&mut self) -> Result<u32> {
        self.align();
        self.get_n::<u32>(32)
    }

    #[inline(always)]
    pub fn available(&mut self) -> Result<u64> {
        Ok(self.len.saturating_sub(self.position()?))
    }

    #[inline(always)]
    pub fn skip_n(&mut self, n: u64) -> Result<()> {
        if n > self.available()? {
            bail!(TruncatedStreamError::Skip(n));
        }

        let mut remaining = n;
        while remaining > 0 {
            let step = remaining.min(u32::MAX as u64) as u32;
            self.bs.skip(step)?;
            remaining -= step as u64;
        }

        Ok(())
    }

    #[inline(always)]
    pub fn position(&mut self) -> Result<u64> {
        Ok(self.bs.position_in_bits()?)
    }

    #[cold]
    fn truncated<T>(&mut self, e: io::Error, requested: u32) -> Result<T> {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            let position = self.bs.position_in_bits().unwrap_or(self.len);
            bail!(TruncatedStreamError::Bits {
                requested,
                position
            });
        }

        Err(e.into())
    }
}

impl<'a> BsIoSliceReader<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        let len = buf.len() as u64;
        let read = io::Cursor::new(buf);

        Self::new(read, len)
    }
}

impl Default for BsIoSliceReader<'_> {
    fn default() -> Self {
        Self::from_slice(&[])
    }
}

#[test]
fn lsb_first_bits() -> anyhow::Result<()> {
    let mut reader = BsIoSliceReader::from_slice(&[0b1010_0110, 0xff, 0x34, 0x12]);

    assert!(!reader.get()?);
    assert!(reader.get()?);
    assert_eq!(reader.get_n::<u32>(3)?, 0b001);
    assert_eq!(reader.get_n::<u32>(0)?, 0);
    assert_eq!(reader.get_unary(8)?, 1);
    assert_eq!(reader.get_unary(4)?, 4);
    assert_eq!(reader.position()?, 11);
    assert_eq!(reader.read_le16()?, 0x1234);
    assert_eq!(reader.available()?, 0);

    Ok(())
}

#[test]
fn reads_past_end_are_truncation_errors() {
    let mut reader = BsIoSliceReader::from_slice(&[0xff]);

    assert_eq!(reader.get_unary(8).ok(), Some(8));
    let err = reader.get().unwrap_err();
    assert!(err.downcast_ref::<TruncatedStreamError>().is_some());

    let mut reader = BsIoSliceReader::from_slice(&[0x01, 0x02, 0x03]);
    let err = reader.read_le32().unwrap_err();
    assert!(err.downcast_ref::<TruncatedStreamError>().is_some());

    let mut reader = BsIoSliceReader::from_slice(&[0x01]);
    assert!(reader.skip_n(9).is_err());
    assert!(reader.skip_n(8).is_ok());
}

#[test]
fn signed_reads() -> anyhow::Result<()> {
    let mut reader = BsIoSliceReader::from_slice(&[0x0f]);
    assert_eq!(reader.get_s::<i8>(4)?, -1);
    assert_eq!(reader.get_s::<i8>(4)?, 0);

    Ok(())
}
