//! Bounds-checked little-endian reading and writing.

use crate::error::{LoadError, Result};

/// Cursor over a byte slice. Every read is checked against the slice end and
/// fails with [`LoadError::Truncated`] naming what was being read.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    /// Reader positioned at `offset`.
    pub fn at(data: &'a [u8], offset: usize, what: &'static str) -> Result<Self> {
        if offset > data.len() {
            return Err(LoadError::Truncated {
                what,
                offset,
                needed: 0,
                size: data.len(),
            });
        }
        Ok(Self {
            data,
            pos: offset,
            what,
        })
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(LoadError::Truncated {
                what: self.what,
                offset: self.pos,
                needed: len,
                size: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }
}

/// Little-endian append helpers for the writer.
pub(crate) trait PutLe {
    fn put_u16(&mut self, value: u16);
    fn put_u32(&mut self, value: u32);
    fn put_u64(&mut self, value: u64);
    fn pad_to(&mut self, alignment: usize);
    fn patch_u32(&mut self, at: usize, value: u32);
}

impl PutLe for Vec<u8> {
    fn put_u16(&mut self, value: u16) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    fn pad_to(&mut self, alignment: usize) {
        let len = self.len().next_multiple_of(alignment);
        self.resize(len, 0);
    }

    fn patch_u32(&mut self, at: usize, value: u32) {
        self[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}
