use crate::{constants::HASH_LEN, error::ProtoError};

/// Bounds-checked little-endian reader over a payload slice.
///
/// Every read either consumes exactly the bytes it returns or fails with
/// [`ProtoError::TooShort`] and leaves the position untouched. Returned slices
/// borrow from the underlying payload, not from the cursor.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail, without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(ProtoError::TooShort {
                needed: n,
                remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ProtoError> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProtoError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_hash(&mut self) -> Result<[u8; HASH_LEN], ProtoError> {
        self.read_array::<HASH_LEN>()
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtoError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtoError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtoError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtoError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtoError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }
}
