use std::borrow::Borrow;
use std::fmt;
use std::ops::{Deref, Range};

use bytes::Bytes;

use crate::types::{KcvError, Result};

/// Immutable, cheaply clonable byte sequence used for every key, column and value.
///
/// Equality is byte equality and ordering is unsigned lexicographic, so the
/// derived comparisons on the inner [`Bytes`] are exactly the storage order.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StaticBuffer(Bytes);

impl StaticBuffer {
    /// The empty buffer.
    pub fn empty() -> Self {
        StaticBuffer(Bytes::new())
    }

    /// Wraps a static byte slice without copying.
    pub const fn from_static(bytes: &'static [u8]) -> Self {
        StaticBuffer(Bytes::from_static(bytes))
    }

    /// Copies `bytes` into a new buffer.
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        StaticBuffer(Bytes::copy_from_slice(bytes))
    }

    /// Buffer of `len` zero bytes, the smallest buffer of that length.
    pub fn zero(len: usize) -> Self {
        StaticBuffer(Bytes::from(vec![0u8; len]))
    }

    /// Buffer of `len` `0xFF` bytes, the largest buffer of that length.
    pub fn one(len: usize) -> Self {
        StaticBuffer(Bytes::from(vec![0xFFu8; len]))
    }

    /// Big-endian encoding of `v`.
    pub fn from_u64(v: u64) -> Self {
        StaticBuffer(Bytes::copy_from_slice(&v.to_be_bytes()))
    }

    /// Decodes a buffer produced by [`StaticBuffer::from_u64`].
    pub fn as_u64(&self) -> Result<u64> {
        self.u64_at(0)
    }

    /// Reads a big-endian u64 starting at `offset`.
    pub fn u64_at(&self, offset: usize) -> Result<u64> {
        let end = offset
            .checked_add(8)
            .ok_or_else(|| KcvError::corruption("u64 offset overflow"))?;
        let bytes = self.0.get(offset..end).ok_or_else(|| {
            KcvError::corruption(format!(
                "buffer of {} bytes too short for u64 at offset {offset}",
                self.len()
            ))
        })?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    /// Borrowed view of the bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Number of bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the empty buffer.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Zero-copy sub-buffer.
    pub fn slice(&self, range: Range<usize>) -> Self {
        StaticBuffer(self.0.slice(range))
    }

    /// Returns true when `prefix` is a prefix of this buffer.
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    /// Smallest buffer strictly greater than every buffer starting with `self`,
    /// or `None` when no such buffer exists (all bytes `0xFF` or empty).
    pub fn next_prefix(&self) -> Option<StaticBuffer> {
        let mut bytes = self.0.to_vec();
        while let Some(last) = bytes.pop() {
            if last != 0xFF {
                bytes.push(last + 1);
                return Some(StaticBuffer::from(bytes));
            }
        }
        None
    }

    /// Returns the underlying [`Bytes`].
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Deref for StaticBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for StaticBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for StaticBuffer {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for StaticBuffer {
    fn from(value: Bytes) -> Self {
        StaticBuffer(value)
    }
}

impl From<Vec<u8>> for StaticBuffer {
    fn from(value: Vec<u8>) -> Self {
        StaticBuffer(Bytes::from(value))
    }
}

impl From<&[u8]> for StaticBuffer {
    fn from(value: &[u8]) -> Self {
        StaticBuffer::copy_from_slice(value)
    }
}

impl From<&str> for StaticBuffer {
    fn from(value: &str) -> Self {
        StaticBuffer::copy_from_slice(value.as_bytes())
    }
}

impl fmt::Debug for StaticBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Display for StaticBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}
