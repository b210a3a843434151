#![forbid(unsafe_code)]
//! Encoding, varint, and buffer utilities shared across storage layers.

mod static_buffer;

pub use static_buffer::StaticBuffer;

pub mod ord {
    //! Order-preserving encoders for numeric and string keys.
    //!
    //! Every encoder here produces bytes whose unsigned lexicographic order
    //! matches the natural order of the encoded values.

    use crate::types::{KcvError, Result};

    const SIGN_BIT_64: u64 = 1 << 63;
    const SIGN_BIT_32: u32 = 1 << 31;
    const ESCAPE: u8 = 0x00;
    const ESCAPED_ZERO: u8 = 0xFF;
    const TERMINATOR: u8 = 0x01;

    /// Big-endian encoding for lexicographic order preservation.
    pub fn u64_key(v: u64) -> [u8; 8] {
        v.to_be_bytes()
    }

    /// Encodes a signed i64 with order preservation (flip sign bit for sorting).
    pub fn i64_key(v: i64) -> [u8; 8] {
        ((v as u64) ^ SIGN_BIT_64).to_be_bytes()
    }

    /// Decodes a signed i64 produced by [`i64_key`].
    pub fn i64_from_key(bytes: [u8; 8]) -> i64 {
        (u64::from_be_bytes(bytes) ^ SIGN_BIT_64) as i64
    }

    /// Encodes a signed i32 with order preservation.
    pub fn i32_key(v: i32) -> [u8; 4] {
        ((v as u32) ^ SIGN_BIT_32).to_be_bytes()
    }

    /// Decodes a signed i32 produced by [`i32_key`].
    pub fn i32_from_key(bytes: [u8; 4]) -> i32 {
        (u32::from_be_bytes(bytes) ^ SIGN_BIT_32) as i32
    }

    /// Encodes an f64 with order preservation. NaN has no position in the order.
    pub fn f64_key(v: f64) -> Result<[u8; 8]> {
        if v.is_nan() {
            return Err(KcvError::invalid_value("NaN cannot be encoded as a key"));
        }
        let bits = v.to_bits();
        let encoded = if bits & SIGN_BIT_64 != 0 {
            !bits
        } else {
            bits ^ SIGN_BIT_64
        };
        Ok(encoded.to_be_bytes())
    }

    /// Decodes an f64 produced by [`f64_key`].
    pub fn f64_from_key(bytes: [u8; 8]) -> f64 {
        let encoded = u64::from_be_bytes(bytes);
        let bits = if encoded & SIGN_BIT_64 != 0 {
            encoded ^ SIGN_BIT_64
        } else {
            !encoded
        };
        f64::from_bits(bits)
    }

    /// Appends `bytes` escaped and terminated so that shorter values sort before
    /// longer values sharing the same prefix.
    ///
    /// `0x00` is written as `0x00 0xFF`; the value ends with `0x00 0x01`.
    pub fn put_escaped(dst: &mut Vec<u8>, bytes: &[u8]) {
        dst.reserve(bytes.len() + 2);
        for &b in bytes {
            if b == ESCAPE {
                dst.push(ESCAPE);
                dst.push(ESCAPED_ZERO);
            } else {
                dst.push(b);
            }
        }
        dst.push(ESCAPE);
        dst.push(TERMINATOR);
    }

    /// Reads a value written by [`put_escaped`], returning the unescaped bytes and
    /// the number of source bytes consumed.
    pub fn split_escaped(src: &[u8]) -> Result<(Vec<u8>, usize)> {
        let mut out = Vec::new();
        let mut idx = 0;
        while idx < src.len() {
            let b = src[idx];
            if b != ESCAPE {
                out.push(b);
                idx += 1;
                continue;
            }
            match src.get(idx + 1) {
                Some(&ESCAPED_ZERO) => {
                    out.push(ESCAPE);
                    idx += 2;
                }
                Some(&TERMINATOR) => return Ok((out, idx + 2)),
                Some(other) => {
                    return Err(KcvError::corruption(format!(
                        "invalid escape sequence 0x00 0x{other:02x} at offset {idx}"
                    )))
                }
                None => break,
            }
        }
        Err(KcvError::corruption("escaped value missing terminator"))
    }
}

pub mod var {
    //! Unsigned varints and ZigZag signed integers.

    use crate::types::{KcvError, Result};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or_else(|| KcvError::corruption(format!("varint truncated at byte {i}")))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(KcvError::corruption("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(KcvError::corruption("varint longer than 10 bytes"))
    }

    /// Encodes an i64 as a ZigZag-encoded varint.
    pub fn encode_i64(v: i64, out: &mut Vec<u8>) {
        let zigzag = ((v << 1) ^ (v >> 63)) as u64;
        encode_u64(zigzag, out);
    }

    /// Decodes a ZigZag-encoded i64 varint from a slice, updating the offset.
    pub fn decode_i64(src: &[u8], off: &mut usize) -> Result<i64> {
        let zigzag = decode_u64(src, off)?;
        Ok(((zigzag >> 1) as i64) ^ (-((zigzag & 1) as i64)))
    }
}

pub mod buf {
    //! Write buffers and a read cursor for field-by-field decoding.

    use core::fmt;

    use bytes::{BufMut, BytesMut};

    use super::{ord, var, StaticBuffer};
    use crate::types::{KcvError, Result};

    /// Growable buffer that freezes into a [`StaticBuffer`].
    #[derive(Default)]
    pub struct WriteBuffer {
        inner: BytesMut,
    }

    impl WriteBuffer {
        /// Creates an empty buffer.
        pub fn new() -> Self {
            Self::default()
        }

        /// Creates an empty buffer with room for `capacity` bytes.
        pub fn with_capacity(capacity: usize) -> Self {
            Self {
                inner: BytesMut::with_capacity(capacity),
            }
        }

        /// Appends one byte.
        pub fn put_u8(&mut self, v: u8) -> &mut Self {
            self.inner.put_u8(v);
            self
        }

        /// Appends a big-endian u32.
        pub fn put_u32(&mut self, v: u32) -> &mut Self {
            self.inner.put_u32(v);
            self
        }

        /// Appends a big-endian u64.
        pub fn put_u64(&mut self, v: u64) -> &mut Self {
            self.inner.put_u64(v);
            self
        }

        /// Appends an order-preserving i64.
        pub fn put_i64(&mut self, v: i64) -> &mut Self {
            self.inner.put_slice(&ord::i64_key(v));
            self
        }

        /// Appends an unsigned varint.
        pub fn put_var_u64(&mut self, v: u64) -> &mut Self {
            let mut tmp = Vec::with_capacity(10);
            var::encode_u64(v, &mut tmp);
            self.inner.put_slice(&tmp);
            self
        }

        /// Appends raw bytes.
        pub fn put_slice(&mut self, bytes: &[u8]) -> &mut Self {
            self.inner.put_slice(bytes);
            self
        }

        /// Appends escaped, terminated bytes (see [`ord::put_escaped`]).
        pub fn put_escaped(&mut self, bytes: &[u8]) -> &mut Self {
            let mut tmp = Vec::with_capacity(bytes.len() + 2);
            ord::put_escaped(&mut tmp, bytes);
            self.inner.put_slice(&tmp);
            self
        }

        /// Number of bytes written so far.
        pub fn len(&self) -> usize {
            self.inner.len()
        }

        /// Returns true when nothing has been written.
        pub fn is_empty(&self) -> bool {
            self.inner.is_empty()
        }

        /// Freezes the buffer.
        pub fn freeze(self) -> StaticBuffer {
            StaticBuffer::from(self.inner.freeze())
        }
    }

    /// A cursor for reading bytes from a slice with offset tracking.
    ///
    /// Every read either advances exactly past the value or fails with
    /// [`KcvError::Corruption`] leaving the offset unspecified.
    pub struct ReadCursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> ReadCursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Current read offset.
        pub fn position(&self) -> usize {
            self.off
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Returns true once every byte has been consumed.
        pub fn is_exhausted(&self) -> bool {
            self.remaining() == 0
        }

        /// Takes the next `n` bytes from the cursor, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or_else(|| KcvError::corruption("cursor offset overflow"))?;
            if end > self.buf.len() {
                return Err(KcvError::corruption(format!(
                    "cursor read beyond buffer: need {}, remaining {}",
                    n,
                    self.remaining()
                )));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
            let mut out = [0u8; N];
            out.copy_from_slice(self.take(N)?);
            Ok(out)
        }

        /// Reads one byte.
        pub fn get_u8(&mut self) -> Result<u8> {
            Ok(self.take_array::<1>()?[0])
        }

        /// Reads a big-endian u32.
        pub fn get_u32(&mut self) -> Result<u32> {
            Ok(u32::from_be_bytes(self.take_array()?))
        }

        /// Reads a big-endian u64.
        pub fn get_u64(&mut self) -> Result<u64> {
            Ok(u64::from_be_bytes(self.take_array()?))
        }

        /// Reads an order-preserving i64.
        pub fn get_i64(&mut self) -> Result<i64> {
            Ok(ord::i64_from_key(self.take_array()?))
        }

        /// Reads an order-preserving i32.
        pub fn get_i32(&mut self) -> Result<i32> {
            Ok(ord::i32_from_key(self.take_array()?))
        }

        /// Reads an order-preserving f64.
        pub fn get_f64(&mut self) -> Result<f64> {
            Ok(ord::f64_from_key(self.take_array()?))
        }

        /// Reads an unsigned varint.
        pub fn get_var_u64(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Reads an escaped, terminated byte string.
        pub fn get_escaped(&mut self) -> Result<Vec<u8>> {
            let (bytes, consumed) = ord::split_escaped(&self.buf[self.off..])?;
            self.off += consumed;
            Ok(bytes)
        }
    }

    impl<'a> fmt::Debug for ReadCursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ReadCursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
