//! Serialization traits and primitive field codecs.
//!
//! Every protocol message is serialised by hand: fixed-width integers are
//! little-endian, byte arrays and sequences are length-prefixed with a
//! 64-bit count, and polymorphic bodies carry a leading 16-bit tag. The
//! [`ToBytes`]/[`FromBytes`] pair below is implemented by every wire type.

use anyhow::{anyhow, Context};

use crate::message::DecodeError;

/// An interface for serialisable message types.
///
/// See also [`FromBytes`] for deserialization.
pub trait ToBytes {
    /// The number of bytes this value occupies when serialised.
    fn buffer_length(&self) -> usize;

    /// Appends the serialised value to `buffer`.
    ///
    /// Exactly [`buffer_length()`] bytes are written.
    ///
    /// [`buffer_length()`]: ToBytes::buffer_length
    fn to_bytes(&self, buffer: &mut Vec<u8>);
}

/// An interface for deserialisable message types.
///
/// See also [`ToBytes`] for serialization.
pub trait FromBytes: Sized {
    /// Deserialises the type from the reader, advancing it past the
    /// consumed bytes.
    ///
    /// # Errors
    /// Fails if the buffer is exhausted or a field fails its validity check.
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError>;
}

/// A cursor over a received byte buffer.
///
/// Reads are bounds-checked; a truncated buffer surfaces as a
/// [`DecodeError`] rather than a panic, so a malformed frame can never take
/// the node down.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// The number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Takes the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(anyhow!(
                "buffer exhausted: needed {} bytes, {} left",
                n,
                self.remaining()
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Takes the next `N` bytes as a fixed-size array.
    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads a 64-bit length prefix and validates it against the remaining
    /// buffer, so a corrupted count cannot trigger a huge allocation.
    pub fn take_count(&mut self) -> Result<usize, DecodeError> {
        let count = u64::from_bytes(self)? as usize;
        if count > self.remaining() {
            return Err(anyhow!(
                "length prefix {} exceeds remaining buffer ({} bytes)",
                count,
                self.remaining()
            ));
        }
        Ok(count)
    }
}

impl ToBytes for u8 {
    fn buffer_length(&self) -> usize {
        1
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        buffer.push(*self);
    }
}

impl FromBytes for u8 {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(reader.take_array::<1>().context("cannot read u8")?[0])
    }
}

impl ToBytes for bool {
    fn buffer_length(&self) -> usize {
        1
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        buffer.push(*self as u8);
    }
}

impl FromBytes for bool {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        match u8::from_bytes(reader).context("cannot read bool")? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(anyhow!("invalid bool encoding: {}", other)),
        }
    }
}

macro_rules! impl_le_int {
    ($ty:ty) => {
        impl ToBytes for $ty {
            fn buffer_length(&self) -> usize {
                std::mem::size_of::<$ty>()
            }

            fn to_bytes(&self, buffer: &mut Vec<u8>) {
                buffer.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl FromBytes for $ty {
            fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
                let bytes = reader
                    .take_array::<{ std::mem::size_of::<$ty>() }>()
                    .context(concat!("cannot read ", stringify!($ty)))?;
                Ok(<$ty>::from_le_bytes(bytes))
            }
        }
    };
}

impl_le_int!(u16);
impl_le_int!(i16);
impl_le_int!(u32);
impl_le_int!(i32);
impl_le_int!(u64);
impl_le_int!(i64);

impl<T: ToBytes> ToBytes for Vec<T> {
    fn buffer_length(&self) -> usize {
        8 + self.iter().map(ToBytes::buffer_length).sum::<usize>()
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        (self.len() as u64).to_bytes(buffer);
        for item in self {
            item.to_bytes(buffer);
        }
    }
}

impl<T: FromBytes> FromBytes for Vec<T> {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let count = reader.take_count().context("cannot read sequence length")?;
        let mut items = Vec::with_capacity(count);
        for i in 0..count {
            items.push(T::from_bytes(reader).with_context(|| format!("invalid item {}", i))?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_integers() {
        let mut buf = Vec::new();
        0x1234u16.to_bytes(&mut buf);
        (-7i32).to_bytes(&mut buf);
        0xdead_beef_u32.to_bytes(&mut buf);
        42u64.to_bytes(&mut buf);
        assert_eq!(buf.len(), 2 + 4 + 4 + 8);
        // Little-endian on the wire.
        assert_eq!(&buf[..2], &[0x34, 0x12]);

        let mut reader = ByteReader::new(&buf);
        assert_eq!(u16::from_bytes(&mut reader).unwrap(), 0x1234);
        assert_eq!(i32::from_bytes(&mut reader).unwrap(), -7);
        assert_eq!(u32::from_bytes(&mut reader).unwrap(), 0xdead_beef);
        assert_eq!(u64::from_bytes(&mut reader).unwrap(), 42);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn truncated_read_fails() {
        let buf = vec![0x01, 0x02];
        let mut reader = ByteReader::new(&buf);
        assert!(u32::from_bytes(&mut reader).is_err());
    }

    #[test]
    fn bool_encoding_is_strict() {
        let mut reader = ByteReader::new(&[2u8]);
        assert!(bool::from_bytes(&mut reader).is_err());
        let mut reader = ByteReader::new(&[1u8]);
        assert!(bool::from_bytes(&mut reader).unwrap());
    }

    #[test]
    fn vec_round_trip() {
        let ids: Vec<i32> = vec![3, -1, 7];
        let mut buf = Vec::new();
        ids.to_bytes(&mut buf);
        assert_eq!(buf.len(), ids.buffer_length());

        let mut reader = ByteReader::new(&buf);
        let parsed: Vec<i32> = Vec::from_bytes(&mut reader).unwrap();
        assert_eq!(parsed, ids);
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut buf = Vec::new();
        u64::MAX.to_bytes(&mut buf);
        let mut reader = ByteReader::new(&buf);
        assert!(Vec::<u8>::from_bytes(&mut reader).is_err());
    }
}
