// SPDX-License-Identifier: MPL-2.0

//! Wire encoding and decoding.
//!
//! Every integer on the wire is little-endian. Composite objects that need
//! context to parse (field sizing, hasher families) take it through the
//! decoding parameter of [`Decode`].

use std::io::{Cursor, Read};

/// Possible errors while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An error occurred while reading from the message buffer.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    /// Bytes remained in the buffer after the message was fully decoded.
    #[error("{0} bytes left over after decoding value")]
    BytesLeftOver(usize),
    /// A decoded value is structurally impossible.
    #[error("unexpected value")]
    UnexpectedValue,
}

/// Describes how to serialize an object into a byte sequence.
pub trait Encode {
    /// Append the encoded form of this object to the end of `bytes`.
    fn encode(&self, bytes: &mut Vec<u8>);

    /// Convenience function to encode into a fresh byte vector.
    fn get_encoded(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.encode(&mut bytes);
        bytes
    }
}

/// Describes how to parse an object from a byte sequence, given a decoding
/// parameter carrying whatever context the object cannot carry itself.
pub trait Decode<P>: Sized {
    /// Read and decode one object from `bytes`.
    fn decode(decoding_parameter: &P, bytes: &mut Cursor<&[u8]>) -> Result<Self, CodecError>;

    /// Convenience function to decode from a complete buffer, rejecting
    /// trailing garbage.
    fn get_decoded(decoding_parameter: &P, bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let decoded = Self::decode(decoding_parameter, &mut cursor)?;
        let remaining = bytes.len() - cursor.position() as usize;
        if remaining != 0 {
            return Err(CodecError::BytesLeftOver(remaining));
        }
        Ok(decoded)
    }
}

macro_rules! le_int_codec {
    ($int:ty) => {
        impl Encode for $int {
            fn encode(&self, bytes: &mut Vec<u8>) {
                bytes.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl Decode<()> for $int {
            fn decode(_: &(), bytes: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
                let mut buf = [0u8; std::mem::size_of::<$int>()];
                bytes.read_exact(&mut buf)?;
                Ok(<$int>::from_le_bytes(buf))
            }
        }
    };
}

le_int_codec!(u16);
le_int_codec!(u32);
le_int_codec!(u64);
le_int_codec!(i32);

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_int_roundtrip() {
        let mut bytes = Vec::new();
        0xbeefu16.encode(&mut bytes);
        0xdead_beefu32.encode(&mut bytes);
        0x0123_4567_89ab_cdefu64.encode(&mut bytes);
        (-7i32).encode(&mut bytes);
        assert_eq!(bytes.len(), 2 + 4 + 8 + 4);

        let mut cursor = Cursor::new(&bytes[..]);
        assert_eq!(u16::decode(&(), &mut cursor).unwrap(), 0xbeef);
        assert_eq!(u32::decode(&(), &mut cursor).unwrap(), 0xdead_beef);
        assert_eq!(u64::decode(&(), &mut cursor).unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(i32::decode(&(), &mut cursor).unwrap(), -7);
    }

    #[test]
    fn test_little_endian_layout() {
        assert_eq!(0x0102u16.get_encoded(), vec![0x02, 0x01]);
    }

    #[test]
    fn test_leftover_bytes_rejected() {
        let result = u16::get_decoded(&(), &[1, 2, 3]);
        assert_matches!(result, Err(CodecError::BytesLeftOver(1)));
    }

    #[test]
    fn test_short_read_rejected() {
        let result = u32::get_decoded(&(), &[1, 2]);
        assert_matches!(result, Err(CodecError::Io(_)));
    }
}
