//! Utilities for encoding, decoding, and displaying hex-formatted data.
//!
//! Verification-key hashes, transaction hashes, and datum byte fields all
//! cross the wire as lowercase hex; this crate is the one place that parses
//! and renders them.

use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors which can be produced while decoding a hex string.
#[derive(Copy, Clone, Debug, Error, Serialize, Deserialize)]
pub enum DecodeError {
    #[error("hex decode error: output buffer length != half input length")]
    BadOutputLength,

    #[error("hex decode error: input contains non-hex character")]
    InvalidCharacter,

    #[error("hex decode error: input string length must be even")]
    OddInputLength,
}

// --- Public functions --- //

/// Convert a byte slice to an owned hex string. If you simply need to display
/// a byte slice as hex, use [`display`] instead, which avoids the allocation.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(encode_nibble(byte >> 4) as char);
        out.push(encode_nibble(byte & 0x0f) as char);
    }
    out
}

/// Try to decode a hex string to owned bytes (`Vec<u8>`).
pub fn decode(hex: &str) -> Result<Vec<u8>, DecodeError> {
    if hex.len() % 2 != 0 {
        return Err(DecodeError::OddInputLength);
    }
    let mut out = vec![0u8; hex.len() / 2];
    decode_to_slice(hex, &mut out).map(|()| out)
}

/// Decodes a hex string into an output buffer.
pub fn decode_to_slice(hex: &str, out: &mut [u8]) -> Result<(), DecodeError> {
    let hex = hex.as_bytes();
    if hex.len() % 2 != 0 {
        return Err(DecodeError::OddInputLength);
    }
    if hex.len() != out.len() * 2 {
        return Err(DecodeError::BadOutputLength);
    }

    for (chunk, out_i) in hex.chunks_exact(2).zip(out) {
        let b_hi = decode_nibble(chunk[0])?;
        let b_lo = decode_nibble(chunk[1])?;
        *out_i = (b_hi << 4) | b_lo;
    }

    Ok(())
}

/// Get a [`HexDisplay`] which provides `Debug` and `Display` impls for the
/// given byte slice. Useful for displaying a hex value without allocating.
#[inline]
pub fn display(bytes: &[u8]) -> HexDisplay<'_> {
    HexDisplay(bytes)
}

// --- FromHex trait --- //

/// A trait to deserialize something from a hex-encoded string slice.
///
/// ```
/// use escrow_hex::FromHex;
/// let s = "e7f51d925349a26f742e6eef3670f489aaf14fbbb5b5c3f209892f2f1baae1c9";
///
/// <Vec<u8>>::from_hex(s).unwrap();
/// <[u8; 32]>::from_hex(s).unwrap();
/// ```
pub trait FromHex: Sized {
    fn from_hex(s: &str) -> Result<Self, DecodeError>;
}

impl FromHex for Vec<u8> {
    fn from_hex(s: &str) -> Result<Self, DecodeError> {
        decode(s)
    }
}

impl<const N: usize> FromHex for [u8; N] {
    fn from_hex(s: &str) -> Result<Self, DecodeError> {
        let mut out = [0u8; N];
        decode_to_slice(s, out.as_mut_slice())?;
        Ok(out)
    }
}

// --- HexDisplay implementation --- //

/// Provides `Debug` and `Display` impls for a byte slice.
/// Useful for displaying a hex value without allocating via [`encode`].
pub struct HexDisplay<'a>(&'a [u8]);

impl fmt::Display for HexDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            f.write_char(encode_nibble(byte >> 4) as char)?;
            f.write_char(encode_nibble(byte & 0x0f) as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexDisplay<'_> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

// --- Internal helpers --- //

#[inline(always)]
const fn encode_nibble(nib: u8) -> u8 {
    match nib {
        0..=9 => b'0' + nib,
        _ => b'a' + (nib - 10),
    }
}

#[inline]
const fn decode_nibble(x: u8) -> Result<u8, DecodeError> {
    match x {
        b'0'..=b'9' => Ok(x - b'0'),
        b'a'..=b'f' => Ok(x - b'a' + 10),
        b'A'..=b'F' => Ok(x - b'A' + 10),
        _ => Err(DecodeError::InvalidCharacter),
    }
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, collection::vec, proptest};

    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!("", encode(&[]));
        assert_eq!(
            "01348900abff",
            encode(&[0x01, 0x34, 0x89, 0x00, 0xab, 0xff])
        );
    }

    #[test]
    fn test_decode() {
        assert_eq!(
            decode("01348900abff").unwrap(),
            vec![0x01, 0x34, 0x89, 0x00, 0xab, 0xff],
        );
        assert!(decode("012").is_err());
        assert!(decode("zz").is_err());
    }

    #[test]
    fn test_roundtrip_b2s2b() {
        proptest!(|(bytes in vec(any::<u8>(), 0..64))| {
            assert_eq!(bytes.as_slice(), decode(&encode(&bytes)).unwrap());
        })
    }

    #[test]
    fn test_fixed_array() {
        let arr = <[u8; 4]>::from_hex("deadbeef").unwrap();
        assert_eq!(arr, [0xde, 0xad, 0xbe, 0xef]);
        assert!(<[u8; 4]>::from_hex("deadbe").is_err());
    }

    #[test]
    fn test_display_matches_encode() {
        let bytes = [0x00, 0x7f, 0xff];
        assert_eq!(format!("{}", display(&bytes)), encode(&bytes));
    }
}
