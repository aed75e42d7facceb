// SPDX-License-Identifier: MPL-2.0

//! Field elements holding key and hash sums as base-p digit vectors.
//!
//! A bucket's key sum represents the unordered multiset of inserted keys as
//! the digit-wise sum of their encodings in `GF(p)^C`, where `p` is the
//! small prime chosen for the party count and `C` is the number of base-`p`
//! digits needed for the key width. Because each digit is strictly below
//! `p`, the encoding is injective and a sum of `m` copies of one key can be
//! inverted by dividing every digit by `m`.

use crate::codec::{CodecError, Decode, Encode};
use crate::fp::{gcd, SmallFp};
use std::io::{Cursor, Read};
use std::ops::{AddAssign, SubAssign};

/// Width in bits of the block keys carried by the sketches.
pub const KEY_BITS: usize = 64;

/// Width in bits of the tabulation hash values used as fingerprints.
pub const HASH_BITS: usize = 64;

/// An element of `GF(p)^C`: the digit-vector sum stored in a bucket cell.
///
/// For the two-party case `p = 2`, the digits are the bits of the encoded
/// value and every operation collapses to XOR.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldElem {
    fp: SmallFp,
    digits: Vec<u8>,
}

impl FieldElem {
    /// The additive identity, sized for `width_bits`-bit values.
    pub(crate) fn zero(fp: SmallFp, width_bits: usize) -> Self {
        FieldElem {
            fp,
            digits: vec![0; fp.num_digits(width_bits)],
        }
    }

    /// Encodes a value as its base-`p` digit vector, little-endian digit
    /// order.
    pub(crate) fn encode_value(fp: SmallFp, width_bits: usize, value: u64) -> Self {
        let mut digits = vec![0u8; fp.num_digits(width_bits)];
        let mut rest = value;
        for digit in digits.iter_mut() {
            *digit = (rest % fp.p as u64) as u8;
            rest /= fp.p as u64;
        }
        debug_assert_eq!(rest, 0);
        FieldElem { fp, digits }
    }

    /// Folds the digit vector back into the value it encodes.
    pub(crate) fn decode_value(&self) -> u64 {
        let mut value = 0u128;
        for &digit in self.digits.iter().rev() {
            value = value * self.fp.p as u128 + digit as u128;
        }
        value as u64
    }

    /// True iff every digit is zero.
    pub fn is_zero(&self) -> bool {
        self.digits.iter().all(|&digit| digit == 0)
    }

    /// Adds `m` copies of `rhs` in one step.
    pub(crate) fn add_scaled(&mut self, rhs: &FieldElem, m: u8) {
        debug_assert_eq!(self.digits.len(), rhs.digits.len());
        for (a, b) in self.digits.iter_mut().zip(rhs.digits.iter()) {
            *a = self.fp.add(*a, self.fp.mul(*b, m));
        }
    }

    /// Removes `m` copies of `rhs` in one step.
    pub(crate) fn sub_scaled(&mut self, rhs: &FieldElem, m: u8) {
        debug_assert_eq!(self.digits.len(), rhs.digits.len());
        for (a, b) in self.digits.iter_mut().zip(rhs.digits.iter()) {
            *a = self.fp.sub(*a, self.fp.mul(*b, m));
        }
    }

    /// True when every digit is divisible by `gcd(m, p)`. For a prime
    /// modulus and `1 <= |m| < p` this is trivially satisfied; the check is
    /// kept for algorithmic uniformity with non-prime moduli.
    pub fn can_divide_by(&self, m: i32) -> bool {
        let g = gcd(self.fp.reduce_signed(m), self.fp.p);
        g == 1 || self.digits.iter().all(|&digit| digit % g == 0)
    }

    /// Divides every digit by the multiplicity `m`, which may be negative;
    /// the sign reduces into the field (`-1` becomes `p - 1`).
    pub fn divide_by(&mut self, m: i32) {
        let inv = self.fp.inv(self.fp.reduce_signed(m));
        for digit in self.digits.iter_mut() {
            *digit = self.fp.mul(*digit, inv);
        }
    }

    /// Recovers `k` from a sum known to equal `m * encode(k)`: divides by
    /// `m` and decodes.
    pub fn extract(&self, m: i32) -> u64 {
        let mut quotient = self.clone();
        quotient.divide_by(m);
        quotient.decode_value()
    }

    /// Exact length of the packed wire encoding in bytes.
    pub fn encoded_len(&self) -> usize {
        (self.digits.len() * self.fp.digit_bits() + 7) / 8
    }
}

impl AddAssign<&FieldElem> for FieldElem {
    fn add_assign(&mut self, rhs: &FieldElem) {
        debug_assert_eq!(self.digits.len(), rhs.digits.len());
        for (a, b) in self.digits.iter_mut().zip(rhs.digits.iter()) {
            *a = self.fp.add(*a, *b);
        }
    }
}

impl SubAssign<&FieldElem> for FieldElem {
    fn sub_assign(&mut self, rhs: &FieldElem) {
        debug_assert_eq!(self.digits.len(), rhs.digits.len());
        for (a, b) in self.digits.iter_mut().zip(rhs.digits.iter()) {
            *a = self.fp.sub(*a, *b);
        }
    }
}

impl Encode for FieldElem {
    /// Digits are packed `digit_bits` each, LSB-first within bytes, in
    /// little-endian digit order; trailing pad bits are zero.
    fn encode(&self, bytes: &mut Vec<u8>) {
        let digit_bits = self.fp.digit_bits();
        let mut acc = 0u32;
        let mut pending = 0usize;
        for &digit in &self.digits {
            acc |= (digit as u32) << pending;
            pending += digit_bits;
            while pending >= 8 {
                bytes.push(acc as u8);
                acc >>= 8;
                pending -= 8;
            }
        }
        if pending > 0 {
            bytes.push(acc as u8);
        }
    }
}

/// Decoding parameter for [`FieldElem`]: the field and value width the
/// element was encoded for.
#[derive(Clone, Copy, Debug)]
pub struct FieldShape {
    pub(crate) fp: SmallFp,
    pub(crate) width_bits: usize,
}

impl Decode<FieldShape> for FieldElem {
    fn decode(shape: &FieldShape, bytes: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let num_digits = shape.fp.num_digits(shape.width_bits);
        let digit_bits = shape.fp.digit_bits();
        let mut buf = vec![0u8; (num_digits * digit_bits + 7) / 8];
        bytes.read_exact(&mut buf)?;

        let mut digits = vec![0u8; num_digits];
        let mask = (1u32 << digit_bits) - 1;
        let mut acc = 0u32;
        let mut pending = 0usize;
        let mut next = 0usize;
        for digit in digits.iter_mut() {
            while pending < digit_bits {
                acc |= (buf[next] as u32) << pending;
                next += 1;
                pending += 8;
            }
            let value = (acc & mask) as u8;
            if value >= shape.fp.p {
                return Err(CodecError::UnexpectedValue);
            }
            *digit = value;
            acc >>= digit_bits;
            pending -= digit_bits;
        }
        if acc != 0 {
            // Pad bits must be zero so encodings stay canonical.
            return Err(CodecError::UnexpectedValue);
        }
        Ok(FieldElem {
            fp: shape.fp,
            digits,
        })
    }
}
