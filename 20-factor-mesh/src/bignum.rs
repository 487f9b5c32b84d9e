//! Arbitrary-precision signed integers with a canonical wire encoding.
//!
//! [`BigNum`] wraps `num_bigint::BigInt` and adds the pieces the protocol
//! needs on top of plain arithmetic: decimal parsing that reports errors
//! instead of panicking, a sign + magnitude byte encoding that is stable
//! enough to be used as a map key, and serde support built on that encoding.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};
use std::str::FromStr;

use num_bigint::{BigInt, RandBigInt, Sign};
use num_integer::Integer;
use num_traits::{One, Signed, Zero};
use rand::RngCore;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const SIGN_ZERO: u8 = 0x00;
const SIGN_POSITIVE: u8 = 0x01;
const SIGN_NEGATIVE: u8 = 0x02;

/// Reasons a byte buffer is not a valid [`BigNum`] encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty buffer")]
    Empty,
    #[error("unknown sign byte {0:#04x}")]
    InvalidSign(u8),
    #[error("zero must not carry magnitude bytes")]
    TrailingMagnitude,
    #[error("non-zero value is missing its magnitude")]
    MissingMagnitude,
    #[error("magnitude has a leading zero byte")]
    NonCanonical,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{input}' is not a decimal integer")]
pub struct ParseError {
    input: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BigNum(BigInt);

impl BigNum {
    pub fn zero() -> Self {
        Self(BigInt::zero())
    }

    pub fn one() -> Self {
        Self(BigInt::one())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_one(&self) -> bool {
        self.0.is_one()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    pub fn is_even(&self) -> bool {
        self.0.is_even()
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    /// Number of significant bits in the magnitude.
    pub fn bits(&self) -> u64 {
        self.0.bits()
    }

    /// Greatest common divisor, always non-negative. `gcd(0, 0) == 0`.
    pub fn gcd(&self, other: &Self) -> Self {
        Self(self.0.gcd(&other.0))
    }

    /// Truncating division, `None` when `divisor` is zero.
    pub fn checked_div(&self, divisor: &Self) -> Option<Self> {
        if divisor.is_zero() {
            return None;
        }
        Some(Self(&self.0 / &divisor.0))
    }

    /// Truncating remainder (takes the sign of `self`), `None` when `divisor` is zero.
    pub fn checked_rem(&self, divisor: &Self) -> Option<Self> {
        if divisor.is_zero() {
            return None;
        }
        Some(Self(&self.0 % &divisor.0))
    }

    /// Euclidean-style modulus: the result lies in `[0, |modulus|)`.
    pub fn modulo(&self, modulus: &Self) -> Option<Self> {
        if modulus.is_zero() {
            return None;
        }
        Some(Self(self.0.mod_floor(&modulus.0.abs())))
    }

    /// `self^exponent mod modulus`. `None` for a zero modulus or a negative exponent.
    pub fn pow_mod(&self, exponent: &Self, modulus: &Self) -> Option<Self> {
        if modulus.is_zero() || exponent.is_negative() {
            return None;
        }
        let base = self.0.mod_floor(&modulus.0.abs());
        Some(Self(base.modpow(&exponent.0, &modulus.0.abs())))
    }

    /// `true` when `divisor` is non-zero and divides `self` exactly.
    pub fn is_multiple_of(&self, divisor: &Self) -> bool {
        !divisor.is_zero() && (&self.0 % &divisor.0).is_zero()
    }

    /// Uniform value in `[low, high)`. Callers must pass `low < high`.
    pub fn random_range(low: &Self, high: &Self, rng: &mut dyn RngCore) -> Self {
        Self(rng.gen_bigint_range(&low.0, &high.0))
    }

    /// Canonical encoding: one sign byte followed by the big-endian magnitude
    /// without leading zeros. Zero is the single byte `0x00`.
    pub fn encode(&self) -> Vec<u8> {
        let (sign, magnitude) = self.0.to_bytes_be();
        let tag = match sign {
            Sign::NoSign => return vec![SIGN_ZERO],
            Sign::Plus => SIGN_POSITIVE,
            Sign::Minus => SIGN_NEGATIVE,
        };
        let mut encoded = Vec::with_capacity(magnitude.len() + 1);
        encoded.push(tag);
        encoded.extend_from_slice(&magnitude);
        encoded
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (&tag, magnitude) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let sign = match tag {
            SIGN_ZERO if magnitude.is_empty() => return Ok(Self::zero()),
            SIGN_ZERO => return Err(DecodeError::TrailingMagnitude),
            SIGN_POSITIVE => Sign::Plus,
            SIGN_NEGATIVE => Sign::Minus,
            other => return Err(DecodeError::InvalidSign(other)),
        };
        match magnitude.first() {
            None => Err(DecodeError::MissingMagnitude),
            Some(0) => Err(DecodeError::NonCanonical),
            Some(_) => Ok(Self(BigInt::from_bytes_be(sign, magnitude))),
        }
    }
}

impl From<BigInt> for BigNum {
    fn from(value: BigInt) -> Self {
        Self(value)
    }
}

macro_rules! from_primitive {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for BigNum {
                fn from(value: $ty) -> Self {
                    Self(BigInt::from(value))
                }
            }
        )*
    };
}

from_primitive!(i32, i64, i128, u32, u64, u128);

impl FromStr for BigNum {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // num-bigint tolerates '_' separators; the protocol does not.
        let well_formed = {
            let digits = trimmed.strip_prefix(['-', '+']).unwrap_or(trimmed);
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        };
        if !well_formed {
            return Err(ParseError {
                input: s.to_string(),
            });
        }
        BigInt::from_str(trimmed).map(Self).map_err(|_| ParseError {
            input: s.to_string(),
        })
    }
}

impl fmt::Display for BigNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

macro_rules! forward_binop {
    ($trait:ident, $method:ident) => {
        impl $trait<&BigNum> for &BigNum {
            type Output = BigNum;

            fn $method(self, rhs: &BigNum) -> BigNum {
                BigNum($trait::$method(&self.0, &rhs.0))
            }
        }

        impl $trait for BigNum {
            type Output = BigNum;

            fn $method(self, rhs: BigNum) -> BigNum {
                BigNum($trait::$method(self.0, rhs.0))
            }
        }
    };
}

forward_binop!(Add, add);
forward_binop!(Sub, sub);
forward_binop!(Mul, mul);

impl Neg for BigNum {
    type Output = BigNum;

    fn neg(self) -> BigNum {
        BigNum(-self.0)
    }
}

impl Serialize for BigNum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.encode())
    }
}

impl<'de> Deserialize<'de> for BigNum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(EncodedVisitor)
    }
}

struct EncodedVisitor;

impl<'de> Visitor<'de> for EncodedVisitor {
    type Value = BigNum;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a sign + magnitude byte sequence")
    }

    fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> Result<BigNum, E> {
        BigNum::decode(bytes).map_err(E::custom)
    }

    fn visit_byte_buf<E: de::Error>(self, bytes: Vec<u8>) -> Result<BigNum, E> {
        self.visit_bytes(&bytes)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<BigNum, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        self.visit_bytes(&bytes)
    }
}
