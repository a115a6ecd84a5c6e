//! Exact monetary arithmetic in a coin's minimal unit.
//!
//! Every balance, fee and threshold in the system is an unsigned
//! arbitrary-precision integer counted in minimal units (satoshi, wei,
//! drops, ...).  Decimal representation only exists at the external
//! boundary and is handled by the codec here; internal arithmetic never
//! sees a fraction.

use std::fmt;
use std::ops::Add;

use num_bigint::BigUint;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("invalid decimal literal `{0}`")]
    InvalidLiteral(String),

    #[error("`{literal}` has more than {decimals} fractional digits")]
    TooPrecise { literal: String, decimals: u8 },
}

/// How a decimal literal with excess fractional digits is folded into the
/// coin's precision.  One mode is configured per coin and used for every
/// conversion of that coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoundingMode {
    #[default]
    Truncate,
    HalfUp,
}

/// An amount in minimal units of some coin.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(BigUint);

impl Amount {
    pub fn zero() -> Self {
        Self(BigUint::default())
    }

    pub fn from_u64(v: u64) -> Self {
        Self(BigUint::from(v))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigUint::default()
    }

    /// Parses an integer decimal string of minimal units, as stored at rest.
    pub fn from_dec_str(s: &str) -> Result<Self, AmountError> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::InvalidLiteral(s.to_owned()));
        }
        let v = BigUint::parse_bytes(s.as_bytes(), 10)
            .ok_or_else(|| AmountError::InvalidLiteral(s.to_owned()))?;
        Ok(Self(v))
    }

    /// Parses a caller-supplied decimal literal (e.g. `"0.00005"`) into
    /// minimal units at the given precision.
    ///
    /// Excess fractional digits are folded per `rounding`; with
    /// [`RoundingMode::HalfUp`] a first excess digit of 5 or more rounds the
    /// kept digits up by one minimal unit.
    pub fn parse_decimal(s: &str, decimals: u8, rounding: RoundingMode) -> Result<Self, AmountError> {
        let bad = || AmountError::InvalidLiteral(s.to_owned());

        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(bad());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(bad());
        }

        let scale = BigUint::from(10u32).pow(decimals as u32);
        let int_units = if int_part.is_empty() {
            BigUint::default()
        } else {
            BigUint::parse_bytes(int_part.as_bytes(), 10).ok_or_else(bad)?
        } * &scale;

        let nd = decimals as usize;
        let (kept, dropped) = if frac_part.len() > nd {
            frac_part.split_at(nd)
        } else {
            (frac_part, "")
        };

        let mut frac_units = if kept.is_empty() {
            BigUint::default()
        } else {
            // Right-pad the kept digits out to the full precision.
            let padded = format!("{kept:0<nd$}");
            BigUint::parse_bytes(padded.as_bytes(), 10).ok_or_else(bad)?
        };

        if !dropped.is_empty() {
            match rounding {
                RoundingMode::Truncate => {}
                RoundingMode::HalfUp => {
                    if dropped.as_bytes()[0] >= b'5' {
                        frac_units += 1u32;
                    }
                }
            }
        }

        Ok(Self(int_units + frac_units))
    }

    /// Renders the amount as a decimal literal at the given precision,
    /// always carrying the full fractional width (`decimals` digits).
    pub fn format_decimal(&self, decimals: u8) -> String {
        if decimals == 0 {
            return self.0.to_string();
        }
        let scale = BigUint::from(10u32).pow(decimals as u32);
        let int = &self.0 / &scale;
        let frac = &self.0 % &scale;
        format!("{int}.{frac:0>width$}", width = decimals as usize)
    }

    pub fn mul_u64(&self, n: u64) -> Amount {
        Amount(&self.0 * BigUint::from(n))
    }

    pub fn checked_sub(&self, rhs: &Amount) -> Option<Amount> {
        if self.0 >= rhs.0 {
            Some(Amount(&self.0 - &rhs.0))
        } else {
            None
        }
    }

    /// Applies a signed perturbation in minimal units, saturating at zero.
    pub fn offset(&self, delta: i32) -> Amount {
        if delta >= 0 {
            Amount(&self.0 + BigUint::from(delta as u32))
        } else {
            let d = BigUint::from(delta.unsigned_abs());
            if self.0 >= d {
                Amount(&self.0 - d)
            } else {
                Amount::zero()
            }
        }
    }

    /// Absolute distance to another amount, in minimal units.
    pub fn abs_diff(&self, other: &Amount) -> Amount {
        if self.0 >= other.0 {
            Amount(&self.0 - &other.0)
        } else {
            Amount(&other.0 - &self.0)
        }
    }

    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }
}

impl From<BigUint> for Amount {
    fn from(v: BigUint) -> Self {
        Self(v)
    }
}

impl Add<&Amount> for Amount {
    type Output = Amount;

    fn add(self, rhs: &Amount) -> Amount {
        Amount(self.0 + &rhs.0)
    }
}

impl<'a> std::iter::Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Amount {
        iter.fold(Amount::zero(), |acc, a| acc + a)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Amount::from_dec_str(&s).map_err(de::Error::custom)
    }
}
