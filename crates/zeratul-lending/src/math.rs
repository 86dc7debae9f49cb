//! Fixed-point arithmetic
//!
//! All ledger math is integer math on `u128`. Products that can exceed 128
//! bits (amount * price * bps) are widened to a `BigUint` before dividing,
//! and the quotient is checked back into `u128`. Nothing wraps silently.

use crate::error::{LendingError, Result};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed-point base unit (1.0 == 1e18)
pub const WAD: u128 = 1_000_000_000_000_000_000;

/// Basis point denominator (100% == 10_000)
pub const BPS: u128 = 10_000;

const WAD_DECIMALS: usize = 18;

/// Rounding direction for a division
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Floor
    Down,
    /// Ceiling
    Up,
}

/// 18-decimal fixed-point value (indices, prices, health factors)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Wad(pub u128);

impl Wad {
    pub const ZERO: Self = Wad(0);
    pub const ONE: Self = Wad(WAD);

    /// Whole number `n` as a fixed-point value
    pub fn from_int(n: u128) -> Result<Self> {
        n.checked_mul(WAD)
            .map(Wad)
            .ok_or(LendingError::Arithmetic("fixed-point overflow"))
    }

    /// Ratio `num / den` as a fixed-point value (floored)
    pub fn from_ratio(num: u128, den: u128) -> Result<Self> {
        mul_div(num, WAD, den, Rounding::Down).map(Wad)
    }

    /// Ratio `num / den` (floored), clamped to the largest representable
    /// value instead of failing when the quotient exceeds `u128`
    pub fn saturating_ratio(num: u128, den: u128) -> Result<Self> {
        match mul_div(num, WAD, den, Rounding::Down) {
            Err(LendingError::Arithmetic("quotient exceeds u128")) => Ok(Wad(u128::MAX)),
            other => other.map(Wad),
        }
    }

    pub fn raw(self) -> u128 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Wad) -> Result<Wad> {
        self.0
            .checked_add(other.0)
            .map(Wad)
            .ok_or(LendingError::Arithmetic("fixed-point overflow"))
    }
}

impl fmt::Display for Wad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let int = self.0 / WAD;
        let frac = self.0 % WAD;
        if frac == 0 {
            return write!(f, "{}", int);
        }
        let digits = format!("{:0width$}", frac, width = WAD_DECIMALS);
        write!(f, "{}.{}", int, digits.trim_end_matches('0'))
    }
}

impl FromStr for Wad {
    type Err = LendingError;

    /// Parse a decimal string such as `"1.05"` or `"2000"`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || LendingError::Validation(format!("invalid decimal: {:?}", s));

        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if frac_part.len() > WAD_DECIMALS
            || !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        let int: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let frac: u128 = if frac_part.is_empty() {
            0
        } else {
            let padded = format!("{:0<width$}", frac_part, width = WAD_DECIMALS);
            padded.parse().map_err(|_| invalid())?
        };

        Wad::from_int(int)?.checked_add(Wad(frac))
    }
}

/// `a * b / den`, rounded as requested
pub fn mul_div(a: u128, b: u128, den: u128, rounding: Rounding) -> Result<u128> {
    mul_div_wide(&[a, b], &[den], rounding)
}

/// Product of `nums` divided by product of `dens`, rounded as requested
///
/// The products are taken at arbitrary precision so intermediate overflow is
/// impossible; only a quotient that does not fit `u128` is an error.
pub fn mul_div_wide(nums: &[u128], dens: &[u128], rounding: Rounding) -> Result<u128> {
    let zero = BigUint::default();
    let num = nums
        .iter()
        .fold(BigUint::from(1u8), |acc, n| acc * BigUint::from(*n));
    let den = dens
        .iter()
        .fold(BigUint::from(1u8), |acc, d| acc * BigUint::from(*d));

    if den == zero {
        return Err(LendingError::Arithmetic("division by zero"));
    }

    let quotient = &num / &den;
    let quotient = match rounding {
        Rounding::Up if &num % &den != zero => quotient + 1u8,
        _ => quotient,
    };

    u128::try_from(&quotient).map_err(|_| LendingError::Arithmetic("quotient exceeds u128"))
}

pub fn checked_add(a: u128, b: u128) -> Result<u128> {
    a.checked_add(b).ok_or(LendingError::Arithmetic("addition overflow"))
}

pub fn checked_sub(a: u128, b: u128) -> Result<u128> {
    a.checked_sub(b)
        .ok_or(LendingError::Arithmetic("subtraction underflow"))
}
