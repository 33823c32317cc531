// Fixed-point amounts
//
// Values are held as integer minor units with two decimal places. Parsing
// rejects anything that would need rounding; serde always uses the
// canonical fixed-point string form ("100.00").

use rust_decimal::{Decimal, Error as DecimalError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of decimal places carried by every amount
pub const AMOUNT_SCALE: u32 = 2;
const MINOR_PER_MAJOR: u64 = 10u64.pow(AMOUNT_SCALE);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount '{0}': expected a non-negative fixed-point decimal")]
    InvalidFormat(String),

    #[error("Amount '{input}' has more than {allowed} decimal places")]
    PrecisionExceeded { input: String, allowed: u32 },

    #[error("Amount overflow")]
    Overflow,

    #[error("Amount underflow: {minuend} - {subtrahend}")]
    Underflow { minuend: Amount, subtrahend: Amount },
}

/// Non-negative fixed-point amount in minor units
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_minor(minor: u64) -> Self {
        Self(minor)
    }

    /// Whole units, e.g. `Amount::from_major(100)` is "100.00"
    pub fn from_major(major: u64) -> Result<Self, AmountError> {
        major
            .checked_mul(MINOR_PER_MAJOR)
            .map(Self)
            .ok_or(AmountError::Overflow)
    }

    pub const fn minor_units(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Result<Amount, AmountError> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }

    pub fn checked_sub(self, other: Amount) -> Result<Amount, AmountError> {
        self.0.checked_sub(other.0).map(Amount).ok_or(AmountError::Underflow {
            minuend: self,
            subtrahend: other,
        })
    }

    /// True when this amount is an exact multiple of `unit`
    pub fn is_multiple_of(&self, unit: Amount) -> bool {
        unit.0 != 0 && self.0 % unit.0 == 0
    }

    /// Exact sum of an iterator of amounts
    pub fn sum<'a, I>(amounts: I) -> Result<Amount, AmountError>
    where
        I: IntoIterator<Item = &'a Amount>,
    {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(*a))
    }

    /// Exact decimal value, e.g. 10_050 minor units is 100.50
    pub fn to_decimal(&self) -> Decimal {
        Decimal::from_i128_with_scale(i128::from(self.0), AMOUNT_SCALE)
    }

    /// Parse the canonical decimal form. Never rounds.
    pub fn parse(input: &str) -> Result<Self, AmountError> {
        let trimmed = input.trim();
        let invalid = || AmountError::InvalidFormat(input.to_string());
        let precision = || AmountError::PrecisionExceeded {
            input: input.to_string(),
            allowed: AMOUNT_SCALE,
        };

        // Plain digits with an optional point; no sign, exponent or separators
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(invalid());
        }
        if trimmed.starts_with('.') || trimmed.ends_with('.') {
            return Err(invalid());
        }
        let value = Decimal::from_str_exact(trimmed).map_err(|e| match e {
            DecimalError::ExceedsMaximumPossibleValue => AmountError::Overflow,
            DecimalError::Underflow | DecimalError::ScaleExceedsMaximumPrecision(_) => precision(),
            _ => invalid(),
        })?;

        // Trailing zeros beyond the scale are exact; anything else would round
        let mut value = value.normalize();
        if value.scale() > AMOUNT_SCALE {
            return Err(precision());
        }
        value.rescale(AMOUNT_SCALE);
        u64::try_from(value.mantissa())
            .map(Amount)
            .map_err(|_| AmountError::Overflow)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.to_decimal()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1$}", self.to_decimal(), AMOUNT_SCALE as usize)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Amount::parse(&s).map_err(serde::de::Error::custom)
    }
}
