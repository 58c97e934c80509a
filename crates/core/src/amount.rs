//! Ledger amounts.
//!
//! An [`Amount`] is a non-negative integer bounded by the ledger word size
//! (`2^256 - 1`). It crosses every boundary as a canonical base-10 string;
//! parsing accepts ASCII digits only (leading zeros tolerated).

use alloy::primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Fixed-point scale used by the lending contracts (1e18).
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,
    #[error("amount must not be negative: {0:?}")]
    Negative(String),
    #[error("amount must be a base-10 integer, found {found:?} at position {position}")]
    InvalidDigit { found: char, position: usize },
    #[error("amount exceeds the ledger word size")]
    Overflow,
    #[error("amount must be greater than zero")]
    NotPositive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(U256);

impl Amount {
    pub const ZERO: Self = Self(U256::ZERO);
    pub const MAX: Self = Self(U256::MAX);

    pub const fn new(value: U256) -> Self {
        Self(value)
    }

    pub fn parse(input: &str) -> Result<Self, AmountError> {
        if input.is_empty() {
            return Err(AmountError::Empty);
        }
        if input.starts_with('-') {
            return Err(AmountError::Negative(input.to_string()));
        }
        if let Some((position, found)) = input.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
            return Err(AmountError::InvalidDigit { found, position });
        }
        // Digits only at this point, so the only failure left is overflow.
        U256::from_str_radix(input, 10)
            .map(Self)
            .map_err(|_| AmountError::Overflow)
    }

    /// Parse and require a value above zero.
    pub fn parse_positive(input: &str) -> Result<Self, AmountError> {
        let amount = Self::parse(input)?;
        if amount.is_zero() {
            return Err(AmountError::NotPositive);
        }
        Ok(amount)
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<U256> for Amount {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl From<Amount> for U256 {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_decimal_text() {
        for text in ["0", "1", "1000000000000000000", "123456789012345678901234567890"] {
            assert_eq!(Amount::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_leading_zeros_tolerated() {
        assert_eq!(Amount::parse("00042").unwrap(), Amount::from(42u64));
        assert_eq!(Amount::parse("000").unwrap().to_string(), "0");
    }

    #[test]
    fn test_word_size_bound() {
        let max = U256::MAX.to_string();
        assert_eq!(Amount::parse(&max).unwrap(), Amount::MAX);

        // 2^256 is one past the bound
        let past = "115792089237316195423570985008687907853269984665640564039457584007913129639936";
        assert_eq!(Amount::parse(past), Err(AmountError::Overflow));
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert_eq!(Amount::parse(""), Err(AmountError::Empty));
        assert!(matches!(Amount::parse("-5"), Err(AmountError::Negative(_))));
        assert!(matches!(Amount::parse("+5"), Err(AmountError::InvalidDigit { found: '+', position: 0 })));
        assert!(matches!(Amount::parse("1.5"), Err(AmountError::InvalidDigit { found: '.', .. })));
        assert!(matches!(Amount::parse(" 7"), Err(AmountError::InvalidDigit { .. })));
        assert!(matches!(Amount::parse("0x10"), Err(AmountError::InvalidDigit { found: 'x', position: 1 })));
        assert!(matches!(Amount::parse("1e18"), Err(AmountError::InvalidDigit { .. })));
    }

    #[test]
    fn test_parse_positive() {
        assert_eq!(Amount::parse_positive("0"), Err(AmountError::NotPositive));
        assert_eq!(Amount::parse_positive("00"), Err(AmountError::NotPositive));
        assert_eq!(Amount::parse_positive("3").unwrap(), Amount::from(3u64));
    }

    #[test]
    fn test_arithmetic_bounds() {
        let one = Amount::from(1u64);
        assert_eq!(Amount::ZERO.saturating_sub(one), Amount::ZERO);
        assert_eq!(Amount::MAX.saturating_add(one), Amount::MAX);
        assert_eq!(Amount::MAX.checked_add(one), None);
        assert_eq!(one.checked_sub(Amount::from(2u64)), None);
    }

    #[test]
    fn test_serde_as_string() {
        let amount = Amount::parse("123456789012345678901234567890").unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"123456789012345678901234567890\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
        assert!(serde_json::from_str::<Amount>("\"-1\"").is_err());
    }
}
