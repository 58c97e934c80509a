//! Risk evaluation over values read fresh from the ledger.
//!
//! The engine is stateless: every input is passed in by the caller, nothing
//! is cached. Maximum borrowable amounts come from the collateral contract
//! and are never recomputed here.

use crate::amount::{Amount, AmountError, WAD};
use crate::error::OperationError;
use alloy::primitives::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskEngine {
    /// Fixed-point scale of ratios (1e18 on the lending contracts)
    scale: U256,
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self { scale: WAD }
    }
}

impl RiskEngine {
    pub fn new(scale: Amount) -> Result<Self, AmountError> {
        if scale.is_zero() {
            return Err(AmountError::NotPositive);
        }
        Ok(Self {
            scale: scale.as_u256(),
        })
    }

    pub fn scale(&self) -> Amount {
        Amount::new(self.scale)
    }

    /// A ratio at or below the liquidation threshold is at risk.
    pub fn is_at_risk(&self, ratio: Amount, liquidation_threshold: Amount) -> bool {
        ratio <= liquidation_threshold
    }

    /// `ceil(borrowed * min_ratio / scale)`; `None` when the product does not
    /// fit the ledger word, i.e. no collateral balance can satisfy it.
    pub fn min_required_collateral(&self, borrowed: Amount, min_ratio: Amount) -> Option<Amount> {
        let product = borrowed.as_u256().checked_mul(min_ratio.as_u256())?;
        let (quotient, remainder) = product.div_rem(self.scale);
        let required = if remainder.is_zero() {
            quotient
        } else {
            quotient + U256::from(1)
        };
        Some(Amount::new(required))
    }

    pub fn check_borrow(&self, amount: Amount, max_borrowable: Amount) -> Result<(), OperationError> {
        if amount > max_borrowable {
            return Err(OperationError::RiskViolation(format!(
                "borrow of {amount} exceeds maximum borrowable {max_borrowable}"
            )));
        }
        Ok(())
    }

    /// Pre-flight guard for a collateral withdrawal. The ledger stays
    /// authoritative and may still reject.
    pub fn check_withdrawal(
        &self,
        balance: Amount,
        amount: Amount,
        borrowed: Amount,
        min_ratio: Amount,
    ) -> Result<(), OperationError> {
        let remaining = balance
            .checked_sub(amount)
            .ok_or(OperationError::InsufficientFunds {
                requested: amount,
                available: balance,
            })?;
        if borrowed.is_zero() {
            return Ok(());
        }
        match self.min_required_collateral(borrowed, min_ratio) {
            Some(required) if remaining >= required => Ok(()),
            Some(required) => Err(OperationError::RiskViolation(format!(
                "withdrawal leaves {remaining} collateral, minimum required is {required}"
            ))),
            None => Err(OperationError::RiskViolation(format!(
                "minimum collateral for debt {borrowed} exceeds the ledger word size"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wad_fraction(numerator: u64, denominator: u64) -> Amount {
        Amount::new(WAD * U256::from(numerator) / U256::from(denominator))
    }

    #[test]
    fn test_is_at_risk_examples() {
        let risk = RiskEngine::default();
        let threshold = wad_fraction(150, 100);
        assert!(risk.is_at_risk(wad_fraction(140, 100), threshold));
        assert!(!risk.is_at_risk(wad_fraction(160, 100), threshold));
        // boundary counts as at risk
        assert!(risk.is_at_risk(threshold, threshold));
    }

    #[test]
    fn test_min_required_collateral_rounds_up() {
        let risk = RiskEngine::default();
        // 100 * 1.5 = 150 exactly
        assert_eq!(
            risk.min_required_collateral(Amount::from(100u64), wad_fraction(150, 100)),
            Some(Amount::from(150u64))
        );
        // 101 * 1.5 = 151.5 -> 152
        assert_eq!(
            risk.min_required_collateral(Amount::from(101u64), wad_fraction(150, 100)),
            Some(Amount::from(152u64))
        );
        assert_eq!(
            risk.min_required_collateral(Amount::ZERO, wad_fraction(150, 100)),
            Some(Amount::ZERO)
        );
    }

    #[test]
    fn test_min_required_collateral_overflow_is_unsatisfiable() {
        let risk = RiskEngine::default();
        assert_eq!(risk.min_required_collateral(Amount::MAX, Amount::new(WAD * U256::from(2))), None);
    }

    #[test]
    fn test_check_borrow() {
        let risk = RiskEngine::default();
        let err = risk
            .check_borrow(Amount::from(1000u64), Amount::from(500u64))
            .unwrap_err();
        assert!(matches!(err, OperationError::RiskViolation(_)));
        assert!(risk.check_borrow(Amount::from(500u64), Amount::from(500u64)).is_ok());
    }

    #[test]
    fn test_check_withdrawal() {
        let risk = RiskEngine::default();
        let min_ratio = wad_fraction(150, 100);
        let balance = Amount::from(300u64);
        let borrowed = Amount::from(100u64);

        // leaves 150, exactly the minimum
        assert!(risk.check_withdrawal(balance, Amount::from(150u64), borrowed, min_ratio).is_ok());
        // leaves 149
        assert!(matches!(
            risk.check_withdrawal(balance, Amount::from(151u64), borrowed, min_ratio),
            Err(OperationError::RiskViolation(_))
        ));
        // more than the balance
        assert!(matches!(
            risk.check_withdrawal(balance, Amount::from(301u64), borrowed, min_ratio),
            Err(OperationError::InsufficientFunds { .. })
        ));
        // no debt, everything may leave
        assert!(risk.check_withdrawal(balance, balance, Amount::ZERO, min_ratio).is_ok());
    }

    #[test]
    fn test_custom_scale() {
        let risk = RiskEngine::new(Amount::from(10_000u64)).unwrap();
        // 15000 bps on a 10000 scale = 1.5x
        assert_eq!(
            risk.min_required_collateral(Amount::from(3u64), Amount::from(15_000u64)),
            Some(Amount::from(5u64))
        );
        assert!(RiskEngine::new(Amount::ZERO).is_err());
    }
}
