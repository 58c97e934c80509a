//! Collateral custody and the per-user risk view.

use super::mirror::PositionChange;
use super::EngineContext;
use crate::amount::Amount;
use crate::backfill::Submission;
use crate::error::{MirrorStage, OperationError};
use crate::model::{Position, TransactionKind, TransactionRecord};
use crate::store::TransactionFilter;
use alloy::primitives::{Address, B256};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

/// Read-only aggregate of a user's collateral state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollateralInfo {
    pub balance: Amount,
    pub ratio: Amount,
    pub min_ratio: Amount,
    pub max_borrowable: Amount,
    pub is_at_risk: bool,
}

#[derive(Debug, Clone)]
pub struct CollateralOperations {
    ctx: Arc<EngineContext>,
}

impl CollateralOperations {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self), fields(user = %user))]
    pub async fn deposit_collateral(&self, user: Address, amount: &str) -> Result<B256, OperationError> {
        let amount = Amount::parse_positive(amount)?;
        let account = self.ctx.resolve_user(user).await?;
        let _guard = self.ctx.locks.lock(account.id).await;

        let gateways = &self.ctx.gateways;
        let submitted = gateways
            .collateral
            .deposit_collateral(user, amount.into())
            .await
            .map_err(OperationError::submission)?;
        let hash = submitted.hash;
        info!(hash = %hash, amount = %amount, "Collateral deposit submitted");

        let submission = Submission {
            user_id: account.id,
            user,
            kind: TransactionKind::DepositCollateral,
            hash,
            amount,
            token: gateways.collateral.address(),
            affects_position: true,
        };
        self.ctx.record_all(std::slice::from_ref(&submission)).await?;

        let balance: Amount = gateways
            .collateral
            .collateral_balance(user)
            .await
            .map_err(|e| {
                self.ctx.unrecorded(hash, std::slice::from_ref(&submission), MirrorStage::PositionMirror, format!("{e:#}"))
            })?
            .into();
        let ratio = self.ctx.best_effort_ratio(user).await;
        let collateral_token = gateways.collateral.address();
        let borrowed_token = gateways.borrowing.address();

        let position = self
            .ctx
            .apply_to_position(account.id, |current| match current {
                Some(mut position) => {
                    position.collateral_amount = balance;
                    if ratio.is_some() && !position.borrowed_amount.is_zero() {
                        position.health_factor = ratio;
                    }
                    PositionChange::Update(position)
                }
                None => {
                    let mut position = Position::open(account.id, collateral_token, borrowed_token);
                    position.collateral_amount = balance;
                    PositionChange::Create(position)
                }
            })
            .await
            .map_err(|e| {
                self.ctx.unrecorded(hash, std::slice::from_ref(&submission), MirrorStage::PositionMirror, e.to_string())
            })?;

        if let Some(position) = position {
            info!(position_id = position.id, collateral = %position.collateral_amount, "Position mirrored after collateral deposit");
        }
        Ok(hash)
    }

    #[instrument(skip(self), fields(user = %user))]
    pub async fn withdraw_collateral(&self, user: Address, amount: &str) -> Result<B256, OperationError> {
        let amount = Amount::parse_positive(amount)?;
        let account = self.ctx.resolve_user(user).await?;
        let _guard = self.ctx.locks.lock(account.id).await;

        let gateways = &self.ctx.gateways;
        let balance = self.get_collateral_balance(user).await?;
        if amount > balance {
            return Err(OperationError::InsufficientFunds {
                requested: amount,
                available: balance,
            });
        }
        let borrowed: Amount = gateways
            .borrowing
            .debt_with_interest(user)
            .await
            .map_err(OperationError::chain_read)?
            .into();
        if !borrowed.is_zero() {
            let min_ratio = self.get_min_collateral_ratio().await?;
            self.ctx.risk.check_withdrawal(balance, amount, borrowed, min_ratio)?;
        }

        let submitted = gateways
            .collateral
            .withdraw_collateral(user, amount.into())
            .await
            .map_err(OperationError::submission)?;
        let hash = submitted.hash;
        info!(hash = %hash, amount = %amount, "Collateral withdrawal submitted");

        let submission = Submission {
            user_id: account.id,
            user,
            kind: TransactionKind::WithdrawCollateral,
            hash,
            amount,
            token: gateways.collateral.address(),
            affects_position: true,
        };
        self.ctx.record_all(std::slice::from_ref(&submission)).await?;

        let new_balance: Amount = gateways
            .collateral
            .collateral_balance(user)
            .await
            .map_err(|e| {
                self.ctx.unrecorded(hash, std::slice::from_ref(&submission), MirrorStage::PositionMirror, format!("{e:#}"))
            })?
            .into();
        let ratio = if borrowed.is_zero() {
            None
        } else {
            self.ctx.best_effort_ratio(user).await
        };

        let position = self
            .ctx
            .apply_to_position(account.id, |current| {
                let Some(mut position) = current else {
                    return PositionChange::Skip;
                };
                position.collateral_amount = new_balance;
                if ratio.is_some() {
                    position.health_factor = ratio;
                }
                if new_balance.is_zero() && borrowed.is_zero() {
                    // Ledger debt is zero; bring the mirror in line before closing.
                    position.borrowed_amount = Amount::ZERO;
                    if position.close_if_empty() {
                        info!(position_id = position.id, "Position closed after collateral withdrawal");
                    }
                }
                PositionChange::Update(position)
            })
            .await
            .map_err(|e| {
                self.ctx.unrecorded(hash, std::slice::from_ref(&submission), MirrorStage::PositionMirror, e.to_string())
            })?;

        if let Some(position) = position {
            info!(position_id = position.id, collateral = %position.collateral_amount, status = %position.status, "Position mirrored after collateral withdrawal");
        }
        Ok(hash)
    }

    pub async fn get_collateral_info(&self, user: Address) -> Result<CollateralInfo, OperationError> {
        let collateral = &self.ctx.gateways.collateral;
        let (balance, ratio, min_ratio, max_borrowable) = tokio::try_join!(
            collateral.collateral_balance(user),
            collateral.collateral_ratio(user),
            collateral.min_collateral_ratio(),
            collateral.max_borrowable(user),
        )
        .map_err(OperationError::chain_read)?;
        let is_at_risk = self.is_at_risk(user).await?;
        Ok(CollateralInfo {
            balance: balance.into(),
            ratio: ratio.into(),
            min_ratio: min_ratio.into(),
            max_borrowable: max_borrowable.into(),
            is_at_risk,
        })
    }

    /// No debt is never at risk; otherwise compares a fresh ratio against the
    /// ledger's liquidation threshold.
    pub async fn is_at_risk(&self, user: Address) -> Result<bool, OperationError> {
        let gateways = &self.ctx.gateways;
        let borrowed = gateways
            .borrowing
            .debt_with_interest(user)
            .await
            .map_err(OperationError::chain_read)?;
        if borrowed.is_zero() {
            return Ok(false);
        }
        let (ratio, threshold) = tokio::try_join!(
            gateways.collateral.collateral_ratio(user),
            gateways.collateral.liquidation_threshold(),
        )
        .map_err(OperationError::chain_read)?;
        Ok(self.ctx.risk.is_at_risk(ratio.into(), threshold.into()))
    }

    pub async fn get_collateral_balance(&self, user: Address) -> Result<Amount, OperationError> {
        let balance = self
            .ctx
            .gateways
            .collateral
            .collateral_balance(user)
            .await
            .map_err(OperationError::chain_read)?;
        Ok(balance.into())
    }

    pub async fn get_collateral_ratio(&self, user: Address) -> Result<Amount, OperationError> {
        let ratio = self
            .ctx
            .gateways
            .collateral
            .collateral_ratio(user)
            .await
            .map_err(OperationError::chain_read)?;
        Ok(ratio.into())
    }

    pub async fn get_min_collateral_ratio(&self) -> Result<Amount, OperationError> {
        let ratio = self
            .ctx
            .gateways
            .collateral
            .min_collateral_ratio()
            .await
            .map_err(OperationError::chain_read)?;
        Ok(ratio.into())
    }

    pub async fn get_liquidation_threshold(&self) -> Result<Amount, OperationError> {
        let threshold = self
            .ctx
            .gateways
            .collateral
            .liquidation_threshold()
            .await
            .map_err(OperationError::chain_read)?;
        Ok(threshold.into())
    }

    /// Ledger-computed borrowing allowance; never recomputed locally.
    pub async fn get_max_borrowable_amount(&self, user: Address) -> Result<Amount, OperationError> {
        let max = self
            .ctx
            .gateways
            .collateral
            .max_borrowable(user)
            .await
            .map_err(OperationError::chain_read)?;
        Ok(max.into())
    }

    /// Collateral deposits and withdrawals of `user`, newest first.
    pub async fn get_user_transaction_history(
        &self,
        user: Address,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, OperationError> {
        let account = self.ctx.resolve_user(user).await?;
        let filter =
            TransactionFilter::for_user(account.id).with_kinds(&TransactionKind::COLLATERAL);
        Ok(self.ctx.stores.transactions.list(&filter, offset, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use crate::amount::{Amount, WAD};
    use crate::error::OperationError;
    use crate::model::{PositionStatus, TransactionKind};
    use crate::testing::{Harness, ALICE};
    use alloy::primitives::U256;

    #[tokio::test]
    async fn test_invalid_amounts_make_no_external_call() {
        let h = Harness::new();
        for bad in ["0", "-7", "seven"] {
            assert!(matches!(
                h.engine.collateral.deposit_collateral(ALICE, bad).await,
                Err(OperationError::Validation(_))
            ));
            assert!(matches!(
                h.engine.collateral.withdraw_collateral(ALICE, bad).await,
                Err(OperationError::Validation(_))
            ));
        }
        assert_eq!(h.ledger.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_deposit_creates_then_updates_position() {
        let h = Harness::new();
        let hash = h.engine.collateral.deposit_collateral(ALICE, "500").await.unwrap();
        assert_eq!(h.store_rows(hash).await[0].kind, TransactionKind::DepositCollateral);

        let position = h.position(ALICE).await.unwrap();
        assert_eq!(position.collateral_amount.to_string(), "500");
        assert!(position.borrowed_amount.is_zero());
        assert_eq!(position.collateral_token, h.ledger.collateral_address());

        h.engine.collateral.deposit_collateral(ALICE, "250").await.unwrap();
        let updated = h.position(ALICE).await.unwrap();
        assert_eq!(updated.id, position.id);
        assert_eq!(updated.collateral_amount.to_string(), "750");
        assert_eq!(updated.version, position.version + 1);
    }

    #[tokio::test]
    async fn test_withdrawal_below_minimum_is_rejected_before_submit() {
        let h = Harness::new();
        // min ratio 1.5: debt 100 needs 150 collateral
        h.engine.collateral.deposit_collateral(ALICE, "300").await.unwrap();
        h.engine.borrowing.borrow(ALICE, "100").await.unwrap();
        let submits = h.ledger.submit_calls();

        let err = h.engine.collateral.withdraw_collateral(ALICE, "151").await.unwrap_err();
        assert!(matches!(err, OperationError::RiskViolation(_)));
        assert_eq!(h.ledger.submit_calls(), submits);

        h.engine.collateral.withdraw_collateral(ALICE, "150").await.unwrap();
        let position = h.position(ALICE).await.unwrap();
        assert_eq!(position.collateral_amount.to_string(), "150");
        assert_eq!(position.health_factor.unwrap().to_string(), "1500000000000000000");
    }

    #[tokio::test]
    async fn test_withdrawal_beyond_balance() {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "10").await.unwrap();
        assert!(matches!(
            h.engine.collateral.withdraw_collateral(ALICE, "11").await,
            Err(OperationError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_withdrawal_without_debt_closes() {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "40").await.unwrap();
        h.engine.collateral.withdraw_collateral(ALICE, "40").await.unwrap();

        let positions = h.positions(ALICE).await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::Closed);
        assert!(positions[0].is_empty());

        // a later deposit opens a fresh position
        h.engine.collateral.deposit_collateral(ALICE, "5").await.unwrap();
        assert_eq!(h.positions(ALICE).await.len(), 2);
    }

    #[tokio::test]
    async fn test_is_at_risk() {
        let h = Harness::new();
        assert!(!h.engine.collateral.is_at_risk(ALICE).await.unwrap());

        h.engine.collateral.deposit_collateral(ALICE, "300").await.unwrap();
        h.engine.borrowing.borrow(ALICE, "100").await.unwrap();
        assert!(!h.engine.collateral.is_at_risk(ALICE).await.unwrap());

        // threshold 1.2; ratio 1.1
        h.ledger.set_ratio(ALICE, WAD * U256::from(11) / U256::from(10));
        assert!(h.engine.collateral.is_at_risk(ALICE).await.unwrap());
    }

    #[tokio::test]
    async fn test_collateral_info() {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "300").await.unwrap();
        h.engine.borrowing.borrow(ALICE, "100").await.unwrap();

        let info = h.engine.collateral.get_collateral_info(ALICE).await.unwrap();
        assert_eq!(info.balance.to_string(), "300");
        assert_eq!(info.ratio, Amount::new(WAD * U256::from(3)));
        assert_eq!(info.min_ratio, Amount::new(h.ledger.min_ratio()));
        assert_eq!(info.max_borrowable.to_string(), "100");
        assert!(!info.is_at_risk);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["balance"], "300");
        assert_eq!(json["isAtRisk"], false);
    }

    #[tokio::test]
    async fn test_failed_ratio_read_keeps_health_factor() {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "300").await.unwrap();
        h.engine.borrowing.borrow(ALICE, "100").await.unwrap();
        let before = h.position(ALICE).await.unwrap().health_factor;

        h.ledger.fail_ratio_reads(true);
        h.engine.collateral.deposit_collateral(ALICE, "100").await.unwrap();
        let after = h.position(ALICE).await.unwrap();
        assert_eq!(after.collateral_amount.to_string(), "400");
        assert_eq!(after.health_factor, before);
    }
}
