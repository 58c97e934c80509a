//! Liquidation of at-risk positions.

use super::mirror::PositionChange;
use super::{CollateralOperations, EngineContext};
use crate::amount::Amount;
use crate::backfill::Submission;
use crate::error::{MirrorStage, OperationError};
use crate::model::{Position, TransactionKind, TransactionRecord};
use crate::store::TransactionFilter;
use alloy::primitives::{Address, B256};
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct LiquidationOperations {
    ctx: Arc<EngineContext>,
    collateral: CollateralOperations,
}

impl LiquidationOperations {
    pub fn new(ctx: Arc<EngineContext>, collateral: CollateralOperations) -> Self {
        Self { ctx, collateral }
    }

    /// Liquidate `borrower`, signed by `liquidator`. Writes one Liquidate row
    /// per party, both carrying the same hash.
    #[instrument(skip(self), fields(liquidator = %liquidator, borrower = %borrower))]
    pub async fn liquidate(
        &self,
        liquidator: Address,
        borrower: Address,
        repay_amount: &str,
    ) -> Result<B256, OperationError> {
        let repay_amount = Amount::parse_positive(repay_amount)?;
        if liquidator == borrower {
            return Err(OperationError::Validation(
                "a position cannot be liquidated by its owner".into(),
            ));
        }
        let liquidator_account = self.ctx.resolve_user(liquidator).await?;
        let borrower_account = self
            .ctx
            .stores
            .users
            .find_by_address(borrower)
            .await?
            .ok_or_else(|| OperationError::Validation(format!("unknown borrower {borrower}")))?;
        let _guard = self.ctx.locks.lock(borrower_account.id).await;

        if !self.collateral.is_at_risk(borrower).await? {
            return Err(OperationError::NotEligibleForLiquidation { borrower });
        }

        let gateways = &self.ctx.gateways;
        let submitted = gateways
            .collateral
            .liquidate(liquidator, borrower, repay_amount.into())
            .await
            .map_err(OperationError::submission)?;
        let hash = submitted.hash;
        info!(hash = %hash, repay_amount = %repay_amount, "Liquidation submitted");

        let borrower_row = Submission {
            user_id: borrower_account.id,
            user: borrower,
            kind: TransactionKind::Liquidate,
            hash,
            amount: repay_amount,
            token: gateways.collateral.address(),
            affects_position: true,
        };
        let rows = [
            Submission {
                user_id: liquidator_account.id,
                user: liquidator,
                kind: TransactionKind::Liquidate,
                hash,
                amount: repay_amount,
                token: gateways.borrowing.address(),
                affects_position: false,
            },
            borrower_row.clone(),
        ];
        self.ctx.record_all(&rows).await?;

        let pending = std::slice::from_ref(&borrower_row);
        let (collateral, borrowed) = tokio::try_join!(
            gateways.collateral.collateral_balance(borrower),
            gateways.borrowing.debt_with_interest(borrower),
        )
        .map_err(|e| self.ctx.unrecorded(hash, pending, MirrorStage::PositionMirror, format!("{e:#}")))?;
        let (collateral, borrowed) = (Amount::from(collateral), Amount::from(borrowed));
        let ratio = if borrowed.is_zero() {
            None
        } else {
            self.ctx.best_effort_ratio(borrower).await
        };

        let position = self
            .ctx
            .apply_to_position(borrower_account.id, |current| {
                let Some(mut position) = current else {
                    warn!(user_id = borrower_account.id, "No active position to mirror liquidation into");
                    return PositionChange::Skip;
                };
                position.collateral_amount = collateral;
                position.borrowed_amount = borrowed;
                if ratio.is_some() {
                    position.health_factor = ratio;
                }
                if position.mark_liquidated_if_depleted() {
                    info!(position_id = position.id, "Position liquidated");
                }
                PositionChange::Update(position)
            })
            .await
            .map_err(|e| self.ctx.unrecorded(hash, pending, MirrorStage::PositionMirror, e.to_string()))?;

        if let Some(position) = position {
            info!(
                position_id = position.id,
                collateral = %position.collateral_amount,
                borrowed = %position.borrowed_amount,
                status = %position.status,
                "Borrower position mirrored after liquidation"
            );
        }
        Ok(hash)
    }

    /// Active positions whose last mirrored health factor is at or below the
    /// ledger's liquidation threshold. May lag the ledger.
    pub async fn get_liquidatable_positions(&self) -> Result<Vec<Position>, OperationError> {
        let threshold = self.collateral.get_liquidation_threshold().await?;
        Ok(self.ctx.stores.positions.find_at_risk(threshold).await?)
    }

    pub async fn get_liquidation_bonus(&self) -> Result<Amount, OperationError> {
        let bonus = self
            .ctx
            .gateways
            .collateral
            .liquidation_bonus()
            .await
            .map_err(OperationError::chain_read)?;
        Ok(bonus.into())
    }

    /// Liquidate rows of every user, newest first.
    pub async fn get_liquidation_history(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, OperationError> {
        let filter = TransactionFilter::default().with_kinds(&[TransactionKind::Liquidate]);
        Ok(self.ctx.stores.transactions.list(&filter, offset, limit).await?)
    }

    pub async fn count_liquidations(&self) -> Result<i64, OperationError> {
        let filter = TransactionFilter::default().with_kinds(&[TransactionKind::Liquidate]);
        Ok(self.ctx.stores.transactions.count(&filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use crate::amount::WAD;
    use crate::error::{MirrorStage, OperationError};
    use crate::model::{PositionStatus, TransactionKind};
    use crate::testing::{Harness, ALICE, BOB, CAROL};
    use alloy::primitives::U256;

    /// ALICE: 300 collateral, 200 debt, ratio forced below the 1.2 threshold.
    async fn at_risk_borrower() -> Harness {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "300").await.unwrap();
        h.engine.borrowing.borrow(ALICE, "200").await.unwrap();
        h.ledger.set_ratio(ALICE, WAD * U256::from(11) / U256::from(10));
        h
    }

    #[tokio::test]
    async fn test_invalid_amounts_make_no_external_call() {
        let h = Harness::new();
        for bad in ["0", "-1", "x"] {
            assert!(matches!(
                h.engine.liquidation.liquidate(BOB, ALICE, bad).await,
                Err(OperationError::Validation(_))
            ));
        }
        assert_eq!(h.ledger.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_healthy_position_is_not_eligible() {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "300").await.unwrap();
        h.engine.borrowing.borrow(ALICE, "100").await.unwrap();
        let submits = h.ledger.submit_calls();

        let err = h.engine.liquidation.liquidate(BOB, ALICE, "50").await.unwrap_err();
        assert!(matches!(err, OperationError::NotEligibleForLiquidation { borrower } if borrower == ALICE));
        assert_eq!(h.ledger.submit_calls(), submits);
    }

    #[tokio::test]
    async fn test_self_liquidation_is_rejected() {
        let h = at_risk_borrower().await;
        assert!(matches!(
            h.engine.liquidation.liquidate(ALICE, ALICE, "10").await,
            Err(OperationError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_partial_liquidation_writes_two_rows_and_stays_active() {
        let h = at_risk_borrower().await;
        let hash = h.engine.liquidation.liquidate(BOB, ALICE, "100").await.unwrap();

        let rows = h.store_rows(hash).await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.kind == TransactionKind::Liquidate && r.hash == hash));
        let users: Vec<i64> = rows.iter().map(|r| r.user_id).collect();
        assert!(users.contains(&h.user_id(ALICE)));
        assert!(users.contains(&h.user_id(BOB)));

        // 100 repaid, 105 collateral seized at a 5% bonus
        let position = h.position(ALICE).await.unwrap();
        assert_eq!(position.borrowed_amount.to_string(), "100");
        assert_eq!(position.collateral_amount.to_string(), "195");
        assert_eq!(position.status, PositionStatus::Active);

        assert_eq!(h.engine.liquidation.count_liquidations().await.unwrap(), 2);
        assert_eq!(h.engine.liquidation.get_liquidation_history(0, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_full_liquidation_marks_position_liquidated() {
        let h = at_risk_borrower().await;
        h.engine.liquidation.liquidate(CAROL, ALICE, "200").await.unwrap();

        let positions = h.positions(ALICE).await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::Liquidated);
        assert!(positions[0].borrowed_amount.is_zero());
        assert!(h.position(ALICE).await.is_none());
    }

    #[tokio::test]
    async fn test_liquidator_must_be_active() {
        let h = at_risk_borrower().await;
        h.deactivate(BOB);
        assert!(matches!(
            h.engine.liquidation.liquidate(BOB, ALICE, "10").await,
            Err(OperationError::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn test_record_failure_queues_both_rows() {
        let h = at_risk_borrower().await;
        h.store.fail_transaction_writes(true);

        let err = h.engine.liquidation.liquidate(BOB, ALICE, "100").await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::AppliedButUnrecorded { stage: MirrorStage::TransactionRecord, .. }
        ));
        let queued = h.engine.context().backfill.take(10);
        assert_eq!(queued.len(), 2);
        assert_eq!(queued.iter().filter(|e| e.submission.affects_position).count(), 1);
    }

    #[tokio::test]
    async fn test_liquidatable_positions_use_mirrored_health_factor() {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "300").await.unwrap();
        h.engine.collateral.deposit_collateral(BOB, "300").await.unwrap();

        // mirrored ratio 1.1 for ALICE, 3.0 for BOB
        h.ledger.set_ratio(ALICE, WAD * U256::from(11) / U256::from(10));
        h.engine.borrowing.borrow(ALICE, "100").await.unwrap();
        h.engine.borrowing.borrow(BOB, "100").await.unwrap();

        let liquidatable = h.engine.liquidation.get_liquidatable_positions().await.unwrap();
        assert_eq!(liquidatable.len(), 1);
        assert_eq!(liquidatable[0].user_id, h.user_id(ALICE));
        assert_eq!(
            h.engine.liquidation.get_liquidation_bonus().await.unwrap(),
            crate::amount::Amount::new(h.ledger.bonus())
        );
    }
}
