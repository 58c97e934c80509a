//! Shared bookkeeping steps: caller resolution, transaction records and the
//! position mirror.

use super::EngineContext;
use crate::amount::Amount;
use crate::backfill::{BackfillEntry, Submission};
use crate::error::{MirrorStage, OperationError};
use crate::model::{Position, TransactionKind, UserAccount};
use crate::store::StoreError;
use alloy::primitives::{Address, B256};
use chrono::Utc;
use tracing::{debug, error, warn};

/// What to do with the user's Active position, decided from its current state.
pub(crate) enum PositionChange {
    Create(Position),
    Update(Position),
    Skip,
}

impl EngineContext {
    /// Caller must exist and be active.
    pub(crate) async fn resolve_user(&self, address: Address) -> Result<UserAccount, OperationError> {
        match self.stores.users.find_by_address(address).await? {
            Some(user) if user.active => Ok(user),
            Some(_) => Err(OperationError::Authorization(format!(
                "account {address} is inactive"
            ))),
            None => Err(OperationError::Authorization(format!(
                "unknown account {address}"
            ))),
        }
    }

    /// Record rows in order. On the first failure every row from there on is
    /// queued for backfill.
    pub(crate) async fn record_all(&self, submissions: &[Submission]) -> Result<(), OperationError> {
        for (index, submission) in submissions.iter().enumerate() {
            match self.stores.transactions.create(submission.to_record()).await {
                Ok(record) => {
                    debug!(id = record.id, hash = %record.hash, user_id = record.user_id, kind = %record.kind, "Transaction recorded");
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(hash = %submission.hash, reason = %reason, "Transaction already recorded");
                }
                Err(e) => {
                    return Err(self.unrecorded(
                        submission.hash,
                        &submissions[index..],
                        MirrorStage::TransactionRecord,
                        e.to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Queue `pending` for backfill and build the partial-failure error.
    pub(crate) fn unrecorded(
        &self,
        hash: B256,
        pending: &[Submission],
        stage: MirrorStage,
        reason: String,
    ) -> OperationError {
        for submission in pending {
            self.backfill
                .push(BackfillEntry::new(submission.clone(), stage, reason.clone()));
        }
        error!(
            hash = %hash,
            stage = %stage,
            reason = %reason,
            queued = pending.len(),
            "Ledger operation applied but not recorded locally, queued for backfill"
        );
        OperationError::AppliedButUnrecorded { hash, stage, reason }
    }

    /// Read-modify-write of the user's Active position, retried on version or
    /// insert conflicts.
    pub(crate) async fn apply_to_position<F>(
        &self,
        user_id: i64,
        mut apply: F,
    ) -> Result<Option<Position>, StoreError>
    where
        F: FnMut(Option<Position>) -> PositionChange,
    {
        let attempts = self.mirror.max_update_attempts.max(1);
        for attempt in 1..=attempts {
            let current = self.stores.positions.find_active_by_user_id(user_id).await?;
            match apply(current) {
                PositionChange::Skip => return Ok(None),
                PositionChange::Create(position) => {
                    match self.stores.positions.create(position).await {
                        Ok(created) => return Ok(Some(created)),
                        Err(StoreError::Conflict(reason)) => {
                            debug!(user_id = user_id, attempt = attempt, reason = %reason, "Active position appeared concurrently, retrying as update");
                        }
                        Err(e) => return Err(e),
                    }
                }
                PositionChange::Update(position) => {
                    match self.stores.positions.update(&position).await {
                        Ok(saved) => return Ok(Some(saved)),
                        Err(StoreError::VersionConflict { id }) => {
                            debug!(user_id = user_id, position_id = id, attempt = attempt, "Position version conflict, retrying");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Err(StoreError::Conflict(format!(
            "position of user {user_id} kept changing after {attempts} attempts"
        )))
    }

    /// Collateral ratio for the health factor; failures keep the old value.
    pub(crate) async fn best_effort_ratio(&self, user: Address) -> Option<Amount> {
        match self.gateways.collateral.collateral_ratio(user).await {
            Ok(ratio) => Some(ratio.into()),
            Err(e) => {
                warn!(user = %user, error = %format!("{e:#}"), "Collateral ratio read failed, health factor not refreshed");
                None
            }
        }
    }

    /// Overwrite the user's Active position with the ledger's balances.
    ///
    /// When no Active position exists but the ledger still holds collateral or
    /// debt (the last one was closed or liquidated by a transaction that
    /// later failed), a fresh Active position carries those balances.
    pub(crate) async fn resync_position(
        &self,
        user_id: i64,
        user: Address,
        kind: TransactionKind,
    ) -> Result<Option<Position>, OperationError> {
        let (collateral, borrowed) = tokio::try_join!(
            self.gateways.collateral.collateral_balance(user),
            self.gateways.borrowing.debt_with_interest(user),
        )
        .map_err(OperationError::chain_read)?;
        let collateral = Amount::from(collateral);
        let borrowed = Amount::from(borrowed);
        let ratio = self.best_effort_ratio(user).await;
        let collateral_token = self.gateways.collateral.address();
        let borrowed_token = self.gateways.borrowing.address();

        let position = self
            .apply_to_position(user_id, |current| match current {
                Some(mut position) => {
                    position.collateral_amount = collateral;
                    position.borrowed_amount = borrowed;
                    if ratio.is_some() {
                        position.health_factor = ratio;
                    }
                    if kind == TransactionKind::Liquidate {
                        position.mark_liquidated_if_depleted();
                    } else {
                        position.close_if_empty();
                    }
                    PositionChange::Update(position)
                }
                None if !(collateral.is_zero() && borrowed.is_zero()) => {
                    let mut position = Position::open(user_id, collateral_token, borrowed_token);
                    position.collateral_amount = collateral;
                    position.borrowed_amount = borrowed;
                    if !borrowed.is_zero() {
                        position.health_factor = ratio;
                        position.last_interest_update = Some(Utc::now());
                    }
                    PositionChange::Create(position)
                }
                None => PositionChange::Skip,
            })
            .await?;
        if let Some(position) = &position {
            debug!(
                position_id = position.id,
                collateral = %position.collateral_amount,
                borrowed = %position.borrowed_amount,
                status = %position.status,
                "Position resynced from ledger"
            );
        }
        Ok(position)
    }
}
