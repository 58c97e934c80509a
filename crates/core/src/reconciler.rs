//! Confirmation reconciler.
//!
//! Each pass first drains the backfill queue (rows and mirrors that could not
//! be written when their operation ran), then settles Pending transaction rows
//! against receipts. Rows sharing a hash are settled by a single lookup.
//!
//! A row that fails, by revert or by never being mined before the abandonment
//! deadline, had its effect mirrored optimistically; the owner's position is
//! rebuilt from the ledger.

use crate::amount::Amount;
use crate::backfill::{BackfillEntry, Submission};
use crate::config::ReconcilerConfig;
use crate::error::{MirrorStage, OperationError};
use crate::model::{TransactionKind, TransactionRecord, TransactionStatus};
use crate::ops::EngineContext;
use crate::store::StoreError;
use alloy::primitives::{B256, U256};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use lendsync_chain::TxReceipt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const REVERTED: &str = "transaction reverted";
const ABANDONED: &str = "transaction not mined before the abandonment deadline";

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub confirmed: usize,
    pub failed: usize,
    /// Rows left Pending, stale ones included
    pub still_pending: usize,
    pub stale: usize,
    /// Unmined rows given up on; also counted in `failed`
    pub abandoned: usize,
    pub backfilled: usize,
    pub backfill_retries: usize,
    pub backfill_dropped: usize,
}

impl ReconcileReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmationReconciler {
    ctx: Arc<EngineContext>,
    config: ReconcilerConfig,
}

impl ConfirmationReconciler {
    pub fn new(ctx: Arc<EngineContext>, config: ReconcilerConfig) -> Self {
        Self { ctx, config }
    }

    /// Run passes on the configured interval until `shutdown` flips to `true`
    /// or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            batch_size = self.config.batch_size,
            "Starting confirmation reconciler"
        );
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.is_idle() => debug!("Reconciliation pass idle"),
                        Ok(report) => info!(
                            confirmed = report.confirmed,
                            failed = report.failed,
                            still_pending = report.still_pending,
                            stale = report.stale,
                            abandoned = report.abandoned,
                            backfilled = report.backfilled,
                            backfill_retries = report.backfill_retries,
                            backfill_dropped = report.backfill_dropped,
                            "Reconciliation pass complete"
                        ),
                        Err(e) => warn!(error = %e, "Reconciliation pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Confirmation reconciler stopped");
                        return;
                    }
                }
            }
        }
    }

    pub async fn run_once(&self) -> Result<ReconcileReport, OperationError> {
        let mut report = ReconcileReport::default();
        self.drain_backfill(&mut report).await;
        self.settle_pending(&mut report).await?;
        let pruned = self.ctx.locks.prune();
        if pruned > 0 {
            debug!(pruned, "Released idle user locks");
        }
        Ok(report)
    }

    async fn drain_backfill(&self, report: &mut ReconcileReport) {
        let batch = usize::try_from(self.config.batch_size).unwrap_or_default();
        for entry in self.ctx.backfill.take(batch) {
            self.process_backfill(entry, report).await;
        }
    }

    async fn process_backfill(&self, entry: BackfillEntry, report: &mut ReconcileReport) {
        match self.backfill(&entry).await {
            Ok(()) => {
                info!(
                    hash = %entry.submission.hash,
                    user_id = entry.submission.user_id,
                    kind = %entry.submission.kind,
                    stage = %entry.stage,
                    "Backfilled local bookkeeping"
                );
                report.backfilled += 1;
            }
            Err(e) => {
                let hash = entry.submission.hash;
                let user_id = entry.submission.user_id;
                let attempts = entry.attempts + 1;
                match self.ctx.backfill.requeue(entry, self.config.max_backfill_attempts) {
                    None => {
                        warn!(hash = %hash, user_id, attempts, error = %e, "Backfill failed, requeued");
                        report.backfill_retries += 1;
                    }
                    Some(dropped) => {
                        error!(
                            hash = %dropped.submission.hash,
                            user_id = dropped.submission.user_id,
                            kind = %dropped.submission.kind,
                            amount = %dropped.submission.amount,
                            stage = %dropped.stage,
                            first_failure = %dropped.reason,
                            attempts = dropped.attempts,
                            error = %e,
                            "Backfill abandoned, local bookkeeping needs manual repair"
                        );
                        report.backfill_dropped += 1;
                    }
                }
            }
        }
    }

    /// Insert the missing row (idempotent per `(hash, user_id)`) and rebuild
    /// the position from fresh ledger reads.
    async fn backfill(&self, entry: &BackfillEntry) -> Result<(), OperationError> {
        let submission = &entry.submission;
        let _guard = self.ctx.locks.lock(submission.user_id).await;

        let transactions = &self.ctx.stores.transactions;
        let recorded = transactions
            .find_by_hash(submission.hash)
            .await?
            .iter()
            .any(|row| row.user_id == submission.user_id);
        if !recorded {
            match transactions.create(submission.to_record()).await {
                Ok(_) | Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if submission.affects_position {
            self.ctx
                .resync_position(submission.user_id, submission.user, submission.kind)
                .await?;
        }
        Ok(())
    }

    async fn settle_pending(&self, report: &mut ReconcileReport) -> Result<(), OperationError> {
        let pending = self
            .ctx
            .stores
            .transactions
            .find_pending(self.config.batch_size)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut by_hash: HashMap<B256, Vec<TransactionRecord>> = HashMap::new();
        for row in pending {
            by_hash.entry(row.hash).or_default().push(row);
        }

        let receipts = &self.ctx.gateways.receipts;
        let lookups: Vec<_> = stream::iter(by_hash)
            .map(|(hash, rows)| async move { (hash, rows, receipts.receipt(hash).await) })
            .buffer_unordered(self.config.max_concurrent_lookups.max(1))
            .collect()
            .await;

        let now = Utc::now();
        for (hash, rows, lookup) in lookups {
            match lookup {
                Ok(Some(receipt)) => self.settle(&receipt, rows, report).await,
                Ok(None) => {
                    let oldest = rows.iter().map(|r| r.created_at).min().unwrap_or(now);
                    let age = (now - oldest).to_std().unwrap_or_default();
                    if age >= self.config.abandon_after() {
                        warn!(hash = %hash, since = %oldest, "Transaction never mined, giving up");
                        self.abandon(rows, report).await;
                        continue;
                    }
                    report.still_pending += rows.len();
                    if age >= self.config.stale_after() {
                        report.stale += rows.len();
                        warn!(hash = %hash, since = %oldest, "Transaction still unmined");
                    }
                }
                Err(e) => {
                    report.still_pending += rows.len();
                    warn!(hash = %hash, error = %format!("{e:#}"), "Receipt lookup failed");
                }
            }
        }
        Ok(())
    }

    async fn settle(
        &self,
        receipt: &TxReceipt,
        rows: Vec<TransactionRecord>,
        report: &mut ReconcileReport,
    ) {
        for mut row in rows {
            row.status = if receipt.success {
                TransactionStatus::Confirmed
            } else {
                TransactionStatus::Failed
            };
            row.block_number = receipt.block_number;
            row.gas_used = Some(receipt.gas_used);
            row.gas_price = Some(Amount::new(U256::from(receipt.gas_price)));
            if !receipt.success {
                row.error_message = Some(REVERTED.to_string());
            }

            match self.ctx.stores.transactions.update(&row).await {
                Ok(saved) if receipt.success => {
                    debug!(id = saved.id, hash = %saved.hash, block = ?saved.block_number, "Transaction confirmed");
                    report.confirmed += 1;
                }
                Ok(saved) => {
                    warn!(id = saved.id, hash = %saved.hash, user_id = saved.user_id, kind = %saved.kind, "Transaction reverted on the ledger");
                    report.failed += 1;
                    self.unwind(&saved, report).await;
                }
                Err(e) => {
                    warn!(id = row.id, hash = %row.hash, error = %e, "Failed to settle transaction");
                    report.still_pending += 1;
                }
            }
        }
    }

    /// Mark unmined rows Failed. A transaction dropped from the mempool never
    /// gets a receipt; leaving it Pending would pin the oldest-first batch.
    async fn abandon(&self, rows: Vec<TransactionRecord>, report: &mut ReconcileReport) {
        for mut row in rows {
            row.status = TransactionStatus::Failed;
            row.error_message = Some(ABANDONED.to_string());
            match self.ctx.stores.transactions.update(&row).await {
                Ok(saved) => {
                    report.failed += 1;
                    report.abandoned += 1;
                    self.unwind(&saved, report).await;
                }
                Err(e) => {
                    warn!(id = row.id, hash = %row.hash, error = %e, "Failed to abandon transaction");
                    report.still_pending += 1;
                }
            }
        }
    }

    /// Whether the row's owner had their position mirror moved by it.
    fn moves_position(&self, row: &TransactionRecord) -> bool {
        match row.kind {
            TransactionKind::Deposit | TransactionKind::Withdraw => false,
            TransactionKind::Borrow
            | TransactionKind::Repay
            | TransactionKind::DepositCollateral
            | TransactionKind::WithdrawCollateral => true,
            // The borrower's row carries the seized collateral token.
            TransactionKind::Liquidate => {
                row.token_address == self.ctx.gateways.collateral.address()
            }
        }
    }

    /// Rebuild the owner's position after a failed row, through the backfill
    /// path so a failure here is retried on later passes.
    async fn unwind(&self, row: &TransactionRecord, report: &mut ReconcileReport) {
        if !self.moves_position(row) {
            return;
        }
        let user = match self.ctx.stores.users.find_by_id(row.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(user_id = row.user_id, hash = %row.hash, "Failed transaction has no account, position not resynced");
                return;
            }
            Err(e) => {
                warn!(user_id = row.user_id, hash = %row.hash, error = %e, "Account lookup failed, position not resynced");
                return;
            }
        };
        let submission = Submission {
            user_id: row.user_id,
            user: user.address,
            kind: row.kind,
            hash: row.hash,
            amount: row.amount,
            token: row.token_address,
            affects_position: true,
        };
        let reason = row.error_message.clone().unwrap_or_else(|| REVERTED.to_string());
        self.process_backfill(
            BackfillEntry::new(submission, MirrorStage::PositionMirror, reason),
            report,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::MirrorStage;
    use crate::model::PositionStatus;
    use crate::testing::{Harness, ALICE, BOB};
    use std::time::Duration;

    #[tokio::test]
    async fn test_mined_transaction_is_confirmed_with_gas_details() {
        let h = Harness::new();
        let hash = h.engine.lending.deposit(ALICE, "1000").await.unwrap();
        h.ledger.mine(hash, true);

        let report = h.reconciler().run_once().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(report.still_pending, 0);

        let row = &h.store_rows(hash).await[0];
        assert_eq!(row.status, TransactionStatus::Confirmed);
        assert_eq!(row.block_number, Some(100));
        assert_eq!(row.gas_used, Some(21_000));
        assert_eq!(row.gas_price.unwrap().to_string(), "2000000000");
        assert_eq!(row.error_message, None);
    }

    #[tokio::test]
    async fn test_reverted_transaction_is_failed() {
        let h = Harness::new();
        let hash = h.engine.lending.deposit(ALICE, "1000").await.unwrap();
        h.ledger.mine(hash, false);

        let report = h.reconciler().run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        // Lending deposits have no position to rebuild.
        assert_eq!(report.backfilled, 0);
        let row = &h.store_rows(hash).await[0];
        assert_eq!(row.status, TransactionStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some(REVERTED));
    }

    #[tokio::test]
    async fn test_reverted_borrow_resyncs_position() {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "300").await.unwrap();
        let hash = h.engine.borrowing.borrow(ALICE, "100").await.unwrap();
        assert_eq!(h.position(ALICE).await.unwrap().borrowed_amount.to_string(), "100");

        // The ledger never applied it.
        h.ledger.set_debt(ALICE, U256::ZERO);
        h.ledger.mine(hash, false);

        let report = h.reconciler().run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.backfilled, 1);
        let position = h.position(ALICE).await.unwrap();
        assert_eq!(position.borrowed_amount.to_string(), "0");
        assert_eq!(position.collateral_amount.to_string(), "300");
        assert!(h.engine.borrowing.get_borrowed_amount(ALICE).await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn test_reverted_withdrawal_reopens_closed_position() {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "40").await.unwrap();
        let hash = h.engine.collateral.withdraw_collateral(ALICE, "40").await.unwrap();
        assert!(h.position(ALICE).await.is_none());

        h.ledger.set_collateral(ALICE, U256::from(40u64));
        h.ledger.mine(hash, false);
        h.reconciler().run_once().await.unwrap();

        let positions = h.positions(ALICE).await;
        assert_eq!(positions.len(), 2);
        let active = h.position(ALICE).await.expect("ledger still holds collateral");
        assert_eq!(active.collateral_amount.to_string(), "40");
        assert!(positions.iter().any(|p| p.status == PositionStatus::Closed));
    }

    #[tokio::test]
    async fn test_unmined_row_is_abandoned_without_blocking_newer_rows() {
        let h = Harness::new();
        let dropped = h.engine.lending.deposit(ALICE, "1").await.unwrap();
        let mined = h.engine.lending.deposit(ALICE, "2").await.unwrap();
        h.ledger.mine(mined, true);

        let reconciler = ConfirmationReconciler::new(
            h.engine.context().clone(),
            ReconcilerConfig {
                batch_size: 1,
                stale_after_secs: 0,
                abandon_after_secs: 0,
                ..EngineConfig::testing().reconciler
            },
        );
        for _ in 0..3 {
            reconciler.run_once().await.unwrap();
        }

        let row = &h.store_rows(dropped).await[0];
        assert_eq!(row.status, TransactionStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some(ABANDONED));
        assert_eq!(h.store_rows(mined).await[0].status, TransactionStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_unmined_stays_pending_and_turns_stale() {
        let h = Harness::new();
        let hash = h.engine.lending.deposit(ALICE, "1000").await.unwrap();

        let report = h.reconciler().run_once().await.unwrap();
        assert_eq!(report.still_pending, 1);
        assert_eq!(report.stale, 0);

        let eager = ConfirmationReconciler::new(
            h.engine.context().clone(),
            ReconcilerConfig {
                stale_after_secs: 0,
                ..EngineConfig::testing().reconciler
            },
        );
        let report = eager.run_once().await.unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(h.store_rows(hash).await[0].status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_receipt_lookup_failure_keeps_rows_pending() {
        let h = Harness::new();
        let hash = h.engine.lending.deposit(ALICE, "1000").await.unwrap();
        h.ledger.mine(hash, true);
        h.ledger.fail_receipt_lookups(true);

        let report = h.reconciler().run_once().await.unwrap();
        assert_eq!(report.still_pending, 1);
        assert_eq!(h.store_rows(hash).await[0].status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_liquidation_rows_settle_together() {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "300").await.unwrap();
        h.engine.borrowing.borrow(ALICE, "200").await.unwrap();
        h.ledger.set_ratio(ALICE, crate::amount::WAD);
        let hash = h.engine.liquidation.liquidate(BOB, ALICE, "50").await.unwrap();
        h.ledger.mine(hash, true);

        let report = h.reconciler().run_once().await.unwrap();
        assert_eq!(report.confirmed, 2);
        assert_eq!(report.still_pending, 2);
        assert!(h
            .store_rows(hash)
            .await
            .iter()
            .all(|r| r.status == TransactionStatus::Confirmed));
    }

    #[tokio::test]
    async fn test_backfill_inserts_row_and_resyncs_position() {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "300").await.unwrap();
        h.store.fail_transaction_writes(true);
        let err = h.engine.borrowing.borrow(ALICE, "100").await.unwrap_err();
        let hash = err.applied_hash().unwrap();
        assert!(h.store_rows(hash).await.is_empty());
        assert!(h.position(ALICE).await.unwrap().borrowed_amount.is_zero());

        h.store.fail_transaction_writes(false);
        let report = h.reconciler().run_once().await.unwrap();
        assert_eq!(report.backfilled, 1);
        assert!(h.engine.context().backfill.is_empty());

        assert_eq!(h.store_rows(hash).await.len(), 1);
        let position = h.position(ALICE).await.unwrap();
        assert_eq!(position.borrowed_amount.to_string(), "100");
        assert_eq!(position.collateral_amount.to_string(), "300");
        assert_eq!(position.health_factor.unwrap().to_string(), "3000000000000000000");
    }

    #[tokio::test]
    async fn test_backfill_of_mirror_stage_does_not_duplicate_row() {
        let h = Harness::new();
        h.engine.collateral.deposit_collateral(ALICE, "40").await.unwrap();
        h.store.fail_position_writes(true);
        let err = h.engine.collateral.withdraw_collateral(ALICE, "40").await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::AppliedButUnrecorded { stage: MirrorStage::PositionMirror, .. }
        ));

        h.store.fail_position_writes(false);
        h.reconciler().run_once().await.unwrap();
        assert_eq!(h.store_rows(err.applied_hash().unwrap()).await.len(), 1);
        let positions = h.positions(ALICE).await;
        assert_eq!(positions[0].status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_failed_backfill_is_requeued() {
        let h = Harness::new();
        h.store.fail_transaction_writes(true);
        h.engine.lending.deposit(ALICE, "5").await.unwrap_err();

        let report = h.reconciler().run_once().await.unwrap();
        assert_eq!(report.backfill_retries, 1);
        let queued = h.engine.context().backfill.take(10);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_backfill_dropped_after_max_attempts() {
        let h = Harness::new();
        let max = EngineConfig::testing().reconciler.max_backfill_attempts;
        h.store.fail_transaction_writes(true);
        h.engine.lending.deposit(ALICE, "5").await.unwrap_err();

        let reconciler = h.reconciler();
        let mut dropped = 0;
        for _ in 0..max {
            dropped += reconciler.run_once().await.unwrap().backfill_dropped;
        }
        assert_eq!(dropped, 1);
        assert!(h.engine.context().backfill.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new();
        let reconciler = h.reconciler();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { reconciler.run(rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("reconciler did not stop")
            .unwrap();
    }
}
