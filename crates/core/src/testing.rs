//! In-process doubles for the ledger and the store, plus a wired-up engine.
//!
//! [`FakeLedger`] keeps per-user balances the way the lending contracts do and
//! implements every gateway trait. [`FlakyStore`] wraps [`MemoryStore`] with
//! switchable write failures.

use crate::amount::{Amount, WAD};
use crate::config::EngineConfig;
use crate::model::{Position, TransactionRecord, UserAccount};
use crate::ops::{Engine, EngineContext};
use crate::reconciler::ConfirmationReconciler;
use crate::store::{
    MemoryStore, PositionFilter, PositionStore, StoreError, Stores, TransactionFilter,
    TransactionLedger, UserDirectory,
};
use alloy::primitives::{address, Address, B256, U256};
use anyhow::{bail, Result};
use async_trait::async_trait;
use lendsync_chain::{
    BorrowingGateway, ChainGateways, CollateralGateway, LendingPoolGateway, ReceiptSource,
    SubmittedTx, TxReceipt,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ALICE: Address = address!("a11ce00000000000000000000000000000000001");
pub const BOB: Address = address!("b0b0000000000000000000000000000000000002");
pub const CAROL: Address = address!("ca40100000000000000000000000000000000003");

pub const LENDING_POOL: Address = address!("0000000000000000000000000000000000000001");
pub const BORROWING: Address = address!("0000000000000000000000000000000000000002");
pub const COLLATERAL: Address = address!("0000000000000000000000000000000000000003");

fn wad_fraction(numerator: u64, denominator: u64) -> U256 {
    WAD * U256::from(numerator) / U256::from(denominator)
}

#[derive(Debug, Default)]
struct LedgerState {
    supplied: HashMap<Address, U256>,
    supplied_principal: HashMap<Address, U256>,
    collateral: HashMap<Address, U256>,
    debt: HashMap<Address, U256>,
    debt_principal: HashMap<Address, U256>,
    max_borrowable: HashMap<Address, U256>,
    ratios: HashMap<Address, U256>,
    receipts: HashMap<B256, TxReceipt>,
}

fn balance(map: &HashMap<Address, U256>, user: Address) -> U256 {
    map.get(&user).copied().unwrap_or_default()
}

fn credit(map: &mut HashMap<Address, U256>, user: Address, amount: U256) {
    let entry = map.entry(user).or_default();
    *entry = entry.saturating_add(amount);
}

fn debit(map: &mut HashMap<Address, U256>, user: Address, amount: U256) {
    let entry = map.entry(user).or_default();
    *entry = entry.saturating_sub(amount);
}

/// Lending, borrowing and collateral contracts in one process.
///
/// Defaults: minimum collateral ratio 1.5, liquidation threshold 1.2,
/// liquidation bonus 5%, all at 1e18 scale.
#[derive(Debug)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
    min_ratio: U256,
    threshold: U256,
    bonus: U256,
    borrow_rate: U256,
    lending_rate: U256,
    next_hash: AtomicU64,
    submit_calls: AtomicUsize,
    read_calls: AtomicUsize,
    submit_delay_ms: AtomicU64,
    fail_submissions: AtomicBool,
    fail_ratio_reads: AtomicBool,
    fail_receipt_lookups: AtomicBool,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            min_ratio: wad_fraction(3, 2),
            threshold: wad_fraction(6, 5),
            bonus: wad_fraction(1, 20),
            borrow_rate: wad_fraction(8, 100),
            lending_rate: wad_fraction(5, 100),
            next_hash: AtomicU64::new(1),
            submit_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
            submit_delay_ms: AtomicU64::new(0),
            fail_submissions: AtomicBool::new(false),
            fail_ratio_reads: AtomicBool::new(false),
            fail_receipt_lookups: AtomicBool::new(false),
        }
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn borrow_rate(&self) -> U256 {
        self.borrow_rate
    }

    pub fn min_ratio(&self) -> U256 {
        self.min_ratio
    }

    pub fn bonus(&self) -> U256 {
        self.bonus
    }

    pub fn collateral_address(&self) -> Address {
        COLLATERAL
    }

    /// Pin the contract's borrowing allowance for `user`.
    pub fn set_max_borrowable(&self, user: Address, amount: U256) {
        self.state.lock().max_borrowable.insert(user, amount);
    }

    /// Pin the collateral ratio reported for `user`.
    pub fn set_ratio(&self, user: Address, ratio: U256) {
        self.state.lock().ratios.insert(user, ratio);
    }

    pub fn accrue_lending_interest(&self, user: Address, interest: U256) {
        credit(&mut self.state.lock().supplied, user, interest);
    }

    pub fn accrue_debt_interest(&self, user: Address, interest: U256) {
        credit(&mut self.state.lock().debt, user, interest);
    }

    /// Overwrite the outstanding debt, e.g. to undo a reverted borrow or repay.
    pub fn set_debt(&self, user: Address, debt: U256) {
        let mut state = self.state.lock();
        state.debt.insert(user, debt);
        state.debt_principal.insert(user, debt);
    }

    pub fn set_collateral(&self, user: Address, amount: U256) {
        self.state.lock().collateral.insert(user, amount);
    }

    pub fn set_submit_delay_ms(&self, ms: u64) {
        self.submit_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::SeqCst);
    }

    pub fn fail_ratio_reads(&self, fail: bool) {
        self.fail_ratio_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_receipt_lookups(&self, fail: bool) {
        self.fail_receipt_lookups.store(fail, Ordering::SeqCst);
    }

    /// Make a receipt available for its hash.
    pub fn set_receipt(&self, receipt: TxReceipt) {
        self.state.lock().receipts.insert(receipt.hash, receipt);
    }

    /// Mark `hash` mined in block 100 with fixed gas figures.
    pub fn mine(&self, hash: B256, success: bool) {
        self.set_receipt(TxReceipt {
            hash,
            success,
            block_number: Some(100),
            gas_used: 21_000,
            gas_price: 2_000_000_000,
        });
    }

    async fn submit(&self, apply: impl FnOnce(&mut LedgerState) -> Result<()>) -> Result<SubmittedTx> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.submit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_submissions.load(Ordering::SeqCst) {
            bail!("server returned an error response: execution reverted");
        }
        apply(&mut self.state.lock())?;
        let n = self.next_hash.fetch_add(1, Ordering::SeqCst);
        Ok(SubmittedTx::new(B256::from(U256::from(n).to_be_bytes::<32>())))
    }

    fn read<T>(&self, f: impl FnOnce(&LedgerState) -> T) -> T {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        f(&self.state.lock())
    }

    fn ratio_of(&self, state: &LedgerState, user: Address) -> U256 {
        if let Some(ratio) = state.ratios.get(&user) {
            return *ratio;
        }
        let debt = balance(&state.debt, user);
        if debt.is_zero() {
            return U256::MAX;
        }
        balance(&state.collateral, user) * WAD / debt
    }
}

#[async_trait]
impl LendingPoolGateway for FakeLedger {
    fn address(&self) -> Address {
        LENDING_POOL
    }

    async fn deposit(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.submit(|s| {
            credit(&mut s.supplied, user, amount);
            credit(&mut s.supplied_principal, user, amount);
            Ok(())
        })
        .await
    }

    async fn withdraw(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.submit(|s| {
            if amount > balance(&s.supplied, user) {
                bail!("execution reverted: insufficient balance");
            }
            debit(&mut s.supplied, user, amount);
            debit(&mut s.supplied_principal, user, amount);
            Ok(())
        })
        .await
    }

    async fn balance_with_interest(&self, user: Address) -> Result<U256> {
        Ok(self.read(|s| balance(&s.supplied, user)))
    }

    async fn principal(&self, user: Address) -> Result<U256> {
        Ok(self.read(|s| balance(&s.supplied_principal, user)))
    }

    async fn total_lending(&self) -> Result<U256> {
        Ok(self.read(|s| s.supplied.values().fold(U256::ZERO, |acc, v| acc + *v)))
    }

    async fn annual_interest_rate(&self) -> Result<U256> {
        Ok(self.read(|_| self.lending_rate))
    }
}

#[async_trait]
impl BorrowingGateway for FakeLedger {
    fn address(&self) -> Address {
        BORROWING
    }

    async fn borrow(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.submit(|s| {
            credit(&mut s.debt, user, amount);
            credit(&mut s.debt_principal, user, amount);
            if let Some(max) = s.max_borrowable.get_mut(&user) {
                *max = max.saturating_sub(amount);
            }
            Ok(())
        })
        .await
    }

    async fn repay(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.submit(|s| {
            debit(&mut s.debt, user, amount);
            debit(&mut s.debt_principal, user, amount);
            Ok(())
        })
        .await
    }

    async fn debt_with_interest(&self, user: Address) -> Result<U256> {
        Ok(self.read(|s| balance(&s.debt, user)))
    }

    async fn principal(&self, user: Address) -> Result<U256> {
        Ok(self.read(|s| balance(&s.debt_principal, user)))
    }

    async fn total_borrowed(&self) -> Result<U256> {
        Ok(self.read(|s| s.debt.values().fold(U256::ZERO, |acc, v| acc + *v)))
    }

    async fn current_rate(&self) -> Result<U256> {
        Ok(self.read(|_| self.borrow_rate))
    }
}

#[async_trait]
impl CollateralGateway for FakeLedger {
    fn address(&self) -> Address {
        COLLATERAL
    }

    async fn deposit_collateral(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.submit(|s| {
            credit(&mut s.collateral, user, amount);
            Ok(())
        })
        .await
    }

    async fn withdraw_collateral(&self, user: Address, amount: U256) -> Result<SubmittedTx> {
        self.submit(|s| {
            if amount > balance(&s.collateral, user) {
                bail!("execution reverted: insufficient collateral");
            }
            debit(&mut s.collateral, user, amount);
            Ok(())
        })
        .await
    }

    async fn liquidate(
        &self,
        _liquidator: Address,
        borrower: Address,
        repay_amount: U256,
    ) -> Result<SubmittedTx> {
        let bonus = self.bonus;
        self.submit(|s| {
            let repaid = repay_amount.min(balance(&s.debt, borrower));
            debit(&mut s.debt, borrower, repaid);
            debit(&mut s.debt_principal, borrower, repaid);
            let seized = (repaid * (WAD + bonus) / WAD).min(balance(&s.collateral, borrower));
            debit(&mut s.collateral, borrower, seized);
            Ok(())
        })
        .await
    }

    async fn collateral_balance(&self, user: Address) -> Result<U256> {
        Ok(self.read(|s| balance(&s.collateral, user)))
    }

    async fn collateral_ratio(&self, user: Address) -> Result<U256> {
        if self.fail_ratio_reads.load(Ordering::SeqCst) {
            bail!("getCollateralRatio: connection reset");
        }
        Ok(self.read(|s| self.ratio_of(s, user)))
    }

    async fn max_borrowable(&self, user: Address) -> Result<U256> {
        Ok(self.read(|s| {
            if let Some(max) = s.max_borrowable.get(&user) {
                return *max;
            }
            let allowance = balance(&s.collateral, user) * WAD / self.min_ratio;
            allowance.saturating_sub(balance(&s.debt, user))
        }))
    }

    async fn min_collateral_ratio(&self) -> Result<U256> {
        Ok(self.read(|_| self.min_ratio))
    }

    async fn liquidation_threshold(&self) -> Result<U256> {
        Ok(self.read(|_| self.threshold))
    }

    async fn liquidation_bonus(&self) -> Result<U256> {
        Ok(self.read(|_| self.bonus))
    }
}

#[async_trait]
impl ReceiptSource for FakeLedger {
    async fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
        if self.fail_receipt_lookups.load(Ordering::SeqCst) {
            bail!("eth_getTransactionReceipt: request timed out");
        }
        Ok(self.read(|s| s.receipts.get(&hash).cloned()))
    }
}

/// [`MemoryStore`] whose writes can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_transaction_writes: AtomicBool,
    fail_position_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn fail_transaction_writes(&self, fail: bool) {
        self.fail_transaction_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_position_writes(&self, fail: bool) {
        self.fail_position_writes.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("{what} write refused: connection closed")));
        }
        Ok(())
    }
}

#[async_trait]
impl PositionStore for FlakyStore {
    async fn create(&self, position: Position) -> Result<Position, StoreError> {
        Self::check(&self.fail_position_writes, "position")?;
        PositionStore::create(&self.inner, position).await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Position>, StoreError> {
        PositionStore::find_by_id(&self.inner, id).await
    }

    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<Position>, StoreError> {
        PositionStore::find_by_user_id(&self.inner, user_id).await
    }

    async fn find_active_by_user_id(&self, user_id: i64) -> Result<Option<Position>, StoreError> {
        self.inner.find_active_by_user_id(user_id).await
    }

    async fn update(&self, position: &Position) -> Result<Position, StoreError> {
        Self::check(&self.fail_position_writes, "position")?;
        PositionStore::update(&self.inner, position).await
    }

    async fn update_status(
        &self,
        id: i64,
        status: crate::model::PositionStatus,
    ) -> Result<Position, StoreError> {
        Self::check(&self.fail_position_writes, "position")?;
        self.inner.update_status(id, status).await
    }

    async fn find_at_risk(&self, threshold: Amount) -> Result<Vec<Position>, StoreError> {
        self.inner.find_at_risk(threshold).await
    }

    async fn list(
        &self,
        filter: &PositionFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Position>, StoreError> {
        PositionStore::list(&self.inner, filter, offset, limit).await
    }

    async fn count(&self, filter: &PositionFilter) -> Result<i64, StoreError> {
        PositionStore::count(&self.inner, filter).await
    }
}

#[async_trait]
impl TransactionLedger for FlakyStore {
    async fn create(&self, record: TransactionRecord) -> Result<TransactionRecord, StoreError> {
        Self::check(&self.fail_transaction_writes, "transaction")?;
        TransactionLedger::create(&self.inner, record).await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<TransactionRecord>, StoreError> {
        TransactionLedger::find_by_id(&self.inner, id).await
    }

    async fn find_by_hash(&self, hash: B256) -> Result<Vec<TransactionRecord>, StoreError> {
        self.inner.find_by_hash(hash).await
    }

    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<TransactionRecord>, StoreError> {
        TransactionLedger::find_by_user_id(&self.inner, user_id).await
    }

    async fn update(&self, record: &TransactionRecord) -> Result<TransactionRecord, StoreError> {
        Self::check(&self.fail_transaction_writes, "transaction")?;
        TransactionLedger::update(&self.inner, record).await
    }

    async fn find_pending(&self, limit: i64) -> Result<Vec<TransactionRecord>, StoreError> {
        self.inner.find_pending(limit).await
    }

    async fn list(
        &self,
        filter: &TransactionFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        TransactionLedger::list(&self.inner, filter, offset, limit).await
    }

    async fn count(&self, filter: &TransactionFilter) -> Result<i64, StoreError> {
        TransactionLedger::count(&self.inner, filter).await
    }
}

#[async_trait]
impl UserDirectory for FlakyStore {
    async fn find_by_address(&self, address: Address) -> Result<Option<UserAccount>, StoreError> {
        self.inner.find_by_address(address).await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<UserAccount>, StoreError> {
        UserDirectory::find_by_id(&self.inner, id).await
    }
}

/// Engine wired to a [`FakeLedger`] and a [`FlakyStore`], with ALICE, BOB
/// and CAROL registered as active accounts.
pub struct Harness {
    pub ledger: Arc<FakeLedger>,
    pub store: Arc<FlakyStore>,
    pub engine: Engine,
    users: HashMap<Address, i64>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::testing())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let ledger = Arc::new(FakeLedger::new());
        let store = Arc::new(FlakyStore::new());
        let users = [ALICE, BOB, CAROL]
            .into_iter()
            .map(|address| (address, store.inner().insert_user(address, true).id))
            .collect();
        let gateways = ChainGateways {
            lending_pool: ledger.clone(),
            borrowing: ledger.clone(),
            collateral: ledger.clone(),
            receipts: ledger.clone(),
        };
        let context = EngineContext::new(gateways, Stores::shared(store.clone()), &config)
            .expect("testing config is valid");
        Self {
            ledger,
            store,
            engine: Engine::new(Arc::new(context)),
            users,
        }
    }

    pub fn reconciler(&self) -> ConfirmationReconciler {
        ConfirmationReconciler::new(
            self.engine.context().clone(),
            EngineConfig::testing().reconciler,
        )
    }

    pub fn user_id(&self, address: Address) -> i64 {
        *self.users.get(&address).expect("registered test account")
    }

    pub fn deactivate(&self, address: Address) {
        self.store
            .inner()
            .set_user_active(self.user_id(address), false)
            .expect("registered test account");
    }

    /// Every record sharing `hash`.
    pub async fn store_rows(&self, hash: B256) -> Vec<TransactionRecord> {
        self.store.find_by_hash(hash).await.expect("memory store read")
    }

    pub async fn transaction_count(&self) -> i64 {
        TransactionLedger::count(&*self.store, &TransactionFilter::default())
            .await
            .expect("memory store read")
    }

    /// The user's Active position, if any.
    pub async fn position(&self, address: Address) -> Option<Position> {
        self.store
            .find_active_by_user_id(self.user_id(address))
            .await
            .expect("memory store read")
    }

    /// Every position of the user, newest first.
    pub async fn positions(&self, address: Address) -> Vec<Position> {
        PositionStore::find_by_user_id(&*self.store, self.user_id(address))
            .await
            .expect("memory store read")
    }
}
