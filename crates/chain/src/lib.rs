//! lendsync chain interaction layer.
//!
//! This crate provides:
//! - Gateway traits for the LendingPool, Borrowing and Collateral contracts
//! - Alloy adapters implementing them with `sol!` bindings
//! - Provider management and receipt lookup
//! - Custodial signing with cached nonces and legacy gas pricing

pub mod adapters;
pub mod gas;
mod gateway;
mod provider;
mod signer;

pub use adapters::{AlloyBorrowing, AlloyCollateral, AlloyLendingPool};
pub use gas::GasPolicy;
pub use gateway::{
    BorrowingGateway, ChainGateways, CollateralGateway, LendingPoolGateway, ReceiptSource,
    SubmittedTx, TxReceipt,
};
pub use provider::ProviderManager;
pub use signer::{NonceManager, SignerRegistry, TxSubmitter};

pub use alloy::primitives::{Address, B256, U256};
