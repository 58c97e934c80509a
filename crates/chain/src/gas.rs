//! Legacy gas pricing for custodial submissions.
//!
//! The lending contracts run on chains priced with a single `gas_price`.
//! A configured price is used verbatim; otherwise the node's quote is fetched
//! and capped.

use alloy::network::TransactionBuilder;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Default gas limit for pool/borrow/collateral calls.
pub const DEFAULT_GAS_LIMIT: u64 = 300_000;

/// Upper bound applied to node quotes (100 gwei).
pub const DEFAULT_MAX_GAS_PRICE: u128 = 100_000_000_000;

#[derive(Debug)]
pub struct GasPolicy {
    /// Gas limit attached to every submission
    gas_limit: u64,
    /// Fixed gas price in wei; `None` means ask the node
    fixed_price: Option<u128>,
    /// Cap applied to node quotes
    max_price: u128,
    /// Last quote seen (wei)
    last_quote: AtomicU64,
}

impl GasPolicy {
    pub fn new(gas_limit: u64, fixed_price: Option<u128>) -> Self {
        Self {
            gas_limit,
            fixed_price,
            max_price: DEFAULT_MAX_GAS_PRICE,
            last_quote: AtomicU64::new(fixed_price.unwrap_or(0) as u64),
        }
    }

    pub fn with_max_price(mut self, max_price: u128) -> Self {
        self.max_price = max_price;
        self
    }

    pub fn gas_limit(&self) -> u64 {
        self.gas_limit
    }

    /// Last price applied to a transaction, in wei.
    pub fn last_quote(&self) -> u128 {
        self.last_quote.load(Ordering::Relaxed) as u128
    }

    /// Resolve the price for the next submission.
    pub async fn gas_price(&self, rpc_url: &str) -> Result<u128> {
        let price = match self.fixed_price {
            Some(price) => price,
            None => {
                let provider = ProviderBuilder::new().on_http(rpc_url.parse()?);
                let quoted = provider.get_gas_price().await?;
                debug!(quoted = quoted, cap = self.max_price, "Fetched gas price");
                quoted.min(self.max_price)
            }
        };
        self.last_quote.store(price as u64, Ordering::Relaxed);
        Ok(price)
    }

    /// Attach limit and price to a request.
    pub fn apply(&self, tx: &mut TransactionRequest, gas_price: u128) {
        tx.set_gas_limit(self.gas_limit);
        tx.set_gas_price(gas_price);
    }
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_GAS_LIMIT, None)
    }
}
