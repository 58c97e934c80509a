//! Alloy-backed gateway implementations.
//!
//! Reads go through a fresh HTTP provider per call, as the provider manager
//! does. Writes are ABI-encoded here and signed by the caller's custodial
//! signer from the [`SignerRegistry`].

pub mod bindings;
mod borrowing;
mod collateral;
mod lending_pool;

pub use borrowing::AlloyBorrowing;
pub use collateral::AlloyCollateral;
pub use lending_pool::AlloyLendingPool;

use crate::gateway::SubmittedTx;
use crate::signer::SignerRegistry;
use alloy::primitives::{Address, Bytes};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::sol_types::SolCall;
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

/// Address, endpoint and signers shared by every adapter.
#[derive(Debug, Clone)]
pub(crate) struct ContractClient {
    address: Address,
    rpc_url: String,
    signers: Arc<SignerRegistry>,
}

impl ContractClient {
    pub(crate) fn new(address: Address, rpc_url: &str, signers: Arc<SignerRegistry>) -> Self {
        Self {
            address,
            rpc_url: rpc_url.to_string(),
            signers,
        }
    }

    pub(crate) fn address(&self) -> Address {
        self.address
    }

    pub(crate) fn provider(&self) -> Result<impl Provider> {
        Ok(ProviderBuilder::new().on_http(self.rpc_url.parse()?))
    }

    /// Encode `call` and submit it to this contract, signed as `signer`.
    pub(crate) async fn submit<C: SolCall>(&self, signer: Address, call: C) -> Result<SubmittedTx> {
        let calldata = Bytes::from(call.abi_encode());
        debug!(contract = %self.address, signer = %signer, method = C::SIGNATURE, "Submitting contract call");
        let hash = self.signers.submit_as(signer, self.address, calldata).await?;
        Ok(SubmittedTx::new(hash))
    }
}
