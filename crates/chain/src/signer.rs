//! Custodial transaction signing and submission.
//!
//! - [`NonceManager`]: cached nonce, avoids an RPC call per submission
//! - [`TxSubmitter`]: one signer wallet bound to one RPC endpoint
//! - [`SignerRegistry`]: per-user submitters, keyed by signer address
//!
//! Submission returns once the node accepts the transaction. Receipts are
//! polled later through [`crate::ReceiptSource`].

use crate::gas::GasPolicy;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cached nonce manager for one signer.
pub struct NonceManager {
    /// Next nonce to hand out
    current: AtomicU64,
    /// Last value read from chain
    last_synced: AtomicU64,
}

impl NonceManager {
    pub fn new(initial_nonce: u64) -> Self {
        Self {
            current: AtomicU64::new(initial_nonce),
            last_synced: AtomicU64::new(initial_nonce),
        }
    }

    /// Get next nonce and increment counter.
    #[inline]
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst)
    }

    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn last_synced(&self) -> u64 {
        self.last_synced.load(Ordering::SeqCst)
    }

    /// Move forward to the chain value; never moves backwards.
    pub fn sync(&self, chain_nonce: u64) {
        self.current.fetch_max(chain_nonce, Ordering::SeqCst);
        self.last_synced.store(chain_nonce, Ordering::SeqCst);
    }

    /// Force the chain value (after a rejected submission).
    pub fn reset(&self, chain_nonce: u64) {
        self.current.store(chain_nonce, Ordering::SeqCst);
        self.last_synced.store(chain_nonce, Ordering::SeqCst);
    }
}

/// Signs and submits transactions for one custodial account.
pub struct TxSubmitter {
    rpc_url: String,
    wallet: EthereumWallet,
    /// Signer address
    pub address: Address,
    chain_id: u64,
    nonce_manager: NonceManager,
    gas: Arc<GasPolicy>,
}

impl TxSubmitter {
    /// Build from a hex private key (with or without `0x`), fetching the
    /// starting nonce from chain.
    pub async fn new(
        private_key: &str,
        rpc_url: &str,
        chain_id: u64,
        gas: Arc<GasPolicy>,
    ) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .trim_start_matches("0x")
            .parse()
            .context("invalid signer private key")?;
        let address = signer.address();

        let provider = ProviderBuilder::new().on_http(rpc_url.parse()?);
        let initial_nonce = provider.get_transaction_count(address).await?;

        info!(
            address = %address,
            chain_id = chain_id,
            initial_nonce = initial_nonce,
            "Custodial signer initialized"
        );

        Ok(Self {
            rpc_url: rpc_url.to_string(),
            wallet: EthereumWallet::from(signer),
            address,
            chain_id,
            nonce_manager: NonceManager::new(initial_nonce),
            gas,
        })
    }

    /// Sign and broadcast a call to `to`. Does not wait for inclusion.
    pub async fn submit(&self, to: Address, calldata: Bytes) -> Result<B256> {
        let gas_price = self.gas.gas_price(&self.rpc_url).await?;
        let nonce = self.nonce_manager.next();

        let mut tx = TransactionRequest::default()
            .with_from(self.address)
            .with_to(to)
            .with_input(calldata)
            .with_value(U256::ZERO)
            .with_nonce(nonce)
            .with_chain_id(self.chain_id);
        self.gas.apply(&mut tx, gas_price);

        debug!(from = %self.address, to = %to, nonce = nonce, gas_price = gas_price, "Sending transaction");

        let provider = ProviderBuilder::new()
            .wallet(self.wallet.clone())
            .on_http(self.rpc_url.parse()?);

        match provider.send_transaction(tx).await {
            Ok(pending) => {
                let tx_hash = *pending.tx_hash();
                info!(tx_hash = %tx_hash, from = %self.address, to = %to, nonce = nonce, "Transaction submitted");
                Ok(tx_hash)
            }
            Err(e) => {
                // Rejected before broadcast; the reserved nonce was not used.
                warn!(from = %self.address, error = %e, "Submission rejected, syncing nonce");
                self.sync_nonce().await;
                Err(e).context("transaction submission rejected")
            }
        }
    }

    pub async fn sync_nonce(&self) {
        let provider = match self.rpc_url.parse() {
            Ok(url) => ProviderBuilder::new().on_http(url),
            Err(e) => {
                warn!(error = %e, "Invalid RPC URL, nonce not synced");
                return;
            }
        };
        match provider.get_transaction_count(self.address).await {
            Ok(chain_nonce) => {
                self.nonce_manager.reset(chain_nonce);
                debug!(nonce = chain_nonce, "Nonce synced from chain");
            }
            Err(e) => warn!(error = %e, "Failed to sync nonce from chain"),
        }
    }
}

impl std::fmt::Debug for TxSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxSubmitter")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .finish_non_exhaustive()
    }
}

/// Custodial submitters keyed by the user address they sign for.
#[derive(Debug, Default)]
pub struct SignerRegistry {
    signers: DashMap<Address, Arc<TxSubmitter>>,
}

impl SignerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a submitter for each key. Duplicate keys collapse to one entry.
    pub async fn from_keys(
        keys: &[String],
        rpc_url: &str,
        chain_id: u64,
        gas: Arc<GasPolicy>,
    ) -> Result<Self> {
        let registry = Self::new();
        for key in keys.iter().filter(|k| !k.trim().is_empty()) {
            let submitter = TxSubmitter::new(key, rpc_url, chain_id, gas.clone()).await?;
            registry.register(submitter);
        }
        info!(signers = registry.len(), "Signer registry loaded");
        Ok(registry)
    }

    pub fn register(&self, submitter: TxSubmitter) {
        self.signers.insert(submitter.address, Arc::new(submitter));
    }

    pub fn get(&self, user: Address) -> Option<Arc<TxSubmitter>> {
        self.signers.get(&user).map(|entry| entry.value().clone())
    }

    /// Submit on behalf of `user`; fails when no key is held for them.
    pub async fn submit_as(&self, user: Address, to: Address, calldata: Bytes) -> Result<B256> {
        let submitter = self
            .get(user)
            .with_context(|| format!("no custodial signer registered for {user}"))?;
        submitter.submit(to, calldata).await
    }

    /// Addresses with a registered key.
    pub fn addresses(&self) -> Vec<Address> {
        self.signers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }
}
