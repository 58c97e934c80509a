//! lendsync service
//!
//! Mirrors lending, borrowing and collateral operations into a local store.
//! Wires the ledger gateways, the store and the engine from the environment,
//! then runs the confirmation reconciler until interrupted.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lendsync_chain::{
    AlloyBorrowing, AlloyCollateral, AlloyLendingPool, ChainGateways, GasPolicy, ProviderManager,
    SignerRegistry,
};
use lendsync_core::{
    ConfirmationReconciler, Engine, EngineConfig, EngineContext, MemoryStore, StoreBackend, Stores,
};
use lendsync_store::PgStore;

/// Environment variable names.
mod env {
    pub const RPC_URL: &str = "RPC_URL";
    pub const CHAIN_ID: &str = "CHAIN_ID";
    pub const LENDING_POOL_ADDRESS: &str = "LENDING_POOL_ADDRESS";
    pub const BORROWING_ADDRESS: &str = "BORROWING_ADDRESS";
    pub const COLLATERAL_ADDRESS: &str = "COLLATERAL_ADDRESS";
    pub const DATABASE_URL: &str = "DATABASE_URL";
    pub const SIGNER_KEYS: &str = "SIGNER_KEYS";
    pub const GAS_LIMIT: &str = "GAS_LIMIT";
    pub const GAS_PRICE_WEI: &str = "GAS_PRICE_WEI";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // LENDSYNC_PROFILE selects a built-in profile, LENDSYNC_CONFIG a TOML file
    let engine_config = EngineConfig::from_env()?;
    engine_config.log_config();

    let config = load_config()?;
    info!("Starting lendsync");

    let provider = Arc::new(ProviderManager::new(&config.rpc_url).await?);
    if let Some(expected) = config.chain_id {
        if expected != provider.chain_id() {
            bail!(
                "{} is {expected} but the node reports chain {}",
                env::CHAIN_ID,
                provider.chain_id()
            );
        }
    }

    match provider.health_check().await {
        Ok(true) => {}
        Ok(false) => warn!("Node reports block 0, contracts may not be deployed yet"),
        Err(e) => bail!("Provider health check failed: {e:#}"),
    }

    let gas = Arc::new(GasPolicy::new(config.gas_limit, config.gas_price_wei));
    let signers = Arc::new(
        SignerRegistry::from_keys(&config.signer_keys, provider.rpc_url(), provider.chain_id(), gas)
            .await?,
    );
    if signers.is_empty() {
        warn!("No custodial signers configured, every submission will be refused");
    }

    let gateways = ChainGateways {
        lending_pool: Arc::new(AlloyLendingPool::new(
            config.lending_pool,
            provider.rpc_url(),
            signers.clone(),
        )),
        borrowing: Arc::new(AlloyBorrowing::new(
            config.borrowing,
            provider.rpc_url(),
            signers.clone(),
        )),
        collateral: Arc::new(AlloyCollateral::new(
            config.collateral,
            provider.rpc_url(),
            signers.clone(),
        )),
        receipts: provider.clone(),
    };
    info!(
        lending_pool = %config.lending_pool,
        borrowing = %config.borrowing,
        collateral = %config.collateral,
        "Ledger gateways configured"
    );

    let stores = open_stores(&engine_config, config.database_url.as_deref(), &signers.addresses()).await?;
    let context = Arc::new(EngineContext::new(gateways, stores, &engine_config)?);
    let engine = Engine::new(context.clone());
    log_ledger_snapshot(&engine).await;

    let reconciler = ConfirmationReconciler::new(context, engine_config.reconciler.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    handle.await.context("Reconciler task failed")?;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lendsync_core=debug,lendsync_chain=debug"));
    let json = std::env::var(env::LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Configuration loaded from environment.
struct Config {
    rpc_url: String,
    chain_id: Option<u64>,
    lending_pool: Address,
    borrowing: Address,
    collateral: Address,
    database_url: Option<String>,
    signer_keys: Vec<String>,
    gas_limit: u64,
    gas_price_wei: Option<u128>,
}

fn load_config() -> Result<Config> {
    let get_env = |name: &str| -> Result<String> {
        std::env::var(name).map_err(|_| anyhow::anyhow!("Missing env var: {}", name))
    };

    let get_address = |name: &str| -> Result<Address> {
        get_env(name)?
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid address for {}: {}", name, e))
    };

    let chain_id = std::env::var(env::CHAIN_ID)
        .ok()
        .map(|v| v.parse::<u64>())
        .transpose()
        .with_context(|| format!("Invalid {}", env::CHAIN_ID))?;

    let gas_limit = match std::env::var(env::GAS_LIMIT) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("Invalid {}", env::GAS_LIMIT))?,
        Err(_) => lendsync_chain::gas::DEFAULT_GAS_LIMIT,
    };

    let gas_price_wei = std::env::var(env::GAS_PRICE_WEI)
        .ok()
        .map(|v| v.parse::<u128>())
        .transpose()
        .with_context(|| format!("Invalid {}", env::GAS_PRICE_WEI))?;

    let signer_keys = std::env::var(env::SIGNER_KEYS)
        .unwrap_or_default()
        .split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();

    Ok(Config {
        rpc_url: get_env(env::RPC_URL)?,
        chain_id,
        lending_pool: get_address(env::LENDING_POOL_ADDRESS)?,
        borrowing: get_address(env::BORROWING_ADDRESS)?,
        collateral: get_address(env::COLLATERAL_ADDRESS)?,
        database_url: std::env::var(env::DATABASE_URL).ok(),
        signer_keys,
        gas_limit,
        gas_price_wei,
    })
}

/// Open the configured backend and make sure every custodial signer has an
/// account.
async fn open_stores(
    engine_config: &EngineConfig,
    database_url: Option<&str>,
    custodial: &[Address],
) -> Result<Stores> {
    match engine_config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            for address in custodial {
                store.insert_user(*address, true);
            }
            warn!("Using the in-memory store; the mirror is lost on restart");
            Ok(Stores::shared(store))
        }
        StoreBackend::Postgres => {
            let url = database_url
                .with_context(|| format!("{} is required for the postgres store", env::DATABASE_URL))?;
            let store = PgStore::connect(
                url,
                engine_config.store.max_connections,
                Duration::from_secs(engine_config.store.acquire_timeout_secs),
            )
            .await?;
            store.run_migrations().await?;
            store.health_check().await?;
            for address in custodial {
                store.register_user(*address).await?;
            }
            info!(accounts = custodial.len(), "Postgres store ready");
            Ok(Stores::shared(Arc::new(store)))
        }
    }
}

async fn log_ledger_snapshot(engine: &Engine) {
    let (deposited, borrowed, rate) = tokio::join!(
        engine.lending.get_total_deposited(),
        engine.borrowing.get_total_borrowed(),
        engine.borrowing.get_current_interest_rate(),
    );
    match (deposited, borrowed, rate) {
        (Ok(deposited), Ok(borrowed), Ok(rate)) => info!(
            total_deposited = %deposited,
            total_borrowed = %borrowed,
            borrow_rate = %rate,
            "Ledger snapshot"
        ),
        (deposited, borrowed, rate) => warn!(
            deposited_ok = deposited.is_ok(),
            borrowed_ok = borrowed.is_ok(),
            rate_ok = rate.is_ok(),
            "Ledger snapshot incomplete"
        ),
    }
}
