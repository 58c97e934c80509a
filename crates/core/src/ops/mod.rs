//! The four operation groups and the context they share.
//!
//! Every mutating operation follows the same sequence under the user's lock:
//! validate, read fresh ledger state, check risk, submit, record the
//! transaction, mirror the position. Nothing local is written before the
//! ledger accepts the submission; anything local that fails after it surfaces
//! as [`OperationError::AppliedButUnrecorded`] and is queued for backfill.
//!
//! [`OperationError::AppliedButUnrecorded`]: crate::error::OperationError::AppliedButUnrecorded

mod borrowing;
mod collateral;
mod lending;
mod liquidation;
pub(crate) mod mirror;

pub use borrowing::BorrowingOperations;
pub use collateral::{CollateralInfo, CollateralOperations};
pub use lending::LendingOperations;
pub use liquidation::LiquidationOperations;

use crate::backfill::BackfillQueue;
use crate::config::{ConfigError, EngineConfig, MirrorConfig};
use crate::locks::UserLocks;
use crate::risk::RiskEngine;
use crate::store::Stores;
use lendsync_chain::ChainGateways;
use std::sync::Arc;

/// Collaborators shared by all operation groups, built once at startup.
#[derive(Debug)]
pub struct EngineContext {
    pub gateways: ChainGateways,
    pub stores: Stores,
    pub risk: RiskEngine,
    pub locks: UserLocks,
    pub backfill: BackfillQueue,
    pub mirror: MirrorConfig,
}

impl EngineContext {
    pub fn new(
        gateways: ChainGateways,
        stores: Stores,
        config: &EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let risk = RiskEngine::new(config.risk.scale)
            .map_err(|e| ConfigError::Invalid(format!("risk.scale: {e}")))?;
        Ok(Self {
            gateways,
            stores,
            risk,
            locks: UserLocks::new(),
            backfill: BackfillQueue::new(),
            mirror: config.mirror.clone(),
        })
    }
}

/// Entry point for the request-handling layer.
#[derive(Debug, Clone)]
pub struct Engine {
    context: Arc<EngineContext>,
    pub lending: LendingOperations,
    pub borrowing: BorrowingOperations,
    pub collateral: CollateralOperations,
    pub liquidation: LiquidationOperations,
}

impl Engine {
    pub fn new(context: Arc<EngineContext>) -> Self {
        let collateral = CollateralOperations::new(context.clone());
        Self {
            lending: LendingOperations::new(context.clone()),
            borrowing: BorrowingOperations::new(context.clone(), collateral.clone()),
            liquidation: LiquidationOperations::new(context.clone(), collateral.clone()),
            collateral,
            context,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }
}
