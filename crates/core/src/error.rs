//! Error taxonomy of the reconciliation engine.
//!
//! Every failure an operation can surface is one [`OperationError`] variant.
//! Callers map them to transport responses through [`OperationError::code`]
//! and [`OperationError::category`].

use crate::amount::{Amount, AmountError};
use crate::store::StoreError;
use alloy::primitives::{Address, B256};
use std::fmt;
use thiserror::Error;

/// Local bookkeeping step that failed after the ledger accepted a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStage {
    TransactionRecord,
    PositionMirror,
}

impl fmt::Display for MirrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransactionRecord => f.write_str("transaction record"),
            Self::PositionMirror => f.write_str("position mirror"),
        }
    }
}

/// Coarse grouping used for response mapping and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input or caller; nothing happened
    Client,
    /// Rejected by a risk rule; nothing happened
    Risk,
    /// Ledger or node failure; nothing was recorded
    External,
    /// Local failure before any external effect
    Internal,
    /// Ledger changed but local state lags
    Partial,
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Authorization(String),

    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Amount, available: Amount },

    #[error("risk violation: {0}")]
    RiskViolation(String),

    #[error("position of {borrower} is not eligible for liquidation")]
    NotEligibleForLiquidation { borrower: Address },

    #[error("ledger read failed: {0}")]
    ChainRead(String),

    #[error("ledger submission failed: {0}")]
    ExternalSubmission(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("transaction {hash} applied on the ledger but its {stage} failed: {reason}")]
    AppliedButUnrecorded {
        hash: B256,
        stage: MirrorStage,
        reason: String,
    },
}

impl OperationError {
    pub fn chain_read(err: anyhow::Error) -> Self {
        Self::ChainRead(format!("{err:#}"))
    }

    pub fn submission(err: anyhow::Error) -> Self {
        Self::ExternalSubmission(format!("{err:#}"))
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Authorization(_) => "UNAUTHORIZED",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::RiskViolation(_) => "RISK_VIOLATION",
            Self::NotEligibleForLiquidation { .. } => "NOT_ELIGIBLE_FOR_LIQUIDATION",
            Self::ChainRead(_) => "CHAIN_READ_ERROR",
            Self::ExternalSubmission(_) => "EXTERNAL_SUBMISSION_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::AppliedButUnrecorded { .. } => "APPLIED_BUT_UNRECORDED",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::Authorization(_) | Self::InsufficientFunds { .. } => {
                ErrorCategory::Client
            }
            Self::RiskViolation(_) | Self::NotEligibleForLiquidation { .. } => ErrorCategory::Risk,
            Self::ChainRead(_) | Self::ExternalSubmission(_) => ErrorCategory::External,
            Self::Persistence(_) => ErrorCategory::Internal,
            Self::AppliedButUnrecorded { .. } => ErrorCategory::Partial,
        }
    }

    /// Whether the caller may resubmit the same request unchanged.
    ///
    /// `AppliedButUnrecorded` is never retryable: the ledger already moved.
    /// Neither is `ExternalSubmission`, since a rejected or timed-out send may
    /// still be mined; check the ledger before resubmitting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ChainRead(_) | Self::Persistence(_))
    }

    /// Hash of the already-applied transaction, if any.
    pub fn applied_hash(&self) -> Option<B256> {
        match self {
            Self::AppliedButUnrecorded { hash, .. } => Some(*hash),
            _ => None,
        }
    }
}

impl From<AmountError> for OperationError {
    fn from(err: AmountError) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_categories() {
        let err = OperationError::from(AmountError::NotPositive);
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.category(), ErrorCategory::Client);
        assert!(!err.is_retryable());

        let err = OperationError::RiskViolation("too much".into());
        assert_eq!(err.category(), ErrorCategory::Risk);

        let err = OperationError::chain_read(anyhow::anyhow!("connection reset"));
        assert_eq!(err.category(), ErrorCategory::External);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_submission_failure_is_not_retryable() {
        // A send that timed out may still land on the ledger.
        let err = OperationError::submission(anyhow::anyhow!("request timed out"));
        assert_eq!(err.code(), "EXTERNAL_SUBMISSION_ERROR");
        assert_eq!(err.category(), ErrorCategory::External);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_applied_but_unrecorded_is_partial() {
        let hash = B256::repeat_byte(0x11);
        let err = OperationError::AppliedButUnrecorded {
            hash,
            stage: MirrorStage::PositionMirror,
            reason: "db down".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Partial);
        assert!(!err.is_retryable());
        assert_eq!(err.applied_hash(), Some(hash));
        assert!(err.to_string().contains("position mirror"));
    }

    #[test]
    fn test_store_error_converts_to_persistence() {
        let err: OperationError = StoreError::Backend("connection reset".into()).into();
        assert_eq!(err.code(), "PERSISTENCE_ERROR");
        assert_eq!(err.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_chain_read_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("Collateral.collateralBalance");
        let err = OperationError::chain_read(err);
        assert_eq!(
            err.to_string(),
            "ledger read failed: Collateral.collateralBalance: connection refused"
        );
    }
}
