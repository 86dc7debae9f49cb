//! error types for the lending ledger

use crate::health::HealthFactor;
use crate::types::{Amount, AssetId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LendingError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LendingError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown market {0}")]
    UnknownMarket(AssetId),

    #[error("market {0} is inactive")]
    MarketInactive(AssetId),

    #[error("insufficient liquidity: requested {requested}, available {available}")]
    InsufficientLiquidity { requested: Amount, available: Amount },

    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Amount, available: Amount },

    #[error("action would leave position insolvent (health factor {health_factor})")]
    Insolvency { health_factor: HealthFactor },

    #[error("insufficient collateral: seizing {required}, borrower holds {available}")]
    InsufficientCollateral { required: Amount, available: Amount },

    #[error("position is not liquidatable (health factor {0})")]
    NotLiquidatable(HealthFactor),

    #[error("arithmetic error: {0}")]
    Arithmetic(&'static str),

    #[error("oracle error for {asset}: {reason}")]
    Oracle { asset: AssetId, reason: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("re-entrant call rejected")]
    Reentrancy,

    #[error("clock regression: now {now} is before last update {last_update}")]
    ClockRegression { now: u64, last_update: u64 },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("config error: {0}")]
    Config(String),
}

impl LendingError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        LendingError::Validation(msg.into())
    }
}
