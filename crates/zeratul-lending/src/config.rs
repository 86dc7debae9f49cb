//! Ledger configuration (YAML)
//!
//! Every field has a default, so an empty document is a valid config:
//!
//! ```yaml
//! rate_model:
//!   base_rate_bps: 200
//!   slope1_bps: 400
//!   slope2_bps: 7500
//!   optimal_utilization_bps: 8000
//! limits:
//!   max_collateral_factor_bps: 9000
//!   max_liquidation_bonus_bps: 2000
//! max_price_age_secs: 3600
//! markets:
//!   - symbol: USDC
//!     collateral_factor_bps: 8500
//!     liquidation_bonus_bps: 500
//!     reserve_factor_bps: 1000
//! ```

use crate::error::{LendingError, Result};
use crate::market::RiskParams;
use crate::math::BPS;
use crate::rate::RateModel;
use crate::types::{AssetId, Bps};
use crate::{
    CLOSE_FACTOR_BPS, MAX_COLLATERAL_FACTOR_BPS, MAX_LIQUIDATION_BONUS_BPS, SECONDS_PER_YEAR,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bounds on market risk parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_collateral_factor_bps: Bps,
    pub max_liquidation_bonus_bps: Bps,
    pub max_reserve_factor_bps: Bps,
    /// Maximum share of a borrower's debt repaid per liquidation
    pub close_factor_bps: Bps,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_collateral_factor_bps: MAX_COLLATERAL_FACTOR_BPS,
            max_liquidation_bonus_bps: MAX_LIQUIDATION_BONUS_BPS,
            max_reserve_factor_bps: BPS as Bps,
            close_factor_bps: CLOSE_FACTOR_BPS,
        }
    }
}

/// Market listed at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketConfig {
    pub symbol: String,
    pub collateral_factor_bps: Bps,
    pub liquidation_bonus_bps: Bps,
    #[serde(default)]
    pub reserve_factor_bps: Bps,
    #[serde(default = "default_true")]
    pub can_borrow: bool,
    #[serde(default = "default_true")]
    pub can_collateral: bool,
}

fn default_true() -> bool {
    true
}

impl MarketConfig {
    pub fn asset(&self) -> AssetId {
        AssetId::from_symbol(&self.symbol)
    }

    pub fn params(&self) -> RiskParams {
        RiskParams {
            collateral_factor_bps: self.collateral_factor_bps,
            liquidation_bonus_bps: self.liquidation_bonus_bps,
            reserve_factor_bps: self.reserve_factor_bps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub rate_model: RateModel,
    pub limits: RiskLimits,
    pub seconds_per_year: u64,
    /// Oldest acceptable oracle quote, in seconds
    pub max_price_age_secs: u64,
    pub markets: Vec<MarketConfig>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rate_model: RateModel::default(),
            limits: RiskLimits::default(),
            seconds_per_year: SECONDS_PER_YEAR,
            max_price_age_secs: 3_600,
            markets: Vec::new(),
        }
    }
}

impl LedgerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| LendingError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| LendingError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_model.validate()?;
        if self.seconds_per_year == 0 {
            return Err(LendingError::Config("seconds_per_year must be non-zero".into()));
        }
        let limits = &self.limits;
        if limits.close_factor_bps == 0 || limits.close_factor_bps as u128 > BPS {
            return Err(LendingError::Config(format!(
                "close factor must be in (0, 10000] bps, got {}",
                limits.close_factor_bps
            )));
        }
        if limits.max_collateral_factor_bps > MAX_COLLATERAL_FACTOR_BPS {
            return Err(LendingError::Config(format!(
                "max collateral factor cannot exceed {} bps, got {}",
                MAX_COLLATERAL_FACTOR_BPS, limits.max_collateral_factor_bps
            )));
        }
        if limits.max_liquidation_bonus_bps > MAX_LIQUIDATION_BONUS_BPS {
            return Err(LendingError::Config(format!(
                "max liquidation bonus cannot exceed {} bps, got {}",
                MAX_LIQUIDATION_BONUS_BPS, limits.max_liquidation_bonus_bps
            )));
        }
        if limits.max_reserve_factor_bps as u128 > BPS {
            return Err(LendingError::Config(
                "max reserve factor cannot exceed 10000 bps".into(),
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for market in &self.markets {
            if !seen.insert(market.asset()) {
                return Err(LendingError::Config(format!(
                    "market {} listed twice",
                    market.symbol
                )));
            }
            market
                .params()
                .validate(limits)
                .map_err(|e| LendingError::Config(format!("market {}: {}", market.symbol, e)))?;
        }
        Ok(())
    }
}
