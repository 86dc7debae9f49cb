//! Utilization-driven interest rate model
//!
//! Two-slope ("kinked") curve: below the optimal utilization the borrow rate
//! climbs gently from the base rate, above it the rate climbs steeply to push
//! utilization back down.
//!
//! ```text
//!  rate
//!   │                                  ╱
//!   │                                ╱   slope2
//!   │                              ╱
//!   │                 ___________╱ ← base + slope1 at optimal
//!   │      ________--‾
//!   │ ___--‾   slope1
//!   │ base
//!   └──────────────────────────┬─────── utilization
//!                            optimal
//! ```

use crate::error::{LendingError, Result};
use crate::math::{mul_div, mul_div_wide, Rounding, BPS};
use crate::types::{Amount, Bps};
use serde::{Deserialize, Serialize};

/// Kinked interest rate curve, all values in basis points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateModel {
    /// Borrow rate at zero utilization
    pub base_rate_bps: Bps,
    /// Rate added between zero and optimal utilization
    pub slope1_bps: Bps,
    /// Rate added between optimal and full utilization
    pub slope2_bps: Bps,
    /// Utilization at the kink
    pub optimal_utilization_bps: Bps,
}

impl Default for RateModel {
    fn default() -> Self {
        Self {
            base_rate_bps: 200,
            slope1_bps: 400,
            slope2_bps: 7_500,
            optimal_utilization_bps: 8_000,
        }
    }
}

impl RateModel {
    /// Flat curve, useful when a market's rate must not move with utilization
    pub const fn flat(rate_bps: Bps) -> Self {
        Self {
            base_rate_bps: rate_bps,
            slope1_bps: 0,
            slope2_bps: 0,
            optimal_utilization_bps: 8_000,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.optimal_utilization_bps == 0 || self.optimal_utilization_bps as u128 >= BPS {
            return Err(LendingError::Config(format!(
                "optimal utilization must be in (0, 10000) bps, got {}",
                self.optimal_utilization_bps
            )));
        }
        // the rate at full utilization must fit a Bps
        let peak = self.base_rate_bps as u64 + self.slope1_bps as u64 + self.slope2_bps as u64;
        if peak > Bps::MAX as u64 {
            return Err(LendingError::Config(format!(
                "rate curve peaks at {} bps, above {}",
                peak,
                Bps::MAX
            )));
        }
        Ok(())
    }

    /// `borrows * 10000 / deposits`, zero for an empty pool
    pub fn utilization_bps(total_borrows: Amount, total_deposits: Amount) -> Result<Bps> {
        if total_deposits == 0 {
            return Ok(0);
        }
        let util = mul_div(total_borrows, BPS, total_deposits, Rounding::Down)?;
        Bps::try_from(util).map_err(|_| LendingError::Arithmetic("utilization overflow"))
    }

    /// Annualized borrow rate for a utilization
    ///
    /// The optimal point itself belongs to the first segment, so it maps to
    /// exactly `base + slope1`.
    pub fn borrow_rate_bps(&self, utilization_bps: Bps) -> Result<Bps> {
        let util = utilization_bps as u128;
        let optimal = self.optimal_utilization_bps as u128;
        let base = self.base_rate_bps as u128;

        let rate = if util <= optimal {
            base + mul_div(util, self.slope1_bps as u128, optimal, Rounding::Down)?
        } else {
            let excess = util - optimal;
            base + self.slope1_bps as u128
                + mul_div(excess, self.slope2_bps as u128, BPS.saturating_sub(optimal), Rounding::Down)?
        };

        Bps::try_from(rate).map_err(|_| LendingError::Arithmetic("borrow rate overflow"))
    }

    /// Annualized rate earned by depositors
    ///
    /// `borrow_rate * utilization * (1 - reserve_factor)`
    pub fn deposit_rate_bps(&self, utilization_bps: Bps, reserve_factor_bps: Bps) -> Result<Bps> {
        let borrow_rate = self.borrow_rate_bps(utilization_bps)? as u128;
        let kept = BPS.saturating_sub(reserve_factor_bps as u128);
        let rate = mul_div_wide(
            &[borrow_rate, utilization_bps as u128, kept],
            &[BPS, BPS],
            Rounding::Down,
        )?;
        Bps::try_from(rate).map_err(|_| LendingError::Arithmetic("deposit rate overflow"))
    }
}
