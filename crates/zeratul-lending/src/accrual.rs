//! Interest accrual
//!
//! Interest is simple within one accrual step and compounds across steps:
//! each step grows the indices, and the next step charges interest on the
//! grown totals.

use crate::error::{LendingError, Result};
use crate::market::{apply_bps, Market};
use crate::math::{checked_add, checked_sub, mul_div, mul_div_wide, Rounding, Wad, BPS, WAD};
use crate::rate::RateModel;
use crate::types::{Amount, AssetId, Bps};

/// Result of one accrual step that produced interest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accrual {
    pub asset: AssetId,
    /// Seconds covered by this step
    pub elapsed: u64,
    pub borrow_rate_bps: Bps,
    /// Interest charged to borrowers
    pub interest: Amount,
    /// Part of `interest` kept by the protocol
    pub reserve: Amount,
    pub borrow_index: Wad,
    pub deposit_index: Wad,
}

/// Brings market indices up to date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualEngine {
    model: RateModel,
    seconds_per_year: u64,
}

impl AccrualEngine {
    pub fn new(model: RateModel, seconds_per_year: u64) -> Self {
        Self {
            model,
            seconds_per_year,
        }
    }

    pub fn model(&self) -> &RateModel {
        &self.model
    }

    /// Advance `market` to `now`
    ///
    /// Returns `None` when no interest was produced (same timestamp, or no
    /// outstanding borrows). The timestamp moves forward either way, so an
    /// idle period is never charged retroactively.
    pub fn accrue(&self, market: &mut Market, now: u64) -> Result<Option<Accrual>> {
        if now < market.last_update_time {
            return Err(LendingError::ClockRegression {
                now,
                last_update: market.last_update_time,
            });
        }
        let elapsed = now - market.last_update_time;
        if elapsed == 0 {
            return Ok(None);
        }
        market.last_update_time = now;

        if market.total_borrows == 0 {
            self.refresh_rates(market)?;
            return Ok(None);
        }

        let utilization = market.utilization_bps()?;
        let borrow_rate_bps = self.model.borrow_rate_bps(utilization)?;

        let interest = mul_div_wide(
            &[market.total_borrows, borrow_rate_bps as u128, elapsed as u128],
            &[BPS, self.seconds_per_year as u128],
            Rounding::Down,
        )?;
        if interest == 0 {
            self.refresh_rates(market)?;
            return Ok(None);
        }

        let borrow_delta = mul_div(interest, WAD, market.total_borrows, Rounding::Down)?;
        let reserve = apply_bps(interest, market.params.reserve_factor_bps, Rounding::Down)?;
        let deposit_interest = checked_sub(interest, reserve)?;
        let deposit_delta = if market.total_deposits == 0 {
            0
        } else {
            mul_div(deposit_interest, WAD, market.total_deposits, Rounding::Down)?
        };

        market.borrow_index = market.borrow_index.checked_add(Wad(borrow_delta))?;
        market.deposit_index = market.deposit_index.checked_add(Wad(deposit_delta))?;

        // Borrowers owe the full interest; depositors and the reserve split it.
        market.total_borrows = checked_add(market.total_borrows, interest)?;
        market.total_deposits = checked_add(market.total_deposits, interest)?;
        market.reserves = checked_add(market.reserves, reserve)?;

        self.refresh_rates(market)?;

        tracing::debug!(
            asset = %market.asset,
            elapsed,
            borrow_rate_bps,
            interest,
            reserve,
            "interest accrued"
        );

        Ok(Some(Accrual {
            asset: market.asset,
            elapsed,
            borrow_rate_bps,
            interest,
            reserve,
            borrow_index: market.borrow_index,
            deposit_index: market.deposit_index,
        }))
    }

    /// Recompute the displayed rates from current utilization
    pub fn refresh_rates(&self, market: &mut Market) -> Result<()> {
        let utilization = market.utilization_bps()?;
        market.borrow_rate_bps = self.model.borrow_rate_bps(utilization)?;
        market.deposit_rate_bps = self
            .model
            .deposit_rate_bps(utilization, market.params.reserve_factor_bps)?;
        Ok(())
    }
}
