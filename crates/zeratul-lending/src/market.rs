//! Per-asset pool state and the registry holding it

use crate::config::RiskLimits;
use crate::error::{LendingError, Result};
use crate::math::{checked_sub, mul_div, Rounding, Wad, BPS, WAD};
use crate::rate::RateModel;
use crate::types::{Amount, AssetId, Bps, Shares};
use crate::{MAX_COLLATERAL_FACTOR_BPS, MAX_LIQUIDATION_BONUS_BPS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Risk parameters of a market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskParams {
    /// Share of deposit value creditable as borrowing power
    pub collateral_factor_bps: Bps,
    /// Extra collateral paid to liquidators
    pub liquidation_bonus_bps: Bps,
    /// Share of interest kept by the protocol
    pub reserve_factor_bps: Bps,
}

impl RiskParams {
    /// Range-check against `limits`, which can only tighten the hard caps
    pub fn validate(&self, limits: &RiskLimits) -> Result<()> {
        let max_collateral = limits.max_collateral_factor_bps.min(MAX_COLLATERAL_FACTOR_BPS);
        if self.collateral_factor_bps > max_collateral {
            return Err(LendingError::validation(format!(
                "collateral factor {} bps exceeds {} bps",
                self.collateral_factor_bps, max_collateral
            )));
        }
        let max_bonus = limits.max_liquidation_bonus_bps.min(MAX_LIQUIDATION_BONUS_BPS);
        if self.liquidation_bonus_bps > max_bonus {
            return Err(LendingError::validation(format!(
                "liquidation bonus {} bps exceeds {} bps",
                self.liquidation_bonus_bps, max_bonus
            )));
        }
        if self.reserve_factor_bps > limits.max_reserve_factor_bps {
            return Err(LendingError::validation(format!(
                "reserve factor {} bps exceeds {} bps",
                self.reserve_factor_bps, limits.max_reserve_factor_bps
            )));
        }
        Ok(())
    }
}

/// Operational switches of a market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketFlags {
    pub active: bool,
    pub can_borrow: bool,
    pub can_collateral: bool,
}

impl Default for MarketFlags {
    fn default() -> Self {
        Self {
            active: true,
            can_borrow: true,
            can_collateral: true,
        }
    }
}

/// Pool state for one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub asset: AssetId,

    /// Underlying owed to depositors plus protocol reserves
    pub total_deposits: Amount,
    /// Underlying owed by borrowers
    pub total_borrows: Amount,

    /// Outstanding deposit shares across all users
    pub total_deposit_shares: Shares,
    /// Outstanding debt shares across all users
    pub total_borrow_shares: Shares,

    /// Underlying value of one deposit share (starts at 1.0)
    pub deposit_index: Wad,
    /// Underlying value of one debt share (starts at 1.0)
    pub borrow_index: Wad,

    /// Annualized rates at the last touch (display only)
    pub deposit_rate_bps: Bps,
    pub borrow_rate_bps: Bps,

    pub params: RiskParams,

    /// Protocol's claim inside `total_deposits`
    pub reserves: Amount,

    /// Timestamp (seconds) of the last accrual
    pub last_update_time: u64,

    pub flags: MarketFlags,
}

impl Market {
    pub fn new(asset: AssetId, params: RiskParams, now: u64) -> Self {
        Self {
            asset,
            total_deposits: 0,
            total_borrows: 0,
            total_deposit_shares: 0,
            total_borrow_shares: 0,
            deposit_index: Wad::ONE,
            borrow_index: Wad::ONE,
            deposit_rate_bps: 0,
            borrow_rate_bps: 0,
            params,
            reserves: 0,
            last_update_time: now,
            flags: MarketFlags::default(),
        }
    }

    pub fn utilization_bps(&self) -> Result<Bps> {
        RateModel::utilization_bps(self.total_borrows, self.total_deposits)
    }

    /// Idle underlying that can be withdrawn or borrowed
    pub fn available_liquidity(&self) -> Amount {
        self.total_deposits.saturating_sub(self.total_borrows)
    }

    /// Deposit shares worth `amount` at the current index
    pub fn deposit_shares_for(&self, amount: Amount, rounding: Rounding) -> Result<Shares> {
        mul_div(amount, WAD, self.deposit_index.raw(), rounding)
    }

    /// Debt shares worth `amount` at the current index
    pub fn borrow_shares_for(&self, amount: Amount, rounding: Rounding) -> Result<Shares> {
        mul_div(amount, WAD, self.borrow_index.raw(), rounding)
    }

    /// Redeemable underlying for deposit shares (floored)
    pub fn deposit_balance(&self, shares: Shares) -> Result<Amount> {
        mul_div(shares, self.deposit_index.raw(), WAD, Rounding::Down)
    }

    /// Outstanding underlying for debt shares (floored)
    pub fn debt_balance(&self, shares: Shares) -> Result<Amount> {
        mul_div(shares, self.borrow_index.raw(), WAD, Rounding::Down)
    }

    pub fn ensure_active(&self) -> Result<()> {
        if !self.flags.active {
            return Err(LendingError::MarketInactive(self.asset));
        }
        Ok(())
    }

    pub fn ensure_liquidity(&self, requested: Amount) -> Result<()> {
        let available = self.available_liquidity();
        if requested > available {
            return Err(LendingError::InsufficientLiquidity {
                requested,
                available,
            });
        }
        Ok(())
    }

    /// Burn `shares` of debt worth `amount`
    ///
    /// Debt shares are minted rounded up, so individual balances can add up
    /// to slightly more than `total_borrows`. The total saturates and is
    /// cleared once the last debt share is gone.
    pub(crate) fn burn_debt(&mut self, amount: Amount, shares: Shares) -> Result<()> {
        self.total_borrow_shares = checked_sub(self.total_borrow_shares, shares)?;
        self.total_borrows = if self.total_borrow_shares == 0 {
            0
        } else {
            self.total_borrows.saturating_sub(amount)
        };
        Ok(())
    }

    /// Check the pool-level invariants
    pub fn check_invariants(&self) -> Result<()> {
        if self.total_borrows > self.total_deposits {
            return Err(LendingError::InvariantViolation(format!(
                "market {}: total borrows {} exceed total deposits {}",
                self.asset, self.total_borrows, self.total_deposits
            )));
        }
        if self.deposit_index < Wad::ONE || self.borrow_index < Wad::ONE {
            return Err(LendingError::InvariantViolation(format!(
                "market {}: index below 1.0",
                self.asset
            )));
        }
        if self.reserves > self.total_deposits {
            return Err(LendingError::InvariantViolation(format!(
                "market {}: reserves {} exceed total deposits {}",
                self.asset, self.reserves, self.total_deposits
            )));
        }
        Ok(())
    }

    /// Withdraw part of the protocol reserves out of the pool
    pub fn take_reserves(&mut self, amount: Amount) -> Result<()> {
        if amount > self.reserves {
            return Err(LendingError::InsufficientBalance {
                requested: amount,
                available: self.reserves,
            });
        }
        self.ensure_liquidity(amount)?;
        self.reserves = checked_sub(self.reserves, amount)?;
        self.total_deposits = checked_sub(self.total_deposits, amount)?;
        Ok(())
    }

    /// Public snapshot of the market
    pub fn data(&self) -> Result<MarketData> {
        Ok(MarketData {
            asset: self.asset,
            total_deposits: self.total_deposits,
            total_borrows: self.total_borrows,
            deposit_rate_bps: self.deposit_rate_bps,
            borrow_rate_bps: self.borrow_rate_bps,
            utilization_bps: self.utilization_bps()?,
            liquidity: self.available_liquidity(),
            deposit_index: self.deposit_index,
            borrow_index: self.borrow_index,
            reserves: self.reserves,
            params: self.params,
            flags: self.flags,
            last_update_time: self.last_update_time,
        })
    }
}

/// Read-only market view returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketData {
    pub asset: AssetId,
    pub total_deposits: Amount,
    pub total_borrows: Amount,
    pub deposit_rate_bps: Bps,
    pub borrow_rate_bps: Bps,
    pub utilization_bps: Bps,
    pub liquidity: Amount,
    pub deposit_index: Wad,
    pub borrow_index: Wad,
    pub reserves: Amount,
    pub params: RiskParams,
    pub flags: MarketFlags,
    pub last_update_time: u64,
}

/// All markets, keyed by asset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketRegistry {
    markets: BTreeMap<AssetId, Market>,
}

impl MarketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new market; each asset can be listed once
    pub fn create(
        &mut self,
        asset: AssetId,
        params: RiskParams,
        limits: &RiskLimits,
        now: u64,
    ) -> Result<&Market> {
        params.validate(limits)?;
        if self.markets.contains_key(&asset) {
            return Err(LendingError::validation(format!(
                "market {} already exists",
                asset
            )));
        }
        Ok(self
            .markets
            .entry(asset)
            .or_insert_with(|| Market::new(asset, params, now)))
    }

    pub fn get(&self, asset: &AssetId) -> Result<&Market> {
        self.markets
            .get(asset)
            .ok_or(LendingError::UnknownMarket(*asset))
    }

    pub fn get_mut(&mut self, asset: &AssetId) -> Result<&mut Market> {
        self.markets
            .get_mut(asset)
            .ok_or(LendingError::UnknownMarket(*asset))
    }

    pub fn contains(&self, asset: &AssetId) -> bool {
        self.markets.contains_key(asset)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Market> {
        self.markets.values()
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// Restore (or remove) a market record, used by rollback
    pub(crate) fn restore(&mut self, asset: AssetId, market: Option<Market>) {
        match market {
            Some(market) => {
                self.markets.insert(asset, market);
            }
            None => {
                self.markets.remove(&asset);
            }
        }
    }

    pub(crate) fn snapshot(&self, asset: &AssetId) -> Option<Market> {
        self.markets.get(asset).cloned()
    }
}

/// `value * bps / 10000` helper used by the risk math
pub(crate) fn apply_bps(value: Amount, bps: Bps, rounding: Rounding) -> Result<Amount> {
    mul_div(value, bps as u128, BPS, rounding)
}
