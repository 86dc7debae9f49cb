//! Partial liquidation of undercollateralized positions
//!
//! ## Flow
//!
//! ```text
//! liquidator ──debt asset──▶ pool           (debt_repaid)
//! pool ──collateral asset──▶ liquidator     (collateral_seized)
//!
//! debt_repaid       = min(debt_to_cover, debt * close_factor)
//! collateral_seized = debt_repaid * debt_price * (1 + bonus) / collateral_price
//! ```
//!
//! A liquidation may only start when the borrower's health factor is below
//! 1.0, and never repays more than the close factor allows in one call.

use crate::error::{LendingError, Result};
use crate::events::LendingEvent;
use crate::health::HealthFactor;
use crate::ledger::{value_of, LedgerState};
use crate::market::apply_bps;
use crate::math::{checked_sub, mul_div_wide, Rounding, Wad, BPS};
use crate::oracle::PriceSet;
use crate::types::{Amount, AssetId, Bps, UserId};
use serde::{Deserialize, Serialize};

/// Amounts a liquidation would move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationQuote {
    pub debt_repaid: Amount,
    pub collateral_seized: Amount,
}

/// Result of an executed liquidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationOutcome {
    pub debt_repaid: Amount,
    pub collateral_seized: Amount,
    pub health_factor_before: HealthFactor,
    pub health_factor_after: HealthFactor,
}

/// Close-factor and bonus math
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidationEngine {
    close_factor_bps: Bps,
}

impl LiquidationEngine {
    pub fn new(close_factor_bps: Bps) -> Self {
        Self { close_factor_bps }
    }

    pub fn close_factor_bps(&self) -> Bps {
        self.close_factor_bps
    }

    /// Largest repayment allowed against `debt` in one call
    pub fn max_repayable(&self, debt: Amount) -> Result<Amount> {
        apply_bps(debt, self.close_factor_bps, Rounding::Down)
    }

    /// Price a liquidation of a borrower owing `debt`
    pub fn quote(
        &self,
        debt: Amount,
        debt_to_cover: Amount,
        debt_price: Wad,
        collateral_price: Wad,
        liquidation_bonus_bps: Bps,
    ) -> Result<LiquidationQuote> {
        let debt_repaid = debt_to_cover.min(self.max_repayable(debt)?);
        if debt_repaid == 0 {
            return Err(LendingError::validation(
                "nothing to repay: debt below the close-factor granularity",
            ));
        }
        if collateral_price.is_zero() {
            return Err(LendingError::Arithmetic("zero collateral price"));
        }

        let collateral_seized = mul_div_wide(
            &[debt_repaid, debt_price.raw(), BPS + liquidation_bonus_bps as u128],
            &[collateral_price.raw(), BPS],
            Rounding::Down,
        )?;

        Ok(LiquidationQuote {
            debt_repaid,
            collateral_seized,
        })
    }
}

impl LedgerState {
    pub fn liquidation_engine(&self) -> LiquidationEngine {
        LiquidationEngine::new(self.config().limits.close_factor_bps)
    }

    /// Repay part of `borrower`'s debt in `debt_asset` and seize discounted
    /// collateral in `collateral_asset`
    #[allow(clippy::too_many_arguments)]
    pub fn liquidate(
        &mut self,
        liquidator: UserId,
        borrower: UserId,
        collateral_asset: AssetId,
        debt_asset: AssetId,
        debt_to_cover: Amount,
        now: u64,
        prices: &PriceSet,
    ) -> Result<LiquidationOutcome> {
        if liquidator == borrower {
            return Err(LendingError::validation("cannot liquidate your own position"));
        }
        if debt_to_cover == 0 {
            return Err(LendingError::validation("debt to cover must be non-zero"));
        }

        let scope = self.scope(&[borrower], [&collateral_asset, &debt_asset]);
        self.atomically(&scope, |state| {
            state.accrue_scope(&scope, now)?;

            let health_factor_before = state.summary(&borrower, prices)?.health_factor;
            if !health_factor_before.is_liquidatable() {
                tracing::warn!(%borrower, health_factor = %health_factor_before, "liquidation of healthy position rejected");
                return Err(LendingError::NotLiquidatable(health_factor_before));
            }

            let debt_price = prices.get(&debt_asset)?;
            let collateral_price = prices.get(&collateral_asset)?;
            let bonus = state.markets.get(&collateral_asset)?.params.liquidation_bonus_bps;
            let engine = state.liquidation_engine();

            // burn debt shares (floored)
            let debt_market = state.markets.get_mut(&debt_asset)?;
            let debt_position = state
                .positions
                .get_mut(&borrower, &debt_asset)
                .filter(|p| p.has_debt())
                .ok_or_else(|| {
                    LendingError::validation(format!("borrower has no debt in {}", debt_asset))
                })?;
            let debt = debt_market.debt_balance(debt_position.borrow_shares)?;
            let quote = engine.quote(debt, debt_to_cover, debt_price, collateral_price, bonus)?;

            let debt_shares = if quote.debt_repaid == debt {
                debt_position.borrow_shares
            } else {
                debt_market.borrow_shares_for(quote.debt_repaid, Rounding::Down)?
            };
            if debt_shares == 0 {
                return Err(LendingError::validation("repayment too small to burn a share"));
            }
            debt_position.borrow_shares = checked_sub(debt_position.borrow_shares, debt_shares)?;
            debt_position.borrow_index_snapshot = debt_market.borrow_index;
            debt_market.burn_debt(quote.debt_repaid, debt_shares)?;
            state.accrual.refresh_rates(debt_market)?;

            // burn collateral shares (rounded up)
            let collateral_market = state.markets.get_mut(&collateral_asset)?;
            let collateral_position = state
                .positions
                .get_mut(&borrower, &collateral_asset)
                .ok_or(LendingError::InsufficientCollateral {
                    required: quote.collateral_seized,
                    available: 0,
                })?;
            if !collateral_position.is_collateral {
                return Err(LendingError::validation(format!(
                    "{} is not enabled as collateral for the borrower",
                    collateral_asset
                )));
            }
            let balance = collateral_market.deposit_balance(collateral_position.deposit_shares)?;
            if quote.collateral_seized > balance {
                return Err(LendingError::InsufficientCollateral {
                    required: quote.collateral_seized,
                    available: balance,
                });
            }
            collateral_market.ensure_liquidity(quote.collateral_seized)?;

            let collateral_shares = if quote.collateral_seized == balance {
                collateral_position.deposit_shares
            } else {
                collateral_market.deposit_shares_for(quote.collateral_seized, Rounding::Up)?
            };
            collateral_position.deposit_shares =
                checked_sub(collateral_position.deposit_shares, collateral_shares)?;
            collateral_position.deposit_index_snapshot = collateral_market.deposit_index;
            collateral_market.total_deposits =
                checked_sub(collateral_market.total_deposits, quote.collateral_seized)?;
            collateral_market.total_deposit_shares =
                checked_sub(collateral_market.total_deposit_shares, collateral_shares)?;
            state.accrual.refresh_rates(collateral_market)?;

            state.positions.prune(&borrower, &debt_asset);
            state.positions.prune(&borrower, &collateral_asset);

            let health_factor_after = state.summary(&borrower, prices)?.health_factor;

            state.totals.total_borrowed_value = state
                .totals
                .total_borrowed_value
                .saturating_sub(value_of(quote.debt_repaid, debt_price)?);
            state.totals.total_value_locked = state
                .totals
                .total_value_locked
                .saturating_sub(value_of(quote.collateral_seized, collateral_price)?);

            state.emit(LendingEvent::Liquidated {
                liquidator,
                borrower,
                collateral_asset,
                debt_asset,
                debt_repaid: quote.debt_repaid,
                collateral_seized: quote.collateral_seized,
            });

            Ok(LiquidationOutcome {
                debt_repaid: quote.debt_repaid,
                collateral_seized: quote.collateral_seized,
                health_factor_before,
                health_factor_after,
            })
        })
    }
}
