//! Cross-market solvency evaluation
//!
//! ```text
//! collateral = Σ deposit_balance * price * collateral_factor   (collateral-flagged only)
//! debt       = Σ debt_balance * price
//! health     = collateral / debt            (∞ when debt == 0)
//! ```
//!
//! Values are in the oracle's reference unit. Collateral value rounds down and
//! debt value rounds up, so rounding never makes a position look healthier
//! than it is.

use crate::error::Result;
use crate::market::MarketRegistry;
use crate::math::{checked_add, mul_div, mul_div_wide, Rounding, Wad, BPS, WAD};
use crate::oracle::PriceSet;
use crate::position::PositionBook;
use crate::types::{Amount, UserId};
use crate::MIN_HEALTH_FACTOR;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health factor; `Infinite` when the user owes nothing
///
/// Ordered so that every finite value is below `Infinite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthFactor {
    Finite(Wad),
    Infinite,
}

impl HealthFactor {
    /// Below the minimum: may be liquidated
    pub fn is_liquidatable(&self) -> bool {
        *self < HealthFactor::Finite(MIN_HEALTH_FACTOR)
    }

    pub fn is_healthy(&self) -> bool {
        !self.is_liquidatable()
    }

    pub fn finite(&self) -> Option<Wad> {
        match self {
            HealthFactor::Finite(value) => Some(*value),
            HealthFactor::Infinite => None,
        }
    }
}

impl fmt::Display for HealthFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthFactor::Finite(value) => write!(f, "{}", value),
            HealthFactor::Infinite => f.write_str("inf"),
        }
    }
}

/// Aggregate risk view of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    /// Risk-adjusted collateral value
    pub collateral_value: Amount,
    pub debt_value: Amount,
    /// Additional debt value the user could take on
    pub borrow_capacity: Amount,
    pub health_factor: HealthFactor,
}

/// Evaluates positions against current indices and resolved prices
pub struct HealthFactorEvaluator<'a> {
    markets: &'a MarketRegistry,
    positions: &'a PositionBook,
    prices: &'a PriceSet,
}

impl<'a> HealthFactorEvaluator<'a> {
    pub fn new(markets: &'a MarketRegistry, positions: &'a PositionBook, prices: &'a PriceSet) -> Self {
        Self {
            markets,
            positions,
            prices,
        }
    }

    /// Walk the user's market set and value every position
    ///
    /// Indices are used as stored; callers accrue the markets first.
    pub fn summary(&self, user: &UserId) -> Result<AccountSummary> {
        let mut collateral_value: Amount = 0;
        let mut debt_value: Amount = 0;

        for asset in self.positions.markets_of(user) {
            let Some(position) = self.positions.get(user, &asset) else {
                continue;
            };
            let market = self.markets.get(&asset)?;

            if position.is_collateral && position.deposit_shares > 0 {
                let balance = market.deposit_balance(position.deposit_shares)?;
                let price = self.prices.get(&asset)?;
                let value = mul_div_wide(
                    &[balance, price.raw(), market.params.collateral_factor_bps as u128],
                    &[WAD, BPS],
                    Rounding::Down,
                )?;
                collateral_value = checked_add(collateral_value, value)?;
            }

            if position.borrow_shares > 0 {
                let debt = market.debt_balance(position.borrow_shares)?;
                let price = self.prices.get(&asset)?;
                let value = mul_div(debt, price.raw(), WAD, Rounding::Up)?;
                debt_value = checked_add(debt_value, value)?;
            }
        }

        let health_factor = if debt_value == 0 {
            HealthFactor::Infinite
        } else {
            HealthFactor::Finite(Wad::saturating_ratio(collateral_value, debt_value)?)
        };

        Ok(AccountSummary {
            collateral_value,
            debt_value,
            borrow_capacity: collateral_value.saturating_sub(debt_value),
            health_factor,
        })
    }

    pub fn health_factor(&self, user: &UserId) -> Result<HealthFactor> {
        Ok(self.summary(user)?.health_factor)
    }
}
