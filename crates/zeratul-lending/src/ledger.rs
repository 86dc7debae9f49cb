//! Ledger state and position operations
//!
//! `LedgerState` owns every market and position. Each public operation runs
//! against a checkpoint of the markets and positions it can reach: if any
//! step fails (validation, solvency, arithmetic, invariant) the checkpoint is
//! restored and no partial mutation survives.
//!
//! Operations never call out. Prices arrive pre-resolved in a [`PriceSet`];
//! transfers are settled by the caller after the operation returns.

use crate::accrual::AccrualEngine;
use crate::config::LedgerConfig;
use crate::error::{LendingError, Result};
use crate::events::LendingEvent;
use crate::health::{AccountSummary, HealthFactor, HealthFactorEvaluator};
use crate::market::{Market, MarketData, MarketFlags, MarketRegistry, RiskParams};
use crate::math::{checked_add, checked_sub, mul_div, Rounding, Wad, WAD};
use crate::oracle::PriceSet;
use crate::position::{PositionBook, PositionView, UserMarketSet, UserPosition};
use crate::transfer::Account;
use crate::types::{Amount, AssetId, Shares, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Protocol-wide value aggregates, in the oracle's reference unit
///
/// Each operation books value at the price of the moment; decreases saturate
/// at zero because an exit may be priced higher than the matching entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTotals {
    pub total_value_locked: Amount,
    pub total_borrowed_value: Amount,
}

/// Users and assets an operation may touch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub users: Vec<UserId>,
    /// Sorted; markets are always visited in asset order
    pub assets: BTreeSet<AssetId>,
}

/// Pre-images of everything in a scope
#[derive(Debug, Clone)]
pub struct Checkpoint {
    markets: Vec<(AssetId, Option<Market>)>,
    positions: Vec<(UserId, AssetId, Option<UserPosition>)>,
    market_sets: Vec<(UserId, Option<UserMarketSet>)>,
    totals: ProtocolTotals,
    events_len: usize,
}

/// An applied operation whose transfers are still settling
///
/// Markets and positions already carry the operation; its totals and events
/// are held back until it commits.
#[derive(Debug)]
pub(crate) struct Pending {
    checkpoint: Checkpoint,
    totals: ProtocolTotals,
    events: Vec<LendingEvent>,
}

#[derive(Debug, Clone)]
pub struct LedgerState {
    config: LedgerConfig,
    pub(crate) accrual: AccrualEngine,
    pub(crate) markets: MarketRegistry,
    pub(crate) positions: PositionBook,
    pub(crate) totals: ProtocolTotals,
    events: Vec<LendingEvent>,
}

impl LedgerState {
    /// Build a ledger and list the configured markets at `now`
    pub fn new(config: LedgerConfig, now: u64) -> Result<Self> {
        config.validate()?;
        let accrual = AccrualEngine::new(config.rate_model, config.seconds_per_year);
        let mut state = Self {
            config,
            accrual,
            markets: MarketRegistry::new(),
            positions: PositionBook::new(),
            totals: ProtocolTotals::default(),
            events: Vec::new(),
        };

        for market in state.config.markets.clone() {
            let asset = state.create_market(market.asset(), market.params(), now)?;
            state.set_market_flags(
                asset,
                MarketFlags {
                    active: true,
                    can_borrow: market.can_borrow,
                    can_collateral: market.can_collateral,
                },
            )?;
        }
        Ok(state)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn markets(&self) -> &MarketRegistry {
        &self.markets
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    pub fn totals(&self) -> ProtocolTotals {
        self.totals
    }

    /// Drain the events emitted since the last call
    pub fn take_events(&mut self) -> Vec<LendingEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn emit(&mut self, event: LendingEvent) {
        self.events.push(event);
    }

    // ─── scope / checkpoint ────────────────────────────────────────────────

    /// The given users' market sets plus `assets`
    pub fn scope<'a>(
        &self,
        users: &[UserId],
        assets: impl IntoIterator<Item = &'a AssetId>,
    ) -> Scope {
        let mut set: BTreeSet<AssetId> = assets.into_iter().copied().collect();
        for user in users {
            set.extend(self.positions.markets_of(user));
        }
        Scope {
            users: users.to_vec(),
            assets: set,
        }
    }

    /// `assets` plus the markets that enter the users' health factors
    ///
    /// Plain deposits are left out; they never need a price for a solvency
    /// check.
    pub fn risk_assets<'a>(
        &self,
        users: &[UserId],
        assets: impl IntoIterator<Item = &'a AssetId>,
    ) -> BTreeSet<AssetId> {
        let mut set: BTreeSet<AssetId> = assets.into_iter().copied().collect();
        for user in users {
            set.extend(self.positions.markets_of(user).into_iter().filter(|asset| {
                self.positions
                    .get(user, asset)
                    .map_or(false, UserPosition::affects_health)
            }));
        }
        set
    }

    pub fn checkpoint(&self, scope: &Scope) -> Checkpoint {
        let markets = scope
            .assets
            .iter()
            .map(|asset| (*asset, self.markets.snapshot(asset)))
            .collect();
        let mut positions = Vec::new();
        let mut market_sets = Vec::new();
        for user in &scope.users {
            market_sets.push((*user, self.positions.snapshot_set(user)));
            for asset in &scope.assets {
                positions.push((*user, *asset, self.positions.snapshot(user, asset)));
            }
        }
        Checkpoint {
            markets,
            positions,
            market_sets,
            totals: self.totals,
            events_len: self.events.len(),
        }
    }

    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.totals = checkpoint.totals;
        self.events.truncate(checkpoint.events_len);
        self.restore_scope(checkpoint);
    }

    fn restore_scope(&mut self, checkpoint: Checkpoint) {
        for (asset, market) in checkpoint.markets {
            self.markets.restore(asset, market);
        }
        for (user, asset, position) in checkpoint.positions {
            self.positions.restore(user, asset, position);
        }
        for (user, set) in checkpoint.market_sets {
            self.positions.restore_set(user, set);
        }
    }

    /// Detach the totals and events produced since `checkpoint`
    ///
    /// The scope's markets and positions keep the new values; nothing else
    /// may write to that scope until the operation is committed or aborted.
    pub(crate) fn hold(&mut self, checkpoint: Checkpoint) -> Pending {
        let events = self.events.split_off(checkpoint.events_len);
        let totals = std::mem::replace(&mut self.totals, checkpoint.totals);
        Pending {
            checkpoint,
            totals,
            events,
        }
    }

    /// Publish a held operation
    ///
    /// Totals move by the operation's own delta, so operations committed on
    /// other scopes in the meantime are kept.
    pub(crate) fn commit(&mut self, pending: Pending) {
        let before = pending.checkpoint.totals;
        let after = pending.totals;
        self.totals.total_value_locked = shift(
            self.totals.total_value_locked,
            before.total_value_locked,
            after.total_value_locked,
        );
        self.totals.total_borrowed_value = shift(
            self.totals.total_borrowed_value,
            before.total_borrowed_value,
            after.total_borrowed_value,
        );
        self.events.extend(pending.events);
    }

    /// Undo a held operation's markets and positions
    pub(crate) fn abort(&mut self, pending: Pending) {
        self.restore_scope(pending.checkpoint);
    }

    /// Run `op` as one unit: invariants are checked on success, and any
    /// error restores the scope's checkpoint
    pub(crate) fn atomically<R>(
        &mut self,
        scope: &Scope,
        op: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let checkpoint = self.checkpoint(scope);
        let result = op(self).and_then(|out| {
            self.check_invariants(&scope.assets)?;
            Ok(out)
        });
        if let Err(err) = &result {
            if matches!(err, LendingError::InvariantViolation(_)) {
                tracing::error!(%err, "invariant violation, operation aborted");
            }
            self.rollback(checkpoint);
        }
        result
    }

    fn check_invariants(&self, assets: &BTreeSet<AssetId>) -> Result<()> {
        for asset in assets {
            if let Ok(market) = self.markets.get(asset) {
                market.check_invariants()?;
            }
        }
        Ok(())
    }

    // ─── accrual ───────────────────────────────────────────────────────────

    /// Bring one market's indices up to `now`
    pub fn accrue(&mut self, asset: &AssetId, now: u64) -> Result<()> {
        let market = self.markets.get_mut(asset)?;
        if let Some(accrual) = self.accrual.accrue(market, now)? {
            self.events.push(LendingEvent::InterestAccrued {
                asset: accrual.asset,
                interest: accrual.interest,
                reserve: accrual.reserve,
                borrow_index: accrual.borrow_index,
                deposit_index: accrual.deposit_index,
            });
        }
        Ok(())
    }

    /// Accrue every listed market in the scope, in asset order
    pub(crate) fn accrue_scope(&mut self, scope: &Scope, now: u64) -> Result<()> {
        for asset in &scope.assets {
            if self.markets.contains(asset) {
                self.accrue(asset, now)?;
            }
        }
        Ok(())
    }

    /// Solvency at current (already accrued) indices
    pub fn summary(&self, user: &UserId, prices: &PriceSet) -> Result<AccountSummary> {
        HealthFactorEvaluator::new(&self.markets, &self.positions, prices).summary(user)
    }

    fn ensure_solvent(&self, user: &UserId, prices: &PriceSet) -> Result<()> {
        let health_factor = self.summary(user, prices)?.health_factor;
        if health_factor.is_liquidatable() {
            return Err(LendingError::Insolvency { health_factor });
        }
        Ok(())
    }

    // ─── market administration ─────────────────────────────────────────────

    /// List a new market; the asset id doubles as the market id
    pub fn create_market(&mut self, asset: AssetId, params: RiskParams, now: u64) -> Result<AssetId> {
        let scope = self.scope(&[], [&asset]);
        self.atomically(&scope, |state| {
            let limits = state.config.limits;
            state.markets.create(asset, params, &limits, now)?;
            state.emit(LendingEvent::MarketCreated { asset, params });
            tracing::info!(%asset, ?params, "market created");
            Ok(asset)
        })
    }

    /// Change risk parameters; interest up to `now` accrues under the old ones
    pub fn update_risk_params(&mut self, asset: AssetId, params: RiskParams, now: u64) -> Result<()> {
        let scope = self.scope(&[], [&asset]);
        self.atomically(&scope, |state| {
            params.validate(&state.config.limits)?;
            state.accrue(&asset, now)?;
            let market = state.markets.get_mut(&asset)?;
            market.params = params;
            state.accrual.refresh_rates(market)?;
            state.emit(LendingEvent::RiskParamsUpdated { asset, params });
            tracing::info!(%asset, ?params, "risk parameters updated");
            Ok(())
        })
    }

    pub fn set_market_flags(&mut self, asset: AssetId, flags: MarketFlags) -> Result<()> {
        self.markets.get_mut(&asset)?.flags = flags;
        self.emit(LendingEvent::MarketFlagsUpdated { asset, flags });
        tracing::info!(%asset, ?flags, "market flags updated");
        Ok(())
    }

    /// Take accumulated reserves out of the pool
    pub fn withdraw_reserves(&mut self, asset: AssetId, amount: Amount, to: Account, now: u64) -> Result<Amount> {
        ensure_nonzero(amount)?;
        let scope = self.scope(&[], [&asset]);
        self.atomically(&scope, |state| {
            state.accrue(&asset, now)?;
            let market = state.markets.get_mut(&asset)?;
            market.take_reserves(amount)?;
            state.accrual.refresh_rates(market)?;
            state.emit(LendingEvent::ReservesWithdrawn { asset, amount, to });
            Ok(amount)
        })
    }

    // ─── positions ─────────────────────────────────────────────────────────

    /// Supply `amount` and mint deposit shares (floored)
    pub fn deposit(
        &mut self,
        user: UserId,
        asset: AssetId,
        amount: Amount,
        now: u64,
        prices: &PriceSet,
    ) -> Result<Shares> {
        ensure_nonzero(amount)?;
        let scope = self.scope(&[user], [&asset]);
        self.atomically(&scope, |state| {
            state.accrue(&asset, now)?;
            let price = prices.get(&asset)?;

            let market = state.markets.get_mut(&asset)?;
            market.ensure_active()?;
            let shares = market.deposit_shares_for(amount, Rounding::Down)?;
            if shares == 0 {
                return Err(LendingError::validation("deposit too small to mint a share"));
            }
            market.total_deposits = checked_add(market.total_deposits, amount)?;
            market.total_deposit_shares = checked_add(market.total_deposit_shares, shares)?;
            state.accrual.refresh_rates(market)?;
            let index = market.deposit_index;

            let position = state.positions.entry(user, asset);
            position.deposit_shares = checked_add(position.deposit_shares, shares)?;
            position.deposit_index_snapshot = index;

            state.totals.total_value_locked =
                checked_add(state.totals.total_value_locked, value_of(amount, price)?)?;
            state.emit(LendingEvent::Deposited { user, asset, amount, shares });
            Ok(shares)
        })
    }

    /// Redeem `amount` of underlying, burning deposit shares (rounded up)
    pub fn withdraw(
        &mut self,
        user: UserId,
        asset: AssetId,
        amount: Amount,
        now: u64,
        prices: &PriceSet,
    ) -> Result<Amount> {
        ensure_nonzero(amount)?;
        let scope = self.scope(&[user], [&asset]);
        self.atomically(&scope, |state| {
            state.accrue_scope(&scope, now)?;
            let price = prices.get(&asset)?;

            let market = state.markets.get_mut(&asset)?;
            let position = state
                .positions
                .get_mut(&user, &asset)
                .ok_or(LendingError::InsufficientBalance { requested: amount, available: 0 })?;

            let balance = market.deposit_balance(position.deposit_shares)?;
            if amount > balance {
                return Err(LendingError::InsufficientBalance { requested: amount, available: balance });
            }
            market.ensure_liquidity(amount)?;
            let was_collateral = position.is_collateral;

            let shares = if amount == balance {
                position.deposit_shares
            } else {
                market.deposit_shares_for(amount, Rounding::Up)?
            };
            position.deposit_shares = checked_sub(position.deposit_shares, shares)?;
            position.deposit_index_snapshot = market.deposit_index;
            market.total_deposits = checked_sub(market.total_deposits, amount)?;
            market.total_deposit_shares = checked_sub(market.total_deposit_shares, shares)?;
            state.accrual.refresh_rates(market)?;

            // a plain deposit carries no borrowing power
            if was_collateral && state.positions.has_any_debt(&user) {
                state.ensure_solvent(&user, prices)?;
            }
            state.positions.prune(&user, &asset);

            state.totals.total_value_locked = state
                .totals
                .total_value_locked
                .saturating_sub(value_of(amount, price)?);
            state.emit(LendingEvent::Withdrawn { user, asset, amount, shares });
            Ok(amount)
        })
    }

    /// Borrow `amount` against the user's collateral, minting debt shares
    /// (rounded up)
    pub fn borrow(
        &mut self,
        user: UserId,
        asset: AssetId,
        amount: Amount,
        now: u64,
        prices: &PriceSet,
    ) -> Result<Shares> {
        ensure_nonzero(amount)?;
        let scope = self.scope(&[user], [&asset]);
        self.atomically(&scope, |state| {
            state.accrue_scope(&scope, now)?;
            let price = prices.get(&asset)?;

            let market = state.markets.get_mut(&asset)?;
            market.ensure_active()?;
            if !market.flags.can_borrow {
                return Err(LendingError::validation(format!("borrowing disabled for {}", asset)));
            }
            market.ensure_liquidity(amount)?;

            let shares = market.borrow_shares_for(amount, Rounding::Up)?;
            market.total_borrows = checked_add(market.total_borrows, amount)?;
            market.total_borrow_shares = checked_add(market.total_borrow_shares, shares)?;
            state.accrual.refresh_rates(market)?;
            let index = market.borrow_index;

            let position = state.positions.entry(user, asset);
            position.borrow_shares = checked_add(position.borrow_shares, shares)?;
            position.borrow_index_snapshot = index;

            state.ensure_solvent(&user, prices)?;

            state.totals.total_borrowed_value =
                checked_add(state.totals.total_borrowed_value, value_of(amount, price)?)?;
            state.emit(LendingEvent::Borrowed { user, asset, amount, shares });
            Ok(shares)
        })
    }

    /// Repay up to `amount` of debt; returns the amount actually repaid
    pub fn repay(
        &mut self,
        user: UserId,
        asset: AssetId,
        amount: Amount,
        now: u64,
        prices: &PriceSet,
    ) -> Result<Amount> {
        ensure_nonzero(amount)?;
        let scope = self.scope(&[user], [&asset]);
        self.atomically(&scope, |state| {
            state.accrue(&asset, now)?;
            let price = prices.get(&asset)?;

            let market = state.markets.get_mut(&asset)?;
            let position = state
                .positions
                .get_mut(&user, &asset)
                .filter(|p| p.has_debt())
                .ok_or_else(|| LendingError::validation(format!("no debt in {}", asset)))?;

            let debt = market.debt_balance(position.borrow_shares)?;
            let repaid = amount.min(debt);
            let shares = if repaid == debt {
                position.borrow_shares
            } else {
                market.borrow_shares_for(repaid, Rounding::Down)?
            };
            if shares == 0 {
                return Err(LendingError::validation("repayment too small to burn a share"));
            }

            position.borrow_shares = checked_sub(position.borrow_shares, shares)?;
            position.borrow_index_snapshot = market.borrow_index;
            market.burn_debt(repaid, shares)?;
            state.accrual.refresh_rates(market)?;
            state.positions.prune(&user, &asset);

            state.totals.total_borrowed_value = state
                .totals
                .total_borrowed_value
                .saturating_sub(value_of(repaid, price)?);
            state.emit(LendingEvent::Repaid { user, asset, amount: repaid, shares });
            Ok(repaid)
        })
    }

    /// Flag or unflag a deposit as collateral
    pub fn toggle_collateral(
        &mut self,
        user: UserId,
        asset: AssetId,
        enabled: bool,
        now: u64,
        prices: &PriceSet,
    ) -> Result<()> {
        let scope = self.scope(&[user], [&asset]);
        self.atomically(&scope, |state| {
            state.accrue_scope(&scope, now)?;

            let market = state.markets.get(&asset)?;
            if enabled {
                market.ensure_active()?;
                if !market.flags.can_collateral {
                    return Err(LendingError::validation(format!(
                        "{} cannot be used as collateral",
                        asset
                    )));
                }
            }

            let position = state
                .positions
                .get_mut(&user, &asset)
                .ok_or_else(|| LendingError::validation(format!("no position in {}", asset)))?;
            if position.is_collateral == enabled {
                return Ok(());
            }
            position.is_collateral = enabled;

            if !enabled && state.positions.has_any_debt(&user) {
                state.ensure_solvent(&user, prices)?;
            }
            state.emit(LendingEvent::CollateralToggled { user, asset, enabled });
            Ok(())
        })
    }

    // ─── projected views ───────────────────────────────────────────────────

    /// Copy of a market with interest projected to `now`
    pub fn projected_market(&self, asset: &AssetId, now: u64) -> Result<Market> {
        let mut market = self.markets.get(asset)?.clone();
        self.accrual.accrue(&mut market, now)?;
        Ok(market)
    }

    /// Market data as of `now`, without mutating state
    pub fn market_data(&self, asset: &AssetId, now: u64) -> Result<MarketData> {
        self.projected_market(asset, now)?.data()
    }

    /// Account summary as of `now`, without mutating state
    pub fn account_summary(&self, user: &UserId, now: u64, prices: &PriceSet) -> Result<AccountSummary> {
        let mut projected = MarketRegistry::new();
        for asset in self.positions.markets_of(user) {
            projected.restore(asset, Some(self.projected_market(&asset, now)?));
        }
        HealthFactorEvaluator::new(&projected, &self.positions, prices).summary(user)
    }

    pub fn health_factor(&self, user: &UserId, now: u64, prices: &PriceSet) -> Result<HealthFactor> {
        Ok(self.account_summary(user, now, prices)?.health_factor)
    }

    /// Balances of one position as of `now`
    pub fn position(&self, user: &UserId, asset: &AssetId, now: u64) -> Result<PositionView> {
        let market = self.projected_market(asset, now)?;
        let position = self.positions.get(user, asset).cloned().unwrap_or_default();
        Ok(PositionView {
            asset: *asset,
            deposit_shares: position.deposit_shares,
            borrow_shares: position.borrow_shares,
            deposit_balance: market.deposit_balance(position.deposit_shares)?,
            debt_balance: market.debt_balance(position.borrow_shares)?,
            is_collateral: position.is_collateral,
        })
    }
}

/// `current + (after - before)`, saturating at both ends
fn shift(current: Amount, before: Amount, after: Amount) -> Amount {
    current.saturating_add(after).saturating_sub(before)
}

fn ensure_nonzero(amount: Amount) -> Result<()> {
    if amount == 0 {
        return Err(LendingError::validation("amount must be non-zero"));
    }
    Ok(())
}

/// Reference-unit value of `amount` at `price`
pub(crate) fn value_of(amount: Amount, price: Wad) -> Result<Amount> {
    mul_div(amount, price.raw(), WAD, Rounding::Down)
}
