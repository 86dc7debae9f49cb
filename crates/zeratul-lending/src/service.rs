//! Thread-safe ledger service
//!
//! Every mutating call runs in three phases:
//!
//! ```text
//! 1. resolve    compute the priced scope under a read lock, fetch and
//!               validate prices with no lock held
//! 2. mutate     write lock: checkpoint, run the LedgerState operation,
//!               claim the scope, release the lock
//! 3. settle     no lock held: execute transfers in order, then re-take the
//!               write lock to commit, or to undo executed transfers and
//!               restore the checkpoint
//! ```
//!
//! A claimed scope (its users and assets) stays reserved until the call
//! commits or aborts; writers whose scope overlaps it wait. Readers are not
//! held back and may observe an operation whose transfers are still
//! settling. Totals and events only show committed operations.
//!
//! A per-thread guard spans all three phases, so an oracle or custody
//! implementation calling back into the same ledger is rejected with
//! [`LendingError::Reentrancy`] instead of deadlocking. Custody that hands a
//! ledger call to another thread and waits on it only deadlocks when that
//! call needs the claimed scope.

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::error::{LendingError, Result};
use crate::events::LendingEvent;
use crate::health::{AccountSummary, HealthFactor};
use crate::ledger::{LedgerState, ProtocolTotals, Scope};
use crate::liquidation::LiquidationOutcome;
use crate::market::{MarketData, MarketFlags, RiskParams};
use crate::oracle::{PriceOracle, PriceSet};
use crate::position::PositionView;
use crate::transfer::{Account, AssetTransfer, Transfer};
use crate::types::{Amount, AssetId, Shares, UserId};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::thread::{self, ThreadId};

/// Attempts at pricing a scope that keeps changing under concurrent writers
const MAX_SCOPE_ATTEMPTS: usize = 4;

/// Which prices an operation needs
#[derive(Clone, Copy)]
enum Pricing<'a> {
    /// No prices (administrative calls)
    Unpriced,
    /// Only the listed assets
    Assets,
    /// The listed assets plus every market entering these users' health
    Solvency(&'a [UserId]),
}

/// Users and assets of operations whose transfers are settling
#[derive(Debug, Default)]
struct InFlight {
    users: BTreeSet<UserId>,
    assets: BTreeSet<AssetId>,
}

impl InFlight {
    fn overlaps(&self, scope: &Scope) -> bool {
        scope.users.iter().any(|user| self.users.contains(user))
            || scope.assets.iter().any(|asset| self.assets.contains(asset))
    }
}

/// Lending ledger bound to its external collaborators
pub struct Ledger<O, T, C> {
    state: RwLock<LedgerState>,
    oracle: O,
    custody: T,
    clock: C,
    /// Threads currently inside a ledger call
    active: Mutex<HashSet<ThreadId>>,
    in_flight: Mutex<InFlight>,
    /// Signalled whenever a claimed scope is released
    settled: Condvar,
}

/// Marks the current thread as inside a call until dropped
struct CallGuard<'a> {
    active: &'a Mutex<HashSet<ThreadId>>,
    thread: ThreadId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.thread);
    }
}

/// Keeps a scope reserved until dropped
struct ScopeClaim<'a> {
    in_flight: &'a Mutex<InFlight>,
    settled: &'a Condvar,
    scope: Scope,
}

impl Drop for ScopeClaim<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        for user in &self.scope.users {
            in_flight.users.remove(user);
        }
        for asset in &self.scope.assets {
            in_flight.assets.remove(asset);
        }
        drop(in_flight);
        self.settled.notify_all();
    }
}

impl<O, T, C> Ledger<O, T, C>
where
    O: PriceOracle,
    T: AssetTransfer,
    C: Clock,
{
    pub fn new(config: LedgerConfig, oracle: O, custody: T, clock: C) -> Result<Self> {
        let state = LedgerState::new(config, clock.now())?;
        tracing::info!(markets = state.markets().len(), "lending ledger initialized");
        Ok(Self {
            state: RwLock::new(state),
            oracle,
            custody,
            clock,
            active: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(InFlight::default()),
            settled: Condvar::new(),
        })
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn custody(&self) -> &T {
        &self.custody
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Copy of the whole ledger state
    ///
    /// Includes the market and position changes of operations still settling.
    pub fn snapshot(&self) -> Result<LedgerState> {
        let _guard = self.enter()?;
        Ok(self.state.read().clone())
    }

    fn enter(&self) -> Result<CallGuard<'_>> {
        let thread = thread::current().id();
        if !self.active.lock().insert(thread) {
            tracing::warn!(?thread, "re-entrant ledger call rejected");
            return Err(LendingError::Reentrancy);
        }
        Ok(CallGuard {
            active: &self.active,
            thread,
        })
    }

    /// Reserve `scope` for a call about to settle; the caller holds the
    /// write lock
    fn claim(&self, scope: Scope) -> ScopeClaim<'_> {
        let mut in_flight = self.in_flight.lock();
        in_flight.users.extend(scope.users.iter().copied());
        in_flight.assets.extend(scope.assets.iter().copied());
        ScopeClaim {
            in_flight: &self.in_flight,
            settled: &self.settled,
            scope,
        }
    }

    fn resolve(&self, assets: impl IntoIterator<Item = AssetId>, now: u64) -> Result<PriceSet> {
        let max_age = self.state.read().config().max_price_age_secs;
        let assets: Vec<AssetId> = assets.into_iter().collect();
        PriceSet::resolve(&self.oracle, &assets, now, max_age)
    }

    /// Run `op` through the resolve / mutate / settle phases
    fn execute<R>(
        &self,
        users: &[UserId],
        assets: &[AssetId],
        pricing: Pricing<'_>,
        op: impl FnOnce(&mut LedgerState, u64, &PriceSet) -> Result<R>,
        transfers: impl FnOnce(&R) -> Vec<Transfer>,
    ) -> Result<R> {
        let _guard = self.enter()?;
        let now = self.clock.now();

        let mut attempts = 0;
        let (mut state, prices, scope) = loop {
            let needed = self.priced_assets(&self.state.read(), assets, pricing);
            let prices = self.resolve(needed.iter().copied(), now)?;

            let state = self.state.write();
            // the user may have entered a market while prices were fetched
            if !prices.covers(&self.priced_assets(&state, assets, pricing)) {
                drop(state);
                attempts += 1;
                if attempts >= MAX_SCOPE_ATTEMPTS {
                    return Err(LendingError::validation(
                        "position scope changed repeatedly during price resolution",
                    ));
                }
                continue;
            }

            let scope = state.scope(users, assets);
            let mut in_flight = self.in_flight.lock();
            if !in_flight.overlaps(&scope) {
                drop(in_flight);
                break (state, prices, scope);
            }
            // wait for the overlapping call to settle, then start over
            drop(state);
            while in_flight.overlaps(&scope) {
                self.settled.wait(&mut in_flight);
            }
        };

        let checkpoint = state.checkpoint(&scope);
        let out = op(&mut *state, now, &prices)?;

        let transfers: Vec<Transfer> = transfers(&out)
            .into_iter()
            .filter(|t| t.amount > 0)
            .collect();
        if transfers.is_empty() {
            return Ok(out);
        }

        let pending = state.hold(checkpoint);
        let _claim = self.claim(scope);
        drop(state);

        let settled = self.settle(&transfers);
        let mut state = self.state.write();
        match settled {
            Ok(()) => {
                state.commit(pending);
                Ok(out)
            }
            Err(err) => {
                tracing::warn!(%err, "transfer failed, rolling back operation");
                state.abort(pending);
                Err(err)
            }
        }
    }

    fn priced_assets(
        &self,
        state: &LedgerState,
        assets: &[AssetId],
        pricing: Pricing<'_>,
    ) -> BTreeSet<AssetId> {
        match pricing {
            Pricing::Unpriced => Default::default(),
            Pricing::Assets => assets.iter().copied().collect(),
            Pricing::Solvency(users) => state.risk_assets(users, assets),
        }
    }

    /// Execute transfers in order; on failure reverse the ones already done
    fn settle(&self, transfers: &[Transfer]) -> Result<()> {
        for (i, transfer) in transfers.iter().enumerate() {
            if let Err(err) = self.custody.transfer(transfer) {
                for done in transfers[..i].iter().rev() {
                    if let Err(undo) = self.custody.transfer(&done.reversed()) {
                        tracing::error!(%undo, ?done, "failed to compensate transfer");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    // ─── administration ────────────────────────────────────────────────────

    pub fn create_market(&self, asset: AssetId, params: RiskParams) -> Result<AssetId> {
        self.execute(
            &[],
            &[asset],
            Pricing::Unpriced,
            |state, now, _| state.create_market(asset, params, now),
            |_| Vec::new(),
        )
    }

    pub fn update_risk_params(&self, asset: AssetId, params: RiskParams) -> Result<()> {
        self.execute(
            &[],
            &[asset],
            Pricing::Unpriced,
            |state, now, _| state.update_risk_params(asset, params, now),
            |_| Vec::new(),
        )
    }

    pub fn set_market_flags(&self, asset: AssetId, flags: MarketFlags) -> Result<()> {
        self.execute(
            &[],
            &[asset],
            Pricing::Unpriced,
            |state, _, _| state.set_market_flags(asset, flags),
            |_| Vec::new(),
        )
    }

    /// Pay accumulated reserves of `asset` out to `to`
    pub fn withdraw_reserves(&self, asset: AssetId, amount: Amount, to: Account) -> Result<Amount> {
        if to == Account::Pool {
            return Err(LendingError::validation("reserves must leave the pool"));
        }
        self.execute(
            &[],
            &[asset],
            Pricing::Unpriced,
            |state, now, _| state.withdraw_reserves(asset, amount, to, now),
            |amount| {
                vec![Transfer {
                    asset,
                    from: Account::Pool,
                    to,
                    amount: *amount,
                }]
            },
        )
    }

    /// Accrue one market up to the current time
    pub fn accrue_interest(&self, asset: AssetId) -> Result<MarketData> {
        self.execute(
            &[],
            &[asset],
            Pricing::Unpriced,
            |state, now, _| {
                state.accrue(&asset, now)?;
                state.markets().get(&asset)?.data()
            },
            |_| Vec::new(),
        )
    }

    // ─── user operations ───────────────────────────────────────────────────

    pub fn deposit(&self, user: UserId, asset: AssetId, amount: Amount) -> Result<Shares> {
        let shares = self.execute(
            &[user],
            &[asset],
            Pricing::Assets,
            |state, now, prices| state.deposit(user, asset, amount, now, prices),
            |_| vec![Transfer { asset, from: Account::User(user), to: Account::Pool, amount }],
        )?;
        tracing::info!(%user, %asset, amount, shares, "deposit");
        Ok(shares)
    }

    pub fn withdraw(&self, user: UserId, asset: AssetId, amount: Amount) -> Result<Amount> {
        let released = self.execute(
            &[user],
            &[asset],
            Pricing::Solvency(&[user]),
            |state, now, prices| state.withdraw(user, asset, amount, now, prices),
            |released| {
                vec![Transfer { asset, from: Account::Pool, to: Account::User(user), amount: *released }]
            },
        )?;
        tracing::info!(%user, %asset, amount = released, "withdraw");
        Ok(released)
    }

    pub fn borrow(&self, user: UserId, asset: AssetId, amount: Amount) -> Result<Shares> {
        let shares = self.execute(
            &[user],
            &[asset],
            Pricing::Solvency(&[user]),
            |state, now, prices| state.borrow(user, asset, amount, now, prices),
            |_| vec![Transfer { asset, from: Account::Pool, to: Account::User(user), amount }],
        )?;
        tracing::info!(%user, %asset, amount, shares, "borrow");
        Ok(shares)
    }

    pub fn repay(&self, user: UserId, asset: AssetId, amount: Amount) -> Result<Amount> {
        let repaid = self.execute(
            &[user],
            &[asset],
            Pricing::Assets,
            |state, now, prices| state.repay(user, asset, amount, now, prices),
            |repaid| {
                vec![Transfer { asset, from: Account::User(user), to: Account::Pool, amount: *repaid }]
            },
        )?;
        tracing::info!(%user, %asset, amount = repaid, "repay");
        Ok(repaid)
    }

    pub fn toggle_collateral(&self, user: UserId, asset: AssetId, enabled: bool) -> Result<()> {
        self.execute(
            &[user],
            &[asset],
            Pricing::Solvency(&[user]),
            |state, now, prices| state.toggle_collateral(user, asset, enabled, now, prices),
            |_| Vec::new(),
        )?;
        tracing::info!(%user, %asset, enabled, "collateral toggled");
        Ok(())
    }

    pub fn liquidate(
        &self,
        liquidator: UserId,
        borrower: UserId,
        collateral_asset: AssetId,
        debt_asset: AssetId,
        debt_to_cover: Amount,
    ) -> Result<LiquidationOutcome> {
        if liquidator == borrower {
            return Err(LendingError::validation("cannot liquidate your own position"));
        }
        let outcome = self.execute(
            &[borrower],
            &[collateral_asset, debt_asset],
            Pricing::Solvency(&[borrower]),
            |state, now, prices| {
                state.liquidate(
                    liquidator,
                    borrower,
                    collateral_asset,
                    debt_asset,
                    debt_to_cover,
                    now,
                    prices,
                )
            },
            |outcome| {
                vec![
                    Transfer {
                        asset: debt_asset,
                        from: Account::User(liquidator),
                        to: Account::Pool,
                        amount: outcome.debt_repaid,
                    },
                    Transfer {
                        asset: collateral_asset,
                        from: Account::Pool,
                        to: Account::User(liquidator),
                        amount: outcome.collateral_seized,
                    },
                ]
            },
        )?;
        tracing::info!(
            %liquidator,
            %borrower,
            %collateral_asset,
            %debt_asset,
            debt_repaid = outcome.debt_repaid,
            collateral_seized = outcome.collateral_seized,
            health_factor = %outcome.health_factor_after,
            "position liquidated"
        );
        Ok(outcome)
    }

    // ─── views ─────────────────────────────────────────────────────────────

    pub fn market_data(&self, asset: &AssetId) -> Result<MarketData> {
        let _guard = self.enter()?;
        self.state.read().market_data(asset, self.clock.now())
    }

    /// All markets, in asset order
    pub fn markets(&self) -> Result<Vec<MarketData>> {
        let _guard = self.enter()?;
        let now = self.clock.now();
        let state = self.state.read();
        state
            .markets()
            .iter()
            .map(|market| state.market_data(&market.asset, now))
            .collect()
    }

    pub fn position(&self, user: &UserId, asset: &AssetId) -> Result<PositionView> {
        let _guard = self.enter()?;
        self.state.read().position(user, asset, self.clock.now())
    }

    /// Every live position of `user`
    pub fn positions_of(&self, user: &UserId) -> Result<Vec<PositionView>> {
        let _guard = self.enter()?;
        let now = self.clock.now();
        let state = self.state.read();
        state
            .positions()
            .markets_of(user)
            .iter()
            .map(|asset| state.position(user, asset, now))
            .collect()
    }

    pub fn account_summary(&self, user: &UserId) -> Result<AccountSummary> {
        let _guard = self.enter()?;
        let now = self.clock.now();
        let markets = self.state.read().risk_assets(&[*user], &[]);
        let prices = self.resolve(markets, now)?;
        self.state.read().account_summary(user, now, &prices)
    }

    pub fn health_factor(&self, user: &UserId) -> Result<HealthFactor> {
        Ok(self.account_summary(user)?.health_factor)
    }

    pub fn totals(&self) -> Result<ProtocolTotals> {
        let _guard = self.enter()?;
        Ok(self.state.read().totals())
    }

    /// Drain the events committed since the last call
    pub fn take_events(&self) -> Result<Vec<LendingEvent>> {
        let _guard = self.enter()?;
        Ok(self.state.write().take_events())
    }
}
