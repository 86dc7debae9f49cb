//! Scripted ledger runs
//!
//! A scenario wires a [`Ledger`] to an in-memory price book, custody and a
//! manual clock, then replays a list of steps. Failed steps are recorded in
//! the report and do not stop the run.
//!
//! ```yaml
//! start_time: 1700000000
//! config:
//!   markets:
//!     - { symbol: USDC, collateral_factor_bps: 7500, liquidation_bonus_bps: 500 }
//! prices:
//!   USDC: "1"
//! funding:
//!   - { user: alice, asset: USDC, amount: 1000 }
//! steps:
//!   - { action: deposit, user: alice, asset: USDC, amount: 1000 }
//!   - { action: collateral, user: alice, asset: USDC, enabled: true }
//!   - { action: borrow, user: alice, asset: USDC, amount: 700 }
//!   - { action: advance, secs: 86400 }
//! ```

use crate::clock::{Clock, ManualClock};
use crate::config::LedgerConfig;
use crate::error::{LendingError, Result};
use crate::events::LendingEvent;
use crate::health::HealthFactor;
use crate::ledger::ProtocolTotals;
use crate::market::MarketData;
use crate::math::Wad;
use crate::oracle::PriceBook;
use crate::position::PositionView;
use crate::service::Ledger;
use crate::transfer::{Account, Custody};
use crate::types::{Amount, AssetId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

fn default_start_time() -> u64 {
    1_700_000_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_start_time")]
    pub start_time: u64,
    #[serde(default)]
    pub config: LedgerConfig,
    /// Initial feed prices by symbol, as decimal strings
    #[serde(default)]
    pub prices: BTreeMap<String, String>,
    #[serde(default)]
    pub funding: Vec<Funding>,
    pub steps: Vec<Step>,
}

/// Wallet balance minted before the first step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Funding {
    pub user: String,
    pub asset: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Deposit { user: String, asset: String, amount: Amount },
    Withdraw { user: String, asset: String, amount: Amount },
    Borrow { user: String, asset: String, amount: Amount },
    Repay { user: String, asset: String, amount: Amount },
    Collateral { user: String, asset: String, enabled: bool },
    Liquidate {
        liquidator: String,
        borrower: String,
        collateral: String,
        debt: String,
        amount: Amount,
    },
    /// Push a feed price stamped with the current scenario time
    Price { asset: String, price: String },
    Advance { secs: u64 },
    Accrue { asset: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    pub time: u64,
    pub step: Step,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountReport {
    pub user: String,
    pub health_factor: Option<HealthFactor>,
    pub positions: Vec<PositionView>,
    pub wallet: BTreeMap<String, Amount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: Option<String>,
    pub end_time: u64,
    pub steps: Vec<StepReport>,
    pub markets: BTreeMap<String, MarketData>,
    pub accounts: Vec<AccountReport>,
    pub totals: ProtocolTotals,
    pub events: Vec<LendingEvent>,
}

impl ScenarioReport {
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.error.is_some())
    }
}

type ScenarioLedger = Ledger<Arc<PriceBook>, Arc<Custody>, Arc<ManualClock>>;

impl Scenario {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let scenario: Self =
            serde_yaml::from_str(yaml).map_err(|e| LendingError::Config(e.to_string()))?;
        scenario.config.validate()?;
        Ok(scenario)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| LendingError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&yaml)
    }

    /// Replay the scenario on a fresh ledger
    pub fn run(&self) -> Result<ScenarioReport> {
        let clock = Arc::new(ManualClock::new(self.start_time));
        let prices = Arc::new(PriceBook::new());
        let custody = Arc::new(Custody::new());

        for (symbol, price) in &self.prices {
            prices.set_price(AssetId::from_symbol(symbol), price.parse::<Wad>()?, self.start_time);
        }
        for funding in &self.funding {
            custody.mint(
                Account::User(UserId::from_name(&funding.user)),
                AssetId::from_symbol(&funding.asset),
                funding.amount,
            )?;
        }

        let ledger = Ledger::new(self.config.clone(), prices, custody, clock)?;

        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            let outcome = apply(&ledger, step);
            if let Err(err) = &outcome {
                tracing::debug!(index, %err, "scenario step failed");
            }
            steps.push(StepReport {
                index,
                time: ledger.clock().now(),
                step: step.clone(),
                result: outcome.as_ref().ok().cloned(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }

        self.report(&ledger, steps)
    }

    fn report(&self, ledger: &ScenarioLedger, steps: Vec<StepReport>) -> Result<ScenarioReport> {
        let mut symbols: BTreeSet<&str> = self.prices.keys().map(String::as_str).collect();
        symbols.extend(self.config.markets.iter().map(|m| m.symbol.as_str()));
        let mut users: BTreeSet<&str> = self.funding.iter().map(|f| f.user.as_str()).collect();
        for step in &self.steps {
            users.extend(step.users());
        }

        let mut markets = BTreeMap::new();
        for symbol in &symbols {
            if let Ok(data) = ledger.market_data(&AssetId::from_symbol(symbol)) {
                markets.insert(symbol.to_string(), data);
            }
        }

        let mut accounts = Vec::new();
        for user in users {
            let id = UserId::from_name(user);
            let wallet = symbols
                .iter()
                .map(|symbol| {
                    let balance = ledger
                        .custody()
                        .balance(Account::User(id), AssetId::from_symbol(symbol));
                    (symbol.to_string(), balance)
                })
                .filter(|(_, balance)| *balance > 0)
                .collect();
            accounts.push(AccountReport {
                user: user.to_string(),
                // unpriced or stale markets leave the health factor unknown
                health_factor: ledger.health_factor(&id).ok(),
                positions: ledger.positions_of(&id)?,
                wallet,
            });
        }

        Ok(ScenarioReport {
            name: self.name.clone(),
            end_time: ledger.clock().now(),
            steps,
            markets,
            accounts,
            totals: ledger.totals()?,
            events: ledger.take_events()?,
        })
    }
}

impl Step {
    fn users(&self) -> Vec<&str> {
        match self {
            Step::Deposit { user, .. }
            | Step::Withdraw { user, .. }
            | Step::Borrow { user, .. }
            | Step::Repay { user, .. }
            | Step::Collateral { user, .. } => vec![user.as_str()],
            Step::Liquidate { liquidator, borrower, .. } => {
                vec![liquidator.as_str(), borrower.as_str()]
            }
            Step::Price { .. } | Step::Advance { .. } | Step::Accrue { .. } => Vec::new(),
        }
    }
}

fn apply(ledger: &ScenarioLedger, step: &Step) -> Result<String> {
    fn user(name: &str) -> UserId {
        UserId::from_name(name)
    }
    fn asset(symbol: &str) -> AssetId {
        AssetId::from_symbol(symbol)
    }

    match step {
        Step::Deposit { user: u, asset: a, amount } => ledger
            .deposit(user(u), asset(a), *amount)
            .map(|shares| format!("minted {} shares", shares)),
        Step::Withdraw { user: u, asset: a, amount } => ledger
            .withdraw(user(u), asset(a), *amount)
            .map(|amount| format!("released {}", amount)),
        Step::Borrow { user: u, asset: a, amount } => ledger
            .borrow(user(u), asset(a), *amount)
            .map(|shares| format!("minted {} debt shares", shares)),
        Step::Repay { user: u, asset: a, amount } => ledger
            .repay(user(u), asset(a), *amount)
            .map(|amount| format!("repaid {}", amount)),
        Step::Collateral { user: u, asset: a, enabled } => ledger
            .toggle_collateral(user(u), asset(a), *enabled)
            .map(|()| format!("collateral {}", if *enabled { "enabled" } else { "disabled" })),
        Step::Liquidate {
            liquidator,
            borrower,
            collateral,
            debt,
            amount,
        } => ledger
            .liquidate(user(liquidator), user(borrower), asset(collateral), asset(debt), *amount)
            .map(|outcome| {
                format!(
                    "repaid {}, seized {}, health factor {} -> {}",
                    outcome.debt_repaid,
                    outcome.collateral_seized,
                    outcome.health_factor_before,
                    outcome.health_factor_after
                )
            }),
        Step::Price { asset: a, price } => {
            let price: Wad = price.parse()?;
            ledger.oracle().set_price(asset(a), price, ledger.clock().now());
            Ok(format!("{} = {}", a, price))
        }
        Step::Advance { secs } => {
            ledger.clock().advance(*secs);
            Ok(format!("t = {}", ledger.clock().now()))
        }
        Step::Accrue { asset: a } => ledger
            .accrue_interest(asset(a))
            .map(|data| format!("borrow index {}", data.borrow_index)),
    }
}
