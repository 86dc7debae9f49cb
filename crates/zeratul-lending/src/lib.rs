//! Zeratul Lending - Collateralized Multi-Asset Lending Ledger
//!
//! A pool-based lending ledger: users deposit assets to earn interest, borrow
//! against collateral-flagged deposits, and undercollateralized positions are
//! partially liquidated by third parties.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Ledger (service)                          │
//! │  re-entrancy guard · RwLock<LedgerState> · checkpoint/rollback   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  phase 1: resolve prices      ─▶  PriceOracle                    │
//! │  phase 2: in-memory mutation  ─▶  LedgerState                    │
//! │  phase 3: settle transfers    ─▶  AssetTransfer                  │
//! └──────────────────────────────────────────────────────────────────┘
//!                               │
//!        ┌──────────────┬───────┴──────┬───────────────┐
//!        ▼              ▼              ▼               ▼
//!   MarketRegistry  PositionBook  HealthFactor    Liquidation
//!        │                         Evaluator        Engine
//!        ▼
//!   AccrualEngine ─▶ RateModel (kinked utilization curve)
//! ```
//!
//! # Accounting
//!
//! Balances are stored as shares. A deposit of `a` units mints
//! `a * 1e18 / depositIndex` shares; the redeemable balance is
//! `shares * depositIndex / 1e18`. Interest accrues by growing the indices,
//! so no per-user bookkeeping happens when time passes. Every conversion
//! rounds in favour of the pool.

pub mod accrual;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod ledger;
pub mod liquidation;
pub mod market;
pub mod math;
pub mod oracle;
pub mod position;
pub mod rate;
pub mod scenario;
pub mod service;
pub mod transfer;
pub mod types;

pub use accrual::{Accrual, AccrualEngine};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LedgerConfig, MarketConfig, RiskLimits};
pub use error::{LendingError, Result};
pub use events::LendingEvent;
pub use health::{AccountSummary, HealthFactor, HealthFactorEvaluator};
pub use ledger::{Checkpoint, LedgerState, ProtocolTotals, Scope};
pub use liquidation::{LiquidationEngine, LiquidationOutcome, LiquidationQuote};
pub use market::{Market, MarketData, MarketFlags, MarketRegistry, RiskParams};
pub use math::{Rounding, Wad, BPS, WAD};
pub use oracle::{PriceBook, PriceOracle, PriceQuote, PriceSet};
pub use position::{PositionBook, PositionView, UserMarketSet, UserPosition};
pub use rate::RateModel;
pub use scenario::{Scenario, ScenarioReport};
pub use service::Ledger;
pub use transfer::{Account, AssetTransfer, Custody, Transfer};
pub use types::{Amount, AssetId, Bps, Shares, UserId};

/// Seconds in a (365 day) year, used to annualize rates
pub const SECONDS_PER_YEAR: u64 = 31_536_000;

/// Maximum fraction of a borrower's debt repayable in one liquidation (bps)
pub const CLOSE_FACTOR_BPS: Bps = 5_000;

/// Hard ceiling on any market's collateral factor (bps)
pub const MAX_COLLATERAL_FACTOR_BPS: Bps = 9_000;

/// Hard ceiling on any market's liquidation bonus (bps)
pub const MAX_LIQUIDATION_BONUS_BPS: Bps = 2_000;

/// Health factor below which a position may be liquidated
pub const MIN_HEALTH_FACTOR: Wad = Wad::ONE;
