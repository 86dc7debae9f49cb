//! Events emitted by ledger operations

use crate::market::{MarketFlags, RiskParams};
use crate::math::Wad;
use crate::transfer::Account;
use crate::types::{Amount, AssetId, Shares, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LendingEvent {
    MarketCreated {
        asset: AssetId,
        params: RiskParams,
    },
    Deposited {
        user: UserId,
        asset: AssetId,
        amount: Amount,
        shares: Shares,
    },
    Withdrawn {
        user: UserId,
        asset: AssetId,
        amount: Amount,
        shares: Shares,
    },
    Borrowed {
        user: UserId,
        asset: AssetId,
        amount: Amount,
        shares: Shares,
    },
    Repaid {
        user: UserId,
        asset: AssetId,
        amount: Amount,
        shares: Shares,
    },
    CollateralToggled {
        user: UserId,
        asset: AssetId,
        enabled: bool,
    },
    Liquidated {
        liquidator: UserId,
        borrower: UserId,
        collateral_asset: AssetId,
        debt_asset: AssetId,
        debt_repaid: Amount,
        collateral_seized: Amount,
    },
    InterestAccrued {
        asset: AssetId,
        interest: Amount,
        reserve: Amount,
        borrow_index: Wad,
        deposit_index: Wad,
    },
    RiskParamsUpdated {
        asset: AssetId,
        params: RiskParams,
    },
    MarketFlagsUpdated {
        asset: AssetId,
        flags: MarketFlags,
    },
    ReservesWithdrawn {
        asset: AssetId,
        amount: Amount,
        to: Account,
    },
}
