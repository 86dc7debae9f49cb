//! Per-user share balances
//!
//! Positions hold shares, never underlying amounts. The underlying value is
//! always derived from the market's current index, so a position does not
//! need to be touched when interest accrues.

use crate::math::Wad;
use crate::types::{Amount, AssetId, Shares, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A user's stake in one market
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPosition {
    pub deposit_shares: Shares,
    pub borrow_shares: Shares,
    /// Index at the last user-level touch (informational)
    pub deposit_index_snapshot: Wad,
    pub borrow_index_snapshot: Wad,
    /// Whether the deposit counts toward borrowing power
    pub is_collateral: bool,
}

impl Default for UserPosition {
    fn default() -> Self {
        Self {
            deposit_shares: 0,
            borrow_shares: 0,
            deposit_index_snapshot: Wad::ONE,
            borrow_index_snapshot: Wad::ONE,
            is_collateral: false,
        }
    }
}

impl UserPosition {
    pub fn is_empty(&self) -> bool {
        self.deposit_shares == 0 && self.borrow_shares == 0
    }

    pub fn has_debt(&self) -> bool {
        self.borrow_shares > 0
    }

    /// Whether the position enters the user's health factor
    pub fn affects_health(&self) -> bool {
        (self.is_collateral && self.deposit_shares > 0) || self.has_debt()
    }
}

/// Assets in which a user holds a live position
///
/// Bounds health-factor evaluation to the markets the user is actually in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMarketSet(BTreeSet<AssetId>);

impl UserMarketSet {
    pub fn contains(&self, asset: &AssetId) -> bool {
        self.0.contains(asset)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssetId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn enter(&mut self, asset: AssetId) {
        self.0.insert(asset);
    }

    fn exit(&mut self, asset: &AssetId) {
        self.0.remove(asset);
    }
}

/// Underlying view of a position at current indices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionView {
    pub asset: AssetId,
    pub deposit_shares: Shares,
    pub borrow_shares: Shares,
    pub deposit_balance: Amount,
    pub debt_balance: Amount,
    pub is_collateral: bool,
}

/// All positions and per-user market sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionBook {
    positions: BTreeMap<(UserId, AssetId), UserPosition>,
    market_sets: BTreeMap<UserId, UserMarketSet>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user: &UserId, asset: &AssetId) -> Option<&UserPosition> {
        self.positions.get(&(*user, *asset))
    }

    pub fn get_mut(&mut self, user: &UserId, asset: &AssetId) -> Option<&mut UserPosition> {
        self.positions.get_mut(&(*user, *asset))
    }

    /// Position for `(user, asset)`, created (and the market entered) if absent
    pub fn entry(&mut self, user: UserId, asset: AssetId) -> &mut UserPosition {
        self.market_sets.entry(user).or_default().enter(asset);
        self.positions.entry((user, asset)).or_default()
    }

    /// Drop the position if both share balances are zero
    ///
    /// Returns true if the position was removed.
    pub fn prune(&mut self, user: &UserId, asset: &AssetId) -> bool {
        let empty = self
            .positions
            .get(&(*user, *asset))
            .map_or(false, UserPosition::is_empty);
        if !empty {
            return false;
        }

        self.positions.remove(&(*user, *asset));
        if let Some(set) = self.market_sets.get_mut(user) {
            set.exit(asset);
            if set.is_empty() {
                self.market_sets.remove(user);
            }
        }
        true
    }

    /// Markets the user holds positions in (empty set if none)
    pub fn markets_of(&self, user: &UserId) -> Vec<AssetId> {
        self.market_sets
            .get(user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn market_set(&self, user: &UserId) -> Option<&UserMarketSet> {
        self.market_sets.get(user)
    }

    /// Whether the user owes anything in any market
    pub fn has_any_debt(&self, user: &UserId) -> bool {
        self.markets_of(user)
            .iter()
            .filter_map(|asset| self.get(user, asset))
            .any(UserPosition::has_debt)
    }

    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.market_sets.keys()
    }

    pub(crate) fn snapshot(&self, user: &UserId, asset: &AssetId) -> Option<UserPosition> {
        self.get(user, asset).cloned()
    }

    pub(crate) fn snapshot_set(&self, user: &UserId) -> Option<UserMarketSet> {
        self.market_sets.get(user).cloned()
    }

    pub(crate) fn restore(&mut self, user: UserId, asset: AssetId, position: Option<UserPosition>) {
        match position {
            Some(position) => {
                self.positions.insert((user, asset), position);
            }
            None => {
                self.positions.remove(&(user, asset));
            }
        }
    }

    pub(crate) fn restore_set(&mut self, user: UserId, set: Option<UserMarketSet>) {
        match set {
            Some(set) => {
                self.market_sets.insert(user, set);
            }
            None => {
                self.market_sets.remove(&user);
            }
        }
    }
}
