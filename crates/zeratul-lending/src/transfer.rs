//! Asset custody interface and an in-memory custody implementation

use crate::error::{LendingError, Result};
use crate::types::{Amount, AssetId, UserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Holder of funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Account {
    User(UserId),
    /// The lending pool itself
    Pool,
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Account::User(user) => write!(f, "user:{}", user),
            Account::Pool => f.write_str("pool"),
        }
    }
}

/// One movement of funds settled after a ledger operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub asset: AssetId,
    pub from: Account,
    pub to: Account,
    pub amount: Amount,
}

impl Transfer {
    /// The transfer that undoes this one
    pub fn reversed(&self) -> Self {
        Self {
            asset: self.asset,
            from: self.to,
            to: self.from,
            amount: self.amount,
        }
    }
}

/// Moves assets between accounts
pub trait AssetTransfer: Send + Sync {
    fn transfer(&self, transfer: &Transfer) -> Result<()>;
}

impl<T: AssetTransfer + ?Sized> AssetTransfer for Arc<T> {
    fn transfer(&self, transfer: &Transfer) -> Result<()> {
        (**self).transfer(transfer)
    }
}

/// In-memory balances per (account, asset)
#[derive(Debug, Default)]
pub struct Custody {
    balances: Mutex<HashMap<(Account, AssetId), Amount>>,
}

impl Custody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an account out of thin air (test/scenario funding)
    pub fn mint(&self, account: Account, asset: AssetId, amount: Amount) -> Result<()> {
        let mut balances = self.balances.lock();
        let balance = balances.entry((account, asset)).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or(LendingError::Arithmetic("custody balance overflow"))?;
        Ok(())
    }

    pub fn balance(&self, account: Account, asset: AssetId) -> Amount {
        self.balances
            .lock()
            .get(&(account, asset))
            .copied()
            .unwrap_or(0)
    }
}

impl AssetTransfer for Custody {
    fn transfer(&self, transfer: &Transfer) -> Result<()> {
        if transfer.from == transfer.to {
            return Err(LendingError::Transfer(format!(
                "self transfer on {}",
                transfer.from
            )));
        }
        let mut balances = self.balances.lock();

        let from = balances
            .get(&(transfer.from, transfer.asset))
            .copied()
            .unwrap_or(0);
        if from < transfer.amount {
            return Err(LendingError::Transfer(format!(
                "{} holds {} of {}, cannot send {}",
                transfer.from, from, transfer.asset, transfer.amount
            )));
        }
        let to = balances
            .get(&(transfer.to, transfer.asset))
            .copied()
            .unwrap_or(0)
            .checked_add(transfer.amount)
            .ok_or(LendingError::Arithmetic("custody balance overflow"))?;

        balances.insert((transfer.from, transfer.asset), from - transfer.amount);
        balances.insert((transfer.to, transfer.asset), to);
        Ok(())
    }
}
