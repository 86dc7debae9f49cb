//! Identifiers and unit aliases

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Amount of an underlying asset, in its smallest unit
pub type Amount = u128;

/// Share units (claims on a pool, scaled by the market index)
pub type Shares = u128;

/// Basis points (10_000 = 100%)
pub type Bps = u32;

/// Asset identifier
///
/// Ordered by raw bytes; multi-market operations walk assets in this order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId(pub [u8; 32]);

impl AssetId {
    /// Derive an asset id from a ticker symbol
    pub fn from_symbol(symbol: &str) -> Self {
        Self(tagged_hash(b"zeratul-lending/asset", symbol.as_bytes()))
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// User (account owner) identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub [u8; 32]);

impl UserId {
    /// Derive a user id from a human readable name
    pub fn from_name(name: &str) -> Self {
        Self(tagged_hash(b"zeratul-lending/user", name.as_bytes()))
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

fn tagged_hash(tag: &[u8], data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update(data);
    hasher.finalize().into()
}
