//! Price oracle interface and an in-memory price book

use crate::error::{LendingError, Result};
use crate::math::Wad;
use crate::types::AssetId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Reference-unit price of one unit of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: Wad,
    /// Timestamp (seconds) the price was observed at
    pub updated_at: u64,
}

/// Source of asset prices
pub trait PriceOracle: Send + Sync {
    fn price(&self, asset: &AssetId) -> Result<PriceQuote>;
}

impl<T: PriceOracle + ?Sized> PriceOracle for Arc<T> {
    fn price(&self, asset: &AssetId) -> Result<PriceQuote> {
        (**self).price(asset)
    }
}

/// Prices resolved ahead of a ledger operation
///
/// Only validated prices (non-zero, fresh) enter a set, so the ledger never
/// consults the oracle while mutating state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceSet {
    prices: BTreeMap<AssetId, Wad>,
}

impl PriceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch and validate quotes for every asset in `assets`
    pub fn resolve<'a, O>(
        oracle: &O,
        assets: impl IntoIterator<Item = &'a AssetId>,
        now: u64,
        max_age_secs: u64,
    ) -> Result<Self>
    where
        O: PriceOracle + ?Sized,
    {
        let mut set = Self::new();
        for asset in assets {
            let quote = oracle.price(asset)?;
            if now.saturating_sub(quote.updated_at) > max_age_secs {
                return Err(LendingError::Oracle {
                    asset: *asset,
                    reason: format!(
                        "stale price: updated at {}, now {}, max age {}s",
                        quote.updated_at, now, max_age_secs
                    ),
                });
            }
            set.insert(*asset, quote.price)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, asset: AssetId, price: Wad) -> Result<()> {
        if price.is_zero() {
            return Err(LendingError::Oracle {
                asset,
                reason: "zero price".into(),
            });
        }
        self.prices.insert(asset, price);
        Ok(())
    }

    pub fn get(&self, asset: &AssetId) -> Result<Wad> {
        self.prices
            .get(asset)
            .copied()
            .ok_or_else(|| LendingError::Oracle {
                asset: *asset,
                reason: "price not resolved for this operation".into(),
            })
    }

    pub fn contains(&self, asset: &AssetId) -> bool {
        self.prices.contains_key(asset)
    }

    pub fn covers(&self, assets: &BTreeSet<AssetId>) -> bool {
        assets.iter().all(|asset| self.contains(asset))
    }
}

impl FromIterator<(AssetId, Wad)> for PriceSet {
    fn from_iter<I: IntoIterator<Item = (AssetId, Wad)>>(iter: I) -> Self {
        Self {
            prices: iter.into_iter().filter(|(_, p)| !p.is_zero()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Feed {
    latest: Option<PriceQuote>,
    /// Administrator-set price used when no feed value exists
    fallback: Option<Wad>,
}

/// In-memory oracle: pushed feed prices with an admin fallback
#[derive(Debug, Default)]
pub struct PriceBook {
    feeds: RwLock<BTreeMap<AssetId, Feed>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a feed price
    pub fn set_price(&self, asset: AssetId, price: Wad, at: u64) {
        self.feeds.write().entry(asset).or_default().latest = Some(PriceQuote {
            price,
            updated_at: at,
        });
        tracing::debug!(%asset, %price, at, "price updated");
    }

    /// Set the administrator fallback price
    pub fn set_fallback(&self, asset: AssetId, price: Wad) {
        self.feeds.write().entry(asset).or_default().fallback = Some(price);
        tracing::info!(%asset, %price, "fallback price set");
    }

    /// Drop the feed value, leaving only the fallback (if any)
    pub fn clear_price(&self, asset: &AssetId) {
        if let Some(feed) = self.feeds.write().get_mut(asset) {
            feed.latest = None;
        }
    }
}

impl PriceOracle for PriceBook {
    /// Feed price if present, else the fallback stamped `u64::MAX` (never stale)
    fn price(&self, asset: &AssetId) -> Result<PriceQuote> {
        let feeds = self.feeds.read();
        let feed = feeds.get(asset).ok_or_else(|| LendingError::Oracle {
            asset: *asset,
            reason: "no price feed".into(),
        })?;

        match (feed.latest, feed.fallback) {
            (Some(quote), _) => Ok(quote),
            (None, Some(price)) => Ok(PriceQuote {
                price,
                updated_at: u64::MAX,
            }),
            (None, None) => Err(LendingError::Oracle {
                asset: *asset,
                reason: "no price available".into(),
            }),
        }
    }
}
