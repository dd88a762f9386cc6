//! # Pricing Oracle
//!
//! Where NAV per share comes from. The engine doesn't value positions
//! itself: a vault's equity depends on whatever it is invested in, and only
//! an external valuation source knows that.
//!
//! A price read may suspend (network, storage). Callers snapshot the value
//! once per operation and never assume two reads agree. A failed read is
//! an [`OracleError`], surfaced to the caller as
//! [`VaultError::OracleUnavailable`](crate::error::VaultError::OracleUnavailable);
//! there is no fallback price.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::types::{SharePrice, VaultId};

/// Reasons a price could not be produced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// The oracle has no price for this vault.
    #[error("no price available for vault {0}")]
    NoPrice(VaultId),

    /// The valuation source could not be reached or read.
    #[error("valuation source unreachable: {0}")]
    Unreachable(String),
}

/// Supplies the current value of one share of a vault, in asset units.
#[async_trait]
pub trait PricingOracle: Send + Sync {
    /// Current NAV per share for `vault`.
    async fn current_price_per_share(&self, vault: &VaultId) -> Result<SharePrice, OracleError>;
}

/// An in-memory oracle with manually set prices.
///
/// Used by the CLI (prices come from the state file) and throughout the
/// tests. A vault with no price set is unavailable, not zero.
#[derive(Default)]
pub struct StaticPriceOracle {
    prices: RwLock<HashMap<VaultId, SharePrice>>,
}

impl StaticPriceOracle {
    /// Creates an oracle with no prices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an oracle preloaded with `prices`.
    pub fn with_prices(prices: impl IntoIterator<Item = (VaultId, SharePrice)>) -> Self {
        Self {
            prices: RwLock::new(prices.into_iter().collect()),
        }
    }

    /// Sets or replaces the price for `vault`.
    pub fn set_price(&self, vault: VaultId, price: SharePrice) {
        self.prices.write().insert(vault, price);
    }

    /// Removes the price for `vault`, making it unavailable.
    pub fn clear_price(&self, vault: &VaultId) {
        self.prices.write().remove(vault);
    }

    /// Returns the price currently set for `vault`, if any.
    pub fn price(&self, vault: &VaultId) -> Option<SharePrice> {
        self.prices.read().get(vault).copied()
    }
}

#[async_trait]
impl PricingOracle for StaticPriceOracle {
    async fn current_price_per_share(&self, vault: &VaultId) -> Result<SharePrice, OracleError> {
        self.price(vault).ok_or(OracleError::NoPrice(*vault))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    #[tokio::test]
    async fn static_oracle_returns_set_price() {
        let vault = Address::derive_vault("oracle");
        let oracle = StaticPriceOracle::new();
        oracle.set_price(vault, SharePrice::ONE);

        assert_eq!(
            oracle.current_price_per_share(&vault).await,
            Ok(SharePrice::ONE)
        );
    }

    #[tokio::test]
    async fn missing_price_is_an_error_not_zero() {
        let vault = Address::derive_vault("oracle");
        let oracle = StaticPriceOracle::new();

        assert_eq!(
            oracle.current_price_per_share(&vault).await,
            Err(OracleError::NoPrice(vault))
        );

        oracle.set_price(vault, SharePrice::ONE);
        oracle.clear_price(&vault);
        assert!(oracle.current_price_per_share(&vault).await.is_err());
    }

    #[test]
    fn preloaded_prices() {
        let a = Address::derive_vault("a");
        let b = Address::derive_vault("b");
        let oracle = StaticPriceOracle::with_prices([
            (a, SharePrice::ONE),
            (b, SharePrice::from_units(3).unwrap()),
        ]);
        assert_eq!(oracle.price(&b), SharePrice::from_units(3));
        assert_eq!(oracle.price(&a), Some(SharePrice::ONE));
    }
}
