//! # Engine Configuration & Constants
//!
//! Every magic number in the engine lives here. Precision constants are
//! part of the persisted state format: changing them after vaults exist
//! reprices every share on record, so don't.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Fixed-point Precision
// ---------------------------------------------------------------------------

/// Number of decimal places in a [`SharePrice`](crate::types::SharePrice).
pub const PRICE_DECIMALS: u32 = 9;

/// Scale factor for share prices. A raw price of `PRICE_PRECISION` means
/// one share is worth exactly one smallest asset unit.
pub const PRICE_PRECISION: u64 = 1_000_000_000;

/// Price used to mint the first shares of an empty vault when the vault
/// doesn't configure its own. 1.0 asset unit per share.
pub const DEFAULT_INITIAL_SHARE_PRICE: u64 = PRICE_PRECISION;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Default redemption cooldown: none. Vaults that want a waiting period
/// must opt in.
pub const DEFAULT_REDEEM_PERIOD_SECS: u64 = 0;

/// Upper bound on the redemption cooldown. Ninety days is already longer
/// than any depositor will tolerate.
pub const MAX_REDEEM_PERIOD_SECS: u64 = 90 * 24 * 60 * 60;

/// Upper bound on how long a redeemable request stays redeemable.
pub const MAX_EXPIRY_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Closed requests kept per (vault, principal) once newer requests replace
/// them. Older ones are dropped.
pub const MAX_REQUEST_HISTORY_PER_PRINCIPAL: usize = 16;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Capacity of the audit record broadcast channel. Slow subscribers lag
/// and skip records rather than block a commit.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Namespace prefix for every Prometheus metric the engine registers.
pub const METRICS_NAMESPACE: &str = "sharevault";

// ---------------------------------------------------------------------------
// Payout Policy
// ---------------------------------------------------------------------------

/// How the asset payout of a settled withdrawal is determined.
///
/// Only the share amount of a request is snapshotted at request time. What
/// those shares are worth at settlement is a policy decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutPolicy {
    /// Pay what the shares are worth at settlement. Depositors carry price
    /// drift during the cooldown, in both directions.
    #[default]
    SettlementPrice,

    /// Pay the lesser of the settlement-time value and the value quoted at
    /// request time. Gains during the cooldown stay in the vault.
    LesserOfRequestAndSettlement,
}

// ---------------------------------------------------------------------------
// Vault Parameters
// ---------------------------------------------------------------------------

/// Per-vault configuration fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultParams {
    /// Seconds between a withdrawal request and its earliest settlement.
    pub redeem_period_secs: u64,

    /// Seconds a redeemable request stays redeemable before it expires.
    /// `None` means requests never expire.
    pub expiry_window_secs: Option<u64>,

    /// Raw price (scaled by [`PRICE_PRECISION`]) used to mint shares while
    /// the vault has none outstanding.
    pub initial_share_price: u64,

    /// Payout rule applied on settlement.
    pub payout_policy: PayoutPolicy,
}

impl Default for VaultParams {
    fn default() -> Self {
        Self {
            redeem_period_secs: DEFAULT_REDEEM_PERIOD_SECS,
            expiry_window_secs: None,
            initial_share_price: DEFAULT_INITIAL_SHARE_PRICE,
            payout_policy: PayoutPolicy::default(),
        }
    }
}

impl VaultParams {
    /// Sets the redemption cooldown.
    pub fn with_redeem_period(mut self, secs: u64) -> Self {
        self.redeem_period_secs = secs;
        self
    }

    /// Sets the expiry window for redeemable requests.
    pub fn with_expiry_window(mut self, secs: u64) -> Self {
        self.expiry_window_secs = Some(secs);
        self
    }

    /// Sets the initial share price (raw, scaled by [`PRICE_PRECISION`]).
    pub fn with_initial_share_price(mut self, raw: u64) -> Self {
        self.initial_share_price = raw;
        self
    }

    /// Sets the payout policy.
    pub fn with_payout_policy(mut self, policy: PayoutPolicy) -> Self {
        self.payout_policy = policy;
        self
    }

    /// Returns a description of the first invalid field, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.redeem_period_secs > MAX_REDEEM_PERIOD_SECS {
            return Err(format!(
                "redeem period {}s exceeds maximum {}s",
                self.redeem_period_secs, MAX_REDEEM_PERIOD_SECS
            ));
        }
        if self.initial_share_price == 0 {
            return Err("initial share price must be non-zero".into());
        }
        match self.expiry_window_secs {
            Some(0) => return Err("expiry window must be non-zero when set".into()),
            Some(secs) if secs > MAX_EXPIRY_WINDOW_SECS => {
                return Err(format!(
                    "expiry window {secs}s exceeds maximum {MAX_EXPIRY_WINDOW_SECS}s"
                ))
            }
            _ => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine Configuration
// ---------------------------------------------------------------------------

/// Engine-wide tunables for [`VaultAccountingService`](crate::service::VaultAccountingService).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the audit record broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_matches_decimals() {
        assert_eq!(10u64.pow(PRICE_DECIMALS), PRICE_PRECISION);
    }

    #[test]
    fn test_default_params_are_valid() {
        assert!(VaultParams::default().validate().is_ok());
        assert_eq!(
            VaultParams::default().payout_policy,
            PayoutPolicy::SettlementPrice
        );
    }

    #[test]
    fn test_redeem_period_cap() {
        let params = VaultParams::default().with_redeem_period(MAX_REDEEM_PERIOD_SECS + 1);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_zero_initial_price_rejected() {
        let params = VaultParams::default().with_initial_share_price(0);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_expiry_window_cap() {
        assert!(VaultParams::default()
            .with_expiry_window(MAX_EXPIRY_WINDOW_SECS)
            .validate()
            .is_ok());
        for secs in [MAX_EXPIRY_WINDOW_SECS + 1, 10_000_000_000_000_000, u64::MAX] {
            let params = VaultParams::default().with_expiry_window(secs);
            assert!(params.validate().is_err(), "{secs}s accepted");
        }
    }

    #[test]
    fn test_zero_expiry_rejected() {
        let params = VaultParams::default().with_expiry_window(0);
        assert!(params.validate().is_err());
    }
}
