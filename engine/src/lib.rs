// Copyright (c) 2026 Sharevault Contributors. MIT License.
// See LICENSE for details.

//! # Sharevault Engine: Pooled Vault Accounting
//!
//! A vault pools capital from many depositors and tracks each depositor's
//! stake as fungible **shares**. The value of one share (NAV per share) moves
//! with the vault's equity; depositors enter by minting shares at the
//! prevailing price and leave by burning them, usually after a cooldown.
//!
//! This crate is the accounting core. It does not sign transactions, talk to
//! a chain, or print anything. Front-ends (the `sharevault` CLI, an HTTP
//! handler, a scheduled job) hand it a vault id, a principal, an amount, a
//! unit, and the current time, and get back typed results.
//!
//! ## Architecture
//!
//! - **config**: Precision constants and per-vault parameters.
//! - **types**: Addresses, units, and the fixed-point share price.
//! - **math**: Checked multiply-divide with explicit rounding direction.
//! - **ledger**: [`ShareLedger`]: vault totals and per-principal balances.
//! - **oracle**: [`PricingOracle`]: where NAV per share comes from.
//! - **withdrawal**: [`WithdrawalRequestManager`]: the request state machine.
//! - **service**: [`VaultAccountingService`]: the façade callers use.
//! - **events**: Audit records emitted on every committed mutation.
//! - **metrics**: Prometheus counters for engine activity.
//! - **snapshot**: Serializable engine state for persistence.
//!
//! ## Ground Rules
//!
//! 1. All amounts are `u64` in smallest units. Prices are fixed point.
//!    Floating point never touches a balance.
//! 2. Rounding always favours the vault: mint rounds shares down, burn
//!    rounds assets down.
//! 3. Time is an input. Nothing in here reads the wall clock to make a
//!    decision.
//! 4. One mutation per vault at a time. Reads never see half a commit.

pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod math;
pub mod metrics;
pub mod oracle;
pub mod service;
pub mod snapshot;
pub mod types;
pub mod withdrawal;

pub use error::VaultError;
pub use events::{VaultAction, VaultRecord};
pub use ledger::{PrincipalBalance, ShareLedger, Vault};
pub use oracle::{OracleError, PricingOracle, StaticPriceOracle};
pub use service::{VaultAccountingService, WithdrawOutcome};
pub use snapshot::EngineSnapshot;
pub use types::{Address, Principal, SharePrice, VaultId, WithdrawUnit};
pub use withdrawal::{RequestState, WithdrawalRequest, WithdrawalRequestManager, WithdrawalStatus};
