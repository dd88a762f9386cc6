//! # CLI Interface
//!
//! Defines the command-line argument structure for `sharevault` using
//! `clap` derive. Every command loads the state file, applies one engine
//! operation, prints the result as JSON on stdout, and writes the state
//! back if anything changed.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use sharevault_engine::config::PayoutPolicy;
use sharevault_engine::{Address, SharePrice, WithdrawUnit};

/// Pooled vault share accounting.
///
/// Tracks deposits as shares, prices them through a per-vault NAV, and
/// runs withdrawals through a request / cooldown / settle lifecycle.
#[derive(Parser, Debug)]
#[command(
    name = "sharevault",
    about = "Pooled vault share accounting",
    version,
    propagate_version = true
)]
pub struct SharevaultCli {
    /// Path to the JSON state file. Created on first write.
    #[arg(long, global = true, env = "SHAREVAULT_STATE", default_value = "sharevault-state.json")]
    pub state: PathBuf,

    /// Evaluate the command at this instant (RFC 3339) instead of now.
    #[arg(long, global = true, env = "SHAREVAULT_NOW")]
    pub now: Option<DateTime<Utc>>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, env = "SHAREVAULT_LOG", default_value = "warn")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a vault. Its address is derived from the name.
    InitVault(InitVaultArgs),
    /// Set the NAV per share the oracle reports for a vault.
    SetPrice(SetPriceArgs),
    /// Deposit assets and mint shares.
    Deposit(DepositArgs),
    /// Withdraw as the vault manager.
    ManagerWithdraw(WithdrawArgs),
    /// Withdraw as a depositor.
    Withdraw(WithdrawArgs),
    /// Settle a redeemable withdrawal request.
    Settle(RequestArgs),
    /// Cancel a pending or redeemable withdrawal request.
    Cancel(RequestArgs),
    /// Show a vault, or one principal's position in it.
    Show(ShowArgs),
}

/// Arguments for `init-vault`.
#[derive(Parser, Debug)]
pub struct InitVaultArgs {
    /// Human-readable vault name.
    #[arg(long)]
    pub name: String,

    /// Manager address (base58).
    #[arg(long)]
    pub manager: Address,

    /// Withdrawal cooldown in seconds.
    #[arg(long, default_value_t = 0)]
    pub redeem_period: u64,

    /// Seconds a redeemable request stays redeemable. Unset means forever.
    #[arg(long)]
    pub expiry_window: Option<u64>,

    /// Share price while the vault is empty.
    #[arg(long, default_value = "1")]
    pub initial_price: SharePrice,

    /// How settlement payouts are computed.
    #[arg(long, value_enum, default_value_t = PayoutPolicyArg::SettlementPrice)]
    pub payout_policy: PayoutPolicyArg,
}

/// Arguments for `set-price`.
#[derive(Parser, Debug)]
pub struct SetPriceArgs {
    /// Vault address (base58).
    #[arg(long)]
    pub vault_address: Address,

    /// NAV per share, decimal.
    #[arg(long)]
    pub price: SharePrice,
}

/// Arguments for `deposit`.
#[derive(Parser, Debug)]
pub struct DepositArgs {
    /// Vault address (base58).
    #[arg(long)]
    pub vault_address: Address,

    /// Depositor address (base58).
    #[arg(long)]
    pub principal: Address,

    /// Assets to deposit, smallest units.
    #[arg(long)]
    pub amount: u64,
}

/// Arguments for `withdraw` and `manager-withdraw`.
#[derive(Parser, Debug)]
pub struct WithdrawArgs {
    /// Vault address (base58).
    #[arg(long)]
    pub vault_address: Address,

    /// Withdrawing principal (base58). For `manager-withdraw`, the manager.
    #[arg(long, alias = "manager")]
    pub principal: Address,

    /// Amount to withdraw, in `--unit`.
    #[arg(long)]
    pub amount: u64,

    /// Unit of `--amount`: shares or token.
    #[arg(long, default_value = "shares")]
    pub unit: WithdrawUnit,
}

/// Arguments for `settle` and `cancel`.
#[derive(Parser, Debug)]
pub struct RequestArgs {
    /// Vault address (base58).
    #[arg(long)]
    pub vault_address: Address,

    /// Requesting principal (base58).
    #[arg(long)]
    pub principal: Address,
}

/// Arguments for `show`.
#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Vault address (base58).
    #[arg(long)]
    pub vault_address: Address,

    /// Limit output to this principal.
    #[arg(long)]
    pub principal: Option<Address>,
}

/// Payout policy as accepted on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PayoutPolicyArg {
    /// Pay the settlement-time value.
    SettlementPrice,
    /// Pay the lesser of request-time and settlement-time value.
    LesserOf,
}

impl From<PayoutPolicyArg> for PayoutPolicy {
    fn from(arg: PayoutPolicyArg) -> Self {
        match arg {
            PayoutPolicyArg::SettlementPrice => PayoutPolicy::SettlementPrice,
            PayoutPolicyArg::LesserOf => PayoutPolicy::LesserOfRequestAndSettlement,
        }
    }
}

/// Log format as accepted on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable.
    Pretty,
    /// JSON lines.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        SharevaultCli::command().debug_assert();
    }

    #[test]
    fn manager_withdraw_accepts_manager_flag() {
        let manager = Address::new([7; 32]).to_base58();
        let vault = Address::derive_vault("cli").to_base58();
        let cli = SharevaultCli::try_parse_from([
            "sharevault",
            "manager-withdraw",
            "--vault-address",
            &vault,
            "--manager",
            &manager,
            "--amount",
            "10",
            "--unit",
            "TOKEN",
        ])
        .unwrap();

        match cli.command {
            Commands::ManagerWithdraw(args) => {
                assert_eq!(args.principal, Address::new([7; 32]));
                assert_eq!(args.unit, WithdrawUnit::Token);
                assert_eq!(args.amount, 10);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn bad_address_is_rejected() {
        let result = SharevaultCli::try_parse_from([
            "sharevault",
            "deposit",
            "--vault-address",
            "not-base58-0OIl",
            "--principal",
            "x",
            "--amount",
            "1",
        ]);
        assert!(result.is_err());
    }
}
