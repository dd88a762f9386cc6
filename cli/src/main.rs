// Copyright (c) 2026 Sharevault Contributors. MIT License.
// See LICENSE for details.

//! # Sharevault CLI
//!
//! Entry point for the `sharevault` binary. Each invocation loads the state
//! file, rebuilds the engine and its static oracle from it, runs one
//! command, prints the result as JSON, and persists the new state.
//!
//! - `init-vault`       create a vault
//! - `set-price`        set the NAV per share for a vault
//! - `deposit`          deposit assets, mint shares
//! - `manager-withdraw` withdraw as the vault manager
//! - `withdraw`         withdraw as a depositor
//! - `settle`           settle a redeemable request
//! - `cancel`           cancel an active request
//! - `show`             print vault or position state

mod cli;
mod logging;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde_json::{json, Value};

use sharevault_engine::config::{EngineConfig, VaultParams};
use sharevault_engine::{
    Address, StaticPriceOracle, VaultAccountingService, WithdrawOutcome,
};

use cli::{Commands, SharevaultCli};
use store::StateFile;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SharevaultCli::parse();
    logging::init_logging(&cli.log_level, cli.log_format);

    let now = cli.now.unwrap_or_else(Utc::now);
    let mut state = store::load(&cli.state)?;
    let oracle = Arc::new(StaticPriceOracle::with_prices(
        state.prices.iter().map(|(vault, price)| (*vault, *price)),
    ));
    let service = VaultAccountingService::from_snapshot(
        oracle.clone(),
        EngineConfig::default(),
        std::mem::take(&mut state.engine),
    )
    .with_context(|| format!("state file {} is inconsistent", cli.state.display()))?;

    let (output, dirty) = run(&service, &oracle, &mut state, cli.command, now).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    if dirty {
        state.engine = service.snapshot().await;
        store::save(&cli.state, &state)?;
    }
    Ok(())
}

/// Executes one command. Returns the JSON to print and whether state
/// changed.
async fn run(
    service: &VaultAccountingService,
    oracle: &StaticPriceOracle,
    state: &mut StateFile,
    command: Commands,
    now: DateTime<Utc>,
) -> Result<(Value, bool)> {
    match command {
        Commands::InitVault(args) => {
            let id = Address::derive_vault(&args.name);
            let mut params = VaultParams::default()
                .with_redeem_period(args.redeem_period)
                .with_initial_share_price(args.initial_price.raw())
                .with_payout_policy(args.payout_policy.into());
            if let Some(window) = args.expiry_window {
                params = params.with_expiry_window(window);
            }
            let vault = service
                .create_vault(id, args.manager, params, now)
                .await
                .with_context(|| format!("failed to create vault {}", args.name))?;
            state.prices.entry(id).or_insert(args.initial_price);
            Ok((json!({ "name": args.name, "vault": vault }), true))
        }

        Commands::SetPrice(args) => {
            service.vault(&args.vault_address)?;
            oracle.set_price(args.vault_address, args.price);
            state.prices.insert(args.vault_address, args.price);
            Ok((
                json!({ "vault": args.vault_address, "price": args.price.to_string() }),
                true,
            ))
        }

        Commands::Deposit(args) => {
            let shares = service
                .deposit(&args.vault_address, &args.principal, args.amount, now)
                .await?;
            Ok((
                json!({
                    "principal": args.principal,
                    "assets": args.amount,
                    "shares_minted": shares,
                    "shares_held": service.balance_of(&args.vault_address, &args.principal),
                }),
                true,
            ))
        }

        Commands::ManagerWithdraw(args) => {
            let outcome = service
                .manager_withdraw(&args.vault_address, &args.principal, args.amount, args.unit, now)
                .await?;
            Ok((outcome_json(&outcome, now), true))
        }

        Commands::Withdraw(args) => {
            let outcome = service
                .depositor_withdraw(&args.vault_address, &args.principal, args.amount, args.unit, now)
                .await?;
            Ok((outcome_json(&outcome, now), true))
        }

        Commands::Settle(args) => {
            let assets = service
                .settle_withdrawal(&args.vault_address, &args.principal, now)
                .await?;
            Ok((
                json!({
                    "principal": args.principal,
                    "assets_out": assets,
                    "shares_held": service.balance_of(&args.vault_address, &args.principal),
                }),
                true,
            ))
        }

        Commands::Cancel(args) => {
            let request = service
                .cancel_withdrawal(&args.vault_address, &args.principal, now)
                .await?;
            Ok((
                json!({ "request": request, "status": request.status(now) }),
                true,
            ))
        }

        Commands::Show(args) => {
            let vault = service.vault(&args.vault_address)?;
            let output = match args.principal {
                Some(principal) => {
                    let request = service.withdrawal_request(&args.vault_address, &principal);
                    json!({
                        "vault": args.vault_address,
                        "principal": principal,
                        "position": service.position_of(&args.vault_address, &principal),
                        "withdrawal": request.as_ref().map(|r| json!({
                            "request": r,
                            "status": r.status(now),
                        })),
                    })
                }
                None => json!({
                    "vault": vault,
                    "share_price": vault.share_price()?.to_string(),
                    "oracle_price": oracle.price(&args.vault_address).map(|p| p.to_string()),
                    "positions": service
                        .principals(&args.vault_address)?
                        .into_iter()
                        .map(|(p, b)| json!({ "principal": p, "balance": b }))
                        .collect::<Vec<_>>(),
                    "withdrawals": service
                        .withdrawal_requests(&args.vault_address)
                        .into_iter()
                        .map(|r| json!({ "status": r.status(now), "request": r }))
                        .collect::<Vec<_>>(),
                }),
            };
            Ok((output, false))
        }
    }
}

fn outcome_json(outcome: &WithdrawOutcome, now: DateTime<Utc>) -> Value {
    let kind = match outcome {
        WithdrawOutcome::Settled { .. } => "settled",
        WithdrawOutcome::Requested(_) => "requested",
        WithdrawOutcome::Outstanding(_) => "outstanding",
    };
    let request = outcome.request();
    json!({
        "outcome": kind,
        "assets_out": outcome.assets(),
        "status": request.status(now),
        "request": request,
    })
}
