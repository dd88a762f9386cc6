//! # Vault Accounting Service
//!
//! The façade front-ends call. It owns the [`ShareLedger`] and the
//! [`WithdrawalRequestManager`], consults the [`PricingOracle`], and makes
//! each operation atomic with respect to every other operation on the same
//! vault.
//!
//! ## Per-Vault Exclusive Section
//!
//! Every mutating operation takes the vault's async mutex and holds it for
//! the whole operation, oracle read included:
//!
//! ```text
//! lock(vault) ─► check preconditions ─► read price once ─► mark ledger
//!             ─► convert + commit ─► emit record ─► unlock
//! ```
//!
//! The price is read exactly once per operation and treated as
//! authoritative for it. Holding the section across the oracle await trades
//! throughput for a conversion and commit that no concurrent mutation can
//! split. Different vaults never contend.
//!
//! Reads (`balance_of`, `vault`, `withdrawal_request`) skip the section;
//! the ledger's book lock already gives them a consistent picture.
//!
//! ## Oracle Use
//!
//! A vault with no shares outstanding has no NAV to ask about; its
//! conversions use the configured initial price and the oracle is not
//! consulted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, PayoutPolicy, VaultParams};
use crate::error::VaultError;
use crate::events::{VaultAction, VaultRecord};
use crate::ledger::{PrincipalBalance, ShareLedger, Vault};
use crate::metrics::VaultMetrics;
use crate::oracle::PricingOracle;
use crate::snapshot::{EngineSnapshot, SNAPSHOT_VERSION};
use crate::types::{Principal, VaultId, WithdrawUnit};
use crate::withdrawal::{WithdrawalRequest, WithdrawalRequestManager, WithdrawalStatus};

// ---------------------------------------------------------------------------
// WithdrawOutcome
// ---------------------------------------------------------------------------

/// Result of a withdraw call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WithdrawOutcome {
    /// The vault has no cooldown: the request was filed and settled in one
    /// step.
    Settled {
        /// The settled request.
        request: WithdrawalRequest,
        /// Assets paid out.
        assets: u64,
    },
    /// A new request was filed and is waiting out the cooldown.
    Requested(WithdrawalRequest),
    /// An active request already existed; nothing changed. Settle or
    /// cancel it explicitly.
    Outstanding(WithdrawalRequest),
}

impl WithdrawOutcome {
    /// The request this outcome is about.
    pub fn request(&self) -> &WithdrawalRequest {
        match self {
            WithdrawOutcome::Settled { request, .. } => request,
            WithdrawOutcome::Requested(request) => request,
            WithdrawOutcome::Outstanding(request) => request,
        }
    }

    /// Assets paid out, if the withdrawal settled.
    pub fn assets(&self) -> Option<u64> {
        match self {
            WithdrawOutcome::Settled { assets, .. } => Some(*assets),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// VaultAccountingService
// ---------------------------------------------------------------------------

/// Coordinates the ledger, the withdrawal manager, and the oracle.
pub struct VaultAccountingService {
    ledger: ShareLedger,
    requests: WithdrawalRequestManager,
    oracle: Arc<dyn PricingOracle>,
    sections: DashMap<VaultId, Arc<Mutex<()>>>,
    events: broadcast::Sender<VaultRecord>,
    metrics: VaultMetrics,
}

/// Principal and vault figures captured around a commit.
struct Position {
    shares: u64,
    total_shares: u64,
    total_assets: u64,
}

impl VaultAccountingService {
    /// Creates a service with no vaults.
    pub fn new(oracle: Arc<dyn PricingOracle>, config: EngineConfig) -> Self {
        Self::with_state(
            oracle,
            config,
            ShareLedger::new(),
            WithdrawalRequestManager::new(),
        )
    }

    /// Rebuilds a service from persisted state.
    ///
    /// # Errors
    ///
    /// [`VaultError::InconsistentState`] if the snapshot fails a
    /// consistency check.
    pub fn from_snapshot(
        oracle: Arc<dyn PricingOracle>,
        config: EngineConfig,
        snapshot: EngineSnapshot,
    ) -> Result<Self, VaultError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(VaultError::InconsistentState(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let ledger = ShareLedger::restore(snapshot.vaults)?;
        for request in &snapshot.requests {
            if !ledger.contains(&request.vault) {
                return Err(VaultError::InconsistentState(format!(
                    "request {} references unknown vault {}",
                    request.id, request.vault
                )));
            }
        }
        let requests =
            WithdrawalRequestManager::restore(snapshot.requests, snapshot.request_history)?;

        info!(vaults = ledger.vault_ids().len(), "engine state restored");
        Ok(Self::with_state(oracle, config, ledger, requests))
    }

    fn with_state(
        oracle: Arc<dyn PricingOracle>,
        config: EngineConfig,
        ledger: ShareLedger,
        requests: WithdrawalRequestManager,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            ledger,
            requests,
            oracle,
            sections: DashMap::new(),
            events,
            metrics: VaultMetrics::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Vault management
    // -----------------------------------------------------------------------

    /// Registers a vault.
    pub async fn create_vault(
        &self,
        id: VaultId,
        manager: Principal,
        params: VaultParams,
        now: DateTime<Utc>,
    ) -> Result<Vault, VaultError> {
        let _section = self.section(&id).await;
        let result = self.ledger.create_vault(id, manager, params, now);
        if let Ok(vault) = &result {
            info!(
                vault = %vault.id,
                manager = %vault.manager,
                redeem_period_secs = vault.params.redeem_period_secs,
                "vault registered"
            );
        }
        self.observe("create_vault", result)
    }

    // -----------------------------------------------------------------------
    // Deposits
    // -----------------------------------------------------------------------

    /// Deposits `asset_amount` for `principal` and returns the shares
    /// minted.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InsufficientAssetAmount`] for zero or dust deposits.
    /// - [`VaultError::VaultInsolvent`] if the vault's equity is zero with
    ///   shares outstanding.
    /// - [`VaultError::OracleUnavailable`] if the price can't be read.
    pub async fn deposit(
        &self,
        vault: &VaultId,
        principal: &Principal,
        asset_amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, VaultError> {
        let _section = self.section(vault).await;
        let result = self.deposit_locked(vault, principal, asset_amount, now).await;
        self.observe("deposit", result)
    }

    async fn deposit_locked(
        &self,
        vault: &VaultId,
        principal: &Principal,
        asset_amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, VaultError> {
        if asset_amount == 0 {
            return Err(VaultError::InsufficientAssetAmount {
                amount: 0,
                shares: 0,
            });
        }
        self.revalue(vault, now).await?;

        let before = self.position(vault, principal)?;
        let shares = self.ledger.mint(vault, principal, asset_amount, now)?;
        let after = self.position(vault, principal)?;

        self.metrics.deposits_total.inc();
        self.metrics.assets_deposited_total.inc_by(asset_amount);
        self.emit(
            now,
            vault,
            principal,
            VaultAction::Deposit,
            None,
            asset_amount,
            &before,
            &after,
        );
        info!(vault = %vault, principal = %principal, assets = asset_amount, shares, "deposit");
        Ok(shares)
    }

    // -----------------------------------------------------------------------
    // Withdrawals
    // -----------------------------------------------------------------------

    /// Withdrawal on behalf of the vault's manager.
    ///
    /// Same flow as [`depositor_withdraw`](Self::depositor_withdraw), but
    /// only the manager may call it. A non-manager gets
    /// [`VaultError::Unauthorized`] and nothing changes.
    pub async fn manager_withdraw(
        &self,
        vault: &VaultId,
        manager: &Principal,
        amount: u64,
        unit: WithdrawUnit,
        now: DateTime<Utc>,
    ) -> Result<WithdrawOutcome, VaultError> {
        let _section = self.section(vault).await;
        let result: Result<WithdrawOutcome, VaultError> = async {
            let record = self.ledger.vault(vault)?;
            if !record.is_manager(manager) {
                warn!(vault = %vault, caller = %manager, "unauthorized manager withdraw");
                return Err(VaultError::Unauthorized {
                    vault: *vault,
                    caller: *manager,
                });
            }
            self.withdraw_locked(vault, manager, amount, unit, true, now)
                .await
        }
        .await;
        self.observe("manager_withdraw", result)
    }

    /// Withdrawal for any share holder.
    ///
    /// With no active request: files one, and if the vault's cooldown is
    /// zero settles it on the spot. With an active request: returns it
    /// untouched as [`WithdrawOutcome::Outstanding`].
    pub async fn depositor_withdraw(
        &self,
        vault: &VaultId,
        principal: &Principal,
        amount: u64,
        unit: WithdrawUnit,
        now: DateTime<Utc>,
    ) -> Result<WithdrawOutcome, VaultError> {
        let _section = self.section(vault).await;
        let result = self
            .withdraw_locked(vault, principal, amount, unit, false, now)
            .await;
        self.observe("depositor_withdraw", result)
    }

    async fn withdraw_locked(
        &self,
        vault: &VaultId,
        principal: &Principal,
        amount: u64,
        unit: WithdrawUnit,
        by_manager: bool,
        now: DateTime<Utc>,
    ) -> Result<WithdrawOutcome, VaultError> {
        let record = self.ledger.vault(vault)?;
        if let Some(existing) = self.requests.active(vault, principal, now) {
            debug!(
                vault = %vault,
                principal = %principal,
                request = %existing.id,
                status = %existing.status(now),
                "withdrawal already outstanding"
            );
            return Ok(WithdrawOutcome::Outstanding(existing));
        }
        if amount == 0 {
            return Err(VaultError::InvalidWithdrawAmount(
                "requested amount is zero".into(),
            ));
        }

        self.revalue(vault, now).await?;

        let position = self.position(vault, principal)?;
        let request = self
            .requests
            .initiate(&self.ledger, vault, principal, unit, amount, now)?;
        self.metrics.withdraw_requests_total.inc();
        self.emit(
            now,
            vault,
            principal,
            VaultAction::WithdrawRequest,
            Some(&request),
            request.requested_value,
            &position,
            &position,
        );

        if record.params.redeem_period_secs != 0 {
            return Ok(WithdrawOutcome::Requested(request));
        }

        let action = if by_manager {
            VaultAction::ManagerWithdraw
        } else {
            VaultAction::Withdraw
        };
        let (request, assets) = self.settle_committed(vault, principal, action, now)?;
        Ok(WithdrawOutcome::Settled { request, assets })
    }

    /// Settles the principal's request and returns the assets paid out.
    ///
    /// # Errors
    ///
    /// - [`VaultError::RequestNotFound`] with no request on record.
    /// - [`VaultError::RequestNotRedeemable`] before the cooldown ends, or
    ///   once the request is closed.
    /// - [`VaultError::OracleUnavailable`] if the price can't be read.
    pub async fn settle_withdrawal(
        &self,
        vault: &VaultId,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<u64, VaultError> {
        let _section = self.section(vault).await;
        let result: Result<u64, VaultError> = async {
            let request =
                self.requests
                    .get(vault, principal)
                    .ok_or(VaultError::RequestNotFound {
                        vault: *vault,
                        principal: *principal,
                    })?;
            let status = request.status(now);
            if status != WithdrawalStatus::Redeemable {
                return Err(VaultError::RequestNotRedeemable {
                    status,
                    earliest_redeemable: request.earliest_redeemable_at,
                });
            }

            self.revalue(vault, now).await?;
            let action = if self.ledger.vault(vault)?.is_manager(principal) {
                VaultAction::ManagerWithdraw
            } else {
                VaultAction::Withdraw
            };
            let (_, assets) = self.settle_committed(vault, principal, action, now)?;
            Ok(assets)
        }
        .await;
        self.observe("settle_withdrawal", result)
    }

    /// Settles with the ledger already marked. Section must be held.
    fn settle_committed(
        &self,
        vault: &VaultId,
        principal: &Principal,
        action: VaultAction,
        now: DateTime<Utc>,
    ) -> Result<(WithdrawalRequest, u64), VaultError> {
        let before = self.position(vault, principal)?;
        let assets = self.requests.settle(&self.ledger, vault, principal, now)?;
        let after = self.position(vault, principal)?;
        let request = self
            .requests
            .get(vault, principal)
            .ok_or(VaultError::InconsistentState(
                "settled request disappeared".into(),
            ))?;

        self.metrics.withdrawals_settled_total.inc();
        self.metrics.assets_withdrawn_total.inc_by(assets);
        self.emit(now, vault, principal, action, Some(&request), assets, &before, &after);
        Ok((request, assets))
    }

    /// Cancels the principal's active request.
    ///
    /// Under [`PayoutPolicy::LesserOfRequestAndSettlement`] the vault is
    /// revalued first and the shares above the request-time value are
    /// forfeited; the record's share delta carries them.
    pub async fn cancel_withdrawal(
        &self,
        vault: &VaultId,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, VaultError> {
        let _section = self.section(vault).await;
        let result: Result<WithdrawalRequest, VaultError> = async {
            let request =
                self.requests
                    .get(vault, principal)
                    .ok_or(VaultError::RequestNotFound {
                        vault: *vault,
                        principal: *principal,
                    })?;
            let status = request.status(now);
            if !status.is_active() {
                return Err(VaultError::RequestNotCancellable(status));
            }

            if self.ledger.vault(vault)?.params.payout_policy
                == PayoutPolicy::LesserOfRequestAndSettlement
            {
                self.revalue(vault, now).await?;
            }

            let before = self.position(vault, principal)?;
            let request = self.requests.cancel(&self.ledger, vault, principal, now)?;
            let after = self.position(vault, principal)?;

            self.metrics.withdraw_cancellations_total.inc();
            self.emit(
                now,
                vault,
                principal,
                VaultAction::CancelWithdrawRequest,
                Some(&request),
                0,
                &before,
                &after,
            );
            Ok(request)
        }
        .await;
        self.observe("cancel_withdrawal", result)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Shares held by `principal`. Zero if unknown.
    pub fn balance_of(&self, vault: &VaultId, principal: &Principal) -> u64 {
        self.ledger.balance_of(vault, principal)
    }

    /// Full position of `principal`, if any.
    pub fn position_of(&self, vault: &VaultId, principal: &Principal) -> Option<PrincipalBalance> {
        self.ledger.principal(vault, principal)
    }

    /// The vault record as of its last mutation or revaluation.
    pub fn vault(&self, vault: &VaultId) -> Result<Vault, VaultError> {
        self.ledger.vault(vault)
    }

    /// Ids of every vault.
    pub fn vault_ids(&self) -> Vec<VaultId> {
        let mut ids = self.ledger.vault_ids();
        ids.sort();
        ids
    }

    /// All positions in a vault.
    pub fn principals(
        &self,
        vault: &VaultId,
    ) -> Result<Vec<(Principal, PrincipalBalance)>, VaultError> {
        self.ledger.principals(vault)
    }

    /// The principal's latest request, whatever its state.
    pub fn withdrawal_request(
        &self,
        vault: &VaultId,
        principal: &Principal,
    ) -> Option<WithdrawalRequest> {
        self.requests.get(vault, principal)
    }

    /// Latest request of every principal in `vault`.
    pub fn withdrawal_requests(&self, vault: &VaultId) -> Vec<WithdrawalRequest> {
        self.requests.requests_for_vault(vault)
    }

    /// Subscribes to audit records. Only records emitted after this call
    /// are received.
    pub fn subscribe(&self) -> broadcast::Receiver<VaultRecord> {
        self.events.subscribe()
    }

    /// Engine metrics.
    pub fn metrics(&self) -> &VaultMetrics {
        &self.metrics
    }

    /// Captures the engine state.
    ///
    /// Takes every vault's section in id order, so the snapshot never
    /// contains half an operation.
    pub async fn snapshot(&self) -> EngineSnapshot {
        let ids = self.vault_ids();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            guards.push(self.section(id).await);
        }

        let (requests, request_history) = self.requests.snapshot();
        EngineSnapshot {
            version: SNAPSHOT_VERSION,
            vaults: self.ledger.snapshot(),
            requests,
            request_history,
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn section(&self, vault: &VaultId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.sections.entry(*vault).or_default().value());
        lock.lock_owned().await
    }

    /// Reads the price once and marks the vault to it. Skipped for a vault
    /// with no shares outstanding.
    async fn revalue(&self, vault: &VaultId, now: DateTime<Utc>) -> Result<(), VaultError> {
        if self.ledger.vault(vault)?.total_shares == 0 {
            return Ok(());
        }

        let price = match self.oracle.current_price_per_share(vault).await {
            Ok(price) => price,
            Err(e) => {
                self.metrics.oracle_failures_total.inc();
                warn!(vault = %vault, error = %e, "price read failed");
                return Err(e.into());
            }
        };
        self.ledger.mark_to_price(vault, price, now)?;
        Ok(())
    }

    fn position(&self, vault: &VaultId, principal: &Principal) -> Result<Position, VaultError> {
        let record = self.ledger.vault(vault)?;
        Ok(Position {
            shares: self.ledger.balance_of(vault, principal),
            total_shares: record.total_shares,
            total_assets: record.total_assets,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        ts: DateTime<Utc>,
        vault: &VaultId,
        principal: &Principal,
        action: VaultAction,
        request: Option<&WithdrawalRequest>,
        amount: u64,
        before: &Position,
        after: &Position,
    ) {
        let record = VaultRecord {
            ts,
            vault: *vault,
            principal: *principal,
            action,
            request_id: request.map(|r| r.id),
            amount,
            unit: request.map(|r| r.unit),
            shares_before: before.shares,
            shares_after: after.shares,
            total_shares_before: before.total_shares,
            total_shares_after: after.total_shares,
            total_assets_before: before.total_assets,
            total_assets_after: after.total_assets,
        };
        // No subscribers is not an error.
        let _ = self.events.send(record);
    }

    fn observe<T>(
        &self,
        operation: &'static str,
        result: Result<T, VaultError>,
    ) -> Result<T, VaultError> {
        if let Err(e) = &result {
            self.metrics.reject(operation);
            debug!(operation, error = %e, "operation rejected");
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::StaticPriceOracle;
    use crate::types::{Address, SharePrice};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn vault_id() -> VaultId {
        Address::derive_vault("service-test")
    }

    fn manager() -> Principal {
        Address::new([0xAA; 32])
    }

    fn alice() -> Principal {
        Address::new([1; 32])
    }

    async fn service(params: VaultParams) -> (VaultAccountingService, Arc<StaticPriceOracle>) {
        let oracle = Arc::new(StaticPriceOracle::new());
        oracle.set_price(vault_id(), SharePrice::ONE);
        let svc = VaultAccountingService::new(oracle.clone(), EngineConfig::default());
        svc.create_vault(vault_id(), manager(), params, t0())
            .await
            .unwrap();
        (svc, oracle)
    }

    #[tokio::test]
    async fn first_deposit_skips_oracle() {
        let oracle = Arc::new(StaticPriceOracle::new());
        let svc = VaultAccountingService::new(oracle, EngineConfig::default());
        svc.create_vault(vault_id(), manager(), VaultParams::default(), t0())
            .await
            .unwrap();

        let shares = svc.deposit(&vault_id(), &alice(), 500, t0()).await.unwrap();
        assert_eq!(shares, 500);
    }

    #[tokio::test]
    async fn deposit_with_oracle_down_fails_cleanly() {
        let (svc, oracle) = service(VaultParams::default()).await;
        svc.deposit(&vault_id(), &alice(), 500, t0()).await.unwrap();
        oracle.clear_price(&vault_id());

        let err = svc.deposit(&vault_id(), &alice(), 500, t0()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(svc.balance_of(&vault_id(), &alice()), 500);
        assert_eq!(svc.metrics().oracle_failures_total.get(), 1);
    }

    #[tokio::test]
    async fn deposit_prices_at_oracle_nav() {
        let (svc, oracle) = service(VaultParams::default()).await;
        svc.deposit(&vault_id(), &alice(), 1_000, t0()).await.unwrap();
        oracle.set_price(vault_id(), SharePrice::from_units(2).unwrap());

        let bob = Address::new([2; 32]);
        let shares = svc.deposit(&vault_id(), &bob, 1_000, t0()).await.unwrap();
        assert_eq!(shares, 500);
        let vault = svc.vault(&vault_id()).unwrap();
        assert_eq!(vault.total_shares, 1_500);
        assert_eq!(vault.total_assets, 3_000);
    }

    #[tokio::test]
    async fn outstanding_request_is_surfaced_not_replaced() {
        let (svc, _) = service(VaultParams::default().with_redeem_period(60)).await;
        svc.deposit(&vault_id(), &alice(), 1_000, t0()).await.unwrap();

        let first = svc
            .depositor_withdraw(&vault_id(), &alice(), 100, WithdrawUnit::Shares, t0())
            .await
            .unwrap();
        assert!(matches!(first, WithdrawOutcome::Requested(_)));

        let second = svc
            .depositor_withdraw(&vault_id(), &alice(), 999, WithdrawUnit::Shares, t0())
            .await
            .unwrap();
        match second {
            WithdrawOutcome::Outstanding(req) => {
                assert_eq!(req.id, first.request().id);
                assert_eq!(req.share_amount, 100);
            }
            other => panic!("expected outstanding, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn records_are_emitted_for_each_commit() {
        let (svc, _) = service(VaultParams::default()).await;
        let mut rx = svc.subscribe();

        svc.deposit(&vault_id(), &alice(), 1_000, t0()).await.unwrap();
        svc.depositor_withdraw(&vault_id(), &alice(), 400, WithdrawUnit::Shares, t0())
            .await
            .unwrap();

        let deposit = rx.recv().await.unwrap();
        assert_eq!(deposit.action, VaultAction::Deposit);
        assert_eq!(deposit.shares_after, 1_000);

        let requested = rx.recv().await.unwrap();
        assert_eq!(requested.action, VaultAction::WithdrawRequest);
        assert_eq!(requested.amount, 400);

        let settled = rx.recv().await.unwrap();
        assert_eq!(settled.action, VaultAction::Withdraw);
        assert_eq!(settled.shares_before, 1_000);
        assert_eq!(settled.shares_after, 600);
        assert_eq!(settled.total_assets_after, 600);
    }

    #[tokio::test]
    async fn cancel_leaves_balances_alone() {
        let (svc, _) = service(VaultParams::default().with_redeem_period(60)).await;
        svc.deposit(&vault_id(), &alice(), 1_000, t0()).await.unwrap();
        svc.depositor_withdraw(&vault_id(), &alice(), 100, WithdrawUnit::Shares, t0())
            .await
            .unwrap();

        let cancelled = svc
            .cancel_withdrawal(&vault_id(), &alice(), t0() + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(
            cancelled.status(t0() + Duration::seconds(5)),
            WithdrawalStatus::Cancelled
        );
        assert_eq!(svc.balance_of(&vault_id(), &alice()), 1_000);
        assert_eq!(svc.vault(&vault_id()).unwrap().total_shares, 1_000);
    }

    #[tokio::test]
    async fn lesser_of_cancel_forfeits_and_records_delta() {
        let params = VaultParams::default()
            .with_redeem_period(60)
            .with_payout_policy(PayoutPolicy::LesserOfRequestAndSettlement);
        let (svc, oracle) = service(params).await;
        svc.deposit(&vault_id(), &manager(), 1_000, t0()).await.unwrap();
        svc.deposit(&vault_id(), &alice(), 1_000, t0()).await.unwrap();
        svc.depositor_withdraw(&vault_id(), &alice(), 1_000, WithdrawUnit::Shares, t0())
            .await
            .unwrap();
        oracle.set_price(vault_id(), "1.5".parse().unwrap());
        let mut rx = svc.subscribe();

        svc.cancel_withdrawal(&vault_id(), &alice(), t0() + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(svc.balance_of(&vault_id(), &alice()), 666);
        assert_eq!(svc.balance_of(&vault_id(), &manager()), 1_000);

        let record = rx.recv().await.unwrap();
        assert_eq!(record.action, VaultAction::CancelWithdrawRequest);
        assert_eq!(record.amount, 0);
        assert_eq!(record.share_delta(), -334);
        assert_eq!(record.total_shares_after, 1_666);
        assert_eq!(record.total_assets_after, 3_000);
    }

    #[tokio::test]
    async fn lesser_of_cancel_with_oracle_down_keeps_request_open() {
        let params = VaultParams::default()
            .with_redeem_period(60)
            .with_payout_policy(PayoutPolicy::LesserOfRequestAndSettlement);
        let (svc, oracle) = service(params).await;
        svc.deposit(&vault_id(), &alice(), 1_000, t0()).await.unwrap();
        svc.depositor_withdraw(&vault_id(), &alice(), 100, WithdrawUnit::Shares, t0())
            .await
            .unwrap();
        oracle.clear_price(&vault_id());

        let err = svc
            .cancel_withdrawal(&vault_id(), &alice(), t0())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let request = svc.withdrawal_request(&vault_id(), &alice()).unwrap();
        assert_eq!(request.status(t0()), WithdrawalStatus::Pending);
        assert_eq!(svc.balance_of(&vault_id(), &alice()), 1_000);
    }

    #[tokio::test]
    async fn create_vault_rejects_unrepresentable_expiry_window() {
        let oracle = Arc::new(StaticPriceOracle::new());
        let svc = VaultAccountingService::new(oracle, EngineConfig::default());
        let err = svc
            .create_vault(
                vault_id(),
                manager(),
                VaultParams::default().with_expiry_window(u64::MAX),
                t0(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidVaultParams(_)));
        assert!(svc.vault(&vault_id()).is_err());
    }

    #[tokio::test]
    async fn settle_before_cooldown_does_not_touch_oracle() {
        let (svc, oracle) = service(VaultParams::default().with_redeem_period(60)).await;
        svc.deposit(&vault_id(), &alice(), 1_000, t0()).await.unwrap();
        svc.depositor_withdraw(&vault_id(), &alice(), 100, WithdrawUnit::Shares, t0())
            .await
            .unwrap();
        oracle.clear_price(&vault_id());

        let err = svc
            .settle_withdrawal(&vault_id(), &alice(), t0() + Duration::seconds(59))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::RequestNotRedeemable { .. }));
        assert_eq!(svc.metrics().oracle_failures_total.get(), 0);
    }

    #[tokio::test]
    async fn rejections_are_counted() {
        let (svc, _) = service(VaultParams::default()).await;
        let _ = svc.deposit(&vault_id(), &alice(), 0, t0()).await;

        let text = svc.metrics().encode().unwrap();
        assert!(text.contains("sharevault_rejections_total{operation=\"deposit\"} 1"));
    }

    #[tokio::test]
    async fn snapshot_roundtrip_through_service() {
        let (svc, oracle) = service(VaultParams::default().with_redeem_period(60)).await;
        svc.deposit(&vault_id(), &alice(), 1_000, t0()).await.unwrap();
        svc.depositor_withdraw(&vault_id(), &alice(), 100, WithdrawUnit::Shares, t0())
            .await
            .unwrap();

        let json = serde_json::to_string(&svc.snapshot().await).unwrap();
        let snapshot: EngineSnapshot = serde_json::from_str(&json).unwrap();
        let restored =
            VaultAccountingService::from_snapshot(oracle, EngineConfig::default(), snapshot)
                .unwrap();

        assert_eq!(restored.balance_of(&vault_id(), &alice()), 1_000);
        let assets = restored
            .settle_withdrawal(&vault_id(), &alice(), t0() + Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(assets, 100);
    }

    #[tokio::test]
    async fn snapshot_with_dangling_request_rejected() {
        let (svc, oracle) = service(VaultParams::default().with_redeem_period(60)).await;
        svc.deposit(&vault_id(), &alice(), 1_000, t0()).await.unwrap();
        svc.depositor_withdraw(&vault_id(), &alice(), 100, WithdrawUnit::Shares, t0())
            .await
            .unwrap();

        let mut snapshot = svc.snapshot().await;
        snapshot.vaults.clear();
        assert!(matches!(
            VaultAccountingService::from_snapshot(oracle, EngineConfig::default(), snapshot),
            Err(VaultError::InconsistentState(_))
        ));
    }
}
