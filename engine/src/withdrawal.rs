//! # Withdrawal Requests
//!
//! A withdrawal is a two-step affair: a principal files a request, waits
//! out the vault's cooldown, then settles it. The [`WithdrawalRequestManager`]
//! owns every request and enforces the lifecycle.
//!
//! ## State Machine
//!
//! ```text
//!   (none) ──initiate──► PENDING ──cooldown elapses──► REDEEMABLE ──settle──► SETTLED
//!                           │                              │
//!                           └──────────cancel──────────────┼──► CANCELLED
//!                                                          │
//!                                        expiry elapses ───┴──► EXPIRED
//! ```
//!
//! Only three states are stored ([`RequestState`]): open, settled, and
//! cancelled. PENDING, REDEEMABLE and EXPIRED are all *open* requests seen
//! at different times, so [`WithdrawalRequest::status`] derives them from
//! `now`. No timer promotes anything.
//!
//! ## Snapshots
//!
//! The share amount is fixed when the request is filed. For a TOKEN request
//! that means converting at the request-time price (rounding shares up, so
//! the requester gives up at least what they asked for). What the shares
//! pay out is decided at settlement by the vault's
//! [`PayoutPolicy`](crate::config::PayoutPolicy).

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{PayoutPolicy, MAX_REQUEST_HISTORY_PER_PRINCIPAL};
use crate::error::VaultError;
use crate::ledger::ShareLedger;
use crate::math::Rounding;
use crate::types::{Principal, SharePrice, VaultId, WithdrawUnit};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status of a request at a given moment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    /// Filed, cooldown still running.
    Pending,
    /// Cooldown over, may be settled.
    Redeemable,
    /// Settled. Terminal.
    Settled,
    /// Cancelled by the requester. Terminal.
    Cancelled,
    /// Redeemable window passed without settlement. Terminal.
    Expired,
}

impl WithdrawalStatus {
    /// Returns `true` for PENDING and REDEEMABLE.
    pub fn is_active(&self) -> bool {
        matches!(self, WithdrawalStatus::Pending | WithdrawalStatus::Redeemable)
    }

    /// Returns `true` for states no request ever leaves.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WithdrawalStatus::Pending => write!(f, "PENDING"),
            WithdrawalStatus::Redeemable => write!(f, "REDEEMABLE"),
            WithdrawalStatus::Settled => write!(f, "SETTLED"),
            WithdrawalStatus::Cancelled => write!(f, "CANCELLED"),
            WithdrawalStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Stored state of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestState {
    /// Not yet settled or cancelled.
    Open,
    /// Settled; shares burned, assets paid.
    Settled {
        /// Settlement time.
        settled_at: DateTime<Utc>,
        /// Assets paid out.
        assets_out: u64,
    },
    /// Cancelled by the requester.
    Cancelled {
        /// Cancellation time.
        cancelled_at: DateTime<Utc>,
        /// Shares burned on cancel: the appreciation above the request-time
        /// value under [`PayoutPolicy::LesserOfRequestAndSettlement`].
        #[serde(default)]
        shares_forfeited: u64,
    },
}

// ---------------------------------------------------------------------------
// WithdrawalRequest
// ---------------------------------------------------------------------------

/// A principal's request to redeem shares from a vault.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// Unique request id.
    pub id: Uuid,
    /// The vault.
    pub vault: VaultId,
    /// Who asked.
    pub principal: Principal,
    /// Unit `requested_amount` is expressed in.
    pub unit: WithdrawUnit,
    /// The amount as asked, in `unit`.
    pub requested_amount: u64,
    /// Shares that will be burned on settlement.
    pub share_amount: u64,
    /// What `share_amount` was worth at request time.
    pub requested_value: u64,
    /// NAV per share at request time.
    pub price_at_request: SharePrice,
    /// When the request was filed.
    pub created_at: DateTime<Utc>,
    /// Earliest settlement time (inclusive).
    pub earliest_redeemable_at: DateTime<Utc>,
    /// Settlement deadline (exclusive). `None` if the vault has no expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Stored lifecycle state.
    pub state: RequestState,
}

impl WithdrawalRequest {
    /// Status of this request at `now`.
    pub fn status(&self, now: DateTime<Utc>) -> WithdrawalStatus {
        match self.state {
            RequestState::Settled { .. } => WithdrawalStatus::Settled,
            RequestState::Cancelled { .. } => WithdrawalStatus::Cancelled,
            RequestState::Open => {
                if now < self.earliest_redeemable_at {
                    WithdrawalStatus::Pending
                } else if self.expires_at.is_some_and(|deadline| now >= deadline) {
                    WithdrawalStatus::Expired
                } else {
                    WithdrawalStatus::Redeemable
                }
            }
        }
    }

    /// Returns `true` if the request still blocks a new one at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status(now).is_active()
    }

    /// Assets paid out, if settled.
    pub fn assets_out(&self) -> Option<u64> {
        match self.state {
            RequestState::Settled { assets_out, .. } => Some(assets_out),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// WithdrawalRequestManager
// ---------------------------------------------------------------------------

type RequestKey = (VaultId, Principal);

/// Owns withdrawal requests, at most one active per (vault, principal).
///
/// The latest request for each pair sits in `requests`. When a closed
/// request is replaced by a new one it moves to `history`, which keeps the
/// last [`MAX_REQUEST_HISTORY_PER_PRINCIPAL`] per pair.
///
/// Operations that read ledger state and then commit (`initiate`,
/// `settle`) assume the caller holds the vault's exclusive section; the
/// [`VaultAccountingService`](crate::service::VaultAccountingService) does.
#[derive(Default)]
pub struct WithdrawalRequestManager {
    requests: DashMap<RequestKey, WithdrawalRequest>,
    history: RwLock<Vec<WithdrawalRequest>>,
}

impl WithdrawalRequestManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Files a withdrawal request.
    ///
    /// The ledger must already be marked to the price this operation
    /// snapshotted; TOKEN amounts convert at its current totals.
    ///
    /// # Errors
    ///
    /// - [`VaultError::RequestAlreadyPending`] if an active request exists.
    /// - [`VaultError::InvalidWithdrawAmount`] for zero, or a TOKEN amount
    ///   worth zero shares.
    /// - [`VaultError::InsufficientShareBalance`] if the principal holds
    ///   fewer shares than requested.
    pub fn initiate(
        &self,
        ledger: &ShareLedger,
        vault: &VaultId,
        principal: &Principal,
        unit: WithdrawUnit,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, VaultError> {
        let key = (*vault, *principal);
        if let Some(existing) = self.active(vault, principal, now) {
            return Err(VaultError::RequestAlreadyPending {
                vault: *vault,
                principal: *principal,
                request_id: existing.id,
            });
        }

        if amount == 0 {
            return Err(VaultError::InvalidWithdrawAmount(
                "requested amount is zero".into(),
            ));
        }

        let vault_record = ledger.vault(vault)?;
        let share_amount = match unit {
            WithdrawUnit::Shares => amount,
            WithdrawUnit::Token => ledger.shares_for_assets(vault, amount, Rounding::Ceiling)?,
        };
        if share_amount == 0 {
            return Err(VaultError::InvalidWithdrawAmount(format!(
                "{amount} {unit} resolves to zero shares"
            )));
        }

        let held = ledger.balance_of(vault, principal);
        if share_amount > held {
            return Err(VaultError::InsufficientShareBalance {
                available: held,
                requested: share_amount,
            });
        }

        let requested_value = ledger.assets_for_shares(vault, share_amount)?;
        let earliest_redeemable_at = now
            .checked_add_signed(vault_record.redeem_period()?)
            .ok_or(VaultError::MathOverflow("initiate: redeemable time"))?;
        let expires_at = match vault_record.expiry_window()? {
            Some(window) => Some(
                earliest_redeemable_at
                    .checked_add_signed(window)
                    .ok_or(VaultError::MathOverflow("initiate: expiry time"))?,
            ),
            None => None,
        };

        let request = WithdrawalRequest {
            id: Uuid::new_v4(),
            vault: *vault,
            principal: *principal,
            unit,
            requested_amount: amount,
            share_amount,
            requested_value,
            price_at_request: vault_record.share_price()?,
            created_at: now,
            earliest_redeemable_at,
            expires_at,
            state: RequestState::Open,
        };

        match self.requests.entry(key) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_active(now) {
                    return Err(VaultError::RequestAlreadyPending {
                        vault: *vault,
                        principal: *principal,
                        request_id: slot.get().id,
                    });
                }
                let closed = slot.insert(request.clone());
                self.retire(closed);
            }
            Entry::Vacant(slot) => {
                slot.insert(request.clone());
            }
        }

        info!(
            vault = %vault,
            principal = %principal,
            request = %request.id,
            unit = %unit,
            amount,
            shares = share_amount,
            redeemable_at = %earliest_redeemable_at,
            "withdrawal requested"
        );
        Ok(request)
    }

    /// Settles the principal's request: burns its share snapshot and
    /// returns the assets paid out.
    ///
    /// The payout reflects the price at settlement (the ledger must be
    /// marked first), capped at the request-time value when the vault uses
    /// [`PayoutPolicy::LesserOfRequestAndSettlement`].
    ///
    /// # Errors
    ///
    /// - [`VaultError::RequestNotFound`] with no request on record.
    /// - [`VaultError::RequestNotRedeemable`] unless the request is
    ///   REDEEMABLE at `now`. The boundary `now == earliest_redeemable_at`
    ///   is redeemable.
    /// - Any ledger error from the burn; the request then stays open.
    pub fn settle(
        &self,
        ledger: &ShareLedger,
        vault: &VaultId,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<u64, VaultError> {
        let mut request = self
            .requests
            .get_mut(&(*vault, *principal))
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

        let cap = match ledger.vault(vault)?.params.payout_policy {
            PayoutPolicy::SettlementPrice => None,
            PayoutPolicy::LesserOfRequestAndSettlement => Some(request.requested_value),
        };
        let assets_out = ledger.burn_capped(vault, principal, request.share_amount, cap, now)?;

        request.state = RequestState::Settled {
            settled_at: now,
            assets_out,
        };

        info!(
            vault = %vault,
            principal = %principal,
            request = %request.id,
            shares = request.share_amount,
            assets = assets_out,
            "withdrawal settled"
        );
        Ok(assets_out)
    }

    /// Cancels the principal's request.
    ///
    /// Under [`PayoutPolicy::LesserOfRequestAndSettlement`] the principal
    /// keeps only the shares worth the request-time value at the current
    /// totals (the ledger must be marked first). The rest are burned with no
    /// payout, so the appreciation stays with the vault. Otherwise no
    /// balances move.
    ///
    /// # Errors
    ///
    /// - [`VaultError::RequestNotFound`] with no request on record.
    /// - [`VaultError::RequestNotCancellable`] if the request is settled,
    ///   cancelled, or expired at `now`.
    /// - Any ledger error from the forfeit burn; the request then stays open.
    pub fn cancel(
        &self,
        ledger: &ShareLedger,
        vault: &VaultId,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, VaultError> {
        let mut request = self
            .requests
            .get_mut(&(*vault, *principal))
            .ok_or(VaultError::RequestNotFound {
                vault: *vault,
                principal: *principal,
            })?;

        let status = request.status(now);
        if !status.is_active() {
            return Err(VaultError::RequestNotCancellable(status));
        }

        let shares_forfeited = match ledger.vault(vault)?.params.payout_policy {
            PayoutPolicy::SettlementPrice => 0,
            PayoutPolicy::LesserOfRequestAndSettlement => {
                Self::appreciation_shares(ledger, vault, principal, &request)?
            }
        };
        if shares_forfeited > 0 {
            ledger.burn_capped(vault, principal, shares_forfeited, Some(0), now)?;
        }

        request.state = RequestState::Cancelled {
            cancelled_at: now,
            shares_forfeited,
        };
        debug!(
            vault = %vault,
            principal = %principal,
            request = %request.id,
            shares_forfeited,
            "withdrawal cancelled"
        );
        Ok(request.clone())
    }

    /// Shares of the request's snapshot worth more than its request-time
    /// value at the current totals. Zero if the snapshot has not appreciated.
    fn appreciation_shares(
        ledger: &ShareLedger,
        vault: &VaultId,
        principal: &Principal,
        request: &WithdrawalRequest,
    ) -> Result<u64, VaultError> {
        let current_value = ledger.assets_for_shares(vault, request.share_amount)?;
        if current_value <= request.requested_value {
            return Ok(0);
        }
        let kept = ledger.shares_for_assets(vault, request.requested_value, Rounding::Floor)?;
        let lost = request.share_amount.saturating_sub(kept);
        Ok(lost.min(ledger.balance_of(vault, principal)))
    }

    /// The latest request for the pair, whatever its state.
    pub fn get(&self, vault: &VaultId, principal: &Principal) -> Option<WithdrawalRequest> {
        self.requests
            .get(&(*vault, *principal))
            .map(|entry| entry.value().clone())
    }

    /// The pair's request if it is PENDING or REDEEMABLE at `now`.
    pub fn active(
        &self,
        vault: &VaultId,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Option<WithdrawalRequest> {
        self.get(vault, principal).filter(|r| r.is_active(now))
    }

    /// Latest request of every principal in `vault`, oldest first.
    pub fn requests_for_vault(&self, vault: &VaultId) -> Vec<WithdrawalRequest> {
        let mut out: Vec<WithdrawalRequest> = self
            .requests
            .iter()
            .filter(|entry| entry.key().0 == *vault)
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Closed requests that were replaced by newer ones, for the pair.
    pub fn history(&self, vault: &VaultId, principal: &Principal) -> Vec<WithdrawalRequest> {
        self.history
            .read()
            .iter()
            .filter(|r| r.vault == *vault && r.principal == *principal)
            .cloned()
            .collect()
    }

    /// All requests, current then historical, for persistence.
    pub fn snapshot(&self) -> (Vec<WithdrawalRequest>, Vec<WithdrawalRequest>) {
        let mut current: Vec<WithdrawalRequest> =
            self.requests.iter().map(|e| e.value().clone()).collect();
        current.sort_by_key(|r| (r.created_at, r.id));
        (current, self.history.read().clone())
    }

    /// Rebuilds a manager from persisted requests.
    ///
    /// # Errors
    ///
    /// [`VaultError::InconsistentState`] if two current requests share a
    /// (vault, principal) pair.
    pub fn restore(
        current: Vec<WithdrawalRequest>,
        history: Vec<WithdrawalRequest>,
    ) -> Result<Self, VaultError> {
        let manager = Self::new();
        for request in current {
            let key = (request.vault, request.principal);
            if manager.requests.insert(key, request).is_some() {
                return Err(VaultError::InconsistentState(format!(
                    "duplicate withdrawal request for {} in vault {}",
                    key.1, key.0
                )));
            }
        }
        *manager.history.write() = trim_history(history);
        Ok(manager)
    }

    /// Moves a replaced request to history, dropping the pair's oldest
    /// entries past the cap.
    fn retire(&self, closed: WithdrawalRequest) {
        let key = (closed.vault, closed.principal);
        let mut history = self.history.write();
        history.push(closed);

        let held = history
            .iter()
            .filter(|r| (r.vault, r.principal) == key)
            .count();
        let mut excess = held.saturating_sub(MAX_REQUEST_HISTORY_PER_PRINCIPAL);
        if excess > 0 {
            history.retain(|r| {
                if excess > 0 && (r.vault, r.principal) == key {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }
}

/// Keeps the newest [`MAX_REQUEST_HISTORY_PER_PRINCIPAL`] entries of each
/// pair, in their original order.
fn trim_history(history: Vec<WithdrawalRequest>) -> Vec<WithdrawalRequest> {
    let mut seen: HashMap<RequestKey, usize> = HashMap::new();
    let mut kept: Vec<WithdrawalRequest> = history
        .into_iter()
        .rev()
        .filter(|r| {
            let count = seen.entry((r.vault, r.principal)).or_default();
            *count += 1;
            *count <= MAX_REQUEST_HISTORY_PER_PRINCIPAL
        })
        .collect();
    kept.reverse();
    kept
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
