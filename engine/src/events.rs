//! # Audit Records
//!
//! Every committed mutation produces one [`VaultRecord`] carrying the
//! before and after picture of the principal's position and the vault
//! totals. Records go out on a `tokio::sync::broadcast` channel; a
//! subscriber that falls behind loses the oldest records, never blocks the
//! engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Principal, VaultId, WithdrawUnit};

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultAction {
    /// Assets deposited, shares minted.
    Deposit,
    /// Withdrawal request filed.
    WithdrawRequest,
    /// Withdrawal request cancelled.
    CancelWithdrawRequest,
    /// Withdrawal settled, shares burned.
    Withdraw,
    /// Manager withdrawal settled immediately.
    ManagerWithdraw,
}

impl fmt::Display for VaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultAction::Deposit => write!(f, "deposit"),
            VaultAction::WithdrawRequest => write!(f, "withdraw_request"),
            VaultAction::CancelWithdrawRequest => write!(f, "cancel_withdraw_request"),
            VaultAction::Withdraw => write!(f, "withdraw"),
            VaultAction::ManagerWithdraw => write!(f, "manager_withdraw"),
        }
    }
}

/// One audit record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRecord {
    /// Time the operation was applied.
    pub ts: DateTime<Utc>,
    /// The vault.
    pub vault: VaultId,
    /// Whose position moved.
    pub principal: Principal,
    /// What happened.
    pub action: VaultAction,
    /// Withdrawal request involved, if any.
    pub request_id: Option<Uuid>,
    /// Asset amount moved (deposit in, payout out, or requested value).
    pub amount: u64,
    /// Unit of the originating request, for withdrawal actions.
    pub unit: Option<WithdrawUnit>,
    /// Principal's shares before.
    pub shares_before: u64,
    /// Principal's shares after.
    pub shares_after: u64,
    /// Vault total shares before.
    pub total_shares_before: u64,
    /// Vault total shares after.
    pub total_shares_after: u64,
    /// Vault total assets before (after revaluation).
    pub total_assets_before: u64,
    /// Vault total assets after.
    pub total_assets_after: u64,
}

impl VaultRecord {
    /// Shares minted (positive) or burned (negative) by this operation.
    pub fn share_delta(&self) -> i128 {
        self.shares_after as i128 - self.shares_before as i128
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    #[test]
    fn share_delta_sign() {
        let record = VaultRecord {
            ts: Utc::now(),
            vault: Address::derive_vault("events"),
            principal: Address::new([1; 32]),
            action: VaultAction::Withdraw,
            request_id: None,
            amount: 40,
            unit: Some(WithdrawUnit::Shares),
            shares_before: 100,
            shares_after: 60,
            total_shares_before: 100,
            total_shares_after: 60,
            total_assets_before: 100,
            total_assets_after: 60,
        };
        assert_eq!(record.share_delta(), -40);
        assert_eq!(record.action.to_string(), "withdraw");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["action"], "withdraw");
        assert_eq!(json["unit"], "SHARES");
    }
}
