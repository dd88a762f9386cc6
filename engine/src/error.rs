//! Error types for the vault engine.
//!
//! Every engine operation that can fail returns a [`VaultError`]. All of
//! them are local and recoverable: a rejected precondition is reported to
//! the caller, never clamped or defaulted away.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Principal, VaultId};
use crate::withdrawal::WithdrawalStatus;

/// Errors returned by ledger, withdrawal, and service operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A deposit of zero assets, or one too small to mint a single share.
    #[error("insufficient asset amount: {amount} would mint {shares} shares")]
    InsufficientAssetAmount {
        /// Assets offered.
        amount: u64,
        /// Shares the deposit would have minted.
        shares: u64,
    },

    /// The principal holds fewer shares than the operation needs.
    #[error("insufficient share balance: available {available}, requested {requested}")]
    InsufficientShareBalance {
        /// Shares held by the principal.
        available: u64,
        /// Shares the operation needs.
        requested: u64,
    },

    /// An active withdrawal request already exists for this principal.
    #[error("withdrawal request {request_id} already pending for {principal} in vault {vault}")]
    RequestAlreadyPending {
        /// The vault.
        vault: VaultId,
        /// The principal.
        principal: Principal,
        /// Id of the outstanding request.
        request_id: uuid::Uuid,
    },

    /// The request cannot be settled at this time or in this state.
    #[error("withdrawal request is not redeemable: status {status}, redeemable at {earliest_redeemable}")]
    RequestNotRedeemable {
        /// Status of the request at the attempted settlement time.
        status: WithdrawalStatus,
        /// Earliest moment the request can settle.
        earliest_redeemable: DateTime<Utc>,
    },

    /// The request is already closed.
    #[error("withdrawal request cannot be cancelled: status {0}")]
    RequestNotCancellable(WithdrawalStatus),

    /// The caller is not the vault's manager.
    #[error("{caller} is not authorized to manage vault {vault}")]
    Unauthorized {
        /// The vault.
        vault: VaultId,
        /// Who tried.
        caller: Principal,
    },

    /// The pricing oracle could not produce a price. Retryable.
    #[error("pricing oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// A withdrawal of zero, or one that resolves to zero shares.
    #[error("invalid withdraw amount: {0}")]
    InvalidWithdrawAmount(String),

    /// Shares are outstanding but the vault holds no assets.
    #[error("vault {0} has shares outstanding but zero assets")]
    VaultInsolvent(VaultId),

    /// No vault with this id.
    #[error("vault {0} not found")]
    VaultNotFound(VaultId),

    /// A vault with this id already exists.
    #[error("vault {0} already exists")]
    VaultAlreadyExists(VaultId),

    /// Vault parameters failed validation.
    #[error("invalid vault parameters: {0}")]
    InvalidVaultParams(String),

    /// No withdrawal request on record for this principal.
    #[error("no withdrawal request for {principal} in vault {vault}")]
    RequestNotFound {
        /// The vault.
        vault: VaultId,
        /// The principal.
        principal: Principal,
    },

    /// Persisted state failed a consistency check on load.
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    /// A checked arithmetic step overflowed or divided by zero.
    #[error("math overflow in {0}")]
    MathOverflow(&'static str),
}

impl VaultError {
    /// Returns `true` if retrying the same call later may succeed.
    ///
    /// Only oracle outages are transient. Everything else is a caller or
    /// state precondition and needs a different request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::OracleUnavailable(_))
    }
}

impl From<crate::oracle::OracleError> for VaultError {
    fn from(e: crate::oracle::OracleError) -> Self {
        VaultError::OracleUnavailable(e.to_string())
    }
}
