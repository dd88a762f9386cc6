//! Serializable engine state.
//!
//! An [`EngineSnapshot`] is everything needed to rebuild a
//! [`VaultAccountingService`](crate::service::VaultAccountingService):
//! vault books and withdrawal requests. Prices are not part of it; they
//! belong to the oracle.

use serde::{Deserialize, Serialize};

use crate::ledger::VaultBook;
use crate::withdrawal::WithdrawalRequest;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persistable engine state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Every vault with its balances.
    pub vaults: Vec<VaultBook>,
    /// Latest request per (vault, principal).
    #[serde(default)]
    pub requests: Vec<WithdrawalRequest>,
    /// Closed requests superseded by newer ones.
    #[serde(default)]
    pub request_history: Vec<WithdrawalRequest>,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            vaults: Vec::new(),
            requests: Vec::new(),
            request_history: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_parses_with_defaults() {
        let snapshot: EngineSnapshot = serde_json::from_str(r#"{"vaults": []}"#).unwrap();
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert!(snapshot.requests.is_empty());
        assert!(snapshot.request_history.is_empty());
    }
}
