//! # Share Ledger
//!
//! Pure bookkeeping: vault totals and per-principal share balances. No
//! timing rules, no authorization, no oracle calls. The ledger is told what
//! the vault is worth (via [`ShareLedger::mark_to_price`]) and converts at
//! whatever the totals say.
//!
//! Each vault's record and its balances live in one `VaultBook` behind a
//! single `parking_lot::RwLock`. Every mutation takes the write guard once,
//! computes all new values with checked arithmetic, and only then writes
//! them, so a failed operation leaves nothing behind and a reader never
//! sees totals that disagree with balances.
//!
//! ## Invariant
//!
//! ```text
//! vault.total_shares == Σ balances[p].shares   (after every operation)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VaultParams;
use crate::error::VaultError;
use crate::math::{self, Rounding};
use crate::types::{Principal, SharePrice, VaultId};

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// A pooled vault's accounting record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    /// Vault address.
    pub id: VaultId,

    /// The only principal allowed to make manager withdrawals.
    pub manager: Principal,

    /// Parameters fixed at creation.
    pub params: VaultParams,

    /// Shares outstanding across all principals.
    pub total_shares: u64,

    /// Assets under management, in smallest units, as of `last_updated`.
    pub total_assets: u64,

    /// When the vault was created.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the last mutation or revaluation.
    pub last_updated: DateTime<Utc>,
}

impl Vault {
    /// NAV per share implied by the current totals.
    pub fn share_price(&self) -> Result<SharePrice, VaultError> {
        math::price_from_totals(
            self.total_shares,
            self.total_assets,
            SharePrice::from_raw(self.params.initial_share_price),
        )
    }

    /// Redemption cooldown as a chrono duration.
    pub fn redeem_period(&self) -> Result<chrono::Duration, VaultError> {
        seconds(self.params.redeem_period_secs, "redeem period")
    }

    /// Redeemable window as a chrono duration. `None` if requests never
    /// expire.
    pub fn expiry_window(&self) -> Result<Option<chrono::Duration>, VaultError> {
        self.params
            .expiry_window_secs
            .map(|secs| seconds(secs, "expiry window"))
            .transpose()
    }

    /// Returns `true` if `principal` is this vault's manager.
    pub fn is_manager(&self, principal: &Principal) -> bool {
        self.manager == *principal
    }
}

fn seconds(secs: u64, what: &'static str) -> Result<chrono::Duration, VaultError> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| VaultError::InvalidVaultParams(format!("{what} of {secs}s is out of range")))
}

// ---------------------------------------------------------------------------
// PrincipalBalance
// ---------------------------------------------------------------------------

/// One principal's position in one vault.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalBalance {
    /// Shares held.
    pub shares: u64,

    /// Lifetime net deposits in asset units. Reset on the first deposit
    /// after the position was fully withdrawn. Goes negative when a
    /// principal withdraws more than they put in.
    pub cost_basis: i64,

    /// Timestamp of the last change to this position.
    pub last_updated: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// VaultBook
// ---------------------------------------------------------------------------

/// A vault record plus its balances. Serializable as one unit so a storage
/// collaborator can commit both atomically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultBook {
    /// The vault record.
    pub vault: Vault,
    /// Balances keyed by principal. Zero balances are removed.
    pub balances: HashMap<Principal, PrincipalBalance>,
}

impl VaultBook {
    fn balance(&self, principal: &Principal) -> u64 {
        self.balances.get(principal).map(|b| b.shares).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// ShareLedger
// ---------------------------------------------------------------------------

/// Vault totals and principal balances for every vault the engine knows.
///
/// Thread-safe. Different vaults never contend; mutations of one vault are
/// serialized by its book lock. Serializing the *read-convert-write* cycle
/// across an oracle call is the service's job, not the ledger's.
#[derive(Default)]
pub struct ShareLedger {
    books: DashMap<VaultId, Arc<RwLock<VaultBook>>>,
}

impl ShareLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new vault with zero shares and zero assets.
    ///
    /// # Errors
    ///
    /// [`VaultError::VaultAlreadyExists`] if the id is taken,
    /// [`VaultError::InvalidVaultParams`] if `params` fail validation.
    pub fn create_vault(
        &self,
        id: VaultId,
        manager: Principal,
        params: VaultParams,
        now: DateTime<Utc>,
    ) -> Result<Vault, VaultError> {
        params.validate().map_err(VaultError::InvalidVaultParams)?;

        let vault = Vault {
            id,
            manager,
            params,
            total_shares: 0,
            total_assets: 0,
            created_at: now,
            last_updated: now,
        };

        match self.books.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(VaultError::VaultAlreadyExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(VaultBook {
                    vault: vault.clone(),
                    balances: HashMap::new(),
                })));
                debug!(vault = %id, manager = %manager, "vault created");
                Ok(vault)
            }
        }
    }

    /// Returns `true` if the vault exists.
    pub fn contains(&self, id: &VaultId) -> bool {
        self.books.contains_key(id)
    }

    /// Returns a consistent copy of the vault record.
    pub fn vault(&self, id: &VaultId) -> Result<Vault, VaultError> {
        Ok(self.book(id)?.read().vault.clone())
    }

    /// Ids of every vault on record.
    pub fn vault_ids(&self) -> Vec<VaultId> {
        self.books.iter().map(|entry| *entry.key()).collect()
    }

    /// Shares held by `principal`. Zero for unknown principals and vaults.
    pub fn balance_of(&self, vault: &VaultId, principal: &Principal) -> u64 {
        let Ok(book) = self.book(vault) else {
            return 0;
        };
        let guard = book.read();
        guard.balance(principal)
    }

    /// Full position record for `principal`, if they hold shares.
    pub fn principal(&self, vault: &VaultId, principal: &Principal) -> Option<PrincipalBalance> {
        let book = self.book(vault).ok()?;
        let guard = book.read();
        guard.balances.get(principal).cloned()
    }

    /// All positions in a vault, sorted by principal for stable output.
    pub fn principals(
        &self,
        vault: &VaultId,
    ) -> Result<Vec<(Principal, PrincipalBalance)>, VaultError> {
        let book = self.book(vault)?;
        let guard = book.read();
        let mut out: Vec<_> = guard
            .balances
            .iter()
            .map(|(p, b)| (*p, b.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Revalues the vault: `total_assets = floor(total_shares * price)`.
    ///
    /// A vault with no shares outstanding is left untouched. Returns the
    /// new `total_assets`.
    pub fn mark_to_price(
        &self,
        id: &VaultId,
        price: SharePrice,
        now: DateTime<Utc>,
    ) -> Result<u64, VaultError> {
        let book = self.book(id)?;
        let mut guard = book.write();
        if guard.vault.total_shares == 0 {
            return Ok(guard.vault.total_assets);
        }

        let equity = math::equity_at_price(guard.vault.total_shares, price)?;
        if equity != guard.vault.total_assets {
            debug!(
                vault = %id,
                price = %price,
                before = guard.vault.total_assets,
                after = equity,
                "vault revalued"
            );
        }
        guard.vault.total_assets = equity;
        guard.vault.last_updated = now;
        Ok(equity)
    }

    /// Converts deposited assets to shares and credits them to `principal`.
    ///
    /// Shares are rounded down. Returns the shares minted.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InsufficientAssetAmount`] for a zero deposit or one
    ///   that would mint zero shares.
    /// - [`VaultError::VaultInsolvent`] if shares are outstanding but the
    ///   vault holds no assets.
    pub fn mint(
        &self,
        id: &VaultId,
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

        let book = self.book(id)?;
        let mut guard = book.write();
        let vault = &guard.vault;

        if vault.total_shares != 0 && vault.total_assets == 0 {
            return Err(VaultError::VaultInsolvent(*id));
        }

        let shares = math::assets_to_shares(
            asset_amount,
            vault.total_shares,
            vault.total_assets,
            SharePrice::from_raw(vault.params.initial_share_price),
            Rounding::Floor,
        )?;
        if shares == 0 {
            return Err(VaultError::InsufficientAssetAmount {
                amount: asset_amount,
                shares,
            });
        }

        let total_shares = vault
            .total_shares
            .checked_add(shares)
            .ok_or(VaultError::MathOverflow("mint: total shares"))?;
        let total_assets = vault
            .total_assets
            .checked_add(asset_amount)
            .ok_or(VaultError::MathOverflow("mint: total assets"))?;

        let held = guard.balance(principal);
        let new_balance = held
            .checked_add(shares)
            .ok_or(VaultError::MathOverflow("mint: principal shares"))?;
        let deposit = i64::try_from(asset_amount)
            .map_err(|_| VaultError::MathOverflow("mint: cost basis"))?;
        let cost_basis = match guard.balances.get(principal) {
            Some(existing) if existing.shares > 0 => existing
                .cost_basis
                .checked_add(deposit)
                .ok_or(VaultError::MathOverflow("mint: cost basis"))?,
            _ => deposit,
        };

        // Commit.
        guard.vault.total_shares = total_shares;
        guard.vault.total_assets = total_assets;
        guard.vault.last_updated = now;
        guard.balances.insert(
            *principal,
            PrincipalBalance {
                shares: new_balance,
                cost_basis,
                last_updated: now,
            },
        );

        debug!(
            vault = %id,
            principal = %principal,
            assets = asset_amount,
            shares,
            total_shares,
            "shares minted"
        );
        Ok(shares)
    }

    /// Burns shares from `principal` and returns the assets they were
    /// worth, rounded down.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidWithdrawAmount`] when `share_amount` is zero.
    /// - [`VaultError::InsufficientShareBalance`] when `share_amount`
    ///   exceeds the principal's balance.
    pub fn burn(
        &self,
        id: &VaultId,
        principal: &Principal,
        share_amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, VaultError> {
        self.burn_capped(id, principal, share_amount, None, now)
    }

    /// Like [`burn`](Self::burn), but pays out at most `cap` assets. The
    /// full `share_amount` is burned regardless; any value above the cap
    /// stays in the vault for the remaining holders.
    pub fn burn_capped(
        &self,
        id: &VaultId,
        principal: &Principal,
        share_amount: u64,
        cap: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<u64, VaultError> {
        if share_amount == 0 {
            return Err(VaultError::InvalidWithdrawAmount("cannot burn zero shares".into()));
        }

        let book = self.book(id)?;
        let mut guard = book.write();

        let held = guard.balance(principal);
        if share_amount > held {
            return Err(VaultError::InsufficientShareBalance {
                available: held,
                requested: share_amount,
            });
        }

        let vault = &guard.vault;
        let value = math::shares_to_assets(
            share_amount,
            vault.total_shares,
            vault.total_assets,
            Rounding::Floor,
        )?;
        let payout = cap.map_or(value, |c| value.min(c));

        let total_shares = vault
            .total_shares
            .checked_sub(share_amount)
            .ok_or(VaultError::MathOverflow("burn: total shares"))?;
        let total_assets = vault
            .total_assets
            .checked_sub(payout)
            .ok_or(VaultError::MathOverflow("burn: total assets"))?;
        let remaining = held - share_amount;
        let withdrawn =
            i64::try_from(payout).map_err(|_| VaultError::MathOverflow("burn: cost basis"))?;

        // Commit.
        guard.vault.total_shares = total_shares;
        guard.vault.total_assets = total_assets;
        guard.vault.last_updated = now;
        if remaining == 0 {
            guard.balances.remove(principal);
        } else if let Some(position) = guard.balances.get_mut(principal) {
            position.shares = remaining;
            position.cost_basis = position.cost_basis.saturating_sub(withdrawn);
            position.last_updated = now;
        }

        debug!(
            vault = %id,
            principal = %principal,
            shares = share_amount,
            assets = payout,
            total_shares,
            "shares burned"
        );
        Ok(payout)
    }

    /// Shares `assets` would convert to at the current totals.
    pub fn shares_for_assets(
        &self,
        id: &VaultId,
        assets: u64,
        rounding: Rounding,
    ) -> Result<u64, VaultError> {
        let book = self.book(id)?;
        let guard = book.read();
        let vault = &guard.vault;
        math::assets_to_shares(
            assets,
            vault.total_shares,
            vault.total_assets,
            SharePrice::from_raw(vault.params.initial_share_price),
            rounding,
        )
    }

    /// Assets `shares` are worth at the current totals, rounded down.
    pub fn assets_for_shares(&self, id: &VaultId, shares: u64) -> Result<u64, VaultError> {
        let book = self.book(id)?;
        let guard = book.read();
        math::shares_to_assets(
            shares,
            guard.vault.total_shares,
            guard.vault.total_assets,
            Rounding::Floor,
        )
    }

    /// Copies every vault book, sorted by vault id.
    pub fn snapshot(&self) -> Vec<VaultBook> {
        let mut books: Vec<VaultBook> = self
            .books
            .iter()
            .map(|entry| entry.value().read().clone())
            .collect();
        books.sort_by(|a, b| a.vault.id.cmp(&b.vault.id));
        books
    }

    /// Rebuilds a ledger from persisted books.
    ///
    /// Recomputes each vault's share total from its balances and rejects a
    /// book where they disagree: a corrupt file must not become a live
    /// ledger.
    pub fn restore(books: Vec<VaultBook>) -> Result<Self, VaultError> {
        let ledger = Self::new();
        for mut book in books {
            let id = book.vault.id;
            book.vault
                .params
                .validate()
                .map_err(|e| VaultError::InvalidVaultParams(format!("vault {id}: {e}")))?;
            book.balances.retain(|_, b| b.shares > 0);
            let sum = book
                .balances
                .values()
                .try_fold(0u64, |acc, b| acc.checked_add(b.shares))
                .ok_or(VaultError::MathOverflow("restore: balance sum"))?;
            if sum != book.vault.total_shares {
                return Err(VaultError::InconsistentState(format!(
                    "vault {id}: total shares {} != sum of balances {sum}",
                    book.vault.total_shares
                )));
            }
            if ledger.books.insert(id, Arc::new(RwLock::new(book))).is_some() {
                return Err(VaultError::VaultAlreadyExists(id));
            }
        }
        Ok(ledger)
    }

    fn book(&self, id: &VaultId) -> Result<Arc<RwLock<VaultBook>>, VaultError> {
        self.books
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(VaultError::VaultNotFound(*id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
