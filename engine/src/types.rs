//! # Core Types
//!
//! Identifiers, withdrawal units, and the fixed-point share price.
//!
//! Vaults and principals are both identified by 32-byte [`Address`]es,
//! written as base58 in every human-facing form (CLI flags, JSON state,
//! logs). Vault addresses can be derived from a human-readable name so a
//! front-end never has to ship a registry of opaque ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::config::{PRICE_DECIMALS, PRICE_PRECISION};

/// Domain separation tag for name-derived vault addresses.
const VAULT_ADDRESS_DOMAIN: &[u8] = b"vault";

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// Errors from parsing an [`Address`] out of text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The input is not valid base58.
    #[error("invalid base58 address: {0}")]
    InvalidEncoding(String),

    /// The input decoded to the wrong number of bytes.
    #[error("address must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// A 32-byte account or vault identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 32]);

/// Identifier of a vault.
pub type VaultId = Address;

/// Identifier of an account that holds shares (a depositor or a manager).
pub type Principal = Address;

impl Address {
    /// Wraps raw bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derives the address of a vault from its name.
    ///
    /// `BLAKE3("vault" || name)`. Same name, same address, on every machine.
    pub fn derive_vault(name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(VAULT_ADDRESS_DOMAIN);
        hasher.update(name.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the base58 text form.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = bs58::decode(s.trim())
            .into_vec()
            .map_err(|e| AddressError::InvalidEncoding(e.to_string()))?;
        let bytes: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::InvalidLength(decoded.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_base58())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// WithdrawUnit
// ---------------------------------------------------------------------------

/// The unit a withdrawal amount is expressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawUnit {
    /// The amount is a share count.
    Shares,
    /// The amount is in underlying asset units, converted to shares at the
    /// price prevailing when the request is made.
    Token,
}

impl fmt::Display for WithdrawUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WithdrawUnit::Shares => write!(f, "SHARES"),
            WithdrawUnit::Token => write!(f, "TOKEN"),
        }
    }
}

impl FromStr for WithdrawUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shares" => Ok(WithdrawUnit::Shares),
            "token" | "tokens" => Ok(WithdrawUnit::Token),
            other => Err(format!("unknown withdraw unit: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// SharePrice
// ---------------------------------------------------------------------------

/// Value of one share in smallest asset units, fixed point with
/// [`PRICE_DECIMALS`] decimals.
///
/// `SharePrice::from_raw(PRICE_PRECISION)` is 1.0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharePrice(u64);

impl SharePrice {
    /// Exactly one asset unit per share.
    pub const ONE: SharePrice = SharePrice(PRICE_PRECISION);

    /// Wraps a raw fixed-point value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Builds a price from a whole number of asset units per share.
    ///
    /// Returns `None` on overflow.
    pub fn from_units(units: u64) -> Option<Self> {
        units.checked_mul(PRICE_PRECISION).map(Self)
    }

    /// Returns the raw fixed-point value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Returns `true` for a zero price.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SharePrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / PRICE_PRECISION;
        let frac = self.0 % PRICE_PRECISION;
        write!(f, "{whole}.{frac:0width$}", width = PRICE_DECIMALS as usize)
    }
}

impl FromStr for SharePrice {
    type Err = String;

    /// Parses a decimal string such as `"1"`, `"1.05"` or `"0.000000001"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if frac.len() > PRICE_DECIMALS as usize {
            return Err(format!(
                "price {s} has more than {PRICE_DECIMALS} decimal places"
            ));
        }
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| format!("invalid price: {s}"))?
        };
        let frac_raw: u64 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<width$}", width = PRICE_DECIMALS as usize);
            padded.parse().map_err(|_| format!("invalid price: {s}"))?
        };
        whole
            .checked_mul(PRICE_PRECISION)
            .and_then(|w| w.checked_add(frac_raw))
            .map(SharePrice)
            .ok_or_else(|| format!("price {s} is out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_base58_roundtrip() {
        let addr = Address::derive_vault("alpha");
        let text = addr.to_base58();
        let parsed: Address = text.parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn derived_vault_addresses_are_stable_and_distinct() {
        assert_eq!(Address::derive_vault("alpha"), Address::derive_vault("alpha"));
        assert_ne!(Address::derive_vault("alpha"), Address::derive_vault("beta"));
    }

    #[test]
    fn address_rejects_garbage() {
        assert!(matches!(
            "not-base58-0OIl".parse::<Address>(),
            Err(AddressError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn address_rejects_short_input() {
        let short = bs58::encode([1u8; 16]).into_string();
        assert_eq!(
            short.parse::<Address>(),
            Err(AddressError::InvalidLength(16))
        );
    }

    #[test]
    fn address_serializes_as_string() {
        let addr = Address::new([7u8; 32]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr.to_base58()));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn withdraw_unit_parsing() {
        assert_eq!("SHARES".parse::<WithdrawUnit>(), Ok(WithdrawUnit::Shares));
        assert_eq!("token".parse::<WithdrawUnit>(), Ok(WithdrawUnit::Token));
        assert!("dollars".parse::<WithdrawUnit>().is_err());
    }

    #[test]
    fn share_price_parse_and_display() {
        let p: SharePrice = "1.05".parse().unwrap();
        assert_eq!(p.raw(), 1_050_000_000);
        assert_eq!(p.to_string(), "1.050000000");
        assert_eq!("2".parse::<SharePrice>().unwrap(), SharePrice::from_units(2).unwrap());
        assert_eq!("0.000000001".parse::<SharePrice>().unwrap().raw(), 1);
    }

    #[test]
    fn share_price_rejects_excess_precision() {
        assert!("1.0000000001".parse::<SharePrice>().is_err());
        assert!("abc".parse::<SharePrice>().is_err());
    }
}
