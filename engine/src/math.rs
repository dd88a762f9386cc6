//! # Share Math
//!
//! Checked fixed-point conversions between shares and assets. Every product
//! is taken in `u128` and every quotient states its rounding direction, so
//! the caller decides who absorbs the remainder. In this engine the answer
//! is always the vault.

use crate::config::PRICE_PRECISION;
use crate::error::VaultError;
use crate::types::SharePrice;

/// Which way to round a quotient.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Rounding {
    /// Toward zero.
    Floor,
    /// Away from zero.
    Ceiling,
}

/// Computes `value * numerator / denominator` with the given rounding.
///
/// # Errors
///
/// [`VaultError::MathOverflow`] on a zero denominator or a result that
/// doesn't fit in `u64`.
pub fn mul_div(
    value: u64,
    numerator: u64,
    denominator: u64,
    rounding: Rounding,
) -> Result<u64, VaultError> {
    if denominator == 0 {
        return Err(VaultError::MathOverflow("mul_div: division by zero"));
    }

    // u64 * u64 always fits in u128.
    let product = value as u128 * numerator as u128;
    let denom = denominator as u128;

    let result = match rounding {
        Rounding::Floor => product / denom,
        Rounding::Ceiling => product.div_ceil(denom),
    };

    u64::try_from(result).map_err(|_| VaultError::MathOverflow("mul_div: result exceeds u64"))
}

/// Shares worth `assets` given vault totals.
///
/// Uses `initial_price` when no shares are outstanding.
pub fn assets_to_shares(
    assets: u64,
    total_shares: u64,
    total_assets: u64,
    initial_price: SharePrice,
    rounding: Rounding,
) -> Result<u64, VaultError> {
    if total_shares == 0 {
        return mul_div(assets, PRICE_PRECISION, initial_price.raw(), rounding);
    }
    mul_div(assets, total_shares, total_assets, rounding)
}

/// Assets worth `shares` given vault totals.
pub fn shares_to_assets(
    shares: u64,
    total_shares: u64,
    total_assets: u64,
    rounding: Rounding,
) -> Result<u64, VaultError> {
    if total_shares == 0 {
        return Err(VaultError::MathOverflow("shares_to_assets: no shares outstanding"));
    }
    mul_div(shares, total_assets, total_shares, rounding)
}

/// Vault equity implied by a price: `total_shares * price`, rounded down.
pub fn equity_at_price(total_shares: u64, price: SharePrice) -> Result<u64, VaultError> {
    mul_div(total_shares, price.raw(), PRICE_PRECISION, Rounding::Floor)
}

/// NAV per share implied by vault totals, rounded down.
///
/// Returns `initial_price` for a vault with no shares outstanding.
pub fn price_from_totals(
    total_shares: u64,
    total_assets: u64,
    initial_price: SharePrice,
) -> Result<SharePrice, VaultError> {
    if total_shares == 0 {
        return Ok(initial_price);
    }
    mul_div(total_assets, PRICE_PRECISION, total_shares, Rounding::Floor).map(SharePrice::from_raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_div_floor() {
        assert_eq!(mul_div(100, 3, 2, Rounding::Floor).unwrap(), 150);
        assert_eq!(mul_div(100, 1, 3, Rounding::Floor).unwrap(), 33);
    }

    #[test]
    fn mul_div_ceiling() {
        assert_eq!(mul_div(100, 3, 2, Rounding::Ceiling).unwrap(), 150);
        assert_eq!(mul_div(100, 1, 3, Rounding::Ceiling).unwrap(), 34);
    }

    #[test]
    fn mul_div_zero_denominator() {
        assert!(matches!(
            mul_div(1, 1, 0, Rounding::Floor),
            Err(VaultError::MathOverflow(_))
        ));
    }

    #[test]
    fn mul_div_large_intermediate_fits() {
        // The product overflows u64 but the quotient doesn't.
        assert_eq!(
            mul_div(u64::MAX, u64::MAX, u64::MAX, Rounding::Floor).unwrap(),
            u64::MAX
        );
    }

    #[test]
    fn mul_div_result_overflow() {
        assert!(mul_div(u64::MAX, 2, 1, Rounding::Floor).is_err());
    }

    #[test]
    fn empty_vault_uses_initial_price() {
        let shares = assets_to_shares(1_000, 0, 0, SharePrice::ONE, Rounding::Floor).unwrap();
        assert_eq!(shares, 1_000);

        let two = SharePrice::from_units(2).unwrap();
        let shares = assets_to_shares(1_001, 0, 0, two, Rounding::Floor).unwrap();
        assert_eq!(shares, 500);
    }

    #[test]
    fn proportional_conversion_rounds_down() {
        // 3 shares backed by 10 assets: 1 asset buys 0.3 shares.
        assert_eq!(assets_to_shares(1, 3, 10, SharePrice::ONE, Rounding::Floor).unwrap(), 0);
        assert_eq!(shares_to_assets(1, 3, 10, Rounding::Floor).unwrap(), 3);
        assert_eq!(shares_to_assets(1, 3, 10, Rounding::Ceiling).unwrap(), 4);
    }

    #[test]
    fn equity_and_price_agree() {
        let price: SharePrice = "1.25".parse().unwrap();
        assert_eq!(equity_at_price(800, price).unwrap(), 1_000);
        assert_eq!(price_from_totals(800, 1_000, SharePrice::ONE).unwrap(), price);
        assert_eq!(price_from_totals(0, 0, price).unwrap(), price);
    }
}
