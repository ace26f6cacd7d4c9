// 2.0: fixed-point helpers. USD conversions, percentage math, absolute
// difference, signed/unsigned casts. every division rejects zero divisors,
// every multiplication is overflow-checked. callers validate unsigned
// subtractions before reaching this module.

use crate::types::{BaseUnit, Price, SignedUsd, TokenAmount, Usd};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MathError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("arithmetic overflow")]
    Overflow,
}

pub fn checked_mul(a: Decimal, b: Decimal) -> Result<Decimal, MathError> {
    a.checked_mul(b).ok_or(MathError::Overflow)
}

pub fn checked_div(a: Decimal, b: Decimal) -> Result<Decimal, MathError> {
    if b.is_zero() {
        return Err(MathError::DivisionByZero);
    }
    a.checked_div(b).ok_or(MathError::Overflow)
}

// 2.1: token units -> USD. amount * price / base_unit
pub fn to_usd(amount: TokenAmount, price: Price, base_unit: BaseUnit) -> Result<Usd, MathError> {
    let product = checked_mul(amount.value(), price.value())?;
    let usd = checked_div(product, base_unit.value())?;
    Ok(Usd::new_unchecked(usd))
}

// 2.2: USD -> token units. usd * base_unit / price
pub fn from_usd(usd: Usd, price: Price, base_unit: BaseUnit) -> Result<TokenAmount, MathError> {
    let product = checked_mul(usd.value(), base_unit.value())?;
    let amount = checked_div(product, price.value())?;
    Ok(TokenAmount::new_unchecked(amount))
}

pub fn signed_from_usd(
    usd: SignedUsd,
    price: Price,
    base_unit: BaseUnit,
) -> Result<Decimal, MathError> {
    let product = checked_mul(usd.value(), base_unit.value())?;
    checked_div(product, price.value())
}

// 2.3: value * pct where pct is a fraction (0.001 = 0.1%)
pub fn percentage(value: Usd, pct: Decimal) -> Result<Usd, MathError> {
    debug_assert!(pct >= Decimal::ZERO);
    let scaled = checked_mul(value.value(), pct)?;
    Ok(Usd::new_unchecked(scaled))
}

// value * numerator / denominator, for ratios that are not pre-divided
pub fn mul_div(value: Decimal, numerator: Decimal, denominator: Decimal) -> Result<Decimal, MathError> {
    let product = checked_mul(value, numerator)?;
    checked_div(product, denominator)
}

// 2.4: |a - b|
pub fn delta(a: Decimal, b: Decimal) -> Decimal {
    (a - b).abs()
}

// 2.5: signed -> unsigned cast. negative input is a caller bug surfaced
// as an overflow error rather than a wrap.
pub fn to_unsigned(value: SignedUsd) -> Result<Usd, MathError> {
    Usd::new(value.value()).ok_or(MathError::Overflow)
}
