// 8.12: auto-deleveraging. when one side's unrealized profit grows too large
// relative to the pool backing it, the most profitable positions are force
// closed at a price pulled toward a minimum-profit boundary. every ADL
// execution must strictly reduce the pnl-to-pool ratio or fail whole.

use crate::math;
use crate::position;
use crate::types::{BaseUnit, Price, Side, Usd};
use crate::vault::MarketSnapshot;
use rust_decimal::Decimal;

use super::results::ExecutionError;

// 8.13: ratio of one side's aggregate unrealized pnl to the USD value of the
// pool backing that side. positive when the pool owes traders.
pub fn pnl_factor(
    snapshot: &MarketSnapshot,
    side: Side,
    index_price: Price,
    collateral_price: Price,
    collateral_base_unit: BaseUnit,
) -> Result<Decimal, ExecutionError> {
    let pool_usd = math::to_usd(
        snapshot.pool_balance(side),
        collateral_price,
        collateral_base_unit,
    )?;
    if pool_usd.is_zero() {
        return Ok(Decimal::ZERO);
    }

    let oi = snapshot.open_interest(side);
    let side_pnl = match snapshot.avg_entry_price(side) {
        Some(avg_entry) if !oi.is_zero() => {
            position::position_pnl(oi, avg_entry, index_price, side)?
        }
        _ => return Ok(Decimal::ZERO),
    };

    Ok(math::checked_div(side_pnl.value(), pool_usd.value())?)
}

// ADL only arms when the ratio is at or beyond the configured maximum and
// the pool actually owes the profitable side
pub fn check_adl_eligibility(factor: Decimal, max_pnl_factor: Decimal) -> Result<(), ExecutionError> {
    if factor < Decimal::ZERO || factor.abs() < max_pnl_factor {
        return Err(ExecutionError::PnlToPoolRatioNotExceeded);
    }
    Ok(())
}

// how far past target the ratio has drifted, as a fraction of target
pub fn acceleration_factor(factor: Decimal, target: Decimal) -> Result<Decimal, ExecutionError> {
    Ok(math::checked_div(factor - target, target)?.max(Decimal::ZERO))
}

// fraction of the position to force close, saturating at a full close
pub fn adl_percentage(factor: Decimal, target: Decimal) -> Result<Decimal, ExecutionError> {
    Ok(acceleration_factor(factor, target)?.min(Decimal::ONE))
}

// 8.14: execution price for the forced close. pulled from the impacted price
// toward the minimum-profit boundary (entry +- adl_min_profit), scaled by how
// much of the pool this position's profit represents times the acceleration
// factor. the boundary is never crossed, so the trader keeps at least the
// minimum profit.
#[allow(clippy::too_many_arguments)]
pub fn adl_execution_price(
    entry_price: Price,
    impacted_price: Price,
    side: Side,
    position_pnl_usd: Usd,
    pool_usd: Usd,
    acceleration: Decimal,
    adl_min_profit: Decimal,
) -> Result<Price, ExecutionError> {
    let pool_share = math::checked_div(position_pnl_usd.value(), pool_usd.value())?;
    let pull = (pool_share * acceleration).max(Decimal::ZERO).min(Decimal::ONE);

    let boundary = entry_price.value()
        * (Decimal::ONE + adl_min_profit * side.sign());

    let executed = match side {
        Side::Long => {
            // worse for a long is lower; never below the boundary, never
            // above the price the trader would have had anyway
            let pulled = impacted_price.value() - (impacted_price.value() - boundary) * pull;
            pulled.clamp(
                boundary.min(impacted_price.value()),
                impacted_price.value(),
            )
        }
        Side::Short => {
            let pulled = impacted_price.value() + (boundary - impacted_price.value()) * pull;
            pulled.clamp(
                impacted_price.value(),
                boundary.max(impacted_price.value()),
            )
        }
    };

    Price::new(executed).ok_or(ExecutionError::Math(math::MathError::Overflow))
}

// 8.15: the hard gate. an applied ADL must have lowered the ratio, strictly.
pub fn validate_adl(starting_factor: Decimal, new_factor: Decimal) -> Result<(), ExecutionError> {
    if new_factor.abs() >= starting_factor.abs() {
        return Err(ExecutionError::PnlFactorNotReduced);
    }
    Ok(())
}

// pool value of one side in USD, shared by eligibility and pricing
pub fn pool_usd(
    snapshot: &MarketSnapshot,
    side: Side,
    collateral_price: Price,
    collateral_base_unit: BaseUnit,
) -> Result<Usd, ExecutionError> {
    Ok(math::to_usd(
        snapshot.pool_balance(side),
        collateral_price,
        collateral_base_unit,
    )?)
}
