// 8.8: the decrease half of the pipeline. resolves the effective deltas,
// realizes pnl for the closed fraction, and classifies the outcome: a normal
// decrease pays the user, a liquidation runs the insolvency fee waterfall
// and credits the remainder to the pool. the boundary is inclusive: losses
// equal to maintenance collateral liquidate.

use crate::borrowing;
use crate::funding;
use crate::math;
use crate::position::{self, Position};
use crate::referral::ReferralLedger;
use crate::request::Request;
use crate::types::{OrderKey, SignedUsd, Usd};

use super::execution::{ExecutionContext, ExecutionPrices, FeeState};
use super::results::ExecutionError;

// effective deltas for one decrease, resolved from the request against the
// live position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecreaseState {
    pub collateral_delta: Usd,
    pub size_delta: Usd,
    pub is_full: bool,
}

// full close when either delta covers the whole position; proportional
// collateral when the request leaves it unspecified
pub fn resolve_decrease(
    existing: &Position,
    request: &Request,
) -> Result<DecreaseState, ExecutionError> {
    let requested_size = request.input.size_delta;
    let requested_collateral = request.input.collateral_delta;

    if requested_size >= existing.size || requested_collateral >= existing.collateral {
        return Ok(DecreaseState {
            collateral_delta: existing.collateral,
            size_delta: existing.size,
            is_full: true,
        });
    }

    let collateral_delta = if requested_collateral.is_zero() {
        let fraction = math::checked_div(requested_size.value(), existing.size.value())?;
        existing.collateral.mul(fraction)
    } else {
        requested_collateral
    };

    Ok(DecreaseState {
        collateral_delta,
        size_delta: requested_size,
        is_full: false,
    })
}

// everything the position is about to lose, measured against the whole
// position's maintenance collateral
fn total_losses(fee_state: &FeeState) -> Usd {
    let fees = fee_state
        .position_fee
        .add(fee_state.affiliate_rebate)
        .add(fee_state.fee_for_executor)
        .add(fee_state.borrow_fee);
    let funding_loss = if fee_state.funding_fee.is_positive() {
        fee_state.funding_fee.abs()
    } else {
        Usd::zero()
    };
    let pnl_loss = if fee_state.realized_pnl.is_negative() {
        fee_state.realized_pnl.abs()
    } else {
        Usd::zero()
    };
    fees.add(funding_loss).add(pnl_loss)
}

fn settle_and_charge(
    referrals: &impl ReferralLedger,
    ctx: &ExecutionContext,
    existing: &Position,
    request: &Request,
    prices: &ExecutionPrices,
    resolved: &DecreaseState,
    executor_fee: Usd,
) -> Result<(Position, FeeState), ExecutionError> {
    let mut fee_state = FeeState::empty();
    fee_state.is_full_decrease = resolved.is_full;
    fee_state.fee_for_executor = executor_fee;

    let gross = math::percentage(resolved.size_delta, ctx.fees.trading_fee)?;
    let split = referrals.apply_fee_discount(request.user, gross);
    fee_state.position_fee = split.discounted_fee;
    fee_state.affiliate_rebate = split.rebate;
    fee_state.referrer = split.referrer;

    let (settled, funding_owed) = funding::settle_funding(existing, ctx.funding_accrued);
    let (settled, borrow_owed) = borrowing::settle_borrowing(&settled, &ctx.borrowing);
    fee_state.funding_fee = funding_owed;
    fee_state.borrow_fee = borrow_owed;
    fee_state.fees_to_accumulate = fee_state.position_fee.add(fee_state.borrow_fee);

    fee_state.realized_pnl = position::realized_pnl_usd(
        settled.size,
        settled.weighted_avg_entry_price,
        prices.impacted_price,
        settled.side,
        resolved.size_delta,
    )?;

    Ok((settled, fee_state))
}

// the whole position's losses crossing its maintenance collateral is what
// separates a decrease from a liquidation
pub fn is_liquidatable(fee_state: &FeeState, existing: &Position, ctx: &ExecutionContext) -> bool {
    let maintenance =
        position::maintenance_collateral(existing.collateral, ctx.market.maintenance_margin);
    total_losses(fee_state) >= maintenance
}

// 8.9: normal decrease. pays out collateral delta plus realized pnl minus
// fees, and re-checks the surviving position's health.
#[allow(clippy::too_many_arguments)]
pub fn decrease_position(
    referrals: &impl ReferralLedger,
    ctx: &ExecutionContext,
    existing: &Position,
    request: &Request,
    prices: &ExecutionPrices,
    order_key: OrderKey,
) -> Result<(Option<Position>, FeeState, DecreaseState), ExecutionError> {
    let mut working = existing.clone();
    working.clear_matching_conditional(order_key);

    let resolved = resolve_decrease(&working, request)?;
    let (settled, mut fee_state) = settle_and_charge(
        referrals,
        ctx,
        &working,
        request,
        prices,
        &resolved,
        request.input.execution_fee,
    )?;

    // a decrease that leaves nothing for the user is a liquidation in
    // disguise and must go through the liquidation path
    if is_liquidatable(&fee_state, existing, ctx) {
        return Err(ExecutionError::LiquidatablePosition);
    }

    let fees = fee_state
        .position_fee
        .add(fee_state.affiliate_rebate)
        .add(fee_state.fee_for_executor)
        .add(fee_state.borrow_fee);
    let gross = resolved.collateral_delta.value() + fee_state.realized_pnl.value()
        - fees.value()
        - fee_state.funding_fee.value();
    let payout = Usd::new(gross).ok_or(ExecutionError::FeesExceedCollateralDelta)?;
    fee_state.after_fee_amount = payout;
    fee_state.amount_owed_to_user = payout;

    if resolved.is_full {
        return Ok((None, fee_state, resolved));
    }

    let remaining_size = settled.size.sub(resolved.size_delta);
    let remaining_collateral = settled.collateral.sub(resolved.collateral_delta);
    let new_waep = position::calculate_weighted_average_entry_price(
        settled.weighted_avg_entry_price,
        settled.size,
        SignedUsd::from(resolved.size_delta).negate(),
        prices.impacted_price,
    )?;

    if remaining_collateral < ctx.fees.min_collateral_usd {
        return Err(ExecutionError::MinCollateralThreshold);
    }
    position::check_leverage(ctx.market.max_leverage, remaining_size, remaining_collateral)?;

    // the survivor must not be born liquidatable
    let remaining_pnl = position::position_pnl(
        remaining_size,
        new_waep,
        prices.index_price,
        settled.side,
    )?;
    let unrealized_loss = if remaining_pnl.is_negative() {
        remaining_pnl.abs()
    } else {
        Usd::zero()
    };
    let maintenance = position::maintenance_collateral(
        remaining_collateral,
        ctx.market.maintenance_margin,
    );
    if unrealized_loss >= maintenance {
        return Err(ExecutionError::LiquidatablePosition);
    }

    let mut updated = settled;
    updated.size = remaining_size;
    updated.collateral = remaining_collateral;
    updated.weighted_avg_entry_price = new_waep;
    updated.last_update = ctx.now;
    Ok((Some(updated), fee_state, resolved))
}

// 8.9.1: withdraw collateral without touching size. fees and settled
// funding come out of the withdrawn amount; the survivor is re-checked
// for minimum collateral, leverage, and health.
pub fn decrease_collateral(
    referrals: &impl ReferralLedger,
    ctx: &ExecutionContext,
    existing: &Position,
    request: &Request,
    prices: &ExecutionPrices,
) -> Result<(Position, FeeState), ExecutionError> {
    let mut fee_state = FeeState::empty();
    fee_state.fee_for_executor = request.input.execution_fee;

    let gross = math::percentage(request.input.collateral_delta, ctx.fees.trading_fee)?;
    let split = referrals.apply_fee_discount(request.user, gross);
    fee_state.position_fee = split.discounted_fee;
    fee_state.affiliate_rebate = split.rebate;
    fee_state.referrer = split.referrer;

    let (settled, funding_owed) = funding::settle_funding(existing, ctx.funding_accrued);
    let (settled, borrow_owed) = borrowing::settle_borrowing(&settled, &ctx.borrowing);
    fee_state.funding_fee = funding_owed;
    fee_state.borrow_fee = borrow_owed;
    fee_state.fees_to_accumulate = fee_state.position_fee.add(fee_state.borrow_fee);

    let new_collateral = settled
        .collateral
        .checked_sub(request.input.collateral_delta)
        .ok_or(ExecutionError::InvalidPosition)?;

    let fees = fee_state
        .position_fee
        .add(fee_state.affiliate_rebate)
        .add(fee_state.fee_for_executor)
        .add(fee_state.borrow_fee);
    let gross_payout = request.input.collateral_delta.value() - fees.value()
        - fee_state.funding_fee.value();
    let payout = Usd::new(gross_payout).ok_or(ExecutionError::FeesExceedCollateralDelta)?;
    fee_state.after_fee_amount = payout;
    fee_state.amount_owed_to_user = payout;

    if new_collateral < ctx.fees.min_collateral_usd {
        return Err(ExecutionError::MinCollateralThreshold);
    }
    position::check_leverage(ctx.market.max_leverage, settled.size, new_collateral)?;

    let unrealized = position::position_pnl(
        settled.size,
        settled.weighted_avg_entry_price,
        prices.index_price,
        settled.side,
    )?;
    let unrealized_loss = if unrealized.is_negative() {
        unrealized.abs()
    } else {
        Usd::zero()
    };
    let maintenance =
        position::maintenance_collateral(new_collateral, ctx.market.maintenance_margin);
    if unrealized_loss >= maintenance {
        return Err(ExecutionError::LiquidatablePosition);
    }

    let mut updated = settled;
    updated.collateral = new_collateral;
    updated.last_update = ctx.now;
    Ok((updated, fee_state))
}

// 8.10: the insolvency fee waterfall. fixed priority under a shrinking
// remainder: liquidator, then LPs' borrow fees, then LPs' trading fee, then
// the referrer. whatever is left is credited back to the pool. the sum of
// all payments can never exceed the collateral that was there.
pub fn adjust_fees_for_insolvency(fee_state: &mut FeeState, remaining_collateral: Usd) -> Usd {
    let mut remaining = remaining_collateral;

    // the liquidation fee is a fraction of collateral, so it always fits
    fee_state.fee_for_executor = fee_state.fee_for_executor.min(remaining);
    remaining = remaining.sub(fee_state.fee_for_executor);

    fee_state.borrow_fee = fee_state.borrow_fee.min(remaining);
    remaining = remaining.sub(fee_state.borrow_fee);

    fee_state.position_fee = fee_state.position_fee.min(remaining);
    remaining = remaining.sub(fee_state.position_fee);

    fee_state.affiliate_rebate = fee_state.affiliate_rebate.min(remaining);
    remaining = remaining.sub(fee_state.affiliate_rebate);

    fee_state.fees_to_accumulate = fee_state.position_fee.add(fee_state.borrow_fee);
    remaining
}

// 8.11: liquidation. forced full close; the user receives nothing, the
// waterfall decides who gets paid, and the remainder returns to the pool.
pub fn liquidate_position(
    referrals: &impl ReferralLedger,
    ctx: &ExecutionContext,
    existing: &Position,
    request: &Request,
    prices: &ExecutionPrices,
) -> Result<(FeeState, DecreaseState), ExecutionError> {
    let resolved = DecreaseState {
        collateral_delta: existing.collateral,
        size_delta: existing.size,
        is_full: true,
    };

    let liquidation_fee = math::percentage(existing.collateral, ctx.fees.liquidation_fee)?;
    let (_, mut fee_state) = settle_and_charge(
        referrals,
        ctx,
        existing,
        request,
        prices,
        &resolved,
        liquidation_fee,
    )?;
    fee_state.is_liquidation = true;
    fee_state.is_full_decrease = true;

    if !is_liquidatable(&fee_state, existing, ctx) {
        return Err(ExecutionError::PositionNotLiquidatable);
    }

    let remainder = adjust_fees_for_insolvency(&mut fee_state, existing.collateral);
    fee_state.after_fee_amount = remainder;
    fee_state.amount_owed_to_user = Usd::zero();

    Ok((fee_state, resolved))
}
