// 8.1: the settlement pipeline. a request moves through price validation,
// impact application, fee computation, and classification; every step is a
// pure function threading the ExecutionPrices and FeeState accumulators so
// nothing mutates shared state until the dispatcher commits. this file has
// the entry/increase half; decreases and liquidations live in decrease.rs.

use crate::borrowing::{self, BorrowState};
use crate::config::MarketParams;
use crate::funding;
use crate::math;
use crate::position::{self, Position};
use crate::price_feed::PriceFeed;
use crate::price_impact;
use crate::referral::ReferralLedger;
use crate::request::Request;
use crate::types::{
    BaseUnit, Price, SignedUsd, Timestamp, TokenAmount, UserId, Usd,
};
use crate::vault::MarketSnapshot;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::results::ExecutionError;

// oracle-derived prices for exactly one execution attempt. never cached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionPrices {
    pub index_price: Price,
    pub impacted_price: Price,
    pub index_base_unit: BaseUnit,
    pub long_token_price: Price,
    pub short_token_price: Price,
    pub price_impact_usd: SignedUsd,
    pub collateral_price: Price,
    pub collateral_base_unit: BaseUnit,
}

// accumulator produced once per execution and consumed by the dispatcher
// to move tokens. all amounts in USD until the final transfer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeState {
    pub after_fee_amount: Usd,
    pub funding_fee: SignedUsd,
    pub borrow_fee: Usd,
    pub position_fee: Usd,
    pub fee_for_executor: Usd,
    pub affiliate_rebate: Usd,
    pub realized_pnl: SignedUsd,
    pub amount_owed_to_user: Usd,
    pub fees_to_accumulate: Usd,
    pub referrer: Option<UserId>,
    pub is_liquidation: bool,
    pub is_full_decrease: bool,
}

impl FeeState {
    pub fn empty() -> Self {
        Self {
            after_fee_amount: Usd::zero(),
            funding_fee: SignedUsd::zero(),
            borrow_fee: Usd::zero(),
            position_fee: Usd::zero(),
            fee_for_executor: Usd::zero(),
            affiliate_rebate: Usd::zero(),
            realized_pnl: SignedUsd::zero(),
            amount_owed_to_user: Usd::zero(),
            fees_to_accumulate: Usd::zero(),
            referrer: None,
            is_liquidation: false,
            is_full_decrease: false,
        }
    }
}

// protocol-wide fee scalars pulled from storage once per execution
#[derive(Debug, Clone, Copy)]
pub struct ProtocolFees {
    pub trading_fee: Decimal,
    pub liquidation_fee: Decimal,
    pub adl_fee: Decimal,
    pub min_collateral_usd: Usd,
}

// market accumulators advanced to the settlement time, plus static params.
// handlers read these instead of touching the vault.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub market: MarketParams,
    pub fees: ProtocolFees,
    pub funding_accrued: Decimal,
    pub borrowing: BorrowState,
    pub now: Timestamp,
}

// 8.2: a price request is exclusive to its requester until it expires;
// afterwards anyone may execute it so a missing keeper cannot strand a user.
pub fn validate_price_request(
    feed: &impl PriceFeed,
    request: &Request,
    executor: UserId,
    now: Timestamp,
) -> Result<Timestamp, ExecutionError> {
    let data = feed.request_data(request.request_id)?;
    if data.block_timestamp < request.requested_at {
        return Err(ExecutionError::InvalidRequestTimestamp);
    }
    let exclusive_until = data.block_timestamp.add_millis(feed.time_to_expiration());
    if executor != data.requester && now < exclusive_until {
        return Err(ExecutionError::InvalidExecutor);
    }
    Ok(data.block_timestamp)
}

// 8.3: direction-correct oracle selection. the index price is maximized
// exactly when side != increase, and the collateral token is valued with
// the same orientation.
pub fn fetch_prices(
    feed: &impl PriceFeed,
    request: &Request,
    price_timestamp: Timestamp,
) -> Result<ExecutionPrices, ExecutionError> {
    let maximize = request.input.side.is_long() != request.input.is_increase;

    let ticker = &request.input.ticker;
    let index_price = if maximize {
        feed.max_price(ticker, price_timestamp)?
    } else {
        feed.min_price(ticker, price_timestamp)?
    };
    let (long_token_price, short_token_price) = if maximize {
        feed.max_vault_prices(price_timestamp)?
    } else {
        feed.min_vault_prices(price_timestamp)?
    };

    let collateral_price = if request.input.side.is_long() {
        long_token_price
    } else {
        short_token_price
    };

    Ok(ExecutionPrices {
        index_price,
        impacted_price: index_price,
        index_base_unit: feed.base_unit(ticker)?,
        long_token_price,
        short_token_price,
        price_impact_usd: SignedUsd::zero(),
        collateral_price,
        collateral_base_unit: feed.base_unit(&request.input.collateral_token)?,
    })
}

// impact only applies when the order moves open interest; markets with a
// zero impact factor execute at index
pub fn apply_impact(
    prices: ExecutionPrices,
    market: &MarketParams,
    snapshot: &MarketSnapshot,
    request: &Request,
) -> Result<ExecutionPrices, ExecutionError> {
    if request.input.size_delta.is_zero() || market.impact.factor.is_zero() {
        return Ok(prices);
    }
    let outcome = price_impact::execute(
        &market.impact,
        snapshot.long_open_interest,
        snapshot.short_open_interest,
        request.input.side,
        request.input.is_increase,
        request.input.size_delta,
        prices.index_price,
        request.input.max_slippage,
    )?;
    Ok(ExecutionPrices {
        impacted_price: outcome.impacted_price,
        price_impact_usd: outcome.impact_usd,
        ..prices
    })
}

// 8.4: allocation headroom. the size the order adds must be reservable
// from the collateral-side pool.
pub fn check_allocation(
    size_delta: Usd,
    prices: &ExecutionPrices,
    available: TokenAmount,
) -> Result<TokenAmount, ExecutionError> {
    let required = math::from_usd(
        size_delta,
        prices.collateral_price,
        prices.collateral_base_unit,
    )?;
    if required > available {
        return Err(ExecutionError::InsufficientAvailableLiquidity);
    }
    Ok(required)
}

fn limit_gate(request: &Request, prices: &ExecutionPrices) -> Result<(), ExecutionError> {
    if request.limit_met(prices.index_price) {
        Ok(())
    } else {
        Err(ExecutionError::LimitPriceNotMet)
    }
}

// price validation + impact + limit check in pipeline order
pub fn initiate(
    feed: &impl PriceFeed,
    market: &MarketParams,
    snapshot: &MarketSnapshot,
    request: &Request,
    executor: UserId,
    now: Timestamp,
) -> Result<ExecutionPrices, ExecutionError> {
    let price_timestamp = validate_price_request(feed, request, executor, now)?;
    let prices = fetch_prices(feed, request, price_timestamp)?;
    limit_gate(request, &prices)?;
    apply_impact(prices, market, snapshot, request)
}

// positive funding is owed by the position and reduces the amount;
// negative funding is owed to it
fn apply_funding(amount: Usd, funding_fee: SignedUsd) -> Result<Usd, ExecutionError> {
    Usd::new(amount.value() - funding_fee.value())
        .ok_or(ExecutionError::FeesExceedCollateralDelta)
}

// trading fee charged on size when size moves, on the collateral delta
// otherwise, split with the referral ledger
fn charge_trading_fee(
    referrals: &impl ReferralLedger,
    ctx: &ExecutionContext,
    request: &Request,
    fee_state: &mut FeeState,
) -> Result<(), ExecutionError> {
    let basis = if request.input.size_delta.is_zero() {
        request.input.collateral_delta
    } else {
        request.input.size_delta
    };
    let gross = math::percentage(basis, ctx.fees.trading_fee)?;
    let split = referrals.apply_fee_discount(request.user, gross);
    fee_state.position_fee = split.discounted_fee;
    fee_state.affiliate_rebate = split.rebate;
    fee_state.referrer = split.referrer;
    Ok(())
}

// 8.5: open a brand-new position. no funding or borrowing has accrued yet;
// the collateral delta pays the trading, rebate, and execution fees and the
// remainder becomes position collateral.
pub fn create_new_position(
    referrals: &impl ReferralLedger,
    ctx: &ExecutionContext,
    request: &Request,
    prices: &ExecutionPrices,
) -> Result<(Position, FeeState), ExecutionError> {
    let mut fee_state = FeeState::empty();
    charge_trading_fee(referrals, ctx, request, &mut fee_state)?;
    fee_state.fee_for_executor = request.input.execution_fee;

    let fees = fee_state
        .position_fee
        .add(fee_state.affiliate_rebate)
        .add(fee_state.fee_for_executor);
    let collateral = request
        .input
        .collateral_delta
        .checked_sub(fees)
        .ok_or(ExecutionError::FeesExceedCollateralDelta)?;
    fee_state.after_fee_amount = collateral;
    fee_state.fees_to_accumulate = fee_state.position_fee;

    if collateral < ctx.fees.min_collateral_usd {
        return Err(ExecutionError::MinCollateralThreshold);
    }
    position::check_leverage(ctx.market.max_leverage, request.input.size_delta, collateral)?;

    let mut new_position = Position::open(
        request.input.ticker.clone(),
        request.user,
        request.input.collateral_token.clone(),
        request.input.side,
        collateral,
        request.input.size_delta,
        prices.impacted_price,
        ctx.now,
    );
    new_position.funding.last_funding_accrued = ctx.funding_accrued;
    new_position.borrowing.last_long_cumulative = ctx.borrowing.long_cumulative;
    new_position.borrowing.last_short_cumulative = ctx.borrowing.short_cumulative;

    validate_new_position(&new_position, &fee_state, request)?;
    Ok((new_position, fee_state))
}

// collateral delta accounting must reconcile to the cent
fn validate_new_position(
    new_position: &Position,
    fee_state: &FeeState,
    request: &Request,
) -> Result<(), ExecutionError> {
    let reconstructed = new_position
        .collateral
        .add(fee_state.position_fee)
        .add(fee_state.affiliate_rebate)
        .add(fee_state.fee_for_executor);
    if reconstructed != request.input.collateral_delta || !new_position.is_open() {
        return Err(ExecutionError::InvalidPosition);
    }
    Ok(())
}

// 8.6: grow an existing position. outstanding funding and borrowing are
// settled into the after-fee amount first, then size and the weighted
// average entry move together.
pub fn increase_position(
    referrals: &impl ReferralLedger,
    ctx: &ExecutionContext,
    existing: &Position,
    request: &Request,
    prices: &ExecutionPrices,
) -> Result<(Position, FeeState), ExecutionError> {
    let mut fee_state = FeeState::empty();
    charge_trading_fee(referrals, ctx, request, &mut fee_state)?;
    fee_state.fee_for_executor = request.input.execution_fee;

    let (settled, funding_owed) = funding::settle_funding(existing, ctx.funding_accrued);
    let (settled, borrow_owed) = borrowing::settle_borrowing(&settled, &ctx.borrowing);
    fee_state.funding_fee = funding_owed;
    fee_state.borrow_fee = borrow_owed;

    let fees = fee_state
        .position_fee
        .add(fee_state.affiliate_rebate)
        .add(fee_state.fee_for_executor)
        .add(fee_state.borrow_fee);
    let after_fees = request
        .input
        .collateral_delta
        .checked_sub(fees)
        .ok_or(ExecutionError::FeesExceedCollateralDelta)?;
    fee_state.after_fee_amount = apply_funding(after_fees, fee_state.funding_fee)?;
    fee_state.fees_to_accumulate = fee_state.position_fee.add(fee_state.borrow_fee);

    let new_collateral = settled.collateral.add(fee_state.after_fee_amount);
    let new_size = settled.size.add(request.input.size_delta);
    let new_waep = position::calculate_weighted_average_entry_price(
        settled.weighted_avg_entry_price,
        settled.size,
        SignedUsd::from(request.input.size_delta),
        prices.impacted_price,
    )?;

    if new_collateral < ctx.fees.min_collateral_usd {
        return Err(ExecutionError::MinCollateralThreshold);
    }
    position::check_leverage(ctx.market.max_leverage, new_size, new_collateral)?;

    let mut updated = settled;
    updated.collateral = new_collateral;
    updated.size = new_size;
    updated.weighted_avg_entry_price = new_waep;
    updated.last_update = ctx.now;

    validate_increase(existing, &updated, &fee_state, request)?;
    Ok((updated, fee_state))
}

// newCollateral == oldCollateral + (delta - positionFee - borrowFee -
// rebate - executorFee -+ fundingFee), exactly
fn validate_increase(
    old: &Position,
    new: &Position,
    fee_state: &FeeState,
    request: &Request,
) -> Result<(), ExecutionError> {
    let expected = old.collateral.value() + request.input.collateral_delta.value()
        - fee_state.position_fee.value()
        - fee_state.borrow_fee.value()
        - fee_state.affiliate_rebate.value()
        - fee_state.fee_for_executor.value()
        - fee_state.funding_fee.value();
    if new.collateral.value() != expected || !new.is_open() {
        return Err(ExecutionError::InvalidPosition);
    }
    Ok(())
}

// 8.7: add collateral without touching size. leverage falls; the only way
// this can fail structurally is collateral overtaking size.
pub fn increase_collateral(
    referrals: &impl ReferralLedger,
    ctx: &ExecutionContext,
    existing: &Position,
    request: &Request,
) -> Result<(Position, FeeState), ExecutionError> {
    let mut fee_state = FeeState::empty();
    charge_trading_fee(referrals, ctx, request, &mut fee_state)?;
    fee_state.fee_for_executor = request.input.execution_fee;

    let (settled, funding_owed) = funding::settle_funding(existing, ctx.funding_accrued);
    let (settled, borrow_owed) = borrowing::settle_borrowing(&settled, &ctx.borrowing);
    fee_state.funding_fee = funding_owed;
    fee_state.borrow_fee = borrow_owed;

    let fees = fee_state
        .position_fee
        .add(fee_state.affiliate_rebate)
        .add(fee_state.fee_for_executor)
        .add(fee_state.borrow_fee);
    let after_fees = request
        .input
        .collateral_delta
        .checked_sub(fees)
        .ok_or(ExecutionError::FeesExceedCollateralDelta)?;
    fee_state.after_fee_amount = apply_funding(after_fees, fee_state.funding_fee)?;
    fee_state.fees_to_accumulate = fee_state.position_fee.add(fee_state.borrow_fee);

    let new_collateral = settled.collateral.add(fee_state.after_fee_amount);
    position::check_leverage(ctx.market.max_leverage, settled.size, new_collateral)?;

    let mut updated = settled;
    updated.collateral = new_collateral;
    updated.last_update = ctx.now;

    validate_increase(existing, &updated, &fee_state, request)?;
    Ok((updated, fee_state))
}
