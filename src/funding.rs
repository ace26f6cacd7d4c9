// 5.0: velocity-based funding. the rate drifts linearly under a velocity set
// by pool skew; accrued funding is the time integral of the rate, tracked as
// rate-seconds per USD of position size. longs pay when accrued rises.
// 5.2 has the interval integration with boundary and sign-flip splitting.

use crate::position::Position;
use crate::types::{Side, SignedUsd, Timestamp, Usd};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingParams {
    // per-second rate bounds
    pub max_rate: Decimal,
    pub min_rate: Decimal,
    // per-second^2 velocity bound, reached at full skew
    pub max_velocity: Decimal,
    // USD skew at which velocity saturates
    pub skew_scale: Decimal,
}

impl Default for FundingParams {
    fn default() -> Self {
        Self {
            max_rate: dec!(0.0000005),
            min_rate: dec!(-0.0000005),
            max_velocity: dec!(0.000000001),
            skew_scale: dec!(1_000_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingState {
    pub rate: Decimal,
    pub velocity: Decimal,
    // cumulative rate-seconds per USD of size since market creation
    pub accrued: Decimal,
    pub last_update: Timestamp,
}

impl FundingState {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            rate: Decimal::ZERO,
            velocity: Decimal::ZERO,
            accrued: Decimal::ZERO,
            last_update: timestamp,
        }
    }
}

// 5.1: velocity follows skew. long-heavy markets push the rate up so longs pay.
pub fn velocity_from_skew(params: &FundingParams, skew_usd: SignedUsd) -> Decimal {
    if params.skew_scale.is_zero() {
        return Decimal::ZERO;
    }
    let proportion = (skew_usd.value() / params.skew_scale)
        .max(dec!(-1))
        .min(dec!(1));
    params.max_velocity * proportion
}

fn clamp_rate(rate: Decimal, params: &FundingParams) -> Decimal {
    rate.max(params.min_rate).min(params.max_rate)
}

// closed-form sum of a linear rate segment: (start + end) / 2 * dt
fn trapezoid(start: Decimal, end: Decimal, dt: Decimal) -> Decimal {
    (start + end) / dec!(2) * dt
}

// a linear segment that crosses zero is summed as two triangles so each
// signed half is exact
fn linear_segment(start: Decimal, velocity: Decimal, dt: Decimal) -> Decimal {
    if dt <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let end = start + velocity * dt;
    let crosses_zero = (start > Decimal::ZERO && end < Decimal::ZERO)
        || (start < Decimal::ZERO && end > Decimal::ZERO);
    if crosses_zero && !velocity.is_zero() {
        let t_zero = -start / velocity;
        trapezoid(start, Decimal::ZERO, t_zero) + trapezoid(Decimal::ZERO, end, dt - t_zero)
    } else {
        trapezoid(start, end, dt)
    }
}

// 5.2: integrate the rate from last update to now. the path is linear until it
// hits a rate boundary, then flat at the boundary; each piece is summed at the
// rate actually in force. splitting the interval at any point and summing the
// halves equals integrating the whole interval.
pub fn calculate_next_funding(
    state: &FundingState,
    params: &FundingParams,
    now: Timestamp,
) -> (Decimal, Decimal) {
    let elapsed = state.last_update.elapsed_seconds(&now);
    let rate = clamp_rate(state.rate, params);
    if elapsed.is_zero() {
        return (rate, state.accrued);
    }

    let velocity = state.velocity;
    let next_rate = clamp_rate(rate + velocity * elapsed, params);

    let accrued_delta = if velocity.is_zero() {
        rate * elapsed
    } else {
        let boundary = if velocity > Decimal::ZERO {
            params.max_rate
        } else {
            params.min_rate
        };
        // time until the linear path hits the boundary
        let t_boundary = ((boundary - rate) / velocity).max(Decimal::ZERO);
        let t_linear = t_boundary.min(elapsed);
        let linear = linear_segment(rate, velocity, t_linear);
        let flat = boundary * (elapsed - t_linear).max(Decimal::ZERO);
        linear + flat
    };

    (next_rate, state.accrued + accrued_delta)
}

// advances the state to now and re-derives velocity from the current skew
pub fn advance_funding(
    state: &FundingState,
    params: &FundingParams,
    skew_usd: SignedUsd,
    now: Timestamp,
) -> FundingState {
    let (rate, accrued) = calculate_next_funding(state, params, now);
    FundingState {
        rate,
        velocity: velocity_from_skew(params, skew_usd),
        accrued,
        last_update: now,
    }
}

// 5.3: fee owed on a slice of size between two accrual checkpoints.
// positive = the position owes the pool, per the side's sign.
pub fn funding_fee_delta(
    side: Side,
    size: Usd,
    accrued_now: Decimal,
    entry_accrued: Decimal,
) -> SignedUsd {
    SignedUsd::new(side.sign() * size.value() * (accrued_now - entry_accrued))
}

// 5.4: realize all outstanding funding into the position and move its
// checkpoint forward. read-and-checkpoint is one operation so a settlement
// can never read accrual without consuming it.
pub fn settle_funding(position: &Position, accrued_now: Decimal) -> (Position, SignedUsd) {
    let delta = funding_fee_delta(
        position.side,
        position.size,
        accrued_now,
        position.funding.last_funding_accrued,
    );
    let owed = position.funding.funding_owed.add(delta);

    let mut settled = position.clone();
    settled.funding.last_funding_accrued = accrued_now;
    settled.funding.funding_owed = SignedUsd::zero();
    (settled, owed)
}
