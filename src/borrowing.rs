// 5.5: borrowing fees. each side of a market accumulates a cumulative
// per-USD borrow charge; positions checkpoint the accumulator at every
// settlement and owe the difference times their size. rates follow
// reserve utilization.

use crate::position::Position;
use crate::types::{Side, Timestamp, Usd};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorrowState {
    // per-second rates, re-derived from utilization on every market update
    pub long_rate: Decimal,
    pub short_rate: Decimal,
    // cumulative rate-seconds per USD of size since market creation
    pub long_cumulative: Decimal,
    pub short_cumulative: Decimal,
    pub last_update: Timestamp,
}

impl BorrowState {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            long_rate: Decimal::ZERO,
            short_rate: Decimal::ZERO,
            long_cumulative: Decimal::ZERO,
            short_cumulative: Decimal::ZERO,
            last_update: timestamp,
        }
    }

    pub fn rate(&self, side: Side) -> Decimal {
        match side {
            Side::Long => self.long_rate,
            Side::Short => self.short_rate,
        }
    }

    pub fn cumulative(&self, side: Side) -> Decimal {
        match side {
            Side::Long => self.long_cumulative,
            Side::Short => self.short_cumulative,
        }
    }
}

// charge accrued on one side since the last global update
pub fn pending_cumulative(state: &BorrowState, side: Side, now: Timestamp) -> Decimal {
    state.rate(side) * state.last_update.elapsed_seconds(&now)
}

// rate scales linearly with how much of the side's liquidity is reserved
pub fn rate_for_utilization(rate_factor: Decimal, utilization: Decimal) -> Decimal {
    rate_factor * utilization.max(Decimal::ZERO).min(Decimal::ONE)
}

// 5.6: roll both cumulative accumulators forward and re-derive rates.
pub fn advance_borrowing(
    state: &BorrowState,
    rate_factor: Decimal,
    long_utilization: Decimal,
    short_utilization: Decimal,
    now: Timestamp,
) -> BorrowState {
    let elapsed = state.last_update.elapsed_seconds(&now);
    BorrowState {
        long_rate: rate_for_utilization(rate_factor, long_utilization),
        short_rate: rate_for_utilization(rate_factor, short_utilization),
        long_cumulative: state.long_cumulative + state.long_rate * elapsed,
        short_cumulative: state.short_cumulative + state.short_rate * elapsed,
        last_update: now,
    }
}

fn checkpoint(position: &Position, side: Side) -> Decimal {
    match side {
        Side::Long => position.borrowing.last_long_cumulative,
        Side::Short => position.borrowing.last_short_cumulative,
    }
}

// 5.7: everything the position owes: accumulator delta since its checkpoint,
// charges pending since the last global update, and any carried fees_owed.
pub fn total_borrow_fees_usd(position: &Position, state: &BorrowState, now: Timestamp) -> Usd {
    let side = position.side;
    let accrued =
        state.cumulative(side) + pending_cumulative(state, side, now) - checkpoint(position, side);
    let fee = Usd::new_unchecked(accrued.max(Decimal::ZERO) * position.size.value());
    fee.add(position.borrowing.fees_owed)
}

// realize fees and move the checkpoints forward in one operation. the state
// must already be advanced to the settlement time.
pub fn settle_borrowing(position: &Position, state: &BorrowState) -> (Position, Usd) {
    let side = position.side;
    let accrued = state.cumulative(side) - checkpoint(position, side);
    let fee = Usd::new_unchecked(accrued.max(Decimal::ZERO) * position.size.value());
    let owed = fee.add(position.borrowing.fees_owed);

    let mut settled = position.clone();
    settled.borrowing.fees_owed = Usd::zero();
    settled.borrowing.last_long_cumulative = state.long_cumulative;
    settled.borrowing.last_short_cumulative = state.short_cumulative;
    (settled, owed)
}
