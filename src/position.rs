// 4.0: open position model. size and collateral are USD-denominated; entry is
// tracked as a size-weighted average price. funding and borrowing checkpoints
// live on the position and are consumed at every settlement.
// 4.3 has the pnl math, 4.4 the weighted-average-entry update, 4.6 the
// market-delta invariant check run after every execution.

use crate::math::{self, MathError};
use crate::types::{
    OrderKey, PositionKey, Price, Side, SignedUsd, Ticker, Timestamp, TokenAmount, UserId, Usd,
};
use crate::vault::MarketSnapshot;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PositionError {
    #[error("collateral exceeds size")]
    CollateralExceedsSize,

    #[error("leverage below 1x")]
    BelowMinLeverage,

    #[error("leverage above market maximum")]
    OverMaxLeverage,

    #[error("a live conditional order is already attached")]
    ConditionalAlreadySet,

    #[error("position state is invalid")]
    InvalidPosition,

    #[error("market accumulator moved by an unexpected amount: {0}")]
    MarketDeltaMismatch(&'static str),

    #[error(transparent)]
    Math(#[from] MathError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingCheckpoint {
    // market accrued value at the last settlement of this position
    pub last_funding_accrued: Decimal,
    // funding realized but not yet applied to collateral
    pub funding_owed: SignedUsd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowCheckpoint {
    pub fees_owed: Usd,
    pub last_long_cumulative: Decimal,
    pub last_short_cumulative: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: Ticker,
    pub user: UserId,
    pub collateral_token: Ticker,
    pub side: Side,
    // USD value of posted margin
    pub collateral: Usd,
    // USD notional
    pub size: Usd,
    pub weighted_avg_entry_price: Price,
    pub last_update: Timestamp,
    pub funding: FundingCheckpoint,
    pub borrowing: BorrowCheckpoint,
    pub stop_loss_key: Option<OrderKey>,
    pub take_profit_key: Option<OrderKey>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        ticker: Ticker,
        user: UserId,
        collateral_token: Ticker,
        side: Side,
        collateral: Usd,
        size: Usd,
        entry_price: Price,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            ticker,
            user,
            collateral_token,
            side,
            collateral,
            size,
            weighted_avg_entry_price: entry_price,
            last_update: timestamp,
            funding: FundingCheckpoint {
                last_funding_accrued: Decimal::ZERO,
                funding_owed: SignedUsd::zero(),
            },
            borrowing: BorrowCheckpoint {
                fees_owed: Usd::zero(),
                last_long_cumulative: Decimal::ZERO,
                last_short_cumulative: Decimal::ZERO,
            },
            stop_loss_key: None,
            take_profit_key: None,
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.ticker.clone(), self.user, self.side)
    }

    // a position with zero size or zero collateral must be deleted, never kept
    pub fn is_open(&self) -> bool {
        !self.size.is_zero() && !self.collateral.is_zero()
    }

    pub fn leverage(&self) -> Result<Decimal, MathError> {
        math::checked_div(self.size.value(), self.collateral.value())
    }

    // at most one live stop loss and one live take profit per position
    pub fn attach_stop_loss(&mut self, key: OrderKey) -> Result<(), PositionError> {
        if self.stop_loss_key.is_some() {
            return Err(PositionError::ConditionalAlreadySet);
        }
        self.stop_loss_key = Some(key);
        Ok(())
    }

    pub fn attach_take_profit(&mut self, key: OrderKey) -> Result<(), PositionError> {
        if self.take_profit_key.is_some() {
            return Err(PositionError::ConditionalAlreadySet);
        }
        self.take_profit_key = Some(key);
        Ok(())
    }

    // clears whichever conditional key matches the executing order
    pub fn clear_matching_conditional(&mut self, order_key: OrderKey) {
        if self.stop_loss_key == Some(order_key) {
            self.stop_loss_key = None;
        }
        if self.take_profit_key == Some(order_key) {
            self.take_profit_key = None;
        }
    }
}

// 4.3: whole-position pnl. (index - entry) * size / entry, sign flipped for shorts.
pub fn position_pnl(
    size: Usd,
    avg_entry_price: Price,
    index_price: Price,
    side: Side,
) -> Result<SignedUsd, MathError> {
    let entry = avg_entry_price.value();
    let price_delta = index_price.value() - entry;
    let token_quantity = math::checked_div(size.value(), entry)?;
    Ok(SignedUsd::new(side.sign() * price_delta * token_quantity))
}

// pnl realized by closing size_delta of the position, still in USD
pub fn realized_pnl_usd(
    size: Usd,
    avg_entry_price: Price,
    index_price: Price,
    side: Side,
    size_delta: Usd,
) -> Result<SignedUsd, MathError> {
    let whole = position_pnl(size, avg_entry_price, index_price, side)?;
    let fraction = math::checked_div(size_delta.value(), size.value())?;
    Ok(SignedUsd::new(whole.value() * fraction))
}

// 4.4: weighted average entry price. increases add volume at the execution
// price; decreases remove volume at the execution price, which re-bases the
// average on partial closes.
pub fn calculate_weighted_average_entry_price(
    prev_waep: Price,
    prev_size: Usd,
    signed_size_delta: SignedUsd,
    exec_price: Price,
) -> Result<Price, MathError> {
    let denominator = prev_size.value() + signed_size_delta.value();
    if denominator <= Decimal::ZERO {
        return Err(MathError::DivisionByZero);
    }
    let numerator = prev_waep.value() * prev_size.value()
        + signed_size_delta.value() * exec_price.value();
    let waep = math::checked_div(numerator, denominator)?;
    Price::new(waep).ok_or(MathError::Overflow)
}

// 4.5: leverage gate. 1x <= size/collateral <= market max.
pub fn check_leverage(
    max_leverage: Decimal,
    size: Usd,
    collateral: Usd,
) -> Result<(), PositionError> {
    if collateral > size {
        return Err(PositionError::CollateralExceedsSize);
    }
    let leverage = math::checked_div(size.value(), collateral.value())?;
    if leverage < Decimal::ONE {
        return Err(PositionError::BelowMinLeverage);
    }
    if leverage > max_leverage {
        return Err(PositionError::OverMaxLeverage);
    }
    Ok(())
}

pub fn maintenance_collateral(collateral: Usd, maintenance_margin: Decimal) -> Usd {
    collateral.mul(maintenance_margin)
}

// 4.6: expected movement of every market accumulator for one execution.
// the dispatcher builds this from the fee state and refuses to commit
// unless the ledgers moved by exactly these amounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedDeltas {
    pub side: Side,
    pub open_interest_delta: SignedUsd,
    // collateral-side pool movement, token units, signed
    pub pool_balance_delta: Decimal,
    // trader margin ledger movement, USD, signed
    pub collateral_delta: Decimal,
    // reserved-liquidity movement, token units, signed
    pub reservation_delta: Decimal,
    pub fees_accumulated: TokenAmount,
    // expected post-execution accumulator values
    pub funding_accrued: Decimal,
    pub borrow_cumulative: Decimal,
}

pub fn validate_market_delta(
    before: &MarketSnapshot,
    after: &MarketSnapshot,
    expected: &ExpectedDeltas,
) -> Result<(), PositionError> {
    let oi_before = before.open_interest(expected.side);
    let oi_after = after.open_interest(expected.side);
    if oi_after.value() - oi_before.value() != expected.open_interest_delta.value() {
        return Err(PositionError::MarketDeltaMismatch("open interest"));
    }

    let pool_delta = after.pool_balance(expected.side).value()
        - before.pool_balance(expected.side).value();
    if pool_delta != expected.pool_balance_delta {
        return Err(PositionError::MarketDeltaMismatch("pool balance"));
    }

    let collateral_delta = after.collateral(expected.side).value()
        - before.collateral(expected.side).value();
    if collateral_delta != expected.collateral_delta {
        return Err(PositionError::MarketDeltaMismatch("collateral"));
    }

    let reserved_delta =
        after.reserved(expected.side).value() - before.reserved(expected.side).value();
    if reserved_delta != expected.reservation_delta {
        return Err(PositionError::MarketDeltaMismatch("liquidity reservation"));
    }

    let fee_delta = after.accumulated_fees(expected.side).value()
        - before.accumulated_fees(expected.side).value();
    if fee_delta != expected.fees_accumulated.value() {
        return Err(PositionError::MarketDeltaMismatch("accumulated fees"));
    }

    if after.funding.accrued != expected.funding_accrued {
        return Err(PositionError::MarketDeltaMismatch("funding accrued"));
    }
    if after.borrowing.cumulative(expected.side) != expected.borrow_cumulative {
        return Err(PositionError::MarketDeltaMismatch("borrow cumulative"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_position() -> Position {
        Position::open(
            Ticker::new("ETH"),
            UserId(1),
            Ticker::new("ETH"),
            Side::Long,
            Usd::new_unchecked(dec!(500)),
            Usd::new_unchecked(dec!(10_000)),
            Price::new_unchecked(dec!(2000)),
            Timestamp::from_millis(0),
        )
    }

    #[test]
    fn pnl_long_gain() {
        // $10,000 long from $2,000; index at $2,100 is a 5% move on 5 tokens
        let pnl = position_pnl(
            Usd::new_unchecked(dec!(10_000)),
            Price::new_unchecked(dec!(2000)),
            Price::new_unchecked(dec!(2100)),
            Side::Long,
        )
        .unwrap();
        assert_eq!(pnl.value(), dec!(500));
    }

    #[test]
    fn pnl_short_mirror() {
        let pnl = position_pnl(
            Usd::new_unchecked(dec!(10_000)),
            Price::new_unchecked(dec!(2000)),
            Price::new_unchecked(dec!(2100)),
            Side::Short,
        )
        .unwrap();
        assert_eq!(pnl.value(), dec!(-500));
    }

    #[test]
    fn realized_fraction_scales() {
        let pnl = realized_pnl_usd(
            Usd::new_unchecked(dec!(10_000)),
            Price::new_unchecked(dec!(2000)),
            Price::new_unchecked(dec!(2100)),
            Side::Long,
            Usd::new_unchecked(dec!(2_500)),
        )
        .unwrap();
        // quarter of the position, quarter of the pnl
        assert_eq!(pnl.value(), dec!(125));
    }

    #[test]
    fn waep_increase_averages() {
        let waep = calculate_weighted_average_entry_price(
            Price::new_unchecked(dec!(2000)),
            Usd::new_unchecked(dec!(10_000)),
            SignedUsd::new(dec!(10_000)),
            Price::new_unchecked(dec!(2200)),
        )
        .unwrap();
        assert_eq!(waep.value(), dec!(2100));
    }

    #[test]
    fn waep_decrease_removes_at_exec_price() {
        // closing volume at a different price re-bases the average
        let waep = calculate_weighted_average_entry_price(
            Price::new_unchecked(dec!(2000)),
            Usd::new_unchecked(dec!(10_000)),
            SignedUsd::new(dec!(-5_000)),
            Price::new_unchecked(dec!(2200)),
        )
        .unwrap();
        // (2000*10000 - 2200*5000) / 5000 = 1800
        assert_eq!(waep.value(), dec!(1800));
    }

    #[test]
    fn waep_full_close_rejected() {
        let result = calculate_weighted_average_entry_price(
            Price::new_unchecked(dec!(2000)),
            Usd::new_unchecked(dec!(10_000)),
            SignedUsd::new(dec!(-10_000)),
            Price::new_unchecked(dec!(2200)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn leverage_gate() {
        // 100x against a 50x cap
        let result = check_leverage(
            dec!(50),
            Usd::new_unchecked(dec!(10_000)),
            Usd::new_unchecked(dec!(100)),
        );
        assert_eq!(result, Err(PositionError::OverMaxLeverage));

        // collateral above size
        let result = check_leverage(
            dec!(50),
            Usd::new_unchecked(dec!(100)),
            Usd::new_unchecked(dec!(200)),
        );
        assert_eq!(result, Err(PositionError::CollateralExceedsSize));

        // 20x is fine
        assert!(check_leverage(
            dec!(50),
            Usd::new_unchecked(dec!(10_000)),
            Usd::new_unchecked(dec!(500)),
        )
        .is_ok());
    }

    #[test]
    fn conditional_attachment_is_exclusive() {
        let mut position = test_position();
        position.attach_stop_loss(OrderKey(7)).unwrap();
        assert_eq!(
            position.attach_stop_loss(OrderKey(8)),
            Err(PositionError::ConditionalAlreadySet)
        );

        position.attach_take_profit(OrderKey(9)).unwrap();
        position.clear_matching_conditional(OrderKey(7));
        assert!(position.stop_loss_key.is_none());
        assert_eq!(position.take_profit_key, Some(OrderKey(9)));
    }

    #[test]
    fn open_state() {
        let mut position = test_position();
        assert!(position.is_open());
        position.size = Usd::zero();
        assert!(!position.is_open());
    }
}
