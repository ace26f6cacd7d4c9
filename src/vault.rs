// 10.0: the shared liquidity pool. holds per-market open interest, funding
// and borrowing accumulators, pool balances, reservations, and trader
// collateral, long side and short side kept strictly apart. PoolVault is the
// in-memory implementation; the dispatcher validates every execution against
// before/after snapshots of this state.

use crate::borrowing::{self, BorrowState};
use crate::config::MarketParams;
use crate::funding::{self, FundingState};
use crate::math::MathError;
use crate::position::calculate_weighted_average_entry_price;
use crate::types::{Price, Side, SignedUsd, Ticker, Timestamp, TokenAmount, UserId, Usd};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    #[error("market is not registered with the vault")]
    UnknownMarket,

    #[error("reservation exceeds available liquidity")]
    InsufficientLiquidity,

    #[error("pool balance underflow")]
    InsufficientBalance,

    #[error("collateral balance underflow")]
    CollateralUnderflow,

    #[error("open interest underflow")]
    OpenInterestUnderflow,

    #[error(transparent)]
    Math(#[from] MathError),
}

// 10.1: everything the invariant check compares, in one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub long_open_interest: Usd,
    pub short_open_interest: Usd,
    // size-weighted entry of each side's aggregate exposure; None when flat
    pub long_avg_entry_price: Option<Price>,
    pub short_avg_entry_price: Option<Price>,
    pub funding: FundingState,
    pub borrowing: BorrowState,
    pub long_pool_balance: TokenAmount,
    pub short_pool_balance: TokenAmount,
    pub long_reserved: TokenAmount,
    pub short_reserved: TokenAmount,
    // trader margin held against each side, USD-denominated like the
    // positions it backs
    pub long_collateral: Usd,
    pub short_collateral: Usd,
    pub long_accumulated_fees: TokenAmount,
    pub short_accumulated_fees: TokenAmount,
    pub impact_pool: TokenAmount,
}

impl MarketSnapshot {
    pub fn new(long_pool: TokenAmount, short_pool: TokenAmount, timestamp: Timestamp) -> Self {
        Self {
            long_open_interest: Usd::zero(),
            short_open_interest: Usd::zero(),
            long_avg_entry_price: None,
            short_avg_entry_price: None,
            funding: FundingState::new(timestamp),
            borrowing: BorrowState::new(timestamp),
            long_pool_balance: long_pool,
            short_pool_balance: short_pool,
            long_reserved: TokenAmount::zero(),
            short_reserved: TokenAmount::zero(),
            long_collateral: Usd::zero(),
            short_collateral: Usd::zero(),
            long_accumulated_fees: TokenAmount::zero(),
            short_accumulated_fees: TokenAmount::zero(),
            impact_pool: TokenAmount::zero(),
        }
    }

    pub fn open_interest(&self, side: Side) -> Usd {
        match side {
            Side::Long => self.long_open_interest,
            Side::Short => self.short_open_interest,
        }
    }

    pub fn avg_entry_price(&self, side: Side) -> Option<Price> {
        match side {
            Side::Long => self.long_avg_entry_price,
            Side::Short => self.short_avg_entry_price,
        }
    }

    pub fn pool_balance(&self, side: Side) -> TokenAmount {
        match side {
            Side::Long => self.long_pool_balance,
            Side::Short => self.short_pool_balance,
        }
    }

    pub fn reserved(&self, side: Side) -> TokenAmount {
        match side {
            Side::Long => self.long_reserved,
            Side::Short => self.short_reserved,
        }
    }

    pub fn collateral(&self, side: Side) -> Usd {
        match side {
            Side::Long => self.long_collateral,
            Side::Short => self.short_collateral,
        }
    }

    pub fn accumulated_fees(&self, side: Side) -> TokenAmount {
        match side {
            Side::Long => self.long_accumulated_fees,
            Side::Short => self.short_accumulated_fees,
        }
    }

    // USD skew: positive when longs dominate
    pub fn skew(&self) -> SignedUsd {
        SignedUsd::new(self.long_open_interest.value() - self.short_open_interest.value())
    }

    pub fn available_liquidity(&self, side: Side, reserve_factor: Decimal) -> TokenAmount {
        let reservable = self.pool_balance(side).value() * reserve_factor;
        TokenAmount::new_unchecked(
            (reservable - self.reserved(side).value()).max(Decimal::ZERO),
        )
    }

    fn utilization(&self, side: Side, reserve_factor: Decimal) -> Decimal {
        let reservable = self.pool_balance(side).value() * reserve_factor;
        if reservable.is_zero() {
            return Decimal::ZERO;
        }
        self.reserved(side).value() / reservable
    }
}

// funding rate + accrued and the borrow state rolled forward to `now`,
// with no open-interest change. the dispatcher uses this for fee math and
// the state transition below reuses it, so the two can never disagree.
pub fn advanced_indices(
    state: &MarketSnapshot,
    params: &MarketParams,
    now: Timestamp,
) -> (Decimal, Decimal, BorrowState) {
    let (rate, accrued) = funding::calculate_next_funding(&state.funding, &params.funding, now);
    let rolled = borrowing::advance_borrowing(
        &state.borrowing,
        params.borrow_rate_factor,
        state.utilization(Side::Long, params.reserve_factor),
        state.utilization(Side::Short, params.reserve_factor),
        now,
    );
    (rate, accrued, rolled)
}

// 10.2: one market-state transition, shared verbatim by the live vault and
// the dispatcher's pre-commit simulation so both paths land on identical
// state. ordering is fixed: funding accrues at the old velocity, open
// interest moves, then velocity and borrow rates are re-derived.
pub fn apply_market_state_update(
    state: &mut MarketSnapshot,
    params: &MarketParams,
    size_delta: Usd,
    impacted_price: Price,
    side: Side,
    is_increase: bool,
    now: Timestamp,
) -> Result<(), VaultError> {
    let (rate, accrued, rolled_borrowing) = advanced_indices(state, params, now);

    if !size_delta.is_zero() {
        let oi = state.open_interest(side);
        let (new_oi, new_avg) = if is_increase {
            let new_oi = oi.add(size_delta);
            let avg = match state.avg_entry_price(side) {
                Some(prev) => calculate_weighted_average_entry_price(
                    prev,
                    oi,
                    SignedUsd::from(size_delta),
                    impacted_price,
                )?,
                None => impacted_price,
            };
            (new_oi, Some(avg))
        } else {
            // closing volume leaves the side's aggregate cost basis alone
            let new_oi = oi
                .checked_sub(size_delta)
                .ok_or(VaultError::OpenInterestUnderflow)?;
            if new_oi.is_zero() {
                (new_oi, None)
            } else {
                (new_oi, state.avg_entry_price(side))
            }
        };
        match side {
            Side::Long => {
                state.long_open_interest = new_oi;
                state.long_avg_entry_price = new_avg;
            }
            Side::Short => {
                state.short_open_interest = new_oi;
                state.short_avg_entry_price = new_avg;
            }
        }
    }

    state.funding = FundingState {
        rate,
        velocity: funding::velocity_from_skew(&params.funding, state.skew()),
        accrued,
        last_update: now,
    };
    state.borrowing = rolled_borrowing;
    Ok(())
}

// 10.3: the collaborator interface the engine settles against.
pub trait Vault {
    fn market_params(&self, ticker: &Ticker) -> Result<&MarketParams, VaultError>;

    fn snapshot(&self, ticker: &Ticker) -> Result<MarketSnapshot, VaultError>;

    fn total_available_liquidity(
        &self,
        ticker: &Ticker,
        side: Side,
    ) -> Result<TokenAmount, VaultError>;

    #[allow(clippy::too_many_arguments)]
    fn update_market_state(
        &mut self,
        ticker: &Ticker,
        size_delta: Usd,
        impacted_price: Price,
        side: Side,
        is_increase: bool,
        now: Timestamp,
    ) -> Result<(), VaultError>;

    // signed token-unit delta into the impact pool
    fn update_impact_pool(&mut self, ticker: &Ticker, delta: Decimal) -> Result<(), VaultError>;

    fn update_collateral_amount(
        &mut self,
        ticker: &Ticker,
        amount: Usd,
        user: UserId,
        side: Side,
        is_increase: bool,
    ) -> Result<(), VaultError>;

    fn update_liquidity_reservation(
        &mut self,
        ticker: &Ticker,
        amount: TokenAmount,
        side: Side,
        is_increase: bool,
    ) -> Result<(), VaultError>;

    fn update_pool_balance(
        &mut self,
        ticker: &Ticker,
        amount: TokenAmount,
        side: Side,
        is_increase: bool,
    ) -> Result<(), VaultError>;

    fn accumulate_fees(
        &mut self,
        ticker: &Ticker,
        amount: TokenAmount,
        side: Side,
    ) -> Result<(), VaultError>;

    fn transfer_out(
        &mut self,
        to: UserId,
        amount: TokenAmount,
        side: Side,
        unwrap: bool,
    ) -> Result<(), VaultError>;
}

// record of an outbound token transfer the host custody layer must perform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub to: UserId,
    pub amount: TokenAmount,
    pub side: Side,
    pub unwrap: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PoolVault {
    markets: HashMap<Ticker, MarketLedger>,
    transfers: Vec<TransferRecord>,
}

#[derive(Debug, Clone)]
struct MarketLedger {
    params: MarketParams,
    state: MarketSnapshot,
}

impl PoolVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_market(
        &mut self,
        ticker: Ticker,
        params: MarketParams,
        long_pool: TokenAmount,
        short_pool: TokenAmount,
        timestamp: Timestamp,
    ) {
        self.markets.insert(
            ticker,
            MarketLedger {
                params,
                state: MarketSnapshot::new(long_pool, short_pool, timestamp),
            },
        );
    }

    pub fn transfers(&self) -> &[TransferRecord] {
        &self.transfers
    }

    fn ledger(&self, ticker: &Ticker) -> Result<&MarketLedger, VaultError> {
        self.markets.get(ticker).ok_or(VaultError::UnknownMarket)
    }

    fn ledger_mut(&mut self, ticker: &Ticker) -> Result<&mut MarketLedger, VaultError> {
        self.markets.get_mut(ticker).ok_or(VaultError::UnknownMarket)
    }
}

impl Vault for PoolVault {
    fn market_params(&self, ticker: &Ticker) -> Result<&MarketParams, VaultError> {
        Ok(&self.ledger(ticker)?.params)
    }

    fn snapshot(&self, ticker: &Ticker) -> Result<MarketSnapshot, VaultError> {
        Ok(self.ledger(ticker)?.state.clone())
    }

    fn total_available_liquidity(
        &self,
        ticker: &Ticker,
        side: Side,
    ) -> Result<TokenAmount, VaultError> {
        let ledger = self.ledger(ticker)?;
        Ok(ledger
            .state
            .available_liquidity(side, ledger.params.reserve_factor))
    }

    fn update_market_state(
        &mut self,
        ticker: &Ticker,
        size_delta: Usd,
        impacted_price: Price,
        side: Side,
        is_increase: bool,
        now: Timestamp,
    ) -> Result<(), VaultError> {
        let ledger = self.ledger_mut(ticker)?;
        let params = ledger.params.clone();
        apply_market_state_update(
            &mut ledger.state,
            &params,
            size_delta,
            impacted_price,
            side,
            is_increase,
            now,
        )
    }

    fn update_impact_pool(&mut self, ticker: &Ticker, delta: Decimal) -> Result<(), VaultError> {
        let state = &mut self.ledger_mut(ticker)?.state;
        let next = state.impact_pool.value() + delta;
        state.impact_pool =
            TokenAmount::new(next.max(Decimal::ZERO)).ok_or(VaultError::InsufficientBalance)?;
        Ok(())
    }

    fn update_collateral_amount(
        &mut self,
        ticker: &Ticker,
        amount: Usd,
        _user: UserId,
        side: Side,
        is_increase: bool,
    ) -> Result<(), VaultError> {
        let state = &mut self.ledger_mut(ticker)?.state;
        let current = state.collateral(side);
        let next = if is_increase {
            current.add(amount)
        } else {
            current
                .checked_sub(amount)
                .ok_or(VaultError::CollateralUnderflow)?
        };
        match side {
            Side::Long => state.long_collateral = next,
            Side::Short => state.short_collateral = next,
        }
        Ok(())
    }

    fn update_liquidity_reservation(
        &mut self,
        ticker: &Ticker,
        amount: TokenAmount,
        side: Side,
        is_increase: bool,
    ) -> Result<(), VaultError> {
        let state = &mut self.ledger_mut(ticker)?.state;
        let current = state.reserved(side);
        let next = if is_increase {
            current.add(amount)
        } else {
            // releases are bounded by what was reserved
            current.saturating_sub(amount)
        };
        match side {
            Side::Long => state.long_reserved = next,
            Side::Short => state.short_reserved = next,
        }
        Ok(())
    }

    fn update_pool_balance(
        &mut self,
        ticker: &Ticker,
        amount: TokenAmount,
        side: Side,
        is_increase: bool,
    ) -> Result<(), VaultError> {
        let state = &mut self.ledger_mut(ticker)?.state;
        let current = state.pool_balance(side);
        let next = if is_increase {
            current.add(amount)
        } else {
            current
                .checked_sub(amount)
                .ok_or(VaultError::InsufficientBalance)?
        };
        match side {
            Side::Long => state.long_pool_balance = next,
            Side::Short => state.short_pool_balance = next,
        }
        Ok(())
    }

    fn accumulate_fees(
        &mut self,
        ticker: &Ticker,
        amount: TokenAmount,
        side: Side,
    ) -> Result<(), VaultError> {
        let state = &mut self.ledger_mut(ticker)?.state;
        let next = state.accumulated_fees(side).add(amount);
        match side {
            Side::Long => state.long_accumulated_fees = next,
            Side::Short => state.short_accumulated_fees = next,
        }
        Ok(())
    }

    fn transfer_out(
        &mut self,
        to: UserId,
        amount: TokenAmount,
        side: Side,
        unwrap: bool,
    ) -> Result<(), VaultError> {
        self.transfers.push(TransferRecord {
            to,
            amount,
            side,
            unwrap,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn vault_with_market() -> (PoolVault, Ticker) {
        let ticker = Ticker::new("ETH");
        let mut vault = PoolVault::new();
        vault.add_market(
            ticker.clone(),
            MarketParams::default(),
            TokenAmount::new_unchecked(dec!(1_000)),
            TokenAmount::new_unchecked(dec!(2_000_000)),
            Timestamp::from_millis(0),
        );
        (vault, ticker)
    }

    #[test]
    fn market_state_update_moves_oi_and_velocity() {
        let (mut vault, ticker) = vault_with_market();
        vault
            .update_market_state(
                &ticker,
                Usd::new_unchecked(dec!(100_000)),
                Price::new_unchecked(dec!(2000)),
                Side::Long,
                true,
                Timestamp::from_millis(1_000),
            )
            .unwrap();

        let snapshot = vault.snapshot(&ticker).unwrap();
        assert_eq!(snapshot.long_open_interest.value(), dec!(100_000));
        assert_eq!(
            snapshot.long_avg_entry_price.unwrap().value(),
            dec!(2000)
        );
        // long-heavy skew drives positive funding velocity
        assert!(snapshot.funding.velocity > Decimal::ZERO);
    }

    #[test]
    fn decrease_to_flat_clears_avg_entry() {
        let (mut vault, ticker) = vault_with_market();
        vault
            .update_market_state(
                &ticker,
                Usd::new_unchecked(dec!(50_000)),
                Price::new_unchecked(dec!(2000)),
                Side::Short,
                true,
                Timestamp::from_millis(1_000),
            )
            .unwrap();
        vault
            .update_market_state(
                &ticker,
                Usd::new_unchecked(dec!(50_000)),
                Price::new_unchecked(dec!(2100)),
                Side::Short,
                false,
                Timestamp::from_millis(2_000),
            )
            .unwrap();

        let snapshot = vault.snapshot(&ticker).unwrap();
        assert!(snapshot.short_open_interest.is_zero());
        assert!(snapshot.short_avg_entry_price.is_none());
    }

    #[test]
    fn oi_underflow_rejected() {
        let (mut vault, ticker) = vault_with_market();
        let result = vault.update_market_state(
            &ticker,
            Usd::new_unchecked(dec!(1)),
            Price::new_unchecked(dec!(2000)),
            Side::Long,
            false,
            Timestamp::from_millis(1_000),
        );
        assert_eq!(result, Err(VaultError::OpenInterestUnderflow));
    }

    #[test]
    fn available_liquidity_respects_reserve_factor() {
        let (mut vault, ticker) = vault_with_market();
        // default reserve factor 0.3: 1000 * 0.3 = 300 reservable
        assert_eq!(
            vault
                .total_available_liquidity(&ticker, Side::Long)
                .unwrap()
                .value(),
            dec!(300)
        );

        vault
            .update_liquidity_reservation(
                &ticker,
                TokenAmount::new_unchecked(dec!(120)),
                Side::Long,
                true,
            )
            .unwrap();
        assert_eq!(
            vault
                .total_available_liquidity(&ticker, Side::Long)
                .unwrap()
                .value(),
            dec!(180)
        );
    }

    #[test]
    fn pool_balance_underflow_rejected() {
        let (mut vault, ticker) = vault_with_market();
        let result = vault.update_pool_balance(
            &ticker,
            TokenAmount::new_unchecked(dec!(5_000)),
            Side::Long,
            false,
        );
        assert_eq!(result, Err(VaultError::InsufficientBalance));
    }

    #[test]
    fn transfers_are_recorded_in_order() {
        let (mut vault, _) = vault_with_market();
        vault
            .transfer_out(UserId(9), TokenAmount::new_unchecked(dec!(1)), Side::Long, false)
            .unwrap();
        vault
            .transfer_out(UserId(3), TokenAmount::new_unchecked(dec!(2)), Side::Long, true)
            .unwrap();

        assert_eq!(vault.transfers().len(), 2);
        assert_eq!(vault.transfers()[0].to, UserId(9));
        assert_eq!(vault.transfers()[1].to, UserId(3));
    }
}
