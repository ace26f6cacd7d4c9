// 3.0: requests are the only way to mutate a position. the router validates
// the input shape up front; execution consumes a request exactly once and
// deletes it. 3.2 has the limit-trigger direction table.

use crate::types::{OrderKey, Price, RequestId, Side, Ticker, Timestamp, UserId, Usd};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

pub const MIN_SLIPPAGE: Decimal = dec!(0.0001);
pub const MAX_SLIPPAGE: Decimal = dec!(0.9999);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("max slippage outside allowed bounds")]
    InvalidSlippage,

    #[error("limit order without a limit price")]
    MissingLimitPrice,

    #[error("size delta must be positive for this request type")]
    ZeroSizeDelta,

    #[error("collateral delta must be positive for this request type")]
    ZeroCollateralDelta,

    #[error("conditional percentage outside (0, 1]")]
    InvalidConditional,

    #[error("request fields inconsistent with request type")]
    TypeMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    CollateralIncrease,
    CollateralDecrease,
    PositionIncrease,
    PositionDecrease,
    CreatePosition,
    StopLoss,
    TakeProfit,
}

impl RequestType {
    pub fn is_increase(&self) -> bool {
        matches!(
            self,
            RequestType::CollateralIncrease
                | RequestType::PositionIncrease
                | RequestType::CreatePosition
        )
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, RequestType::StopLoss | RequestType::TakeProfit)
    }
}

// optional conditionals attached to a create/increase request. the dispatcher
// turns these into pending stop-loss / take-profit requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalInput {
    pub trigger_price: Price,
    // fraction of the position closed when triggered
    pub size_percentage: Decimal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditionals {
    pub stop_loss: Option<ConditionalInput>,
    pub take_profit: Option<ConditionalInput>,
}

impl Conditionals {
    fn validate(&self) -> Result<(), RequestError> {
        for conditional in [self.stop_loss, self.take_profit].into_iter().flatten() {
            if conditional.size_percentage <= Decimal::ZERO
                || conditional.size_percentage > Decimal::ONE
            {
                return Err(RequestError::InvalidConditional);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInput {
    pub ticker: Ticker,
    pub collateral_token: Ticker,
    pub collateral_delta: Usd,
    pub size_delta: Usd,
    pub limit_price: Option<Price>,
    pub max_slippage: Decimal,
    pub execution_fee: Usd,
    pub side: Side,
    pub is_limit: bool,
    pub is_increase: bool,
    // unwrap the native token on payout
    pub reverse_wrap: bool,
    pub conditionals: Conditionals,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub input: RequestInput,
    pub user: UserId,
    pub requested_at: Timestamp,
    pub request_type: RequestType,
    // oracle price request this settlement depends on
    pub request_id: RequestId,
}

impl Request {
    // 3.1: router validation. rejects malformed input before any state is touched.
    pub fn new(
        input: RequestInput,
        user: UserId,
        request_type: RequestType,
        request_id: RequestId,
        now: Timestamp,
    ) -> Result<Self, RequestError> {
        if input.max_slippage < MIN_SLIPPAGE || input.max_slippage > MAX_SLIPPAGE {
            return Err(RequestError::InvalidSlippage);
        }
        if input.is_increase != request_type.is_increase() {
            return Err(RequestError::TypeMismatch);
        }
        if (input.is_limit || request_type.is_conditional()) && input.limit_price.is_none() {
            return Err(RequestError::MissingLimitPrice);
        }
        input.conditionals.validate()?;

        match request_type {
            RequestType::CreatePosition => {
                if input.size_delta.is_zero() {
                    return Err(RequestError::ZeroSizeDelta);
                }
                if input.collateral_delta.is_zero() {
                    return Err(RequestError::ZeroCollateralDelta);
                }
            }
            RequestType::PositionIncrease
            | RequestType::PositionDecrease
            | RequestType::StopLoss
            | RequestType::TakeProfit => {
                if input.size_delta.is_zero() {
                    return Err(RequestError::ZeroSizeDelta);
                }
            }
            RequestType::CollateralIncrease | RequestType::CollateralDecrease => {
                if input.collateral_delta.is_zero() {
                    return Err(RequestError::ZeroCollateralDelta);
                }
                if !input.size_delta.is_zero() {
                    return Err(RequestError::TypeMismatch);
                }
            }
        }

        Ok(Self {
            input,
            user,
            requested_at: now,
            request_type,
            request_id,
        })
    }

    // 3.2: which way the limit triggers.
    //   stop loss:   long exits on a fall, short exits on a rise
    //   take profit: long exits on a rise, short exits on a fall
    //   plain limit: buys fill at or below, sells fill at or above
    pub fn trigger_above(&self) -> bool {
        let long = self.input.side.is_long();
        match self.request_type {
            RequestType::StopLoss => !long,
            RequestType::TakeProfit => long,
            _ => {
                let is_buy = long == self.input.is_increase;
                !is_buy
            }
        }
    }

    // limit condition against the oracle index price. non-limit requests
    // always pass.
    pub fn limit_met(&self, index_price: Price) -> bool {
        if !self.input.is_limit && !self.request_type.is_conditional() {
            return true;
        }
        let Some(limit) = self.input.limit_price else {
            return false;
        };
        if self.trigger_above() {
            index_price >= limit
        } else {
            index_price <= limit
        }
    }
}

// a request bundled for one execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub request: Request,
    pub order_key: OrderKey,
    pub fee_receiver: UserId,
    pub is_adl: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_input(request_type: RequestType) -> RequestInput {
        RequestInput {
            ticker: Ticker::new("ETH"),
            collateral_token: Ticker::new("ETH"),
            collateral_delta: Usd::new_unchecked(dec!(500)),
            size_delta: Usd::new_unchecked(dec!(10_000)),
            limit_price: None,
            max_slippage: dec!(0.003),
            execution_fee: Usd::new_unchecked(dec!(1)),
            side: Side::Long,
            is_limit: false,
            is_increase: request_type.is_increase(),
            reverse_wrap: false,
            conditionals: Conditionals::default(),
        }
    }

    fn make(request_type: RequestType, input: RequestInput) -> Result<Request, RequestError> {
        Request::new(
            input,
            UserId(1),
            request_type,
            RequestId(1),
            Timestamp::from_millis(0),
        )
    }

    #[test]
    fn create_request_validates() {
        assert!(make(RequestType::CreatePosition, base_input(RequestType::CreatePosition)).is_ok());
    }

    #[test]
    fn slippage_bounds_enforced() {
        let mut input = base_input(RequestType::CreatePosition);
        input.max_slippage = dec!(0.00001);
        assert_eq!(
            make(RequestType::CreatePosition, input),
            Err(RequestError::InvalidSlippage)
        );
    }

    #[test]
    fn collateral_edit_rejects_size_delta() {
        let mut input = base_input(RequestType::CollateralIncrease);
        input.size_delta = Usd::new_unchecked(dec!(1));
        assert_eq!(
            make(RequestType::CollateralIncrease, input),
            Err(RequestError::TypeMismatch)
        );
    }

    #[test]
    fn conditional_needs_limit_price() {
        let mut input = base_input(RequestType::StopLoss);
        input.is_limit = true;
        assert_eq!(
            make(RequestType::StopLoss, input),
            Err(RequestError::MissingLimitPrice)
        );
    }

    #[test]
    fn stop_loss_triggers_below_for_longs() {
        let mut input = base_input(RequestType::StopLoss);
        input.is_limit = true;
        input.limit_price = Some(Price::new_unchecked(dec!(1900)));
        let request = make(RequestType::StopLoss, input).unwrap();

        assert!(!request.trigger_above());
        assert!(request.limit_met(Price::new_unchecked(dec!(1890))));
        assert!(!request.limit_met(Price::new_unchecked(dec!(1950))));
    }

    #[test]
    fn take_profit_triggers_above_for_longs() {
        let mut input = base_input(RequestType::TakeProfit);
        input.is_limit = true;
        input.limit_price = Some(Price::new_unchecked(dec!(2200)));
        let request = make(RequestType::TakeProfit, input).unwrap();

        assert!(request.trigger_above());
        assert!(request.limit_met(Price::new_unchecked(dec!(2250))));
        assert!(!request.limit_met(Price::new_unchecked(dec!(2100))));
    }

    #[test]
    fn buy_limit_fills_at_or_below() {
        let mut input = base_input(RequestType::PositionIncrease);
        input.is_limit = true;
        input.limit_price = Some(Price::new_unchecked(dec!(1950)));
        let request = make(RequestType::PositionIncrease, input).unwrap();

        assert!(request.limit_met(Price::new_unchecked(dec!(1950))));
        assert!(!request.limit_met(Price::new_unchecked(dec!(1951))));
    }

    #[test]
    fn market_requests_always_pass_limit_check() {
        let request = make(
            RequestType::CreatePosition,
            base_input(RequestType::CreatePosition),
        )
        .unwrap();
        assert!(request.limit_met(Price::new_unchecked(dec!(1))));
    }
}
