// 9.0: oracle abstraction. the engine never caches prices; every settlement
// pulls signed min/max prices for its own timestamp from whatever feed the
// host wires in. SignedPriceSet is the in-memory implementation used by the
// dispatcher tests and simulations.

use crate::types::{BaseUnit, Price, RequestId, Ticker, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PriceFeedError {
    #[error("no signed price for ticker at the requested timestamp")]
    PriceNotSigned,

    #[error("asset is not registered with the feed")]
    UnknownAsset,

    #[error("unknown oracle price request")]
    UnknownRequest,
}

// who asked for prices and when. settlements are bound to one price request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRequestData {
    pub requester: UserId,
    pub block_timestamp: Timestamp,
}

pub trait PriceFeed {
    fn max_price(&self, ticker: &Ticker, at: Timestamp) -> Result<Price, PriceFeedError>;
    fn min_price(&self, ticker: &Ticker, at: Timestamp) -> Result<Price, PriceFeedError>;

    // (long token, short token) prices for the vault's two collateral assets
    fn max_vault_prices(&self, at: Timestamp) -> Result<(Price, Price), PriceFeedError>;
    fn min_vault_prices(&self, at: Timestamp) -> Result<(Price, Price), PriceFeedError>;

    fn base_unit(&self, ticker: &Ticker) -> Result<BaseUnit, PriceFeedError>;

    fn request_data(&self, id: RequestId) -> Result<PriceRequestData, PriceFeedError>;

    // how long a price request stays exclusive to its requester, in millis
    fn time_to_expiration(&self) -> i64;

    // drop a consumed price set so it can never back a second execution
    fn clear_signed_prices(&mut self, id: RequestId);
}

// in-memory signed price store keyed by (ticker, timestamp)
#[derive(Debug, Clone, Default)]
pub struct SignedPriceSet {
    prices: HashMap<(Ticker, i64), (Price, Price)>,
    vault_prices: HashMap<i64, VaultPrices>,
    base_units: HashMap<Ticker, BaseUnit>,
    requests: HashMap<RequestId, PriceRequestData>,
    expiration_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct VaultPrices {
    min_long: Price,
    max_long: Price,
    min_short: Price,
    max_short: Price,
}

impl SignedPriceSet {
    pub fn new(expiration_ms: i64) -> Self {
        Self {
            expiration_ms,
            ..Default::default()
        }
    }

    pub fn set_price(&mut self, ticker: Ticker, at: Timestamp, min: Price, max: Price) {
        debug_assert!(min <= max);
        self.prices.insert((ticker, at.as_millis()), (min, max));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_vault_prices(
        &mut self,
        at: Timestamp,
        min_long: Price,
        max_long: Price,
        min_short: Price,
        max_short: Price,
    ) {
        self.vault_prices.insert(
            at.as_millis(),
            VaultPrices {
                min_long,
                max_long,
                min_short,
                max_short,
            },
        );
    }

    pub fn set_base_unit(&mut self, ticker: Ticker, unit: BaseUnit) {
        self.base_units.insert(ticker, unit);
    }

    pub fn register_request(&mut self, id: RequestId, requester: UserId, at: Timestamp) {
        self.requests.insert(
            id,
            PriceRequestData {
                requester,
                block_timestamp: at,
            },
        );
    }
}

impl PriceFeed for SignedPriceSet {
    fn max_price(&self, ticker: &Ticker, at: Timestamp) -> Result<Price, PriceFeedError> {
        self.prices
            .get(&(ticker.clone(), at.as_millis()))
            .map(|(_, max)| *max)
            .ok_or(PriceFeedError::PriceNotSigned)
    }

    fn min_price(&self, ticker: &Ticker, at: Timestamp) -> Result<Price, PriceFeedError> {
        self.prices
            .get(&(ticker.clone(), at.as_millis()))
            .map(|(min, _)| *min)
            .ok_or(PriceFeedError::PriceNotSigned)
    }

    fn max_vault_prices(&self, at: Timestamp) -> Result<(Price, Price), PriceFeedError> {
        self.vault_prices
            .get(&at.as_millis())
            .map(|v| (v.max_long, v.max_short))
            .ok_or(PriceFeedError::PriceNotSigned)
    }

    fn min_vault_prices(&self, at: Timestamp) -> Result<(Price, Price), PriceFeedError> {
        self.vault_prices
            .get(&at.as_millis())
            .map(|v| (v.min_long, v.min_short))
            .ok_or(PriceFeedError::PriceNotSigned)
    }

    fn base_unit(&self, ticker: &Ticker) -> Result<BaseUnit, PriceFeedError> {
        self.base_units
            .get(ticker)
            .copied()
            .ok_or(PriceFeedError::UnknownAsset)
    }

    fn request_data(&self, id: RequestId) -> Result<PriceRequestData, PriceFeedError> {
        self.requests
            .get(&id)
            .copied()
            .ok_or(PriceFeedError::UnknownRequest)
    }

    fn time_to_expiration(&self) -> i64 {
        self.expiration_ms
    }

    fn clear_signed_prices(&mut self, id: RequestId) {
        if let Some(data) = self.requests.remove(&id) {
            let at = data.block_timestamp.as_millis();
            self.prices.retain(|(_, ts), _| *ts != at);
            self.vault_prices.remove(&at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signed_prices_round_trip() {
        let mut feed = SignedPriceSet::new(60_000);
        let at = Timestamp::from_millis(1_000);
        feed.set_price(
            Ticker::new("ETH"),
            at,
            Price::new_unchecked(dec!(1999)),
            Price::new_unchecked(dec!(2001)),
        );

        assert_eq!(
            feed.min_price(&Ticker::new("ETH"), at).unwrap().value(),
            dec!(1999)
        );
        assert_eq!(
            feed.max_price(&Ticker::new("ETH"), at).unwrap().value(),
            dec!(2001)
        );
        assert_eq!(
            feed.min_price(&Ticker::new("ETH"), Timestamp::from_millis(2_000)),
            Err(PriceFeedError::PriceNotSigned)
        );
    }

    #[test]
    fn clearing_consumes_the_request() {
        let mut feed = SignedPriceSet::new(60_000);
        let at = Timestamp::from_millis(1_000);
        feed.register_request(RequestId(9), UserId(1), at);
        feed.set_price(
            Ticker::new("ETH"),
            at,
            Price::new_unchecked(dec!(1999)),
            Price::new_unchecked(dec!(2001)),
        );

        feed.clear_signed_prices(RequestId(9));
        assert_eq!(
            feed.request_data(RequestId(9)),
            Err(PriceFeedError::UnknownRequest)
        );
        assert_eq!(
            feed.min_price(&Ticker::new("ETH"), at),
            Err(PriceFeedError::PriceNotSigned)
        );
    }
}
