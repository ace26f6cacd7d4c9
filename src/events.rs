// 13.0: every applied settlement produces exactly one event. used for audit
// trails, state reconstruction, and notifying external systems. the
// EventPayload enum lists all event types.

use crate::types::{
    OrderKey, Price, Side, SignedUsd, Ticker, Timestamp, TokenAmount, UserId, Usd,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    PositionCreated(PositionCreatedEvent),
    PositionIncreased(PositionIncreasedEvent),
    PositionDecreased(PositionDecreasedEvent),
    CollateralEdited(CollateralEditedEvent),
    PositionLiquidated(PositionLiquidatedEvent),
    PositionAutoDeleveraged(PositionAutoDeleveragedEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionCreatedEvent {
    pub ticker: Ticker,
    pub user: UserId,
    pub side: Side,
    pub size: Usd,
    pub collateral: Usd,
    pub entry_price: Price,
    pub order_key: OrderKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionIncreasedEvent {
    pub ticker: Ticker,
    pub user: UserId,
    pub side: Side,
    pub size_delta: Usd,
    pub collateral_delta: Usd,
    pub new_size: Usd,
    pub new_entry_price: Price,
    pub execution_price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionDecreasedEvent {
    pub ticker: Ticker,
    pub user: UserId,
    pub side: Side,
    pub size_delta: Usd,
    pub execution_price: Price,
    pub realized_pnl: SignedUsd,
    pub payout: TokenAmount,
    pub is_full_close: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollateralEditedEvent {
    pub ticker: Ticker,
    pub user: UserId,
    pub side: Side,
    pub collateral_delta: Usd,
    pub is_increase: bool,
    pub new_collateral: Usd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionLiquidatedEvent {
    pub ticker: Ticker,
    pub user: UserId,
    pub side: Side,
    pub liquidator: UserId,
    pub size: Usd,
    pub remaining_to_pool: Usd,
    pub liquidator_fee: Usd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionAutoDeleveragedEvent {
    pub ticker: Ticker,
    pub user: UserId,
    pub side: Side,
    pub size_closed: Usd,
    pub execution_price: Price,
    pub pnl_factor_before: Decimal,
    pub pnl_factor_after: Decimal,
}

pub trait EventEmitter {
    fn emit(&mut self, event: Event);
}

#[derive(Debug, Default)]
pub struct EventCollector {
    events: Vec<Event>,
    next_id: u64,
}

impl EventCollector {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_id: 1,
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn next_id(&mut self) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn record(&mut self, timestamp: Timestamp, payload: EventPayload) {
        let id = self.next_id();
        self.events.push(Event::new(id, timestamp, payload));
    }
}

impl EventEmitter for EventCollector {
    fn emit(&mut self, event: Event) {
        self.events.push(event);
    }
}
