// 11.0: position and request storage. the engine never owns state: it reads
// a position copy, computes, and hands the result back here. storage also
// carries the protocol-wide fee scalars. serializing concurrent settlements
// against one position key is this collaborator's job; MemoryStore gets it
// for free from &mut access.

use crate::config::ProtocolParams;
use crate::position::Position;
use crate::request::Request;
use crate::types::{OrderKey, PositionKey, Usd};
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("a position already exists for this key")]
    PositionExists,

    #[error("no position for this key")]
    PositionNotActive,

    #[error("no request for this order key")]
    OrderNotFound,
}

pub trait PositionStore {
    fn position(&self, key: &PositionKey) -> Option<Position>;
    fn create_position(&mut self, position: Position) -> Result<(), StorageError>;
    fn update_position(&mut self, position: Position) -> Result<(), StorageError>;
    fn delete_position(&mut self, key: &PositionKey);

    fn order(&self, key: &OrderKey) -> Option<Request>;
    fn create_order(&mut self, request: Request) -> OrderKey;
    fn delete_order(&mut self, key: &OrderKey, is_limit: bool);

    fn min_collateral_usd(&self) -> Usd;
    fn liquidation_fee(&self) -> Decimal;
    fn trading_fee(&self) -> Decimal;
    fn adl_fee(&self) -> Decimal;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    params: ProtocolParams,
    positions: HashMap<PositionKey, Position>,
    market_orders: HashMap<OrderKey, Request>,
    limit_orders: HashMap<OrderKey, Request>,
    next_order_key: u64,
}

impl MemoryStore {
    pub fn new(params: ProtocolParams) -> Self {
        Self {
            params,
            next_order_key: 1,
            ..Default::default()
        }
    }

    pub fn open_positions(&self) -> impl Iterator<Item = (&PositionKey, &Position)> {
        self.positions.iter()
    }
}

impl PositionStore for MemoryStore {
    fn position(&self, key: &PositionKey) -> Option<Position> {
        self.positions.get(key).cloned()
    }

    fn create_position(&mut self, position: Position) -> Result<(), StorageError> {
        let key = position.key();
        if self.positions.contains_key(&key) {
            return Err(StorageError::PositionExists);
        }
        self.positions.insert(key, position);
        Ok(())
    }

    fn update_position(&mut self, position: Position) -> Result<(), StorageError> {
        let key = position.key();
        if !self.positions.contains_key(&key) {
            return Err(StorageError::PositionNotActive);
        }
        self.positions.insert(key, position);
        Ok(())
    }

    fn delete_position(&mut self, key: &PositionKey) {
        self.positions.remove(key);
    }

    fn order(&self, key: &OrderKey) -> Option<Request> {
        self.market_orders
            .get(key)
            .or_else(|| self.limit_orders.get(key))
            .cloned()
    }

    fn create_order(&mut self, request: Request) -> OrderKey {
        let key = OrderKey(self.next_order_key);
        self.next_order_key += 1;
        if request.input.is_limit || request.request_type.is_conditional() {
            self.limit_orders.insert(key, request);
        } else {
            self.market_orders.insert(key, request);
        }
        key
    }

    fn delete_order(&mut self, key: &OrderKey, is_limit: bool) {
        if is_limit {
            self.limit_orders.remove(key);
        } else {
            self.market_orders.remove(key);
        }
    }

    fn min_collateral_usd(&self) -> Usd {
        self.params.min_collateral_usd
    }

    fn liquidation_fee(&self) -> Decimal {
        self.params.liquidation_fee
    }

    fn trading_fee(&self) -> Decimal {
        self.params.trading_fee
    }

    fn adl_fee(&self) -> Decimal {
        self.params.adl_fee
    }
}
