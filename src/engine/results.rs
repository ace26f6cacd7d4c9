// 8.0.2: result types and the error taxonomy for settlement attempts.
// precondition and invariant failures abort the attempt with no side
// effects; the request stays queued and can be retried or cancelled.

use crate::math::MathError;
use crate::position::{Position, PositionError};
use crate::price_feed::PriceFeedError;
use crate::price_impact::ImpactError;
use crate::request::RequestError;
use crate::storage::StorageError;
use crate::types::{SignedUsd, TokenAmount};
use crate::vault::VaultError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("limit price condition not met")]
    LimitPriceNotMet,

    #[error("collateral below the protocol minimum")]
    MinCollateralThreshold,

    #[error("decrease would leave the position liquidatable")]
    LiquidatablePosition,

    #[error("fees exceed the available collateral delta")]
    FeesExceedCollateralDelta,

    #[error("no active position for this request")]
    PositionNotActive,

    #[error("a position already exists for this request")]
    PositionExists,

    #[error("position failed structural validation")]
    InvalidPosition,

    #[error("pnl-to-pool ratio has not exceeded the ADL threshold")]
    PnlToPoolRatioNotExceeded,

    #[error("ADL execution did not reduce the pnl factor")]
    PnlFactorNotReduced,

    #[error("position is not profitable")]
    PositionNotProfitable,

    #[error("position is not liquidatable")]
    PositionNotLiquidatable,

    #[error("price request predates the order")]
    InvalidRequestTimestamp,

    #[error("executor is not authorized for this price request yet")]
    InvalidExecutor,

    #[error("order not found in storage")]
    OrderNotFound,

    #[error("requested size exceeds available pool liquidity")]
    InsufficientAvailableLiquidity,

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    PriceFeed(#[from] PriceFeedError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Impact(#[from] ImpactError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Math(#[from] MathError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementKind {
    Created,
    Increased,
    CollateralIncreased,
    CollateralDecreased,
    Decreased,
    Liquidated,
    AutoDeleveraged,
}

// what one applied settlement did, returned to the caller after the
// invariant gate passes
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementOutcome {
    pub kind: SettlementKind,
    // None when the position was fully closed or liquidated
    pub position: Option<Position>,
    pub realized_pnl: SignedUsd,
    // tokens sent to the user, in collateral-side units
    pub payout: TokenAmount,
}
