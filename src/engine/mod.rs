// 8.x engine: the execution pipeline and the settlement dispatcher.

pub mod adl;
pub mod decrease;
pub mod dispatch;
pub mod execution;
pub mod results;

pub use adl::{
    acceleration_factor, adl_execution_price, adl_percentage, check_adl_eligibility, pnl_factor,
    validate_adl,
};
pub use decrease::{
    adjust_fees_for_insolvency, decrease_collateral, decrease_position, liquidate_position,
    resolve_decrease, DecreaseState,
};
pub use dispatch::TradeEngine;
pub use execution::{
    apply_impact, check_allocation, create_new_position, fetch_prices, increase_collateral,
    increase_position, initiate, validate_price_request, ExecutionContext, ExecutionPrices,
    FeeState, ProtocolFees,
};
pub use results::{ExecutionError, SettlementKind, SettlementOutcome};
