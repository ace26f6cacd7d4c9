// 7.0: settlement parameters. two layers: protocol-wide fee scalars held by
// storage, per-market risk/impact/funding parameters held by the vault.

use crate::funding::FundingParams;
use crate::types::Usd;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

// protocol-wide scalars. storage exposes these to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolParams {
    // floor on post-execution collateral for any open position
    pub min_collateral_usd: Usd,
    // fraction of collateral paid to the liquidator
    pub liquidation_fee: Decimal,
    // fraction of size (or collateral delta when size delta is zero) per execution
    pub trading_fee: Decimal,
    // fraction of the closed notional paid to the ADL executor
    pub adl_fee: Decimal,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            min_collateral_usd: Usd::new_unchecked(dec!(2)),
            liquidation_fee: dec!(0.05),
            trading_fee: dec!(0.001),
            adl_fee: dec!(0.001),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketParams {
    pub max_leverage: Decimal,
    // losses >= collateral * maintenance_margin classifies as liquidation
    pub maintenance_margin: Decimal,
    pub funding: FundingParams,
    // per-second borrow rate at full utilization
    pub borrow_rate_factor: Decimal,
    pub impact: ImpactParams,
    // fraction of pool liquidity reservable against open positions
    pub reserve_factor: Decimal,
    // pnl-to-pool ratio at which ADL arms
    pub max_pnl_factor: Decimal,
    // ratio ADL steers back toward
    pub target_pnl_factor: Decimal,
    // profit floor retained by ADL'd positions, as a fraction of entry price
    pub adl_min_profit: Decimal,
}

impl Default for MarketParams {
    fn default() -> Self {
        Self {
            max_leverage: dec!(100),
            maintenance_margin: dec!(1),
            funding: FundingParams::default(),
            borrow_rate_factor: dec!(0.000000005),
            impact: ImpactParams::default(),
            reserve_factor: dec!(0.3),
            max_pnl_factor: dec!(0.45),
            target_pnl_factor: dec!(0.35),
            adl_min_profit: dec!(0.05),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactParams {
    // scales skew^exponent into USD impact
    pub factor: Decimal,
    pub exponent: Decimal,
    // bound on |impact| as a fraction of the order's size delta
    pub max_impact: Decimal,
}

impl Default for ImpactParams {
    fn default() -> Self {
        Self {
            factor: dec!(0.000000001),
            exponent: dec!(2),
            max_impact: dec!(0.1),
        }
    }
}
