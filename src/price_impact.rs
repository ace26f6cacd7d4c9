// 6.0: price impact. an order pays for the skew it adds and is paid for the
// skew it removes. skew before and after the hypothetical fill is raised to
// the market's impact exponent, scaled by the impact factor, and the
// difference becomes a bounded adjustment to the index price.

use crate::config::ImpactParams;
use crate::math::{self, MathError};
use crate::types::{Price, Side, SignedUsd, Usd};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ImpactError {
    #[error("zero price, size, or market parameters")]
    ZeroParameters,

    #[error("slippage exceeds the request maximum")]
    SlippageExceeded,

    #[error(transparent)]
    Math(#[from] MathError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpactOutcome {
    pub impacted_price: Price,
    pub impact_usd: SignedUsd,
}

fn skew_penalty(params: &ImpactParams, skew_usd: Decimal) -> Result<Decimal, MathError> {
    let magnitude = skew_usd.abs().powd(params.exponent);
    math::checked_mul(params.factor, magnitude)
}

// 6.1: signed USD impact of moving side open interest by size_delta.
// positive = the order reduces skew and executes at a better price.
pub fn impact_usd(
    params: &ImpactParams,
    long_oi: Usd,
    short_oi: Usd,
    side: Side,
    is_increase: bool,
    size_delta: Usd,
) -> Result<SignedUsd, ImpactError> {
    if size_delta.is_zero() || params.factor.is_zero() || params.exponent.is_zero() {
        return Err(ImpactError::ZeroParameters);
    }

    let skew_before = long_oi.value() - short_oi.value();
    let oi_delta = if is_increase {
        size_delta.value()
    } else {
        -size_delta.value()
    };
    let skew_after = match side {
        Side::Long => skew_before + oi_delta,
        Side::Short => skew_before - oi_delta,
    };

    let penalty_before = skew_penalty(params, skew_before)?;
    let penalty_after = skew_penalty(params, skew_after)?;
    let mut impact = penalty_before - penalty_after;

    // bound |impact| to a fraction of the order's own notional
    let cap = size_delta.value() * params.max_impact;
    impact = impact.max(-cap).min(cap);

    Ok(SignedUsd::new(impact))
}

// 6.2: full impact pipeline: USD impact, per-unit price adjustment, slippage
// gate. buys (long increase, short decrease) improve downward, sells improve
// upward.
pub fn execute(
    params: &ImpactParams,
    long_oi: Usd,
    short_oi: Usd,
    side: Side,
    is_increase: bool,
    size_delta: Usd,
    index_price: Price,
    max_slippage: Decimal,
) -> Result<ImpactOutcome, ImpactError> {
    if index_price.value().is_zero() {
        return Err(ImpactError::ZeroParameters);
    }

    let impact = impact_usd(params, long_oi, short_oi, side, is_increase, size_delta)?;
    let fraction = math::checked_div(impact.value(), size_delta.value())?;

    let is_buy = side.is_long() == is_increase;
    let adjusted = if is_buy {
        index_price.value() * (Decimal::ONE - fraction)
    } else {
        index_price.value() * (Decimal::ONE + fraction)
    };
    let impacted_price = Price::new(adjusted).ok_or(MathError::Overflow)?;

    // favorable impact is never rejected; adverse impact is bounded by the
    // request's slippage tolerance
    if impact.is_negative() {
        let slippage = math::checked_div(
            math::delta(impacted_price.value(), index_price.value()),
            index_price.value(),
        )?;
        if slippage > max_slippage {
            return Err(ImpactError::SlippageExceeded);
        }
    }

    Ok(ImpactOutcome {
        impacted_price,
        impact_usd: impact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn params() -> ImpactParams {
        ImpactParams {
            factor: dec!(0.000000001),
            exponent: dec!(2),
            max_impact: dec!(0.1),
        }
    }

    fn oi() -> (Usd, Usd) {
        (
            Usd::new_unchecked(dec!(1_000_000)),
            Usd::new_unchecked(dec!(500_000)),
        )
    }

    #[test]
    fn increasing_dominant_side_is_adverse() {
        let (long_oi, short_oi) = oi();
        let outcome = execute(
            &params(),
            long_oi,
            short_oi,
            Side::Long,
            true,
            Usd::new_unchecked(dec!(100_000)),
            Price::new_unchecked(dec!(2000)),
            dec!(0.01),
        )
        .unwrap();

        // skew 500k -> 600k: penalty 250 -> 360
        assert_eq!(outcome.impact_usd.value(), dec!(-110));
        // buy pays up by 0.11%
        assert_eq!(outcome.impacted_price.value(), dec!(2002.2));
    }

    #[test]
    fn reducing_skew_is_favorable() {
        let (long_oi, short_oi) = oi();
        let outcome = execute(
            &params(),
            long_oi,
            short_oi,
            Side::Short,
            true,
            Usd::new_unchecked(dec!(100_000)),
            Price::new_unchecked(dec!(2000)),
            dec!(0.01),
        )
        .unwrap();

        // skew 500k -> 400k: penalty 250 -> 160
        assert_eq!(outcome.impact_usd.value(), dec!(90));
        // sell improves upward by 0.09%
        assert_eq!(outcome.impacted_price.value(), dec!(2001.8));
    }

    #[test]
    fn decrease_flips_the_oi_delta() {
        let (long_oi, short_oi) = oi();
        // closing long OI reduces skew: favorable
        let impact = impact_usd(
            &params(),
            long_oi,
            short_oi,
            Side::Long,
            false,
            Usd::new_unchecked(dec!(100_000)),
        )
        .unwrap();
        assert!(impact.is_positive());
    }

    #[test]
    fn impact_is_capped() {
        let big = ImpactParams {
            factor: dec!(0.001),
            ..params()
        };
        let (long_oi, short_oi) = oi();
        let impact = impact_usd(
            &big,
            long_oi,
            short_oi,
            Side::Long,
            true,
            Usd::new_unchecked(dec!(100_000)),
        )
        .unwrap();
        // clamped to 10% of the 100k delta
        assert_eq!(impact.value(), dec!(-10_000));
    }

    #[test]
    fn zero_inputs_rejected() {
        let (long_oi, short_oi) = oi();
        let result = impact_usd(
            &params(),
            long_oi,
            short_oi,
            Side::Long,
            true,
            Usd::zero(),
        );
        assert_eq!(result, Err(ImpactError::ZeroParameters));

        let dead = ImpactParams {
            factor: Decimal::ZERO,
            ..params()
        };
        let result = impact_usd(
            &dead,
            long_oi,
            short_oi,
            Side::Long,
            true,
            Usd::new_unchecked(dec!(1)),
        );
        assert_eq!(result, Err(ImpactError::ZeroParameters));
    }

    #[test]
    fn slippage_gate() {
        let (long_oi, short_oi) = oi();
        let result = execute(
            &params(),
            long_oi,
            short_oi,
            Side::Long,
            true,
            Usd::new_unchecked(dec!(100_000)),
            Price::new_unchecked(dec!(2000)),
            dec!(0.0001),
        );
        assert_eq!(result, Err(ImpactError::SlippageExceeded));
    }
}
