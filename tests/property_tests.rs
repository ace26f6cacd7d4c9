//! Property-based tests for the settlement math.
//!
//! These verify the invariants that must hold on every code path: leverage
//! bounds, funding interval additivity, waterfall payment bounds, pnl signs,
//! and the weighted-average-entry behavior on decreases.

use perps_settlement::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn price_strategy() -> impl Strategy<Value = Decimal> {
    (100i64..100_000_000i64).prop_map(|x| Decimal::new(x, 2)) // $1 to $1M
}

fn usd_strategy() -> impl Strategy<Value = Decimal> {
    (100i64..1_000_000_000i64).prop_map(|x| Decimal::new(x, 2)) // $1 to $10M
}

fn rate_strategy() -> impl Strategy<Value = Decimal> {
    (-1_000i64..=1_000i64).prop_map(|x| Decimal::new(x, 9))
}

fn velocity_strategy() -> impl Strategy<Value = Decimal> {
    (-100i64..=100i64).prop_map(|x| Decimal::new(x, 10))
}

fn funding_params() -> FundingParams {
    FundingParams {
        max_rate: dec!(0.000001),
        min_rate: dec!(-0.000001),
        max_velocity: dec!(0.00000001),
        skew_scale: dec!(1_000_000),
    }
}

proptest! {
    /// splitting a funding interval at any point and summing the halves
    /// equals integrating the whole interval, including across rate
    /// boundary crossings and sign flips
    #[test]
    fn funding_interval_is_additive(
        rate in rate_strategy(),
        velocity in velocity_strategy(),
        total_ms in 1_000i64..600_000i64,
        split_fraction in 1u32..99u32,
    ) {
        let params = funding_params();
        let start = FundingState {
            rate,
            velocity,
            accrued: Decimal::ZERO,
            last_update: Timestamp::from_millis(0),
        };

        let end = Timestamp::from_millis(total_ms);
        let (_, whole) = calculate_next_funding(&start, &params, end);

        let split_ms = (total_ms * split_fraction as i64) / 100;
        let mid = Timestamp::from_millis(split_ms.max(1));
        let (mid_rate, mid_accrued) = calculate_next_funding(&start, &params, mid);
        let resumed = FundingState {
            rate: mid_rate,
            velocity,
            accrued: mid_accrued,
            last_update: mid,
        };
        let (_, total) = calculate_next_funding(&resumed, &params, end);

        // decimal division in the boundary-crossing time can round in the
        // last digit; anything beyond that is a real splitting bug
        let error = (total - whole).abs();
        prop_assert!(error < dec!(0.000000000000000001), "split error {error}");
    }

    /// the accrued rate never integrates outside the clamp band
    #[test]
    fn funding_rate_stays_clamped(
        rate in rate_strategy(),
        velocity in velocity_strategy(),
        total_ms in 1_000i64..600_000i64,
    ) {
        let params = funding_params();
        let start = FundingState {
            rate,
            velocity,
            accrued: Decimal::ZERO,
            last_update: Timestamp::from_millis(0),
        };
        let (next_rate, accrued) =
            calculate_next_funding(&start, &params, Timestamp::from_millis(total_ms));

        prop_assert!(next_rate <= params.max_rate);
        prop_assert!(next_rate >= params.min_rate);

        // |integral| <= max_rate * elapsed
        let elapsed = Decimal::new(total_ms, 3);
        prop_assert!(accrued.abs() <= params.max_rate * elapsed);
    }

    /// under insolvency the sum of payments never exceeds the collateral
    /// that was there, and the liquidator is paid first
    #[test]
    fn waterfall_never_overpays(
        executor in (0i64..10_000).prop_map(|x| Decimal::new(x, 2)),
        borrow in (0i64..10_000).prop_map(|x| Decimal::new(x, 2)),
        trading in (0i64..10_000).prop_map(|x| Decimal::new(x, 2)),
        rebate in (0i64..10_000).prop_map(|x| Decimal::new(x, 2)),
        collateral in (0i64..20_000).prop_map(|x| Decimal::new(x, 2)),
    ) {
        let mut fee_state = FeeState::empty();
        fee_state.fee_for_executor = Usd::new_unchecked(executor);
        fee_state.borrow_fee = Usd::new_unchecked(borrow);
        fee_state.position_fee = Usd::new_unchecked(trading);
        fee_state.affiliate_rebate = Usd::new_unchecked(rebate);

        let remaining_collateral = Usd::new_unchecked(collateral);
        let remainder = adjust_fees_for_insolvency(&mut fee_state, remaining_collateral);

        let paid = fee_state.fee_for_executor.value()
            + fee_state.borrow_fee.value()
            + fee_state.position_fee.value()
            + fee_state.affiliate_rebate.value();

        prop_assert!(paid <= collateral);
        prop_assert_eq!(paid + remainder.value(), collateral);

        // liquidator first: paid in full whenever collateral covers it
        prop_assert_eq!(
            fee_state.fee_for_executor.value(),
            executor.min(collateral)
        );
        // the referrer only sees money once everyone ahead is whole
        if fee_state.affiliate_rebate.value() > Decimal::ZERO {
            prop_assert_eq!(fee_state.borrow_fee.value(), borrow);
            prop_assert_eq!(fee_state.position_fee.value(), trading);
        }
    }

    /// every accepted leverage check satisfies 1x <= size/collateral <= max
    #[test]
    fn leverage_bound_holds(
        size in usd_strategy(),
        collateral in usd_strategy(),
        max_leverage in (2u32..200u32).prop_map(Decimal::from),
    ) {
        let size = Usd::new_unchecked(size);
        let collateral = Usd::new_unchecked(collateral);

        match check_leverage(max_leverage, size, collateral) {
            Ok(()) => {
                let leverage = size.value() / collateral.value();
                prop_assert!(leverage >= Decimal::ONE);
                prop_assert!(leverage <= max_leverage);
            }
            Err(PositionError::CollateralExceedsSize) => {
                prop_assert!(collateral > size);
            }
            Err(PositionError::OverMaxLeverage) => {
                prop_assert!(size.value() / collateral.value() > max_leverage);
            }
            Err(error) => prop_assert!(false, "unexpected error {error:?}"),
        }
    }

    /// pnl is zero at entry and signed with the price move per side
    #[test]
    fn pnl_sign_matches_side(
        size in usd_strategy(),
        entry in price_strategy(),
        mark in price_strategy(),
    ) {
        let size = Usd::new_unchecked(size);
        let entry_price = Price::new_unchecked(entry);
        let mark_price = Price::new_unchecked(mark);

        let long = position_pnl(size, entry_price, mark_price, Side::Long).unwrap();
        let short = position_pnl(size, entry_price, mark_price, Side::Short).unwrap();

        prop_assert_eq!(long.value(), -short.value());
        if mark > entry {
            prop_assert!(long.is_positive());
        } else if mark < entry {
            prop_assert!(long.is_negative());
        } else {
            prop_assert!(long.is_zero());
        }
    }

    /// realized pnl scales linearly with the closed fraction
    #[test]
    fn realized_pnl_scales_with_fraction(
        size in usd_strategy(),
        entry in price_strategy(),
        mark in price_strategy(),
        percent in 1u32..=100u32,
    ) {
        let size = Usd::new_unchecked(size);
        let entry_price = Price::new_unchecked(entry);
        let mark_price = Price::new_unchecked(mark);
        let fraction = Decimal::from(percent) / dec!(100);
        let size_delta = size.mul(fraction);

        let whole = position_pnl(size, entry_price, mark_price, Side::Long).unwrap();
        let part =
            realized_pnl_usd(size, entry_price, mark_price, Side::Long, size_delta).unwrap();

        let expected = whole.value() * fraction;
        prop_assert!((part.value() - expected).abs() < dec!(0.0000001));
    }

    /// decreases remove volume at the execution price, so the average entry
    /// moves whenever the execution price differs from it. this documents
    /// the re-basing behavior; flip the assertion if requirements settle on
    /// the no-drift alternative.
    #[test]
    fn waep_decrease_drift_detector(
        size in (10_000i64..1_000_000_000i64).prop_map(|x| Decimal::new(x, 2)),
        entry in (100_000i64..100_000_000i64).prop_map(|x| Decimal::new(x, 2)),
        exec_offset in 1i64..=500i64,
        percent in 1u32..=99u32,
    ) {
        let prev_size = Usd::new_unchecked(size);
        let prev_waep = Price::new_unchecked(entry);
        let exec = Price::new_unchecked(entry + Decimal::new(exec_offset, 2));
        let fraction = Decimal::from(percent) / dec!(100);
        let delta = SignedUsd::new(-(prev_size.value() * fraction));

        let new_waep =
            calculate_weighted_average_entry_price(prev_waep, prev_size, delta, exec).unwrap();

        // removing volume at a higher price drags the average down
        prop_assert!(new_waep.value() < prev_waep.value());
    }

    /// increases land the average strictly between the old entry and the
    /// execution price
    #[test]
    fn waep_increase_is_a_blend(
        size in (10_000i64..1_000_000_000i64).prop_map(|x| Decimal::new(x, 2)),
        delta in (10_000i64..1_000_000_000i64).prop_map(|x| Decimal::new(x, 2)),
        entry in price_strategy(),
        exec in price_strategy(),
    ) {
        let prev_size = Usd::new_unchecked(size);
        let prev_waep = Price::new_unchecked(entry);
        let exec_price = Price::new_unchecked(exec);

        let new_waep = calculate_weighted_average_entry_price(
            prev_waep,
            prev_size,
            SignedUsd::new(delta),
            exec_price,
        )
        .unwrap();

        // allow one unit of decimal rounding at the 20th place
        let epsilon = dec!(0.00000000000000000001);
        let low = entry.min(exec);
        let high = entry.max(exec);
        prop_assert!(new_waep.value() >= low - epsilon);
        prop_assert!(new_waep.value() <= high + epsilon);
    }

    /// price impact is adverse when an order grows the dominant side and
    /// favorable when it shrinks it, and never exceeds the configured cap
    #[test]
    fn impact_direction_and_cap(
        long_oi in usd_strategy(),
        short_oi in usd_strategy(),
        size in usd_strategy(),
    ) {
        let params = ImpactParams {
            factor: dec!(0.000000001),
            exponent: dec!(2),
            max_impact: dec!(0.1),
        };
        let long_oi = Usd::new_unchecked(long_oi);
        let short_oi = Usd::new_unchecked(short_oi);
        let size = Usd::new_unchecked(size);

        let impact = impact_usd(&params, long_oi, short_oi, Side::Long, true, size).unwrap();

        prop_assert!(impact.abs().value() <= size.value() * params.max_impact);
        if long_oi.value() >= short_oi.value() {
            // growing the dominant side always worsens execution
            prop_assert!(impact.value() <= Decimal::ZERO);
        }
    }
}
