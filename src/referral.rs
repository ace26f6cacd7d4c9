// 12.0: referral bookkeeping. referred traders pay a discounted trading fee;
// part of what they still pay is routed to the referrer as an affiliate
// rebate, accumulated per (referrer, side) until claimed.

use crate::types::{Side, Ticker, UserId, Usd};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeDiscount {
    // fee the trader still pays to LPs
    pub discounted_fee: Usd,
    // slice of the paid fee owed to the referrer
    pub rebate: Usd,
    pub referrer: Option<UserId>,
}

pub trait ReferralLedger {
    // splits a gross fee into the LP share and the affiliate rebate.
    // unreferred users pay the gross fee with no rebate.
    fn apply_fee_discount(&self, user: UserId, fee: Usd) -> FeeDiscount;

    fn accumulate_affiliate_rewards(
        &mut self,
        ticker: &Ticker,
        referrer: UserId,
        side: Side,
        amount: Usd,
    );
}

#[derive(Debug, Clone)]
pub struct ReferralBook {
    referrers: HashMap<UserId, UserId>,
    // fraction of the gross fee the trader saves
    discount_rate: Decimal,
    // fraction of the gross fee routed to the referrer
    rebate_rate: Decimal,
    rewards: HashMap<(UserId, Side), Usd>,
}

impl Default for ReferralBook {
    fn default() -> Self {
        Self {
            referrers: HashMap::new(),
            discount_rate: dec!(0.1),
            rebate_rate: dec!(0.1),
            rewards: HashMap::new(),
        }
    }
}

impl ReferralBook {
    pub fn new(discount_rate: Decimal, rebate_rate: Decimal) -> Self {
        debug_assert!(discount_rate + rebate_rate < Decimal::ONE);
        Self {
            discount_rate,
            rebate_rate,
            ..Default::default()
        }
    }

    pub fn set_referrer(&mut self, user: UserId, referrer: UserId) {
        self.referrers.insert(user, referrer);
    }

    pub fn rewards(&self, referrer: UserId, side: Side) -> Usd {
        self.rewards
            .get(&(referrer, side))
            .copied()
            .unwrap_or_else(Usd::zero)
    }
}

impl ReferralLedger for ReferralBook {
    fn apply_fee_discount(&self, user: UserId, fee: Usd) -> FeeDiscount {
        match self.referrers.get(&user) {
            Some(referrer) => {
                let rebate = fee.mul(self.rebate_rate);
                let discounted_fee = fee
                    .saturating_sub(fee.mul(self.discount_rate))
                    .saturating_sub(rebate);
                FeeDiscount {
                    discounted_fee,
                    rebate,
                    referrer: Some(*referrer),
                }
            }
            None => FeeDiscount {
                discounted_fee: fee,
                rebate: Usd::zero(),
                referrer: None,
            },
        }
    }

    fn accumulate_affiliate_rewards(
        &mut self,
        _ticker: &Ticker,
        referrer: UserId,
        side: Side,
        amount: Usd,
    ) {
        let entry = self
            .rewards
            .entry((referrer, side))
            .or_insert_with(Usd::zero);
        *entry = entry.add(amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn unreferred_pays_gross() {
        let book = ReferralBook::default();
        let split = book.apply_fee_discount(UserId(1), Usd::new_unchecked(dec!(100)));
        assert_eq!(split.discounted_fee.value(), dec!(100));
        assert!(split.rebate.is_zero());
        assert!(split.referrer.is_none());
    }

    #[test]
    fn referred_splits_fee() {
        let mut book = ReferralBook::default();
        book.set_referrer(UserId(1), UserId(42));

        let split = book.apply_fee_discount(UserId(1), Usd::new_unchecked(dec!(100)));
        // 10% discount kept by trader, 10% rebate to referrer, 80% to LPs
        assert_eq!(split.discounted_fee.value(), dec!(80));
        assert_eq!(split.rebate.value(), dec!(10));
        assert_eq!(split.referrer, Some(UserId(42)));
    }

    #[test]
    fn rewards_accumulate_per_side() {
        let mut book = ReferralBook::default();
        let ticker = Ticker::new("ETH");
        book.accumulate_affiliate_rewards(&ticker, UserId(42), Side::Long, Usd::new_unchecked(dec!(10)));
        book.accumulate_affiliate_rewards(&ticker, UserId(42), Side::Long, Usd::new_unchecked(dec!(5)));
        book.accumulate_affiliate_rewards(&ticker, UserId(42), Side::Short, Usd::new_unchecked(dec!(3)));

        assert_eq!(book.rewards(UserId(42), Side::Long).value(), dec!(15));
        assert_eq!(book.rewards(UserId(42), Side::Short).value(), dec!(3));
    }
}
