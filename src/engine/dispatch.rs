// 8.16: the settlement dispatcher. routes a classified request to its
// handler, stages every ledger movement as a pure op list, simulates the
// ops against a snapshot, and only commits once the market-delta invariant
// holds on the simulated result. a failed attempt applies nothing.
// transfers always run executor fee, then affiliate rebate, then user payout.

use crate::config::MarketParams;
use crate::events::{
    CollateralEditedEvent, EventCollector, EventPayload, PositionAutoDeleveragedEvent,
    PositionCreatedEvent, PositionDecreasedEvent, PositionIncreasedEvent,
    PositionLiquidatedEvent,
};
use crate::math;
use crate::position::{self, ExpectedDeltas, Position};
use crate::price_feed::PriceFeed;
use crate::referral::ReferralLedger;
use crate::request::{Conditionals, Request, RequestInput, RequestType, Settlement, MAX_SLIPPAGE};
use crate::storage::PositionStore;
use crate::types::{
    OrderKey, PositionKey, Price, RequestId, Side, SignedUsd, Ticker, Timestamp, TokenAmount,
    UserId, Usd,
};
use crate::vault::{self, MarketSnapshot, Vault, VaultError};
use rust_decimal::Decimal;

use super::adl;
use super::decrease;
use super::execution::{self, ExecutionContext, ExecutionPrices, FeeState, ProtocolFees};
use super::results::{ExecutionError, SettlementKind, SettlementOutcome};

// one staged ledger movement. applied to the vault only after the whole
// op list validates against the simulated snapshot.
#[derive(Debug, Clone)]
enum LedgerOp {
    MarketState {
        size_delta: Usd,
        impacted_price: Price,
        is_increase: bool,
    },
    ImpactPool {
        delta: Decimal,
    },
    Collateral {
        amount: Usd,
        is_increase: bool,
    },
    Reservation {
        amount: TokenAmount,
        is_increase: bool,
    },
    PoolBalance {
        amount: TokenAmount,
        is_increase: bool,
    },
    AccumulateFees {
        amount: TokenAmount,
    },
}

#[derive(Debug, Clone)]
enum PositionChange {
    Create(Position),
    Update(Position),
    Delete(PositionKey),
}

// everything a handler decides, before anything is committed
struct Staged {
    kind: SettlementKind,
    fee_state: FeeState,
    change: PositionChange,
    ops: Vec<LedgerOp>,
    expected: ExpectedDeltas,
    payload: EventPayload,
    // pre-validated pending SL/TP requests to register on create
    pending_conditionals: Vec<Request>,
    // pending conditionals orphaned by a full close
    conditional_orders_to_delete: Vec<OrderKey>,
}

pub struct TradeEngine<S, P, V, R> {
    pub store: S,
    pub feed: P,
    pub vault: V,
    pub referrals: R,
    pub events: EventCollector,
}

impl<S, P, V, R> TradeEngine<S, P, V, R>
where
    S: PositionStore,
    P: PriceFeed,
    V: Vault,
    R: ReferralLedger,
{
    pub fn new(store: S, feed: P, vault: V, referrals: R) -> Self {
        Self {
            store,
            feed,
            vault,
            referrals,
            events: EventCollector::new(),
        }
    }

    fn protocol_fees(&self) -> ProtocolFees {
        ProtocolFees {
            trading_fee: self.store.trading_fee(),
            liquidation_fee: self.store.liquidation_fee(),
            adl_fee: self.store.adl_fee(),
            min_collateral_usd: self.store.min_collateral_usd(),
        }
    }

    fn context(
        &self,
        snapshot: &MarketSnapshot,
        ticker: &Ticker,
        now: Timestamp,
    ) -> Result<ExecutionContext, ExecutionError> {
        let market = self.vault.market_params(ticker)?.clone();
        let (_, funding_accrued, borrowing) = vault::advanced_indices(snapshot, &market, now);
        Ok(ExecutionContext {
            market,
            fees: self.protocol_fees(),
            funding_accrued,
            borrowing,
            now,
        })
    }

    // 8.17: the single entry point for queued requests.
    pub fn execute(
        &mut self,
        settlement: &Settlement,
        executor: UserId,
        now: Timestamp,
    ) -> Result<SettlementOutcome, ExecutionError> {
        let request = self
            .store
            .order(&settlement.order_key)
            .ok_or(ExecutionError::OrderNotFound)?;
        let ticker = request.input.ticker.clone();
        let side = request.input.side;

        let snapshot = self.vault.snapshot(&ticker)?;
        let ctx = self.context(&snapshot, &ticker, now)?;
        let prices =
            execution::initiate(&self.feed, &ctx.market, &snapshot, &request, executor, now)?;

        let staged = match request.request_type {
            RequestType::CreatePosition => {
                self.stage_create(&ctx, &request, &prices, settlement.order_key)?
            }
            RequestType::PositionIncrease => self.stage_increase(&ctx, &request, &prices)?,
            RequestType::CollateralIncrease => {
                self.stage_collateral_increase(&ctx, &request, &prices)?
            }
            RequestType::CollateralDecrease => {
                self.stage_collateral_decrease(&ctx, &request, &prices)?
            }
            RequestType::PositionDecrease | RequestType::StopLoss | RequestType::TakeProfit => {
                self.stage_decrease(&ctx, &request, &prices, settlement.order_key)?
            }
        };

        let outcome = self.commit(
            staged,
            &ticker,
            side,
            &request,
            &prices,
            settlement.fee_receiver,
            now,
        )?;

        let is_limit = request.input.is_limit || request.request_type.is_conditional();
        self.store.delete_order(&settlement.order_key, is_limit);
        self.feed.clear_signed_prices(request.request_id);
        Ok(outcome)
    }

    fn stage_create(
        &mut self,
        ctx: &ExecutionContext,
        request: &Request,
        prices: &ExecutionPrices,
        order_key: OrderKey,
    ) -> Result<Staged, ExecutionError> {
        let key = PositionKey::new(
            request.input.ticker.clone(),
            request.user,
            request.input.side,
        );
        if self.store.position(&key).is_some() {
            return Err(ExecutionError::PositionExists);
        }

        let available = self
            .vault
            .total_available_liquidity(&request.input.ticker, request.input.side)?;
        let reserve = execution::check_allocation(request.input.size_delta, prices, available)?;

        let (new_position, fee_state) =
            execution::create_new_position(&self.referrals, ctx, request, prices)?;

        // conditionals ride along on creation; build (and validate) the
        // pending requests now, register them only at commit time
        let pending_conditionals = build_pending_conditionals(request, &new_position, ctx.now)?;

        let fees_tokens = usd_to_tokens(fee_state.fees_to_accumulate, prices)?;

        let mut ops = vec![
            LedgerOp::MarketState {
                size_delta: request.input.size_delta,
                impacted_price: prices.impacted_price,
                is_increase: true,
            },
            LedgerOp::Collateral {
                amount: fee_state.after_fee_amount,
                is_increase: true,
            },
            LedgerOp::Reservation {
                amount: reserve,
                is_increase: true,
            },
            LedgerOp::AccumulateFees {
                amount: fees_tokens,
            },
        ];
        push_impact_op(&mut ops, prices)?;

        let expected = ExpectedDeltas {
            side: request.input.side,
            open_interest_delta: SignedUsd::from(request.input.size_delta),
            pool_balance_delta: Decimal::ZERO,
            collateral_delta: fee_state.after_fee_amount.value(),
            reservation_delta: reserve.value(),
            fees_accumulated: fees_tokens,
            funding_accrued: ctx.funding_accrued,
            borrow_cumulative: ctx.borrowing.cumulative(request.input.side),
        };

        let payload = EventPayload::PositionCreated(PositionCreatedEvent {
            ticker: request.input.ticker.clone(),
            user: request.user,
            side: request.input.side,
            size: new_position.size,
            collateral: new_position.collateral,
            entry_price: new_position.weighted_avg_entry_price,
            order_key,
        });

        Ok(Staged {
            kind: SettlementKind::Created,
            fee_state,
            change: PositionChange::Create(new_position),
            ops,
            expected,
            payload,
            pending_conditionals,
            conditional_orders_to_delete: Vec::new(),
        })
    }

    fn stage_increase(
        &mut self,
        ctx: &ExecutionContext,
        request: &Request,
        prices: &ExecutionPrices,
    ) -> Result<Staged, ExecutionError> {
        let key = PositionKey::new(
            request.input.ticker.clone(),
            request.user,
            request.input.side,
        );
        let existing = self
            .store
            .position(&key)
            .ok_or(ExecutionError::PositionNotActive)?;

        let available = self
            .vault
            .total_available_liquidity(&request.input.ticker, request.input.side)?;
        let reserve = execution::check_allocation(request.input.size_delta, prices, available)?;

        let (updated, fee_state) =
            execution::increase_position(&self.referrals, ctx, &existing, request, prices)?;

        let fees_tokens = usd_to_tokens(fee_state.fees_to_accumulate, prices)?;

        let mut ops = vec![
            LedgerOp::MarketState {
                size_delta: request.input.size_delta,
                impacted_price: prices.impacted_price,
                is_increase: true,
            },
            LedgerOp::Collateral {
                amount: fee_state.after_fee_amount,
                is_increase: true,
            },
            LedgerOp::Reservation {
                amount: reserve,
                is_increase: true,
            },
            LedgerOp::AccumulateFees {
                amount: fees_tokens,
            },
        ];
        push_impact_op(&mut ops, prices)?;
        push_funding_pool_op(&mut ops, &fee_state, prices)?;

        let expected = ExpectedDeltas {
            side: request.input.side,
            open_interest_delta: SignedUsd::from(request.input.size_delta),
            pool_balance_delta: funding_pool_delta(&fee_state, prices)?,
            collateral_delta: fee_state.after_fee_amount.value(),
            reservation_delta: reserve.value(),
            fees_accumulated: fees_tokens,
            funding_accrued: ctx.funding_accrued,
            borrow_cumulative: ctx.borrowing.cumulative(request.input.side),
        };

        let payload = EventPayload::PositionIncreased(PositionIncreasedEvent {
            ticker: request.input.ticker.clone(),
            user: request.user,
            side: request.input.side,
            size_delta: request.input.size_delta,
            collateral_delta: request.input.collateral_delta,
            new_size: updated.size,
            new_entry_price: updated.weighted_avg_entry_price,
            execution_price: prices.impacted_price,
        });

        Ok(Staged {
            kind: SettlementKind::Increased,
            fee_state,
            change: PositionChange::Update(updated),
            ops,
            expected,
            payload,
            pending_conditionals: Vec::new(),
            conditional_orders_to_delete: Vec::new(),
        })
    }

    fn stage_collateral_increase(
        &mut self,
        ctx: &ExecutionContext,
        request: &Request,
        prices: &ExecutionPrices,
    ) -> Result<Staged, ExecutionError> {
        let key = PositionKey::new(
            request.input.ticker.clone(),
            request.user,
            request.input.side,
        );
        let existing = self
            .store
            .position(&key)
            .ok_or(ExecutionError::PositionNotActive)?;

        let (updated, fee_state) =
            execution::increase_collateral(&self.referrals, ctx, &existing, request)?;

        let fees_tokens = usd_to_tokens(fee_state.fees_to_accumulate, prices)?;

        let mut ops = vec![
            LedgerOp::MarketState {
                size_delta: Usd::zero(),
                impacted_price: prices.index_price,
                is_increase: true,
            },
            LedgerOp::Collateral {
                amount: fee_state.after_fee_amount,
                is_increase: true,
            },
            LedgerOp::AccumulateFees {
                amount: fees_tokens,
            },
        ];
        push_funding_pool_op(&mut ops, &fee_state, prices)?;

        let expected = ExpectedDeltas {
            side: request.input.side,
            open_interest_delta: SignedUsd::zero(),
            pool_balance_delta: funding_pool_delta(&fee_state, prices)?,
            collateral_delta: fee_state.after_fee_amount.value(),
            reservation_delta: Decimal::ZERO,
            fees_accumulated: fees_tokens,
            funding_accrued: ctx.funding_accrued,
            borrow_cumulative: ctx.borrowing.cumulative(request.input.side),
        };

        let payload = EventPayload::CollateralEdited(CollateralEditedEvent {
            ticker: request.input.ticker.clone(),
            user: request.user,
            side: request.input.side,
            collateral_delta: request.input.collateral_delta,
            is_increase: true,
            new_collateral: updated.collateral,
        });

        Ok(Staged {
            kind: SettlementKind::CollateralIncreased,
            fee_state,
            change: PositionChange::Update(updated),
            ops,
            expected,
            payload,
            pending_conditionals: Vec::new(),
            conditional_orders_to_delete: Vec::new(),
        })
    }

    fn stage_collateral_decrease(
        &mut self,
        ctx: &ExecutionContext,
        request: &Request,
        prices: &ExecutionPrices,
    ) -> Result<Staged, ExecutionError> {
        let key = PositionKey::new(
            request.input.ticker.clone(),
            request.user,
            request.input.side,
        );
        let existing = self
            .store
            .position(&key)
            .ok_or(ExecutionError::PositionNotActive)?;

        let (updated, fee_state) =
            decrease::decrease_collateral(&self.referrals, ctx, &existing, request, prices)?;

        let fees_tokens = usd_to_tokens(fee_state.fees_to_accumulate, prices)?;

        let mut ops = vec![
            LedgerOp::MarketState {
                size_delta: Usd::zero(),
                impacted_price: prices.index_price,
                is_increase: false,
            },
            LedgerOp::Collateral {
                amount: request.input.collateral_delta,
                is_increase: false,
            },
            LedgerOp::AccumulateFees {
                amount: fees_tokens,
            },
        ];
        push_funding_pool_op(&mut ops, &fee_state, prices)?;

        let expected = ExpectedDeltas {
            side: request.input.side,
            open_interest_delta: SignedUsd::zero(),
            pool_balance_delta: funding_pool_delta(&fee_state, prices)?,
            collateral_delta: -request.input.collateral_delta.value(),
            reservation_delta: Decimal::ZERO,
            fees_accumulated: fees_tokens,
            funding_accrued: ctx.funding_accrued,
            borrow_cumulative: ctx.borrowing.cumulative(request.input.side),
        };

        let payload = EventPayload::CollateralEdited(CollateralEditedEvent {
            ticker: request.input.ticker.clone(),
            user: request.user,
            side: request.input.side,
            collateral_delta: request.input.collateral_delta,
            is_increase: false,
            new_collateral: updated.collateral,
        });

        Ok(Staged {
            kind: SettlementKind::CollateralDecreased,
            fee_state,
            change: PositionChange::Update(updated),
            ops,
            expected,
            payload,
            pending_conditionals: Vec::new(),
            conditional_orders_to_delete: Vec::new(),
        })
    }

    fn stage_decrease(
        &mut self,
        ctx: &ExecutionContext,
        request: &Request,
        prices: &ExecutionPrices,
        order_key: OrderKey,
    ) -> Result<Staged, ExecutionError> {
        let key = PositionKey::new(
            request.input.ticker.clone(),
            request.user,
            request.input.side,
        );
        let existing = self
            .store
            .position(&key)
            .ok_or(ExecutionError::PositionNotActive)?;

        let (remaining, fee_state, resolved) = decrease::decrease_position(
            &self.referrals,
            ctx,
            &existing,
            request,
            prices,
            order_key,
        )?;

        self.stage_decrease_ops(
            ctx,
            request,
            prices,
            &existing,
            remaining,
            fee_state,
            resolved,
            SettlementKind::Decreased,
        )
    }

    // shared op construction for user decreases, liquidations, and ADL
    #[allow(clippy::too_many_arguments)]
    fn stage_decrease_ops(
        &mut self,
        ctx: &ExecutionContext,
        request: &Request,
        prices: &ExecutionPrices,
        existing: &Position,
        remaining: Option<Position>,
        fee_state: FeeState,
        resolved: decrease::DecreaseState,
        kind: SettlementKind,
    ) -> Result<Staged, ExecutionError> {
        let side = request.input.side;
        let release = usd_to_tokens(resolved.size_delta, prices)?;
        let fees_tokens = usd_to_tokens(fee_state.fees_to_accumulate, prices)?;
        let reserved_before = self
            .vault
            .snapshot(&request.input.ticker)?
            .reserved(side)
            .value();

        let mut ops = vec![
            LedgerOp::MarketState {
                size_delta: resolved.size_delta,
                impacted_price: prices.impacted_price,
                is_increase: false,
            },
            LedgerOp::Collateral {
                amount: resolved.collateral_delta,
                is_increase: false,
            },
            LedgerOp::Reservation {
                amount: release,
                is_increase: false,
            },
            LedgerOp::AccumulateFees {
                amount: fees_tokens,
            },
        ];

        // the pool absorbs trader losses and pays trader gains; on a
        // liquidation the remainder of the collateral returns to the pool
        let pool_delta_usd = if fee_state.is_liquidation {
            fee_state.after_fee_amount.value()
        } else {
            fee_state.funding_fee.value() - fee_state.realized_pnl.value()
        };
        let pool_delta_tokens = signed_usd_to_tokens(pool_delta_usd, prices)?;
        if !pool_delta_tokens.is_zero() {
            ops.push(LedgerOp::PoolBalance {
                amount: TokenAmount::new_unchecked(pool_delta_tokens.abs()),
                is_increase: pool_delta_tokens > Decimal::ZERO,
            });
        }
        if !fee_state.is_liquidation {
            push_impact_op(&mut ops, prices)?;
        }

        let expected = ExpectedDeltas {
            side,
            open_interest_delta: SignedUsd::from(resolved.size_delta).negate(),
            pool_balance_delta: pool_delta_tokens,
            collateral_delta: -resolved.collateral_delta.value(),
            reservation_delta: -(release.value().min(reserved_before)),
            fees_accumulated: fees_tokens,
            funding_accrued: ctx.funding_accrued,
            borrow_cumulative: ctx.borrowing.cumulative(side),
        };

        let (change, conditional_orders_to_delete) = match remaining {
            Some(updated) => (PositionChange::Update(updated), Vec::new()),
            None => {
                // a closed position takes its pending conditionals with it
                let orphans = existing
                    .stop_loss_key
                    .into_iter()
                    .chain(existing.take_profit_key)
                    .collect();
                (PositionChange::Delete(existing.key()), orphans)
            }
        };

        let payload = match kind {
            SettlementKind::Liquidated => {
                EventPayload::PositionLiquidated(PositionLiquidatedEvent {
                    ticker: request.input.ticker.clone(),
                    user: request.user,
                    side,
                    liquidator: UserId(0),
                    size: resolved.size_delta,
                    remaining_to_pool: fee_state.after_fee_amount,
                    liquidator_fee: fee_state.fee_for_executor,
                })
            }
            _ => EventPayload::PositionDecreased(PositionDecreasedEvent {
                ticker: request.input.ticker.clone(),
                user: request.user,
                side,
                size_delta: resolved.size_delta,
                execution_price: prices.impacted_price,
                realized_pnl: fee_state.realized_pnl,
                payout: usd_to_tokens(fee_state.amount_owed_to_user, prices)?,
                is_full_close: resolved.is_full,
            }),
        };

        Ok(Staged {
            kind,
            fee_state,
            change,
            ops,
            expected,
            payload,
            pending_conditionals: Vec::new(),
            conditional_orders_to_delete,
        })
    }

    // 8.18: liquidations bypass the request queue: any keeper may trigger
    // one against a registered price request once the position is under
    // water.
    pub fn liquidate(
        &mut self,
        key: &PositionKey,
        liquidator: UserId,
        request_id: RequestId,
        now: Timestamp,
    ) -> Result<SettlementOutcome, ExecutionError> {
        let existing = self
            .store
            .position(key)
            .ok_or(ExecutionError::PositionNotActive)?;
        let ticker = key.ticker.clone();

        let request = synthetic_decrease_request(&existing, request_id, Usd::zero(), None);
        let snapshot = self.vault.snapshot(&ticker)?;
        let ctx = self.context(&snapshot, &ticker, now)?;
        let prices = execution::initiate(
            &self.feed,
            &ctx.market,
            &snapshot,
            &request,
            liquidator,
            now,
        )?;

        let (fee_state, resolved) =
            decrease::liquidate_position(&self.referrals, &ctx, &existing, &request, &prices)?;

        let mut staged = self.stage_decrease_ops(
            &ctx,
            &request,
            &prices,
            &existing,
            None,
            fee_state,
            resolved,
            SettlementKind::Liquidated,
        )?;
        if let EventPayload::PositionLiquidated(ref mut event) = staged.payload {
            event.liquidator = liquidator;
        }

        let outcome = self.commit(
            staged,
            &ticker,
            existing.side,
            &request,
            &prices,
            liquidator,
            now,
        )?;
        self.feed.clear_signed_prices(request_id);
        Ok(outcome)
    }

    // 8.19: ADL. forced partial close of a profitable position when the
    // pool owes its side too much, at a price pulled toward the minimum
    // profit boundary. commits only if the pnl factor strictly falls.
    pub fn execute_adl(
        &mut self,
        key: &PositionKey,
        executor: UserId,
        request_id: RequestId,
        now: Timestamp,
    ) -> Result<SettlementOutcome, ExecutionError> {
        let existing = self
            .store
            .position(key)
            .ok_or(ExecutionError::PositionNotActive)?;
        let ticker = key.ticker.clone();
        let side = existing.side;

        let snapshot = self.vault.snapshot(&ticker)?;
        let ctx = self.context(&snapshot, &ticker, now)?;

        let probe = synthetic_decrease_request(&existing, request_id, Usd::zero(), None);
        let prices =
            execution::initiate(&self.feed, &ctx.market, &snapshot, &probe, executor, now)?;

        let starting_factor = adl::pnl_factor(
            &snapshot,
            side,
            prices.index_price,
            prices.collateral_price,
            prices.collateral_base_unit,
        )?;
        adl::check_adl_eligibility(starting_factor, ctx.market.max_pnl_factor)?;

        let position_pnl = position::position_pnl(
            existing.size,
            existing.weighted_avg_entry_price,
            prices.index_price,
            side,
        )?;
        if !position_pnl.is_positive() {
            return Err(ExecutionError::PositionNotProfitable);
        }

        let percentage = adl::adl_percentage(starting_factor, ctx.market.target_pnl_factor)?;
        let size_delta = existing.size.mul(percentage).min(existing.size);
        if size_delta.is_zero() {
            return Err(ExecutionError::PnlToPoolRatioNotExceeded);
        }

        let acceleration =
            adl::acceleration_factor(starting_factor, ctx.market.target_pnl_factor)?;
        let pool_usd = adl::pool_usd(
            &snapshot,
            side,
            prices.collateral_price,
            prices.collateral_base_unit,
        )?;
        let adl_price = adl::adl_execution_price(
            existing.weighted_avg_entry_price,
            prices.impacted_price,
            side,
            position_pnl.abs(),
            pool_usd,
            acceleration,
            ctx.market.adl_min_profit,
        )?;
        // the clamped price replaces skew impact entirely
        let adl_prices = ExecutionPrices {
            impacted_price: adl_price,
            price_impact_usd: SignedUsd::zero(),
            ..prices
        };

        let adl_fee = math::percentage(size_delta, ctx.fees.adl_fee)?;
        let request =
            synthetic_decrease_request(&existing, request_id, adl_fee, Some(size_delta));

        let (remaining, fee_state, resolved) = decrease::decrease_position(
            &self.referrals,
            &ctx,
            &existing,
            &request,
            &adl_prices,
            OrderKey(0),
        )?;

        let mut staged = self.stage_decrease_ops(
            &ctx,
            &request,
            &adl_prices,
            &existing,
            remaining,
            fee_state,
            resolved,
            SettlementKind::AutoDeleveraged,
        )?;

        // the hard gate: simulate, recompute the factor, and require a
        // strict reduction before anything commits
        let simulated = simulate_ops(&snapshot, &ctx.market, &staged.ops, side, now)?;
        let new_factor = adl::pnl_factor(
            &simulated,
            side,
            prices.index_price,
            prices.collateral_price,
            prices.collateral_base_unit,
        )?;
        adl::validate_adl(starting_factor, new_factor)?;

        staged.payload = EventPayload::PositionAutoDeleveraged(PositionAutoDeleveragedEvent {
            ticker: ticker.clone(),
            user: existing.user,
            side,
            size_closed: resolved.size_delta,
            execution_price: adl_price,
            pnl_factor_before: starting_factor,
            pnl_factor_after: new_factor,
        });

        let outcome = self.commit(
            staged,
            &ticker,
            side,
            &request,
            &adl_prices,
            executor,
            now,
        )?;
        self.feed.clear_signed_prices(request_id);
        Ok(outcome)
    }

    // 8.20: the commit gate. simulate, validate the invariant, then apply
    // ops, pay in fixed order, persist, and emit. nothing before this point
    // has touched shared state.
    #[allow(clippy::too_many_arguments)]
    fn commit(
        &mut self,
        staged: Staged,
        ticker: &Ticker,
        side: Side,
        request: &Request,
        prices: &ExecutionPrices,
        fee_receiver: UserId,
        now: Timestamp,
    ) -> Result<SettlementOutcome, ExecutionError> {
        let before = self.vault.snapshot(ticker)?;
        let params = self.vault.market_params(ticker)?.clone();

        let simulated = simulate_ops(&before, &params, &staged.ops, side, now)?;
        position::validate_market_delta(&before, &simulated, &staged.expected)?;

        for op in &staged.ops {
            self.apply_op(ticker, side, request.user, now, op)?;
        }

        // executor fee, then affiliate rebate, then user payout
        let executor_tokens = usd_to_tokens(staged.fee_state.fee_for_executor, prices)?;
        if !executor_tokens.is_zero() {
            self.vault
                .transfer_out(fee_receiver, executor_tokens, side, false)?;
        }
        if let Some(referrer) = staged.fee_state.referrer {
            if !staged.fee_state.affiliate_rebate.is_zero() {
                self.referrals.accumulate_affiliate_rewards(
                    ticker,
                    referrer,
                    side,
                    staged.fee_state.affiliate_rebate,
                );
            }
        }
        let payout_tokens = usd_to_tokens(staged.fee_state.amount_owed_to_user, prices)?;
        if !payout_tokens.is_zero() {
            self.vault.transfer_out(
                request.user,
                payout_tokens,
                side,
                request.input.reverse_wrap,
            )?;
        }

        let position = match staged.change {
            PositionChange::Create(mut new_position) => {
                for pending in staged.pending_conditionals {
                    let request_type = pending.request_type;
                    let pending_key = self.store.create_order(pending);
                    match request_type {
                        RequestType::StopLoss => new_position.attach_stop_loss(pending_key)?,
                        RequestType::TakeProfit => {
                            new_position.attach_take_profit(pending_key)?
                        }
                        _ => return Err(ExecutionError::InvalidPosition),
                    }
                }
                self.store.create_position(new_position.clone())?;
                Some(new_position)
            }
            PositionChange::Update(updated) => {
                self.store.update_position(updated.clone())?;
                Some(updated)
            }
            PositionChange::Delete(key) => {
                self.store.delete_position(&key);
                None
            }
        };
        for orphan in &staged.conditional_orders_to_delete {
            self.store.delete_order(orphan, true);
        }

        self.events.record(now, staged.payload);

        Ok(SettlementOutcome {
            kind: staged.kind,
            position,
            realized_pnl: staged.fee_state.realized_pnl,
            payout: payout_tokens,
        })
    }

    fn apply_op(
        &mut self,
        ticker: &Ticker,
        side: Side,
        user: UserId,
        now: Timestamp,
        op: &LedgerOp,
    ) -> Result<(), ExecutionError> {
        match op {
            LedgerOp::MarketState {
                size_delta,
                impacted_price,
                is_increase,
            } => self.vault.update_market_state(
                ticker,
                *size_delta,
                *impacted_price,
                side,
                *is_increase,
                now,
            )?,
            LedgerOp::ImpactPool { delta } => self.vault.update_impact_pool(ticker, *delta)?,
            LedgerOp::Collateral {
                amount,
                is_increase,
            } => self
                .vault
                .update_collateral_amount(ticker, *amount, user, side, *is_increase)?,
            LedgerOp::Reservation {
                amount,
                is_increase,
            } => self
                .vault
                .update_liquidity_reservation(ticker, *amount, side, *is_increase)?,
            LedgerOp::PoolBalance {
                amount,
                is_increase,
            } => self
                .vault
                .update_pool_balance(ticker, *amount, side, *is_increase)?,
            LedgerOp::AccumulateFees { amount } => {
                self.vault.accumulate_fees(ticker, *amount, side)?
            }
        }
        Ok(())
    }
}

// pure replay of an op list against a snapshot, mirroring PoolVault exactly
fn simulate_ops(
    snapshot: &MarketSnapshot,
    params: &MarketParams,
    ops: &[LedgerOp],
    side: Side,
    now: Timestamp,
) -> Result<MarketSnapshot, ExecutionError> {
    let mut state = snapshot.clone();
    for op in ops {
        match op {
            LedgerOp::MarketState {
                size_delta,
                impacted_price,
                is_increase,
            } => {
                vault::apply_market_state_update(
                    &mut state,
                    params,
                    *size_delta,
                    *impacted_price,
                    side,
                    *is_increase,
                    now,
                )?;
            }
            LedgerOp::ImpactPool { delta } => {
                let next = (state.impact_pool.value() + delta).max(Decimal::ZERO);
                state.impact_pool = TokenAmount::new_unchecked(next);
            }
            LedgerOp::Collateral {
                amount,
                is_increase,
            } => {
                let current = state.collateral(side);
                let next = if *is_increase {
                    current.add(*amount)
                } else {
                    current
                        .checked_sub(*amount)
                        .ok_or(VaultError::CollateralUnderflow)?
                };
                match side {
                    Side::Long => state.long_collateral = next,
                    Side::Short => state.short_collateral = next,
                }
            }
            LedgerOp::Reservation {
                amount,
                is_increase,
            } => {
                let current = state.reserved(side);
                let next = if *is_increase {
                    current.add(*amount)
                } else {
                    current.saturating_sub(*amount)
                };
                match side {
                    Side::Long => state.long_reserved = next,
                    Side::Short => state.short_reserved = next,
                }
            }
            LedgerOp::PoolBalance {
                amount,
                is_increase,
            } => {
                let current = state.pool_balance(side);
                let next = if *is_increase {
                    current.add(*amount)
                } else {
                    current
                        .checked_sub(*amount)
                        .ok_or(VaultError::InsufficientBalance)?
                };
                match side {
                    Side::Long => state.long_pool_balance = next,
                    Side::Short => state.short_pool_balance = next,
                }
            }
            LedgerOp::AccumulateFees { amount } => {
                let next = state.accumulated_fees(side).add(*amount);
                match side {
                    Side::Long => state.long_accumulated_fees = next,
                    Side::Short => state.short_accumulated_fees = next,
                }
            }
        }
    }
    Ok(state)
}

fn usd_to_tokens(usd: Usd, prices: &ExecutionPrices) -> Result<TokenAmount, ExecutionError> {
    Ok(math::from_usd(
        usd,
        prices.collateral_price,
        prices.collateral_base_unit,
    )?)
}

fn signed_usd_to_tokens(
    usd: Decimal,
    prices: &ExecutionPrices,
) -> Result<Decimal, ExecutionError> {
    Ok(math::signed_from_usd(
        SignedUsd::new(usd),
        prices.collateral_price,
        prices.collateral_base_unit,
    )?)
}

// favorable impact is paid out of the impact pool, adverse impact feeds it
fn push_impact_op(
    ops: &mut Vec<LedgerOp>,
    prices: &ExecutionPrices,
) -> Result<(), ExecutionError> {
    if prices.price_impact_usd.is_zero() {
        return Ok(());
    }
    let delta = signed_usd_to_tokens(-prices.price_impact_usd.value(), prices)?;
    ops.push(LedgerOp::ImpactPool { delta });
    Ok(())
}

// settled funding moves between the position's collateral and the pool
fn push_funding_pool_op(
    ops: &mut Vec<LedgerOp>,
    fee_state: &FeeState,
    prices: &ExecutionPrices,
) -> Result<(), ExecutionError> {
    if fee_state.funding_fee.is_zero() {
        return Ok(());
    }
    let delta = signed_usd_to_tokens(fee_state.funding_fee.value(), prices)?;
    ops.push(LedgerOp::PoolBalance {
        amount: TokenAmount::new_unchecked(delta.abs()),
        is_increase: delta > Decimal::ZERO,
    });
    Ok(())
}

fn funding_pool_delta(
    fee_state: &FeeState,
    prices: &ExecutionPrices,
) -> Result<Decimal, ExecutionError> {
    if fee_state.funding_fee.is_zero() {
        return Ok(Decimal::ZERO);
    }
    signed_usd_to_tokens(fee_state.funding_fee.value(), prices)
}

// liquidations and ADL act on positions without a queued request; the
// synthetic request reuses the position's own parameters
fn synthetic_decrease_request(
    position: &Position,
    request_id: RequestId,
    execution_fee: Usd,
    size_delta: Option<Usd>,
) -> Request {
    let input = RequestInput {
        ticker: position.ticker.clone(),
        collateral_token: position.collateral_token.clone(),
        collateral_delta: Usd::zero(),
        size_delta: size_delta.unwrap_or(position.size),
        limit_price: None,
        max_slippage: MAX_SLIPPAGE,
        execution_fee,
        side: position.side,
        is_limit: false,
        is_increase: false,
        reverse_wrap: false,
        conditionals: Conditionals::default(),
    };
    Request {
        input,
        user: position.user,
        requested_at: position.last_update,
        request_type: RequestType::PositionDecrease,
        request_id,
    }
}

// conditionals declared on a create request become pending stop loss /
// take profit requests bound to the new position. built and validated
// before commit so registration cannot fail halfway.
fn build_pending_conditionals(
    request: &Request,
    position: &Position,
    now: Timestamp,
) -> Result<Vec<Request>, ExecutionError> {
    let mut pending = Vec::new();
    let conditionals = request.input.conditionals;

    let slots = [
        (conditionals.stop_loss, RequestType::StopLoss),
        (conditionals.take_profit, RequestType::TakeProfit),
    ];
    for (conditional, request_type) in slots {
        let Some(conditional) = conditional else {
            continue;
        };
        let input = RequestInput {
            ticker: request.input.ticker.clone(),
            collateral_token: request.input.collateral_token.clone(),
            collateral_delta: Usd::zero(),
            size_delta: position.size.mul(conditional.size_percentage),
            limit_price: Some(conditional.trigger_price),
            max_slippage: request.input.max_slippage,
            execution_fee: request.input.execution_fee,
            side: request.input.side,
            is_limit: true,
            is_increase: false,
            reverse_wrap: request.input.reverse_wrap,
            conditionals: Conditionals::default(),
        };
        pending.push(Request::new(
            input,
            request.user,
            request_type,
            request.request_id,
            now,
        )?);
    }

    Ok(pending)
}
