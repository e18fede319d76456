// 8.7 engine/derivatives.rs: derivative and binary-option orders.
// 8.7.1 matching and the per-fill position/margin accounting, 8.7.2 margin checks,
// 8.7.3 limit orders, 8.7.4 market orders, 8.7.5 staged market orders at end of block.
//
// a vanilla order holds its margin plus the worst-case taker fee; a reduce-only order
// (zero margin) holds nothing and pays its fee out of what the closed position returns.
// each fill settles both legs against the market balance in one delta.

use super::core::{ensure_owner, Engine};
use super::orders::CancelKind;
use super::results::ExchangeError;
use crate::deposits::{add_to_fee_pool, charge_held, credit, hold, release};
use crate::events::{CancelReason, EventPayload, NewDerivativeOrdersEvent, PositionUpdateEvent, TradeEvent};
use crate::funding::cumulative_funding;
use crate::margin::{
    check_open_notional_cap, check_order_margin, check_reduce_only, mark_adjusted_requirement, MarginError,
};
use crate::market::{get_any_derivative_market, AnyDerivativeMarket, DerivativeMarketLike, MarketInfo};
use crate::market_balance::{apply_market_balance_delta, apply_open_interest_delta};
use crate::msgs::OrderCreated;
use crate::order::{compute_order_hash, DerivativeLimitOrder, DerivativeOrder, MarketOrder, OrderError};
use crate::orderbook::{
    best_price, crossing_orders, has_market_order_this_block, insert_limit_order, mark_market_order,
    markets_with_staged_orders, next_trade_nonce, replace_limit_order, stage_market_order, staged_market_orders,
    unstage_market_order, BookKind,
};
use crate::position::{get_position, set_position, Position, PositionDelta, PositionOutcome};
use crate::types::{Address, MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// Incoming derivative order while it walks the book.
#[derive(Debug, Clone)]
pub(super) struct DerivativeTaker {
    pub subaccount: SubaccountId,
    pub order_hash: OrderHash,
    pub cid: String,
    pub side: Side,
    pub worst_price: Decimal,
    pub remaining: Decimal,
    pub fee_rate: Decimal,
    /// order margin still backing `remaining`
    pub margin_remaining: Decimal,
    /// fee reserve still backing `remaining`
    pub fee_held: Decimal,
    pub reduce_only: bool,
    /// set once a reduce-only taker has nothing left to close
    pub exhausted: bool,
}

impl DerivativeTaker {
    pub(super) fn from_limit(order: &DerivativeLimitOrder, fee_rate: Decimal) -> Self {
        let fee_held = order.margin_hold(fee_rate) - order.margin;
        Self {
            subaccount: order.order_info.subaccount_id,
            order_hash: order.order_hash,
            cid: order.order_info.cid.clone(),
            side: order.order_type.side(),
            worst_price: order.order_info.price,
            remaining: order.fillable,
            fee_rate,
            margin_remaining: order.margin,
            fee_held,
            reduce_only: !order.is_vanilla(),
            exhausted: false,
        }
    }

    pub(super) fn from_market(order: &MarketOrder, fee_rate: Decimal) -> Self {
        Self {
            subaccount: order.order_info.subaccount_id,
            order_hash: order.order_hash,
            cid: order.order_info.cid.clone(),
            side: order.side(),
            worst_price: order.order_info.price,
            remaining: order.order_info.quantity,
            fee_rate,
            margin_remaining: order.margin,
            fee_held: order.balance_hold - order.margin,
            reduce_only: order.is_reduce_only(),
            exhausted: false,
        }
    }

    /// Everything the taker still holds.
    pub(super) fn held(&self) -> Decimal {
        self.margin_remaining + self.fee_held
    }
}

/// Fee reserve a vanilla order takes on top of its margin.
pub(super) fn fee_reserve(quantity: Decimal, price: Decimal, fee_rate: Decimal, margin: Decimal) -> Decimal {
    if margin.is_zero() {
        Decimal::ZERO
    } else {
        quantity * price * fee_rate.max(Decimal::ZERO)
    }
}

/// Fails when `margin` no longer covers an order of `quantity` at `price` once its
/// distance from the current mark is priced in. Orders without margin (reduce-only) and
/// markets without a mark threshold always pass.
fn check_mark_threshold(
    market: &AnyDerivativeMarket,
    side: Side,
    price: Decimal,
    quantity: Decimal,
    margin: Decimal,
    mark: Option<Decimal>,
) -> Result<(), MarginError> {
    let Some(mark) = mark else {
        return Ok(());
    };
    if margin.is_zero() {
        return Ok(());
    }
    let required = mark_adjusted_requirement(market.initial_margin_ratio(), price, quantity, mark, side);
    if margin < required {
        return Err(MarginError::MarkPriceMarginViolation { required, provided: margin });
    }
    Ok(())
}

enum FillOutcome {
    Filled,
    MakerCancelled,
    TakerExhausted,
}

/// One side of a fill, worked out before anything is written.
struct Leg {
    subaccount: SubaccountId,
    before: Position,
    after: Position,
    outcome: PositionOutcome,
    fee: Decimal,
    reduce_only: bool,
}

impl Leg {
    fn preview(mut position: Position, subaccount: SubaccountId, delta: PositionDelta, fee: Decimal, reduce_only: bool) -> Self {
        let before = position.clone();
        let closing_fee = if reduce_only { fee } else { Decimal::ZERO };
        let outcome = position.apply_position_delta(&delta, closing_fee);
        Self {
            subaccount,
            before,
            after: position,
            outcome,
            fee,
            reduce_only,
        }
    }
}

impl Engine {
    // 8.7.1: matching

    /// Mark the orders were priced against at placement may have moved since; matching
    /// re-checks both sides against the current one.
    fn match_mark(&self, market: &AnyDerivativeMarket) -> Result<Option<Decimal>, ExchangeError> {
        if market.is_fully_collateralized() {
            return Ok(None);
        }
        self.require_mark_price(market).map(Some)
    }

    fn check_taker_mark(&self, market: &AnyDerivativeMarket, taker: &DerivativeTaker) -> Result<(), ExchangeError> {
        if taker.reduce_only {
            return Ok(());
        }
        let mark = self.match_mark(market)?;
        check_mark_threshold(market, taker.side, taker.worst_price, taker.remaining, taker.margin_remaining, mark)?;
        Ok(())
    }

    pub(super) fn match_derivative_taker(&mut self, market: &AnyDerivativeMarket, taker: &mut DerivativeTaker) -> Result<(), ExchangeError> {
        let market_id = market.market_id();
        let mark = self.match_mark(market)?;
        self.check_taker_mark(market, taker)?;

        let maker_side = taker.side.opposite();
        let makers = crossing_orders::<DerivativeLimitOrder>(&self.ledger, &market_id, maker_side, taker.worst_price)?;
        for maker in makers {
            if taker.remaining.is_zero() {
                break;
            }
            if maker.order_info.subaccount_id == taker.subaccount {
                self.cancel_derivative_limit_order(market, &maker, CancelReason::SelfTrade)?;
                continue;
            }
            if let Err(err) = check_mark_threshold(market, maker_side, maker.order_info.price, maker.fillable, maker.margin, mark) {
                warn!(market = %market_id, maker = %maker.order_info.subaccount_id, hash = %maker.order_hash, %err, "maker below mark threshold");
                self.cancel_derivative_limit_order(market, &maker, CancelReason::InsufficientMarginAtMark)?;
                continue;
            }
            let quantity = taker.remaining.min(maker.fillable);
            match self.fill_derivative(market, taker, &maker, quantity)? {
                FillOutcome::Filled | FillOutcome::MakerCancelled => {}
                FillOutcome::TakerExhausted => {
                    taker.exhausted = true;
                    break;
                }
            }
        }
        Ok(())
    }

    fn load_position(&self, market_id: &MarketId, sub: &SubaccountId, is_long: bool, funding: Decimal) -> Result<Position, ExchangeError> {
        let mut position = get_position(&self.ledger, market_id, sub)?.unwrap_or_else(|| Position::new(is_long, funding));
        position.apply_funding(funding);
        Ok(position)
    }

    fn fill_derivative(
        &mut self,
        market: &AnyDerivativeMarket,
        taker: &mut DerivativeTaker,
        maker: &DerivativeLimitOrder,
        wanted: Decimal,
    ) -> Result<FillOutcome, ExchangeError> {
        let market_id = market.market_id();
        let quote = market.quote_denom().to_string();
        let price = maker.order_info.price;
        let maker_sub = maker.order_info.subaccount_id;
        let maker_side = maker.order_type.side();
        let funding = cumulative_funding(&self.ledger, &market_id)?;

        let taker_position = self.load_position(&market_id, &taker.subaccount, taker.side.is_buy(), funding)?;
        let maker_position = self.load_position(&market_id, &maker_sub, maker_side.is_buy(), funding)?;

        // reduce-only orders never open: cap each at what its position can still close
        let mut quantity = wanted;
        let mut maker_stale = false;
        if !maker.is_vanilla() {
            let closable = maker_position.closing_quantity(maker_side.is_buy(), quantity);
            if closable.is_zero() {
                self.cancel_derivative_limit_order(market, maker, CancelReason::PositionClosed)?;
                return Ok(FillOutcome::MakerCancelled);
            }
            maker_stale = closable < quantity;
            quantity = closable;
        }
        if taker.reduce_only {
            let closable = taker_position.closing_quantity(taker.side.is_buy(), quantity);
            if closable.is_zero() {
                return Ok(FillOutcome::TakerExhausted);
            }
            quantity = closable;
        }

        let notional = quantity * price;
        let taker_fee = notional * taker.fee_rate;
        let maker_fee = notional * market.maker_fee_rate();
        let last_fill = quantity == taker.remaining;
        let taker_margin = if taker.reduce_only {
            Decimal::ZERO
        } else if last_fill {
            taker.margin_remaining
        } else {
            taker.margin_remaining * quantity / taker.remaining
        };
        let maker_margin = maker.margin_for(quantity);

        let taker_leg = Leg::preview(
            taker_position,
            taker.subaccount,
            PositionDelta {
                is_long: taker.side.is_buy(),
                execution_quantity: quantity,
                execution_margin: taker_margin,
                execution_price: price,
            },
            taker_fee,
            taker.reduce_only,
        );
        if taker_leg.outcome.payout < Decimal::ZERO {
            return Err(MarginError::Bankrupt.into());
        }
        let maker_leg = Leg::preview(
            maker_position,
            maker_sub,
            PositionDelta {
                is_long: maker_side.is_buy(),
                execution_quantity: quantity,
                execution_margin: maker_margin,
                execution_price: price,
            },
            maker_fee,
            !maker.is_vanilla(),
        );
        if maker_leg.outcome.payout < Decimal::ZERO {
            warn!(market = %market_id, maker = %maker_sub, hash = %maker.order_hash, "maker fill below bankruptcy");
            self.cancel_derivative_limit_order(market, maker, CancelReason::Bankrupt)?;
            return Ok(FillOutcome::MakerCancelled);
        }

        // the reserve releases in proportion at the order's own price, so what is left keeps
        // backing the unfilled rest; a sell filled above its limit tops up from available
        let taker_fee_reserved = if taker.reduce_only {
            Decimal::ZERO
        } else if last_fill {
            taker.fee_held
        } else {
            quantity * taker.worst_price * taker.fee_rate.max(Decimal::ZERO)
        };
        let maker_fee_reserved = fee_reserve(quantity, price, market.taker_fee_rate(), maker.margin);

        let mut market_delta = self.settle_leg(&quote, &taker_leg, taker_fee_reserved)?;
        market_delta += self.settle_leg(&quote, &maker_leg, maker_fee_reserved)?;
        apply_market_balance_delta(&mut self.ledger, &market_id, market_delta)?;
        add_to_fee_pool(&mut self.ledger, &quote, taker_fee + maker_fee)?;

        let open_interest_delta = (taker_leg.after.quantity - taker_leg.before.quantity
            + maker_leg.after.quantity
            - maker_leg.before.quantity)
            / Decimal::TWO;
        apply_open_interest_delta(&mut self.ledger, &market_id, open_interest_delta)?;
        for leg in [&taker_leg, &maker_leg] {
            set_position(&mut self.ledger, &market_id, &leg.subaccount, &leg.after)?;
            self.emit(EventPayload::PositionUpdate(PositionUpdateEvent {
                market_id,
                subaccount_id: leg.subaccount,
                position: leg.after.clone(),
            }));
        }

        let mut updated = maker.clone();
        updated.fillable -= quantity;
        updated.margin -= maker_margin;
        replace_limit_order(&mut self.ledger, &market_id, maker, &updated)?;
        if maker_stale && updated.fillable > Decimal::ZERO {
            self.cancel_derivative_limit_order(market, &updated, CancelReason::PositionClosed)?;
        }

        taker.remaining -= quantity;
        taker.margin_remaining -= taker_margin;
        taker.fee_held -= taker_fee_reserved;

        debug!(market = %market_id, %price, %quantity, taker = %taker.subaccount, maker = %maker_sub, "derivative fill");
        self.emit(EventPayload::DerivativeTrade(TradeEvent {
            market_id,
            subaccount_id: taker.subaccount,
            order_hash: taker.order_hash,
            cid: taker.cid.clone(),
            side: taker.side,
            quantity,
            price,
            fee: taker_fee,
            is_maker: false,
            realized_pnl: taker_leg.outcome.pnl,
        }));
        self.emit(EventPayload::DerivativeTrade(TradeEvent {
            market_id,
            subaccount_id: maker_sub,
            order_hash: maker.order_hash,
            cid: maker.order_info.cid.clone(),
            side: maker_side,
            quantity,
            price,
            fee: maker_fee,
            is_maker: true,
            realized_pnl: maker_leg.outcome.pnl,
        }));
        Ok(FillOutcome::Filled)
    }

    /// Moves one leg's funds and returns what it adds to the market balance.
    fn settle_leg(&mut self, quote: &str, leg: &Leg, fee_reserved: Decimal) -> Result<Decimal, ExchangeError> {
        let sub = &leg.subaccount;
        let outcome = &leg.outcome;
        credit(&mut self.ledger, sub, quote, outcome.payout)?;
        if leg.reduce_only {
            // fee already came out of the payout
            return Ok(-(outcome.payout + leg.fee));
        }
        charge_held(&mut self.ledger, sub, quote, outcome.collateralization_margin)?;
        release(&mut self.ledger, sub, quote, outcome.close_execution_margin)?;
        self.settle_fee(sub, quote, fee_reserved, leg.fee)?;
        Ok(outcome.collateralization_margin - outcome.payout)
    }

    // 8.7.2: margin

    /// Margin the order will hold. Reduce-only orders must fit inside the position, binary
    /// orders lock their full payout, vanilla orders pass the mark-adjusted check and the
    /// open notional cap.
    pub(super) fn checked_order_margin(&self, market: &AnyDerivativeMarket, order: &DerivativeOrder) -> Result<Decimal, ExchangeError> {
        let market_id = market.market_id();
        let info = &order.order_info;
        let side = order.order_type.side();
        let position = get_position(&self.ledger, &market_id, &info.subaccount_id)?;

        if order.is_reduce_only() {
            check_reduce_only(&self.ledger, &market_id, &info.subaccount_id, side, info.quantity, position.as_ref())?;
            return Ok(Decimal::ZERO);
        }
        if let AnyDerivativeMarket::Binary(_) = market {
            return Ok(market.order_margin_requirement(info.price, info.quantity, side));
        }
        let mark = self.require_mark_price(market)?;
        check_order_margin(market, side, info.price, info.quantity, order.margin, Some(mark))?;
        check_open_notional_cap(
            &self.ledger,
            &market_id,
            &info.subaccount_id,
            market.open_notional_cap(),
            position.as_ref(),
            mark,
            info.quantity * info.price,
        )?;
        Ok(order.margin)
    }

    fn check_derivative_order(&self, market: &AnyDerivativeMarket, order: &DerivativeOrder, is_market: bool) -> Result<(), ExchangeError> {
        if !market.is_active() {
            return Err(ExchangeError::MarketNotActive(market.market_id()));
        }
        order.validate_basic(is_market, self.block.height)?;
        market.validate_price_and_quantity(order.order_info.price, order.order_info.quantity)?;
        Ok(())
    }

    // 8.7.3: limit orders

    pub(super) fn create_derivative_limit_order(
        &mut self,
        sender: Address,
        order: DerivativeOrder,
        binary: bool,
    ) -> Result<OrderCreated, ExchangeError> {
        ensure_owner(&sender, &order.order_info.subaccount_id)?;
        let market = self.load_derivative_market(&order.market_id, binary)?;
        self.place_derivative_limit_order(&market, order)
    }

    pub(super) fn place_derivative_limit_order(
        &mut self,
        market: &AnyDerivativeMarket,
        mut order: DerivativeOrder,
    ) -> Result<OrderCreated, ExchangeError> {
        if order.order_type.is_atomic() {
            return Err(OrderError::UnsupportedOrderType(order.order_type).into());
        }
        self.check_derivative_order(market, &order, false)?;
        if order.is_conditional() {
            return self.place_conditional_order(market, order, true);
        }
        if self.params.is_post_only_mode(self.block.height) {
            order.order_type = order.order_type.post_only();
        }

        let market_id = market.market_id();
        let sub = order.order_info.subaccount_id;
        self.ensure_cid_free(&market_id, &sub, &order.order_info.cid)?;
        let margin = self.checked_order_margin(market, &order)?;

        let side = order.order_type.side();
        let price = order.order_info.price;
        if order.order_type.is_post_only() {
            let crosses = match (side, best_price(&self.ledger, &market_id, side.opposite())?) {
                (Side::Buy, Some(ask)) => ask <= price,
                (Side::Sell, Some(bid)) => bid >= price,
                (_, None) => false,
            };
            if crosses {
                return Err(ExchangeError::PostOnlyWouldCross(price));
            }
        }

        let quantity = order.order_info.quantity;
        let held = margin + fee_reserve(quantity, price, market.taker_fee_rate(), margin);
        hold(&mut self.ledger, &sub, market.quote_denom(), held)?;

        let nonce = next_trade_nonce(&mut self.ledger, &sub)?;
        let order_hash = compute_order_hash(&sub, &market_id, order.order_type, price, quantity, margin, None, nonce);
        let cid = order.order_info.cid.clone();
        self.accept_derivative_limit_order(
            market,
            DerivativeLimitOrder {
                order_info: order.order_info,
                order_type: order.order_type,
                margin,
                fillable: quantity,
                order_hash,
                trigger_price: None,
                expiration_block: order.expiration_block,
            },
        )?;
        Ok(OrderCreated { order_hash, cid })
    }

    /// Matches a held limit order and rests what is left. Also the landing point for
    /// triggered conditional limits.
    pub(super) fn accept_derivative_limit_order(
        &mut self,
        market: &AnyDerivativeMarket,
        order: DerivativeLimitOrder,
    ) -> Result<(), ExchangeError> {
        let market_id = market.market_id();
        let mut taker = DerivativeTaker::from_limit(&order, market.taker_fee_rate());
        if !order.order_type.is_post_only() {
            self.match_derivative_taker(market, &mut taker)?;
        }
        if taker.remaining.is_zero() {
            return Ok(());
        }
        if taker.exhausted {
            // reduce-only with its position gone: nothing was held, nothing rests
            self.emit_cancel(
                CancelKind::Derivative,
                market_id,
                taker.subaccount,
                taker.order_hash,
                &taker.cid,
                CancelReason::PositionClosed,
            );
            return Ok(());
        }
        let resting = DerivativeLimitOrder {
            margin: taker.margin_remaining,
            fillable: taker.remaining,
            ..order
        };
        insert_limit_order(&mut self.ledger, &market_id, &resting)?;
        self.emit(EventPayload::NewDerivativeOrders(NewDerivativeOrdersEvent {
            market_id,
            orders: vec![resting],
        }));
        Ok(())
    }

    // 8.7.4: market orders

    pub(super) fn create_derivative_market_order(
        &mut self,
        sender: Address,
        order: DerivativeOrder,
        binary: bool,
    ) -> Result<OrderCreated, ExchangeError> {
        ensure_owner(&sender, &order.order_info.subaccount_id)?;
        let market = self.load_derivative_market(&order.market_id, binary)?;
        self.place_derivative_market_order(&market, order)
    }

    pub(super) fn place_derivative_market_order(
        &mut self,
        market: &AnyDerivativeMarket,
        order: DerivativeOrder,
    ) -> Result<OrderCreated, ExchangeError> {
        if self.params.is_post_only_mode(self.block.height) {
            return Err(ExchangeError::PostOnlyMode);
        }
        if order.order_type.is_post_only() {
            return Err(OrderError::UnsupportedOrderType(order.order_type).into());
        }
        self.check_derivative_order(market, &order, true)?;
        if order.is_conditional() {
            return self.place_conditional_order(market, order, false);
        }

        let market_id = market.market_id();
        let sub = order.order_info.subaccount_id;
        if has_market_order_this_block(&self.ledger, &market_id, &sub) {
            return Err(ExchangeError::MarketOrderThisBlock);
        }
        self.ensure_cid_free(&market_id, &sub, &order.order_info.cid)?;
        let margin = self.checked_order_margin(market, &order)?;

        let fee_rate = if order.order_type.is_atomic() {
            market.taker_fee_rate() * self.params.atomic_market_order_fee_multiplier
        } else {
            market.taker_fee_rate()
        };
        let (price, quantity) = (order.order_info.price, order.order_info.quantity);
        let held = margin + fee_reserve(quantity, price, fee_rate, margin);
        hold(&mut self.ledger, &sub, market.quote_denom(), held)?;

        let nonce = next_trade_nonce(&mut self.ledger, &sub)?;
        let order_hash = compute_order_hash(&sub, &market_id, order.order_type, price, quantity, margin, None, nonce);
        mark_market_order(&mut self.ledger, &market_id, &sub);

        let cid = order.order_info.cid.clone();
        let staged = MarketOrder {
            market_id,
            order_info: order.order_info,
            order_type: order.order_type,
            margin,
            balance_hold: held,
            order_hash,
        };
        if order.order_type.is_atomic() {
            let mut taker = DerivativeTaker::from_market(&staged, fee_rate);
            self.match_derivative_taker(market, &mut taker)?;
            release(&mut self.ledger, &sub, market.quote_denom(), taker.held())?;
        } else {
            stage_market_order(&mut self.ledger, BookKind::Derivative, &staged)?;
        }
        Ok(OrderCreated { order_hash, cid })
    }

    // 8.7.5: end of block

    pub(super) fn execute_staged_derivative_market_orders(&mut self) -> Result<usize, ExchangeError> {
        let mut executed = 0;
        for market_id in markets_with_staged_orders(&self.ledger, BookKind::Derivative) {
            let market = get_any_derivative_market(&self.ledger, &market_id)?.ok_or(ExchangeError::MarketNotFound(market_id))?;
            let quote = market.quote_denom().to_string();
            for side in [Side::Buy, Side::Sell] {
                for order in staged_market_orders(&self.ledger, BookKind::Derivative, &market_id, side)? {
                    match self.isolated(|engine| engine.execute_staged_derivative_order(&market, &order)) {
                        Ok(true) => executed += 1,
                        Ok(false) => {}
                        Err(err) if err.is_hard_failure() => return Err(err),
                        Err(err) => {
                            warn!(market = %market_id, hash = %order.order_hash, code = err.code(), "staged derivative order failed");
                            self.cancel_staged_market_order(BookKind::Derivative, &quote, &order, CancelReason::Unfilled)?;
                        }
                    }
                }
            }
        }
        Ok(executed)
    }

    fn execute_staged_derivative_order(&mut self, market: &AnyDerivativeMarket, order: &MarketOrder) -> Result<bool, ExchangeError> {
        unstage_market_order(&mut self.ledger, BookKind::Derivative, order);
        let market_id = market.market_id();
        let sub = order.order_info.subaccount_id;

        if !market.is_active() {
            release(&mut self.ledger, &sub, market.quote_denom(), order.balance_hold)?;
            self.emit_cancel(CancelKind::Derivative, market_id, sub, order.order_hash, &order.order_info.cid, CancelReason::MarketClosed);
            return Ok(false);
        }

        let mut taker = DerivativeTaker::from_market(order, market.taker_fee_rate());
        match self.check_taker_mark(market, &taker) {
            Ok(()) => {}
            Err(ExchangeError::Margin(err @ MarginError::MarkPriceMarginViolation { .. })) => {
                warn!(market = %market_id, hash = %order.order_hash, %err, "staged market order below mark threshold");
                release(&mut self.ledger, &sub, market.quote_denom(), order.balance_hold)?;
                self.emit_cancel(
                    CancelKind::Derivative,
                    market_id,
                    sub,
                    order.order_hash,
                    &order.order_info.cid,
                    CancelReason::InsufficientMarginAtMark,
                );
                return Ok(false);
            }
            Err(err) => return Err(err),
        }
        self.match_derivative_taker(market, &mut taker)?;
        release(&mut self.ledger, &sub, market.quote_denom(), taker.held())?;
        if taker.remaining > Decimal::ZERO {
            self.emit_cancel(CancelKind::Derivative, market_id, sub, order.order_hash, &order.order_info.cid, CancelReason::Unfilled);
        }
        Ok(taker.remaining < order.order_info.quantity)
    }
}
