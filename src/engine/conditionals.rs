// 8.8 engine/conditionals.rs: stop and take-profit orders. placement holds funds like a
// resting order would; the end-of-block sweep turns triggered ones into real orders.

use super::core::Engine;
use super::derivatives::{fee_reserve, DerivativeTaker};
use super::orders::CancelKind;
use super::results::ExchangeError;
use crate::conditional::{insert_conditional_order, remove_conditional_order, triggered_orders, ConditionalOrder, TriggerCondition};
use crate::deposits::{hold, release};
use crate::events::{CancelReason, EventPayload, NewConditionalOrderEvent};
use crate::margin::check_reduce_only;
use crate::market::{all_markets, AnyDerivativeMarket, BinaryOptionsMarket, DerivativeMarket, MarketInfo};
use crate::msgs::OrderCreated;
use crate::order::{compute_order_hash, DerivativeLimitOrder, DerivativeOrder, OrderError};
use crate::orderbook::next_trade_nonce;
use crate::position::get_position;
use rust_decimal::Decimal;
use tracing::{debug, warn};

impl Engine {
    /// Parks a conditional order in its trigger book. The side of the mark the trigger
    /// sits on fixes which way the mark has to move to fire it.
    pub(super) fn place_conditional_order(
        &mut self,
        market: &AnyDerivativeMarket,
        order: DerivativeOrder,
        is_limit: bool,
    ) -> Result<OrderCreated, ExchangeError> {
        if order.expiration_block != 0 {
            return Err(OrderError::ExpirationOnConditionalOrder.into());
        }
        let trigger_price = order.trigger_price.ok_or(OrderError::MissingTriggerPrice)?;
        let mark = self.require_mark_price(market)?;

        let market_id = market.market_id();
        let sub = order.order_info.subaccount_id;
        self.ensure_cid_free(&market_id, &sub, &order.order_info.cid)?;
        let margin = self.checked_order_margin(market, &order)?;

        let (price, quantity) = (order.order_info.price, order.order_info.quantity);
        let held = margin + fee_reserve(quantity, price, market.taker_fee_rate(), margin);
        hold(&mut self.ledger, &sub, market.quote_denom(), held)?;

        let nonce = next_trade_nonce(&mut self.ledger, &sub)?;
        let order_hash = compute_order_hash(
            &sub,
            &market_id,
            order.order_type,
            price,
            quantity,
            margin,
            Some(trigger_price),
            nonce,
        );
        let cid = order.order_info.cid.clone();
        let conditional = ConditionalOrder {
            order_info: order.order_info,
            order_type: order.order_type,
            margin,
            trigger_price,
            condition: TriggerCondition::for_placement(trigger_price, mark),
            is_limit,
            order_hash,
        };
        insert_conditional_order(&mut self.ledger, &market_id, &conditional)?;
        self.emit(EventPayload::NewConditionalOrder(NewConditionalOrderEvent {
            market_id,
            order: conditional,
        }));
        Ok(OrderCreated { order_hash, cid })
    }

    /// Fires every conditional order whose trigger the mark price has reached, in every
    /// active derivative and binary market. Returns how many fired.
    pub(super) fn trigger_conditional_orders(&mut self) -> Result<usize, ExchangeError> {
        let markets: Vec<AnyDerivativeMarket> = all_markets::<DerivativeMarket, _>(&self.ledger)?
            .into_iter()
            .map(AnyDerivativeMarket::Derivative)
            .chain(
                all_markets::<BinaryOptionsMarket, _>(&self.ledger)?
                    .into_iter()
                    .map(AnyDerivativeMarket::Binary),
            )
            .filter(|m| m.is_active())
            .collect();

        let mut fired = 0;
        for market in markets {
            let Some(mark) = self.mark_price(&market) else {
                continue;
            };
            for order in triggered_orders(&self.ledger, &market.market_id(), mark)? {
                match self.isolated(|engine| engine.execute_triggered_order(&market, &order)) {
                    Ok(()) => fired += 1,
                    Err(err) if err.is_hard_failure() => return Err(err),
                    Err(err) => {
                        warn!(market = %market.market_id(), hash = %order.order_hash, code = err.code(), "triggered order failed");
                        self.cancel_conditional_order(&market, &order, CancelReason::TriggerFailed)?;
                    }
                }
            }
        }
        Ok(fired)
    }

    fn execute_triggered_order(&mut self, market: &AnyDerivativeMarket, order: &ConditionalOrder) -> Result<(), ExchangeError> {
        let market_id = market.market_id();
        let sub = order.order_info.subaccount_id;
        remove_conditional_order(&mut self.ledger, &market_id, order)?;
        if order.is_reduce_only() {
            let position = get_position(&self.ledger, &market_id, &sub)?;
            check_reduce_only(&self.ledger, &market_id, &sub, order.side(), order.order_info.quantity, position.as_ref())?;
        }
        debug!(market = %market_id, hash = %order.order_hash, trigger = %order.trigger_price, "conditional order triggered");

        let limit = DerivativeLimitOrder {
            order_info: order.order_info.clone(),
            order_type: order.order_type.untriggered(),
            margin: order.margin,
            fillable: order.order_info.quantity,
            order_hash: order.order_hash,
            trigger_price: Some(order.trigger_price),
            expiration_block: 0,
        };
        if order.is_limit {
            // the conditional hold carries over unchanged as the resting order's hold
            return self.accept_derivative_limit_order(market, limit);
        }

        let mut taker = DerivativeTaker::from_limit(&limit, market.taker_fee_rate());
        self.match_derivative_taker(market, &mut taker)?;
        release(&mut self.ledger, &sub, market.quote_denom(), taker.held())?;
        if taker.remaining > Decimal::ZERO {
            self.emit_cancel(CancelKind::Derivative, market_id, sub, order.order_hash, &order.order_info.cid, CancelReason::Unfilled);
        }
        Ok(())
    }
}
