// 8.4 engine/orders.rs: order handles and cancellation. every path that takes an order
// off the books ends here, so the hold it carried is always released in one place.
// 8.4.1 resolves handles, 8.4.2 cancels single orders, 8.4.3 cancels in bulk.

use super::core::{ensure_owner, Engine};
use super::results::ExchangeError;
use crate::conditional::{
    find_conditional_order, market_conditional_orders, remove_conditional_order, subaccount_conditional_orders,
    ConditionalOrder,
};
use crate::deposits::{charge_held, credit, debit, release};
use crate::events::{CancelReason, EventPayload, OrderCancelledEvent};
use crate::market::{AnyDerivativeMarket, MarketInfo, SpotMarket};
use crate::order::{DerivativeLimitOrder, MarketOrder, OrderData, OrderIdentifier, SpotLimitOrder};
use crate::orderbook::{
    book_orders, find_limit_order, find_staged_market_order, get_cid, remove_limit_order, staged_market_orders,
    subaccount_orders, unstage_market_order, BookKind,
};
use crate::types::{Address, MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use tracing::debug;

/// Funds a conditional order holds until it triggers.
pub(super) fn conditional_hold(order: &ConditionalOrder, taker_fee_rate: Decimal) -> Decimal {
    if order.is_reduce_only() {
        return Decimal::ZERO;
    }
    order.margin + order.order_info.quantity * order.order_info.price * taker_fee_rate.max(Decimal::ZERO)
}

impl Engine {
    // 8.4.0: moving held funds

    /// Pays `spent` out of a hold of `reserved`: the rest goes back to available, a
    /// shortfall is taken from available.
    pub(super) fn spend_held(&mut self, sub: &SubaccountId, denom: &str, reserved: Decimal, spent: Decimal) -> Result<(), ExchangeError> {
        if spent <= reserved {
            charge_held(&mut self.ledger, sub, denom, spent)?;
            release(&mut self.ledger, sub, denom, reserved - spent)?;
        } else {
            charge_held(&mut self.ledger, sub, denom, reserved)?;
            debit(&mut self.ledger, sub, denom, spent - reserved)?;
        }
        Ok(())
    }

    /// Settles a trading fee against its hold. A negative fee is a rebate.
    pub(super) fn settle_fee(&mut self, sub: &SubaccountId, denom: &str, reserved: Decimal, fee: Decimal) -> Result<(), ExchangeError> {
        if fee < Decimal::ZERO {
            release(&mut self.ledger, sub, denom, reserved)?;
            credit(&mut self.ledger, sub, denom, -fee)?;
            return Ok(());
        }
        self.spend_held(sub, denom, reserved, fee)
    }

    pub(super) fn ensure_cid_free(&self, market: &MarketId, sub: &SubaccountId, cid: &str) -> Result<(), ExchangeError> {
        if !cid.is_empty() && get_cid(&self.ledger, market, sub, cid)?.is_some() {
            return Err(ExchangeError::DuplicateCid(cid.to_string()));
        }
        Ok(())
    }

    // 8.4.1: handles

    pub(super) fn resolve_order_hash(&self, data: &OrderData) -> Result<OrderHash, ExchangeError> {
        match &data.identifier {
            OrderIdentifier::Hash(hash) => Ok(*hash),
            OrderIdentifier::Cid(cid) => get_cid(&self.ledger, &data.market_id, &data.subaccount_id, cid)?
                .map(|record| record.order_hash)
                .ok_or_else(|| ExchangeError::OrderNotFound(cid.clone())),
        }
    }

    pub(super) fn emit_cancel(&mut self, kind: CancelKind, market_id: MarketId, sub: SubaccountId, hash: OrderHash, cid: &str, reason: CancelReason) {
        let event = OrderCancelledEvent {
            market_id,
            subaccount_id: sub,
            order_hash: hash,
            cid: cid.to_string(),
            reason,
        };
        self.emit(match kind {
            CancelKind::Spot => EventPayload::CancelSpotOrder(event),
            CancelKind::Derivative => EventPayload::CancelDerivativeOrder(event),
            CancelKind::Conditional => EventPayload::CancelConditionalOrder(event),
        });
    }

    // 8.4.2: single orders

    pub(super) fn cancel_spot_order(&mut self, sender: Address, data: &OrderData) -> Result<(), ExchangeError> {
        ensure_owner(&sender, &data.subaccount_id)?;
        let market = self.load_spot_market(&data.market_id)?;
        self.cancel_spot_order_in(&market, data)
    }

    pub(super) fn cancel_spot_order_in(&mut self, market: &SpotMarket, data: &OrderData) -> Result<(), ExchangeError> {
        if !market.status.supports_order_cancellations() {
            return Err(ExchangeError::CancellationsDisabled {
                market: market.market_id,
                status: market.status,
            });
        }
        let hash = self.resolve_order_hash(data)?;
        if let Some(order) = find_limit_order::<SpotLimitOrder>(&self.ledger, &market.market_id, &data.subaccount_id, &hash)? {
            return self.cancel_spot_limit_order(market, &order, CancelReason::UserRequested);
        }
        if let Some(order) = find_staged_market_order(&self.ledger, BookKind::Spot, &market.market_id, &data.subaccount_id, &hash)? {
            let denom = spot_hold_denom(market, order.side()).to_string();
            return self.cancel_staged_market_order(BookKind::Spot, &denom, &order, CancelReason::UserRequested);
        }
        Err(ExchangeError::OrderNotFound(hash.to_hex()))
    }

    pub(super) fn cancel_derivative_order(&mut self, sender: Address, data: &OrderData, binary: bool) -> Result<(), ExchangeError> {
        ensure_owner(&sender, &data.subaccount_id)?;
        let market = self.load_derivative_market(&data.market_id, binary)?;
        self.cancel_derivative_order_in(&market, data)
    }

    /// Limit book first, then this block's market orders, then the trigger books.
    pub(super) fn cancel_derivative_order_in(&mut self, market: &AnyDerivativeMarket, data: &OrderData) -> Result<(), ExchangeError> {
        let market_id = market.market_id();
        if !market.status().supports_order_cancellations() {
            return Err(ExchangeError::CancellationsDisabled {
                market: market_id,
                status: market.status(),
            });
        }
        let hash = self.resolve_order_hash(data)?;
        let sub = data.subaccount_id;
        if let Some(order) = find_limit_order::<DerivativeLimitOrder>(&self.ledger, &market_id, &sub, &hash)? {
            return self.cancel_derivative_limit_order(market, &order, CancelReason::UserRequested);
        }
        if let Some(order) = find_staged_market_order(&self.ledger, BookKind::Derivative, &market_id, &sub, &hash)? {
            let denom = market.quote_denom().to_string();
            return self.cancel_staged_market_order(BookKind::Derivative, &denom, &order, CancelReason::UserRequested);
        }
        if let Some(order) = find_conditional_order(&self.ledger, &market_id, &sub, &hash)? {
            return self.cancel_conditional_order(market, &order, CancelReason::UserRequested);
        }
        Err(ExchangeError::OrderNotFound(hash.to_hex()))
    }

    pub(super) fn cancel_spot_limit_order(
        &mut self,
        market: &SpotMarket,
        order: &SpotLimitOrder,
        reason: CancelReason,
    ) -> Result<(), ExchangeError> {
        let sub = order.order_info.subaccount_id;
        remove_limit_order(&mut self.ledger, &market.market_id, order)?;
        let denom = spot_hold_denom(market, order.order_type.side());
        release(&mut self.ledger, &sub, denom, order.balance_hold(market.taker_fee_rate))?;
        debug!(market = %market.market_id, subaccount = %sub, hash = %order.order_hash, ?reason, "spot order cancelled");
        self.emit_cancel(CancelKind::Spot, market.market_id, sub, order.order_hash, &order.order_info.cid, reason);
        Ok(())
    }

    pub(super) fn cancel_derivative_limit_order(
        &mut self,
        market: &AnyDerivativeMarket,
        order: &DerivativeLimitOrder,
        reason: CancelReason,
    ) -> Result<(), ExchangeError> {
        let market_id = market.market_id();
        let sub = order.order_info.subaccount_id;
        remove_limit_order(&mut self.ledger, &market_id, order)?;
        release(&mut self.ledger, &sub, market.quote_denom(), order.margin_hold(market.taker_fee_rate()))?;
        debug!(market = %market_id, subaccount = %sub, hash = %order.order_hash, ?reason, "derivative order cancelled");
        self.emit_cancel(CancelKind::Derivative, market_id, sub, order.order_hash, &order.order_info.cid, reason);
        Ok(())
    }

    pub(super) fn cancel_staged_market_order(
        &mut self,
        kind: BookKind,
        denom: &str,
        order: &MarketOrder,
        reason: CancelReason,
    ) -> Result<(), ExchangeError> {
        let sub = order.order_info.subaccount_id;
        unstage_market_order(&mut self.ledger, kind, order);
        release(&mut self.ledger, &sub, denom, order.balance_hold)?;
        let cancel_kind = match kind {
            BookKind::Spot => CancelKind::Spot,
            BookKind::Derivative => CancelKind::Derivative,
        };
        self.emit_cancel(cancel_kind, order.market_id, sub, order.order_hash, &order.order_info.cid, reason);
        Ok(())
    }

    pub(super) fn cancel_conditional_order(
        &mut self,
        market: &AnyDerivativeMarket,
        order: &ConditionalOrder,
        reason: CancelReason,
    ) -> Result<(), ExchangeError> {
        let market_id = market.market_id();
        let sub = order.order_info.subaccount_id;
        remove_conditional_order(&mut self.ledger, &market_id, order)?;
        release(&mut self.ledger, &sub, market.quote_denom(), conditional_hold(order, market.taker_fee_rate()))?;
        self.emit_cancel(CancelKind::Conditional, market_id, sub, order.order_hash, &order.order_info.cid, reason);
        Ok(())
    }

    // 8.4.3: bulk

    /// Clears a spot market's book and this block's market orders.
    pub(super) fn cancel_all_spot_orders(&mut self, market: &SpotMarket, reason: CancelReason) -> Result<usize, ExchangeError> {
        let mut cancelled = 0;
        for side in [Side::Buy, Side::Sell] {
            for order in book_orders::<SpotLimitOrder>(&self.ledger, &market.market_id, side)? {
                self.cancel_spot_limit_order(market, &order, reason)?;
                cancelled += 1;
            }
            for order in staged_market_orders(&self.ledger, BookKind::Spot, &market.market_id, side)? {
                self.cancel_staged_market_order(BookKind::Spot, spot_hold_denom(market, side), &order, reason)?;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Clears limit, market and conditional orders of a derivative or binary market.
    pub(super) fn cancel_all_derivative_orders(&mut self, market: &AnyDerivativeMarket, reason: CancelReason) -> Result<usize, ExchangeError> {
        let market_id = market.market_id();
        let quote = market.quote_denom().to_string();
        let mut cancelled = 0;
        for side in [Side::Buy, Side::Sell] {
            for order in book_orders::<DerivativeLimitOrder>(&self.ledger, &market_id, side)? {
                self.cancel_derivative_limit_order(market, &order, reason)?;
                cancelled += 1;
            }
            for order in staged_market_orders(&self.ledger, BookKind::Derivative, &market_id, side)? {
                self.cancel_staged_market_order(BookKind::Derivative, &quote, &order, reason)?;
                cancelled += 1;
            }
        }
        for order in market_conditional_orders(&self.ledger, &market_id)? {
            self.cancel_conditional_order(market, &order, reason)?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    pub(super) fn cancel_subaccount_spot_orders(&mut self, market: &SpotMarket, sub: &SubaccountId) -> Result<usize, ExchangeError> {
        let mut cancelled = 0;
        for side in [Side::Buy, Side::Sell] {
            for order in subaccount_orders::<SpotLimitOrder>(&self.ledger, &market.market_id, side, sub)? {
                self.cancel_spot_limit_order(market, &order, CancelReason::UserRequested)?;
                cancelled += 1;
            }
            for order in staged_market_orders(&self.ledger, BookKind::Spot, &market.market_id, side)? {
                if order.order_info.subaccount_id == *sub {
                    self.cancel_staged_market_order(BookKind::Spot, spot_hold_denom(market, side), &order, CancelReason::UserRequested)?;
                    cancelled += 1;
                }
            }
        }
        Ok(cancelled)
    }

    pub(super) fn cancel_subaccount_derivative_orders(
        &mut self,
        market: &AnyDerivativeMarket,
        sub: &SubaccountId,
    ) -> Result<usize, ExchangeError> {
        let market_id = market.market_id();
        let quote = market.quote_denom().to_string();
        let mut cancelled = 0;
        for side in [Side::Buy, Side::Sell] {
            for order in subaccount_orders::<DerivativeLimitOrder>(&self.ledger, &market_id, side, sub)? {
                self.cancel_derivative_limit_order(market, &order, CancelReason::UserRequested)?;
                cancelled += 1;
            }
            for order in staged_market_orders(&self.ledger, BookKind::Derivative, &market_id, side)? {
                if order.order_info.subaccount_id == *sub {
                    self.cancel_staged_market_order(BookKind::Derivative, &quote, &order, CancelReason::UserRequested)?;
                    cancelled += 1;
                }
            }
        }
        for order in subaccount_conditional_orders(&self.ledger, &market_id, sub)? {
            self.cancel_conditional_order(market, &order, CancelReason::UserRequested)?;
            cancelled += 1;
        }
        Ok(cancelled)
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) enum CancelKind {
    Spot,
    Derivative,
    Conditional,
}

/// Bids hold quote, asks hold base.
pub(super) fn spot_hold_denom(market: &SpotMarket, side: Side) -> &str {
    match side {
        Side::Buy => &market.quote_denom,
        Side::Sell => &market.base_denom,
    }
}
