// 8.5 engine/spot.rs: spot order placement and matching.
// 8.5.1 matches an incoming order against the resting book, 8.5.2 places limit orders,
// 8.5.3 places market orders, 8.5.4 runs the market orders staged during the block.
//
// bids hold quote (price × qty plus the worst-case taker fee), asks hold base. every fill
// spends from that hold at the maker's price and gives the rest back.

use super::core::{ensure_owner, Engine};
use super::orders::{spot_hold_denom, CancelKind};
use super::results::ExchangeError;
use crate::deposits::{add_to_fee_pool, charge_held, credit, hold, release};
use crate::events::{CancelReason, EventPayload, NewSpotOrdersEvent, TradeEvent};
use crate::market::{get_market, MarketInfo, SpotMarket};
use crate::msgs::OrderCreated;
use crate::order::{compute_order_hash, MarketOrder, OrderError, SpotLimitOrder, SpotOrder};
use crate::orderbook::{
    best_price, crossing_orders, has_market_order_this_block, insert_limit_order, mark_market_order,
    markets_with_staged_orders, next_trade_nonce, replace_limit_order, stage_market_order, staged_market_orders,
    unstage_market_order, BookKind,
};
use crate::types::{Address, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// Incoming spot order while it walks the book.
#[derive(Debug, Clone)]
pub(super) struct SpotTaker {
    pub subaccount: SubaccountId,
    pub order_hash: OrderHash,
    pub cid: String,
    pub side: Side,
    pub worst_price: Decimal,
    pub remaining: Decimal,
    pub fee_rate: Decimal,
    /// hold per unit of quantity
    pub unit_hold: Decimal,
    /// hold still backing `remaining`
    pub held: Decimal,
}

fn unit_hold(side: Side, worst_price: Decimal, fee_rate: Decimal) -> Decimal {
    match side {
        Side::Buy => worst_price * (Decimal::ONE + fee_rate.max(Decimal::ZERO)),
        Side::Sell => Decimal::ONE,
    }
}

impl Engine {
    // 8.5.1: matching

    /// Fills `taker` against the opposite side best price first, down to its worst price.
    /// A resting order from the taker's own subaccount is cancelled, never traded against.
    pub(super) fn match_spot_taker(&mut self, market: &SpotMarket, taker: &mut SpotTaker) -> Result<(), ExchangeError> {
        let maker_side = taker.side.opposite();
        let makers = crossing_orders::<SpotLimitOrder>(&self.ledger, &market.market_id, maker_side, taker.worst_price)?;
        for maker in makers {
            if taker.remaining.is_zero() {
                break;
            }
            if maker.order_info.subaccount_id == taker.subaccount {
                self.cancel_spot_limit_order(market, &maker, CancelReason::SelfTrade)?;
                continue;
            }
            let quantity = taker.remaining.min(maker.fillable);
            self.fill_spot(market, taker, &maker, quantity)?;
        }
        Ok(())
    }

    fn fill_spot(
        &mut self,
        market: &SpotMarket,
        taker: &mut SpotTaker,
        maker: &SpotLimitOrder,
        quantity: Decimal,
    ) -> Result<(), ExchangeError> {
        let price = maker.order_info.price;
        let notional = quantity * price;
        let taker_fee = notional * taker.fee_rate;
        let maker_fee = notional * market.maker_fee_rate;
        let maker_sub = maker.order_info.subaccount_id;
        let (base, quote) = (market.base_denom.as_str(), market.quote_denom.as_str());

        // last fill takes whatever is left so no dust stays held
        let reserved = if quantity == taker.remaining { taker.held } else { quantity * taker.unit_hold };
        taker.held -= reserved;

        match taker.side {
            Side::Buy => {
                self.spend_held(&taker.subaccount, quote, reserved, notional + taker_fee)?;
                credit(&mut self.ledger, &taker.subaccount, base, quantity)?;
                charge_held(&mut self.ledger, &maker_sub, base, quantity)?;
                credit(&mut self.ledger, &maker_sub, quote, notional - maker_fee)?;
            }
            Side::Sell => {
                self.spend_held(&taker.subaccount, base, reserved, quantity)?;
                credit(&mut self.ledger, &taker.subaccount, quote, notional - taker_fee)?;
                let maker_reserved = notional * (Decimal::ONE + market.taker_fee_rate.max(Decimal::ZERO));
                self.spend_held(&maker_sub, quote, maker_reserved, notional + maker_fee)?;
                credit(&mut self.ledger, &maker_sub, base, quantity)?;
            }
        }
        add_to_fee_pool(&mut self.ledger, quote, taker_fee + maker_fee)?;

        let mut updated = maker.clone();
        updated.fillable -= quantity;
        replace_limit_order(&mut self.ledger, &market.market_id, maker, &updated)?;
        taker.remaining -= quantity;

        debug!(market = %market.market_id, %price, %quantity, taker = %taker.subaccount, maker = %maker_sub, "spot fill");
        self.emit(EventPayload::SpotTrade(TradeEvent {
            market_id: market.market_id,
            subaccount_id: taker.subaccount,
            order_hash: taker.order_hash,
            cid: taker.cid.clone(),
            side: taker.side,
            quantity,
            price,
            fee: taker_fee,
            is_maker: false,
            realized_pnl: Decimal::ZERO,
        }));
        self.emit(EventPayload::SpotTrade(TradeEvent {
            market_id: market.market_id,
            subaccount_id: maker_sub,
            order_hash: maker.order_hash,
            cid: maker.order_info.cid.clone(),
            side: maker.order_type.side(),
            quantity,
            price,
            fee: maker_fee,
            is_maker: true,
            realized_pnl: Decimal::ZERO,
        }));
        Ok(())
    }

    fn check_spot_order(&self, market: &SpotMarket, order: &SpotOrder, is_market: bool) -> Result<(), ExchangeError> {
        if !market.is_active() {
            return Err(ExchangeError::MarketNotActive(market.market_id));
        }
        order.validate_basic(is_market, self.block.height)?;
        market.validate_price_and_quantity(order.order_info.price, order.order_info.quantity)?;
        self.ensure_cid_free(&market.market_id, &order.order_info.subaccount_id, &order.order_info.cid)
    }

    // 8.5.2: limit orders

    pub(super) fn create_spot_limit_order(&mut self, sender: Address, order: SpotOrder) -> Result<OrderCreated, ExchangeError> {
        ensure_owner(&sender, &order.order_info.subaccount_id)?;
        let market = self.load_spot_market(&order.market_id)?;
        self.place_spot_limit_order(&market, order)
    }

    pub(super) fn place_spot_limit_order(&mut self, market: &SpotMarket, mut order: SpotOrder) -> Result<OrderCreated, ExchangeError> {
        if order.order_type.is_atomic() {
            return Err(OrderError::UnsupportedOrderType(order.order_type).into());
        }
        self.check_spot_order(market, &order, false)?;
        if self.params.is_post_only_mode(self.block.height) {
            order.order_type = order.order_type.post_only();
        }

        let info = &order.order_info;
        let side = order.order_type.side();
        if order.order_type.is_post_only() {
            let crosses = match (side, best_price(&self.ledger, &market.market_id, side.opposite())?) {
                (Side::Buy, Some(ask)) => ask <= info.price,
                (Side::Sell, Some(bid)) => bid >= info.price,
                (_, None) => false,
            };
            if crosses {
                return Err(ExchangeError::PostOnlyWouldCross(info.price));
            }
        }

        let sub = info.subaccount_id;
        let per_unit = unit_hold(side, info.price, market.taker_fee_rate);
        let held = info.quantity * per_unit;
        hold(&mut self.ledger, &sub, spot_hold_denom(market, side), held)?;

        let nonce = next_trade_nonce(&mut self.ledger, &sub)?;
        let order_hash = compute_order_hash(
            &sub,
            &market.market_id,
            order.order_type,
            info.price,
            info.quantity,
            Decimal::ZERO,
            None,
            nonce,
        );

        let mut taker = SpotTaker {
            subaccount: sub,
            order_hash,
            cid: info.cid.clone(),
            side,
            worst_price: info.price,
            remaining: info.quantity,
            fee_rate: market.taker_fee_rate,
            unit_hold: per_unit,
            held,
        };
        if !order.order_type.is_post_only() {
            self.match_spot_taker(market, &mut taker)?;
        }

        if taker.remaining > Decimal::ZERO {
            let resting = SpotLimitOrder {
                order_info: order.order_info.clone(),
                order_type: order.order_type,
                fillable: taker.remaining,
                order_hash,
                expiration_block: order.expiration_block,
            };
            insert_limit_order(&mut self.ledger, &market.market_id, &resting)?;
            self.emit(EventPayload::NewSpotOrders(NewSpotOrdersEvent {
                market_id: market.market_id,
                orders: vec![resting],
            }));
        }
        Ok(OrderCreated {
            order_hash,
            cid: order.order_info.cid,
        })
    }

    // 8.5.3: market orders

    pub(super) fn create_spot_market_order(&mut self, sender: Address, order: SpotOrder) -> Result<OrderCreated, ExchangeError> {
        ensure_owner(&sender, &order.order_info.subaccount_id)?;
        let market = self.load_spot_market(&order.market_id)?;
        self.place_spot_market_order(&market, order)
    }

    /// Atomic orders fill on the spot at a multiplied taker fee. Everything else waits for
    /// end_block, one per subaccount and market per block.
    pub(super) fn place_spot_market_order(&mut self, market: &SpotMarket, order: SpotOrder) -> Result<OrderCreated, ExchangeError> {
        if self.params.is_post_only_mode(self.block.height) {
            return Err(ExchangeError::PostOnlyMode);
        }
        if order.order_type.is_post_only() {
            return Err(OrderError::UnsupportedOrderType(order.order_type).into());
        }
        self.check_spot_order(market, &order, true)?;
        let info = &order.order_info;
        let sub = info.subaccount_id;
        if has_market_order_this_block(&self.ledger, &market.market_id, &sub) {
            return Err(ExchangeError::MarketOrderThisBlock);
        }

        let side = order.order_type.side();
        let fee_rate = if order.order_type.is_atomic() {
            market.taker_fee_rate * self.params.atomic_market_order_fee_multiplier
        } else {
            market.taker_fee_rate
        };
        let per_unit = unit_hold(side, info.price, fee_rate);
        let held = info.quantity * per_unit;
        let denom = spot_hold_denom(market, side).to_string();
        hold(&mut self.ledger, &sub, &denom, held)?;

        let nonce = next_trade_nonce(&mut self.ledger, &sub)?;
        let order_hash = compute_order_hash(
            &sub,
            &market.market_id,
            order.order_type,
            info.price,
            info.quantity,
            Decimal::ZERO,
            None,
            nonce,
        );
        mark_market_order(&mut self.ledger, &market.market_id, &sub);

        if order.order_type.is_atomic() {
            let mut taker = SpotTaker {
                subaccount: sub,
                order_hash,
                cid: info.cid.clone(),
                side,
                worst_price: info.price,
                remaining: info.quantity,
                fee_rate,
                unit_hold: per_unit,
                held,
            };
            self.match_spot_taker(market, &mut taker)?;
            release(&mut self.ledger, &sub, &denom, taker.held)?;
        } else {
            stage_market_order(
                &mut self.ledger,
                BookKind::Spot,
                &MarketOrder {
                    market_id: market.market_id,
                    order_info: info.clone(),
                    order_type: order.order_type,
                    margin: Decimal::ZERO,
                    balance_hold: held,
                    order_hash,
                },
            )?;
        }
        Ok(OrderCreated {
            order_hash,
            cid: order.order_info.cid,
        })
    }

    // 8.5.4: end of block

    /// Runs every staged spot market order, bids then asks, most aggressive first. Each
    /// order is its own atomic scope; a soft failure cancels just that order.
    pub(super) fn execute_staged_spot_market_orders(&mut self) -> Result<usize, ExchangeError> {
        let mut executed = 0;
        for market_id in markets_with_staged_orders(&self.ledger, BookKind::Spot) {
            let market = get_market::<SpotMarket, _>(&self.ledger, &market_id)?.ok_or(ExchangeError::MarketNotFound(market_id))?;
            for side in [Side::Buy, Side::Sell] {
                for order in staged_market_orders(&self.ledger, BookKind::Spot, &market_id, side)? {
                    match self.isolated(|engine| engine.execute_staged_spot_order(&market, &order)) {
                        Ok(true) => executed += 1,
                        Ok(false) => {}
                        Err(err) if err.is_hard_failure() => return Err(err),
                        Err(err) => {
                            warn!(market = %market_id, hash = %order.order_hash, code = err.code(), "staged spot order failed");
                            self.cancel_staged_market_order(BookKind::Spot, spot_hold_denom(&market, side), &order, CancelReason::Unfilled)?;
                        }
                    }
                }
            }
        }
        Ok(executed)
    }

    /// True when the order traded at all.
    fn execute_staged_spot_order(&mut self, market: &SpotMarket, order: &MarketOrder) -> Result<bool, ExchangeError> {
        unstage_market_order(&mut self.ledger, BookKind::Spot, order);
        let sub = order.order_info.subaccount_id;
        let side = order.side();
        let denom = spot_hold_denom(market, side);

        if !market.is_active() {
            release(&mut self.ledger, &sub, denom, order.balance_hold)?;
            self.emit_cancel(CancelKind::Spot, market.market_id, sub, order.order_hash, &order.order_info.cid, CancelReason::MarketClosed);
            return Ok(false);
        }

        let quantity = order.order_info.quantity;
        let mut taker = SpotTaker {
            subaccount: sub,
            order_hash: order.order_hash,
            cid: order.order_info.cid.clone(),
            side,
            worst_price: order.order_info.price,
            remaining: quantity,
            fee_rate: market.taker_fee_rate,
            unit_hold: order.balance_hold / quantity,
            held: order.balance_hold,
        };
        self.match_spot_taker(market, &mut taker)?;
        release(&mut self.ledger, &sub, denom, taker.held)?;
        if taker.remaining > Decimal::ZERO {
            self.emit_cancel(CancelKind::Spot, market.market_id, sub, order.order_hash, &order.order_info.cid, CancelReason::Unfilled);
        }
        Ok(taker.remaining < quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{trader, Harness};
    use crate::events::{CancelReason, EventPayload};
    use crate::msgs::{ExchangeMsg, MsgCancelOrder, MsgCreateSpotOrder};
    use crate::order::{OrderData, OrderInfo, OrderType, SpotOrder};
    use crate::types::Side;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[test]
    fn crossing_ask_fills_at_the_resting_bid() {
        let mut h = Harness::new();
        let market = h.spot_market();
        let alice = h.fund(1, "usdt", dec!(1000));
        let bob = h.fund(2, "inj", dec!(50));

        h.spot_limit(SpotOrder::limit(market, OrderInfo::new(alice, dec!(10), dec!(20)), OrderType::Buy))
            .unwrap();
        assert_eq!(h.available(&alice, "usdt"), dec!(799.6));
        h.spot_limit(SpotOrder::limit(market, OrderInfo::new(bob, dec!(9.5), dec!(15)), OrderType::Sell))
            .unwrap();

        // 15 @ 10: taker fee 0.3, maker fee 0.15, the unused maker hold comes back
        assert_eq!(h.total(&bob, "usdt"), dec!(149.7));
        assert_eq!(h.total(&bob, "inj"), dec!(35));
        assert_eq!(h.total(&alice, "inj"), dec!(15));
        assert_eq!(h.total(&alice, "usdt"), dec!(849.85));
        assert_eq!(h.available(&alice, "usdt"), dec!(799.75));
        assert_eq!(h.engine.fee_pool("usdt").unwrap(), dec!(0.45));
        assert_eq!(h.engine.price_level(&market, Side::Buy, dec!(10)).unwrap(), dec!(5));
        assert!(h.engine.spot_orders(&market, Side::Sell).unwrap().is_empty());

        let prices = h.events(|p| match p {
            EventPayload::SpotTrade(t) => Some((t.price, t.is_maker)),
            _ => None,
        });
        assert_eq!(prices, vec![(dec!(10), false), (dec!(10), true)]);
        h.engine.check_invariants().unwrap();
    }

    #[test]
    fn bids_walk_best_price_first() {
        let mut h = Harness::new();
        let market = h.spot_market();
        let alice = h.fund(1, "usdt", dec!(1000));
        let bob = h.fund(2, "inj", dec!(10));

        for price in [dec!(10), dec!(5), dec!(20)] {
            h.spot_limit(SpotOrder::limit(market, OrderInfo::new(alice, price, dec!(1)), OrderType::Buy))
                .unwrap();
        }
        let depth: Vec<Decimal> = h.engine.depth(&market, Side::Buy, 10).unwrap().iter().map(|l| l.price).collect();
        assert_eq!(depth, vec![dec!(20), dec!(10), dec!(5)]);

        h.spot_limit(SpotOrder::limit(market, OrderInfo::new(bob, dec!(4), dec!(2)), OrderType::Sell))
            .unwrap();
        let fills: Vec<Decimal> = h.events(|p| match p {
            EventPayload::SpotTrade(t) if !t.is_maker => Some(t.price),
            _ => None,
        });
        assert_eq!(fills, vec![dec!(20), dec!(10)]);
        let left: Vec<Decimal> = h.engine.depth(&market, Side::Buy, 10).unwrap().iter().map(|l| l.price).collect();
        assert_eq!(left, vec![dec!(5)]);
    }

    #[test]
    fn incoming_order_cancels_own_resting_order() {
        let mut h = Harness::new();
        let market = h.spot_market();
        let alice = h.fund(1, "usdt", dec!(1000));
        h.fund(1, "inj", dec!(50));

        let bid = h
            .spot_limit(SpotOrder::limit(market, OrderInfo::new(alice, dec!(10), dec!(1)), OrderType::Buy))
            .unwrap();
        h.spot_limit(SpotOrder::limit(market, OrderInfo::new(alice, dec!(10), dec!(1)), OrderType::Sell))
            .unwrap();

        let cancelled = h.events(|p| match p {
            EventPayload::CancelSpotOrder(c) => Some((c.order_hash, c.reason)),
            _ => None,
        });
        assert_eq!(cancelled, vec![(bid, CancelReason::SelfTrade)]);
        assert!(h.events(|p| matches!(p, EventPayload::SpotTrade(_)).then_some(())).is_empty());
        assert_eq!(h.available(&alice, "usdt"), dec!(1000));
        assert_eq!(h.available(&alice, "inj"), dec!(49));
        assert_eq!(h.engine.spot_orders(&market, Side::Sell).unwrap().len(), 1);
    }

    #[test]
    fn cancel_releases_the_hold_or_changes_nothing() {
        let mut h = Harness::new();
        let market = h.spot_market();
        let alice = h.fund(1, "usdt", dec!(1000));
        h.spot_limit(SpotOrder::limit(market, OrderInfo::new(alice, dec!(10), dec!(2)).with_cid("bid-1"), OrderType::Buy))
            .unwrap();
        let events_before = h.engine.events().len();

        let missing = ExchangeMsg::CancelSpotOrder(MsgCancelOrder {
            sender: trader(1),
            order: OrderData::by_cid(market, alice, "nope"),
        });
        let err = h.engine.deliver(missing).unwrap_err();
        assert_eq!(err.code(), "order_not_found");
        assert_eq!(h.engine.events().len(), events_before);
        assert_eq!(h.available(&alice, "usdt"), dec!(979.96));

        let by_stranger = ExchangeMsg::CancelSpotOrder(MsgCancelOrder {
            sender: trader(9),
            order: OrderData::by_cid(market, alice, "bid-1"),
        });
        assert_eq!(h.engine.deliver(by_stranger).unwrap_err().code(), "unauthorized");

        h.engine
            .deliver(ExchangeMsg::CancelSpotOrder(MsgCancelOrder {
                sender: trader(1),
                order: OrderData::by_cid(market, alice, "bid-1"),
            }))
            .unwrap();
        assert_eq!(h.available(&alice, "usdt"), dec!(1000));
        assert!(h.engine.spot_orders(&market, Side::Buy).unwrap().is_empty());
        h.engine.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_cid_and_post_only_rejections() {
        let mut h = Harness::new();
        let market = h.spot_market();
        let alice = h.fund(1, "usdt", dec!(1000));
        let bob = h.fund(2, "inj", dec!(10));

        h.spot_limit(SpotOrder::limit(market, OrderInfo::new(alice, dec!(10), dec!(1)).with_cid("x"), OrderType::Buy))
            .unwrap();
        let again = h.spot_limit(SpotOrder::limit(market, OrderInfo::new(alice, dec!(9), dec!(1)).with_cid("x"), OrderType::Buy));
        assert_eq!(again.unwrap_err().code(), "duplicate_cid");

        let crossing = h.spot_limit(SpotOrder::limit(market, OrderInfo::new(bob, dec!(10), dec!(1)), OrderType::SellPostOnly));
        assert_eq!(crossing.unwrap_err().code(), "post_only_would_cross");
        assert_eq!(h.available(&bob, "inj"), dec!(10));
    }

    #[test]
    fn market_orders_wait_for_end_block() {
        let mut h = Harness::new();
        let market = h.spot_market();
        let alice = h.fund(1, "inj", dec!(10));
        let bob = h.fund(2, "usdt", dec!(1000));
        h.spot_limit(SpotOrder::limit(market, OrderInfo::new(alice, dec!(10), dec!(5)), OrderType::Sell))
            .unwrap();

        let order = SpotOrder::limit(market, OrderInfo::new(bob, dec!(11), dec!(5)), OrderType::Buy);
        let msg = |order: SpotOrder| {
            ExchangeMsg::CreateSpotMarketOrder(MsgCreateSpotOrder {
                sender: trader(2),
                order,
            })
        };
        h.engine.deliver(msg(order.clone())).unwrap();
        assert_eq!(h.engine.deliver(msg(order)).unwrap_err().code(), "market_order_this_block");
        assert_eq!(h.total(&bob, "inj"), Decimal::ZERO);

        h.next_block(1);
        assert_eq!(h.total(&bob, "inj"), dec!(5));
        // worst price 11 was held, the fill happened at 10
        assert_eq!(h.available(&bob, "usdt"), dec!(949.9));
        assert_eq!(h.total(&bob, "usdt"), dec!(949.9));
    }

    #[test]
    fn order_expires_at_its_height() {
        let mut h = Harness::new();
        let market = h.spot_market();
        let alice = h.fund(1, "usdt", dec!(1000));
        let hash = h
            .spot_limit(SpotOrder::limit(market, OrderInfo::new(alice, dec!(10), dec!(1)), OrderType::Buy).with_expiration(3))
            .unwrap();

        h.next_block(1);
        assert_eq!(h.engine.block().height, 2);
        assert_eq!(h.engine.spot_orders(&market, Side::Buy).unwrap().len(), 1);

        h.next_block(1);
        assert!(h.engine.spot_orders(&market, Side::Buy).unwrap().is_empty());
        assert_eq!(h.available(&alice, "usdt"), dec!(1000));
        let expired = h.events(|p| match p {
            EventPayload::CancelSpotOrder(c) if c.reason == CancelReason::Expired => Some(c.order_hash),
            _ => None,
        });
        assert_eq!(expired, vec![hash]);
    }
}
