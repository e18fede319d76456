// 8.10 engine/lifecycle.rs: the block hooks. begin_block sweeps expirations, funding and
// market settlement; end_block fires conditionals, clears staged market orders and emits
// the per-block summaries.

use super::core::Engine;
use super::results::{BlockSummary, ExchangeError};
use crate::deposits::{get_deposit, touched_deposits};
use crate::events::{
    BatchDepositUpdateEvent, CancelReason, DepositUpdate, EventPayload, MarketSettledEvent, OrderCancelFailEvent,
    OrderbookUpdateEvent, PositionUpdateEvent,
};
use crate::invariants::check_invariants;
use crate::market::{
    all_markets, get_any_derivative_market, get_market, AnyDerivativeMarket, BinaryOptionsMarket, DerivativeMarketLike,
    MarketInfo, MarketStatus, SpotMarket,
};
use crate::oracle::binary_oracle_price;
use crate::order::{DerivativeLimitOrder, SpotLimitOrder};
use crate::orderbook::{changed_price_levels, clear_expirations, expiring_orders, find_limit_order, markets_with_expirations, ExpirationEntry};
use crate::position::Position;
use crate::settlement::{
    all_expiry_infos, binary_settlement_price, clear_scheduled_settlement, scheduled_settlements, set_expiry_info,
    settle_positions, ScheduledSettlement,
};
use crate::types::{BlockContext, MarketId};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

impl Engine {
    /// Opens a block. The transient store is wiped first so nothing from the previous
    /// block leaks into this one's staged orders or touched sets.
    pub fn begin_block(&mut self, ctx: BlockContext) -> Result<BlockSummary, ExchangeError> {
        self.block = ctx;
        self.ledger.clear_transient();
        debug!(height = ctx.height, time = %ctx.time, "begin block");

        let expired_orders = self.run_unmetered("expire_orders", |engine| engine.expire_orders())?;
        let funding_updates = self.run_unmetered("funding", |engine| engine.process_funding())?;
        let settled_markets = self.run_unmetered("market_lifecycle", |engine| engine.process_market_lifecycle())?;
        Ok(BlockSummary {
            expired_orders,
            funding_updates,
            settled_markets,
            ..BlockSummary::default()
        })
    }

    /// Closes a block. With `check_invariants_every_block` set, a broken ledger surfaces
    /// here as an error after the block's work has been committed.
    pub fn end_block(&mut self) -> Result<BlockSummary, ExchangeError> {
        let (triggered_orders, matched_market_orders) = self.run_unmetered("end_block", |engine| {
            let triggered = engine.trigger_conditional_orders()?;
            let matched = engine.execute_staged_spot_market_orders()? + engine.execute_staged_derivative_market_orders()?;
            engine.emit_block_summaries()?;
            Ok((triggered, matched))
        })?;

        if self.config.check_invariants_every_block {
            if let Err(violation) = check_invariants(&self.ledger) {
                error!(height = self.block.height, %violation, "ledger invariant broken at end of block");
                return Err(violation.into());
            }
        }
        debug!(height = self.block.height, triggered_orders, matched_market_orders, "end block");
        Ok(BlockSummary {
            triggered_orders,
            matched_market_orders,
            ..BlockSummary::default()
        })
    }

    fn emit_block_summaries(&mut self) -> Result<(), ExchangeError> {
        for ((market_id, side, price), quantity) in changed_price_levels(&self.ledger)? {
            self.emit(EventPayload::OrderbookUpdate(OrderbookUpdateEvent {
                market_id,
                side,
                price,
                quantity,
            }));
        }

        let mut batch = BatchDepositUpdateEvent::default();
        for (subaccount_id, denom) in touched_deposits(&self.ledger) {
            let deposit = get_deposit(&self.ledger, &subaccount_id, &denom)?;
            batch.updates.push(DepositUpdate {
                subaccount_id,
                denom,
                deposit,
            });
        }
        if !batch.updates.is_empty() {
            self.emit(EventPayload::BatchDepositUpdate(batch));
        }
        Ok(())
    }

    // 8.10.1: order expiry

    fn expire_orders(&mut self) -> Result<usize, ExchangeError> {
        let height = self.block.height;
        let mut expired = 0;
        for market_id in markets_with_expirations(&self.ledger, height) {
            for entry in expiring_orders(&self.ledger, height, &market_id)? {
                if self.expire_order(&market_id, &entry)? {
                    expired += 1;
                } else {
                    self.emit(EventPayload::OrderCancelFail(OrderCancelFailEvent {
                        market_id,
                        subaccount_id: entry.subaccount_id,
                        order_hash: Some(entry.order_hash),
                        cid: String::new(),
                        description: "order already gone".into(),
                    }));
                }
            }
            clear_expirations(&mut self.ledger, height, &market_id);
        }
        if expired > 0 {
            debug!(height, expired, "orders expired");
        }
        Ok(expired)
    }

    /// False when the order was filled or cancelled before its expiry height.
    fn expire_order(&mut self, market_id: &MarketId, entry: &ExpirationEntry) -> Result<bool, ExchangeError> {
        if let Some(market) = get_market::<SpotMarket, _>(&self.ledger, market_id)? {
            let found = find_limit_order::<SpotLimitOrder>(&self.ledger, market_id, &entry.subaccount_id, &entry.order_hash)?;
            return match found {
                Some(order) => self.cancel_spot_limit_order(&market, &order, CancelReason::Expired).map(|_| true),
                None => Ok(false),
            };
        }
        let Some(market) = get_any_derivative_market(&self.ledger, market_id)? else {
            return Ok(false);
        };
        match find_limit_order::<DerivativeLimitOrder>(&self.ledger, market_id, &entry.subaccount_id, &entry.order_hash)? {
            Some(order) => self.cancel_derivative_limit_order(&market, &order, CancelReason::Expired).map(|_| true),
            None => Ok(false),
        }
    }

    // 8.10.2: market expiry and settlement

    /// Expires and settles every market whose time has come, then runs admin-forced
    /// settlements. Returns the number of markets settled.
    fn process_market_lifecycle(&mut self) -> Result<usize, ExchangeError> {
        let now = self.block.unix_secs();
        let mut settled = 0;

        for mut info in all_expiry_infos(&self.ledger)? {
            if info.settlement_price.is_some() || info.expiration_timestamp > now {
                continue;
            }
            let Some(mut market) = get_any_derivative_market(&self.ledger, &info.market_id)? else {
                continue;
            };
            if market.status() == MarketStatus::Demolished {
                continue;
            }
            self.expire_market(&mut market)?;
            let Some(price) = self.mark_price(&market) else {
                warn!(market = %info.market_id, "no oracle price at expiry, settlement retried next block");
                continue;
            };
            self.settle_market(&mut market, price, MarketStatus::Demolished)?;
            info.settlement_price = Some(price);
            set_expiry_info(&mut self.ledger, &info)?;
            settled += 1;
        }

        for market in all_markets::<BinaryOptionsMarket, _>(&self.ledger)? {
            if market.status == MarketStatus::Demolished || market.expiration_timestamp > now {
                continue;
            }
            let price = binary_settlement_price(market.settlement_price.or_else(|| binary_oracle_price(self.oracle(), &market)));
            let settles_now = market.settlement_timestamp <= now;
            let mut market = AnyDerivativeMarket::Binary(market);
            self.expire_market(&mut market)?;
            if settles_now {
                self.settle_market(&mut market, price, MarketStatus::Demolished)?;
                settled += 1;
            }
        }

        for scheduled in scheduled_settlements(&self.ledger)? {
            if self.run_forced_settlement(&scheduled)? {
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Clears one queued forced settlement and runs it. False when the market is gone,
    /// already demolished or has no price to settle at.
    pub(super) fn run_forced_settlement(&mut self, scheduled: &ScheduledSettlement) -> Result<bool, ExchangeError> {
        clear_scheduled_settlement(&mut self.ledger, &scheduled.market_id);
        let Some(mut market) = get_any_derivative_market(&self.ledger, &scheduled.market_id)? else {
            return Ok(false);
        };
        if market.status() == MarketStatus::Demolished {
            return Ok(false);
        }
        let price = match &market {
            AnyDerivativeMarket::Binary(m) => binary_settlement_price(
                scheduled
                    .settlement_price
                    .or(m.settlement_price)
                    .or_else(|| binary_oracle_price(self.oracle(), m)),
            ),
            AnyDerivativeMarket::Derivative(_) => match scheduled.settlement_price.or_else(|| self.mark_price(&market)) {
                Some(price) => price,
                None => {
                    warn!(market = %scheduled.market_id, "no settlement price, forced settlement dropped");
                    return Ok(false);
                }
            },
        };
        let status = if market.is_perpetual() {
            MarketStatus::Paused
        } else {
            MarketStatus::Demolished
        };
        self.settle_market(&mut market, price, status)?;
        Ok(true)
    }

    /// Active or paused to expired, with every order cancelled. A no-op once expired.
    fn expire_market(&mut self, market: &mut AnyDerivativeMarket) -> Result<(), ExchangeError> {
        if !matches!(market.status(), MarketStatus::Active | MarketStatus::Paused) {
            return Ok(());
        }
        let cancelled = self.cancel_all_derivative_orders(market, CancelReason::Expired)?;
        self.set_derivative_market_status(market, MarketStatus::Expired)?;
        info!(market = %market.market_id(), cancelled, "market expired");
        Ok(())
    }

    /// Cancels what is left of the book, closes every position at `price` and moves the
    /// market to `status`.
    fn settle_market(&mut self, market: &mut AnyDerivativeMarket, price: Decimal, status: MarketStatus) -> Result<(), ExchangeError> {
        let market_id = market.market_id();
        self.cancel_all_derivative_orders(market, CancelReason::MarketClosed)?;
        let outcome = settle_positions(&mut self.ledger, &market_id, market.quote_denom(), price)?;

        for (subaccount_id, closed) in &outcome.closed {
            self.emit(EventPayload::PositionUpdate(PositionUpdateEvent {
                market_id,
                subaccount_id: *subaccount_id,
                position: Position {
                    quantity: Decimal::ZERO,
                    margin: Decimal::ZERO,
                    ..closed.clone()
                },
            }));
        }
        self.emit(EventPayload::MarketSettled(MarketSettledEvent {
            market_id,
            settlement_price: price,
            positions_closed: outcome.closed.len(),
            payout_ratio: outcome.plan.payout_ratio,
        }));
        self.set_derivative_market_status(market, status)?;
        info!(
            market = %market_id,
            %price,
            positions = outcome.closed.len(),
            payout_ratio = %outcome.plan.payout_ratio,
            surplus = %outcome.surplus,
            ?status,
            "market settled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{sub, trader, Harness};
    use crate::events::{CancelReason, EventPayload};
    use crate::market::{MarketInfo, MarketStatus};
    use crate::order::{DerivativeOrder, OrderInfo, OrderType};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[test]
    fn expiry_future_settles_at_the_mark() {
        let mut h = Harness::new();
        let market = h.open_perp_positions(Some(100));
        let bidder = h.fund(3, "usdt", dec!(10000));
        h.derivative_limit(DerivativeOrder::limit(market, OrderInfo::new(bidder, dec!(49000), dec!(1)), OrderType::Buy, dec!(4900)))
            .unwrap();

        h.oracle.set_price("btc", "usdt", dec!(51000));
        h.next_block(50);
        assert_eq!(h.engine.derivative_market(&market).unwrap().unwrap().status(), MarketStatus::Active);

        h.next_block(50);
        let settled = h.engine.derivative_market(&market).unwrap().unwrap();
        assert_eq!(settled.status(), MarketStatus::Demolished);
        assert_eq!(h.engine.expiry_info(&market).unwrap().unwrap().settlement_price, Some(dec!(51000)));
        assert_eq!(h.total(&sub(1), "usdt"), dec!(10950));
        assert_eq!(h.total(&sub(2), "usdt"), dec!(8975));
        assert_eq!(h.available(&bidder, "usdt"), dec!(10000));
        assert_eq!(h.engine.market_balance(&market).unwrap(), Decimal::ZERO);
        assert!(h.engine.positions(&market).unwrap().is_empty());

        let expired = h.events(|p| match p {
            EventPayload::CancelDerivativeOrder(c) => Some(c.reason),
            _ => None,
        });
        assert_eq!(expired, vec![CancelReason::Expired]);
        let ratios = h.events(|p| match p {
            EventPayload::MarketSettled(s) => Some((s.positions_closed, s.payout_ratio)),
            _ => None,
        });
        assert_eq!(ratios, vec![(2, Decimal::ONE)]);
    }

    fn binary_positions(h: &mut Harness) -> crate::types::MarketId {
        let market = h.binary_market(100, 200);
        let yes = h.fund(1, "usdt", dec!(100));
        let no = h.fund(2, "usdt", dec!(100));
        h.binary_limit(DerivativeOrder::limit(market, OrderInfo::new(yes, dec!(0.4), dec!(100)), OrderType::Buy, dec!(40)))
            .unwrap();
        h.binary_limit(DerivativeOrder::limit(market, OrderInfo::new(no, dec!(0.4), dec!(100)), OrderType::Sell, dec!(60)))
            .unwrap();
        market
    }

    #[test]
    fn binary_expires_then_settles_on_the_oracle() {
        let mut h = Harness::new();
        let market = binary_positions(&mut h);

        h.next_block(150);
        assert_eq!(h.engine.derivative_market(&market).unwrap().unwrap().status(), MarketStatus::Expired);
        assert_eq!(h.engine.positions(&market).unwrap().len(), 2);

        h.oracle.set_price("rain", "weather", dec!(1));
        h.next_block(100);
        assert_eq!(h.engine.derivative_market(&market).unwrap().unwrap().status(), MarketStatus::Demolished);
        assert_eq!(h.total(&sub(1), "usdt"), dec!(160));
        assert_eq!(h.total(&sub(2), "usdt"), dec!(40));
        assert_eq!(h.engine.market_balance(&market).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn binary_without_a_price_refunds_margin() {
        let mut h = Harness::new();
        let market = binary_positions(&mut h);

        h.next_block(250);
        assert_eq!(h.engine.derivative_market(&market).unwrap().unwrap().status(), MarketStatus::Demolished);
        assert_eq!(h.total(&sub(1), "usdt"), dec!(100));
        assert_eq!(h.total(&sub(2), "usdt"), dec!(100));
    }

    #[test]
    fn forced_perpetual_settlement_pauses_the_market() {
        let mut h = Harness::new();
        let market = h.open_perp_positions(None);

        let err = h.engine.admin_settle_market(trader(1), market, Some(dec!(50500))).unwrap_err();
        assert_eq!(err.code(), "not_admin");
        h.engine.admin_settle_market(h.admin, market, Some(dec!(50500))).unwrap();
        assert_eq!(h.engine.derivative_market(&market).unwrap().unwrap().status(), MarketStatus::Active);

        h.next_block(1);
        assert_eq!(h.engine.derivative_market(&market).unwrap().unwrap().status(), MarketStatus::Paused);
        assert_eq!(h.total(&sub(1), "usdt"), dec!(10450));
        assert_eq!(h.total(&sub(2), "usdt"), dec!(9475));
        assert!(h.engine.positions(&market).unwrap().is_empty());
        assert_eq!(h.engine.open_interest(&market).unwrap(), Decimal::ZERO);
        h.engine.check_invariants().unwrap();
    }

    #[test]
    fn immediate_settlement_does_not_wait_for_the_block() {
        let mut h = Harness::new();
        let market = h.open_perp_positions(None);

        assert!(h.engine.admin_settle_market_now(h.admin, market, Some(dec!(50500))).unwrap());
        assert_eq!(h.engine.derivative_market(&market).unwrap().unwrap().status(), MarketStatus::Paused);
        assert_eq!(h.total(&sub(1), "usdt"), dec!(10450));
        assert!(h.engine.positions(&market).unwrap().is_empty());

        // the queue entry went with it, nothing settles twice
        h.next_block(1);
        assert_eq!(h.total(&sub(1), "usdt"), dec!(10450));
        let settled = h.events(|p| matches!(p, EventPayload::MarketSettled(_)).then_some(()));
        assert_eq!(settled.len(), 1);
    }

    #[test]
    fn block_summaries_report_levels_and_deposits() {
        let mut h = Harness::new();
        let market = h.spot_market();
        let alice = h.fund(1, "usdt", dec!(1000));
        h.spot_limit(crate::order::SpotOrder::limit(market, OrderInfo::new(alice, dec!(10), dec!(2)), OrderType::Buy))
            .unwrap();
        h.next_block(1);

        let levels = h.events(|p| match p {
            EventPayload::OrderbookUpdate(u) => Some((u.price, u.quantity)),
            _ => None,
        });
        assert_eq!(levels, vec![(dec!(10), dec!(2))]);
        let deposits = h.events(|p| match p {
            EventPayload::BatchDepositUpdate(b) => Some(b.updates.len()),
            _ => None,
        });
        assert_eq!(deposits, vec![1]);
    }
}
