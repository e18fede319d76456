// 11.0: every committed state change produces an event for indexers. events raised while
// a message runs sit in a pending buffer and reach the log only when the message commits;
// a failed message discards them with the rest of its writes.

use crate::conditional::ConditionalOrder;
use crate::deposits::Deposit;
use crate::market::{BinaryOptionsMarket, DerivativeMarket, SpotMarket};
use crate::order::{DerivativeLimitOrder, SpotLimitOrder};
use crate::position::Position;
use crate::types::{Address, MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub height: u64,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    // Orders
    NewSpotOrders(NewSpotOrdersEvent),
    NewDerivativeOrders(NewDerivativeOrdersEvent),
    NewConditionalOrder(NewConditionalOrderEvent),
    CancelSpotOrder(OrderCancelledEvent),
    CancelDerivativeOrder(OrderCancelledEvent),
    CancelConditionalOrder(OrderCancelledEvent),
    OrderFail(OrderFailEvent),
    OrderCancelFail(OrderCancelFailEvent),

    // Trades and book
    SpotTrade(TradeEvent),
    DerivativeTrade(TradeEvent),
    OrderbookUpdate(OrderbookUpdateEvent),

    // Balances
    SubaccountDeposit(BalanceChangeEvent),
    SubaccountWithdraw(BalanceChangeEvent),
    SubaccountBalanceTransfer(BalanceTransferEvent),
    BatchDepositUpdate(BatchDepositUpdateEvent),

    // Positions and funding
    PositionUpdate(PositionUpdateEvent),
    PerpetualFundingUpdate(FundingUpdateEvent),

    // Markets
    SpotMarketUpdate(SpotMarket),
    DerivativeMarketUpdate(DerivativeMarket),
    BinaryOptionsMarketUpdate(BinaryOptionsMarket),
    MarketSettled(MarketSettledEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSpotOrdersEvent {
    pub market_id: MarketId,
    pub orders: Vec<SpotLimitOrder>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDerivativeOrdersEvent {
    pub market_id: MarketId,
    pub orders: Vec<DerivativeLimitOrder>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConditionalOrderEvent {
    pub market_id: MarketId,
    pub order: ConditionalOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    UserRequested,
    Expired,
    MarketClosed,
    /// fill would have left the maker below bankruptcy
    Bankrupt,
    /// staged market order left unfilled at end of block
    Unfilled,
    /// resting order met an incoming order from the same subaccount
    SelfTrade,
    /// reduce-only order with no position left to reduce
    PositionClosed,
    TriggerFailed,
    /// margin no longer covers the order once re-priced against the current mark
    InsufficientMarginAtMark,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelledEvent {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    pub order_hash: OrderHash,
    pub cid: String,
    pub reason: CancelReason,
}

/// One per message, listing every soft-failed create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderFailEvent {
    pub account: Address,
    pub cids: Vec<String>,
    pub codes: Vec<String>,
}

impl OrderFailEvent {
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelFailEvent {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    pub order_hash: Option<OrderHash>,
    pub cid: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    pub order_hash: OrderHash,
    pub cid: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub is_maker: bool,
    /// zero for spot
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookUpdateEvent {
    pub market_id: MarketId,
    pub side: Side,
    pub price: Decimal,
    /// zero = level removed
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceChangeEvent {
    pub subaccount_id: SubaccountId,
    pub denom: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceTransferEvent {
    pub source: SubaccountId,
    pub destination: SubaccountId,
    pub denom: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositUpdate {
    pub subaccount_id: SubaccountId,
    pub denom: String,
    pub deposit: Deposit,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDepositUpdateEvent {
    pub updates: Vec<DepositUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdateEvent {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    /// quantity zero once closed
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingUpdateEvent {
    pub market_id: MarketId,
    pub rate: Decimal,
    pub cumulative_funding: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSettledEvent {
    pub market_id: MarketId,
    pub settlement_price: Decimal,
    pub positions_closed: usize,
    /// fraction of winning payouts actually paid; one when fully solvent
    pub payout_ratio: Decimal,
}

pub trait EventEmitter {
    fn emit(&mut self, payload: EventPayload);
}

/// Committed log plus the pending buffer of the message in flight.
#[derive(Debug)]
pub struct EventLog {
    events: Vec<Event>,
    pending: Vec<EventPayload>,
    next_id: u64,
    max_events: usize,
    verbose: bool,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(usize::MAX, false)
    }
}

impl EventLog {
    pub fn new(max_events: usize, verbose: bool) -> Self {
        Self {
            events: Vec::new(),
            pending: Vec::new(),
            next_id: 1,
            max_events,
            verbose,
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn pending(&self) -> &[EventPayload] {
        &self.pending
    }

    /// Position in the pending buffer, for rolling back a failed message.
    pub fn mark(&self) -> usize {
        self.pending.len()
    }

    pub fn rollback_to(&mut self, mark: usize) {
        self.pending.truncate(mark);
    }

    /// Moves pending events into the log, oldest first. The log keeps at most
    /// `max_events`, dropping from the front.
    pub fn commit(&mut self, height: u64) {
        for payload in self.pending.drain(..) {
            let event = Event {
                id: EventId(self.next_id),
                height,
                payload,
            };
            self.next_id += 1;
            if self.verbose {
                debug!(id = event.id.0, height, payload = ?event.payload, "event");
            }
            self.events.push(event);
        }
        if self.events.len() > self.max_events {
            let excess = self.events.len() - self.max_events;
            self.events.drain(..excess);
        }
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.pending.clear();
    }
}

impl EventEmitter for EventLog {
    fn emit(&mut self, payload: EventPayload) {
        self.pending.push(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn deposit_event(amount: Decimal) -> EventPayload {
        EventPayload::SubaccountDeposit(BalanceChangeEvent {
            subaccount_id: SubaccountId([1; 32]),
            denom: "usdt".into(),
            amount,
        })
    }

    #[test]
    fn pending_events_wait_for_commit() {
        let mut log = EventLog::default();
        log.emit(deposit_event(dec!(1)));
        assert!(log.events().is_empty());
        assert_eq!(log.pending().len(), 1);

        log.commit(7);
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.events()[0].id, EventId(1));
        assert_eq!(log.events()[0].height, 7);
        assert!(log.pending().is_empty());
    }

    #[test]
    fn rollback_drops_only_later_events() {
        let mut log = EventLog::default();
        log.emit(deposit_event(dec!(1)));
        let mark = log.mark();
        log.emit(deposit_event(dec!(2)));
        log.emit(deposit_event(dec!(3)));
        log.rollback_to(mark);
        log.commit(1);
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.events()[0].payload, deposit_event(dec!(1)));
    }

    #[test]
    fn log_is_bounded() {
        let mut log = EventLog::new(2, false);
        for i in 0..5 {
            log.emit(deposit_event(Decimal::from(i)));
        }
        log.commit(1);
        let ids: Vec<u64> = log.events().iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn order_fail_event_serializes() {
        let event = OrderFailEvent {
            account: Address([3; 20]),
            cids: vec!["a".into()],
            codes: vec!["order_not_found".into()],
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: OrderFailEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(!back.is_empty());
    }
}
