// 8.9 engine/batch.rs: MsgBatchUpdateOrders. three phases in a fixed order: cancel-all
// per market, explicit cancels, creates. each item runs in its own atomic scope so one bad
// item never takes the rest down; out of gas and invariant violations still abort the
// whole message.

use super::core::{ensure_owner, Engine};
use super::results::ExchangeError;
use crate::events::{EventPayload, OrderCancelFailEvent, OrderFailEvent};
use crate::market::{get_any_derivative_market, get_market, AnyDerivativeMarket, MarketInfo, SpotMarket};
use crate::msgs::{BatchUpdateOrdersResponse, MsgBatchUpdateOrders, OrderCreated};
use crate::order::OrderData;
use crate::store::{Ledger, StoreError};
use crate::types::MarketId;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Markets looked up once per batch. Nothing in a batch changes a market record.
#[derive(Debug, Default)]
struct MarketCache {
    spot: HashMap<MarketId, Option<SpotMarket>>,
    derivative: HashMap<MarketId, Option<AnyDerivativeMarket>>,
}

impl MarketCache {
    fn spot(&mut self, ledger: &Ledger, id: &MarketId) -> Result<Option<SpotMarket>, StoreError> {
        if let Some(cached) = self.spot.get(id) {
            return Ok(cached.clone());
        }
        let market = get_market::<SpotMarket, _>(ledger, id)?;
        self.spot.insert(*id, market.clone());
        Ok(market)
    }

    fn derivative(&mut self, ledger: &Ledger, id: &MarketId, binary: bool) -> Result<Option<AnyDerivativeMarket>, StoreError> {
        let market = match self.derivative.get(id) {
            Some(cached) => cached.clone(),
            None => {
                let market = get_any_derivative_market(ledger, id)?;
                self.derivative.insert(*id, market.clone());
                market
            }
        };
        Ok(market.filter(|m| matches!(m, AnyDerivativeMarket::Binary(_)) == binary))
    }

    fn require_spot(&mut self, ledger: &Ledger, id: &MarketId) -> Result<SpotMarket, ExchangeError> {
        self.spot(ledger, id)?.ok_or(ExchangeError::MarketNotFound(*id))
    }

    fn require_derivative(&mut self, ledger: &Ledger, id: &MarketId, binary: bool) -> Result<AnyDerivativeMarket, ExchangeError> {
        self.derivative(ledger, id, binary)?.ok_or(ExchangeError::MarketNotFound(*id))
    }
}

/// Running tally of the create phase.
#[derive(Debug, Default)]
struct CreateLog {
    created_cids: Vec<String>,
    failed_cids: Vec<String>,
    fail_event: OrderFailEvent,
}

impl CreateLog {
    /// Response slot for one create: the hex hash, or the error code.
    fn record(&mut self, result: Result<OrderCreated, ExchangeError>, cid: String) -> Result<String, ExchangeError> {
        match result {
            Ok(created) => {
                if !cid.is_empty() {
                    self.created_cids.push(cid);
                }
                Ok(created.order_hash.to_hex())
            }
            Err(err) if err.is_hard_failure() => Err(err),
            Err(err) => {
                debug!(code = err.code(), error = %err, "batch create failed");
                if !cid.is_empty() {
                    self.failed_cids.push(cid.clone());
                }
                self.fail_event.cids.push(cid);
                self.fail_event.codes.push(err.code().to_string());
                Ok(err.code().to_string())
            }
        }
    }
}

impl Engine {
    pub(super) fn batch_update_orders(&mut self, msg: MsgBatchUpdateOrders) -> Result<BatchUpdateOrdersResponse, ExchangeError> {
        let sender = msg.sender;
        let mut cache = MarketCache::default();
        let mut response = BatchUpdateOrdersResponse::default();

        // 8.9.1: cancel-all, only with a subaccount to scope it
        if let Some(sub) = msg.subaccount_id {
            ensure_owner(&sender, &sub)?;
            for id in &msg.spot_market_ids_to_cancel_all {
                match cache.spot(&self.ledger, id)? {
                    None => debug!(market = %id, "cancel-all skipped, no such spot market"),
                    Some(market) if !market.status.supports_order_cancellations() => {
                        warn!(market = %id, status = ?market.status, "cancel-all skipped, market closed");
                    }
                    Some(market) => {
                        self.cancel_subaccount_spot_orders(&market, &sub)?;
                    }
                }
                self.ledger.gas().ensure_within_limit()?;
            }
            for (ids, binary) in [
                (&msg.derivative_market_ids_to_cancel_all, false),
                (&msg.binary_options_market_ids_to_cancel_all, true),
            ] {
                for id in ids {
                    match cache.derivative(&self.ledger, id, binary)? {
                        None => debug!(market = %id, "cancel-all skipped, no such market"),
                        Some(market) if !market.status().supports_order_cancellations() => {
                            warn!(market = %id, status = ?market.status(), "cancel-all skipped, market closed");
                        }
                        Some(market) => {
                            self.cancel_subaccount_derivative_orders(&market, &sub)?;
                        }
                    }
                    self.ledger.gas().ensure_within_limit()?;
                }
            }
        }

        // 8.9.2: explicit cancels
        for data in &msg.spot_orders_to_cancel {
            let result = self.isolated(|engine| {
                ensure_owner(&sender, &data.subaccount_id)?;
                let market = cache.require_spot(&engine.ledger, &data.market_id)?;
                engine.cancel_spot_order_in(&market, data)
            });
            let ok = self.record_cancel(data, result)?;
            response.spot_cancel_success.push(ok);
        }
        for (orders, binary) in [(&msg.derivative_orders_to_cancel, false), (&msg.binary_options_orders_to_cancel, true)] {
            for data in orders {
                let result = self.isolated(|engine| {
                    ensure_owner(&sender, &data.subaccount_id)?;
                    let market = cache.require_derivative(&engine.ledger, &data.market_id, binary)?;
                    engine.cancel_derivative_order_in(&market, data)
                });
                let ok = self.record_cancel(data, result)?;
                if binary {
                    response.binary_options_cancel_success.push(ok);
                } else {
                    response.derivative_cancel_success.push(ok);
                }
            }
        }

        // 8.9.3: creates
        let mut log = CreateLog::default();
        for order in msg.spot_orders_to_create {
            let cid = order.order_info.cid.clone();
            let result = self.isolated(|engine| {
                ensure_owner(&sender, &order.order_info.subaccount_id)?;
                let market = cache.require_spot(&engine.ledger, &order.market_id)?;
                engine.place_spot_limit_order(&market, order)
            });
            response.spot_order_hashes.push(log.record(result, cid)?);
            self.ledger.gas().ensure_within_limit()?;
        }
        for order in msg.spot_market_orders_to_create {
            let cid = order.order_info.cid.clone();
            let result = self.isolated(|engine| {
                ensure_owner(&sender, &order.order_info.subaccount_id)?;
                let market = cache.require_spot(&engine.ledger, &order.market_id)?;
                engine.place_spot_market_order(&market, order)
            });
            response.spot_market_order_hashes.push(log.record(result, cid)?);
            self.ledger.gas().ensure_within_limit()?;
        }
        for (orders, binary) in [(msg.derivative_orders_to_create, false), (msg.binary_options_orders_to_create, true)] {
            for order in orders {
                let cid = order.order_info.cid.clone();
                let result = self.isolated(|engine| {
                    ensure_owner(&sender, &order.order_info.subaccount_id)?;
                    let market = cache.require_derivative(&engine.ledger, &order.market_id, binary)?;
                    engine.place_derivative_limit_order(&market, order)
                });
                let slot = log.record(result, cid)?;
                if binary {
                    response.binary_options_order_hashes.push(slot);
                } else {
                    response.derivative_order_hashes.push(slot);
                }
                self.ledger.gas().ensure_within_limit()?;
            }
        }
        for (orders, binary) in [
            (msg.derivative_market_orders_to_create, false),
            (msg.binary_options_market_orders_to_create, true),
        ] {
            for order in orders {
                let cid = order.order_info.cid.clone();
                let result = self.isolated(|engine| {
                    ensure_owner(&sender, &order.order_info.subaccount_id)?;
                    let market = cache.require_derivative(&engine.ledger, &order.market_id, binary)?;
                    engine.place_derivative_market_order(&market, order)
                });
                let slot = log.record(result, cid)?;
                if binary {
                    response.binary_options_market_order_hashes.push(slot);
                } else {
                    response.derivative_market_order_hashes.push(slot);
                }
                self.ledger.gas().ensure_within_limit()?;
            }
        }

        if !log.fail_event.is_empty() {
            log.fail_event.account = sender;
            self.emit(EventPayload::OrderFail(log.fail_event));
        }
        response.created_orders_cids = log.created_cids;
        response.failed_orders_cids = log.failed_cids;
        Ok(response)
    }

    /// Folds a soft cancel failure into an OrderCancelFail event. Hard failures propagate.
    fn record_cancel(&mut self, data: &OrderData, result: Result<(), ExchangeError>) -> Result<bool, ExchangeError> {
        let ok = match result {
            Ok(()) => true,
            Err(err) if err.is_hard_failure() => return Err(err),
            Err(err) => {
                debug!(market = %data.market_id, code = err.code(), "batch cancel failed");
                self.emit(EventPayload::OrderCancelFail(OrderCancelFailEvent {
                    market_id: data.market_id,
                    subaccount_id: data.subaccount_id,
                    order_hash: data.hash(),
                    cid: data.cid(),
                    description: err.code().to_string(),
                }));
                false
            }
        };
        self.ledger.gas().ensure_within_limit()?;
        Ok(ok)
    }
}
