// 14.0: resource accounting. a message is charged either per store access (dynamic, the
// default) or from a fixed per-message table. running past the limit is a hard failure
// for the whole message; the engine checks the meter at every step boundary.

use crate::msgs::{ExchangeMsg, MsgBatchUpdateOrders};
use crate::order::{DerivativeOrder, OrderType, SpotOrder};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("out of gas in {descriptor}: limit {limit}, consumed {consumed}")]
pub struct OutOfGas {
    pub descriptor: String,
    pub limit: u64,
    pub consumed: u64,
}

/// Consumption is recorded through `&self` so read paths can charge too.
#[derive(Debug, Clone)]
pub struct GasMeter {
    limit: Option<u64>,
    consumed: Cell<u64>,
    exhausted_at: Cell<Option<&'static str>>,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            consumed: Cell::new(0),
            exhausted_at: Cell::new(None),
        }
    }

    pub fn infinite() -> Self {
        Self {
            limit: None,
            consumed: Cell::new(0),
            exhausted_at: Cell::new(None),
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.get()
    }

    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|l| l.saturating_sub(self.consumed()))
    }

    /// Records consumption; the first point where the limit is crossed is latched
    /// and reported by [`GasMeter::ensure_within_limit`].
    pub fn charge(&self, amount: u64, descriptor: &'static str) {
        let consumed = self.consumed.get().saturating_add(amount);
        self.consumed.set(consumed);
        if let Some(limit) = self.limit {
            if consumed > limit && self.exhausted_at.get().is_none() {
                self.exhausted_at.set(Some(descriptor));
            }
        }
    }

    pub fn consume(&self, amount: u64, descriptor: &'static str) -> Result<(), OutOfGas> {
        self.charge(amount, descriptor);
        self.ensure_within_limit()
    }

    pub fn ensure_within_limit(&self) -> Result<(), OutOfGas> {
        match (self.exhausted_at.get(), self.limit) {
            (Some(descriptor), Some(limit)) => Err(OutOfGas {
                descriptor: descriptor.to_string(),
                limit,
                consumed: self.consumed(),
            }),
            _ => Ok(()),
        }
    }
}

/// Per-access costs for dynamic metering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvGasConfig {
    pub read_cost_flat: u64,
    pub read_cost_per_byte: u64,
    pub write_cost_flat: u64,
    pub write_cost_per_byte: u64,
    pub delete_cost: u64,
    pub iter_next_cost_flat: u64,
}

impl Default for KvGasConfig {
    fn default() -> Self {
        Self {
            read_cost_flat: 1000,
            read_cost_per_byte: 3,
            write_cost_flat: 2000,
            write_cost_per_byte: 30,
            delete_cost: 1000,
            iter_next_cost_flat: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderGas {
    pub limit: u64,
    pub post_only: u64,
    pub market: u64,
    pub cancel: u64,
}

/// Fixed-gas schedule. binary options use the derivative row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedGasTable {
    pub spot: OrderGas,
    pub derivative: OrderGas,
    pub deposit: u64,
    pub withdraw: u64,
    pub subaccount_transfer: u64,
    pub external_transfer: u64,
    pub increase_position_margin: u64,
    pub decrease_position_margin: u64,
    /// applied to orders carrying an expiration block, then truncated
    pub expiring_order_multiplier: Decimal,
}

impl Default for FixedGasTable {
    fn default() -> Self {
        Self {
            spot: OrderGas {
                limit: 100_000,
                post_only: 120_000,
                market: 50_000,
                cancel: 65_000,
            },
            derivative: OrderGas {
                limit: 120_000,
                post_only: 140_000,
                market: 105_000,
                cancel: 70_000,
            },
            deposit: 38_000,
            withdraw: 35_000,
            subaccount_transfer: 15_000,
            external_transfer: 40_000,
            increase_position_margin: 51_000,
            decrease_position_margin: 60_000,
            expiring_order_multiplier: dec!(1.1),
        }
    }
}

impl FixedGasTable {
    fn limit_order(&self, row: &OrderGas, order_type: OrderType, expiration_block: u64) -> u64 {
        let base = if order_type.is_post_only() { row.post_only } else { row.limit };
        if expiration_block == 0 {
            return base;
        }
        let scaled = (Decimal::from(base) * self.expiring_order_multiplier).trunc();
        scaled.to_u64().unwrap_or(u64::MAX)
    }

    pub fn spot_limit_order(&self, order: &SpotOrder) -> u64 {
        self.limit_order(&self.spot, order.order_type, order.expiration_block)
    }

    pub fn derivative_limit_order(&self, order: &DerivativeOrder) -> u64 {
        self.limit_order(&self.derivative, order.order_type, order.expiration_block)
    }

    /// Whole-message charge. A batch pays the sum over its items, see
    /// [`FixedGasTable::batch_charge`].
    pub fn gas_for(&self, msg: &ExchangeMsg) -> u64 {
        match msg {
            ExchangeMsg::CreateSpotLimitOrder(m) => self.spot_limit_order(&m.order),
            ExchangeMsg::CreateSpotMarketOrder(_) => self.spot.market,
            ExchangeMsg::CreateDerivativeLimitOrder(m) | ExchangeMsg::CreateBinaryOptionsLimitOrder(m) => {
                self.derivative_limit_order(&m.order)
            }
            ExchangeMsg::CreateDerivativeMarketOrder(_) | ExchangeMsg::CreateBinaryOptionsMarketOrder(_) => {
                self.derivative.market
            }
            ExchangeMsg::CancelSpotOrder(_) => self.spot.cancel,
            ExchangeMsg::CancelDerivativeOrder(_) | ExchangeMsg::CancelBinaryOptionsOrder(_) => self.derivative.cancel,
            ExchangeMsg::BatchUpdateOrders(m) => self.batch_charge(m),
            ExchangeMsg::Deposit(_) => self.deposit,
            ExchangeMsg::Withdraw(_) => self.withdraw,
            ExchangeMsg::SubaccountTransfer(_) => self.subaccount_transfer,
            ExchangeMsg::ExternalTransfer(_) => self.external_transfer,
            ExchangeMsg::IncreasePositionMargin(_) => self.increase_position_margin,
            ExchangeMsg::DecreasePositionMargin(_) => self.decrease_position_margin,
        }
    }

    pub fn batch_charge(&self, m: &MsgBatchUpdateOrders) -> u64 {
        let mut sum = 0u64;
        if m.subaccount_id.is_some() {
            sum += self.spot.cancel * m.spot_market_ids_to_cancel_all.len() as u64;
            sum += self.derivative.cancel * m.derivative_market_ids_to_cancel_all.len() as u64;
            sum += self.derivative.cancel * m.binary_options_market_ids_to_cancel_all.len() as u64;
        }
        sum += self.spot.cancel * m.spot_orders_to_cancel.len() as u64;
        sum += self.derivative.cancel * m.derivative_orders_to_cancel.len() as u64;
        sum += self.derivative.cancel * m.binary_options_orders_to_cancel.len() as u64;
        sum += m.spot_orders_to_create.iter().map(|o| self.spot_limit_order(o)).sum::<u64>();
        sum += m.derivative_orders_to_create.iter().map(|o| self.derivative_limit_order(o)).sum::<u64>();
        sum += m.binary_options_orders_to_create.iter().map(|o| self.derivative_limit_order(o)).sum::<u64>();
        sum += self.spot.market * m.spot_market_orders_to_create.len() as u64;
        sum += self.derivative.market * m.derivative_market_orders_to_create.len() as u64;
        sum += self.derivative.market * m.binary_options_market_orders_to_create.len() as u64;
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgs::MsgCreateDerivativeOrder;
    use crate::order::OrderInfo;
    use crate::types::{Address, MarketId, SubaccountId};

    fn derivative(order_type: OrderType, expiration: u64) -> DerivativeOrder {
        let info = OrderInfo::new(SubaccountId::new(Address([1; 20]), 1), dec!(10), dec!(1));
        DerivativeOrder::limit(MarketId([0; 32]), info, order_type, dec!(5)).with_expiration(expiration)
    }

    #[test]
    fn meter_latches_first_overrun() {
        let meter = GasMeter::new(100);
        meter.charge(60, "a");
        assert!(meter.ensure_within_limit().is_ok());
        meter.charge(60, "b");
        meter.charge(10, "c");
        let err = meter.ensure_within_limit().unwrap_err();
        assert_eq!(err.descriptor, "b");
        assert_eq!(err.consumed, 130);
    }

    #[test]
    fn infinite_meter_never_fails() {
        let meter = GasMeter::infinite();
        meter.charge(u64::MAX, "huge");
        assert!(meter.consume(1, "more").is_ok());
    }

    #[test]
    fn expiring_orders_cost_more() {
        let table = FixedGasTable::default();
        assert_eq!(table.derivative_limit_order(&derivative(OrderType::Buy, 0)), 120_000);
        assert_eq!(table.derivative_limit_order(&derivative(OrderType::Buy, 9)), 132_000);
        assert_eq!(table.derivative_limit_order(&derivative(OrderType::BuyPostOnly, 9)), 154_000);
    }

    #[test]
    fn binary_uses_derivative_row() {
        let table = FixedGasTable::default();
        let msg = ExchangeMsg::CreateBinaryOptionsLimitOrder(MsgCreateDerivativeOrder {
            sender: Address([1; 20]),
            order: derivative(OrderType::Sell, 0),
        });
        assert_eq!(table.gas_for(&msg), 120_000);
    }

    #[test]
    fn batch_sums_items() {
        let table = FixedGasTable::default();
        let mut batch = MsgBatchUpdateOrders::new(Address([1; 20]));
        batch.derivative_orders_to_create = vec![derivative(OrderType::Buy, 0), derivative(OrderType::Sell, 7)];
        batch.spot_market_ids_to_cancel_all = vec![MarketId([3; 32])];
        // no subaccount, cancel-all is skipped entirely
        assert_eq!(table.batch_charge(&batch), 120_000 + 132_000);
        batch.subaccount_id = Some(SubaccountId::new(Address([1; 20]), 1));
        assert_eq!(table.batch_charge(&batch), 120_000 + 132_000 + 65_000);
    }
}
