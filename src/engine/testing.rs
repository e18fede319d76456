//! Test harness: an engine wired to an in-memory oracle, with helpers to launch markets,
//! fund traders and step blocks.

use super::config::EngineConfig;
use super::core::Engine;
use super::results::{ExchangeError, TxResponse};
use crate::config::ExchangeParams;
use crate::events::EventPayload;
use crate::msgs::{
    BinaryOptionsMarketLaunch, DerivativeMarketLaunch, ExchangeMsg, MsgCreateDerivativeOrder, MsgCreateSpotOrder,
    MsgDeposit, MsgResponse, SpotMarketLaunch,
};
use crate::oracle::InMemoryOracle;
use crate::order::{DerivativeOrder, OrderInfo, OrderType, SpotOrder};
use crate::types::{Address, BlockContext, Coin, MarketId, OrderHash, SubaccountId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

pub(super) fn trader(n: u8) -> Address {
    Address([n; 20])
}

/// Subaccount 1 of trader `n`.
pub(super) fn sub(n: u8) -> SubaccountId {
    SubaccountId::new(trader(n), 1)
}

pub(super) struct Harness {
    pub engine: Engine,
    pub oracle: InMemoryOracle,
    pub admin: Address,
    pub block: BlockContext,
}

impl Harness {
    pub fn new() -> Self {
        let params = ExchangeParams::default();
        let admin = params.admin;
        let oracle = InMemoryOracle::new();
        let config = EngineConfig {
            check_invariants_every_block: true,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(params, config, Arc::new(oracle.clone())).unwrap();
        let block = BlockContext::new(1, 0);
        engine.begin_block(block).unwrap();
        Self {
            engine,
            oracle,
            admin,
            block,
        }
    }

    /// Ends the current block and opens the next one `secs` later.
    pub fn next_block(&mut self, secs: i64) {
        self.engine.end_block().unwrap();
        self.block = self.block.next(secs);
        self.engine.begin_block(self.block).unwrap();
    }

    /// INJ/USDT, maker 0.001, taker 0.002.
    pub fn spot_market(&mut self) -> MarketId {
        self.engine
            .launch_spot_market(
                self.admin,
                SpotMarketLaunch {
                    ticker: "INJ/USDT".into(),
                    base_denom: "inj".into(),
                    quote_denom: "usdt".into(),
                    maker_fee_rate: Some(dec!(0.001)),
                    taker_fee_rate: Some(dec!(0.002)),
                    min_price_tick_size: dec!(0.01),
                    min_quantity_tick_size: dec!(0.001),
                    min_notional: None,
                },
            )
            .unwrap()
    }

    /// BTC/USDT, perpetual when `expiry` is none. Sets the oracle to `mark` first. Maker
    /// 0.0005, taker 0.001, IMR 0.05.
    pub fn derivative_market(&mut self, mark: Decimal, expiry: Option<i64>) -> MarketId {
        self.oracle.set_price("btc", "usdt", mark);
        self.engine
            .launch_derivative_market(
                self.admin,
                DerivativeMarketLaunch {
                    ticker: "BTC/USDT".into(),
                    quote_denom: "usdt".into(),
                    oracle_base: "btc".into(),
                    oracle_quote: "usdt".into(),
                    expiry,
                    initial_margin_ratio: Some(dec!(0.05)),
                    maintenance_margin_ratio: Some(dec!(0.02)),
                    maker_fee_rate: Some(dec!(0.0005)),
                    taker_fee_rate: Some(dec!(0.001)),
                    min_price_tick_size: dec!(0.1),
                    min_quantity_tick_size: dec!(0.001),
                    min_notional: None,
                    open_notional_cap: None,
                },
            )
            .unwrap()
    }

    /// Fee-free binary market on rain/weather.
    pub fn binary_market(&mut self, expiration: i64, settlement: i64) -> MarketId {
        self.engine
            .launch_binary_options_market(
                self.admin,
                BinaryOptionsMarketLaunch {
                    ticker: "RAIN".into(),
                    oracle_symbol: "rain".into(),
                    oracle_provider: "weather".into(),
                    quote_denom: "usdt".into(),
                    expiration_timestamp: expiration,
                    settlement_timestamp: settlement,
                    maker_fee_rate: Some(Decimal::ZERO),
                    taker_fee_rate: Some(Decimal::ZERO),
                    min_price_tick_size: dec!(0.01),
                    min_quantity_tick_size: dec!(1),
                    min_notional: None,
                },
            )
            .unwrap()
    }

    /// Perpetual at mark 50000 where trader 1 is long 1 and trader 2 short 1, both
    /// entered at 50000 with 5000 margin out of 10000 deposited.
    pub fn open_perp_positions(&mut self, expiry: Option<i64>) -> MarketId {
        let market = self.derivative_market(dec!(50000), expiry);
        let long = self.fund(1, "usdt", dec!(10000));
        let short = self.fund(2, "usdt", dec!(10000));
        self.derivative_limit(DerivativeOrder::limit(
            market,
            OrderInfo::new(short, dec!(50000), dec!(1)),
            OrderType::Sell,
            dec!(5000),
        ))
        .unwrap();
        self.derivative_limit(DerivativeOrder::limit(
            market,
            OrderInfo::new(long, dec!(50000), dec!(1)),
            OrderType::Buy,
            dec!(5000),
        ))
        .unwrap();
        market
    }

    /// Mints to trader `n` and deposits into its subaccount 1.
    pub fn fund(&mut self, n: u8, denom: &str, amount: Decimal) -> SubaccountId {
        let owner = trader(n);
        self.engine.mint(&owner, &Coin::new(denom, amount)).unwrap();
        self.engine
            .deliver(ExchangeMsg::Deposit(MsgDeposit {
                sender: owner,
                subaccount_id: sub(n),
                amount: Coin::new(denom, amount),
            }))
            .unwrap();
        sub(n)
    }

    pub fn spot_limit(&mut self, order: SpotOrder) -> Result<OrderHash, ExchangeError> {
        let sender = order.order_info.subaccount_id.owner();
        let response = self
            .engine
            .deliver(ExchangeMsg::CreateSpotLimitOrder(MsgCreateSpotOrder { sender, order }))?;
        Ok(created_hash(response))
    }

    pub fn derivative_limit(&mut self, order: DerivativeOrder) -> Result<OrderHash, ExchangeError> {
        let sender = order.order_info.subaccount_id.owner();
        let response = self
            .engine
            .deliver(ExchangeMsg::CreateDerivativeLimitOrder(MsgCreateDerivativeOrder { sender, order }))?;
        Ok(created_hash(response))
    }

    pub fn derivative_market_order(&mut self, order: DerivativeOrder) -> Result<OrderHash, ExchangeError> {
        let sender = order.order_info.subaccount_id.owner();
        let response = self
            .engine
            .deliver(ExchangeMsg::CreateDerivativeMarketOrder(MsgCreateDerivativeOrder { sender, order }))?;
        Ok(created_hash(response))
    }

    pub fn binary_limit(&mut self, order: DerivativeOrder) -> Result<OrderHash, ExchangeError> {
        let sender = order.order_info.subaccount_id.owner();
        let response = self
            .engine
            .deliver(ExchangeMsg::CreateBinaryOptionsLimitOrder(MsgCreateDerivativeOrder { sender, order }))?;
        Ok(created_hash(response))
    }

    pub fn available(&self, sub: &SubaccountId, denom: &str) -> Decimal {
        self.engine.subaccount_deposit(sub, denom).unwrap().available_balance
    }

    pub fn total(&self, sub: &SubaccountId, denom: &str) -> Decimal {
        self.engine.subaccount_deposit(sub, denom).unwrap().total_balance
    }

    /// Committed events matching `pick`.
    pub fn events<T>(&self, pick: impl Fn(&EventPayload) -> Option<T>) -> Vec<T> {
        self.engine.events().iter().filter_map(|e| pick(&e.payload)).collect()
    }
}

fn created_hash(response: TxResponse) -> OrderHash {
    match response.response {
        MsgResponse::OrderCreated(created) => created.order_hash,
        other => panic!("expected OrderCreated, got {other:?}"),
    }
}
