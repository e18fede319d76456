// 9.0: wire operations. each variant is one signed message delivered by the host;
// Engine::deliver routes them to handlers and wraps each in one atomic scope.

use crate::order::{DerivativeOrder, OrderData, SpotOrder};
use crate::types::{Address, Coin, MarketId, OrderHash, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgCreateSpotOrder {
    pub sender: Address,
    pub order: SpotOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgCreateDerivativeOrder {
    pub sender: Address,
    pub order: DerivativeOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgCancelOrder {
    pub sender: Address,
    pub order: OrderData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgBatchUpdateOrders {
    pub sender: Address,
    /// cancel-all runs only when this is set
    #[serde(default)]
    pub subaccount_id: Option<SubaccountId>,
    #[serde(default)]
    pub spot_market_ids_to_cancel_all: Vec<MarketId>,
    #[serde(default)]
    pub derivative_market_ids_to_cancel_all: Vec<MarketId>,
    #[serde(default)]
    pub binary_options_market_ids_to_cancel_all: Vec<MarketId>,
    #[serde(default)]
    pub spot_orders_to_cancel: Vec<OrderData>,
    #[serde(default)]
    pub derivative_orders_to_cancel: Vec<OrderData>,
    #[serde(default)]
    pub binary_options_orders_to_cancel: Vec<OrderData>,
    #[serde(default)]
    pub spot_orders_to_create: Vec<SpotOrder>,
    #[serde(default)]
    pub derivative_orders_to_create: Vec<DerivativeOrder>,
    #[serde(default)]
    pub binary_options_orders_to_create: Vec<DerivativeOrder>,
    #[serde(default)]
    pub spot_market_orders_to_create: Vec<SpotOrder>,
    #[serde(default)]
    pub derivative_market_orders_to_create: Vec<DerivativeOrder>,
    #[serde(default)]
    pub binary_options_market_orders_to_create: Vec<DerivativeOrder>,
}

impl MsgBatchUpdateOrders {
    pub fn new(sender: Address) -> Self {
        Self {
            sender,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgDeposit {
    pub sender: Address,
    pub subaccount_id: SubaccountId,
    pub amount: Coin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgWithdraw {
    pub sender: Address,
    pub subaccount_id: SubaccountId,
    pub amount: Coin,
}

/// Used for both subaccount (same owner) and external (any owner) transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgTransfer {
    pub sender: Address,
    pub source_subaccount_id: SubaccountId,
    pub destination_subaccount_id: SubaccountId,
    pub amount: Coin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgPositionMargin {
    pub sender: Address,
    pub source_subaccount_id: SubaccountId,
    pub destination_subaccount_id: SubaccountId,
    pub market_id: MarketId,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExchangeMsg {
    CreateSpotLimitOrder(MsgCreateSpotOrder),
    CreateSpotMarketOrder(MsgCreateSpotOrder),
    CreateDerivativeLimitOrder(MsgCreateDerivativeOrder),
    CreateDerivativeMarketOrder(MsgCreateDerivativeOrder),
    CreateBinaryOptionsLimitOrder(MsgCreateDerivativeOrder),
    CreateBinaryOptionsMarketOrder(MsgCreateDerivativeOrder),
    CancelSpotOrder(MsgCancelOrder),
    CancelDerivativeOrder(MsgCancelOrder),
    CancelBinaryOptionsOrder(MsgCancelOrder),
    BatchUpdateOrders(MsgBatchUpdateOrders),
    Deposit(MsgDeposit),
    Withdraw(MsgWithdraw),
    SubaccountTransfer(MsgTransfer),
    ExternalTransfer(MsgTransfer),
    IncreasePositionMargin(MsgPositionMargin),
    DecreasePositionMargin(MsgPositionMargin),
}

impl ExchangeMsg {
    pub fn name(&self) -> &'static str {
        match self {
            ExchangeMsg::CreateSpotLimitOrder(_) => "CreateSpotLimitOrder",
            ExchangeMsg::CreateSpotMarketOrder(_) => "CreateSpotMarketOrder",
            ExchangeMsg::CreateDerivativeLimitOrder(_) => "CreateDerivativeLimitOrder",
            ExchangeMsg::CreateDerivativeMarketOrder(_) => "CreateDerivativeMarketOrder",
            ExchangeMsg::CreateBinaryOptionsLimitOrder(_) => "CreateBinaryOptionsLimitOrder",
            ExchangeMsg::CreateBinaryOptionsMarketOrder(_) => "CreateBinaryOptionsMarketOrder",
            ExchangeMsg::CancelSpotOrder(_) => "CancelSpotOrder",
            ExchangeMsg::CancelDerivativeOrder(_) => "CancelDerivativeOrder",
            ExchangeMsg::CancelBinaryOptionsOrder(_) => "CancelBinaryOptionsOrder",
            ExchangeMsg::BatchUpdateOrders(_) => "BatchUpdateOrders",
            ExchangeMsg::Deposit(_) => "Deposit",
            ExchangeMsg::Withdraw(_) => "Withdraw",
            ExchangeMsg::SubaccountTransfer(_) => "SubaccountTransfer",
            ExchangeMsg::ExternalTransfer(_) => "ExternalTransfer",
            ExchangeMsg::IncreasePositionMargin(_) => "IncreasePositionMargin",
            ExchangeMsg::DecreasePositionMargin(_) => "DecreasePositionMargin",
        }
    }

    pub fn sender(&self) -> Address {
        match self {
            ExchangeMsg::CreateSpotLimitOrder(m) | ExchangeMsg::CreateSpotMarketOrder(m) => m.sender,
            ExchangeMsg::CreateDerivativeLimitOrder(m)
            | ExchangeMsg::CreateDerivativeMarketOrder(m)
            | ExchangeMsg::CreateBinaryOptionsLimitOrder(m)
            | ExchangeMsg::CreateBinaryOptionsMarketOrder(m) => m.sender,
            ExchangeMsg::CancelSpotOrder(m)
            | ExchangeMsg::CancelDerivativeOrder(m)
            | ExchangeMsg::CancelBinaryOptionsOrder(m) => m.sender,
            ExchangeMsg::BatchUpdateOrders(m) => m.sender,
            ExchangeMsg::Deposit(m) => m.sender,
            ExchangeMsg::Withdraw(m) => m.sender,
            ExchangeMsg::SubaccountTransfer(m) | ExchangeMsg::ExternalTransfer(m) => m.sender,
            ExchangeMsg::IncreasePositionMargin(m) | ExchangeMsg::DecreasePositionMargin(m) => m.sender,
        }
    }
}

// 9.2: governance. delivered by the admin outside the metered message path.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotMarketLaunch {
    pub ticker: String,
    pub base_denom: String,
    pub quote_denom: String,
    #[serde(default)]
    pub maker_fee_rate: Option<Decimal>,
    #[serde(default)]
    pub taker_fee_rate: Option<Decimal>,
    pub min_price_tick_size: Decimal,
    pub min_quantity_tick_size: Decimal,
    #[serde(default)]
    pub min_notional: Option<Decimal>,
}

/// Perpetual when `expiry` is none, expiry future otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivativeMarketLaunch {
    pub ticker: String,
    pub quote_denom: String,
    pub oracle_base: String,
    pub oracle_quote: String,
    #[serde(default)]
    pub expiry: Option<i64>,
    #[serde(default)]
    pub initial_margin_ratio: Option<Decimal>,
    #[serde(default)]
    pub maintenance_margin_ratio: Option<Decimal>,
    #[serde(default)]
    pub maker_fee_rate: Option<Decimal>,
    #[serde(default)]
    pub taker_fee_rate: Option<Decimal>,
    pub min_price_tick_size: Decimal,
    pub min_quantity_tick_size: Decimal,
    #[serde(default)]
    pub min_notional: Option<Decimal>,
    #[serde(default)]
    pub open_notional_cap: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryOptionsMarketLaunch {
    pub ticker: String,
    pub oracle_symbol: String,
    pub oracle_provider: String,
    pub quote_denom: String,
    pub expiration_timestamp: i64,
    pub settlement_timestamp: i64,
    #[serde(default)]
    pub maker_fee_rate: Option<Decimal>,
    #[serde(default)]
    pub taker_fee_rate: Option<Decimal>,
    pub min_price_tick_size: Decimal,
    pub min_quantity_tick_size: Decimal,
    #[serde(default)]
    pub min_notional: Option<Decimal>,
}

/// Hash and client id of a created order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_hash: OrderHash,
    pub cid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUpdateOrdersResponse {
    pub spot_cancel_success: Vec<bool>,
    pub derivative_cancel_success: Vec<bool>,
    pub binary_options_cancel_success: Vec<bool>,
    /// order hash on success, error code on failure, one slot per create
    pub spot_order_hashes: Vec<String>,
    pub derivative_order_hashes: Vec<String>,
    pub binary_options_order_hashes: Vec<String>,
    pub spot_market_order_hashes: Vec<String>,
    pub derivative_market_order_hashes: Vec<String>,
    pub binary_options_market_order_hashes: Vec<String>,
    pub created_orders_cids: Vec<String>,
    pub failed_orders_cids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgResponse {
    OrderCreated(OrderCreated),
    OrderCancelled,
    BatchUpdateOrders(BatchUpdateOrdersResponse),
    Empty,
}
