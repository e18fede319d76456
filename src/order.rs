//! Order types for all three market kinds.
//!
//! An order arrives as a [`SpotOrder`] or [`DerivativeOrder`] (binary options reuse the
//! derivative shape) and is stored either as a resting limit record or a block-scoped
//! market record. Every stored order is addressed by a content hash; a client id is an
//! optional second handle, unique per (subaccount, market).

use crate::types::{MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAX_CID_LENGTH: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("price must be positive, got {0}")]
    InvalidPrice(Decimal),

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("margin must not be negative, got {0}")]
    InvalidMargin(Decimal),

    #[error("client id longer than {MAX_CID_LENGTH} characters")]
    CidTooLong,

    #[error("trigger price required for conditional order types")]
    MissingTriggerPrice,

    #[error("trigger price not allowed for {0:?}")]
    UnexpectedTriggerPrice(OrderType),

    #[error("market orders cannot carry an expiration block")]
    ExpirationOnMarketOrder,

    #[error("conditional orders cannot carry an expiration block")]
    ExpirationOnConditionalOrder,

    #[error("expiration block {expiration} must be after current height {height}")]
    ExpirationInPast { expiration: u64, height: u64 },

    #[error("order type {0:?} not allowed here")]
    UnsupportedOrderType(OrderType),
}

/// Direction and behaviour flags packed into one enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Buy,
    Sell,
    StopBuy,
    StopSell,
    TakeBuy,
    TakeSell,
    BuyPostOnly,
    SellPostOnly,
    BuyAtomic,
    SellAtomic,
}

impl OrderType {
    pub fn is_buy(&self) -> bool {
        matches!(
            self,
            OrderType::Buy | OrderType::StopBuy | OrderType::TakeBuy | OrderType::BuyPostOnly | OrderType::BuyAtomic
        )
    }

    pub fn side(&self) -> Side {
        Side::from_is_buy(self.is_buy())
    }

    pub fn is_post_only(&self) -> bool {
        matches!(self, OrderType::BuyPostOnly | OrderType::SellPostOnly)
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, OrderType::BuyAtomic | OrderType::SellAtomic)
    }

    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            OrderType::StopBuy | OrderType::StopSell | OrderType::TakeBuy | OrderType::TakeSell
        )
    }

    /// Plain order of the same direction, what a conditional order becomes once triggered.
    pub fn untriggered(&self) -> OrderType {
        if self.is_buy() {
            OrderType::Buy
        } else {
            OrderType::Sell
        }
    }

    pub fn post_only(&self) -> OrderType {
        if self.is_buy() {
            OrderType::BuyPostOnly
        } else {
            OrderType::SellPostOnly
        }
    }

    fn hash_tag(&self) -> u8 {
        match self {
            OrderType::Buy => 1,
            OrderType::Sell => 2,
            OrderType::StopBuy => 3,
            OrderType::StopSell => 4,
            OrderType::TakeBuy => 5,
            OrderType::TakeSell => 6,
            OrderType::BuyPostOnly => 7,
            OrderType::SellPostOnly => 8,
            OrderType::BuyAtomic => 9,
            OrderType::SellAtomic => 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub subaccount_id: SubaccountId,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(default)]
    pub cid: String,
}

impl OrderInfo {
    pub fn new(subaccount_id: SubaccountId, price: Decimal, quantity: Decimal) -> Self {
        Self {
            subaccount_id,
            price,
            quantity,
            cid: String::new(),
        }
    }

    pub fn with_cid(mut self, cid: impl Into<String>) -> Self {
        self.cid = cid.into();
        self
    }

    pub fn validate(&self) -> Result<(), OrderError> {
        if self.price <= Decimal::ZERO {
            return Err(OrderError::InvalidPrice(self.price));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(OrderError::InvalidQuantity(self.quantity));
        }
        if self.cid.len() > MAX_CID_LENGTH {
            return Err(OrderError::CidTooLong);
        }
        Ok(())
    }
}

// 4.10: inbound orders

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotOrder {
    pub market_id: MarketId,
    pub order_info: OrderInfo,
    pub order_type: OrderType,
    #[serde(default)]
    pub trigger_price: Option<Decimal>,
    /// 0 = good till cancelled
    #[serde(default)]
    pub expiration_block: u64,
}

impl SpotOrder {
    pub fn limit(market_id: MarketId, order_info: OrderInfo, order_type: OrderType) -> Self {
        Self {
            market_id,
            order_info,
            order_type,
            trigger_price: None,
            expiration_block: 0,
        }
    }

    pub fn with_expiration(mut self, block: u64) -> Self {
        self.expiration_block = block;
        self
    }

    pub fn validate_basic(&self, is_market: bool, height: u64) -> Result<(), OrderError> {
        self.order_info.validate()?;
        if self.order_type.is_conditional() {
            return Err(OrderError::UnsupportedOrderType(self.order_type));
        }
        if self.trigger_price.is_some() {
            return Err(OrderError::UnexpectedTriggerPrice(self.order_type));
        }
        validate_expiration(self.expiration_block, is_market, height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeOrder {
    pub market_id: MarketId,
    pub order_info: OrderInfo,
    pub order_type: OrderType,
    /// zero margin = reduce-only
    pub margin: Decimal,
    #[serde(default)]
    pub trigger_price: Option<Decimal>,
    #[serde(default)]
    pub expiration_block: u64,
}

impl DerivativeOrder {
    pub fn limit(market_id: MarketId, order_info: OrderInfo, order_type: OrderType, margin: Decimal) -> Self {
        Self {
            market_id,
            order_info,
            order_type,
            margin,
            trigger_price: None,
            expiration_block: 0,
        }
    }

    pub fn conditional(mut self, trigger_price: Decimal) -> Self {
        self.trigger_price = Some(trigger_price);
        self
    }

    pub fn with_expiration(mut self, block: u64) -> Self {
        self.expiration_block = block;
        self
    }

    pub fn is_reduce_only(&self) -> bool {
        self.margin.is_zero()
    }

    pub fn is_conditional(&self) -> bool {
        self.order_type.is_conditional()
    }

    pub fn validate_basic(&self, is_market: bool, height: u64) -> Result<(), OrderError> {
        self.order_info.validate()?;
        if self.margin < Decimal::ZERO {
            return Err(OrderError::InvalidMargin(self.margin));
        }
        match (self.order_type.is_conditional(), self.trigger_price) {
            (true, None) => return Err(OrderError::MissingTriggerPrice),
            (true, Some(t)) if t <= Decimal::ZERO => return Err(OrderError::InvalidPrice(t)),
            (false, Some(_)) => return Err(OrderError::UnexpectedTriggerPrice(self.order_type)),
            _ => {}
        }
        validate_expiration(self.expiration_block, is_market, height)
    }
}

fn validate_expiration(expiration: u64, is_market: bool, height: u64) -> Result<(), OrderError> {
    if expiration == 0 {
        return Ok(());
    }
    if is_market {
        return Err(OrderError::ExpirationOnMarketOrder);
    }
    if expiration <= height {
        return Err(OrderError::ExpirationInPast { expiration, height });
    }
    Ok(())
}

// 4.11: stored records

/// Anything that can rest in a price-indexed book.
pub trait BookOrder {
    fn hash(&self) -> OrderHash;
    fn subaccount_id(&self) -> SubaccountId;
    fn price(&self) -> Decimal;
    fn fillable(&self) -> Decimal;
    fn side(&self) -> Side;
    fn cid(&self) -> &str;
    fn expiration_block(&self) -> u64;

    fn is_reduce_only(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotLimitOrder {
    pub order_info: OrderInfo,
    pub order_type: OrderType,
    pub fillable: Decimal,
    pub order_hash: OrderHash,
    #[serde(default)]
    pub expiration_block: u64,
}

impl SpotLimitOrder {
    /// Funds still locked by the unfilled part: quote for bids, base for asks.
    pub fn balance_hold(&self, fee_rate: Decimal) -> Decimal {
        if self.order_type.is_buy() {
            self.fillable * self.order_info.price * (Decimal::ONE + fee_rate.max(Decimal::ZERO))
        } else {
            self.fillable
        }
    }
}

impl BookOrder for SpotLimitOrder {
    fn hash(&self) -> OrderHash {
        self.order_hash
    }
    fn subaccount_id(&self) -> SubaccountId {
        self.order_info.subaccount_id
    }
    fn price(&self) -> Decimal {
        self.order_info.price
    }
    fn fillable(&self) -> Decimal {
        self.fillable
    }
    fn side(&self) -> Side {
        self.order_type.side()
    }
    fn cid(&self) -> &str {
        &self.order_info.cid
    }
    fn expiration_block(&self) -> u64 {
        self.expiration_block
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeLimitOrder {
    pub order_info: OrderInfo,
    pub order_type: OrderType,
    /// backs the fillable quantity only; shrinks pro rata with fills
    pub margin: Decimal,
    pub fillable: Decimal,
    pub order_hash: OrderHash,
    #[serde(default)]
    pub trigger_price: Option<Decimal>,
    #[serde(default)]
    pub expiration_block: u64,
}

impl DerivativeLimitOrder {
    pub fn is_vanilla(&self) -> bool {
        !self.margin.is_zero()
    }

    /// Margin plus the worst-case fee on the unfilled part.
    pub fn margin_hold(&self, fee_rate: Decimal) -> Decimal {
        if self.is_vanilla() {
            self.margin + self.fillable * self.order_info.price * fee_rate.max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        }
    }

    pub fn margin_for(&self, quantity: Decimal) -> Decimal {
        if self.fillable.is_zero() {
            return Decimal::ZERO;
        }
        self.margin * quantity / self.fillable
    }
}

impl BookOrder for DerivativeLimitOrder {
    fn hash(&self) -> OrderHash {
        self.order_hash
    }
    fn subaccount_id(&self) -> SubaccountId {
        self.order_info.subaccount_id
    }
    fn price(&self) -> Decimal {
        self.order_info.price
    }
    fn fillable(&self) -> Decimal {
        self.fillable
    }
    fn side(&self) -> Side {
        self.order_type.side()
    }
    fn cid(&self) -> &str {
        &self.order_info.cid
    }
    fn expiration_block(&self) -> u64 {
        self.expiration_block
    }
    fn is_reduce_only(&self) -> bool {
        !self.is_vanilla()
    }
}

/// Block-scoped market order. never outlives the block it was placed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketOrder {
    pub market_id: MarketId,
    pub order_info: OrderInfo,
    pub order_type: OrderType,
    /// derivative only; zero for spot and reduce-only
    pub margin: Decimal,
    /// funds removed from available balance when the order was accepted
    pub balance_hold: Decimal,
    pub order_hash: OrderHash,
}

impl MarketOrder {
    pub fn side(&self) -> Side {
        self.order_type.side()
    }

    pub fn is_reduce_only(&self) -> bool {
        self.margin.is_zero()
    }
}

// 4.12: cancellation handles

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderIdentifier {
    Hash(OrderHash),
    Cid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderData {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    pub identifier: OrderIdentifier,
}

impl OrderData {
    pub fn by_hash(market_id: MarketId, subaccount_id: SubaccountId, hash: OrderHash) -> Self {
        Self {
            market_id,
            subaccount_id,
            identifier: OrderIdentifier::Hash(hash),
        }
    }

    pub fn by_cid(market_id: MarketId, subaccount_id: SubaccountId, cid: impl Into<String>) -> Self {
        Self {
            market_id,
            subaccount_id,
            identifier: OrderIdentifier::Cid(cid.into()),
        }
    }

    pub fn cid(&self) -> String {
        match &self.identifier {
            OrderIdentifier::Cid(cid) => cid.clone(),
            OrderIdentifier::Hash(_) => String::new(),
        }
    }

    pub fn hash(&self) -> Option<OrderHash> {
        match &self.identifier {
            OrderIdentifier::Hash(h) => Some(*h),
            OrderIdentifier::Cid(_) => None,
        }
    }
}

// 4.13: order hash. sha256 over the order content plus the subaccount's trade nonce, so two
// identical orders from the same subaccount still get distinct hashes.
#[allow(clippy::too_many_arguments)]
pub fn compute_order_hash(
    subaccount: &SubaccountId,
    market: &MarketId,
    order_type: OrderType,
    price: Decimal,
    quantity: Decimal,
    margin: Decimal,
    trigger_price: Option<Decimal>,
    nonce: u32,
) -> OrderHash {
    let mut hasher = Sha256::new();
    hasher.update(subaccount.as_bytes());
    hasher.update(market.as_bytes());
    hasher.update([order_type.hash_tag()]);
    hasher.update(price.normalize().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(quantity.normalize().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(margin.normalize().to_string().as_bytes());
    hasher.update(b"|");
    if let Some(trigger) = trigger_price {
        hasher.update(trigger.normalize().to_string().as_bytes());
    }
    hasher.update(nonce.to_be_bytes());

    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    OrderHash(hash)
}
