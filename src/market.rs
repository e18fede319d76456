//! Market definitions and their ledger records.
//!
//! Three market kinds share two capability traits: [`MarketInfo`] (ticks, fees, status)
//! and [`DerivativeMarketLike`] (margin rules). Settlement and margin code is written
//! against the traits so binary options reuse the derivative paths without sharing a
//! lifecycle table.

use crate::keys::{prefix, KeyBuilder};
use crate::store::{get_record, iterate_prefix, set_record, unmarshal, KvStore, StoreError};
use crate::types::{MarketId, MarketKind, Side};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle: Active -> {Expired -> Demolished}, Active -> Demolished, Active <-> Paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketStatus {
    Active,
    Paused,
    Expired,
    Demolished,
}

impl Default for MarketStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl MarketStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, MarketStatus::Active)
    }

    pub fn supports_order_cancellations(&self) -> bool {
        matches!(self, MarketStatus::Active | MarketStatus::Paused | MarketStatus::Expired)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarketError {
    #[error("Market {0} not found")]
    MarketNotFound(MarketId),

    #[error("Market {0} is not active")]
    MarketNotActive(MarketId),

    #[error("Market {0} already exists")]
    MarketExists(MarketId),

    #[error("Market {market} status {status:?} does not allow this")]
    InvalidStatus { market: MarketId, status: MarketStatus },

    #[error("Price {price} not a multiple of tick {tick}")]
    InvalidPriceTick { price: Decimal, tick: Decimal },

    #[error("Quantity {quantity} not a multiple of tick {tick}")]
    InvalidQuantityTick { quantity: Decimal, tick: Decimal },

    #[error("Notional {notional} below minimum {minimum}")]
    BelowMinNotional { notional: Decimal, minimum: Decimal },

    #[error("Binary option price {0} outside (0, 1)")]
    BinaryPriceOutOfRange(Decimal),

    #[error("Invalid market parameter: {0}")]
    InvalidParameter(String),

    #[error("Oracle price not available for {0}")]
    NoOraclePrice(MarketId),
}

/// Shared surface of every market kind.
pub trait MarketInfo {
    fn market_id(&self) -> MarketId;
    fn kind(&self) -> MarketKind;
    fn ticker(&self) -> &str;
    fn status(&self) -> MarketStatus;
    fn set_status(&mut self, status: MarketStatus);
    fn quote_denom(&self) -> &str;
    fn maker_fee_rate(&self) -> Decimal;
    fn taker_fee_rate(&self) -> Decimal;
    fn min_price_tick_size(&self) -> Decimal;
    fn min_quantity_tick_size(&self) -> Decimal;
    fn min_notional(&self) -> Decimal;

    fn is_active(&self) -> bool {
        self.status().is_active()
    }

    fn validate_price_and_quantity(&self, price: Decimal, quantity: Decimal) -> Result<(), MarketError> {
        let tick = self.min_price_tick_size();
        if !(price % tick).is_zero() {
            return Err(MarketError::InvalidPriceTick { price, tick });
        }
        let qty_tick = self.min_quantity_tick_size();
        if !(quantity % qty_tick).is_zero() {
            return Err(MarketError::InvalidQuantityTick {
                quantity,
                tick: qty_tick,
            });
        }
        let notional = price * quantity;
        if notional < self.min_notional() {
            return Err(MarketError::BelowMinNotional {
                notional,
                minimum: self.min_notional(),
            });
        }
        Ok(())
    }
}

/// Markets that carry positions and margin.
pub trait DerivativeMarketLike: MarketInfo {
    fn initial_margin_ratio(&self) -> Decimal;
    fn maintenance_margin_ratio(&self) -> Decimal;
    fn is_perpetual(&self) -> bool;

    fn open_notional_cap(&self) -> Option<Decimal> {
        None
    }

    /// Fully collateralised markets derive order margin instead of taking it from the user.
    fn is_fully_collateralized(&self) -> bool {
        false
    }

    /// Minimum margin an order of this size must post.
    fn order_margin_requirement(&self, price: Decimal, quantity: Decimal, _side: Side) -> Decimal {
        self.initial_margin_ratio() * price * quantity
    }
}

fn validate_common(
    ticker: &str,
    maker_fee_rate: Decimal,
    taker_fee_rate: Decimal,
    price_tick: Decimal,
    quantity_tick: Decimal,
    min_notional: Decimal,
) -> Result<(), MarketError> {
    if ticker.is_empty() {
        return Err(MarketError::InvalidParameter("empty ticker".into()));
    }
    if taker_fee_rate < Decimal::ZERO || taker_fee_rate >= Decimal::ONE {
        return Err(MarketError::InvalidParameter(format!("taker fee {taker_fee_rate}")));
    }
    // negative maker fee is a rebate, paid out of the taker fee
    if maker_fee_rate >= Decimal::ONE || maker_fee_rate.abs() > taker_fee_rate && maker_fee_rate < Decimal::ZERO {
        return Err(MarketError::InvalidParameter(format!("maker fee {maker_fee_rate}")));
    }
    if price_tick <= Decimal::ZERO || quantity_tick <= Decimal::ZERO {
        return Err(MarketError::InvalidParameter("tick sizes must be positive".into()));
    }
    if min_notional < Decimal::ZERO {
        return Err(MarketError::InvalidParameter("negative min notional".into()));
    }
    Ok(())
}

// 12.0: spot

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotMarket {
    pub market_id: MarketId,
    pub ticker: String,
    pub base_denom: String,
    pub quote_denom: String,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
    pub status: MarketStatus,
    pub min_price_tick_size: Decimal,
    pub min_quantity_tick_size: Decimal,
    pub min_notional: Decimal,
}

impl SpotMarket {
    pub fn derive_id(base_denom: &str, quote_denom: &str) -> MarketId {
        derive_market_id(MarketKind::Spot, &[base_denom, quote_denom])
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        if self.base_denom == self.quote_denom {
            return Err(MarketError::InvalidParameter("base and quote denom match".into()));
        }
        validate_common(
            &self.ticker,
            self.maker_fee_rate,
            self.taker_fee_rate,
            self.min_price_tick_size,
            self.min_quantity_tick_size,
            self.min_notional,
        )
    }
}

// 12.1: derivatives (perpetual and expiry futures)

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivativeMarket {
    pub market_id: MarketId,
    pub ticker: String,
    pub oracle_base: String,
    pub oracle_quote: String,
    pub quote_denom: String,
    pub initial_margin_ratio: Decimal,
    pub maintenance_margin_ratio: Decimal,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
    pub is_perpetual: bool,
    pub status: MarketStatus,
    pub min_price_tick_size: Decimal,
    pub min_quantity_tick_size: Decimal,
    pub min_notional: Decimal,
    /// per-subaccount ceiling on open position value
    #[serde(default)]
    pub open_notional_cap: Option<Decimal>,
}

impl DerivativeMarket {
    pub fn derive_id(ticker: &str, quote_denom: &str, oracle_base: &str, oracle_quote: &str, expiry: Option<i64>) -> MarketId {
        let expiry = expiry.map_or_else(|| "perp".to_string(), |e| e.to_string());
        derive_market_id(MarketKind::Derivative, &[ticker, quote_denom, oracle_base, oracle_quote, &expiry])
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        validate_common(
            &self.ticker,
            self.maker_fee_rate,
            self.taker_fee_rate,
            self.min_price_tick_size,
            self.min_quantity_tick_size,
            self.min_notional,
        )?;
        if self.maintenance_margin_ratio <= Decimal::ZERO || self.initial_margin_ratio >= Decimal::ONE {
            return Err(MarketError::InvalidParameter("margin ratios must lie in (0, 1)".into()));
        }
        if self.initial_margin_ratio <= self.maintenance_margin_ratio {
            return Err(MarketError::InvalidParameter("initial margin must exceed maintenance".into()));
        }
        if let Some(cap) = self.open_notional_cap {
            if cap <= Decimal::ZERO {
                return Err(MarketError::InvalidParameter("open notional cap must be positive".into()));
            }
        }
        Ok(())
    }
}

// 12.2: binary options. prices live in [0, 1]; both sides are fully collateralised.

pub const BINARY_OPTIONS_REFUND_FLAG_PRICE: Decimal = Decimal::NEGATIVE_ONE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryOptionsMarket {
    pub market_id: MarketId,
    pub ticker: String,
    pub oracle_symbol: String,
    pub oracle_provider: String,
    pub quote_denom: String,
    pub expiration_timestamp: i64,
    pub settlement_timestamp: i64,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
    pub status: MarketStatus,
    pub min_price_tick_size: Decimal,
    pub min_quantity_tick_size: Decimal,
    pub min_notional: Decimal,
    /// set by an admin ahead of a forced settlement; -1 means refund
    #[serde(default)]
    pub settlement_price: Option<Decimal>,
}

impl BinaryOptionsMarket {
    pub fn derive_id(ticker: &str, quote_denom: &str, oracle_symbol: &str, oracle_provider: &str) -> MarketId {
        derive_market_id(MarketKind::BinaryOption, &[ticker, quote_denom, oracle_symbol, oracle_provider])
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        validate_common(
            &self.ticker,
            self.maker_fee_rate,
            self.taker_fee_rate,
            self.min_price_tick_size,
            self.min_quantity_tick_size,
            self.min_notional,
        )?;
        if self.settlement_timestamp < self.expiration_timestamp {
            return Err(MarketError::InvalidParameter("settlement before expiration".into()));
        }
        Ok(())
    }
}

macro_rules! impl_market_info {
    ($ty:ty, $kind:expr) => {
        impl MarketInfo for $ty {
            fn market_id(&self) -> MarketId {
                self.market_id
            }
            fn kind(&self) -> MarketKind {
                $kind
            }
            fn ticker(&self) -> &str {
                &self.ticker
            }
            fn status(&self) -> MarketStatus {
                self.status
            }
            fn set_status(&mut self, status: MarketStatus) {
                self.status = status;
            }
            fn quote_denom(&self) -> &str {
                &self.quote_denom
            }
            fn maker_fee_rate(&self) -> Decimal {
                self.maker_fee_rate
            }
            fn taker_fee_rate(&self) -> Decimal {
                self.taker_fee_rate
            }
            fn min_price_tick_size(&self) -> Decimal {
                self.min_price_tick_size
            }
            fn min_quantity_tick_size(&self) -> Decimal {
                self.min_quantity_tick_size
            }
            fn min_notional(&self) -> Decimal {
                self.min_notional
            }
        }
    };
}

impl_market_info!(SpotMarket, MarketKind::Spot);
impl_market_info!(DerivativeMarket, MarketKind::Derivative);

impl MarketInfo for BinaryOptionsMarket {
    fn market_id(&self) -> MarketId {
        self.market_id
    }
    fn kind(&self) -> MarketKind {
        MarketKind::BinaryOption
    }
    fn ticker(&self) -> &str {
        &self.ticker
    }
    fn status(&self) -> MarketStatus {
        self.status
    }
    fn set_status(&mut self, status: MarketStatus) {
        self.status = status;
    }
    fn quote_denom(&self) -> &str {
        &self.quote_denom
    }
    fn maker_fee_rate(&self) -> Decimal {
        self.maker_fee_rate
    }
    fn taker_fee_rate(&self) -> Decimal {
        self.taker_fee_rate
    }
    fn min_price_tick_size(&self) -> Decimal {
        self.min_price_tick_size
    }
    fn min_quantity_tick_size(&self) -> Decimal {
        self.min_quantity_tick_size
    }
    fn min_notional(&self) -> Decimal {
        self.min_notional
    }

    fn validate_price_and_quantity(&self, price: Decimal, quantity: Decimal) -> Result<(), MarketError> {
        if price <= Decimal::ZERO || price >= Decimal::ONE {
            return Err(MarketError::BinaryPriceOutOfRange(price));
        }
        let tick = self.min_price_tick_size;
        if !(price % tick).is_zero() {
            return Err(MarketError::InvalidPriceTick { price, tick });
        }
        if !(quantity % self.min_quantity_tick_size).is_zero() {
            return Err(MarketError::InvalidQuantityTick {
                quantity,
                tick: self.min_quantity_tick_size,
            });
        }
        if price * quantity < self.min_notional {
            return Err(MarketError::BelowMinNotional {
                notional: price * quantity,
                minimum: self.min_notional,
            });
        }
        Ok(())
    }
}

impl DerivativeMarketLike for DerivativeMarket {
    fn initial_margin_ratio(&self) -> Decimal {
        self.initial_margin_ratio
    }
    fn maintenance_margin_ratio(&self) -> Decimal {
        self.maintenance_margin_ratio
    }
    fn is_perpetual(&self) -> bool {
        self.is_perpetual
    }
    fn open_notional_cap(&self) -> Option<Decimal> {
        self.open_notional_cap
    }
}

impl DerivativeMarketLike for BinaryOptionsMarket {
    fn initial_margin_ratio(&self) -> Decimal {
        Decimal::ZERO
    }
    fn maintenance_margin_ratio(&self) -> Decimal {
        Decimal::ZERO
    }
    fn is_perpetual(&self) -> bool {
        false
    }
    fn is_fully_collateralized(&self) -> bool {
        true
    }

    // the buyer risks the price, the seller risks the rest of the unit payout
    fn order_margin_requirement(&self, price: Decimal, quantity: Decimal, side: Side) -> Decimal {
        match side {
            Side::Buy => price * quantity,
            Side::Sell => (Decimal::ONE - price) * quantity,
        }
    }
}

/// A derivative or binary-option market, for code paths that serve both.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyDerivativeMarket {
    Derivative(DerivativeMarket),
    Binary(BinaryOptionsMarket),
}

impl AnyDerivativeMarket {
    fn inner(&self) -> &dyn DerivativeMarketLike {
        match self {
            AnyDerivativeMarket::Derivative(m) => m,
            AnyDerivativeMarket::Binary(m) => m,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn DerivativeMarketLike {
        match self {
            AnyDerivativeMarket::Derivative(m) => m,
            AnyDerivativeMarket::Binary(m) => m,
        }
    }
}

impl MarketInfo for AnyDerivativeMarket {
    fn market_id(&self) -> MarketId {
        self.inner().market_id()
    }
    fn kind(&self) -> MarketKind {
        self.inner().kind()
    }
    fn ticker(&self) -> &str {
        self.inner().ticker()
    }
    fn status(&self) -> MarketStatus {
        self.inner().status()
    }
    fn set_status(&mut self, status: MarketStatus) {
        self.inner_mut().set_status(status)
    }
    fn quote_denom(&self) -> &str {
        self.inner().quote_denom()
    }
    fn maker_fee_rate(&self) -> Decimal {
        self.inner().maker_fee_rate()
    }
    fn taker_fee_rate(&self) -> Decimal {
        self.inner().taker_fee_rate()
    }
    fn min_price_tick_size(&self) -> Decimal {
        self.inner().min_price_tick_size()
    }
    fn min_quantity_tick_size(&self) -> Decimal {
        self.inner().min_quantity_tick_size()
    }
    fn min_notional(&self) -> Decimal {
        self.inner().min_notional()
    }
    fn validate_price_and_quantity(&self, price: Decimal, quantity: Decimal) -> Result<(), MarketError> {
        self.inner().validate_price_and_quantity(price, quantity)
    }
}

impl DerivativeMarketLike for AnyDerivativeMarket {
    fn initial_margin_ratio(&self) -> Decimal {
        self.inner().initial_margin_ratio()
    }
    fn maintenance_margin_ratio(&self) -> Decimal {
        self.inner().maintenance_margin_ratio()
    }
    fn is_perpetual(&self) -> bool {
        self.inner().is_perpetual()
    }
    fn open_notional_cap(&self) -> Option<Decimal> {
        self.inner().open_notional_cap()
    }
    fn is_fully_collateralized(&self) -> bool {
        self.inner().is_fully_collateralized()
    }
    fn order_margin_requirement(&self, price: Decimal, quantity: Decimal, side: Side) -> Decimal {
        self.inner().order_margin_requirement(price, quantity, side)
    }
}

pub fn derive_market_id(kind: MarketKind, parts: &[&str]) -> MarketId {
    let mut hasher = Sha256::new();
    hasher.update(kind.tag().as_bytes());
    for part in parts {
        hasher.update([part.len() as u8]);
        hasher.update(part.as_bytes());
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&hasher.finalize());
    MarketId(id)
}

// 12.3: market records. the key carries an "enabled" flag, so a status change that flips
// it deletes the old record and writes the new one; exactly one record per id.

pub trait StoredMarket: MarketInfo + Serialize + DeserializeOwned {
    const PREFIX: u8;
}

impl StoredMarket for SpotMarket {
    const PREFIX: u8 = prefix::SPOT_MARKETS;
}

impl StoredMarket for DerivativeMarket {
    const PREFIX: u8 = prefix::DERIVATIVE_MARKETS;
}

impl StoredMarket for BinaryOptionsMarket {
    const PREFIX: u8 = prefix::BINARY_OPTIONS_MARKETS;
}

fn market_record_key<M: StoredMarket>(enabled: bool, id: &MarketId) -> Vec<u8> {
    KeyBuilder::new(M::PREFIX).flag(enabled).bytes(id.as_bytes()).build()
}

pub fn get_market<M: StoredMarket, S: KvStore + ?Sized>(store: &S, id: &MarketId) -> Result<Option<M>, StoreError> {
    if let Some(m) = get_record(store, &market_record_key::<M>(true, id))? {
        return Ok(Some(m));
    }
    get_record(store, &market_record_key::<M>(false, id))
}

pub fn set_market<M: StoredMarket, S: KvStore + ?Sized>(store: &mut S, market: &M) -> Result<(), StoreError> {
    let enabled = market.is_active();
    let id = market.market_id();
    store.delete(&market_record_key::<M>(!enabled, &id));
    set_record(store, &market_record_key::<M>(enabled, &id), market)
}

pub fn all_markets<M: StoredMarket, S: KvStore + ?Sized>(store: &S) -> Result<Vec<M>, StoreError> {
    let mut out = Vec::new();
    iterate_prefix(store, &[M::PREFIX], false, |k, v| {
        out.push(unmarshal::<M>(k, v)?);
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

pub fn get_any_derivative_market<S: KvStore + ?Sized>(store: &S, id: &MarketId) -> Result<Option<AnyDerivativeMarket>, StoreError> {
    if let Some(m) = get_market::<DerivativeMarket, _>(store, id)? {
        return Ok(Some(AnyDerivativeMarket::Derivative(m)));
    }
    Ok(get_market::<BinaryOptionsMarket, _>(store, id)?.map(AnyDerivativeMarket::Binary))
}

pub fn set_any_derivative_market<S: KvStore + ?Sized>(store: &mut S, market: &AnyDerivativeMarket) -> Result<(), StoreError> {
    match market {
        AnyDerivativeMarket::Derivative(m) => set_market(store, m),
        AnyDerivativeMarket::Binary(m) => set_market(store, m),
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::store::MemStore;
    use rust_decimal_macros::dec;

    #[test]
    fn tick_checks() {
        let m = spot();
        assert!(m.validate_price_and_quantity(dec!(10.01), dec!(1.5)).is_ok());
        assert!(matches!(
            m.validate_price_and_quantity(dec!(10.015), dec!(1)),
            Err(MarketError::InvalidPriceTick { .. })
        ));
        assert!(matches!(
            m.validate_price_and_quantity(dec!(10), dec!(1.0005)),
            Err(MarketError::InvalidQuantityTick { .. })
        ));
        assert!(matches!(
            m.validate_price_and_quantity(dec!(0.5), dec!(1)),
            Err(MarketError::BelowMinNotional { .. })
        ));
    }

    #[test]
    fn binary_margin_is_fully_collateralized() {
        let m = binary();
        assert_eq!(m.order_margin_requirement(dec!(0.3), dec!(10), Side::Buy), dec!(3));
        assert_eq!(m.order_margin_requirement(dec!(0.3), dec!(10), Side::Sell), dec!(7));
        assert!(matches!(
            m.validate_price_and_quantity(dec!(1), dec!(1)),
            Err(MarketError::BinaryPriceOutOfRange(_))
        ));
    }

    #[test]
    fn derivative_margin_uses_imr() {
        let m = AnyDerivativeMarket::Derivative(perp());
        assert_eq!(m.order_margin_requirement(dec!(100), dec!(2), Side::Sell), dec!(10));
        assert!(m.is_perpetual());
    }

    #[test]
    fn status_change_keeps_one_record() {
        let mut store = MemStore::new();
        let mut m = perp();
        set_market(&mut store, &m).unwrap();
        m.status = MarketStatus::Paused;
        set_market(&mut store, &m).unwrap();

        assert_eq!(store.len(), 1);
        let loaded: DerivativeMarket = get_market(&store, &m.market_id).unwrap().unwrap();
        assert_eq!(loaded.status, MarketStatus::Paused);
        assert_eq!(all_markets::<DerivativeMarket, _>(&store).unwrap().len(), 1);
    }

    #[test]
    fn validation_rejects_bad_ratios() {
        let mut m = perp();
        m.initial_margin_ratio = dec!(0.01);
        assert!(m.validate().is_err());
        assert!(perp().validate().is_ok());
        assert!(spot().validate().is_ok());
        assert!(binary().validate().is_ok());
    }

    #[test]
    fn ids_are_deterministic() {
        assert_eq!(SpotMarket::derive_id("a", "b"), SpotMarket::derive_id("a", "b"));
        assert_ne!(SpotMarket::derive_id("a", "b"), SpotMarket::derive_id("b", "a"));
    }
}
