// 12.0: price oracle. the ledger never fetches prices itself. the host pushes them into
// a PriceOracle and the engine reads mark prices through it.
//
// derivative markets price off (oracle_base, oracle_quote); binary options off
// (oracle_symbol, oracle_provider).

use crate::market::{AnyDerivativeMarket, BinaryOptionsMarket, DerivativeMarket};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Implement this to back the engine with a real oracle module.
pub trait PriceOracle: Send + Sync {
    fn price(&self, base: &str, quote: &str) -> Option<Decimal>;
}

/// Shared in-memory price table. clones see the same prices.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOracle {
    prices: Arc<RwLock<HashMap<(String, String), Decimal>>>,
}

impl InMemoryOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, base: &str, quote: &str, price: Decimal) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert((base.to_string(), quote.to_string()), price);
        }
    }

    pub fn remove_price(&self, base: &str, quote: &str) {
        if let Ok(mut prices) = self.prices.write() {
            prices.remove(&(base.to_string(), quote.to_string()));
        }
    }
}

impl PriceOracle for InMemoryOracle {
    fn price(&self, base: &str, quote: &str) -> Option<Decimal> {
        let prices = self.prices.read().ok()?;
        prices.get(&(base.to_string(), quote.to_string())).copied()
    }
}

pub fn derivative_mark_price(oracle: &dyn PriceOracle, market: &DerivativeMarket) -> Option<Decimal> {
    oracle
        .price(&market.oracle_base, &market.oracle_quote)
        .filter(|p| *p > Decimal::ZERO)
}

/// Raw oracle value for a binary market; may sit outside [0, 1].
pub fn binary_oracle_price(oracle: &dyn PriceOracle, market: &BinaryOptionsMarket) -> Option<Decimal> {
    oracle.price(&market.oracle_symbol, &market.oracle_provider)
}

pub fn mark_price(oracle: &dyn PriceOracle, market: &AnyDerivativeMarket) -> Option<Decimal> {
    match market {
        AnyDerivativeMarket::Derivative(m) => derivative_mark_price(oracle, m),
        AnyDerivativeMarket::Binary(m) => binary_oracle_price(oracle, m).map(|p| p.max(Decimal::ZERO).min(Decimal::ONE)),
    }
}
