// 8.3 engine/pricing.rs: where the engine gets its prices. mark prices come from the
// oracle, the mid price from the resting book.

use super::core::Engine;
use super::results::ExchangeError;
use crate::market::{AnyDerivativeMarket, MarketInfo};
use crate::oracle;
use crate::orderbook;
use crate::types::MarketId;
use rust_decimal::Decimal;

impl Engine {
    pub fn mark_price(&self, market: &AnyDerivativeMarket) -> Option<Decimal> {
        oracle::mark_price(self.oracle(), market)
    }

    pub(super) fn require_mark_price(&self, market: &AnyDerivativeMarket) -> Result<Decimal, ExchangeError> {
        self.mark_price(market)
            .ok_or_else(|| ExchangeError::NoMarkPrice(market.market_id()))
    }

    /// Midpoint of the best bid and ask; none while either side is empty.
    pub fn mid_price(&self, market_id: &MarketId) -> Result<Option<Decimal>, ExchangeError> {
        Ok(orderbook::mid_price(&self.ledger, market_id)?)
    }
}
