// 8.11 engine/queries.rs: read-only views for hosts, simulations and tests. nothing here
// writes to the ledger.

use super::core::Engine;
use super::results::ExchangeError;
use crate::conditional::{market_conditional_orders, subaccount_conditional_orders, ConditionalOrder};
use crate::deposits::{fee_pool, get_deposit, BankLedger, Deposit};
use crate::funding::{get_funding, get_perpetual_info, PerpetualFunding, PerpetualMarketInfo};
use crate::invariants::check_invariants;
use crate::market::{all_markets, get_any_derivative_market, get_market, AnyDerivativeMarket, BinaryOptionsMarket, DerivativeMarket, SpotMarket};
use crate::market_balance::{get_insurance_fund, get_market_balance, get_open_interest};
use crate::order::{DerivativeLimitOrder, SpotLimitOrder};
use crate::orderbook::{book_orders, subaccount_orders, BookRecord};
use crate::position::{get_position, market_positions, Position};
use crate::settlement::{get_expiry_info, ExpiryFuturesInfo};
use crate::types::{Address, MarketId, Side, SubaccountId};
use crate::validators::{StakingRegistry, ValidatorCache};
use rust_decimal::Decimal;

/// One aggregated price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl Engine {
    // 8.11.1: balances

    pub fn subaccount_deposit(&self, subaccount: &SubaccountId, denom: &str) -> Result<Deposit, ExchangeError> {
        Ok(get_deposit(&self.ledger, subaccount, denom)?)
    }

    pub fn bank_balance(&self, owner: &Address, denom: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.ledger.bank_balance(owner, denom)?)
    }

    pub fn fee_pool(&self, denom: &str) -> Result<Decimal, ExchangeError> {
        Ok(fee_pool(&self.ledger, denom)?)
    }

    // 8.11.2: markets

    pub fn spot_market(&self, id: &MarketId) -> Result<Option<SpotMarket>, ExchangeError> {
        Ok(get_market(&self.ledger, id)?)
    }

    pub fn derivative_market(&self, id: &MarketId) -> Result<Option<AnyDerivativeMarket>, ExchangeError> {
        Ok(get_any_derivative_market(&self.ledger, id)?)
    }

    pub fn spot_markets(&self) -> Result<Vec<SpotMarket>, ExchangeError> {
        Ok(all_markets(&self.ledger)?)
    }

    pub fn derivative_markets(&self) -> Result<Vec<DerivativeMarket>, ExchangeError> {
        Ok(all_markets(&self.ledger)?)
    }

    pub fn binary_options_markets(&self) -> Result<Vec<BinaryOptionsMarket>, ExchangeError> {
        Ok(all_markets(&self.ledger)?)
    }

    pub fn market_balance(&self, id: &MarketId) -> Result<Decimal, ExchangeError> {
        Ok(get_market_balance(&self.ledger, id)?)
    }

    pub fn insurance_fund(&self, id: &MarketId) -> Result<Decimal, ExchangeError> {
        Ok(get_insurance_fund(&self.ledger, id)?)
    }

    pub fn open_interest(&self, id: &MarketId) -> Result<Decimal, ExchangeError> {
        Ok(get_open_interest(&self.ledger, id)?)
    }

    pub fn perpetual_info(&self, id: &MarketId) -> Result<Option<PerpetualMarketInfo>, ExchangeError> {
        Ok(get_perpetual_info(&self.ledger, id)?)
    }

    pub fn funding_state(&self, id: &MarketId) -> Result<PerpetualFunding, ExchangeError> {
        Ok(get_funding(&self.ledger, id)?)
    }

    pub fn expiry_info(&self, id: &MarketId) -> Result<Option<ExpiryFuturesInfo>, ExchangeError> {
        Ok(get_expiry_info(&self.ledger, id)?)
    }

    // 8.11.3: positions

    /// The stored position, funding not yet applied.
    pub fn position(&self, market: &MarketId, subaccount: &SubaccountId) -> Result<Option<Position>, ExchangeError> {
        Ok(get_position(&self.ledger, market, subaccount)?.filter(|p| !p.is_empty()))
    }

    pub fn positions(&self, market: &MarketId) -> Result<Vec<(SubaccountId, Position)>, ExchangeError> {
        Ok(market_positions(&self.ledger, market)?
            .into_iter()
            .filter(|(_, p)| !p.is_empty())
            .collect())
    }

    // 8.11.4: books

    pub fn spot_orders(&self, market: &MarketId, side: Side) -> Result<Vec<SpotLimitOrder>, ExchangeError> {
        Ok(book_orders(&self.ledger, market, side)?)
    }

    pub fn derivative_orders(&self, market: &MarketId, side: Side) -> Result<Vec<DerivativeLimitOrder>, ExchangeError> {
        Ok(book_orders(&self.ledger, market, side)?)
    }

    /// Both sides of one subaccount's resting orders, bids first.
    pub fn subaccount_orders<O: BookRecord>(&self, market: &MarketId, subaccount: &SubaccountId) -> Result<Vec<O>, ExchangeError> {
        let mut out = subaccount_orders(&self.ledger, market, Side::Buy, subaccount)?;
        out.extend(subaccount_orders(&self.ledger, market, Side::Sell, subaccount)?);
        Ok(out)
    }

    pub fn conditional_orders(&self, market: &MarketId) -> Result<Vec<ConditionalOrder>, ExchangeError> {
        Ok(market_conditional_orders(&self.ledger, market)?)
    }

    pub fn subaccount_conditional_orders(&self, market: &MarketId, subaccount: &SubaccountId) -> Result<Vec<ConditionalOrder>, ExchangeError> {
        Ok(subaccount_conditional_orders(&self.ledger, market, subaccount)?)
    }

    /// Aggregated levels of one side, best price first, at most `limit` of them.
    pub fn depth(&self, market: &MarketId, side: Side, limit: usize) -> Result<Vec<DepthLevel>, ExchangeError> {
        let mut levels: Vec<DepthLevel> = crate::orderbook::all_price_levels(&self.ledger)?
            .into_iter()
            .filter(|((m, s, _), quantity)| m == market && *s == side && !quantity.is_zero())
            .map(|((_, _, price), quantity)| DepthLevel { price, quantity })
            .collect();
        if side.is_buy() {
            levels.reverse();
        }
        levels.truncate(limit);
        Ok(levels)
    }

    pub fn price_level(&self, market: &MarketId, side: Side, price: Decimal) -> Result<Decimal, ExchangeError> {
        Ok(crate::orderbook::price_level_quantity(&self.ledger, market, side, price)?)
    }

    // 8.11.5: checks and collaborators

    /// Reconciles the order book aggregates, deposits and market balances.
    pub fn check_invariants(&self) -> Result<(), ExchangeError> {
        Ok(check_invariants(&self.ledger)?)
    }

    /// Staked value of `delegator` over bonded validators, through a cache that lives
    /// only as long as this call.
    pub fn staked_amount<R: StakingRegistry + ?Sized>(&self, registry: &R, delegator: &Address) -> Decimal {
        ValidatorCache::new(registry).staked_amount(delegator)
    }
}
