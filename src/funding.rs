// 7.0: perpetual funding. each interval longs pay shorts (or the reverse) so the book
// tracks the oracle. 7.0 holds the records, 7.1 the rate calculation.
//
// funding is never pushed to positions. the market keeps one cumulative counter and each
// position settles the difference against its own cursor the next time it is touched
// (Position::apply_funding).

use crate::keys::{market_key, prefix};
use crate::store::{get_record, iterate_prefix, set_record, unmarshal, Ledger, StoreError};
use crate::types::MarketId;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FUNDING_INTERVAL: i64 = 3_600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpetualMarketInfo {
    pub market_id: MarketId,
    pub hourly_funding_rate_cap: Decimal,
    pub hourly_interest_rate: Decimal,
    /// seconds
    pub funding_interval: i64,
    pub next_funding_timestamp: i64,
}

impl PerpetualMarketInfo {
    pub fn new(market_id: MarketId, launch_time: i64) -> Self {
        Self {
            market_id,
            hourly_funding_rate_cap: dec!(0.000625),
            hourly_interest_rate: dec!(0.00000416666),
            funding_interval: DEFAULT_FUNDING_INTERVAL,
            next_funding_timestamp: next_boundary(launch_time, DEFAULT_FUNDING_INTERVAL),
        }
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.next_funding_timestamp <= now
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpetualFunding {
    pub cumulative_funding: Decimal,
    pub last_rate: Decimal,
    pub last_timestamp: i64,
}

/// First interval boundary strictly after `time`.
pub fn next_boundary(time: i64, interval: i64) -> i64 {
    if interval <= 0 {
        return time;
    }
    (time.div_euclid(interval) + 1) * interval
}

pub fn get_perpetual_info(ledger: &Ledger, market: &MarketId) -> Result<Option<PerpetualMarketInfo>, StoreError> {
    get_record(ledger, &market_key(prefix::PERPETUAL_INFO, market))
}

pub fn set_perpetual_info(ledger: &mut Ledger, info: &PerpetualMarketInfo) -> Result<(), StoreError> {
    set_record(ledger, &market_key(prefix::PERPETUAL_INFO, &info.market_id), info)
}

pub fn all_perpetual_infos(ledger: &Ledger) -> Result<Vec<PerpetualMarketInfo>, StoreError> {
    let mut out = Vec::new();
    iterate_prefix(ledger, &[prefix::PERPETUAL_INFO], false, |k, v| {
        out.push(unmarshal::<PerpetualMarketInfo>(k, v)?);
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

pub fn get_funding(ledger: &Ledger, market: &MarketId) -> Result<PerpetualFunding, StoreError> {
    Ok(get_record(ledger, &market_key(prefix::PERPETUAL_FUNDING, market))?.unwrap_or_default())
}

pub fn set_funding(ledger: &mut Ledger, market: &MarketId, funding: &PerpetualFunding) -> Result<(), StoreError> {
    set_record(ledger, &market_key(prefix::PERPETUAL_FUNDING, market), funding)
}

/// Cumulative funding a position in this market settles against. Zero for anything that
/// is not a perpetual.
pub fn cumulative_funding(ledger: &Ledger, market: &MarketId) -> Result<Decimal, StoreError> {
    Ok(get_funding(ledger, market)?.cumulative_funding)
}

// 7.1: rate. positive = longs pay

/// `(mid - mark) / mark`, or zero when the book is one-sided.
pub fn premium(mid_price: Option<Decimal>, mark_price: Decimal) -> Decimal {
    match mid_price {
        Some(mid) if !mark_price.is_zero() => (mid - mark_price) / mark_price,
        _ => Decimal::ZERO,
    }
}

pub fn funding_rate(premium: Decimal, info: &PerpetualMarketInfo) -> Decimal {
    let cap = info.hourly_funding_rate_cap;
    (premium + info.hourly_interest_rate).max(-cap).min(cap)
}

/// Advances one funding interval: accrues `rate × mark` and moves the schedule on.
pub fn advance_funding(
    info: &mut PerpetualMarketInfo,
    state: &mut PerpetualFunding,
    mid_price: Option<Decimal>,
    mark_price: Decimal,
    now: i64,
) -> Decimal {
    let rate = funding_rate(premium(mid_price, mark_price), info);
    state.cumulative_funding += rate * mark_price;
    state.last_rate = rate;
    state.last_timestamp = now;
    info.next_funding_timestamp = next_boundary(now, info.funding_interval);
    rate
}
