// 13.0 settlement.rs: closing every position of a derivative or binary market at one price.
// 13.1 has the schedules (expiry futures, admin-forced settlements), 13.2 the payout plan
// with its socialized-loss haircut, 13.3 the routine that writes it to the ledger.
//
// timestamp-triggered and forced settlement both end in settle_positions, so the two
// paths can't drift apart on margin accounting.

use crate::deposits::{credit, DepositError};
use crate::funding::cumulative_funding;
use crate::invariants::InvariantViolation;
use crate::keys::{market_key, prefix};
use crate::market::BINARY_OPTIONS_REFUND_FLAG_PRICE;
use crate::market_balance::{apply_market_balance_delta, available_market_funds, clear_market_balance, clear_open_interest, fund_insurance};
use crate::position::{market_positions, set_position, Position};
use crate::store::{get_record, iterate_prefix, set_record, unmarshal, KvStore, Ledger, StoreError};
use crate::types::{MarketId, SubaccountId};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Deposit(#[from] DepositError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// 13.1: schedules

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryFuturesInfo {
    pub market_id: MarketId,
    pub expiration_timestamp: i64,
    /// recorded once the market has settled
    #[serde(default)]
    pub settlement_price: Option<Decimal>,
}

pub fn get_expiry_info(ledger: &Ledger, market: &MarketId) -> Result<Option<ExpiryFuturesInfo>, StoreError> {
    get_record(ledger, &market_key(prefix::EXPIRY_FUTURES_INFO, market))
}

pub fn set_expiry_info(ledger: &mut Ledger, info: &ExpiryFuturesInfo) -> Result<(), StoreError> {
    set_record(ledger, &market_key(prefix::EXPIRY_FUTURES_INFO, &info.market_id), info)
}

pub fn all_expiry_infos(ledger: &Ledger) -> Result<Vec<ExpiryFuturesInfo>, StoreError> {
    let mut out = Vec::new();
    iterate_prefix(ledger, &[prefix::EXPIRY_FUTURES_INFO], false, |k, v| {
        out.push(unmarshal::<ExpiryFuturesInfo>(k, v)?);
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

/// A settlement requested by the admin, picked up by the next begin_block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSettlement {
    pub market_id: MarketId,
    /// none = settle at the oracle price
    pub settlement_price: Option<Decimal>,
}

pub fn schedule_settlement(ledger: &mut Ledger, scheduled: &ScheduledSettlement) -> Result<(), StoreError> {
    set_record(ledger, &market_key(prefix::SCHEDULED_SETTLEMENT, &scheduled.market_id), scheduled)
}

pub fn scheduled_settlements(ledger: &Ledger) -> Result<Vec<ScheduledSettlement>, StoreError> {
    let mut out = Vec::new();
    iterate_prefix(ledger, &[prefix::SCHEDULED_SETTLEMENT], false, |k, v| {
        out.push(unmarshal::<ScheduledSettlement>(k, v)?);
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

pub fn clear_scheduled_settlement(ledger: &mut Ledger, market: &MarketId) {
    ledger.delete(&market_key(prefix::SCHEDULED_SETTLEMENT, market));
}

/// Clamps a binary oracle value into [0, 1]; no value at all means refund.
pub fn binary_settlement_price(oracle_price: Option<Decimal>) -> Decimal {
    match oracle_price {
        Some(p) if p == BINARY_OPTIONS_REFUND_FLAG_PRICE => p,
        Some(p) => p.max(Decimal::ZERO).min(Decimal::ONE),
        None => BINARY_OPTIONS_REFUND_FLAG_PRICE,
    }
}

// 13.2: payout plan

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementPlan {
    pub payouts: Vec<(SubaccountId, Decimal)>,
    /// share of each positive payout actually paid
    pub payout_ratio: Decimal,
    pub total_paid: Decimal,
}

/// Pays every position `margin + pnl` at `price` (or just its margin on refund). When the
/// positive payouts exceed `available`, each is cut by the same ratio.
pub fn plan_settlement(positions: &[(SubaccountId, Position)], price: Decimal, refund: bool, available: Decimal) -> SettlementPlan {
    let raw: Vec<(SubaccountId, Decimal)> = positions
        .iter()
        .map(|(sub, pos)| {
            let payout = if refund { pos.margin } else { pos.settlement_payout(price) };
            (*sub, payout.max(Decimal::ZERO))
        })
        .collect();

    let owed: Decimal = raw.iter().map(|(_, p)| *p).sum();
    let available = available.max(Decimal::ZERO);
    let payout_ratio = if owed > available && !owed.is_zero() {
        (available / owed).round_dp_with_strategy(18, RoundingStrategy::ToZero)
    } else {
        Decimal::ONE
    };

    let payouts: Vec<(SubaccountId, Decimal)> = raw
        .into_iter()
        .map(|(sub, p)| {
            let paid = if payout_ratio == Decimal::ONE {
                p
            } else {
                (p * payout_ratio).round_dp_with_strategy(18, RoundingStrategy::ToZero)
            };
            (sub, paid)
        })
        .collect();
    let total_paid = payouts.iter().map(|(_, p)| *p).sum();

    SettlementPlan {
        payouts,
        payout_ratio,
        total_paid,
    }
}

// 13.3: ledger side

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementOutcome {
    pub plan: SettlementPlan,
    /// the positions as they were just before closing, funding applied
    pub closed: Vec<(SubaccountId, Position)>,
    /// market balance left over and moved to insurance
    pub surplus: Decimal,
}

/// Closes every position of `market` at `price`, credits payouts in `quote_denom` and
/// clears the market balance and open interest. A refund price returns each position's
/// margin instead.
pub fn settle_positions(ledger: &mut Ledger, market: &MarketId, quote_denom: &str, price: Decimal) -> Result<SettlementOutcome, SettlementError> {
    let refund = price == BINARY_OPTIONS_REFUND_FLAG_PRICE;
    let funding = cumulative_funding(ledger, market)?;

    let mut positions = market_positions(ledger, market)?;
    for (_, position) in positions.iter_mut() {
        position.apply_funding(funding);
    }

    let available = available_market_funds(ledger, market)?;
    let plan = plan_settlement(&positions, price, refund, available);

    for ((sub, _), (_, paid)) in positions.iter().zip(plan.payouts.iter()) {
        credit(ledger, sub, quote_denom, *paid)?;
        set_position(ledger, market, sub, &Position::new(true, funding))?;
    }

    apply_market_balance_delta(ledger, market, -plan.total_paid)?;
    let surplus = clear_market_balance(ledger, market)?;
    if surplus > Decimal::ZERO {
        fund_insurance(ledger, market, surplus)?;
    }
    clear_open_interest(ledger, market);

    Ok(SettlementOutcome {
        plan,
        closed: positions,
        surplus,
    })
}
