//! Ledger invariants and the checker that reconciles them.
//!
//! A violation here means the ledger itself is wrong, never the user. Callers log it at
//! error level and abort the message; it must never be folded into a validation error.

use crate::conditional::all_conditional_orders;
use crate::deposits::all_deposits;
use crate::market_balance::all_market_balances;
use crate::orderbook::{self, BookKind, OrderbookMetadata};
use crate::store::{Ledger, StoreError};
use crate::types::{MarketId, Side, SubaccountId};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("market {market} insolvent: available {available}, delta {delta}")]
    MarketInsolvent {
        market: MarketId,
        available: Decimal,
        delta: Decimal,
    },

    #[error("market {market} balance is negative: {balance}")]
    NegativeMarketBalance { market: MarketId, balance: Decimal },

    #[error("deposit {subaccount}/{denom} out of bounds: available {available}, total {total}")]
    DepositOutOfBounds {
        subaccount: SubaccountId,
        denom: String,
        available: Decimal,
        total: Decimal,
    },

    #[error("metadata mismatch for {market} {side:?} {subaccount}: stored {stored:?}, derived {derived:?}")]
    MetadataMismatch {
        market: MarketId,
        side: Side,
        subaccount: SubaccountId,
        stored: OrderbookMetadata,
        derived: OrderbookMetadata,
    },

    #[error("price level {price} on {market} {side:?}: stored {stored}, resting {resting}")]
    PriceLevelMismatch {
        market: MarketId,
        side: Side,
        price: Decimal,
        stored: Decimal,
        resting: Decimal,
    },

    #[error("open interest on {market} would go negative: {open_interest}")]
    NegativeOpenInterest { market: MarketId, open_interest: Decimal },

    #[error("price level {price} on {market} {side:?} would go negative: {quantity}")]
    NegativePriceLevel {
        market: MarketId,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    },

    #[error("subaccount index points at missing order {0}")]
    DanglingIndex(String),
}

type MetaKey = (MarketId, Side, SubaccountId);

/// Full reconciliation pass over deposits, market balances and both order books.
pub fn check_invariants(ledger: &Ledger) -> Result<(), InvariantViolation> {
    check_deposits(ledger)?;
    check_market_balances(ledger)?;
    check_orderbooks(ledger)
}

pub fn check_deposits(ledger: &Ledger) -> Result<(), InvariantViolation> {
    for (subaccount, denom, deposit) in all_deposits(ledger)? {
        if !deposit.is_within_bounds() {
            return Err(InvariantViolation::DepositOutOfBounds {
                subaccount,
                denom,
                available: deposit.available_balance,
                total: deposit.total_balance,
            });
        }
    }
    Ok(())
}

pub fn check_market_balances(ledger: &Ledger) -> Result<(), InvariantViolation> {
    for (market, balance) in all_market_balances(ledger)? {
        if balance < Decimal::ZERO {
            return Err(InvariantViolation::NegativeMarketBalance { market, balance });
        }
    }
    Ok(())
}

/// Three views of each (market, side, subaccount) must agree: the stored metadata, the
/// metadata rebuilt from the price-keyed records (plus the conditional book), and the
/// metadata rebuilt by walking the subaccount index. Price levels must equal the sum of
/// fillable quantity resting at that price.
pub fn check_orderbooks(ledger: &Ledger) -> Result<(), InvariantViolation> {
    let mut from_orders: BTreeMap<MetaKey, OrderbookMetadata> = BTreeMap::new();
    let mut from_index: BTreeMap<MetaKey, OrderbookMetadata> = BTreeMap::new();
    let mut levels: BTreeMap<(MarketId, Side, Decimal), Decimal> = BTreeMap::new();

    for kind in [BookKind::Spot, BookKind::Derivative] {
        for order in orderbook::all_resting_orders(ledger, kind)? {
            from_orders
                .entry((order.market_id, order.side, order.subaccount_id))
                .or_default()
                .apply_limit_order(order.fillable, order.is_reduce_only, true);
            *levels.entry((order.market_id, order.side, order.price)).or_default() += order.fillable;
        }

        for entry in orderbook::all_index_entries(ledger, kind)? {
            let order = orderbook::resting_order_by_index(ledger, kind, &entry)?
                .ok_or_else(|| InvariantViolation::DanglingIndex(entry.order_hash.to_hex()))?;
            from_index
                .entry((entry.market_id, entry.side, entry.subaccount_id))
                .or_default()
                .apply_limit_order(order.fillable, order.is_reduce_only, true);
        }
    }

    for (market_id, order) in all_conditional_orders(ledger)? {
        from_orders
            .entry((market_id, order.side(), order.order_info.subaccount_id))
            .or_default()
            .apply_conditional_order(order.is_reduce_only(), true);
    }

    let stored = orderbook::all_metadata(ledger)?;

    let keys: BTreeSet<MetaKey> = from_orders
        .keys()
        .chain(from_index.keys())
        .chain(stored.keys())
        .copied()
        .collect();

    for key in keys {
        let derived = from_orders.get(&key).copied().unwrap_or_default();
        let indexed = from_index.get(&key).copied().unwrap_or_default();
        let stored_meta = stored.get(&key).copied().unwrap_or_default();

        let mismatch = if stored_meta != derived {
            Some(stored_meta)
        } else if indexed != derived.limit_part() {
            Some(indexed)
        } else {
            None
        };
        if let Some(other) = mismatch {
            return Err(InvariantViolation::MetadataMismatch {
                market: key.0,
                side: key.1,
                subaccount: key.2,
                stored: other,
                derived,
            });
        }
    }

    let stored_levels = orderbook::all_price_levels(ledger)?;
    let level_keys: BTreeSet<(MarketId, Side, Decimal)> = levels
        .keys()
        .copied()
        .chain(stored_levels.keys().copied())
        .collect();
    for key in level_keys {
        let resting = levels.get(&key).copied().unwrap_or_default();
        let stored_qty = stored_levels.get(&key).copied().unwrap_or_default();
        if stored_qty != resting {
            return Err(InvariantViolation::PriceLevelMismatch {
                market: key.0,
                side: key.1,
                price: key.2,
                stored: stored_qty,
                resting,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deposits::{set_deposit, Deposit};
    use crate::order::{DerivativeLimitOrder, OrderInfo, OrderType};
    use crate::orderbook::{get_metadata, insert_limit_order, set_metadata};
    use crate::types::{Address, OrderHash};
    use rust_decimal_macros::dec;

    const M: MarketId = MarketId([5; 32]);

    fn sub() -> SubaccountId {
        SubaccountId::new(Address([1; 20]), 1)
    }

    fn bid(n: u8, price: Decimal) -> DerivativeLimitOrder {
        DerivativeLimitOrder {
            order_info: OrderInfo::new(sub(), price, dec!(2)),
            order_type: OrderType::Buy,
            margin: dec!(10),
            fillable: dec!(2),
            order_hash: OrderHash([n; 32]),
            trigger_price: None,
            expiration_block: 0,
        }
    }

    #[test]
    fn consistent_book_passes() {
        let mut ledger = Ledger::new();
        insert_limit_order(&mut ledger, &M, &bid(1, dec!(10))).unwrap();
        insert_limit_order(&mut ledger, &M, &bid(2, dec!(10))).unwrap();
        check_invariants(&ledger).unwrap();
    }

    #[test]
    fn tampered_metadata_is_caught() {
        let mut ledger = Ledger::new();
        insert_limit_order(&mut ledger, &M, &bid(1, dec!(10))).unwrap();
        let mut meta = get_metadata(&ledger, &M, Side::Buy, &sub()).unwrap();
        meta.aggregate_vanilla_quantity += dec!(1);
        set_metadata(&mut ledger, &M, Side::Buy, &sub(), &meta).unwrap();

        let err = check_invariants(&ledger).unwrap_err();
        assert!(matches!(err, InvariantViolation::MetadataMismatch { side: Side::Buy, .. }));
    }

    #[test]
    fn available_above_total_is_caught() {
        let mut ledger = Ledger::new();
        let deposit = Deposit {
            available_balance: dec!(5),
            total_balance: dec!(4),
        };
        set_deposit(&mut ledger, &sub(), "usdt", &deposit).unwrap();
        assert!(matches!(
            check_invariants(&ledger).unwrap_err(),
            InvariantViolation::DepositOutOfBounds { .. }
        ));

        // dust under the tolerance is fine
        let dust = Deposit {
            available_balance: dec!(4.0000001),
            total_balance: dec!(4),
        };
        set_deposit(&mut ledger, &sub(), "usdt", &dust).unwrap();
        check_invariants(&ledger).unwrap();
    }
}
