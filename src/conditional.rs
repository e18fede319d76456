//! Conditional orders: stop and take-profit orders waiting on the mark price.
//!
//! Conditional orders are stored separately from the order book and only become
//! active when the mark price reaches their trigger. Each market has two trigger books:
//! orders placed with a trigger above the mark (fire once the mark rises to it) and
//! orders placed below (fire once the mark falls to it). Both are sorted by trigger price
//! so a block only ever reads the orders that actually fire.

use crate::keys::{
    add_bit_to_prefix, conditional_index_key, conditional_order_key, conditional_side_prefix, encode_unsigned_dec,
    prefix,
};
use crate::order::{OrderInfo, OrderType};
use crate::orderbook::{get_metadata, release_cid, reserve_cid, set_metadata, CidRecord};
use crate::store::{get_record, iterate_prefix, iterate_safe, set_record, unmarshal, KvStore, Ledger, StoreError};
use crate::types::{MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How the trigger price compares with the mark price at placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    /// Trigger was above the mark; fires when the mark rises to it.
    Above,
    /// Trigger was at or below the mark; fires when the mark falls to it.
    Below,
}

impl TriggerCondition {
    pub fn for_placement(trigger_price: Decimal, mark_price: Decimal) -> Self {
        if trigger_price > mark_price {
            TriggerCondition::Above
        } else {
            TriggerCondition::Below
        }
    }

    pub fn is_triggered(&self, trigger_price: Decimal, mark_price: Decimal) -> bool {
        match self {
            TriggerCondition::Above => mark_price >= trigger_price,
            TriggerCondition::Below => mark_price <= trigger_price,
        }
    }

    fn is_higher(&self) -> bool {
        matches!(self, TriggerCondition::Above)
    }
}

/// A conditional order waiting to be triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalOrder {
    pub order_info: OrderInfo,
    pub order_type: OrderType,
    /// zero = reduce-only
    pub margin: Decimal,
    pub trigger_price: Decimal,
    pub condition: TriggerCondition,
    /// limit orders rest once triggered; market orders execute at once
    pub is_limit: bool,
    pub order_hash: OrderHash,
}

impl ConditionalOrder {
    pub fn side(&self) -> Side {
        self.order_type.side()
    }

    pub fn is_reduce_only(&self) -> bool {
        self.margin.is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct IndexValue {
    condition: TriggerCondition,
    trigger_price: Decimal,
}

fn order_key(market: &MarketId, order: &ConditionalOrder) -> Vec<u8> {
    conditional_order_key(market, order.condition.is_higher(), order.trigger_price, &order.order_hash)
}

pub fn insert_conditional_order(ledger: &mut Ledger, market: &MarketId, order: &ConditionalOrder) -> Result<(), StoreError> {
    let sub = order.order_info.subaccount_id;
    set_record(ledger, &order_key(market, order), order)?;
    set_record(
        ledger,
        &conditional_index_key(market, &sub, &order.order_hash),
        &IndexValue {
            condition: order.condition,
            trigger_price: order.trigger_price,
        },
    )?;

    let side = order.side();
    let mut meta = get_metadata(ledger, market, side, &sub)?;
    meta.apply_conditional_order(order.is_reduce_only(), true);
    set_metadata(ledger, market, side, &sub, &meta)?;

    reserve_cid(
        ledger,
        false,
        market,
        &sub,
        &order.order_info.cid,
        CidRecord {
            order_hash: order.order_hash,
            side,
        },
    )
}

pub fn remove_conditional_order(ledger: &mut Ledger, market: &MarketId, order: &ConditionalOrder) -> Result<(), StoreError> {
    let sub = order.order_info.subaccount_id;
    ledger.delete(&order_key(market, order));
    ledger.delete(&conditional_index_key(market, &sub, &order.order_hash));

    let side = order.side();
    let mut meta = get_metadata(ledger, market, side, &sub)?;
    meta.apply_conditional_order(order.is_reduce_only(), false);
    set_metadata(ledger, market, side, &sub, &meta)?;

    release_cid(ledger, market, &sub, &order.order_info.cid);
    Ok(())
}

pub fn find_conditional_order(
    ledger: &Ledger,
    market: &MarketId,
    subaccount: &SubaccountId,
    hash: &OrderHash,
) -> Result<Option<ConditionalOrder>, StoreError> {
    let index_key = conditional_index_key(market, subaccount, hash);
    let Some(entry) = get_record::<_, IndexValue>(ledger, &index_key)? else {
        return Ok(None);
    };
    get_record(
        ledger,
        &conditional_order_key(market, entry.condition.is_higher(), entry.trigger_price, hash),
    )
}

pub fn subaccount_conditional_orders(
    ledger: &Ledger,
    market: &MarketId,
    subaccount: &SubaccountId,
) -> Result<Vec<ConditionalOrder>, StoreError> {
    let mut index_prefix = conditional_index_key(market, subaccount, &OrderHash::default());
    index_prefix.truncate(index_prefix.len() - OrderHash::LEN);

    let mut hashes = Vec::new();
    iterate_prefix(ledger, &index_prefix, false, |k, _| {
        let hash = OrderHash::from_slice(&k[index_prefix.len()..]).ok_or_else(|| StoreError::corrupted(k, "bad index key"))?;
        hashes.push(hash);
        Ok::<bool, StoreError>(false)
    })?;

    let mut out = Vec::with_capacity(hashes.len());
    for hash in hashes {
        match find_conditional_order(ledger, market, subaccount, &hash)? {
            Some(order) => out.push(order),
            None => return Err(StoreError::corrupted(hash.as_bytes(), "conditional index without order")),
        }
    }
    Ok(out)
}

/// Every conditional order in one market, both trigger books.
pub fn market_conditional_orders(ledger: &Ledger, market: &MarketId) -> Result<Vec<ConditionalOrder>, StoreError> {
    let mut out = Vec::new();
    for higher in [true, false] {
        iterate_prefix(ledger, &conditional_side_prefix(market, higher), false, |k, v| {
            out.push(unmarshal::<ConditionalOrder>(k, v)?);
            Ok::<bool, StoreError>(false)
        })?;
    }
    Ok(out)
}

pub fn all_conditional_orders(ledger: &Ledger) -> Result<Vec<(MarketId, ConditionalOrder)>, StoreError> {
    let mut out = Vec::new();
    iterate_prefix(ledger, &[prefix::CONDITIONAL_ORDERS], false, |k, v| {
        let market = k
            .get(1..33)
            .and_then(MarketId::from_slice)
            .ok_or_else(|| StoreError::corrupted(k, "bad conditional key"))?;
        out.push((market, unmarshal::<ConditionalOrder>(k, v)?));
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

/// Orders the mark price has reached, higher book first (ascending trigger), then the
/// lower book (descending trigger).
pub fn triggered_orders(ledger: &Ledger, market: &MarketId, mark_price: Decimal) -> Result<Vec<ConditionalOrder>, StoreError> {
    let mut out = Vec::new();
    let mut collect = |k: &[u8], v: &[u8]| {
        out.push(unmarshal::<ConditionalOrder>(k, v)?);
        Ok::<bool, StoreError>(false)
    };

    // higher book: every trigger <= mark. `prefix ‖ mark` bumped by one covers all hashes at mark
    let higher = conditional_side_prefix(market, true);
    let mut up_to_mark = higher.clone();
    up_to_mark.extend_from_slice(&encode_unsigned_dec(mark_price));
    let end = add_bit_to_prefix(&up_to_mark);
    iterate_safe(ledger, Some(higher.as_slice()), end.as_deref(), false, &mut collect)?;

    // lower book: every trigger >= mark, highest first
    let lower = conditional_side_prefix(market, false);
    let mut from_mark = lower.clone();
    from_mark.extend_from_slice(&encode_unsigned_dec(mark_price));
    let end = add_bit_to_prefix(&lower);
    iterate_safe(ledger, Some(from_mark.as_slice()), end.as_deref(), true, &mut collect)?;

    Ok(out)
}

pub fn has_conditional_order(ledger: &Ledger, market: &MarketId, subaccount: &SubaccountId, hash: &OrderHash) -> bool {
    ledger.has(&conditional_index_key(market, subaccount, hash))
}
