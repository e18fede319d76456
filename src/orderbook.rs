//! Order book index over the committed and transient stores.
//!
//! A resting limit order is four writes that must always move together:
//!
//! * the primary record under `(market ‖ side ‖ price ‖ hash)`,
//! * a subaccount index entry under `(market ‖ side ‖ subaccount ‖ hash)` holding the
//!   price key, so lookups by hash never scan the book,
//! * the aggregate quantity of its price level (mirrored into the transient store so the
//!   block emits one update per changed level),
//! * the `(market, side, subaccount)` metadata counters.
//!
//! [`insert_limit_order`] and [`remove_limit_order`] are the only writers. Buy books are
//! read highest price first (reverse scan), sell books lowest first.

use crate::invariants::InvariantViolation;
use crate::keys::{
    add_bit_to_prefix, cid_key, decode_unsigned_dec, encode_unsigned_dec, expiration_market_prefix,
    expiration_orders_prefix, limit_order_key, limit_order_side_prefix, market_side_subaccount_key,
    market_subaccount_key, prefix, price_and_hash_suffix, price_level_key, split_price_and_hash, subaccount_order_key,
    subaccount_order_prefix, KeyBuilder, UNSIGNED_DEC_LEN,
};
use crate::order::{BookOrder, DerivativeLimitOrder, MarketOrder, SpotLimitOrder};
use crate::store::{
    collect_prefix, get_record, get_unsigned_dec, iterate_prefix, iterate_safe, set_record, set_unsigned_dec,
    unmarshal, KvStore, Ledger, StoreError,
};
use crate::types::{MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;

/// Which flavour of book a record lives in. Binary options share the derivative book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookKind {
    Spot,
    Derivative,
}

impl BookKind {
    fn limit_prefix(self) -> u8 {
        match self {
            BookKind::Spot => prefix::SPOT_LIMIT_ORDERS,
            BookKind::Derivative => prefix::DERIVATIVE_LIMIT_ORDERS,
        }
    }

    fn index_prefix(self) -> u8 {
        match self {
            BookKind::Spot => prefix::SPOT_ORDER_INDEX,
            BookKind::Derivative => prefix::DERIVATIVE_ORDER_INDEX,
        }
    }

    fn market_order_prefix(self) -> u8 {
        match self {
            BookKind::Spot => prefix::TRANSIENT_SPOT_MARKET_ORDERS,
            BookKind::Derivative => prefix::TRANSIENT_DERIVATIVE_MARKET_ORDERS,
        }
    }
}

/// Record types that can rest in a book.
pub trait BookRecord: BookOrder + Serialize + DeserializeOwned + Clone {
    const KIND: BookKind;
}

impl BookRecord for SpotLimitOrder {
    const KIND: BookKind = BookKind::Spot;
}

impl BookRecord for DerivativeLimitOrder {
    const KIND: BookKind = BookKind::Derivative;
}

fn side_from_byte(b: u8) -> Option<Side> {
    match b {
        1 => Some(Side::Buy),
        0 => Some(Side::Sell),
        _ => None,
    }
}

// 4.0: per-subaccount aggregates

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderbookMetadata {
    pub vanilla_limit_order_count: u32,
    pub reduce_only_limit_order_count: u32,
    pub aggregate_vanilla_quantity: Decimal,
    pub aggregate_reduce_only_quantity: Decimal,
    pub vanilla_conditional_order_count: u32,
    pub reduce_only_conditional_order_count: u32,
}

fn bump(count: u32, add: bool) -> u32 {
    if add {
        count.saturating_add(1)
    } else {
        count.saturating_sub(1)
    }
}

impl OrderbookMetadata {
    pub fn apply_limit_order(&mut self, quantity: Decimal, is_reduce_only: bool, add: bool) {
        let delta = if add { quantity } else { -quantity };
        if is_reduce_only {
            self.reduce_only_limit_order_count = bump(self.reduce_only_limit_order_count, add);
            self.aggregate_reduce_only_quantity += delta;
        } else {
            self.vanilla_limit_order_count = bump(self.vanilla_limit_order_count, add);
            self.aggregate_vanilla_quantity += delta;
        }
    }

    pub fn apply_conditional_order(&mut self, is_reduce_only: bool, add: bool) {
        if is_reduce_only {
            self.reduce_only_conditional_order_count = bump(self.reduce_only_conditional_order_count, add);
        } else {
            self.vanilla_conditional_order_count = bump(self.vanilla_conditional_order_count, add);
        }
    }

    /// The counters derived from resting limit orders only.
    pub fn limit_part(&self) -> Self {
        Self {
            vanilla_conditional_order_count: 0,
            reduce_only_conditional_order_count: 0,
            ..*self
        }
    }

    pub fn has_limit_orders(&self) -> bool {
        self.vanilla_limit_order_count + self.reduce_only_limit_order_count > 0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub fn get_metadata(
    ledger: &Ledger,
    market: &MarketId,
    side: Side,
    subaccount: &SubaccountId,
) -> Result<OrderbookMetadata, StoreError> {
    let key = market_side_subaccount_key(prefix::ORDERBOOK_METADATA, market, side, subaccount);
    Ok(get_record(ledger, &key)?.unwrap_or_default())
}

pub fn set_metadata(
    ledger: &mut Ledger,
    market: &MarketId,
    side: Side,
    subaccount: &SubaccountId,
    metadata: &OrderbookMetadata,
) -> Result<(), StoreError> {
    let key = market_side_subaccount_key(prefix::ORDERBOOK_METADATA, market, side, subaccount);
    if metadata.is_empty() {
        ledger.delete(&key);
        Ok(())
    } else {
        set_record(ledger, &key, metadata)
    }
}

fn parse_metadata_key(key: &[u8]) -> Option<(MarketId, Side, SubaccountId)> {
    let body = key.get(1..)?;
    if body.len() != MarketId::LEN + 1 + SubaccountId::LEN {
        return None;
    }
    Some((
        MarketId::from_slice(&body[..32])?,
        side_from_byte(body[32])?,
        SubaccountId::from_slice(&body[33..])?,
    ))
}

pub fn all_metadata(
    ledger: &Ledger,
) -> Result<BTreeMap<(MarketId, Side, SubaccountId), OrderbookMetadata>, StoreError> {
    let mut out = BTreeMap::new();
    iterate_prefix(ledger, &[prefix::ORDERBOOK_METADATA], false, |k, v| {
        let parsed = parse_metadata_key(k).ok_or_else(|| StoreError::corrupted(k, "bad metadata key"))?;
        out.insert(parsed, unmarshal::<OrderbookMetadata>(k, v)?);
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

// 4.1: price levels

/// A level only drops by what rests on it, so going below zero means the aggregate and the
/// orders have drifted apart.
fn adjust_price_level(
    ledger: &mut Ledger,
    market: &MarketId,
    side: Side,
    price: Decimal,
    delta: Decimal,
) -> Result<(), InvariantViolation> {
    let key = price_level_key(prefix::PRICE_LEVELS, market, side, price);
    let next = get_unsigned_dec(ledger, &key)? + delta;
    if next < Decimal::ZERO {
        error!(market = %market, ?side, %price, %delta, "price level would go negative");
        return Err(InvariantViolation::NegativePriceLevel {
            market: *market,
            side,
            price,
            quantity: next,
        });
    }
    set_unsigned_dec(ledger, &key, next);

    // zero is written explicitly so the block's update still reports the removed level
    let transient_key = price_level_key(prefix::TRANSIENT_PRICE_LEVELS, market, side, price);
    ledger.transient_mut().set(&transient_key, encode_unsigned_dec(next).to_vec());
    Ok(())
}

pub fn price_level_quantity(ledger: &Ledger, market: &MarketId, side: Side, price: Decimal) -> Result<Decimal, StoreError> {
    get_unsigned_dec(ledger, &price_level_key(prefix::PRICE_LEVELS, market, side, price))
}

fn parse_level_key(key: &[u8]) -> Option<(MarketId, Side, Decimal)> {
    let body = key.get(1..)?;
    if body.len() != MarketId::LEN + 1 + UNSIGNED_DEC_LEN {
        return None;
    }
    Some((
        MarketId::from_slice(&body[..32])?,
        side_from_byte(body[32])?,
        decode_unsigned_dec(&body[33..]).ok()?,
    ))
}

fn collect_levels<S: KvStore + ?Sized>(
    store: &S,
    level_prefix: u8,
) -> Result<BTreeMap<(MarketId, Side, Decimal), Decimal>, StoreError> {
    let mut out = BTreeMap::new();
    iterate_prefix(store, &[level_prefix], false, |k, v| {
        let level = parse_level_key(k).ok_or_else(|| StoreError::corrupted(k, "bad price level key"))?;
        let quantity = decode_unsigned_dec(v).map_err(|e| StoreError::corrupted(k, e))?;
        out.insert(level, quantity);
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

pub fn all_price_levels(ledger: &Ledger) -> Result<BTreeMap<(MarketId, Side, Decimal), Decimal>, StoreError> {
    collect_levels(ledger, prefix::PRICE_LEVELS)
}

/// Levels touched this block with their closing quantity (zero = level removed).
pub fn changed_price_levels(ledger: &Ledger) -> Result<BTreeMap<(MarketId, Side, Decimal), Decimal>, StoreError> {
    collect_levels(ledger.transient(), prefix::TRANSIENT_PRICE_LEVELS)
}

/// Best resting price on one side, read from the level aggregates.
pub fn best_price(ledger: &Ledger, market: &MarketId, side: Side) -> Result<Option<Decimal>, StoreError> {
    let side_prefix = limit_order_side_prefix(prefix::PRICE_LEVELS, market, side);
    let mut best = None;
    iterate_prefix(ledger, &side_prefix, side.is_buy(), |k, _| {
        best = parse_level_key(k).map(|(_, _, price)| price);
        Ok::<bool, StoreError>(true)
    })?;
    Ok(best)
}

pub fn mid_price(ledger: &Ledger, market: &MarketId) -> Result<Option<Decimal>, StoreError> {
    let bid = best_price(ledger, market, Side::Buy)?;
    let ask = best_price(ledger, market, Side::Sell)?;
    Ok(match (bid, ask) {
        (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
        _ => None,
    })
}

// 4.2: client ids

/// Where a client id currently points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidRecord {
    pub order_hash: OrderHash,
    pub side: Side,
}

/// Market orders reserve their cid in the transient store so it lapses with the block.
pub fn reserve_cid(
    ledger: &mut Ledger,
    transient: bool,
    market: &MarketId,
    subaccount: &SubaccountId,
    cid: &str,
    record: CidRecord,
) -> Result<(), StoreError> {
    if cid.is_empty() {
        return Ok(());
    }
    let key = cid_key(market, subaccount, cid);
    if transient {
        set_record(ledger.transient_mut(), &key, &record)
    } else {
        set_record(ledger, &key, &record)
    }
}

pub fn release_cid(ledger: &mut Ledger, market: &MarketId, subaccount: &SubaccountId, cid: &str) {
    if cid.is_empty() {
        return;
    }
    let key = cid_key(market, subaccount, cid);
    ledger.delete(&key);
    ledger.transient_mut().delete(&key);
}

pub fn get_cid(ledger: &Ledger, market: &MarketId, subaccount: &SubaccountId, cid: &str) -> Result<Option<CidRecord>, StoreError> {
    let key = cid_key(market, subaccount, cid);
    if let Some(record) = get_record(ledger, &key)? {
        return Ok(Some(record));
    }
    get_record(ledger.transient(), &key)
}

// 4.3: limit orders

/// Writes every index of a resting order.
pub fn insert_limit_order<O: BookRecord>(ledger: &mut Ledger, market: &MarketId, order: &O) -> Result<(), InvariantViolation> {
    let kind = O::KIND;
    let side = order.side();
    let hash = order.hash();
    let sub = order.subaccount_id();

    set_record(ledger, &limit_order_key(kind.limit_prefix(), market, side, order.price(), &hash), order)?;
    ledger.set(
        &subaccount_order_key(kind.index_prefix(), market, side, &sub, &hash),
        price_and_hash_suffix(order.price(), &hash),
    );
    adjust_price_level(ledger, market, side, order.price(), order.fillable())?;

    let mut meta = get_metadata(ledger, market, side, &sub)?;
    meta.apply_limit_order(order.fillable(), order.is_reduce_only(), true);
    set_metadata(ledger, market, side, &sub, &meta)?;

    reserve_cid(ledger, false, market, &sub, order.cid(), CidRecord { order_hash: hash, side })?;
    if order.expiration_block() > 0 {
        append_order_expiration(ledger, market, order.expiration_block(), &hash, &sub)?;
    }
    Ok(())
}

/// Exact inverse of [`insert_limit_order`]. The expiration entry is left for the sweep,
/// which reports it as already gone.
pub fn remove_limit_order<O: BookRecord>(ledger: &mut Ledger, market: &MarketId, order: &O) -> Result<(), InvariantViolation> {
    let kind = O::KIND;
    let side = order.side();
    let hash = order.hash();
    let sub = order.subaccount_id();

    ledger.delete(&limit_order_key(kind.limit_prefix(), market, side, order.price(), &hash));
    ledger.delete(&subaccount_order_key(kind.index_prefix(), market, side, &sub, &hash));
    adjust_price_level(ledger, market, side, order.price(), -order.fillable())?;

    let mut meta = get_metadata(ledger, market, side, &sub)?;
    meta.apply_limit_order(order.fillable(), order.is_reduce_only(), false);
    set_metadata(ledger, market, side, &sub, &meta)?;

    release_cid(ledger, market, &sub, order.cid());
    Ok(())
}

/// Swaps a partially filled order for its updated copy; a fully filled one is removed.
pub fn replace_limit_order<O: BookRecord>(ledger: &mut Ledger, market: &MarketId, old: &O, updated: &O) -> Result<(), InvariantViolation> {
    remove_limit_order(ledger, market, old)?;
    if updated.fillable() > Decimal::ZERO {
        insert_limit_order(ledger, market, updated)?;
    }
    Ok(())
}

pub fn get_limit_order<O: BookRecord>(
    ledger: &Ledger,
    market: &MarketId,
    side: Side,
    subaccount: &SubaccountId,
    hash: &OrderHash,
) -> Result<Option<O>, StoreError> {
    let index_key = subaccount_order_key(O::KIND.index_prefix(), market, side, subaccount, hash);
    let Some(price_key) = ledger.get(&index_key) else {
        return Ok(None);
    };
    let (price, _) = split_price_and_hash(&price_key).map_err(|e| StoreError::corrupted(&index_key, e))?;
    get_record(ledger, &limit_order_key(O::KIND.limit_prefix(), market, side, price, hash))
}

/// Lookup by hash when the side isn't known.
pub fn find_limit_order<O: BookRecord>(
    ledger: &Ledger,
    market: &MarketId,
    subaccount: &SubaccountId,
    hash: &OrderHash,
) -> Result<Option<O>, StoreError> {
    if let Some(order) = get_limit_order(ledger, market, Side::Buy, subaccount, hash)? {
        return Ok(Some(order));
    }
    get_limit_order(ledger, market, Side::Sell, subaccount, hash)
}

/// Iterates one side best price first. The callback returns `true` to stop.
pub fn iterate_book<O, E, F>(ledger: &Ledger, market: &MarketId, side: Side, mut callback: F) -> Result<(), E>
where
    O: BookRecord,
    E: From<StoreError>,
    F: FnMut(O) -> Result<bool, E>,
{
    let side_prefix = limit_order_side_prefix(O::KIND.limit_prefix(), market, side);
    iterate_prefix(ledger, &side_prefix, side.is_buy(), |k, v| {
        let order: O = unmarshal(k, v)?;
        callback(order)
    })
}

pub fn book_orders<O: BookRecord>(ledger: &Ledger, market: &MarketId, side: Side) -> Result<Vec<O>, StoreError> {
    let mut out = Vec::new();
    iterate_book(ledger, market, side, |o: O| {
        out.push(o);
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

/// Resting orders on `maker_side` that a taker limited at `limit_price` could fill,
/// best first.
pub fn crossing_orders<O: BookRecord>(
    ledger: &Ledger,
    market: &MarketId,
    maker_side: Side,
    limit_price: Decimal,
) -> Result<Vec<O>, StoreError> {
    let mut out = Vec::new();
    iterate_book(ledger, market, maker_side, |o: O| {
        let crosses = match maker_side {
            Side::Sell => o.price() <= limit_price,
            Side::Buy => o.price() >= limit_price,
        };
        if !crosses {
            return Ok::<bool, StoreError>(true);
        }
        out.push(o);
        Ok(false)
    })?;
    Ok(out)
}

/// Every resting order of one subaccount on one side, in index order.
pub fn subaccount_orders<O: BookRecord>(
    ledger: &Ledger,
    market: &MarketId,
    side: Side,
    subaccount: &SubaccountId,
) -> Result<Vec<O>, StoreError> {
    let index_prefix = subaccount_order_prefix(O::KIND.index_prefix(), market, side, subaccount);
    let mut price_keys = Vec::new();
    iterate_prefix(ledger, &index_prefix, false, |k, v| {
        price_keys.push(split_price_and_hash(v).map_err(|e| StoreError::corrupted(k, e))?);
        Ok::<bool, StoreError>(false)
    })?;

    let mut out = Vec::with_capacity(price_keys.len());
    for (price, hash) in price_keys {
        let key = limit_order_key(O::KIND.limit_prefix(), market, side, price, &hash);
        match get_record(ledger, &key)? {
            Some(order) => out.push(order),
            None => return Err(StoreError::corrupted(&key, "index entry without order")),
        }
    }
    Ok(out)
}

/// Subaccount orders from `start` (inclusive) onwards, for paging through a large index.
pub fn subaccount_orders_from<O: BookRecord>(
    ledger: &Ledger,
    market: &MarketId,
    side: Side,
    subaccount: &SubaccountId,
    start: &OrderHash,
    limit: usize,
) -> Result<Vec<O>, StoreError> {
    let index_prefix = subaccount_order_prefix(O::KIND.index_prefix(), market, side, subaccount);
    let start_key = subaccount_order_key(O::KIND.index_prefix(), market, side, subaccount, start);
    let end = add_bit_to_prefix(&index_prefix);

    let mut price_keys = Vec::new();
    iterate_safe(ledger, Some(start_key.as_slice()), end.as_deref(), false, |k, v| {
        price_keys.push(split_price_and_hash(v).map_err(|e| StoreError::corrupted(k, e))?);
        Ok::<bool, StoreError>(price_keys.len() >= limit)
    })?;

    let mut out = Vec::with_capacity(price_keys.len());
    for (price, hash) in price_keys {
        if let Some(order) = get_record(ledger, &limit_order_key(O::KIND.limit_prefix(), market, side, price, &hash))? {
            out.push(order);
        }
    }
    Ok(out)
}

// 4.4: whole-book views for reconciliation

/// Kind-independent view of a resting order.
#[derive(Debug, Clone, PartialEq)]
pub struct RestingOrderView {
    pub market_id: MarketId,
    pub side: Side,
    pub subaccount_id: SubaccountId,
    pub order_hash: OrderHash,
    pub price: Decimal,
    pub fillable: Decimal,
    pub is_reduce_only: bool,
}

impl RestingOrderView {
    fn of<O: BookOrder>(market_id: MarketId, order: &O) -> Self {
        Self {
            market_id,
            side: order.side(),
            subaccount_id: order.subaccount_id(),
            order_hash: order.hash(),
            price: order.price(),
            fillable: order.fillable(),
            is_reduce_only: order.is_reduce_only(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub market_id: MarketId,
    pub side: Side,
    pub subaccount_id: SubaccountId,
    pub order_hash: OrderHash,
    pub price: Decimal,
}

fn decode_view(kind: BookKind, market: MarketId, key: &[u8], raw: &[u8]) -> Result<RestingOrderView, StoreError> {
    Ok(match kind {
        BookKind::Spot => RestingOrderView::of(market, &unmarshal::<SpotLimitOrder>(key, raw)?),
        BookKind::Derivative => RestingOrderView::of(market, &unmarshal::<DerivativeLimitOrder>(key, raw)?),
    })
}

pub fn all_resting_orders(ledger: &Ledger, kind: BookKind) -> Result<Vec<RestingOrderView>, StoreError> {
    let mut out = Vec::new();
    iterate_prefix(ledger, &[kind.limit_prefix()], false, |k, v| {
        let market = k
            .get(1..33)
            .and_then(MarketId::from_slice)
            .ok_or_else(|| StoreError::corrupted(k, "bad order key"))?;
        out.push(decode_view(kind, market, k, v)?);
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

pub fn all_index_entries(ledger: &Ledger, kind: BookKind) -> Result<Vec<IndexEntry>, StoreError> {
    let mut out = Vec::new();
    iterate_prefix(ledger, &[kind.index_prefix()], false, |k, v| {
        let body = &k[1..];
        if body.len() != MarketId::LEN + 1 + SubaccountId::LEN + OrderHash::LEN {
            return Err(StoreError::corrupted(k, "bad index key"));
        }
        let (price, hash) = split_price_and_hash(v).map_err(|e| StoreError::corrupted(k, e))?;
        let entry = MarketId::from_slice(&body[..32]).zip(side_from_byte(body[32])).zip(SubaccountId::from_slice(&body[33..65]));
        let ((market_id, side), subaccount_id) = entry.ok_or_else(|| StoreError::corrupted(k, "bad index key"))?;
        out.push(IndexEntry {
            market_id,
            side,
            subaccount_id,
            order_hash: hash,
            price,
        });
        Ok(false)
    })?;
    Ok(out)
}

pub fn resting_order_by_index(ledger: &Ledger, kind: BookKind, entry: &IndexEntry) -> Result<Option<RestingOrderView>, StoreError> {
    let key = limit_order_key(kind.limit_prefix(), &entry.market_id, entry.side, entry.price, &entry.order_hash);
    match ledger.get(&key) {
        Some(raw) => decode_view(kind, entry.market_id, &key, &raw).map(Some),
        None => Ok(None),
    }
}

// 4.5: block-scoped market orders

fn market_order_key(kind: BookKind, order: &MarketOrder) -> Vec<u8> {
    limit_order_key(kind.market_order_prefix(), &order.market_id, order.side(), order.order_info.price, &order.order_hash)
}

fn market_order_marker_key(market: &MarketId, subaccount: &SubaccountId) -> Vec<u8> {
    market_subaccount_key(prefix::TRANSIENT_MARKET_ORDER_MARKER, market, subaccount)
}

pub fn has_market_order_this_block(ledger: &Ledger, market: &MarketId, subaccount: &SubaccountId) -> bool {
    ledger.transient().has(&market_order_marker_key(market, subaccount))
}

pub fn mark_market_order(ledger: &mut Ledger, market: &MarketId, subaccount: &SubaccountId) {
    ledger.transient_mut().set(&market_order_marker_key(market, subaccount), Vec::new());
}

pub fn stage_market_order(ledger: &mut Ledger, kind: BookKind, order: &MarketOrder) -> Result<(), StoreError> {
    let key = market_order_key(kind, order);
    set_record(ledger.transient_mut(), &key, order)?;
    reserve_cid(
        ledger,
        true,
        &order.market_id,
        &order.order_info.subaccount_id,
        &order.order_info.cid,
        CidRecord {
            order_hash: order.order_hash,
            side: order.side(),
        },
    )
}

pub fn unstage_market_order(ledger: &mut Ledger, kind: BookKind, order: &MarketOrder) {
    let key = market_order_key(kind, order);
    ledger.transient_mut().delete(&key);
    release_cid(ledger, &order.market_id, &order.order_info.subaccount_id, &order.order_info.cid);
}

/// Staged market orders of one market and side, most aggressive worst-price first.
pub fn staged_market_orders(ledger: &Ledger, kind: BookKind, market: &MarketId, side: Side) -> Result<Vec<MarketOrder>, StoreError> {
    let side_prefix = limit_order_side_prefix(kind.market_order_prefix(), market, side);
    let mut out = Vec::new();
    iterate_prefix(ledger.transient(), &side_prefix, side.is_buy(), |k, v| {
        out.push(unmarshal::<MarketOrder>(k, v)?);
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

pub fn find_staged_market_order(
    ledger: &Ledger,
    kind: BookKind,
    market: &MarketId,
    subaccount: &SubaccountId,
    hash: &OrderHash,
) -> Result<Option<MarketOrder>, StoreError> {
    for side in [Side::Buy, Side::Sell] {
        for order in staged_market_orders(ledger, kind, market, side)? {
            if order.order_hash == *hash && order.order_info.subaccount_id == *subaccount {
                return Ok(Some(order));
            }
        }
    }
    Ok(None)
}

/// Markets with at least one staged order, ascending by id.
pub fn markets_with_staged_orders(ledger: &Ledger, kind: BookKind) -> Vec<MarketId> {
    let mut out: Vec<MarketId> = Vec::new();
    for (suffix, _) in collect_prefix(ledger.transient(), &[kind.market_order_prefix()], false) {
        if let Some(market) = suffix.get(..32).and_then(MarketId::from_slice) {
            if out.last() != Some(&market) {
                out.push(market);
            }
        }
    }
    out
}

// 4.6: expirations, indexed by block height

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationEntry {
    pub order_hash: OrderHash,
    pub subaccount_id: SubaccountId,
}

fn expiration_market_key(height: u64, market: &MarketId) -> Vec<u8> {
    let mut key = expiration_market_prefix(height);
    key.extend_from_slice(market.as_bytes());
    key
}

pub fn append_order_expiration(
    ledger: &mut Ledger,
    market: &MarketId,
    height: u64,
    hash: &OrderHash,
    subaccount: &SubaccountId,
) -> Result<(), StoreError> {
    let mut key = expiration_orders_prefix(height, market);
    key.extend_from_slice(hash.as_bytes());
    set_record(
        ledger,
        &key,
        &ExpirationEntry {
            order_hash: *hash,
            subaccount_id: *subaccount,
        },
    )?;
    ledger.set(&expiration_market_key(height, market), Vec::new());
    Ok(())
}

pub fn markets_with_expirations(ledger: &Ledger, height: u64) -> Vec<MarketId> {
    collect_prefix(ledger, &expiration_market_prefix(height), false)
        .into_iter()
        .filter_map(|(suffix, _)| MarketId::from_slice(&suffix))
        .collect()
}

pub fn expiring_orders(ledger: &Ledger, height: u64, market: &MarketId) -> Result<Vec<ExpirationEntry>, StoreError> {
    let mut out = Vec::new();
    iterate_prefix(ledger, &expiration_orders_prefix(height, market), false, |k, v| {
        out.push(unmarshal::<ExpirationEntry>(k, v)?);
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

pub fn clear_expirations(ledger: &mut Ledger, height: u64, market: &MarketId) {
    let order_prefix = expiration_orders_prefix(height, market);
    let keys: Vec<Vec<u8>> = collect_prefix(ledger, &order_prefix, false)
        .into_iter()
        .map(|(suffix, _)| [order_prefix.as_slice(), &suffix].concat())
        .collect();
    for key in keys {
        ledger.delete(&key);
    }
    ledger.delete(&expiration_market_key(height, market));
}

// 4.7: trade nonce, part of every order hash

fn trade_nonce_key(subaccount: &SubaccountId) -> Vec<u8> {
    KeyBuilder::new(prefix::TRADE_NONCE).bytes(subaccount.as_bytes()).build()
}

pub fn next_trade_nonce(ledger: &mut Ledger, subaccount: &SubaccountId) -> Result<u32, StoreError> {
    let key = trade_nonce_key(subaccount);
    let current: u32 = get_record(ledger, &key)?.unwrap_or(0);
    let next = current.wrapping_add(1);
    set_record(ledger, &key, &next)?;
    Ok(next)
}
