//! Sortable key encoding for the ledger stores.
//!
//! Every key is plain bytes compared lexicographically, so anything that needs an
//! ordering (prices, trigger prices, block heights) is written fixed-width big-endian.
//! Decimals carry exactly 18 fractional digits on disk.

use crate::types::{MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use thiserror::Error;

pub const DEC_PRECISION: u32 = 18;
pub const UNSIGNED_DEC_LEN: usize = 24;
pub const SIGNED_DEC_LEN: usize = UNSIGNED_DEC_LEN + 1;

const FRACTION_UNIT: u128 = 1_000_000_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("expected {expected} key bytes, got {got}")]
    BadLength { expected: usize, got: usize },

    #[error("invalid sign byte {0:#04x}")]
    BadSign(u8),

    #[error("fraction {0} exceeds 18 decimal digits")]
    BadFraction(u64),

    #[error("integer part {0} exceeds the decimal range")]
    Overflow(u128),
}

// 2.0: decimal <-> fixed bytes

/// 16-byte integer part followed by 8 bytes of `fraction * 1e18`, both big-endian.
pub fn encode_unsigned_dec(value: Decimal) -> [u8; UNSIGNED_DEC_LEN] {
    debug_assert!(!value.is_sign_negative() || value.is_zero(), "unsigned encoding of {value}");

    let rounded = value.round_dp(DEC_PRECISION);
    let mantissa = rounded.mantissa().unsigned_abs();
    let scale = rounded.scale();
    let pow = 10u128.pow(scale);

    let integer = mantissa / pow;
    let fraction = (mantissa % pow) * 10u128.pow(DEC_PRECISION - scale);

    let mut out = [0u8; UNSIGNED_DEC_LEN];
    out[..16].copy_from_slice(&integer.to_be_bytes());
    out[16..].copy_from_slice(&(fraction as u64).to_be_bytes());
    out
}

pub fn decode_unsigned_dec(bytes: &[u8]) -> Result<Decimal, KeyError> {
    if bytes.len() != UNSIGNED_DEC_LEN {
        return Err(KeyError::BadLength {
            expected: UNSIGNED_DEC_LEN,
            got: bytes.len(),
        });
    }

    let mut int_raw = [0u8; 16];
    int_raw.copy_from_slice(&bytes[..16]);
    let mut frac_raw = [0u8; 8];
    frac_raw.copy_from_slice(&bytes[16..]);

    let integer = u128::from_be_bytes(int_raw);
    let fraction = u64::from_be_bytes(frac_raw);
    if u128::from(fraction) >= FRACTION_UNIT {
        return Err(KeyError::BadFraction(fraction));
    }

    let int_part = i128::try_from(integer)
        .ok()
        .and_then(|i| Decimal::try_from_i128_with_scale(i, 0).ok())
        .ok_or(KeyError::Overflow(integer))?;
    let frac_part = Decimal::from_i128_with_scale(i128::from(fraction), DEC_PRECISION).normalize();
    int_part.checked_add(frac_part).ok_or(KeyError::Overflow(integer))
}

/// Sign byte (0x00 negative, 0x01 otherwise) then the magnitude. Negative magnitudes are
/// bit-inverted so a bigger loss sorts earlier.
pub fn encode_signed_dec(value: Decimal) -> [u8; SIGNED_DEC_LEN] {
    let negative = value.is_sign_negative() && !value.round_dp(DEC_PRECISION).is_zero();
    let magnitude = encode_unsigned_dec(value.abs());

    let mut out = [0u8; SIGNED_DEC_LEN];
    if negative {
        out[0] = 0x00;
        for (dst, src) in out[1..].iter_mut().zip(magnitude.iter()) {
            *dst = !src;
        }
    } else {
        out[0] = 0x01;
        out[1..].copy_from_slice(&magnitude);
    }
    out
}

pub fn decode_signed_dec(bytes: &[u8]) -> Result<Decimal, KeyError> {
    if bytes.len() != SIGNED_DEC_LEN {
        return Err(KeyError::BadLength {
            expected: SIGNED_DEC_LEN,
            got: bytes.len(),
        });
    }

    match bytes[0] {
        0x01 => decode_unsigned_dec(&bytes[1..]),
        0x00 => {
            let mut magnitude = [0u8; UNSIGNED_DEC_LEN];
            for (dst, src) in magnitude.iter_mut().zip(bytes[1..].iter()) {
                *dst = !src;
            }
            Ok(-decode_unsigned_dec(&magnitude)?)
        }
        other => Err(KeyError::BadSign(other)),
    }
}

// 2.1: range bound helpers

/// Turns an inclusive bound into an exclusive one: `[1,3,4] -> [1,3,5]`,
/// `[15,42,255,255] -> [15,43,0,0]`. All-0xFF (and empty) has no end, so `None`.
pub fn add_bit_to_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    if prefix.is_empty() {
        return None;
    }

    let mut next = prefix.to_vec();
    let mut l = next.len() - 1;
    next[l] = next[l].wrapping_add(1);

    while next[l] == 0 && l > 0 {
        l -= 1;
        next[l] = next[l].wrapping_add(1);
    }

    if l == 0 && next[0] == 0 {
        return None;
    }
    Some(next)
}

/// Inverse of [`add_bit_to_prefix`]. Borrows through trailing zeros; all-zero has no
/// predecessor.
pub fn subtract_bit_from_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    if prefix.is_empty() {
        return None;
    }

    let mut prev = prefix.to_vec();
    let mut l = prev.len() - 1;
    prev[l] = prev[l].wrapping_sub(1);

    while prev[l] == 255 && l > 0 {
        l -= 1;
        prev[l] = prev[l].wrapping_sub(1);
    }

    if l == 0 && prev[0] == 255 {
        return None;
    }
    Some(prev)
}

// 2.2: store namespaces. committed prefixes stay below 0x80, transient ones above.

pub mod prefix {
    pub const DEPOSITS: u8 = 0x01;
    pub const TRADE_NONCE: u8 = 0x02;
    pub const BANK_BALANCES: u8 = 0x03;
    pub const FEE_POOL: u8 = 0x04;

    pub const SPOT_MARKETS: u8 = 0x11;
    pub const DERIVATIVE_MARKETS: u8 = 0x12;
    pub const BINARY_OPTIONS_MARKETS: u8 = 0x13;
    pub const PERPETUAL_INFO: u8 = 0x14;
    pub const PERPETUAL_FUNDING: u8 = 0x15;
    pub const EXPIRY_FUTURES_INFO: u8 = 0x16;
    pub const SCHEDULED_SETTLEMENT: u8 = 0x17;

    pub const SPOT_LIMIT_ORDERS: u8 = 0x21;
    pub const SPOT_ORDER_INDEX: u8 = 0x22;
    pub const DERIVATIVE_LIMIT_ORDERS: u8 = 0x23;
    pub const DERIVATIVE_ORDER_INDEX: u8 = 0x24;
    pub const ORDER_CIDS: u8 = 0x25;
    pub const PRICE_LEVELS: u8 = 0x26;
    pub const ORDERBOOK_METADATA: u8 = 0x27;
    pub const CONDITIONAL_ORDERS: u8 = 0x28;
    pub const CONDITIONAL_ORDER_INDEX: u8 = 0x29;
    pub const ORDER_EXPIRATIONS: u8 = 0x2a;
    pub const EXPIRATION_MARKETS: u8 = 0x2b;

    pub const POSITIONS: u8 = 0x31;
    pub const MARKET_BALANCES: u8 = 0x32;
    pub const OPEN_INTEREST: u8 = 0x33;
    pub const INSURANCE_FUNDS: u8 = 0x34;

    pub const TRANSIENT_SPOT_MARKET_ORDERS: u8 = 0x81;
    pub const TRANSIENT_DERIVATIVE_MARKET_ORDERS: u8 = 0x82;
    pub const TRANSIENT_MARKET_ORDER_MARKER: u8 = 0x83;
    pub const TRANSIENT_PRICE_LEVELS: u8 = 0x84;
    pub const TRANSIENT_DEPOSIT_TOUCHED: u8 = 0x85;
}

/// Small builder so composite keys read in the same order they're laid out.
#[derive(Debug, Default, Clone)]
pub struct KeyBuilder(Vec<u8>);

impl KeyBuilder {
    pub fn new(prefix: u8) -> Self {
        let mut raw = Vec::with_capacity(128);
        raw.push(prefix);
        Self(raw)
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.0.extend_from_slice(bytes);
        self
    }

    pub fn byte(mut self, b: u8) -> Self {
        self.0.push(b);
        self
    }

    pub fn flag(self, flag: bool) -> Self {
        self.byte(u8::from(flag))
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn price(self, price: Decimal) -> Self {
        let encoded = encode_unsigned_dec(price);
        self.bytes(&encoded)
    }

    pub fn build(self) -> Vec<u8> {
        self.0
    }
}

// 2.3: order book composite keys

pub fn limit_order_side_prefix(prefix: u8, market: &MarketId, side: Side) -> Vec<u8> {
    KeyBuilder::new(prefix).bytes(market.as_bytes()).byte(side.key_byte()).build()
}

/// `(market ‖ side ‖ price ‖ hash)`
pub fn limit_order_key(prefix: u8, market: &MarketId, side: Side, price: Decimal, hash: &OrderHash) -> Vec<u8> {
    KeyBuilder::new(prefix)
        .bytes(market.as_bytes())
        .byte(side.key_byte())
        .price(price)
        .bytes(hash.as_bytes())
        .build()
}

/// Price key stored in the subaccount index: what follows the side byte in a limit order key.
pub fn price_and_hash_suffix(price: Decimal, hash: &OrderHash) -> Vec<u8> {
    let mut out = Vec::with_capacity(UNSIGNED_DEC_LEN + OrderHash::LEN);
    out.extend_from_slice(&encode_unsigned_dec(price));
    out.extend_from_slice(hash.as_bytes());
    out
}

pub fn split_price_and_hash(suffix: &[u8]) -> Result<(Decimal, OrderHash), KeyError> {
    let expected = UNSIGNED_DEC_LEN + OrderHash::LEN;
    if suffix.len() != expected {
        return Err(KeyError::BadLength {
            expected,
            got: suffix.len(),
        });
    }
    let price = decode_unsigned_dec(&suffix[..UNSIGNED_DEC_LEN])?;
    let hash = OrderHash::from_slice(&suffix[UNSIGNED_DEC_LEN..]).ok_or(KeyError::BadLength {
        expected: OrderHash::LEN,
        got: suffix.len() - UNSIGNED_DEC_LEN,
    })?;
    Ok((price, hash))
}

pub fn subaccount_order_prefix(
    prefix: u8,
    market: &MarketId,
    side: Side,
    subaccount: &SubaccountId,
) -> Vec<u8> {
    KeyBuilder::new(prefix)
        .bytes(market.as_bytes())
        .byte(side.key_byte())
        .bytes(subaccount.as_bytes())
        .build()
}

pub fn subaccount_order_key(
    prefix: u8,
    market: &MarketId,
    side: Side,
    subaccount: &SubaccountId,
    hash: &OrderHash,
) -> Vec<u8> {
    let mut key = subaccount_order_prefix(prefix, market, side, subaccount);
    key.extend_from_slice(hash.as_bytes());
    key
}

pub fn market_side_subaccount_key(prefix: u8, market: &MarketId, side: Side, subaccount: &SubaccountId) -> Vec<u8> {
    subaccount_order_prefix(prefix, market, side, subaccount)
}

pub fn market_subaccount_key(prefix: u8, market: &MarketId, subaccount: &SubaccountId) -> Vec<u8> {
    KeyBuilder::new(prefix)
        .bytes(market.as_bytes())
        .bytes(subaccount.as_bytes())
        .build()
}

pub fn market_key(prefix: u8, market: &MarketId) -> Vec<u8> {
    KeyBuilder::new(prefix).bytes(market.as_bytes()).build()
}

pub fn price_level_key(prefix: u8, market: &MarketId, side: Side, price: Decimal) -> Vec<u8> {
    KeyBuilder::new(prefix)
        .bytes(market.as_bytes())
        .byte(side.key_byte())
        .price(price)
        .build()
}

pub fn cid_key(market: &MarketId, subaccount: &SubaccountId, cid: &str) -> Vec<u8> {
    KeyBuilder::new(prefix::ORDER_CIDS)
        .bytes(market.as_bytes())
        .bytes(subaccount.as_bytes())
        .bytes(cid.as_bytes())
        .build()
}

pub fn conditional_side_prefix(market: &MarketId, is_trigger_higher: bool) -> Vec<u8> {
    KeyBuilder::new(prefix::CONDITIONAL_ORDERS)
        .bytes(market.as_bytes())
        .flag(is_trigger_higher)
        .build()
}

pub fn conditional_order_key(market: &MarketId, is_trigger_higher: bool, trigger: Decimal, hash: &OrderHash) -> Vec<u8> {
    let mut key = conditional_side_prefix(market, is_trigger_higher);
    key.extend_from_slice(&price_and_hash_suffix(trigger, hash));
    key
}

pub fn conditional_index_key(market: &MarketId, subaccount: &SubaccountId, hash: &OrderHash) -> Vec<u8> {
    KeyBuilder::new(prefix::CONDITIONAL_ORDER_INDEX)
        .bytes(market.as_bytes())
        .bytes(subaccount.as_bytes())
        .bytes(hash.as_bytes())
        .build()
}

pub fn expiration_market_prefix(height: u64) -> Vec<u8> {
    KeyBuilder::new(prefix::EXPIRATION_MARKETS).u64(height).build()
}

pub fn expiration_orders_prefix(height: u64, market: &MarketId) -> Vec<u8> {
    KeyBuilder::new(prefix::ORDER_EXPIRATIONS).u64(height).bytes(market.as_bytes()).build()
}

pub fn deposit_key(subaccount: &SubaccountId, denom: &str) -> Vec<u8> {
    KeyBuilder::new(prefix::DEPOSITS)
        .bytes(subaccount.as_bytes())
        .bytes(denom.as_bytes())
        .build()
}
