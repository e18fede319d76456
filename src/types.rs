// 1.0: all the primitives live here. nothing in the ledger works without these types.
// addresses, subaccounts, market ids, order hashes, sides, block context. each id is a
// fixed-width newtype so keys built from them always have the same length.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; $len] = bytes.try_into().ok()?;
                Some(Self(arr))
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                let raw = hex::decode(s.trim_start_matches("0x")).ok()?;
                Self::from_slice(&raw)
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).ok_or_else(|| de::Error::custom(format!("invalid {}: {}", stringify!($name), s)))
            }
        }
    };
}

fixed_bytes!(
    /// Owner account of one or more subaccounts.
    Address,
    20
);

fixed_bytes!(
    /// address ‖ 12-byte big-endian nonce. nonce 0 is the default subaccount.
    SubaccountId,
    32
);

fixed_bytes!(MarketId, 32);

fixed_bytes!(OrderHash, 32);

impl SubaccountId {
    pub fn new(owner: Address, nonce: u32) -> Self {
        let mut raw = [0u8; 32];
        raw[..20].copy_from_slice(&owner.0);
        raw[28..].copy_from_slice(&nonce.to_be_bytes());
        Self(raw)
    }

    pub fn owner(&self) -> Address {
        let mut raw = [0u8; 20];
        raw.copy_from_slice(&self.0[..20]);
        Address(raw)
    }

    pub fn nonce(&self) -> u32 {
        u32::from_be_bytes([self.0[28], self.0[29], self.0[30], self.0[31]])
    }

    // the upper 8 nonce bytes must be zero too, otherwise it's a non-default id
    pub fn is_default(&self) -> bool {
        self.0[20..].iter().all(|b| *b == 0)
    }
}

// Buy = bid side of the book. Sell = ask side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_is_buy(is_buy: bool) -> Self {
        if is_buy {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => dec!(1),
            Side::Sell => dec!(-1),
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    // key flag byte. buy = 1 keeps parity with the stored ledger format
    pub fn key_byte(&self) -> u8 {
        match self {
            Side::Buy => 1,
            Side::Sell => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketKind {
    Spot,
    Derivative,
    BinaryOption,
}

impl MarketKind {
    pub fn tag(&self) -> &'static str {
        match self {
            MarketKind::Spot => "spot",
            MarketKind::Derivative => "derivative",
            MarketKind::BinaryOption => "binary",
        }
    }

    pub fn is_derivative_like(&self) -> bool {
        !matches!(self, MarketKind::Spot)
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

// 1.1: the host's view of "now". the only time source the ledger ever reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    pub height: u64,
    pub time: DateTime<Utc>,
}

impl BlockContext {
    pub fn new(height: u64, unix_secs: i64) -> Self {
        Self {
            height,
            time: DateTime::<Utc>::from_timestamp(unix_secs, 0).unwrap_or_default(),
        }
    }

    pub fn unix_secs(&self) -> i64 {
        self.time.timestamp()
    }

    pub fn next(&self, secs: i64) -> Self {
        Self::new(self.height + 1, self.unix_secs() + secs)
    }
}

impl Default for BlockContext {
    fn default() -> Self {
        Self::new(1, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: Decimal,
}

impl Coin {
    pub fn new(denom: impl Into<String>, amount: Decimal) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subaccount_layout() {
        let owner = Address([7u8; 20]);
        let sub = SubaccountId::new(owner, 3);
        assert_eq!(sub.owner(), owner);
        assert_eq!(sub.nonce(), 3);
        assert!(!sub.is_default());
        assert!(SubaccountId::new(owner, 0).is_default());
    }

    #[test]
    fn hex_roundtrip_through_serde() {
        let market = MarketId([0xab; 32]);
        let json = serde_json::to_string(&market).unwrap();
        assert!(json.contains("0xabab"));
        let back: MarketId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, market);
    }

    #[test]
    fn side_flags() {
        assert_eq!(Side::Buy.sign(), dec!(1));
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert!(Side::Buy.key_byte() > Side::Sell.key_byte());
    }

    #[test]
    fn block_context_time() {
        let ctx = BlockContext::new(10, 1_700_000_000);
        assert_eq!(ctx.unix_secs(), 1_700_000_000);
        let next = ctx.next(5);
        assert_eq!(next.height, 11);
        assert_eq!(next.unix_secs(), 1_700_000_005);
    }
}
