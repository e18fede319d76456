// 8.0.2: result types and errors for engine operations.

use crate::config::ConfigError;
use crate::deposits::DepositError;
use crate::gas::OutOfGas;
use crate::invariants::InvariantViolation;
use crate::margin::MarginError;
use crate::market::{MarketError, MarketStatus};
use crate::msgs::MsgResponse;
use crate::order::OrderError;
use crate::settlement::SettlementError;
use crate::store::StoreError;
use crate::types::{Address, MarketId, SubaccountId};
use rust_decimal::Decimal;

/// What a committed message hands back to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct TxResponse {
    pub response: MsgResponse,
    pub gas_used: u64,
}

/// Work done by one begin/end block pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockSummary {
    pub expired_orders: usize,
    pub funding_updates: usize,
    pub settled_markets: usize,
    pub triggered_orders: usize,
    pub matched_market_orders: usize,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExchangeError {
    #[error("Market {0} not found")]
    MarketNotFound(MarketId),

    #[error("Market {0} is not active")]
    MarketNotActive(MarketId),

    #[error("Market {market} does not accept cancellations in status {status:?}")]
    CancellationsDisabled { market: MarketId, status: MarketStatus },

    #[error("{sender} does not own subaccount {subaccount}")]
    Unauthorized { sender: Address, subaccount: SubaccountId },

    #[error("{0} is not the exchange admin")]
    NotAdmin(Address),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Client id {0} already in use")]
    DuplicateCid(String),

    #[error("Post-only order at {0} would cross the book")]
    PostOnlyWouldCross(Decimal),

    #[error("Only one market order per subaccount and market per block")]
    MarketOrderThisBlock,

    #[error("Market orders are disabled in post-only mode")]
    PostOnlyMode,

    #[error("No mark price available for market {0}")]
    NoMarkPrice(MarketId),

    #[error("No position in market {0}")]
    PositionNotFound(MarketId),

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Market error: {0}")]
    Market(#[from] MarketError),

    #[error("Margin error: {0}")]
    Margin(#[from] MarginError),

    #[error("Deposit error: {0}")]
    Deposit(#[from] DepositError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    OutOfGas(#[from] OutOfGas),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),
}

impl From<SettlementError> for ExchangeError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::Deposit(e) => ExchangeError::Deposit(e),
            SettlementError::Invariant(e) => ExchangeError::Invariant(e),
            SettlementError::Store(e) => ExchangeError::Store(e),
        }
    }
}

impl ExchangeError {
    /// Stable code reported in batch responses and failure events.
    pub fn code(&self) -> &'static str {
        match self {
            ExchangeError::MarketNotFound(_) => "market_not_found",
            ExchangeError::MarketNotActive(_) => "market_not_active",
            ExchangeError::CancellationsDisabled { .. } => "cancellations_disabled",
            ExchangeError::Unauthorized { .. } => "unauthorized",
            ExchangeError::NotAdmin(_) => "not_admin",
            ExchangeError::OrderNotFound(_) => "order_not_found",
            ExchangeError::DuplicateCid(_) => "duplicate_cid",
            ExchangeError::PostOnlyWouldCross(_) => "post_only_would_cross",
            ExchangeError::MarketOrderThisBlock => "market_order_this_block",
            ExchangeError::PostOnlyMode => "post_only_mode",
            ExchangeError::NoMarkPrice(_) => "no_mark_price",
            ExchangeError::PositionNotFound(_) => "position_not_found",
            ExchangeError::InvalidTransfer(_) => "invalid_transfer",
            ExchangeError::Order(e) => match e {
                OrderError::InvalidPrice(_) => "invalid_price",
                OrderError::InvalidQuantity(_) => "invalid_quantity",
                OrderError::InvalidMargin(_) => "invalid_margin",
                OrderError::CidTooLong => "cid_too_long",
                OrderError::MissingTriggerPrice | OrderError::UnexpectedTriggerPrice(_) => "invalid_trigger_price",
                OrderError::ExpirationOnMarketOrder
                | OrderError::ExpirationOnConditionalOrder
                | OrderError::ExpirationInPast { .. } => "invalid_expiration",
                OrderError::UnsupportedOrderType(_) => "unsupported_order_type",
            },
            ExchangeError::Market(e) => match e {
                MarketError::MarketNotFound(_) => "market_not_found",
                MarketError::MarketNotActive(_) => "market_not_active",
                MarketError::MarketExists(_) => "market_exists",
                MarketError::InvalidStatus { .. } => "invalid_market_status",
                MarketError::InvalidPriceTick { .. } | MarketError::BinaryPriceOutOfRange(_) => "invalid_price",
                MarketError::InvalidQuantityTick { .. } => "invalid_quantity",
                MarketError::BelowMinNotional { .. } => "below_min_notional",
                MarketError::InvalidParameter(_) => "invalid_market_parameter",
                MarketError::NoOraclePrice(_) => "no_mark_price",
            },
            ExchangeError::Margin(e) => match e {
                MarginError::InsufficientOrderMargin { .. } => "insufficient_order_margin",
                MarginError::MarkPriceMarginViolation { .. } => "mark_price_margin_violation",
                MarginError::MarginRatioTooLow { .. } => "margin_ratio_too_low",
                MarginError::NoPositionToReduce => "no_position_to_reduce",
                MarginError::ReduceOnlyWrongDirection => "reduce_only_wrong_direction",
                MarginError::ReduceOnlyExceedsPosition { .. } => "reduce_only_exceeds_position",
                MarginError::OpenNotionalCapExceeded { .. } => "open_notional_cap_exceeded",
                MarginError::Bankrupt => "bankrupt",
                MarginError::Store(_) => "invariant_violation",
            },
            ExchangeError::Deposit(e) => match e {
                DepositError::InsufficientDeposit { .. } => "insufficient_deposit",
                DepositError::InsufficientBankBalance { .. } => "insufficient_funds",
                DepositError::InvalidAmount(_) => "invalid_amount",
                DepositError::DefaultSubaccountDeposit => "default_subaccount_deposit",
                DepositError::Store(_) | DepositError::Invariant(_) => "invariant_violation",
            },
            ExchangeError::Config(_) => "invalid_config",
            ExchangeError::OutOfGas(_) => "out_of_gas",
            ExchangeError::Store(_) | ExchangeError::Invariant(_) => "invariant_violation",
        }
    }

    /// The ledger itself is wrong. Never folded into a soft failure.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            ExchangeError::Store(_)
                | ExchangeError::Invariant(_)
                | ExchangeError::Margin(MarginError::Store(_))
                | ExchangeError::Deposit(DepositError::Store(_) | DepositError::Invariant(_))
        )
    }

    /// Aborts the whole message even inside a batch.
    pub fn is_hard_failure(&self) -> bool {
        self.is_invariant_violation() || matches!(self, ExchangeError::OutOfGas(_))
    }
}
