// exchange-ledger: the deterministic exchange ledger of a validator node.
// every validator must reach byte-identical state from the same blocks, so nothing here
// reads a clock, a random source or a hash map's iteration order.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: Address, SubaccountId, MarketId, OrderHash, Side, BlockContext
//   2.x  keys.rs, store.rs: sortable key encoding, committed and transient stores, rollback checkpoints
//   3.x  deposits.rs: subaccount deposits, bank collaborator, fee pool
//   4.x  orderbook.rs: limit/market order index, metadata, price levels, cids, expirations
//   4.1x order.rs, conditional.rs: order types and hashing, trigger-price books
//   5.x  market_balance.rs: per-market collateral, insurance, open interest
//   6.x  position.rs: positions, pnl, increase/reduce/flip
//   6.1x margin.rs: order margin, reduce-only and margin-ratio checks
//   7.x  funding.rs: perpetual funding rate and cumulative index
//   8.x  engine/: message handlers, matching, block hooks, queries
//   9.x  msgs.rs: wire messages and responses
//   10.x config.rs: exchange parameters and the fixed gas table
//   11.x events.rs: buffered event log
//   12.x oracle.rs: price oracle collaborator
//   13.x settlement.rs: expiry, forced settlement, socialized-loss haircut
//   14.x gas.rs: gas meter and per-access costs
//   invariants.rs, validators.rs, market.rs carry module docs instead

// ledger primitives
pub mod gas;
pub mod keys;
pub mod store;
pub mod types;

// order book and balances
pub mod conditional;
pub mod deposits;
pub mod market;
pub mod order;
pub mod orderbook;

// derivatives
pub mod funding;
pub mod margin;
pub mod market_balance;
pub mod position;
pub mod settlement;

// collaborators and checks
pub mod invariants;
pub mod oracle;
pub mod validators;

// wire surface
pub mod config;
pub mod engine;
pub mod events;
pub mod msgs;

// re exports for convenience
pub use config::{Environment, ExchangeParams};
pub use engine::{BlockSummary, DepthLevel, Engine, EngineConfig, ExchangeError, TxResponse};
pub use events::{CancelReason, Event, EventPayload};
pub use market::{AnyDerivativeMarket, BinaryOptionsMarket, DerivativeMarket, MarketStatus, SpotMarket};
pub use msgs::*;
pub use oracle::{InMemoryOracle, PriceOracle};
pub use order::*;
pub use types::*;
