// 8.0: the exchange engine. routes wire messages through one atomic scope each, matches
// orders, and runs the begin/end block hooks. deterministic, no I/O.

mod batch;
mod conditionals;
mod config;
mod core;
mod derivatives;
mod funding;
mod lifecycle;
mod markets;
mod orders;
mod positions;
mod pricing;
mod queries;
mod results;
mod spot;
#[cfg(test)]
mod testing;
mod transfers;

pub use config::EngineConfig;
pub use core::Engine;
pub use queries::DepthLevel;
pub use results::{BlockSummary, ExchangeError, TxResponse};
