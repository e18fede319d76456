//! Engine configuration options.

/// Engine configuration. Ledger parameters live in [`crate::config::ExchangeParams`];
/// this only covers how the engine itself runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of committed events to retain in memory.
    pub max_events: usize,
    /// Log every committed event at debug level.
    pub verbose: bool,
    /// Gas limit for messages delivered without an explicit one.
    pub default_gas_limit: u64,
    /// Run the full invariant reconciliation at the end of every block.
    pub check_invariants_every_block: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            verbose: false,
            default_gas_limit: 10_000_000,
            check_invariants_every_block: false,
        }
    }
}
