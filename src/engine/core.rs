// 8.0 engine/core.rs: main engine. owns the ledger, the event log and the oracle handle,
// and wraps every message in one atomic scope.

use super::config::EngineConfig;
use super::results::{ExchangeError, TxResponse};
use crate::config::ExchangeParams;
use crate::deposits::BankLedger;
use crate::events::{Event, EventEmitter, EventLog, EventPayload};
use crate::gas::{GasMeter, OutOfGas};
use crate::msgs::{ExchangeMsg, MsgResponse};
use crate::oracle::PriceOracle;
use crate::store::Ledger;
use crate::types::{Address, BlockContext, Coin, SubaccountId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/** 8.1: main engine struct. all state lives in the ledger; the rest is plumbing */
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) params: ExchangeParams,
    pub(super) ledger: Ledger,
    pub(super) events: EventLog,
    pub(super) oracle: Arc<dyn PriceOracle>,
    pub(super) block: BlockContext,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("block", &self.block)
            .field("committed_keys", &self.ledger.committed().len())
            .field("events", &self.events.events().len())
            .finish()
    }
}

impl Engine {
    pub fn new(params: ExchangeParams, config: EngineConfig, oracle: Arc<dyn PriceOracle>) -> Result<Self, ExchangeError> {
        params.validate()?;
        let mut ledger = Ledger::new();
        ledger.set_gas_config(params.kv_gas);
        let events = EventLog::new(config.max_events, config.verbose);
        Ok(Self {
            config,
            params,
            ledger,
            events,
            oracle,
            block: BlockContext::default(),
        })
    }

    pub fn params(&self) -> &ExchangeParams {
        &self.params
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn block(&self) -> BlockContext {
        self.block
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn events(&self) -> &[Event] {
        self.events.events()
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.take_events()
    }

    pub(super) fn emit(&mut self, payload: EventPayload) {
        self.events.emit(payload);
    }

    pub(super) fn oracle(&self) -> &dyn PriceOracle {
        self.oracle.as_ref()
    }

    /// Genesis helper: credits a bank balance out of thin air.
    pub fn mint(&mut self, to: &Address, coin: &Coin) -> Result<(), ExchangeError> {
        self.ledger.mint(to, coin)?;
        Ok(())
    }

    // 8.2: message delivery

    /// Delivers one message under the configured default gas limit.
    pub fn deliver(&mut self, msg: ExchangeMsg) -> Result<TxResponse, ExchangeError> {
        let limit = self.config.default_gas_limit;
        self.deliver_with_gas(msg, limit)
    }

    /// Runs one message atomically: every write and event lands, or none does.
    pub fn deliver_with_gas(&mut self, msg: ExchangeMsg, gas_limit: u64) -> Result<TxResponse, ExchangeError> {
        let name = msg.name();

        // fixed mode: the table decides the charge, the handler runs unmetered
        let fixed = self.params.fixed_gas_enabled.then(|| self.params.fixed_gas.gas_for(&msg));
        if let Some(charge) = fixed {
            if charge > gas_limit {
                return Err(OutOfGas {
                    descriptor: name.to_string(),
                    limit: gas_limit,
                    consumed: charge,
                }
                .into());
            }
        }
        let meter = if fixed.is_some() { GasMeter::infinite() } else { GasMeter::new(gas_limit) };

        let checkpoint = self.ledger.checkpoint();
        let mark = self.events.mark();
        let previous = self.ledger.replace_gas_meter(meter);
        let result = self.route(msg);
        let meter = self.ledger.replace_gas_meter(previous);

        let result = result.and_then(|response| {
            meter.ensure_within_limit()?;
            Ok(TxResponse {
                response,
                gas_used: fixed.unwrap_or_else(|| meter.consumed()),
            })
        });

        match result {
            Ok(response) => {
                self.ledger.discard_checkpoint(checkpoint);
                self.events.commit(self.block.height);
                debug!(msg = name, gas = response.gas_used, "message committed");
                Ok(response)
            }
            Err(err) => {
                self.ledger.rollback_to(checkpoint);
                self.events.rollback_to(mark);
                if err.is_invariant_violation() {
                    error!(msg = name, error = %err, "invariant violation, message aborted");
                } else {
                    debug!(msg = name, code = err.code(), error = %err, "message rejected");
                }
                Err(err)
            }
        }
    }

    fn route(&mut self, msg: ExchangeMsg) -> Result<MsgResponse, ExchangeError> {
        match msg {
            ExchangeMsg::CreateSpotLimitOrder(m) => self.create_spot_limit_order(m.sender, m.order).map(MsgResponse::OrderCreated),
            ExchangeMsg::CreateSpotMarketOrder(m) => self.create_spot_market_order(m.sender, m.order).map(MsgResponse::OrderCreated),
            ExchangeMsg::CreateDerivativeLimitOrder(m) => self
                .create_derivative_limit_order(m.sender, m.order, false)
                .map(MsgResponse::OrderCreated),
            ExchangeMsg::CreateDerivativeMarketOrder(m) => self
                .create_derivative_market_order(m.sender, m.order, false)
                .map(MsgResponse::OrderCreated),
            ExchangeMsg::CreateBinaryOptionsLimitOrder(m) => self
                .create_derivative_limit_order(m.sender, m.order, true)
                .map(MsgResponse::OrderCreated),
            ExchangeMsg::CreateBinaryOptionsMarketOrder(m) => self
                .create_derivative_market_order(m.sender, m.order, true)
                .map(MsgResponse::OrderCreated),
            ExchangeMsg::CancelSpotOrder(m) => self.cancel_spot_order(m.sender, &m.order).map(|_| MsgResponse::OrderCancelled),
            ExchangeMsg::CancelDerivativeOrder(m) => self
                .cancel_derivative_order(m.sender, &m.order, false)
                .map(|_| MsgResponse::OrderCancelled),
            ExchangeMsg::CancelBinaryOptionsOrder(m) => self
                .cancel_derivative_order(m.sender, &m.order, true)
                .map(|_| MsgResponse::OrderCancelled),
            ExchangeMsg::BatchUpdateOrders(m) => self.batch_update_orders(m).map(MsgResponse::BatchUpdateOrders),
            ExchangeMsg::Deposit(m) => self.deposit(m).map(|_| MsgResponse::Empty),
            ExchangeMsg::Withdraw(m) => self.withdraw(m).map(|_| MsgResponse::Empty),
            ExchangeMsg::SubaccountTransfer(m) => self.subaccount_transfer(m).map(|_| MsgResponse::Empty),
            ExchangeMsg::ExternalTransfer(m) => self.external_transfer(m).map(|_| MsgResponse::Empty),
            ExchangeMsg::IncreasePositionMargin(m) => self.increase_position_margin(m).map(|_| MsgResponse::Empty),
            ExchangeMsg::DecreasePositionMargin(m) => self.decrease_position_margin(m).map(|_| MsgResponse::Empty),
        }
    }

    /// Runs `op` so that a failure leaves no trace in the ledger or the pending events.
    /// Gas spent inside stays spent.
    pub(super) fn isolated<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T, ExchangeError>) -> Result<T, ExchangeError> {
        let checkpoint = self.ledger.checkpoint();
        let mark = self.events.mark();
        let result = op(self);
        if result.is_err() {
            self.ledger.rollback_to(checkpoint);
            self.events.rollback_to(mark);
        } else {
            self.ledger.discard_checkpoint(checkpoint);
        }
        result
    }

    /// Unmetered atomic scope for block hooks and governance actions. Commits events on
    /// success.
    pub(super) fn run_unmetered<T>(
        &mut self,
        name: &'static str,
        op: impl FnOnce(&mut Self) -> Result<T, ExchangeError>,
    ) -> Result<T, ExchangeError> {
        let previous = self.ledger.replace_gas_meter(GasMeter::infinite());
        let result = self.isolated(op);
        self.ledger.replace_gas_meter(previous);
        match &result {
            Ok(_) => self.events.commit(self.block.height),
            Err(err) if err.is_invariant_violation() => error!(scope = name, error = %err, "invariant violation"),
            Err(err) => warn!(scope = name, error = %err, "rejected"),
        }
        result
    }

    pub(super) fn ensure_admin(&self, sender: &Address) -> Result<(), ExchangeError> {
        if *sender != self.params.admin {
            return Err(ExchangeError::NotAdmin(*sender));
        }
        Ok(())
    }
}

pub(super) fn ensure_owner(sender: &Address, subaccount: &SubaccountId) -> Result<(), ExchangeError> {
    if subaccount.owner() != *sender {
        return Err(ExchangeError::Unauthorized {
            sender: *sender,
            subaccount: *subaccount,
        });
    }
    Ok(())
}
