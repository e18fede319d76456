//! Adding and removing margin on an open position.

use super::core::{ensure_owner, Engine};
use super::results::ExchangeError;
use crate::deposits::{credit, debit, DepositError};
use crate::events::{EventPayload, PositionUpdateEvent};
use crate::funding::cumulative_funding;
use crate::margin::check_margin_decrease;
use crate::market::{AnyDerivativeMarket, DerivativeMarketLike, MarketInfo};
use crate::market_balance::apply_market_balance_delta;
use crate::msgs::MsgPositionMargin;
use crate::position::{get_position, set_position, Position};
use crate::types::{MarketId, SubaccountId};
use rust_decimal::Decimal;
use tracing::debug;

impl Engine {
    fn margin_target(&self, msg: &MsgPositionMargin, holder: &SubaccountId) -> Result<(AnyDerivativeMarket, Position), ExchangeError> {
        if msg.amount <= Decimal::ZERO {
            return Err(DepositError::InvalidAmount(msg.amount).into());
        }
        let market = self.load_derivative_market(&msg.market_id, false)?;
        if !market.is_active() {
            return Err(ExchangeError::MarketNotActive(msg.market_id));
        }
        let mut position = get_position(&self.ledger, &msg.market_id, holder)?
            .filter(|p| !p.is_empty())
            .ok_or(ExchangeError::PositionNotFound(msg.market_id))?;
        position.apply_funding(cumulative_funding(&self.ledger, &msg.market_id)?);
        Ok((market, position))
    }

    fn store_position(&mut self, market_id: MarketId, holder: SubaccountId, position: Position) -> Result<(), ExchangeError> {
        set_position(&mut self.ledger, &market_id, &holder, &position)?;
        self.emit(EventPayload::PositionUpdate(PositionUpdateEvent {
            market_id,
            subaccount_id: holder,
            position,
        }));
        Ok(())
    }

    /// Moves available balance from the source subaccount into the destination's
    /// position. Anyone may top up anyone's position.
    pub(super) fn increase_position_margin(&mut self, msg: MsgPositionMargin) -> Result<(), ExchangeError> {
        ensure_owner(&msg.sender, &msg.source_subaccount_id)?;
        let holder = msg.destination_subaccount_id;
        let (market, mut position) = self.margin_target(&msg, &holder)?;

        debit(&mut self.ledger, &msg.source_subaccount_id, market.quote_denom(), msg.amount)?;
        position.margin += msg.amount;
        apply_market_balance_delta(&mut self.ledger, &msg.market_id, msg.amount)?;
        debug!(market = %msg.market_id, subaccount = %holder, amount = %msg.amount, "position margin added");
        self.store_position(msg.market_id, holder, position)
    }

    /// Pulls margin out of the sender's position into one of the sender's subaccounts.
    /// The position has to stay at or above the initial margin ratio at mark.
    pub(super) fn decrease_position_margin(&mut self, msg: MsgPositionMargin) -> Result<(), ExchangeError> {
        ensure_owner(&msg.sender, &msg.source_subaccount_id)?;
        ensure_owner(&msg.sender, &msg.destination_subaccount_id)?;
        let holder = msg.source_subaccount_id;
        let (market, mut position) = self.margin_target(&msg, &holder)?;

        let mark = self.require_mark_price(&market)?;
        check_margin_decrease(&position, msg.amount, mark, market.initial_margin_ratio())?;
        position.margin -= msg.amount;
        apply_market_balance_delta(&mut self.ledger, &msg.market_id, -msg.amount)?;
        credit(&mut self.ledger, &msg.destination_subaccount_id, market.quote_denom(), msg.amount)?;
        debug!(market = %msg.market_id, subaccount = %holder, amount = %msg.amount, "position margin removed");
        self.store_position(msg.market_id, holder, position)
    }
}
