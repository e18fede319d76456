// 6.0: open position tracking. pnl = quantity * (exit - entry) * direction.
// 6.1 has the open/increase/reduce/flip logic, 6.2 the records in the store.
//
// a position exists only while quantity > 0. every fill goes through
// apply_position_delta, which says what the trader gets back (payout), which part of the
// order margin went unused (close_execution_margin) and how much new margin now backs
// the position (collateralization_margin). the caller routes those three amounts.

use crate::keys::{market_key, market_subaccount_key, prefix};
use crate::store::{get_record, iterate_prefix, set_record, unmarshal, KvStore, Ledger, StoreError};
use crate::types::{MarketId, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub is_long: bool,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub margin: Decimal,
    pub cumulative_funding_entry: Decimal,
}

/// One fill from the position holder's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionDelta {
    pub is_long: bool,
    pub execution_quantity: Decimal,
    pub execution_margin: Decimal,
    pub execution_price: Decimal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionOutcome {
    /// owed to the trader for the closed part (closing margin + pnl - closing fee);
    /// negative means the closed part is below bankruptcy
    pub payout: Decimal,
    /// order margin not needed because the fill closed instead of opened
    pub close_execution_margin: Decimal,
    /// order margin that now backs the position
    pub collateralization_margin: Decimal,
    pub pnl: Decimal,
}

impl Position {
    pub fn new(is_long: bool, cumulative_funding_entry: Decimal) -> Self {
        Self {
            is_long,
            quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            margin: Decimal::ZERO,
            cumulative_funding_entry,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.quantity.is_zero()
    }

    fn direction(&self) -> Decimal {
        if self.is_long {
            Decimal::ONE
        } else {
            Decimal::NEGATIVE_ONE
        }
    }

    // 6.0: paper gains/losses based on current price
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        self.quantity * (mark_price - self.entry_price) * self.direction()
    }

    pub fn notional(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }

    /// `(margin + unrealized pnl - fee) / (mark * quantity)`.
    pub fn effective_margin_ratio(&self, mark_price: Decimal, closing_fee: Decimal) -> Decimal {
        let notional = self.notional(mark_price);
        if notional.is_zero() {
            return Decimal::MAX;
        }
        (self.margin + self.unrealized_pnl(mark_price) - closing_fee) / notional
    }

    /// Settles accrued funding into margin and moves the cursor. A second call with the
    /// same cumulative value changes nothing.
    pub fn apply_funding(&mut self, cumulative_funding: Decimal) -> Decimal {
        let diff = cumulative_funding - self.cumulative_funding_entry;
        self.cumulative_funding_entry = cumulative_funding;
        if diff.is_zero() || self.is_empty() {
            return Decimal::ZERO;
        }
        // longs pay positive funding
        let payment = diff * self.quantity * self.direction();
        self.margin -= payment;
        payment
    }

    /// Payout for closing the whole position at `price` with no fee.
    pub fn settlement_payout(&self, price: Decimal) -> Decimal {
        self.margin + self.unrealized_pnl(price)
    }

    // 6.1: the trade itself
    pub fn apply_position_delta(&mut self, delta: &PositionDelta, closing_fee: Decimal) -> PositionOutcome {
        if delta.execution_quantity.is_zero() {
            return PositionOutcome::default();
        }

        // opening or adding: weighted average entry
        if self.is_empty() || self.is_long == delta.is_long {
            let new_quantity = self.quantity + delta.execution_quantity;
            self.entry_price =
                (self.quantity * self.entry_price + delta.execution_quantity * delta.execution_price) / new_quantity;
            self.quantity = new_quantity;
            self.margin += delta.execution_margin;
            self.is_long = delta.is_long;
            return PositionOutcome {
                collateralization_margin: delta.execution_margin,
                ..PositionOutcome::default()
            };
        }

        // reducing, closing, maybe flipping
        let closing_quantity = self.quantity.min(delta.execution_quantity);
        let close_execution_margin = delta.execution_margin * closing_quantity / delta.execution_quantity;
        let position_closing_margin = self.margin * closing_quantity / self.quantity;
        let pnl = closing_quantity * (delta.execution_price - self.entry_price) * self.direction();
        let payout = position_closing_margin + pnl - closing_fee;

        self.quantity -= closing_quantity;
        self.margin -= position_closing_margin;

        let mut outcome = PositionOutcome {
            payout,
            close_execution_margin,
            collateralization_margin: Decimal::ZERO,
            pnl,
        };

        let remaining = delta.execution_quantity - closing_quantity;
        if self.quantity.is_zero() {
            self.margin = Decimal::ZERO;
            self.entry_price = Decimal::ZERO;
        }
        if remaining > Decimal::ZERO {
            let flip_margin = delta.execution_margin - close_execution_margin;
            self.is_long = delta.is_long;
            self.quantity = remaining;
            self.entry_price = delta.execution_price;
            self.margin = flip_margin;
            outcome.collateralization_margin = flip_margin;
        }
        outcome
    }

    /// Quantity of a fill that closes rather than opens.
    pub fn closing_quantity(&self, is_long: bool, quantity: Decimal) -> Decimal {
        if self.is_empty() || self.is_long == is_long {
            Decimal::ZERO
        } else {
            self.quantity.min(quantity)
        }
    }
}

// 6.2: records, keyed (market ‖ subaccount)

fn position_key(market: &MarketId, subaccount: &SubaccountId) -> Vec<u8> {
    market_subaccount_key(prefix::POSITIONS, market, subaccount)
}

pub fn get_position(ledger: &Ledger, market: &MarketId, subaccount: &SubaccountId) -> Result<Option<Position>, StoreError> {
    get_record(ledger, &position_key(market, subaccount))
}

/// Zero quantity deletes the record.
pub fn set_position(ledger: &mut Ledger, market: &MarketId, subaccount: &SubaccountId, position: &Position) -> Result<(), StoreError> {
    let key = position_key(market, subaccount);
    if position.is_empty() {
        ledger.delete(&key);
        Ok(())
    } else {
        set_record(ledger, &key, position)
    }
}

pub fn market_positions(ledger: &Ledger, market: &MarketId) -> Result<Vec<(SubaccountId, Position)>, StoreError> {
    let market_prefix = market_key(prefix::POSITIONS, market);
    let mut out = Vec::new();
    iterate_prefix(ledger, &market_prefix, false, |k, v| {
        let sub = SubaccountId::from_slice(&k[market_prefix.len()..])
            .ok_or_else(|| StoreError::corrupted(k, "bad position key"))?;
        out.push((sub, unmarshal::<Position>(k, v)?));
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

pub fn has_position(ledger: &Ledger, market: &MarketId, subaccount: &SubaccountId) -> bool {
    ledger.has(&position_key(market, subaccount))
}
