//! Deposits, withdrawals and transfers between subaccounts.

use super::core::{ensure_owner, Engine};
use super::results::ExchangeError;
use crate::deposits::{credit, debit, transfer, BankLedger, DepositError};
use crate::events::{BalanceChangeEvent, BalanceTransferEvent, EventPayload};
use crate::msgs::{MsgDeposit, MsgTransfer, MsgWithdraw};
use rust_decimal::Decimal;
use tracing::debug;

impl Engine {
    /// Bank to subaccount. The default subaccount is the bank balance itself, so it takes
    /// no deposits.
    pub(super) fn deposit(&mut self, msg: MsgDeposit) -> Result<(), ExchangeError> {
        ensure_owner(&msg.sender, &msg.subaccount_id)?;
        if msg.subaccount_id.is_default() {
            return Err(DepositError::DefaultSubaccountDeposit.into());
        }
        if msg.amount.amount <= Decimal::ZERO {
            return Err(DepositError::InvalidAmount(msg.amount.amount).into());
        }
        self.ledger.send_to_module(&msg.sender, &msg.amount)?;
        credit(&mut self.ledger, &msg.subaccount_id, &msg.amount.denom, msg.amount.amount)?;
        debug!(subaccount = %msg.subaccount_id, amount = %msg.amount, "deposit");
        self.emit(EventPayload::SubaccountDeposit(BalanceChangeEvent {
            subaccount_id: msg.subaccount_id,
            denom: msg.amount.denom,
            amount: msg.amount.amount,
        }));
        Ok(())
    }

    /// Subaccount to bank, out of available balance only.
    pub(super) fn withdraw(&mut self, msg: MsgWithdraw) -> Result<(), ExchangeError> {
        ensure_owner(&msg.sender, &msg.subaccount_id)?;
        if msg.subaccount_id.is_default() {
            return Err(ExchangeError::InvalidTransfer("the default subaccount is already the bank balance".into()));
        }
        debit(&mut self.ledger, &msg.subaccount_id, &msg.amount.denom, msg.amount.amount)?;
        self.ledger.send_from_module(&msg.sender, &msg.amount)?;
        debug!(subaccount = %msg.subaccount_id, amount = %msg.amount, "withdraw");
        self.emit(EventPayload::SubaccountWithdraw(BalanceChangeEvent {
            subaccount_id: msg.subaccount_id,
            denom: msg.amount.denom,
            amount: msg.amount.amount,
        }));
        Ok(())
    }

    /// Between two subaccounts of the same owner.
    pub(super) fn subaccount_transfer(&mut self, msg: MsgTransfer) -> Result<(), ExchangeError> {
        ensure_owner(&msg.sender, &msg.source_subaccount_id)?;
        if msg.destination_subaccount_id.owner() != msg.sender {
            return Err(ExchangeError::InvalidTransfer("destination belongs to another owner".into()));
        }
        if msg.source_subaccount_id == msg.destination_subaccount_id {
            return Err(ExchangeError::InvalidTransfer("source and destination are the same".into()));
        }
        self.move_between(msg)
    }

    /// To any owner's subaccount, except a default one.
    pub(super) fn external_transfer(&mut self, msg: MsgTransfer) -> Result<(), ExchangeError> {
        ensure_owner(&msg.sender, &msg.source_subaccount_id)?;
        if msg.destination_subaccount_id.is_default() {
            return Err(ExchangeError::InvalidTransfer("cannot transfer into a default subaccount".into()));
        }
        if msg.source_subaccount_id == msg.destination_subaccount_id {
            return Err(ExchangeError::InvalidTransfer("source and destination are the same".into()));
        }
        self.move_between(msg)
    }

    fn move_between(&mut self, msg: MsgTransfer) -> Result<(), ExchangeError> {
        transfer(
            &mut self.ledger,
            &msg.source_subaccount_id,
            &msg.destination_subaccount_id,
            &msg.amount.denom,
            msg.amount.amount,
        )?;
        self.emit(EventPayload::SubaccountBalanceTransfer(BalanceTransferEvent {
            source: msg.source_subaccount_id,
            destination: msg.destination_subaccount_id,
            denom: msg.amount.denom,
            amount: msg.amount.amount,
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{sub, trader, Harness};
    use crate::msgs::{ExchangeMsg, MsgDeposit, MsgTransfer, MsgWithdraw};
    use crate::types::{Coin, SubaccountId};
    use rust_decimal_macros::dec;

    #[test]
    fn default_subaccount_takes_no_deposits_or_withdrawals() {
        let mut h = Harness::new();
        let owner = trader(1);
        h.engine.mint(&owner, &Coin::new("usdt", dec!(100))).unwrap();
        let default = SubaccountId::new(owner, 0);

        let deposit = ExchangeMsg::Deposit(MsgDeposit {
            sender: owner,
            subaccount_id: default,
            amount: Coin::new("usdt", dec!(10)),
        });
        assert_eq!(h.engine.deliver(deposit).unwrap_err().code(), "default_subaccount_deposit");

        let withdraw = ExchangeMsg::Withdraw(MsgWithdraw {
            sender: owner,
            subaccount_id: default,
            amount: Coin::new("usdt", dec!(10)),
        });
        assert_eq!(h.engine.deliver(withdraw).unwrap_err().code(), "invalid_transfer");
        assert_eq!(h.engine.bank_balance(&owner, "usdt").unwrap(), dec!(100));
    }

    #[test]
    fn withdraw_only_from_available_balance() {
        let mut h = Harness::new();
        let market = h.spot_market();
        let alice = h.fund(1, "usdt", dec!(100));
        h.spot_limit(crate::order::SpotOrder::limit(
            market,
            crate::order::OrderInfo::new(alice, dec!(10), dec!(5)),
            crate::order::OrderType::Buy,
        ))
        .unwrap();

        let withdraw = |amount| {
            ExchangeMsg::Withdraw(MsgWithdraw {
                sender: trader(1),
                subaccount_id: alice,
                amount: Coin::new("usdt", amount),
            })
        };
        assert_eq!(h.engine.deliver(withdraw(dec!(60))).unwrap_err().code(), "insufficient_deposit");
        h.engine.deliver(withdraw(dec!(49.9))).unwrap();
        assert_eq!(h.engine.bank_balance(&trader(1), "usdt").unwrap(), dec!(49.9));
        assert_eq!(h.available(&alice, "usdt"), dec!(0));
        assert_eq!(h.total(&alice, "usdt"), dec!(50.1));
    }

    #[test]
    fn transfers_respect_owners_and_default_subaccounts() {
        let mut h = Harness::new();
        let alice = h.fund(1, "usdt", dec!(100));
        let alice_two = SubaccountId::new(trader(1), 2);
        let transfer = |destination, amount| MsgTransfer {
            sender: trader(1),
            source_subaccount_id: alice,
            destination_subaccount_id: destination,
            amount: Coin::new("usdt", amount),
        };

        h.engine
            .deliver(ExchangeMsg::SubaccountTransfer(transfer(alice_two, dec!(30))))
            .unwrap();
        assert_eq!(h.available(&alice_two, "usdt"), dec!(30));

        let to_other_owner = ExchangeMsg::SubaccountTransfer(transfer(sub(2), dec!(10)));
        assert_eq!(h.engine.deliver(to_other_owner).unwrap_err().code(), "invalid_transfer");
        h.engine.deliver(ExchangeMsg::ExternalTransfer(transfer(sub(2), dec!(10)))).unwrap();
        assert_eq!(h.available(&sub(2), "usdt"), dec!(10));

        let into_default = ExchangeMsg::ExternalTransfer(transfer(SubaccountId::new(trader(2), 0), dec!(10)));
        assert_eq!(h.engine.deliver(into_default).unwrap_err().code(), "invalid_transfer");
        assert_eq!(h.available(&alice, "usdt"), dec!(60));
        h.engine.check_invariants().unwrap();
    }
}
