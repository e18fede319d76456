//! Subaccount deposits and the bank they settle against.
//!
//! A deposit is `(subaccount, denom) -> {available, total}`. `available` is what new orders
//! and withdrawals may use, `total` additionally includes funds held by resting orders.
//! Default subaccounts (nonce 0) keep only fractional dust here; whole units live in the
//! owner's bank balance and are pulled back in when a hold needs them.

use crate::invariants::InvariantViolation;
use crate::keys::{deposit_key, prefix, KeyBuilder};
use crate::store::{
    collect_prefix, get_record, get_unsigned_dec, iterate_prefix, set_record, set_unsigned_dec, unmarshal, KvStore,
    Ledger, StoreError,
};
use crate::types::{Address, Coin, SubaccountId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Dust allowed between available and total before the balance check trips.
pub const BALANCE_TOLERANCE: Decimal = dec!(0.000001);

/// Bank account holding every deposit that isn't a default-subaccount bank balance.
pub const MODULE_ADDRESS: Address = Address([0xee; 20]);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub available_balance: Decimal,
    pub total_balance: Decimal,
}

impl Deposit {
    pub fn is_empty(&self) -> bool {
        self.available_balance.is_zero() && self.total_balance.is_zero()
    }

    pub fn held(&self) -> Decimal {
        self.total_balance - self.available_balance
    }

    /// `0 ≤ available ≤ total + tolerance`, with total never negative.
    pub fn is_within_bounds(&self) -> bool {
        self.available_balance >= Decimal::ZERO
            && self.total_balance >= Decimal::ZERO
            && self.available_balance - self.total_balance <= BALANCE_TOLERANCE
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DepositError {
    #[error("insufficient deposit in {subaccount} for {denom}: required {required}, available {available}")]
    InsufficientDeposit {
        subaccount: SubaccountId,
        denom: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("insufficient bank balance for {owner}: required {required}{denom}, available {available}")]
    InsufficientBankBalance {
        owner: Address,
        denom: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("deposits into the default subaccount go through the bank")]
    DefaultSubaccountDeposit,

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// 3.0: bank collaborator

/// External account balances. Deposits move funds between an owner and the module account.
pub trait BankLedger {
    fn bank_balance(&self, owner: &Address, denom: &str) -> Result<Decimal, StoreError>;
    fn send_to_module(&mut self, from: &Address, coin: &Coin) -> Result<(), DepositError>;
    fn send_from_module(&mut self, to: &Address, coin: &Coin) -> Result<(), DepositError>;
    fn mint(&mut self, to: &Address, coin: &Coin) -> Result<(), DepositError>;
}

fn bank_key(owner: &Address, denom: &str) -> Vec<u8> {
    KeyBuilder::new(prefix::BANK_BALANCES)
        .bytes(owner.as_bytes())
        .bytes(denom.as_bytes())
        .build()
}

fn bank_move(ledger: &mut Ledger, from: &Address, to: &Address, coin: &Coin) -> Result<(), DepositError> {
    if coin.amount <= Decimal::ZERO {
        return Err(DepositError::InvalidAmount(coin.amount));
    }
    let from_key = bank_key(from, &coin.denom);
    let available = get_unsigned_dec(ledger, &from_key)?;
    if available < coin.amount {
        return Err(DepositError::InsufficientBankBalance {
            owner: *from,
            denom: coin.denom.clone(),
            required: coin.amount,
            available,
        });
    }
    set_unsigned_dec(ledger, &from_key, available - coin.amount);
    let to_key = bank_key(to, &coin.denom);
    let current = get_unsigned_dec(ledger, &to_key)?;
    set_unsigned_dec(ledger, &to_key, current + coin.amount);
    Ok(())
}

// store-backed so a reverted message reverts its bank effects too
impl BankLedger for Ledger {
    fn bank_balance(&self, owner: &Address, denom: &str) -> Result<Decimal, StoreError> {
        get_unsigned_dec(self, &bank_key(owner, denom))
    }

    fn send_to_module(&mut self, from: &Address, coin: &Coin) -> Result<(), DepositError> {
        bank_move(self, from, &MODULE_ADDRESS, coin)
    }

    fn send_from_module(&mut self, to: &Address, coin: &Coin) -> Result<(), DepositError> {
        bank_move(self, &MODULE_ADDRESS, to, coin)
    }

    fn mint(&mut self, to: &Address, coin: &Coin) -> Result<(), DepositError> {
        if coin.amount <= Decimal::ZERO {
            return Err(DepositError::InvalidAmount(coin.amount));
        }
        let key = bank_key(to, &coin.denom);
        let current = get_unsigned_dec(self, &key)?;
        set_unsigned_dec(self, &key, current + coin.amount);
        Ok(())
    }
}

// 3.1: deposit records

pub fn get_deposit(ledger: &Ledger, subaccount: &SubaccountId, denom: &str) -> Result<Deposit, StoreError> {
    Ok(get_record(ledger, &deposit_key(subaccount, denom))?.unwrap_or_default())
}

/// Writes the record (deleting it when empty) and marks the pair for the block's batch
/// deposit event.
pub fn set_deposit(ledger: &mut Ledger, subaccount: &SubaccountId, denom: &str, deposit: &Deposit) -> Result<(), StoreError> {
    let key = deposit_key(subaccount, denom);
    if deposit.is_empty() {
        ledger.delete(&key);
    } else {
        set_record(ledger, &key, deposit)?;
    }
    mark_touched(ledger, subaccount, denom);
    Ok(())
}

fn touched_key(subaccount: &SubaccountId, denom: &str) -> Vec<u8> {
    KeyBuilder::new(prefix::TRANSIENT_DEPOSIT_TOUCHED)
        .bytes(subaccount.as_bytes())
        .bytes(denom.as_bytes())
        .build()
}

fn mark_touched(ledger: &mut Ledger, subaccount: &SubaccountId, denom: &str) {
    ledger.transient_mut().set(&touched_key(subaccount, denom), Vec::new());
}

/// Pairs touched this block, in key order.
pub fn touched_deposits(ledger: &Ledger) -> Vec<(SubaccountId, String)> {
    collect_prefix(ledger.transient(), &[prefix::TRANSIENT_DEPOSIT_TOUCHED], false)
        .into_iter()
        .filter_map(|(suffix, _)| split_subaccount_denom(&suffix))
        .collect()
}

fn split_subaccount_denom(suffix: &[u8]) -> Option<(SubaccountId, String)> {
    if suffix.len() < SubaccountId::LEN {
        return None;
    }
    let sub = SubaccountId::from_slice(&suffix[..SubaccountId::LEN])?;
    let denom = String::from_utf8(suffix[SubaccountId::LEN..].to_vec()).ok()?;
    Some((sub, denom))
}

pub fn all_deposits(ledger: &Ledger) -> Result<Vec<(SubaccountId, String, Deposit)>, StoreError> {
    let mut out = Vec::new();
    iterate_prefix(ledger, &[prefix::DEPOSITS], false, |k, v| {
        let (sub, denom) =
            split_subaccount_denom(&k[1..]).ok_or_else(|| StoreError::corrupted(k, "bad deposit key"))?;
        out.push((sub, denom, unmarshal::<Deposit>(k, v)?));
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

/// Applies signed deltas to both balances. Default subaccounts then sweep whole units of
/// available balance out to the owner's bank account.
pub fn apply_deposit_delta(
    ledger: &mut Ledger,
    subaccount: &SubaccountId,
    denom: &str,
    available_delta: Decimal,
    total_delta: Decimal,
) -> Result<Deposit, DepositError> {
    let mut deposit = get_deposit(ledger, subaccount, denom)?;
    deposit.available_balance += available_delta;
    deposit.total_balance += total_delta;

    if subaccount.is_default() {
        let whole = deposit.available_balance.floor();
        if whole >= Decimal::ONE {
            deposit.available_balance -= whole;
            deposit.total_balance -= whole;
            ledger.send_from_module(&subaccount.owner(), &Coin::new(denom, whole))?;
        }
    }

    ensure_within_bounds(subaccount, denom, &deposit)?;
    set_deposit(ledger, subaccount, denom, &deposit)?;
    Ok(deposit)
}

/// Refuses a deposit that broke its bounds. Nothing calls this with user input, so a
/// failure is a ledger defect.
pub fn ensure_within_bounds(subaccount: &SubaccountId, denom: &str, deposit: &Deposit) -> Result<(), InvariantViolation> {
    if deposit.is_within_bounds() {
        return Ok(());
    }
    error!(
        subaccount = %subaccount,
        denom,
        available = %deposit.available_balance,
        total = %deposit.total_balance,
        "deposit out of bounds"
    );
    Err(InvariantViolation::DepositOutOfBounds {
        subaccount: *subaccount,
        denom: denom.to_string(),
        available: deposit.available_balance,
        total: deposit.total_balance,
    })
}

/// New funds: raises both balances.
pub fn credit(ledger: &mut Ledger, subaccount: &SubaccountId, denom: &str, amount: Decimal) -> Result<(), DepositError> {
    if amount.is_zero() {
        return Ok(());
    }
    apply_deposit_delta(ledger, subaccount, denom, amount, amount).map(|_| ())
}

/// Moves `amount` from available into held. Default subaccounts first pull the missing
/// whole units back from the bank.
pub fn hold(ledger: &mut Ledger, subaccount: &SubaccountId, denom: &str, amount: Decimal) -> Result<(), DepositError> {
    if amount.is_zero() {
        return Ok(());
    }
    let mut deposit = get_deposit(ledger, subaccount, denom)?;
    if subaccount.is_default() && deposit.available_balance < amount {
        let pull = (amount - deposit.available_balance).ceil();
        let owner = subaccount.owner();
        let in_bank = ledger.bank_balance(&owner, denom)?;
        if in_bank < pull {
            return Err(DepositError::InsufficientDeposit {
                subaccount: *subaccount,
                denom: denom.to_string(),
                required: amount,
                available: deposit.available_balance + in_bank,
            });
        }
        ledger.send_to_module(&owner, &Coin::new(denom, pull))?;
        deposit.available_balance += pull;
        deposit.total_balance += pull;
    }

    if deposit.available_balance < amount {
        return Err(DepositError::InsufficientDeposit {
            subaccount: *subaccount,
            denom: denom.to_string(),
            required: amount,
            available: deposit.available_balance,
        });
    }
    deposit.available_balance -= amount;
    set_deposit(ledger, subaccount, denom, &deposit)?;
    Ok(())
}

/// Returns held funds to available.
pub fn release(ledger: &mut Ledger, subaccount: &SubaccountId, denom: &str, amount: Decimal) -> Result<(), DepositError> {
    if amount.is_zero() {
        return Ok(());
    }
    apply_deposit_delta(ledger, subaccount, denom, amount, Decimal::ZERO).map(|_| ())
}

/// Spends held funds: total drops, available was already reduced by the hold.
pub fn charge_held(ledger: &mut Ledger, subaccount: &SubaccountId, denom: &str, amount: Decimal) -> Result<(), DepositError> {
    if amount.is_zero() {
        return Ok(());
    }
    apply_deposit_delta(ledger, subaccount, denom, Decimal::ZERO, -amount).map(|_| ())
}

/// Removes available funds outright (withdrawals, transfers out, margin top-ups).
pub fn debit(ledger: &mut Ledger, subaccount: &SubaccountId, denom: &str, amount: Decimal) -> Result<(), DepositError> {
    if amount <= Decimal::ZERO {
        return Err(DepositError::InvalidAmount(amount));
    }
    hold(ledger, subaccount, denom, amount)?;
    charge_held(ledger, subaccount, denom, amount)
}

pub fn transfer(
    ledger: &mut Ledger,
    from: &SubaccountId,
    to: &SubaccountId,
    denom: &str,
    amount: Decimal,
) -> Result<(), DepositError> {
    debit(ledger, from, denom, amount)?;
    credit(ledger, to, denom, amount)
}

// 3.2: collected fees

fn fee_pool_key(denom: &str) -> Vec<u8> {
    KeyBuilder::new(prefix::FEE_POOL).bytes(denom.as_bytes()).build()
}

pub fn add_to_fee_pool(ledger: &mut Ledger, denom: &str, amount: Decimal) -> Result<(), StoreError> {
    if amount.is_zero() {
        return Ok(());
    }
    let key = fee_pool_key(denom);
    let current = get_unsigned_dec(ledger, &key)?;
    set_unsigned_dec(ledger, &key, (current + amount).max(Decimal::ZERO));
    Ok(())
}

pub fn fee_pool(ledger: &Ledger, denom: &str) -> Result<Decimal, StoreError> {
    get_unsigned_dec(ledger, &fee_pool_key(denom))
}
