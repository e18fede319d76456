// 5.0: per-market collateral. the market balance is everything the module owes to open
// positions in one derivative market; the insurance fund tops it up when a payout would
// otherwise take it below zero. any debit that the two together can't cover is a ledger
// defect and surfaces as an invariant violation.

use crate::invariants::InvariantViolation;
use crate::keys::{decode_signed_dec, market_key, prefix};
use crate::store::{get_signed_dec, get_unsigned_dec, iterate_prefix, set_signed_dec, set_unsigned_dec, Ledger, StoreError};
use crate::types::MarketId;
use rust_decimal::Decimal;
use tracing::error;

pub fn is_market_solvent(available: Decimal, delta: Decimal) -> bool {
    available + delta >= Decimal::ZERO
}

pub fn get_market_balance(ledger: &Ledger, market: &MarketId) -> Result<Decimal, StoreError> {
    get_signed_dec(ledger, &market_key(prefix::MARKET_BALANCES, market))
}

fn set_market_balance(ledger: &mut Ledger, market: &MarketId, balance: Decimal) {
    set_signed_dec(ledger, &market_key(prefix::MARKET_BALANCES, market), balance);
}

pub fn get_insurance_fund(ledger: &Ledger, market: &MarketId) -> Result<Decimal, StoreError> {
    get_unsigned_dec(ledger, &market_key(prefix::INSURANCE_FUNDS, market))
}

pub fn fund_insurance(ledger: &mut Ledger, market: &MarketId, amount: Decimal) -> Result<(), StoreError> {
    let current = get_insurance_fund(ledger, market)?;
    set_unsigned_dec(ledger, &market_key(prefix::INSURANCE_FUNDS, market), current + amount);
    Ok(())
}

/// Market balance plus insurance: the most this market can pay out.
pub fn available_market_funds(ledger: &Ledger, market: &MarketId) -> Result<Decimal, StoreError> {
    Ok(get_market_balance(ledger, market)? + get_insurance_fund(ledger, market)?)
}

/// Checks a pending debit without touching state.
pub fn ensure_solvent(ledger: &Ledger, market: &MarketId, delta: Decimal) -> Result<(), InvariantViolation> {
    let available = available_market_funds(ledger, market)?;
    if is_market_solvent(available, delta) {
        return Ok(());
    }
    error!(market = %market, %available, %delta, "market would become insolvent");
    Err(InvariantViolation::MarketInsolvent {
        market: *market,
        available,
        delta,
    })
}

/// Applies `delta` to the market balance, drawing any shortfall from insurance.
pub fn apply_market_balance_delta(ledger: &mut Ledger, market: &MarketId, delta: Decimal) -> Result<(), InvariantViolation> {
    if delta.is_zero() {
        return Ok(());
    }
    ensure_solvent(ledger, market, delta)?;

    let next = get_market_balance(ledger, market)? + delta;
    if next < Decimal::ZERO {
        let insurance = get_insurance_fund(ledger, market)?;
        set_unsigned_dec(ledger, &market_key(prefix::INSURANCE_FUNDS, market), insurance + next);
        set_market_balance(ledger, market, Decimal::ZERO);
    } else {
        set_market_balance(ledger, market, next);
    }
    Ok(())
}

/// Drops the balance record after settlement and hands back what was left.
pub fn clear_market_balance(ledger: &mut Ledger, market: &MarketId) -> Result<Decimal, StoreError> {
    let remaining = get_market_balance(ledger, market)?;
    set_market_balance(ledger, market, Decimal::ZERO);
    Ok(remaining)
}

pub fn all_market_balances(ledger: &Ledger) -> Result<Vec<(MarketId, Decimal)>, StoreError> {
    let mut out = Vec::new();
    iterate_prefix(ledger, &[prefix::MARKET_BALANCES], false, |k, v| {
        let market = MarketId::from_slice(&k[1..]).ok_or_else(|| StoreError::corrupted(k, "bad market id"))?;
        let balance = decode_signed_dec(v).map_err(|e| StoreError::corrupted(k, e))?;
        out.push((market, balance));
        Ok::<bool, StoreError>(false)
    })?;
    Ok(out)
}

// 5.1: open interest, in base quantity

pub fn get_open_interest(ledger: &Ledger, market: &MarketId) -> Result<Decimal, StoreError> {
    get_unsigned_dec(ledger, &market_key(prefix::OPEN_INTEREST, market))
}

/// Fills only ever close quantity that was opened, so a negative total is a desync.
pub fn apply_open_interest_delta(ledger: &mut Ledger, market: &MarketId, delta: Decimal) -> Result<(), InvariantViolation> {
    if delta.is_zero() {
        return Ok(());
    }
    let next = get_open_interest(ledger, market)? + delta;
    if next < Decimal::ZERO {
        error!(market = %market, %delta, "open interest would go negative");
        return Err(InvariantViolation::NegativeOpenInterest {
            market: *market,
            open_interest: next,
        });
    }
    set_unsigned_dec(ledger, &market_key(prefix::OPEN_INTEREST, market), next);
    Ok(())
}

pub fn clear_open_interest(ledger: &mut Ledger, market: &MarketId) {
    set_unsigned_dec(ledger, &market_key(prefix::OPEN_INTEREST, market), Decimal::ZERO);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const M: MarketId = MarketId([5; 32]);

    #[test]
    fn insurance_covers_shortfall() {
        let mut ledger = Ledger::new();
        apply_market_balance_delta(&mut ledger, &M, dec!(100)).unwrap();
        fund_insurance(&mut ledger, &M, dec!(50)).unwrap();

        apply_market_balance_delta(&mut ledger, &M, dec!(-120)).unwrap();
        assert_eq!(get_market_balance(&ledger, &M).unwrap(), dec!(0));
        assert_eq!(get_insurance_fund(&ledger, &M).unwrap(), dec!(30));
    }

    #[test]
    fn insolvent_debit_is_rejected_untouched() {
        let mut ledger = Ledger::new();
        apply_market_balance_delta(&mut ledger, &M, dec!(10)).unwrap();
        let err = apply_market_balance_delta(&mut ledger, &M, dec!(-10.01)).unwrap_err();
        assert!(matches!(err, InvariantViolation::MarketInsolvent { .. }));
        assert_eq!(get_market_balance(&ledger, &M).unwrap(), dec!(10));
    }

    #[test]
    fn open_interest_underflow_is_rejected() {
        let mut ledger = Ledger::new();
        apply_open_interest_delta(&mut ledger, &M, dec!(2)).unwrap();
        let err = apply_open_interest_delta(&mut ledger, &M, dec!(-3)).unwrap_err();
        assert_eq!(
            err,
            InvariantViolation::NegativeOpenInterest {
                market: M,
                open_interest: dec!(-1),
            }
        );
        assert_eq!(get_open_interest(&ledger, &M).unwrap(), dec!(2));
        apply_open_interest_delta(&mut ledger, &M, dec!(-2)).unwrap();
        assert_eq!(get_open_interest(&ledger, &M).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn balances_listed_by_market() {
        let mut ledger = Ledger::new();
        apply_market_balance_delta(&mut ledger, &M, dec!(4.5)).unwrap();
        assert_eq!(all_market_balances(&ledger).unwrap(), vec![(M, dec!(4.5))]);
    }
}
