//! Margin checks for derivative and binary-option orders and positions.
//!
//! An order must bring at least `IMR × price × quantity` of margin, and must stay above
//! the same ratio once the gap between its price and the mark price is taken into
//! account: a buy above the mark is immediately underwater by `(price - mark) × quantity`.
//! Binary options are fully collateralised, so their margin is derived rather than
//! supplied.
//!
//! Positions are checked against the effective margin ratio at mark. Removing margin
//! needs the ratio to stay at or above IMR.

use crate::market::DerivativeMarketLike;
use crate::order::DerivativeLimitOrder;
use crate::orderbook::{get_metadata, subaccount_orders};
use crate::position::Position;
use crate::store::{Ledger, StoreError};
use crate::types::{MarketId, Side, SubaccountId};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarginError {
    #[error("order margin {provided} below required {required}")]
    InsufficientOrderMargin { required: Decimal, provided: Decimal },

    #[error("order margin {provided} below mark-adjusted requirement {required}")]
    MarkPriceMarginViolation { required: Decimal, provided: Decimal },

    #[error("margin ratio {ratio} below required {required}")]
    MarginRatioTooLow { ratio: Decimal, required: Decimal },

    #[error("no position to reduce")]
    NoPositionToReduce,

    #[error("reduce-only order must close the opposite side of the position")]
    ReduceOnlyWrongDirection,

    #[error("reduce-only quantity {requested} exceeds position {position}")]
    ReduceOnlyExceedsPosition { requested: Decimal, position: Decimal },

    #[error("open notional {notional} would exceed cap {cap}")]
    OpenNotionalCapExceeded { notional: Decimal, cap: Decimal },

    #[error("fill below bankruptcy price")]
    Bankrupt,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `quantity × (IMR × mark - (mark - price) × sign)`, the margin an order needs once its
/// distance from the mark is priced in. Can be negative for orders well inside the mark.
pub fn mark_adjusted_requirement(imr: Decimal, price: Decimal, quantity: Decimal, mark: Decimal, side: Side) -> Decimal {
    quantity * (imr * mark - (mark - price) * side.sign())
}

/// Validates the margin supplied with a vanilla order. Binary markets skip the mark check,
/// their requirement already covers the full payout.
pub fn check_order_margin<M: DerivativeMarketLike + ?Sized>(
    market: &M,
    side: Side,
    price: Decimal,
    quantity: Decimal,
    margin: Decimal,
    mark_price: Option<Decimal>,
) -> Result<(), MarginError> {
    let required = market.order_margin_requirement(price, quantity, side);
    if margin < required {
        return Err(MarginError::InsufficientOrderMargin { required, provided: margin });
    }
    if market.is_fully_collateralized() {
        return Ok(());
    }
    if let Some(mark) = mark_price {
        let required = mark_adjusted_requirement(market.initial_margin_ratio(), price, quantity, mark, side);
        if margin < required {
            return Err(MarginError::MarkPriceMarginViolation { required, provided: margin });
        }
    }
    Ok(())
}

pub fn check_margin_ratio(position: &Position, mark_price: Decimal, closing_fee: Decimal, required: Decimal) -> Result<(), MarginError> {
    let ratio = position.effective_margin_ratio(mark_price, closing_fee);
    if ratio < required {
        return Err(MarginError::MarginRatioTooLow { ratio, required });
    }
    Ok(())
}

/// Largest amount that can be withdrawn from a position's margin while keeping the
/// effective ratio at IMR.
pub fn max_margin_decrease(position: &Position, mark_price: Decimal, imr: Decimal) -> Decimal {
    let required = imr * position.notional(mark_price);
    (position.margin + position.unrealized_pnl(mark_price) - required)
        .min(position.margin)
        .max(Decimal::ZERO)
}

pub fn check_margin_decrease(position: &Position, amount: Decimal, mark_price: Decimal, imr: Decimal) -> Result<(), MarginError> {
    let mut after = position.clone();
    after.margin -= amount;
    if after.margin < Decimal::ZERO {
        return Err(MarginError::MarginRatioTooLow {
            ratio: Decimal::ZERO,
            required: imr,
        });
    }
    check_margin_ratio(&after, mark_price, Decimal::ZERO, imr)
}

/// Reduce-only orders may never exceed the position, counting what already rests.
pub fn check_reduce_only(
    ledger: &Ledger,
    market: &MarketId,
    subaccount: &SubaccountId,
    side: Side,
    quantity: Decimal,
    position: Option<&Position>,
) -> Result<(), MarginError> {
    let position = position.filter(|p| !p.is_empty()).ok_or(MarginError::NoPositionToReduce)?;
    if Side::from_is_buy(position.is_long) == side {
        return Err(MarginError::ReduceOnlyWrongDirection);
    }
    let resting = get_metadata(ledger, market, side, subaccount)?.aggregate_reduce_only_quantity;
    let requested = resting + quantity;
    if requested > position.quantity {
        return Err(MarginError::ReduceOnlyExceedsPosition {
            requested,
            position: position.quantity,
        });
    }
    Ok(())
}

/// Notional the subaccount has committed to the market: position at mark plus every
/// resting vanilla order at its limit price.
pub fn open_notional(
    ledger: &Ledger,
    market: &MarketId,
    subaccount: &SubaccountId,
    position: Option<&Position>,
    mark_price: Decimal,
) -> Result<Decimal, StoreError> {
    let mut notional = position.map_or(Decimal::ZERO, |p| p.notional(mark_price));
    for side in [Side::Buy, Side::Sell] {
        if !get_metadata(ledger, market, side, subaccount)?.has_limit_orders() {
            continue;
        }
        for order in subaccount_orders::<DerivativeLimitOrder>(ledger, market, side, subaccount)? {
            if order.is_vanilla() {
                notional += order.fillable * order.order_info.price;
            }
        }
    }
    Ok(notional)
}

pub fn check_open_notional_cap(
    ledger: &Ledger,
    market: &MarketId,
    subaccount: &SubaccountId,
    cap: Option<Decimal>,
    position: Option<&Position>,
    mark_price: Decimal,
    added_notional: Decimal,
) -> Result<(), MarginError> {
    let Some(cap) = cap else {
        return Ok(());
    };
    let notional = open_notional(ledger, market, subaccount, position, mark_price)? + added_notional;
    if notional > cap {
        return Err(MarginError::OpenNotionalCapExceeded { notional, cap });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::fixtures::{binary, perp};
    use crate::order::{OrderInfo, OrderType};
    use crate::orderbook::insert_limit_order;
    use crate::types::{Address, OrderHash};
    use rust_decimal_macros::dec;

    fn sub() -> SubaccountId {
        SubaccountId::new(Address([4; 20]), 1)
    }

    fn long(qty: Decimal, entry: Decimal, margin: Decimal) -> Position {
        Position {
            is_long: true,
            quantity: qty,
            entry_price: entry,
            margin,
            cumulative_funding_entry: Decimal::ZERO,
        }
    }

    #[test]
    fn order_margin_needs_imr_of_notional() {
        let market = perp();
        // 5% of 100 * 2
        assert!(check_order_margin(&market, Side::Buy, dec!(100), dec!(2), dec!(10), None).is_ok());
        let err = check_order_margin(&market, Side::Buy, dec!(100), dec!(2), dec!(9.99), None).unwrap_err();
        assert!(matches!(err, MarginError::InsufficientOrderMargin { .. }));
    }

    #[test]
    fn buy_above_mark_pays_the_gap() {
        let market = perp();
        // 2 * (0.05 * 90 - (90 - 100)) = 29
        assert_eq!(mark_adjusted_requirement(dec!(0.05), dec!(100), dec!(2), dec!(90), Side::Buy), dec!(29));
        let err = check_order_margin(&market, Side::Buy, dec!(100), dec!(2), dec!(20), Some(dec!(90))).unwrap_err();
        assert!(matches!(err, MarginError::MarkPriceMarginViolation { .. }));
        // sells above mark are fine
        assert!(check_order_margin(&market, Side::Sell, dec!(100), dec!(2), dec!(10), Some(dec!(90))).is_ok());
    }

    #[test]
    fn binary_margin_is_derived() {
        let market = binary();
        assert!(check_order_margin(&market, Side::Sell, dec!(0.3), dec!(10), dec!(7), Some(dec!(0.9))).is_ok());
        assert!(check_order_margin(&market, Side::Sell, dec!(0.3), dec!(10), dec!(6.9), None).is_err());
    }

    #[test]
    fn decrease_keeps_imr() {
        let pos = long(dec!(1), dec!(100), dec!(20));
        // 20 - 0.05 * 100
        assert_eq!(max_margin_decrease(&pos, dec!(100), dec!(0.05)), dec!(15));
        assert!(check_margin_decrease(&pos, dec!(15), dec!(100), dec!(0.05)).is_ok());
        assert!(check_margin_decrease(&pos, dec!(15.01), dec!(100), dec!(0.05)).is_err());
        assert!(check_margin_decrease(&pos, dec!(21), dec!(200), dec!(0.05)).is_err());
    }

    #[test]
    fn reduce_only_bounded_by_position() {
        let mut ledger = Ledger::new();
        let m = perp().market_id;
        let pos = long(dec!(2), dec!(100), dec!(10));

        assert_eq!(
            check_reduce_only(&ledger, &m, &sub(), Side::Sell, dec!(1), None),
            Err(MarginError::NoPositionToReduce)
        );
        assert_eq!(
            check_reduce_only(&ledger, &m, &sub(), Side::Buy, dec!(1), Some(&pos)),
            Err(MarginError::ReduceOnlyWrongDirection)
        );

        let resting = DerivativeLimitOrder {
            order_info: OrderInfo::new(sub(), dec!(110), dec!(1.5)),
            order_type: OrderType::Sell,
            margin: Decimal::ZERO,
            fillable: dec!(1.5),
            order_hash: OrderHash([1; 32]),
            trigger_price: None,
            expiration_block: 0,
        };
        insert_limit_order(&mut ledger, &m, &resting).unwrap();
        assert!(check_reduce_only(&ledger, &m, &sub(), Side::Sell, dec!(0.5), Some(&pos)).is_ok());
        assert!(matches!(
            check_reduce_only(&ledger, &m, &sub(), Side::Sell, dec!(0.6), Some(&pos)),
            Err(MarginError::ReduceOnlyExceedsPosition { .. })
        ));
    }

    #[test]
    fn notional_cap_counts_resting_orders() {
        let mut ledger = Ledger::new();
        let m = perp().market_id;
        let resting = DerivativeLimitOrder {
            order_info: OrderInfo::new(sub(), dec!(100), dec!(3)),
            order_type: OrderType::Buy,
            margin: dec!(15),
            fillable: dec!(3),
            order_hash: OrderHash([2; 32]),
            trigger_price: None,
            expiration_block: 0,
        };
        insert_limit_order(&mut ledger, &m, &resting).unwrap();
        let pos = long(dec!(1), dec!(100), dec!(10));

        assert_eq!(open_notional(&ledger, &m, &sub(), Some(&pos), dec!(200)).unwrap(), dec!(500));
        assert!(check_open_notional_cap(&ledger, &m, &sub(), Some(dec!(600)), Some(&pos), dec!(200), dec!(100)).is_ok());
        assert!(check_open_notional_cap(&ledger, &m, &sub(), Some(dec!(600)), Some(&pos), dec!(200), dec!(101)).is_err());
        assert!(check_open_notional_cap(&ledger, &m, &sub(), None, Some(&pos), dec!(200), dec!(1_000_000)).is_ok());
    }
}
