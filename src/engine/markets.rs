// 8.6 engine/markets.rs: market lookup for the handlers, plus the admin actions that
// create markets, move them through their lifecycle and top up insurance.

use super::core::Engine;
use super::results::ExchangeError;
use crate::deposits::BankLedger;
use crate::events::{CancelReason, EventPayload};
use crate::funding::{next_boundary, set_perpetual_info, PerpetualMarketInfo};
use crate::market::{
    get_any_derivative_market, get_market, set_any_derivative_market, set_market, AnyDerivativeMarket,
    BinaryOptionsMarket, DerivativeMarket, MarketError, MarketInfo, MarketStatus, SpotMarket,
};
use crate::market_balance::fund_insurance;
use crate::msgs::{BinaryOptionsMarketLaunch, DerivativeMarketLaunch, SpotMarketLaunch};
use crate::oracle::derivative_mark_price;
use crate::settlement::{schedule_settlement, set_expiry_info, ExpiryFuturesInfo, ScheduledSettlement};
use crate::types::{Address, Coin, MarketId};
use rust_decimal::Decimal;
use tracing::info;

impl Engine {
    pub(super) fn load_spot_market(&self, id: &MarketId) -> Result<SpotMarket, ExchangeError> {
        get_market::<SpotMarket, _>(&self.ledger, id)?.ok_or(ExchangeError::MarketNotFound(*id))
    }

    /// Derivative or binary market, whichever `binary` asks for. The other kind is
    /// treated as missing.
    pub(super) fn load_derivative_market(&self, id: &MarketId, binary: bool) -> Result<AnyDerivativeMarket, ExchangeError> {
        match get_any_derivative_market(&self.ledger, id)? {
            Some(m @ AnyDerivativeMarket::Binary(_)) if binary => Ok(m),
            Some(m @ AnyDerivativeMarket::Derivative(_)) if !binary => Ok(m),
            _ => Err(ExchangeError::MarketNotFound(*id)),
        }
    }

    pub(super) fn emit_derivative_market_update(&mut self, market: &AnyDerivativeMarket) {
        let payload = match market {
            AnyDerivativeMarket::Derivative(m) => EventPayload::DerivativeMarketUpdate(m.clone()),
            AnyDerivativeMarket::Binary(m) => EventPayload::BinaryOptionsMarketUpdate(m.clone()),
        };
        self.emit(payload);
    }

    pub(super) fn set_derivative_market_status(
        &mut self,
        market: &mut AnyDerivativeMarket,
        status: MarketStatus,
    ) -> Result<(), ExchangeError> {
        market.set_status(status);
        set_any_derivative_market(&mut self.ledger, market)?;
        self.emit_derivative_market_update(market);
        Ok(())
    }

    fn ensure_new_market(&self, id: &MarketId) -> Result<(), ExchangeError> {
        let exists = get_market::<SpotMarket, _>(&self.ledger, id)?.is_some()
            || get_any_derivative_market(&self.ledger, id)?.is_some();
        if exists {
            return Err(MarketError::MarketExists(*id).into());
        }
        Ok(())
    }

    // 8.6.1: launches

    pub fn launch_spot_market(&mut self, sender: Address, launch: SpotMarketLaunch) -> Result<MarketId, ExchangeError> {
        self.ensure_admin(&sender)?;
        self.run_unmetered("launch_spot_market", |engine| {
            let params = &engine.params;
            let market = SpotMarket {
                market_id: SpotMarket::derive_id(&launch.base_denom, &launch.quote_denom),
                ticker: launch.ticker,
                base_denom: launch.base_denom,
                quote_denom: launch.quote_denom,
                maker_fee_rate: launch.maker_fee_rate.unwrap_or(params.default_spot_maker_fee_rate),
                taker_fee_rate: launch.taker_fee_rate.unwrap_or(params.default_spot_taker_fee_rate),
                status: MarketStatus::Active,
                min_price_tick_size: launch.min_price_tick_size,
                min_quantity_tick_size: launch.min_quantity_tick_size,
                min_notional: launch.min_notional.unwrap_or(params.default_min_notional),
            };
            market.validate()?;
            engine.ensure_new_market(&market.market_id)?;
            set_market(&mut engine.ledger, &market)?;
            info!(market = %market.market_id, ticker = %market.ticker, "spot market launched");
            engine.emit(EventPayload::SpotMarketUpdate(market.clone()));
            Ok(market.market_id)
        })
    }

    /// Perpetual or expiry future. Requires a live oracle price.
    pub fn launch_derivative_market(&mut self, sender: Address, launch: DerivativeMarketLaunch) -> Result<MarketId, ExchangeError> {
        self.ensure_admin(&sender)?;
        self.run_unmetered("launch_derivative_market", |engine| {
            let now = engine.block.unix_secs();
            if let Some(expiry) = launch.expiry {
                if expiry <= now {
                    return Err(MarketError::InvalidParameter(format!("expiry {expiry} is not in the future")).into());
                }
            }
            let params = &engine.params;
            let market = DerivativeMarket {
                market_id: DerivativeMarket::derive_id(
                    &launch.ticker,
                    &launch.quote_denom,
                    &launch.oracle_base,
                    &launch.oracle_quote,
                    launch.expiry,
                ),
                ticker: launch.ticker,
                oracle_base: launch.oracle_base,
                oracle_quote: launch.oracle_quote,
                quote_denom: launch.quote_denom,
                initial_margin_ratio: launch.initial_margin_ratio.unwrap_or(params.default_initial_margin_ratio),
                maintenance_margin_ratio: launch
                    .maintenance_margin_ratio
                    .unwrap_or(params.default_maintenance_margin_ratio),
                maker_fee_rate: launch.maker_fee_rate.unwrap_or(params.default_derivative_maker_fee_rate),
                taker_fee_rate: launch.taker_fee_rate.unwrap_or(params.default_derivative_taker_fee_rate),
                is_perpetual: launch.expiry.is_none(),
                status: MarketStatus::Active,
                min_price_tick_size: launch.min_price_tick_size,
                min_quantity_tick_size: launch.min_quantity_tick_size,
                min_notional: launch.min_notional.unwrap_or(params.default_min_notional),
                open_notional_cap: launch.open_notional_cap,
            };
            market.validate()?;
            engine.ensure_new_market(&market.market_id)?;
            if derivative_mark_price(engine.oracle(), &market).is_none() {
                return Err(MarketError::NoOraclePrice(market.market_id).into());
            }

            match launch.expiry {
                None => {
                    let interval = engine.params.default_funding_interval;
                    let info = PerpetualMarketInfo {
                        market_id: market.market_id,
                        hourly_funding_rate_cap: engine.params.default_hourly_funding_rate_cap,
                        hourly_interest_rate: engine.params.default_hourly_interest_rate,
                        funding_interval: interval,
                        next_funding_timestamp: next_boundary(now, interval),
                    };
                    set_perpetual_info(&mut engine.ledger, &info)?;
                }
                Some(expiration_timestamp) => {
                    set_expiry_info(
                        &mut engine.ledger,
                        &ExpiryFuturesInfo {
                            market_id: market.market_id,
                            expiration_timestamp,
                            settlement_price: None,
                        },
                    )?;
                }
            }

            set_market(&mut engine.ledger, &market)?;
            info!(market = %market.market_id, ticker = %market.ticker, perpetual = market.is_perpetual, "derivative market launched");
            engine.emit(EventPayload::DerivativeMarketUpdate(market.clone()));
            Ok(market.market_id)
        })
    }

    pub fn launch_binary_options_market(
        &mut self,
        sender: Address,
        launch: BinaryOptionsMarketLaunch,
    ) -> Result<MarketId, ExchangeError> {
        self.ensure_admin(&sender)?;
        self.run_unmetered("launch_binary_options_market", |engine| {
            if launch.expiration_timestamp <= engine.block.unix_secs() {
                return Err(MarketError::InvalidParameter("expiration is not in the future".into()).into());
            }
            let params = &engine.params;
            let market = BinaryOptionsMarket {
                market_id: BinaryOptionsMarket::derive_id(
                    &launch.ticker,
                    &launch.quote_denom,
                    &launch.oracle_symbol,
                    &launch.oracle_provider,
                ),
                ticker: launch.ticker,
                oracle_symbol: launch.oracle_symbol,
                oracle_provider: launch.oracle_provider,
                quote_denom: launch.quote_denom,
                expiration_timestamp: launch.expiration_timestamp,
                settlement_timestamp: launch.settlement_timestamp,
                maker_fee_rate: launch.maker_fee_rate.unwrap_or(params.default_derivative_maker_fee_rate),
                taker_fee_rate: launch.taker_fee_rate.unwrap_or(params.default_derivative_taker_fee_rate),
                status: MarketStatus::Active,
                min_price_tick_size: launch.min_price_tick_size,
                min_quantity_tick_size: launch.min_quantity_tick_size,
                min_notional: launch.min_notional.unwrap_or(params.default_min_notional),
                settlement_price: None,
            };
            market.validate()?;
            engine.ensure_new_market(&market.market_id)?;
            set_market(&mut engine.ledger, &market)?;
            info!(market = %market.market_id, ticker = %market.ticker, "binary options market launched");
            engine.emit(EventPayload::BinaryOptionsMarketUpdate(market.clone()));
            Ok(market.market_id)
        })
    }

    // 8.6.2: lifecycle

    /// Pauses or resumes trading. Demolishing a spot market cancels its book; derivative
    /// markets close through [`Engine::admin_settle_market`] instead.
    pub fn update_market_status(&mut self, sender: Address, market_id: MarketId, status: MarketStatus) -> Result<(), ExchangeError> {
        self.ensure_admin(&sender)?;
        self.run_unmetered("update_market_status", |engine| {
            if let Some(mut market) = get_market::<SpotMarket, _>(&engine.ledger, &market_id)? {
                let allowed = matches!(
                    (market.status, status),
                    (MarketStatus::Active, MarketStatus::Paused)
                        | (MarketStatus::Paused, MarketStatus::Active)
                        | (MarketStatus::Active | MarketStatus::Paused, MarketStatus::Demolished)
                );
                if !allowed {
                    return Err(MarketError::InvalidStatus {
                        market: market_id,
                        status: market.status,
                    }
                    .into());
                }
                if status == MarketStatus::Demolished {
                    engine.cancel_all_spot_orders(&market, CancelReason::MarketClosed)?;
                }
                market.status = status;
                set_market(&mut engine.ledger, &market)?;
                engine.emit(EventPayload::SpotMarketUpdate(market));
                return Ok(());
            }

            let mut market = get_any_derivative_market(&engine.ledger, &market_id)?
                .ok_or(ExchangeError::MarketNotFound(market_id))?;
            let allowed = matches!(
                (market.status(), status),
                (MarketStatus::Active, MarketStatus::Paused) | (MarketStatus::Paused, MarketStatus::Active)
            );
            if !allowed {
                return Err(MarketError::InvalidStatus {
                    market: market_id,
                    status: market.status(),
                }
                .into());
            }
            engine.set_derivative_market_status(&mut market, status)
        })
    }

    /// Queues a forced settlement for the next begin_block. `None` settles at the oracle
    /// price; for binary options `-1` refunds every position.
    pub fn admin_settle_market(&mut self, sender: Address, market_id: MarketId, price: Option<Decimal>) -> Result<(), ExchangeError> {
        self.ensure_admin(&sender)?;
        self.run_unmetered("admin_settle_market", |engine| {
            let mut market = get_any_derivative_market(&engine.ledger, &market_id)?
                .ok_or(ExchangeError::MarketNotFound(market_id))?;
            if market.status() == MarketStatus::Demolished {
                return Err(MarketError::InvalidStatus {
                    market: market_id,
                    status: market.status(),
                }
                .into());
            }
            if let AnyDerivativeMarket::Binary(m) = &mut market {
                if price.is_some() {
                    m.settlement_price = price;
                    set_any_derivative_market(&mut engine.ledger, &market)?;
                }
            }
            schedule_settlement(
                &mut engine.ledger,
                &ScheduledSettlement {
                    market_id,
                    settlement_price: price,
                },
            )?;
            info!(market = %market_id, price = ?price, "settlement scheduled");
            Ok(())
        })
    }

    /// Same as [`Engine::admin_settle_market`] but settles inside this call instead of
    /// waiting for the next block. Returns whether the market settled.
    pub fn admin_settle_market_now(&mut self, sender: Address, market_id: MarketId, price: Option<Decimal>) -> Result<bool, ExchangeError> {
        self.admin_settle_market(sender, market_id, price)?;
        self.run_unmetered("forced_settlement", |engine| {
            engine.run_forced_settlement(&ScheduledSettlement {
                market_id,
                settlement_price: price,
            })
        })
    }

    /// Moves funds from the sender's bank account into a market's insurance fund.
    pub fn fund_insurance_fund(&mut self, sender: Address, market_id: MarketId, amount: Coin) -> Result<(), ExchangeError> {
        self.ensure_admin(&sender)?;
        self.run_unmetered("fund_insurance_fund", |engine| {
            let market = get_any_derivative_market(&engine.ledger, &market_id)?
                .ok_or(ExchangeError::MarketNotFound(market_id))?;
            if market.quote_denom() != amount.denom {
                return Err(ExchangeError::InvalidTransfer(format!(
                    "insurance for {market_id} is held in {}",
                    market.quote_denom()
                )));
            }
            engine.ledger.send_to_module(&sender, &amount)?;
            fund_insurance(&mut engine.ledger, &market_id, amount.amount)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{trader, Harness};
    use crate::events::{CancelReason, EventPayload};
    use crate::market::MarketStatus;
    use crate::msgs::{DerivativeMarketLaunch, SpotMarketLaunch};
    use crate::order::{OrderInfo, OrderType, SpotOrder};
    use crate::types::{Coin, Side};
    use rust_decimal_macros::dec;

    fn inj_usdt() -> SpotMarketLaunch {
        SpotMarketLaunch {
            ticker: "INJ/USDT".into(),
            base_denom: "inj".into(),
            quote_denom: "usdt".into(),
            maker_fee_rate: None,
            taker_fee_rate: None,
            min_price_tick_size: dec!(0.01),
            min_quantity_tick_size: dec!(0.001),
            min_notional: None,
        }
    }

    #[test]
    fn launches_are_admin_only_and_unique() {
        let mut h = Harness::new();
        let err = h.engine.launch_spot_market(trader(1), inj_usdt()).unwrap_err();
        assert_eq!(err.code(), "not_admin");

        let id = h.engine.launch_spot_market(h.admin, inj_usdt()).unwrap();
        let market = h.engine.spot_market(&id).unwrap().unwrap();
        assert_eq!(market.maker_fee_rate, h.engine.params().default_spot_maker_fee_rate);
        let err = h.engine.launch_spot_market(h.admin, inj_usdt()).unwrap_err();
        assert_eq!(err.code(), "market_exists");
        assert_eq!(h.engine.spot_markets().unwrap().len(), 1);
    }

    #[test]
    fn derivative_launch_needs_an_oracle_price() {
        let mut h = Harness::new();
        let launch = DerivativeMarketLaunch {
            ticker: "ETH/USDT".into(),
            quote_denom: "usdt".into(),
            oracle_base: "eth".into(),
            oracle_quote: "usdt".into(),
            expiry: None,
            initial_margin_ratio: None,
            maintenance_margin_ratio: None,
            maker_fee_rate: None,
            taker_fee_rate: None,
            min_price_tick_size: dec!(0.01),
            min_quantity_tick_size: dec!(0.01),
            min_notional: None,
            open_notional_cap: None,
        };
        let err = h.engine.launch_derivative_market(h.admin, launch.clone()).unwrap_err();
        assert_eq!(err.code(), "no_mark_price");

        h.oracle.set_price("eth", "usdt", dec!(3000));
        let id = h.engine.launch_derivative_market(h.admin, launch).unwrap();
        assert!(h.engine.perpetual_info(&id).unwrap().is_some());
        assert!(h.engine.expiry_info(&id).unwrap().is_none());
    }

    #[test]
    fn demolishing_a_spot_market_clears_its_book() {
        let mut h = Harness::new();
        let market = h.spot_market();
        let alice = h.fund(1, "usdt", dec!(100));
        h.spot_limit(SpotOrder::limit(market, OrderInfo::new(alice, dec!(10), dec!(1)), OrderType::Buy))
            .unwrap();

        h.engine.update_market_status(h.admin, market, MarketStatus::Paused).unwrap();
        let paused = h.spot_limit(SpotOrder::limit(market, OrderInfo::new(alice, dec!(9), dec!(1)), OrderType::Buy));
        assert_eq!(paused.unwrap_err().code(), "market_not_active");

        h.engine.update_market_status(h.admin, market, MarketStatus::Demolished).unwrap();
        assert!(h.engine.spot_orders(&market, Side::Buy).unwrap().is_empty());
        assert_eq!(h.available(&alice, "usdt"), dec!(100));
        let reasons = h.events(|p| match p {
            EventPayload::CancelSpotOrder(c) => Some(c.reason),
            _ => None,
        });
        assert_eq!(reasons, vec![CancelReason::MarketClosed]);

        let err = h.engine.update_market_status(h.admin, market, MarketStatus::Active).unwrap_err();
        assert_eq!(err.code(), "invalid_market_status");
    }

    #[test]
    fn insurance_is_funded_in_the_quote_denom() {
        let mut h = Harness::new();
        let market = h.derivative_market(dec!(50000), None);
        h.engine.mint(&h.admin, &Coin::new("usdt", dec!(500))).unwrap();
        h.engine.mint(&h.admin, &Coin::new("inj", dec!(500))).unwrap();

        let err = h.engine.fund_insurance_fund(h.admin, market, Coin::new("inj", dec!(100))).unwrap_err();
        assert_eq!(err.code(), "invalid_transfer");
        h.engine.fund_insurance_fund(h.admin, market, Coin::new("usdt", dec!(100))).unwrap();
        assert_eq!(h.engine.insurance_fund(&market).unwrap(), dec!(100));
        assert_eq!(h.engine.bank_balance(&h.admin, "usdt").unwrap(), dec!(400));
    }
}
