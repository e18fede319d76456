//! Solvency tests: random trading never creates or destroys funds.
//!
//! Every unit minted into the ledger sits in exactly one place: a bank balance, a subaccount
//! deposit, the fee pool, a market's collateral balance or its insurance fund.

use exchange_ledger::invariants::InvariantViolation;
use exchange_ledger::market::MarketInfo;
use exchange_ledger::store::collect_prefix;
use exchange_ledger::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

const TRADERS: u8 = 4;
// fractional margins split across partial fills leave dust far below this
const DUST: Decimal = dec!(0.000000000001);

fn trader(n: u8) -> Address {
    Address([n; 20])
}

fn sub(n: u8) -> SubaccountId {
    SubaccountId::new(trader(n), 1)
}

struct World {
    engine: Engine,
    oracle: InMemoryOracle,
    admin: Address,
    block: BlockContext,
    minted: Vec<(String, Decimal)>,
    markets: Vec<MarketId>,
}

impl World {
    fn new() -> Self {
        let params = ExchangeParams::default();
        let admin = params.admin;
        let oracle = InMemoryOracle::new();
        let config = EngineConfig {
            check_invariants_every_block: true,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(params, config, Arc::new(oracle.clone())).unwrap();
        let block = BlockContext::new(1, 0);
        engine.begin_block(block).unwrap();
        Self {
            engine,
            oracle,
            admin,
            block,
            minted: Vec::new(),
            markets: Vec::new(),
        }
    }

    fn next_block(&mut self, secs: i64) {
        self.engine.end_block().unwrap();
        self.block = self.block.next(secs);
        self.engine.begin_block(self.block).unwrap();
    }

    fn fund_all(&mut self, denom: &str, amount: Decimal) {
        for n in 1..=TRADERS {
            self.engine.mint(&trader(n), &Coin::new(denom, amount)).unwrap();
            self.engine
                .deliver(ExchangeMsg::Deposit(MsgDeposit {
                    sender: trader(n),
                    subaccount_id: sub(n),
                    amount: Coin::new(denom, amount),
                }))
                .unwrap();
        }
        self.minted.push((denom.to_string(), amount * Decimal::from(TRADERS)));
    }

    fn spot_market(&mut self) -> MarketId {
        let id = self
            .engine
            .launch_spot_market(
                self.admin,
                SpotMarketLaunch {
                    ticker: "INJ/USDT".into(),
                    base_denom: "inj".into(),
                    quote_denom: "usdt".into(),
                    maker_fee_rate: Some(dec!(0.001)),
                    taker_fee_rate: Some(dec!(0.002)),
                    min_price_tick_size: dec!(0.01),
                    min_quantity_tick_size: dec!(0.001),
                    min_notional: None,
                },
            )
            .unwrap();
        self.markets.push(id);
        id
    }

    fn perpetual_market(&mut self) -> MarketId {
        self.oracle.set_price("btc", "usdt", dec!(50000));
        let id = self
            .engine
            .launch_derivative_market(
                self.admin,
                DerivativeMarketLaunch {
                    ticker: "BTC/USDT".into(),
                    quote_denom: "usdt".into(),
                    oracle_base: "btc".into(),
                    oracle_quote: "usdt".into(),
                    expiry: None,
                    initial_margin_ratio: Some(dec!(0.05)),
                    maintenance_margin_ratio: Some(dec!(0.02)),
                    maker_fee_rate: Some(dec!(0.0005)),
                    taker_fee_rate: Some(dec!(0.001)),
                    min_price_tick_size: dec!(0.1),
                    min_quantity_tick_size: dec!(0.001),
                    min_notional: None,
                    open_notional_cap: None,
                },
            )
            .unwrap();
        self.markets.push(id);
        id
    }

    /// Delivers a message; rejections are fine, ledger corruption is not.
    fn submit(&mut self, msg: ExchangeMsg) {
        if let Err(err) = self.engine.deliver(msg) {
            assert!(!err.is_invariant_violation(), "ledger corrupted: {err}");
        }
    }

    /// Everything the ledger holds in `denom`, wherever it sits.
    fn holdings(&self, denom: &str) -> Decimal {
        let mut total = self.engine.fee_pool(denom).unwrap();
        for n in 1..=TRADERS {
            total += self.engine.bank_balance(&trader(n), denom).unwrap();
            total += self.engine.subaccount_deposit(&sub(n), denom).unwrap().total_balance;
        }
        for id in &self.markets {
            if let Some(market) = self.engine.derivative_market(id).unwrap() {
                if market.quote_denom() == denom {
                    total += self.engine.market_balance(id).unwrap();
                    total += self.engine.insurance_fund(id).unwrap();
                }
            }
        }
        total
    }

    fn assert_conserved(&self) {
        for (denom, minted) in &self.minted {
            let held = self.holdings(denom);
            assert!((held - minted).abs() <= DUST, "{denom}: minted {minted}, held {held}");
        }
        self.engine.check_invariants().unwrap();
    }

    fn assert_open_interest_balanced(&self, market: &MarketId) {
        let positions = self.engine.positions(market).unwrap();
        let longs: Decimal = positions.iter().filter(|(_, p)| p.is_long).map(|(_, p)| p.quantity).sum();
        let shorts: Decimal = positions.iter().filter(|(_, p)| !p.is_long).map(|(_, p)| p.quantity).sum();
        assert_eq!(longs, shorts);
        assert_eq!(self.engine.open_interest(market).unwrap(), longs);
    }
}

#[derive(Debug, Clone)]
struct RandomOrder {
    trader: u8,
    is_buy: bool,
    price_ticks: i64,
    quantity_lots: i64,
    as_market: bool,
    end_block: bool,
}

fn spot_order_strategy() -> impl Strategy<Value = RandomOrder> {
    (1..=TRADERS, any::<bool>(), 900i64..1100i64, 1i64..5000i64, prop::bool::weighted(0.2), prop::bool::weighted(0.1))
        .prop_map(|(trader, is_buy, price_ticks, quantity_lots, as_market, end_block)| RandomOrder {
            trader,
            is_buy,
            price_ticks,
            quantity_lots,
            as_market,
            end_block,
        })
}

fn perp_order_strategy() -> impl Strategy<Value = RandomOrder> {
    (1..=TRADERS, any::<bool>(), 49000i64..51000i64, 1i64..2000i64, prop::bool::weighted(0.2), prop::bool::weighted(0.1))
        .prop_map(|(trader, is_buy, price_ticks, quantity_lots, as_market, end_block)| RandomOrder {
            trader,
            is_buy,
            price_ticks,
            quantity_lots,
            as_market,
            end_block,
        })
}

fn order_type(is_buy: bool) -> OrderType {
    if is_buy {
        OrderType::Buy
    } else {
        OrderType::Sell
    }
}

fn trade_perps(world: &mut World, market: MarketId, orders: &[RandomOrder]) {
    for o in orders {
        let price = Decimal::from(o.price_ticks);
        let quantity = Decimal::new(o.quantity_lots, 3);
        let margin = price * quantity * dec!(0.2);
        let order = DerivativeOrder::limit(market, OrderInfo::new(sub(o.trader), price, quantity), order_type(o.is_buy), margin);
        let msg = MsgCreateDerivativeOrder {
            sender: trader(o.trader),
            order,
        };
        world.submit(if o.as_market {
            ExchangeMsg::CreateDerivativeMarketOrder(msg)
        } else {
            ExchangeMsg::CreateDerivativeLimitOrder(msg)
        });
        if o.end_block {
            world.next_block(1);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Spot fills move base and quote between traders and fees into the pool, nothing else.
    #[test]
    fn spot_trading_conserves_both_denoms(orders in prop::collection::vec(spot_order_strategy(), 1..60)) {
        let mut world = World::new();
        let market = world.spot_market();
        world.fund_all("usdt", dec!(100000));
        world.fund_all("inj", dec!(1000));

        for o in &orders {
            let price = Decimal::new(o.price_ticks, 2);
            let quantity = Decimal::new(o.quantity_lots, 3);
            let order = SpotOrder::limit(market, OrderInfo::new(sub(o.trader), price, quantity), order_type(o.is_buy));
            let msg = MsgCreateSpotOrder { sender: trader(o.trader), order };
            world.submit(if o.as_market {
                ExchangeMsg::CreateSpotMarketOrder(msg)
            } else {
                ExchangeMsg::CreateSpotLimitOrder(msg)
            });
            if o.end_block {
                world.next_block(1);
            }
        }
        world.next_block(1);

        world.assert_conserved();
        for n in 1..=TRADERS {
            for denom in ["usdt", "inj"] {
                let deposit = world.engine.subaccount_deposit(&sub(n), denom).unwrap();
                prop_assert!(deposit.available_balance >= Decimal::ZERO);
                prop_assert!(deposit.available_balance <= deposit.total_balance);
            }
        }
    }

    /// Perpetual fills keep quote funds conserved and both sides of open interest equal.
    #[test]
    fn perp_trading_conserves_collateral(orders in prop::collection::vec(perp_order_strategy(), 1..60)) {
        let mut world = World::new();
        let market = world.perpetual_market();
        world.fund_all("usdt", dec!(1000000));

        trade_perps(&mut world, market, &orders);
        world.next_block(1);

        world.assert_conserved();
        world.assert_open_interest_balanced(&market);
        for (_, position) in world.engine.positions(&market).unwrap() {
            prop_assert!(position.margin > Decimal::ZERO);
        }
    }

    /// Forced settlement at any price closes every position without leaving the market owing.
    #[test]
    fn forced_settlement_never_overdraws(
        orders in prop::collection::vec(perp_order_strategy(), 1..40),
        settle_price in 20000i64..80000i64,
    ) {
        let mut world = World::new();
        let market = world.perpetual_market();
        world.fund_all("usdt", dec!(1000000));
        trade_perps(&mut world, market, &orders);

        let admin = world.admin;
        world.engine.admin_settle_market(admin, market, Some(Decimal::from(settle_price))).unwrap();
        world.next_block(1);

        prop_assert!(world.engine.positions(&market).unwrap().is_empty());
        prop_assert_eq!(world.engine.open_interest(&market).unwrap(), Decimal::ZERO);
        prop_assert!(world.engine.market_balance(&market).unwrap() >= Decimal::ZERO);
        world.assert_conserved();
    }

    /// Mark moves with funding running keep the books balanced across many intervals.
    #[test]
    fn funding_keeps_collateral_conserved(
        orders in prop::collection::vec(perp_order_strategy(), 2..30),
        marks in prop::collection::vec(45000i64..55000i64, 1..6),
    ) {
        let mut world = World::new();
        let market = world.perpetual_market();
        world.fund_all("usdt", dec!(1000000));
        trade_perps(&mut world, market, &orders);

        for mark in marks {
            world.oracle.set_price("btc", "usdt", Decimal::from(mark));
            world.next_block(3600);
        }

        world.assert_conserved();
        world.assert_open_interest_balanced(&market);
    }
}

#[test]
fn insurance_and_withdrawals_stay_accounted() {
    let mut world = World::new();
    let market = world.perpetual_market();
    world.fund_all("usdt", dec!(1000));

    let admin = world.admin;
    world.engine.mint(&admin, &Coin::new("usdt", dec!(500))).unwrap();
    world.engine.fund_insurance_fund(admin, market, Coin::new("usdt", dec!(500))).unwrap();
    assert_eq!(world.engine.insurance_fund(&market).unwrap(), dec!(500));
    assert_eq!(world.engine.bank_balance(&admin, "usdt").unwrap(), Decimal::ZERO);

    world
        .engine
        .deliver(ExchangeMsg::Withdraw(MsgWithdraw {
            sender: trader(1),
            subaccount_id: sub(1),
            amount: Coin::new("usdt", dec!(400)),
        }))
        .unwrap();
    assert_eq!(world.engine.bank_balance(&trader(1), "usdt").unwrap(), dec!(400));

    // traders' 4000 plus the 500 now in insurance
    assert_eq!(world.holdings("usdt"), dec!(4500));
    world.engine.check_invariants().unwrap();
}

/// Everything a refused message could have touched.
#[derive(Debug, PartialEq)]
struct Footprint {
    committed: Vec<(Vec<u8>, Vec<u8>)>,
    transient: Vec<(Vec<u8>, Vec<u8>)>,
    events: usize,
}

impl Footprint {
    fn of(engine: &Engine) -> Self {
        Self {
            committed: collect_prefix(engine.ledger().committed(), &[], false),
            transient: collect_prefix(engine.ledger().transient(), &[], false),
            events: engine.events().len(),
        }
    }
}

fn perp(market: MarketId, n: u8, price: Decimal, order_type: OrderType, margin: Decimal) -> ExchangeMsg {
    ExchangeMsg::CreateDerivativeLimitOrder(MsgCreateDerivativeOrder {
        sender: trader(n),
        order: DerivativeOrder::limit(market, OrderInfo::new(sub(n), price, dec!(1)), order_type, margin),
    })
}

/// Leaves a perp market holding less than its winning short is owed. The first long banks
/// 4000 of profit at 54000 against a new long posting only 2700, then the mark falls to
/// 46000: the short is 4000 up while the market holds 3700. Trader 4 rests an ask at 46000.
fn drained_market(world: &mut World) -> MarketId {
    let market = world.perpetual_market();
    world.fund_all("usdt", dec!(100000));
    let deliver = |world: &mut World, msg: ExchangeMsg| {
        world.engine.deliver(msg).unwrap();
    };

    deliver(world, perp(market, 2, dec!(50000), OrderType::Sell, dec!(5000)));
    deliver(world, perp(market, 1, dec!(50000), OrderType::Buy, dec!(5000)));
    deliver(world, perp(market, 4, dec!(45000), OrderType::Buy, dec!(2250)));

    world.oracle.set_price("btc", "usdt", dec!(54000));
    deliver(world, perp(market, 1, dec!(54000), OrderType::Sell, Decimal::ZERO));
    deliver(world, perp(market, 3, dec!(54000), OrderType::Buy, dec!(2700)));
    assert_eq!(world.engine.market_balance(&market).unwrap(), dec!(3700));

    world.oracle.set_price("btc", "usdt", dec!(46000));
    deliver(world, perp(market, 4, dec!(46000), OrderType::Sell, dec!(2300)));
    market
}

fn is_insolvency(err: &ExchangeError) -> bool {
    matches!(err, ExchangeError::Invariant(InvariantViolation::MarketInsolvent { .. }))
}

#[test]
fn insolvent_close_is_rolled_back_whole() {
    let mut world = World::new();
    let market = drained_market(&mut world);
    let before = Footprint::of(&world.engine);
    let position = world.engine.position(&market, &sub(2)).unwrap();
    let deposits: Vec<_> = (1..=TRADERS)
        .map(|n| world.engine.subaccount_deposit(&sub(n), "usdt").unwrap())
        .collect();

    // closing pays out 9000 against 2300 coming in: the payout is credited before the
    // market balance refuses the debit
    let err = world
        .engine
        .deliver(perp(market, 2, dec!(46000), OrderType::Buy, Decimal::ZERO))
        .unwrap_err();
    assert!(is_insolvency(&err), "{err}");
    assert!(err.is_hard_failure());

    assert_eq!(Footprint::of(&world.engine), before);
    assert_eq!(world.engine.position(&market, &sub(2)).unwrap(), position);
    assert!(world.engine.position(&market, &sub(4)).unwrap().is_none());
    for (n, deposit) in (1..=TRADERS).zip(&deposits) {
        assert_eq!(&world.engine.subaccount_deposit(&sub(n), "usdt").unwrap(), deposit);
    }
    assert_eq!(world.engine.derivative_orders(&market, Side::Sell).unwrap().len(), 1);
    assert_eq!(world.engine.market_balance(&market).unwrap(), dec!(3700));
    assert_eq!(world.engine.ledger().open_checkpoints(), 0);
    world.assert_conserved();

    // with the gap covered by insurance the same close goes through
    let admin = world.admin;
    world.engine.mint(&admin, &Coin::new("usdt", dec!(3000))).unwrap();
    world.engine.fund_insurance_fund(admin, market, Coin::new("usdt", dec!(3000))).unwrap();
    world.minted[0].1 += dec!(3000);
    world
        .engine
        .deliver(perp(market, 2, dec!(46000), OrderType::Buy, Decimal::ZERO))
        .unwrap();
    assert!(world.engine.position(&market, &sub(2)).unwrap().is_none());
    assert_eq!(world.engine.market_balance(&market).unwrap(), Decimal::ZERO);
    assert_eq!(world.engine.insurance_fund(&market).unwrap(), Decimal::ZERO);
    world.assert_conserved();
}

#[test]
fn insolvent_margin_withdrawal_is_refused() {
    let mut world = World::new();
    let market = drained_market(&mut world);
    let withdraw = |amount: Decimal| {
        ExchangeMsg::DecreasePositionMargin(MsgPositionMargin {
            sender: trader(2),
            source_subaccount_id: sub(2),
            destination_subaccount_id: sub(2),
            market_id: market,
            amount,
        })
    };

    // 4000 up at mark, the short clears the margin ratio with no margin at all
    let before = Footprint::of(&world.engine);
    let err = world.engine.deliver(withdraw(dec!(5000))).unwrap_err();
    assert!(is_insolvency(&err), "{err}");
    assert_eq!(Footprint::of(&world.engine), before);

    world.engine.deliver(withdraw(dec!(3000))).unwrap();
    assert_eq!(world.engine.market_balance(&market).unwrap(), dec!(700));
    assert_eq!(world.engine.position(&market, &sub(2)).unwrap().unwrap().margin, dec!(2000));
    world.assert_conserved();
}
