//! Exchange ledger simulation.
//!
//! Drives the engine block by block through spot trading, a perpetual with funding, a
//! batch with a bad item, a binary option settlement and a staking lookup. Set
//! `RUST_LOG=exchange_ledger=debug` to watch the engine's own logs.

use exchange_ledger::market::MarketInfo;
use exchange_ledger::validators::{Delegation, StaticStakingRegistry, ValidatorRecord};
use exchange_ledger::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type SimResult = Result<(), Box<dyn Error>>;

fn main() -> SimResult {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("exchange_ledger=warn"));
    tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(false)).init();

    println!("Exchange Ledger Simulation");
    println!("Spot, perpetual and binary markets driven block by block\n");

    scenario_1_spot_trading()?;
    scenario_2_perpetual_with_funding()?;
    scenario_3_batch_with_bad_item()?;
    scenario_4_binary_settlement()?;
    scenario_5_staked_amount();

    println!("\nAll simulations completed successfully.");
    Ok(())
}

struct Sim {
    engine: Engine,
    oracle: InMemoryOracle,
    admin: Address,
    block: BlockContext,
}

impl Sim {
    fn new() -> Result<Self, ExchangeError> {
        let params = ExchangeParams::default();
        let admin = params.admin;
        let oracle = InMemoryOracle::new();
        let engine = Engine::new(params, EngineConfig::default(), Arc::new(oracle.clone()))?;
        let mut sim = Self {
            engine,
            oracle,
            admin,
            block: BlockContext::new(1, 0),
        };
        sim.engine.begin_block(sim.block)?;
        Ok(sim)
    }

    /// Ends the current block and opens the next one `secs` later.
    fn next_block(&mut self, secs: i64) -> Result<(), ExchangeError> {
        self.engine.end_block()?;
        self.block = self.block.next(secs);
        self.engine.begin_block(self.block)?;
        Ok(())
    }

    /// Mints into the bank and deposits into subaccount 1.
    fn fund(&mut self, owner: Address, denom: &str, amount: Decimal) -> Result<SubaccountId, ExchangeError> {
        let sub = SubaccountId::new(owner, 1);
        self.engine.mint(&owner, &Coin::new(denom, amount))?;
        self.engine.deliver(ExchangeMsg::Deposit(MsgDeposit {
            sender: owner,
            subaccount_id: sub,
            amount: Coin::new(denom, amount),
        }))?;
        Ok(sub)
    }
}

fn trader(n: u8) -> Address {
    Address([n; 20])
}

/// A resting bid and a crossing ask in a spot market.
fn scenario_1_spot_trading() -> SimResult {
    println!("Scenario 1: Spot Trading\n");
    let mut sim = Sim::new()?;
    let market = sim.engine.launch_spot_market(
        sim.admin,
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
    )?;

    let alice = sim.fund(trader(1), "usdt", dec!(1000))?;
    let bob = sim.fund(trader(2), "inj", dec!(50))?;
    println!("  Alice deposits 1000 usdt, Bob deposits 50 inj");

    sim.engine.deliver(ExchangeMsg::CreateSpotLimitOrder(MsgCreateSpotOrder {
        sender: trader(1),
        order: SpotOrder::limit(market, OrderInfo::new(alice, dec!(10), dec!(20)), OrderType::Buy),
    }))?;
    println!("  Alice bids 20 inj @ 10");
    sim.engine.deliver(ExchangeMsg::CreateSpotLimitOrder(MsgCreateSpotOrder {
        sender: trader(2),
        order: SpotOrder::limit(market, OrderInfo::new(bob, dec!(9.5), dec!(15)), OrderType::Sell),
    }))?;
    println!("  Bob asks 15 inj @ 9.5 and crosses\n");
    sim.next_block(1)?;

    let alice_inj = sim.engine.subaccount_deposit(&alice, "inj")?;
    let bob_usdt = sim.engine.subaccount_deposit(&bob, "usdt")?;
    println!("  Alice holds {} inj, Bob holds {} usdt", alice_inj.total_balance, bob_usdt.total_balance);
    for level in sim.engine.depth(&market, Side::Buy, 5)? {
        println!("  bid level {} x {}", level.price, level.quantity);
    }
    println!("  fee pool: {} usdt\n", sim.engine.fee_pool("usdt")?);
    sim.engine.check_invariants()?;
    Ok(())
}

/// Two traders open opposite positions, then a funding interval passes.
fn scenario_2_perpetual_with_funding() -> SimResult {
    println!("Scenario 2: Perpetual With Funding\n");
    let mut sim = Sim::new()?;
    sim.oracle.set_price("btc", "usdt", dec!(50000));
    let market = sim.engine.launch_derivative_market(
        sim.admin,
        DerivativeMarketLaunch {
            ticker: "BTC/USDT PERP".into(),
            quote_denom: "usdt".into(),
            oracle_base: "btc".into(),
            oracle_quote: "usdt".into(),
            expiry: None,
            initial_margin_ratio: None,
            maintenance_margin_ratio: None,
            maker_fee_rate: Some(dec!(0.0005)),
            taker_fee_rate: Some(dec!(0.001)),
            min_price_tick_size: dec!(0.1),
            min_quantity_tick_size: dec!(0.001),
            min_notional: None,
            open_notional_cap: None,
        },
    )?;

    let maker = sim.fund(trader(3), "usdt", dec!(20000))?;
    let taker = sim.fund(trader(4), "usdt", dec!(20000))?;
    sim.engine.deliver(ExchangeMsg::CreateDerivativeLimitOrder(MsgCreateDerivativeOrder {
        sender: trader(3),
        order: DerivativeOrder::limit(market, OrderInfo::new(maker, dec!(50100), dec!(1)), OrderType::Sell, dec!(5010)),
    }))?;
    sim.engine.deliver(ExchangeMsg::CreateDerivativeMarketOrder(MsgCreateDerivativeOrder {
        sender: trader(4),
        order: DerivativeOrder::limit(market, OrderInfo::new(taker, dec!(50500), dec!(1)), OrderType::Buy, dec!(5050)),
    }))?;
    println!("  Maker sells 1 BTC @ 50100, taker buys at market");
    sim.next_block(1)?;

    if let Some(position) = sim.engine.position(&market, &taker)? {
        println!("  Taker: long {} @ {}, margin {}", position.quantity, position.entry_price, position.margin);
    }
    println!("  Open interest: {}", sim.engine.open_interest(&market)?);

    sim.engine.deliver(ExchangeMsg::CreateDerivativeLimitOrder(MsgCreateDerivativeOrder {
        sender: trader(3),
        order: DerivativeOrder::limit(market, OrderInfo::new(maker, dec!(50300), dec!(0.1)), OrderType::Sell, dec!(503)),
    }))?;
    sim.engine.deliver(ExchangeMsg::CreateDerivativeLimitOrder(MsgCreateDerivativeOrder {
        sender: trader(4),
        order: DerivativeOrder::limit(market, OrderInfo::new(taker, dec!(50200), dec!(0.1)), OrderType::Buy, dec!(502)),
    }))?;
    sim.next_block(3600)?;
    let funding = sim.engine.funding_state(&market)?;
    println!("  After one hour, cumulative funding: {}", funding.cumulative_funding);

    sim.engine.deliver(ExchangeMsg::IncreasePositionMargin(MsgPositionMargin {
        sender: trader(4),
        source_subaccount_id: taker,
        destination_subaccount_id: taker,
        market_id: market,
        amount: dec!(1000),
    }))?;
    if let Some(position) = sim.engine.position(&market, &taker)? {
        println!("  Taker tops up margin to {}\n", position.margin);
    }
    sim.engine.check_invariants()?;
    Ok(())
}

/// One item in the batch fails; the rest still land and one OrderFail is emitted.
fn scenario_3_batch_with_bad_item() -> SimResult {
    println!("Scenario 3: Batch With A Bad Item\n");
    let mut sim = Sim::new()?;
    let market = sim.engine.launch_spot_market(
        sim.admin,
        SpotMarketLaunch {
            ticker: "ATOM/USDT".into(),
            base_denom: "atom".into(),
            quote_denom: "usdt".into(),
            maker_fee_rate: None,
            taker_fee_rate: None,
            min_price_tick_size: dec!(0.01),
            min_quantity_tick_size: dec!(0.01),
            min_notional: None,
        },
    )?;
    let sub = sim.fund(trader(5), "usdt", dec!(500))?;

    let mut batch = MsgBatchUpdateOrders::new(trader(5));
    for (price, cid) in [(dec!(5), "a"), (dec!(5.001), "b"), (dec!(4), "c")] {
        batch
            .spot_orders_to_create
            .push(SpotOrder::limit(market, OrderInfo::new(sub, price, dec!(10)).with_cid(cid), OrderType::Buy));
    }
    let response = sim.engine.deliver(ExchangeMsg::BatchUpdateOrders(batch))?;
    if let MsgResponse::BatchUpdateOrders(batch) = response.response {
        println!("  created: {:?}", batch.created_orders_cids);
        println!("  failed:  {:?}", batch.failed_orders_cids);
    }
    let fails = sim
        .engine
        .events()
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::OrderFail(_)))
        .count();
    println!("  OrderFail events: {fails}, gas used: {}\n", response.gas_used);
    Ok(())
}

/// A binary option expires, then settles at the oracle value.
fn scenario_4_binary_settlement() -> SimResult {
    println!("Scenario 4: Binary Option Settlement\n");
    let mut sim = Sim::new()?;
    let market = sim.engine.launch_binary_options_market(
        sim.admin,
        BinaryOptionsMarketLaunch {
            ticker: "RAIN TOMORROW".into(),
            oracle_symbol: "rain".into(),
            oracle_provider: "weather".into(),
            quote_denom: "usdt".into(),
            expiration_timestamp: 100,
            settlement_timestamp: 200,
            maker_fee_rate: Some(Decimal::ZERO),
            taker_fee_rate: Some(Decimal::ZERO),
            min_price_tick_size: dec!(0.01),
            min_quantity_tick_size: dec!(1),
            min_notional: None,
        },
    )?;
    let yes = sim.fund(trader(6), "usdt", dec!(100))?;
    let no = sim.fund(trader(7), "usdt", dec!(100))?;

    sim.engine.deliver(ExchangeMsg::CreateBinaryOptionsLimitOrder(MsgCreateDerivativeOrder {
        sender: trader(6),
        order: DerivativeOrder::limit(market, OrderInfo::new(yes, dec!(0.4), dec!(100)), OrderType::Buy, dec!(40)),
    }))?;
    sim.engine.deliver(ExchangeMsg::CreateBinaryOptionsLimitOrder(MsgCreateDerivativeOrder {
        sender: trader(7),
        order: DerivativeOrder::limit(market, OrderInfo::new(no, dec!(0.4), dec!(100)), OrderType::Sell, dec!(60)),
    }))?;
    println!("  YES buys 100 contracts @ 0.4 from NO");

    sim.next_block(150)?;
    if let Some(m) = sim.engine.derivative_market(&market)? {
        println!("  After expiration the market is {:?}", m.status());
    }
    sim.oracle.set_price("rain", "weather", Decimal::ONE);
    sim.next_block(100)?;
    if let Some(m) = sim.engine.derivative_market(&market)? {
        println!("  After settlement the market is {:?}", m.status());
    }
    println!(
        "  YES holds {} usdt, NO holds {} usdt\n",
        sim.engine.subaccount_deposit(&yes, "usdt")?.total_balance,
        sim.engine.subaccount_deposit(&no, "usdt")?.total_balance
    );
    sim.engine.check_invariants()?;
    Ok(())
}

fn scenario_5_staked_amount() {
    println!("Scenario 5: Staked Amount\n");
    let validator = trader(9);
    let delegator = trader(8);
    let registry = StaticStakingRegistry::new()
        .with_validator(ValidatorRecord {
            operator: validator,
            tokens: dec!(1000),
            delegator_shares: dec!(500),
            bonded: true,
        })
        .with_delegation(
            delegator,
            Delegation {
                validator,
                shares: dec!(50),
            },
        );
    let Ok(engine) = Engine::new(ExchangeParams::default(), EngineConfig::default(), Arc::new(InMemoryOracle::new())) else {
        return;
    };
    println!("  Delegator stakes {} tokens\n", engine.staked_amount(&registry, &delegator));
}
