//! Stress tests for the exchange ledger.
//!
//! Deep books, long block runs and large batches, checked against the reconciliation pass.

use exchange_ledger::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn trader(n: u8) -> Address {
    Address([n; 20])
}

fn sub(n: u8) -> SubaccountId {
    SubaccountId::new(trader(n), 1)
}

fn setup() -> (Engine, MarketId, BlockContext) {
    let params = ExchangeParams::default();
    let admin = params.admin;
    let config = EngineConfig {
        check_invariants_every_block: true,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(params, config, Arc::new(InMemoryOracle::new())).unwrap();
    let block = BlockContext::new(1, 0);
    engine.begin_block(block).unwrap();
    let market = engine
        .launch_spot_market(
            admin,
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
    for n in 1..=4 {
        for (denom, amount) in [("usdt", dec!(1000000)), ("inj", dec!(100000))] {
            engine.mint(&trader(n), &Coin::new(denom, amount)).unwrap();
            engine
                .deliver(ExchangeMsg::Deposit(MsgDeposit {
                    sender: trader(n),
                    subaccount_id: sub(n),
                    amount: Coin::new(denom, amount),
                }))
                .unwrap();
        }
    }
    (engine, market, block)
}

fn step(engine: &mut Engine, block: &mut BlockContext) -> BlockSummary {
    engine.end_block().unwrap();
    *block = block.next(1);
    engine.begin_block(*block).unwrap()
}

fn limit(market: MarketId, n: u8, price: Decimal, quantity: Decimal, order_type: OrderType) -> ExchangeMsg {
    ExchangeMsg::CreateSpotLimitOrder(MsgCreateSpotOrder {
        sender: trader(n),
        order: SpotOrder::limit(market, OrderInfo::new(sub(n), price, quantity), order_type),
    })
}

#[test]
fn test_deep_book_keeps_price_order() {
    let (mut engine, market, _) = setup();

    // 500 bids below 10 and 500 asks above, none crossing
    for i in 0..500i64 {
        let n = (i % 4) as u8 + 1;
        let bid = dec!(10) - Decimal::new(i % 250 + 1, 2);
        let ask = dec!(10) + Decimal::new(i % 250 + 1, 2);
        engine.deliver(limit(market, n, bid, dec!(1), OrderType::Buy)).unwrap();
        engine.deliver(limit(market, n, ask, dec!(1), OrderType::Sell)).unwrap();
    }

    let bids = engine.depth(&market, Side::Buy, usize::MAX).unwrap();
    let asks = engine.depth(&market, Side::Sell, usize::MAX).unwrap();
    assert_eq!(bids.len(), 250);
    assert_eq!(asks.len(), 250);
    assert!(bids.windows(2).all(|w| w[0].price > w[1].price));
    assert!(asks.windows(2).all(|w| w[0].price < w[1].price));
    assert_eq!(bids[0], DepthLevel { price: dec!(9.99), quantity: dec!(2) });
    assert_eq!(asks[0], DepthLevel { price: dec!(10.01), quantity: dec!(2) });

    let resting = engine.spot_orders(&market, Side::Buy).unwrap().len() + engine.spot_orders(&market, Side::Sell).unwrap().len();
    assert_eq!(resting, 1000);
    engine.check_invariants().unwrap();
}

#[test]
fn test_sweep_through_many_levels() {
    let (mut engine, market, _) = setup();

    for i in 1..=200i64 {
        let n = (i % 3) as u8 + 1;
        engine
            .deliver(limit(market, n, dec!(10) + Decimal::new(i, 2), dec!(0.5), OrderType::Sell))
            .unwrap();
    }

    // trader 4 lifts every level up to 12
    engine.deliver(limit(market, 4, dec!(12), dec!(100), OrderType::Buy)).unwrap();

    assert!(engine.spot_orders(&market, Side::Sell).unwrap().is_empty());
    let deposit = engine.subaccount_deposit(&sub(4), "inj").unwrap();
    assert_eq!(deposit.total_balance, dec!(100100));
    // fully filled, nothing rests at 12
    assert_eq!(engine.price_level(&market, Side::Buy, dec!(12)).unwrap(), Decimal::ZERO);
    engine.check_invariants().unwrap();
}

#[test]
fn test_expirations_over_many_blocks() {
    let (mut engine, market, mut block) = setup();

    for i in 0..100u64 {
        let n = (i % 4) as u8 + 1;
        let order = SpotOrder::limit(market, OrderInfo::new(sub(n), dec!(5), dec!(1)), OrderType::Buy).with_expiration(2 + i % 10);
        engine
            .deliver(ExchangeMsg::CreateSpotLimitOrder(MsgCreateSpotOrder { sender: trader(n), order }))
            .unwrap();
    }
    assert_eq!(engine.spot_orders(&market, Side::Buy).unwrap().len(), 100);

    let mut expired = 0;
    for height in 2..=11u64 {
        expired += step(&mut engine, &mut block).expired_orders;
        assert_eq!(block.height, height);
        let remaining = engine.spot_orders(&market, Side::Buy).unwrap().len();
        assert_eq!(remaining, 100 - 10 * (height as usize - 1));
    }
    assert_eq!(expired, 100);

    // every hold came back
    for n in 1..=4 {
        let deposit = engine.subaccount_deposit(&sub(n), "usdt").unwrap();
        assert_eq!(deposit.available_balance, deposit.total_balance);
    }
}

#[test]
fn test_large_batch_soft_fails_individually() {
    let (mut engine, market, _) = setup();

    let mut batch = MsgBatchUpdateOrders::new(trader(1));
    for i in 0..150i64 {
        // every third price is off the tick
        let price = if i % 3 == 0 {
            dec!(5.001)
        } else {
            dec!(5) - Decimal::new(i, 2)
        };
        batch.spot_orders_to_create.push(SpotOrder::limit(
            market,
            OrderInfo::new(sub(1), price, dec!(1)).with_cid(format!("c{i}")),
            OrderType::Buy,
        ));
    }
    let response = match engine.deliver(ExchangeMsg::BatchUpdateOrders(batch)).unwrap().response {
        MsgResponse::BatchUpdateOrders(r) => r,
        other => panic!("unexpected response {other:?}"),
    };

    assert_eq!(response.spot_order_hashes.len(), 150);
    assert_eq!(response.failed_orders_cids.len(), 50);
    assert_eq!(response.created_orders_cids.len(), 100);
    assert!(response.failed_orders_cids.iter().all(|cid| cid[1..].parse::<i64>().unwrap() % 3 == 0));
    assert_eq!(engine.spot_orders(&market, Side::Buy).unwrap().len(), 100);

    // cancel-all clears them in one go
    let mut cancel = MsgBatchUpdateOrders::new(trader(1));
    cancel.subaccount_id = Some(sub(1));
    cancel.spot_market_ids_to_cancel_all.push(market);
    engine.deliver(ExchangeMsg::BatchUpdateOrders(cancel)).unwrap();
    assert!(engine.spot_orders(&market, Side::Buy).unwrap().is_empty());
    let deposit = engine.subaccount_deposit(&sub(1), "usdt").unwrap();
    assert_eq!(deposit.available_balance, deposit.total_balance);
    engine.check_invariants().unwrap();
}

#[test]
fn test_batch_out_of_gas_leaves_no_trace() {
    let (mut engine, market, _) = setup();
    let before = engine.subaccount_deposit(&sub(1), "usdt").unwrap();
    let events_before = engine.events().len();

    let mut batch = MsgBatchUpdateOrders::new(trader(1));
    for i in 0..100i64 {
        batch.spot_orders_to_create.push(SpotOrder::limit(
            market,
            OrderInfo::new(sub(1), dec!(5) - Decimal::new(i, 2), dec!(1)),
            OrderType::Buy,
        ));
    }

    let err = engine
        .deliver_with_gas(ExchangeMsg::BatchUpdateOrders(batch.clone()), 50_000)
        .unwrap_err();
    assert_eq!(err.code(), "out_of_gas");
    assert!(engine.spot_orders(&market, Side::Buy).unwrap().is_empty());
    assert_eq!(engine.subaccount_deposit(&sub(1), "usdt").unwrap(), before);
    assert_eq!(engine.events().len(), events_before);

    // same batch goes through with the default limit
    let ok = engine.deliver(ExchangeMsg::BatchUpdateOrders(batch)).unwrap();
    assert!(ok.gas_used > 50_000);
    assert_eq!(engine.spot_orders(&market, Side::Buy).unwrap().len(), 100);
}

#[test]
fn test_many_blocks_of_crossing_flow() {
    let (mut engine, market, mut block) = setup();

    for round in 0..200i64 {
        let price = dec!(10) + Decimal::new(round % 7 - 3, 2);
        let maker = (round % 4) as u8 + 1;
        let taker = ((round + 1) % 4) as u8 + 1;
        engine.deliver(limit(market, maker, price, dec!(1.5), OrderType::Sell)).unwrap();
        engine.deliver(limit(market, taker, price, dec!(1), OrderType::Buy)).unwrap();
        if round % 10 == 9 {
            step(&mut engine, &mut block);
        }
    }

    let trades = engine
        .events()
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::SpotTrade(_)))
        .count();
    assert!(trades >= 400);
    let inj: Decimal = (1..=4).map(|n| engine.subaccount_deposit(&sub(n), "inj").unwrap().total_balance).sum();
    assert_eq!(inj, dec!(400000));
    engine.check_invariants().unwrap();
}
