//! Stress tests
//!
//! Concurrent writers against the same position or user, the reference
//! scenarios end to end, and a scanner that has to keep going while parts of
//! the oracle are down.

use margin_engine::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

const START: i64 = 1_700_000_000_000;

fn setup() -> (Engine, InMemoryHandles) {
    Engine::in_memory(EngineConfig::default(), Timestamp::from_millis(START)).unwrap()
}

fn funded(handles: &InMemoryHandles, user: &str, amount: Decimal) -> UserId {
    let user = UserId::new(user);
    handles.custody.deposit(&user, Quote::new(amount));
    user
}

/// Races between the user's close and the scanner's liquidation.
mod race_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_and_liquidation_never_both_win() {
        let (engine, handles) = setup();
        let alice = funded(&handles, "alice", dec!(1_000_000));
        let btc = Symbol::new("BTC/USDT");
        // every round realizes a loss of about 4.3k
        engine
            .risk_limits()
            .set_limits(
                &alice,
                &RiskLimitsUpdate {
                    max_daily_loss: Some(dec!(1_000_000)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        for _ in 0..25 {
            let position = engine
                .open_margin_position(&alice, &btc, Side::Long, dec!(1), dec!(45000), 10)
                .await
                .unwrap();

            let closer = {
                let engine = engine.clone();
                let alice = alice.clone();
                tokio::spawn(async move { engine.close_position(&alice, position.id, Some(dec!(40700))).await })
            };
            let liquidator = {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .liquidate_position(position.id, Price::new_unchecked(dec!(40700)))
                        .await
                })
            };

            let closed = closer.await.unwrap();
            let liquidated = liquidator.await.unwrap();

            match (&closed, &liquidated) {
                (Ok(_), Err(EngineError::AlreadyClosed { status, .. })) => {
                    assert_eq!(*status, PositionStatus::Closed)
                }
                (Err(EngineError::AlreadyClosed { status, .. }), Ok(_)) => {
                    assert_eq!(*status, PositionStatus::Liquidated)
                }
                other => panic!("expected exactly one winner, got {:?}", other),
            }
        }

        // every position settled exactly once, nothing left locked
        assert_eq!(handles.custody.holding(&alice).locked, Quote::zero());
        assert!(engine.open_positions().await.unwrap().is_empty());

        let ledger = engine.liquidation_events().await.unwrap();
        let liquidated = engine
            .positions_for_user(&alice)
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.status == PositionStatus::Liquidated)
            .count();
        assert_eq!(ledger.len(), liquidated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opens_respect_max_open_positions() {
        let (engine, handles) = setup();
        let alice = funded(&handles, "alice", dec!(1_000_000));
        engine
            .risk_limits()
            .set_limits(
                &alice,
                &RiskLimitsUpdate {
                    max_open_positions: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let attempts: Vec<_> = (0..20)
            .map(|_| {
                let engine = engine.clone();
                let alice = alice.clone();
                tokio::spawn(async move {
                    engine
                        .open_margin_position(&alice, &Symbol::new("ETH/USDT"), Side::Long, dec!(1), dec!(3000), 10)
                        .await
                })
            })
            .collect();

        let mut opened = 0;
        let mut refused = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => opened += 1,
                Err(EngineError::RiskLimitExceeded(violation)) => {
                    assert_eq!(violation.reason(), "count");
                    refused += 1;
                }
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }

        assert_eq!(opened, 5);
        assert_eq!(refused, 15);
        assert_eq!(handles.custody.holding(&alice).locked.value(), dec!(1500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opens_never_overdraw_balance() {
        let (engine, handles) = setup();
        // enough for exactly three 300-margin positions
        let bob = funded(&handles, "bob", dec!(900));

        let attempts: Vec<_> = (0..10)
            .map(|_| {
                let engine = engine.clone();
                let bob = bob.clone();
                tokio::spawn(async move {
                    engine
                        .open_margin_position(&bob, &Symbol::new("ETH/USDT"), Side::Short, dec!(1), dec!(3000), 10)
                        .await
                })
            })
            .collect();

        let mut opened = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => opened += 1,
                Err(EngineError::InsufficientMargin { .. }) => {}
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }

        assert_eq!(opened, 3);
        let holding = handles.custody.holding(&bob);
        assert_eq!(holding.available, Quote::zero());
        assert_eq!(holding.locked.value(), dec!(900));
    }
}

/// The reference scenarios.
mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn straightforward_liquidation() {
        let (engine, mut handles) = setup();
        let alice = funded(&handles, "alice", dec!(10_000));

        let position = engine
            .open_margin_position(&alice, &Symbol::new("BTC/USDT"), Side::Long, dec!(1), dec!(45000), 10)
            .await
            .unwrap();
        assert_eq!(position.liquidation_price.value(), dec!(40725));

        let scanner = LiquidationScanner::new(engine.clone());

        handles.oracle.set_price("BTC/USDT", dec!(40800));
        let report = scanner.scan_once().await.unwrap();
        assert!(report.liquidated.is_empty());
        assert_eq!(report.marked, 1);
        let held = engine.get_position(position.id).await.unwrap();
        assert!(held.is_open());
        assert_eq!(held.unrealized_pnl.value(), dec!(-4200));

        handles.oracle.set_price("BTC/USDT", dec!(40700));
        let report = scanner.scan_once().await.unwrap();
        assert_eq!(report.liquidated.len(), 1);
        assert_eq!(report.liquidated[0].position_id, position.id);

        let stored = engine.get_position(position.id).await.unwrap();
        assert_eq!(stored.status, PositionStatus::Liquidated);
        assert_eq!(stored.exit_price, Some(Price::new_unchecked(dec!(40700))));
        // pnl -4300 minus fee 203.5
        assert_eq!(stored.realized_pnl.value(), dec!(-4503.5));

        let mut saw_liquidation = false;
        while let Ok(notification) = handles.notifications.try_recv() {
            if let Notification::Liquidation(event) = notification {
                assert_eq!(event.position_id, position.id);
                saw_liquidation = true;
            }
        }
        assert!(saw_liquidation);
    }

    #[tokio::test]
    async fn leverage_cap() {
        let (engine, handles) = setup();
        let alice = funded(&handles, "alice", dec!(1_000_000));

        let err = engine
            .open_margin_position(&alice, &Symbol::new("BTC/USDT"), Side::Long, dec!(1), dec!(45000), 150)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::LeverageExceeded { requested: 150, max: 125 });

        // unknown symbols fall back to the 20x default entry
        let err = engine
            .open_margin_position(&alice, &Symbol::new("DOGE/USDT"), Side::Long, dec!(100), dec!(0.1), 25)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::LeverageExceeded { requested: 25, max: 20 });
    }

    #[tokio::test]
    async fn futures_margin() {
        let (engine, handles) = setup();
        let carol = funded(&handles, "carol", dec!(500));

        let contract = engine
            .create_futures_contract(ContractSpec {
                symbol: Symbol::new("ETH-0628"),
                underlying: Symbol::new("ETH/USDT"),
                expiry: Timestamp::from_millis(START + 30 * 86_400_000),
                contract_size: dec!(1),
                tick_size: dec!(0.5),
                margin_requirement_ratio: dec!(0.1),
            })
            .await
            .unwrap();

        let err = engine
            .open_futures_position(&carol, &contract.symbol, Side::Long, dec!(2), dec!(3000))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientMargin {
                available: Quote::new(dec!(500)),
                required: Quote::new(dec!(600)),
            }
        );

        handles.custody.deposit(&carol, Quote::new(dec!(100)));
        let position = engine
            .open_futures_position(&carol, &contract.symbol, Side::Long, dec!(2), dec!(3000))
            .await
            .unwrap();
        assert_eq!(position.kind, PositionKind::Futures);
        assert_eq!(position.entry_notional().value(), dec!(6000));
        assert_eq!(position.margin_required.value(), dec!(600));
        assert_eq!(position.leverage.value(), 10);
        assert_eq!(position.symbol, Symbol::new("ETH/USDT"));
    }
}

mod contract_tests {
    use super::*;

    fn spec(symbol: &str, expiry_days: i64) -> ContractSpec {
        ContractSpec {
            symbol: Symbol::new(symbol),
            underlying: Symbol::new("BTC/USDT"),
            expiry: Timestamp::from_millis(START + expiry_days * 86_400_000),
            contract_size: dec!(0.01),
            tick_size: dec!(1),
            margin_requirement_ratio: dec!(0.05),
        }
    }

    #[tokio::test]
    async fn duplicate_and_weak_contracts_are_rejected() {
        let (engine, _handles) = setup();
        engine.create_futures_contract(spec("BTC-0927", 30)).await.unwrap();

        let dup = engine.create_futures_contract(spec("btc-0927", 60)).await;
        assert!(matches!(
            dup,
            Err(EngineError::InvalidContract(ContractError::DuplicateSymbol(_)))
        ));

        let mut weak = spec("BTC-1227", 60);
        weak.margin_requirement_ratio = dec!(0.005);
        assert!(matches!(
            engine.create_futures_contract(weak).await,
            Err(EngineError::InvalidContract(ContractError::MarginBelowMaintenance { .. }))
        ));

        assert!(matches!(
            engine.create_futures_contract(spec("BTC-OLD", -1)).await,
            Err(EngineError::InvalidContract(ContractError::AlreadyExpired(_)))
        ));
    }

    #[tokio::test]
    async fn expired_contract_cannot_be_traded() {
        let (engine, handles) = setup();
        let dave = funded(&handles, "dave", dec!(100_000));
        let contract = engine.create_futures_contract(spec("BTC-WEEKLY", 7)).await.unwrap();

        assert!(engine
            .open_futures_position(&dave, &contract.symbol, Side::Short, dec!(10), dec!(45000))
            .await
            .is_ok());

        handles.clock.advance_millis(7 * 86_400_000);
        let err = engine
            .open_futures_position(&dave, &contract.symbol, Side::Short, dec!(10), dec!(45000))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::ContractNotFound(contract.symbol.clone()));

        let expired = engine.expire_contracts().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(engine.contracts().await.unwrap()[0].status, ContractStatus::Expired);
    }

    #[tokio::test]
    async fn off_tick_and_unknown_contracts() {
        let (engine, handles) = setup();
        let dave = funded(&handles, "dave", dec!(100_000));
        let contract = engine.create_futures_contract(spec("BTC-0927", 30)).await.unwrap();

        let off_tick = engine
            .open_futures_position(&dave, &contract.symbol, Side::Long, dec!(1), dec!(45000.5))
            .await;
        assert!(matches!(off_tick, Err(EngineError::InvalidOrder(_))));

        let unknown = engine
            .open_futures_position(&dave, &Symbol::new("SOL-0927"), Side::Long, dec!(1), dec!(150))
            .await;
        assert_eq!(unknown, Err(EngineError::ContractNotFound(Symbol::new("SOL-0927"))));
    }
}

mod scanner_tests {
    use super::*;

    #[tokio::test]
    async fn oracle_failure_is_isolated_per_symbol() {
        let (engine, handles) = setup();
        let alice = funded(&handles, "alice", dec!(100_000));

        let btc = engine
            .open_margin_position(&alice, &Symbol::new("BTC/USDT"), Side::Long, dec!(1), dec!(45000), 10)
            .await
            .unwrap();
        let eth = engine
            .open_margin_position(&alice, &Symbol::new("ETH/USDT"), Side::Long, dec!(1), dec!(3000), 10)
            .await
            .unwrap();

        // one clean pass so ETH has a persisted mark
        handles.oracle.set_price("BTC/USDT", dec!(44000));
        handles.oracle.set_price("ETH/USDT", dec!(2900));
        let scanner = LiquidationScanner::new(engine.clone());
        scanner.scan_once().await.unwrap();

        handles.oracle.set_failing("ETH/USDT", true);
        handles.oracle.set_price("BTC/USDT", dec!(40000));
        let report = scanner.scan_once().await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.unpriced, 1);
        assert_eq!(report.liquidated.len(), 1);
        assert_eq!(report.liquidated[0].position_id, btc.id);

        let eth_now = engine.get_position(eth.id).await.unwrap();
        assert!(eth_now.is_open());
        assert_eq!(eth_now.unrealized_pnl.value(), dec!(-100));

        // the summary falls back to the persisted mark for ETH
        let summary = engine.portfolio_risk_summary(&alice).await.unwrap();
        assert_eq!(summary.open_positions, 1);
        assert_eq!(summary.positions[0].mark_source, MarkSource::LastKnown);
        assert_eq!(summary.positions[0].mark_price.value(), dec!(2900));
        assert_eq!(summary.total_unrealized_pnl.value(), dec!(-100));
    }

    #[tokio::test]
    async fn user_close_between_read_and_liquidation_is_skipped() {
        let (engine, handles) = setup();
        let alice = funded(&handles, "alice", dec!(10_000));
        let position = engine
            .open_margin_position(&alice, &Symbol::new("BTC/USDT"), Side::Long, dec!(1), dec!(45000), 10)
            .await
            .unwrap();
        engine.close_position(&alice, position.id, Some(dec!(44000))).await.unwrap();

        let err = engine
            .liquidate_position(position.id, Price::new_unchecked(dec!(40000)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyClosed { .. }));
        assert!(engine.liquidation_events().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn background_jobs_run_and_stop() {
        let mut config = EngineConfig::default();
        config.scanner.interval = Duration::from_secs(1);
        config.volatility.interval = Duration::from_secs(1);
        let (engine, mut handles) = Engine::in_memory(config, Timestamp::from_millis(START)).unwrap();
        let alice = funded(&handles, "alice", dec!(10_000));

        for (symbol, price, change) in [
            ("BTC/USDT", dec!(45000), dec!(0.01)),
            ("ETH/USDT", dec!(3000), dec!(0.02)),
            ("SOL/USDT", dec!(150), dec!(-0.14)),
        ] {
            handles.oracle.set_price(symbol, price);
            handles.oracle.set_change(symbol, change);
        }
        let position = engine
            .open_margin_position(&alice, &Symbol::new("SOL/USDT"), Side::Long, dec!(10), dec!(150), 10)
            .await
            .unwrap();
        handles.oracle.set_price("SOL/USDT", dec!(130));

        let scanner = engine.start_liquidation_scanner();
        let monitor = engine.start_volatility_monitor();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        scanner.shutdown().await;
        monitor.shutdown().await;

        assert_eq!(
            engine.get_position(position.id).await.unwrap().status,
            PositionStatus::Liquidated
        );

        let mut alerts = 0;
        while let Ok(notification) = handles.notifications.try_recv() {
            if let Notification::Volatility(alert) = notification {
                assert_eq!(alert.symbol, Symbol::new("SOL/USDT"));
                alerts += 1;
            }
        }
        // manual clock never moves, so the cooldown holds after the first alert
        assert_eq!(alerts, 1);
    }
}
