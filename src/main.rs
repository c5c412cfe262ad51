//! Margin engine simulation.
//!
//! Runs the reference scenarios against in-memory collaborators: liquidation
//! at the threshold, the leverage cap, futures margin, close settlement and
//! the two background jobs.

use anyhow::{bail, Result};
use margin_engine::*;
use rust_decimal_macros::dec;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("Margin Engine Simulation\n");

    scenario_1_liquidation_threshold().await?;
    scenario_2_leverage_cap().await?;
    scenario_3_futures_margin().await?;
    scenario_4_close_settlement().await?;
    scenario_5_background_jobs().await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

fn engine() -> Result<(Engine, InMemoryHandles)> {
    let config = EngineConfig::from_env();
    Ok(Engine::in_memory(config, Timestamp::now())?)
}

/// Long BTC 10x from 45000. liquidation price 40725.
async fn scenario_1_liquidation_threshold() -> Result<()> {
    println!("Scenario 1: Liquidation Threshold\n");

    let (engine, handles) = engine()?;
    let alice = UserId::new("alice");
    let btc = Symbol::new("BTC/USDT");
    handles.custody.deposit(&alice, Quote::new(dec!(10_000)));

    let position = engine
        .open_margin_position(&alice, &btc, Side::Long, dec!(1), dec!(45000), 10)
        .await?;
    println!("  Alice opens LONG 1 BTC @ $45,000, 10x");
    println!("  Margin locked: ${}", position.margin_required);
    println!("  Liquidation price: ${}\n", position.liquidation_price);

    let scanner = LiquidationScanner::new(engine.clone());

    handles.oracle.set_price("BTC/USDT", dec!(40800));
    let report = scanner.scan_once().await?;
    println!("  Mark $40,800: {} liquidated, {} at risk", report.liquidated.len(), report.at_risk);

    handles.oracle.set_price("BTC/USDT", dec!(40700));
    let report = scanner.scan_once().await?;
    println!("  Mark $40,700: {} liquidated", report.liquidated.len());
    if let Some(result) = report.liquidated.first() {
        println!("    Fee: ${}, payout: ${}, shortfall: ${}", result.fee, result.payout, result.shortfall);
    }

    let holding = handles.custody.holding(&alice);
    println!("  Alice available: ${}, locked: ${}", holding.available, holding.locked);
    println!("  Ledger entries: {}", engine.liquidation_events().await?.len());
    println!("  Review queue: {}\n", engine.review_queue().await?.len());
    Ok(())
}

async fn scenario_2_leverage_cap() -> Result<()> {
    println!("Scenario 2: Leverage Cap\n");

    let (engine, handles) = engine()?;
    let bob = UserId::new("bob");
    handles.custody.deposit(&bob, Quote::new(dec!(10_000)));

    let result = engine
        .execute(EngineCommand::OpenMargin {
            user_id: bob,
            symbol: Symbol::new("BTC/USDT"),
            side: Side::Long,
            size: dec!(0.1),
            price: dec!(45000),
            leverage: 150,
        })
        .await;
    match result {
        Err(e) => println!("  Bob requests 150x on BTC/USDT: {:?} ({})\n", e.code, e.message),
        Ok(_) => bail!("150x on BTC/USDT should be refused"),
    }
    Ok(())
}

async fn scenario_3_futures_margin() -> Result<()> {
    println!("Scenario 3: Futures Margin\n");

    let (engine, handles) = engine()?;
    let carol = UserId::new("carol");
    handles.custody.deposit(&carol, Quote::new(dec!(500)));

    let contract = engine
        .create_futures_contract(ContractSpec {
            symbol: Symbol::new("ETH-QUARTERLY"),
            underlying: Symbol::new("ETH/USDT"),
            expiry: engine.now().plus_millis(90 * 86_400_000),
            contract_size: dec!(1),
            tick_size: dec!(0.5),
            margin_requirement_ratio: dec!(0.1),
        })
        .await?;
    println!("  Contract {} on {}, margin ratio {}", contract.symbol, contract.underlying, contract.margin_requirement_ratio);

    let refused = engine
        .open_futures_position(&carol, &contract.symbol, Side::Long, dec!(2), dec!(3000))
        .await;
    match refused {
        Err(e) => println!("  Carol with $500 opens 2 contracts @ $3,000: {}", e),
        Ok(_) => bail!("600 margin against a 500 balance should be refused"),
    }

    handles.custody.deposit(&carol, Quote::new(dec!(500)));
    let position = engine
        .open_futures_position(&carol, &contract.symbol, Side::Long, dec!(2), dec!(3000))
        .await?;
    println!(
        "  After topping up to $1,000: notional ${}, margin ${}, display leverage {}\n",
        position.entry_notional(),
        position.margin_required,
        position.leverage
    );
    Ok(())
}

async fn scenario_4_close_settlement() -> Result<()> {
    println!("Scenario 4: Close Settlement\n");

    let (engine, handles) = engine()?;
    let dave = UserId::new("dave");
    let eth = Symbol::new("ETH/USDT");
    handles.custody.deposit(&dave, Quote::new(dec!(5_000)));

    let winner = engine
        .open_margin_position(&dave, &eth, Side::Short, dec!(2), dec!(3000), 5)
        .await?;
    handles.oracle.set_price("ETH/USDT", dec!(2800));
    let closed = engine.close_position(&dave, winner.id, None).await?;
    println!("  Short 2 ETH @ $3,000 closed at oracle $2,800: pnl ${}, payout ${}", closed.realized_pnl, closed.payout);

    let loser = engine
        .open_margin_position(&dave, &eth, Side::Long, dec!(1), dec!(3000), 20)
        .await?;
    let closed = engine.close_position(&dave, loser.id, Some(dec!(2800))).await?;
    println!(
        "  Long 1 ETH @ $3,000 20x closed at $2,800: payout ${}, shortfall ${} flagged",
        closed.payout, closed.shortfall
    );

    let summary = engine.portfolio_risk_summary(&dave).await?;
    println!(
        "  Dave: {} open, realized today ${}, available ${}\n",
        summary.open_positions,
        summary.realized_today,
        handles.custody.holding(&dave).available
    );
    Ok(())
}

async fn scenario_5_background_jobs() -> Result<()> {
    println!("Scenario 5: Background Jobs\n");

    let mut config = EngineConfig::from_env();
    config.scanner.interval = Duration::from_millis(100);
    config.volatility.interval = Duration::from_millis(100);
    let (engine, mut handles) = Engine::in_memory(config, Timestamp::now())?;

    let erin = UserId::new("erin");
    handles.custody.deposit(&erin, Quote::new(dec!(2_000)));
    for (symbol, price, change) in [
        ("BTC/USDT", dec!(45000), dec!(0.01)),
        ("ETH/USDT", dec!(3000), dec!(0.04)),
        ("SOL/USDT", dec!(150), dec!(-0.14)),
    ] {
        handles.oracle.set_price(symbol, price);
        handles.oracle.set_change(symbol, change);
    }

    let position = engine
        .open_margin_position(&erin, &Symbol::new("SOL/USDT"), Side::Long, dec!(10), dec!(150), 10)
        .await?;
    println!("  Erin opens LONG 10 SOL @ $150, liquidation price ${}", position.liquidation_price);

    let scanner = engine.start_liquidation_scanner();
    let monitor = engine.start_volatility_monitor();

    handles.oracle.set_price("SOL/USDT", dec!(130));
    tokio::time::sleep(Duration::from_millis(350)).await;

    scanner.shutdown().await;
    monitor.shutdown().await;

    let stored = engine.get_position(position.id).await?;
    println!("  SOL drops to $130, position is now {}", stored.status);

    let mut volatility_alerts = 0;
    let mut liquidations = 0;
    while let Ok(notification) = handles.notifications.try_recv() {
        match notification {
            Notification::Volatility(_) => volatility_alerts += 1,
            Notification::Liquidation(_) => liquidations += 1,
            Notification::Review(_) => {}
        }
    }
    println!("  Notifications: {} volatility alert(s), {} liquidation(s)", volatility_alerts, liquidations);
    Ok(())
}
