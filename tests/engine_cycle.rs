use breakout::config::AppConfig;
use breakout::domain::{BookLevel, MarketSnapshot, OrderBook, Ticker, TradingState};
use breakout::engine::{EngineEvent, Orchestrator, TradingMode};
use breakout::exchange::{PaperExchange, ReplayMarketData};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

fn quiet_snapshot(symbol: &str, price: Decimal) -> MarketSnapshot {
    MarketSnapshot {
        symbol: symbol.to_string(),
        candles: vec![],
        order_book: OrderBook {
            bids: vec![BookLevel::new(price - dec!(0.01), dec!(1000))],
            asks: vec![BookLevel::new(price + dec!(0.01), dec!(1000))],
            timestamp: None,
        },
        ticker: Ticker {
            symbol: symbol.to_string(),
            last_price: price,
            quote_volume_24h: dec!(100000000),
            price_change_pct_24h: 0.0,
        },
        timestamp: Utc::now(),
    }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default_config();
    config.engine.tick_interval_ms = 10;
    let preset = config.presets.get_mut("default").unwrap();
    preset.scanner.universe = vec!["ETHUSDT".into(), "SOLUSDT".into()];
    preset.scanner.reference_symbol = None;
    config
}

fn paper_venue() -> Arc<PaperExchange> {
    let batch = vec![
        quiet_snapshot("ETHUSDT", dec!(3000)),
        quiet_snapshot("SOLUSDT", dec!(150)),
    ];
    Arc::new(PaperExchange::with_feed(
        test_config().paper,
        ReplayMarketData::new(vec![batch]),
    ))
}

#[tokio::test(start_paused = true)]
async fn engine_cycles_back_to_scanning() {
    let paper = paper_venue();
    let engine = Orchestrator::new(test_config(), paper.clone(), paper).unwrap();
    let handle = engine.handle();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(engine.run(shutdown_rx));

    handle.start(None, TradingMode::Paper).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = handle.snapshot().await;
    assert!(snapshot.state.is_pipeline_stage());
    assert_eq!(snapshot.equity, dec!(10000));
    assert!(snapshot
        .history
        .iter()
        .any(|t| t.from == TradingState::Managing && t.to == TradingState::Scanning));
    assert!(snapshot.open_positions.is_empty());

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
    assert_eq!(handle.state().await, TradingState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn kill_switch_trips_within_one_cycle() {
    let paper = paper_venue();
    let engine = Orchestrator::new(test_config(), paper.clone(), paper.clone()).unwrap();
    let handle = engine.handle();
    let mut events = handle.subscribe();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(engine.run(shutdown_rx));

    handle.start(None, TradingMode::Paper).await.unwrap();
    // 3.1% below the day's starting equity, past the 3% limit
    paper.set_cash(dec!(9690)).await;

    let reason = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(EngineEvent::KillSwitch { reason }) => break reason,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("kill switch event");
    assert!(reason.contains("kill switch"));

    let snapshot = handle.snapshot().await;
    assert_eq!(snapshot.state, TradingState::Emergency);
    assert!(snapshot.entries_blocked);
    assert!(snapshot.risk.kill_switch_active);

    assert!(handle.resume().await.is_err());
    handle.stop().await.unwrap();
    assert_eq!(handle.state().await, TradingState::Stopped);

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reload_swaps_preset_without_restart() {
    let mut config = test_config();
    let mut tight = config.presets["default"].clone();
    tight.risk.max_concurrent_positions = 1;
    config.presets.insert("tight".into(), tight);

    let paper = paper_venue();
    let engine = Orchestrator::new(config, paper.clone(), paper).unwrap();
    let handle = engine.handle();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(engine.run(shutdown_rx));

    handle.start(None, TradingMode::Paper).await.unwrap();
    assert_ok!(handle.reload("tight").await);
    assert_eq!(handle.snapshot().await.preset, "tight");
    assert_err!(handle.reload("missing").await);
    assert!(handle.state().await.is_pipeline_stage());

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}

#[test]
fn shipped_config_is_valid() {
    let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/config");
    let config = AppConfig::load_from(dir).unwrap();
    config.validate().unwrap();
    assert!(config.presets.contains_key("default"));
    let conservative = config.preset("conservative").unwrap();
    assert!(!conservative.signals.retest.enabled);
    assert_eq!(conservative.risk.max_concurrent_positions, 1);
}
