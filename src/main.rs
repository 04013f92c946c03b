use anyhow::{bail, Context};
use clap::Parser;
use breakout::cli::{self, Cli, Commands};
use breakout::config::{AppConfig, LoggingConfig};
use breakout::engine::{EngineEvent, EngineHandle, Orchestrator, TradingMode};
use breakout::exchange::{PaperExchange, ReplayMarketData};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)
        .with_context(|| format!("loading config from {}", cli.config_dir.display()))?;

    match cli.command {
        Commands::Presets => {
            init_logging_simple();
            cli::print_presets(&config);
        }
        Commands::Check => {
            init_logging_simple();
            cli::check_config(&config)?;
        }
        Commands::Run {
            preset,
            mode,
            replay,
        } => {
            init_logging(&config.logging);
            run_engine(config, preset, mode, replay).await?;
        }
    }
    Ok(())
}

async fn run_engine(
    config: AppConfig,
    preset: Option<String>,
    mode: TradingMode,
    replay: Option<PathBuf>,
) -> anyhow::Result<()> {
    if mode == TradingMode::Live {
        bail!("no live venue client is configured; run with --mode paper");
    }
    let replay = replay.context("paper mode needs --replay <file> with recorded snapshots")?;
    let feed = ReplayMarketData::from_file(&replay)?;
    let paper = Arc::new(PaperExchange::with_feed(config.paper.clone(), feed));

    let engine = Orchestrator::new(config, paper.clone(), paper)?;
    let handle = engine.handle();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));
    let reporter = tokio::spawn(report_events(handle.clone()));

    if let Err(e) = handle.start(preset, mode).await {
        error!(error = %e, "engine failed to start");
    }

    shutdown_signal().await;
    info!("shutdown requested");
    let _ = shutdown_tx.send(());
    engine_task.await.context("engine task panicked")?;
    reporter.abort();

    let snapshot = handle.snapshot().await;
    info!(
        state = %snapshot.state,
        open = snapshot.open_positions.len(),
        closed = snapshot.closed_positions.len(),
        equity = %snapshot.equity,
        "final state"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn report_events(handle: EngineHandle) {
    let mut events = handle.subscribe();
    loop {
        match events.recv().await {
            Ok(EngineEvent::KillSwitch { reason }) => warn!(%reason, "kill switch"),
            Ok(EngineEvent::PositionUpdated { position, update }) => info!(
                position_id = position.id,
                symbol = %position.symbol,
                status = ?position.status,
                action = ?update.map(|u| u.action.kind()),
                pnl = %position.pnl_usd.round_dp(2),
                "position"
            ),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event reporter lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
