use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::engine::TradingMode;
use crate::error::{EngineError, Result};

#[derive(Parser)]
#[command(name = "breakout")]
#[command(version = "0.1.0")]
#[command(about = "Leveraged breakout trading engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and environment overrides
    #[arg(short, long, default_value = "config", env = "BREAKOUT_CONFIG_DIR")]
    pub config_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine until Ctrl+C
    Run {
        /// Preset name (defaults to engine.default_preset)
        #[arg(short, long)]
        preset: Option<String>,
        /// paper or live
        #[arg(short, long, default_value = "paper")]
        mode: TradingMode,
        /// JSON file of recorded snapshot batches for the paper venue
        #[arg(short, long)]
        replay: Option<PathBuf>,
    },
    /// List configured presets
    Presets,
    /// Validate configuration and exit
    Check,
}

/// One line per preset with the settings that matter most when choosing
pub fn print_presets(config: &AppConfig) {
    for (name, preset) in &config.presets {
        let default = if *name == config.engine.default_preset {
            " (default)"
        } else {
            ""
        };
        let strategies: Vec<&str> = preset
            .signals
            .priority
            .iter()
            .filter(|kind| match kind {
                crate::domain::StrategyKind::Momentum => preset.signals.momentum.enabled,
                crate::domain::StrategyKind::Retest => preset.signals.retest.enabled,
            })
            .map(|kind| kind.as_str())
            .collect();
        println!(
            "{name}{default}: universe={} risk/trade={} max_leverage={} max_positions={} strategies=[{}]",
            preset.scanner.universe.len(),
            preset.risk.risk_per_trade,
            preset.risk.max_leverage,
            preset.risk.max_concurrent_positions,
            strategies.join(", ")
        );
    }
}

pub fn check_config(config: &AppConfig) -> Result<()> {
    config
        .validate()
        .map_err(|errors| EngineError::validation(errors.join("; ")))?;
    println!(
        "configuration ok: {} preset(s), default '{}'",
        config.presets.len(),
        config.engine.default_preset
    );
    Ok(())
}
