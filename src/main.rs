//! Deriv Tick Trading Bot
//!
//! Trades short binary contracts on a moving-average momentum signal with
//! martingale stake sizing, halting at a profit target or stop-loss.

mod api;
mod bot;
mod error;
mod models;
mod paper;
mod replay;
mod router;
mod trading;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{ClientConfig, DEFAULT_APP_ID, DERIV_WS_URL};
use crate::bot::{Bot, ControlCommand, RunConfig};
use crate::models::ContractType;
use crate::paper::PaperConfig;
use crate::replay::{load_prices, Replayer};
use crate::trading::{BotParams, StatusEvent, StopLossMode, TradingConfig};

/// Deriv tick trading bot CLI.
#[derive(Parser)]
#[command(name = "tickbot")]
#[command(about = "Trade Deriv tick contracts on a moving-average signal", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Print status events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to Deriv and trade until the session halts
    Run {
        #[command(flatten)]
        bot: BotArgs,

        #[command(flatten)]
        engine: EngineArgs,

        /// Deriv application id
        #[arg(long, env = "DERIV_APP_ID", default_value = DEFAULT_APP_ID)]
        app_id: String,

        /// Deriv API token (not needed with --paper)
        #[arg(long, env = "DERIV_API_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Deriv WebSocket endpoint
        #[arg(long, env = "DERIV_WS_URL", default_value = DERIV_WS_URL)]
        endpoint: String,

        /// Paper trade against live ticks (no real orders)
        #[arg(long)]
        paper: bool,

        /// Initial paper balance
        #[arg(long, default_value = "10000")]
        capital: f64,

        /// Keep the connection open after the session halts
        #[arg(long)]
        keep_running: bool,
    },

    /// Replay a price file through the paper venue
    Replay {
        /// Newline-separated prices (CSV: last column)
        file: PathBuf,

        #[command(flatten)]
        bot: BotArgs,

        #[command(flatten)]
        engine: EngineArgs,

        /// Initial paper balance
        #[arg(long, default_value = "10000")]
        capital: f64,

        /// Simulated time between ticks in milliseconds
        #[arg(long, default_value = "1000")]
        tick_interval_ms: u64,
    },

    /// Show the effective configuration
    Config {
        #[command(flatten)]
        engine: EngineArgs,
    },
}

/// Bot parameters, validated when the session starts.
#[derive(Args, Debug, Clone)]
struct BotArgs {
    /// Instrument symbol, e.g. R_100
    #[arg(long, env = "BOT_SYMBOL")]
    symbol: Option<String>,

    /// Base stake per contract
    #[arg(long, env = "BOT_STAKE")]
    stake: Option<f64>,

    /// Stake multiplier after a loss
    #[arg(long, env = "BOT_MARTINGALE_FACTOR")]
    martingale_factor: Option<f64>,

    /// Consecutive losses before the stake resets
    #[arg(long, env = "BOT_MAX_MARTINGALE_DEPTH")]
    max_martingale_depth: Option<u32>,

    /// Halt once cumulative profit reaches this amount
    #[arg(long, env = "BOT_TARGET_PROFIT")]
    target_profit: Option<f64>,

    /// Stop-loss threshold, compared per --stop-loss-mode
    #[arg(long, env = "BOT_STOP_LOSS")]
    stop_loss: Option<f64>,
}

impl BotArgs {
    fn params(&self) -> BotParams {
        BotParams {
            symbol: self.symbol.clone(),
            base_stake: self.stake,
            martingale_factor: self.martingale_factor,
            max_martingale_depth: self.max_martingale_depth,
            target_profit: self.target_profit,
            stop_loss: self.stop_loss,
        }
    }
}

/// Engine tuning.
#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Moving average window (ticks)
    #[arg(long, default_value = "8")]
    window: usize,

    /// Historical ticks requested at start
    #[arg(long, default_value = "100")]
    history_count: u32,

    /// Contract duration in ticks
    #[arg(long, default_value = "5")]
    duration: u32,

    /// Contract direction bought on a positive signal
    #[arg(long, default_value = "CALL")]
    contract_type: ContractType,

    /// Minimum time between proposals (ms)
    #[arg(long, default_value = "1000")]
    proposal_spacing_ms: u64,

    /// Delay before retrying a rate-limited proposal (ms)
    #[arg(long, default_value = "1000")]
    rate_limit_backoff_ms: u64,

    /// balance_floor or cumulative_loss
    #[arg(long, env = "BOT_STOP_LOSS_MODE", default_value = "balance_floor")]
    stop_loss_mode: StopLossMode,

    /// Account currency
    #[arg(long, default_value = "USD")]
    currency: String,
}

impl EngineArgs {
    fn trading_config(&self) -> TradingConfig {
        TradingConfig {
            window: self.window,
            history_count: self.history_count,
            proposal_spacing_ms: self.proposal_spacing_ms,
            rate_limit_backoff_ms: self.rate_limit_backoff_ms,
            contract_type: self.contract_type,
            duration: self.duration,
            currency: self.currency.clone(),
            stop_loss_mode: self.stop_loss_mode,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            bot: bot_args,
            engine,
            app_id,
            token,
            endpoint,
            paper,
            capital,
            keep_running,
        } => {
            let trading = engine.trading_config();
            let paper_config = if paper {
                Some(PaperConfig {
                    initial_balance: Decimal::try_from(capital)
                        .context("Invalid paper capital")?,
                    duration_ticks: trading.duration,
                    ..Default::default()
                })
            } else {
                None
            };

            let run_config = RunConfig {
                client: ClientConfig::new(endpoint, app_id),
                token,
                trading,
                paper: paper_config,
                exit_when_finished: !keep_running,
            };

            let mut bot = Bot::new(run_config)?;
            let printer = spawn_status_printer(bot.subscribe(), cli.json);

            let (commands, command_rx) = mpsc::unbounded_channel();
            commands.send(ControlCommand::Start(bot_args.params()))?;
            spawn_signal_handler(commands.clone());

            println!("\n=== Deriv Tick Trading Bot ===");
            println!("Symbol: {}", bot_args.symbol.as_deref().unwrap_or("-"));
            println!("Mode: {}", if paper { "PAPER (no real trades)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            let result = bot.run(command_rx).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Bot error");
            }

            let summary = bot.summary();
            drop(bot);
            let _ = printer.await;

            if let Some(summary) = summary {
                println!("\n{}", summary);
            }
            result?;
        }

        Commands::Replay {
            file,
            bot: bot_args,
            engine,
            capital,
            tick_interval_ms,
        } => {
            let prices = load_prices(&file)?;
            info!(file = %file.display(), ticks = prices.len(), "Replaying price file");

            let trading = engine.trading_config();
            let paper = PaperConfig {
                initial_balance: Decimal::try_from(capital).context("Invalid paper capital")?,
                duration_ticks: trading.duration,
                ..Default::default()
            };

            let mut replayer = Replayer::new(trading, paper, Duration::from_millis(tick_interval_ms));
            let report = replayer.run(&bot_args.params(), &prices)?;

            if cli.json {
                for event in replayer.published() {
                    println!("{}", serde_json::to_string(event)?);
                }
            }
            println!("\n{}", report);
        }

        Commands::Config { engine } => {
            let config = engine.trading_config();
            let client = ClientConfig::default();

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }

            println!("\n=== Trading Configuration ===\n");
            println!("Signal:");
            println!("  Moving Average Window: {} ticks", config.window);
            println!("  History Backfill:      {} ticks", config.history_count);

            println!("\nContracts:");
            println!("  Type:                  {}", config.contract_type);
            println!("  Duration:              {}{}", config.duration, config.duration_unit);
            println!("  Currency:              {}", config.currency);

            println!("\nPacing:");
            println!("  Proposal Spacing:      {}ms", config.proposal_spacing_ms);
            println!("  Rate Limit Backoff:    {}ms", config.rate_limit_backoff_ms);

            println!("\nRisk:");
            println!("  Stop Loss Mode:        {}", config.stop_loss_mode);

            println!("\n=== Connection ===\n");
            println!("  Endpoint:              {}", client.endpoint);
            println!("  App Id:                {}", client.app_id);
            println!("  Connect Timeout:       {}s", client.connect_timeout.as_secs());
            println!("  Ping Interval:         {}s", client.ping_interval.as_secs());
            println!("  Reconnect Budget:      {}s", client.reconnect_budget.as_secs());
        }
    }

    Ok(())
}

/// Print status events until the bot shuts down.
fn spawn_status_printer(mut events: broadcast::Receiver<StatusEvent>, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if json {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!("Failed to serialize status event: {}", e),
                        }
                    } else {
                        println!("{}", event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status printer lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// First Ctrl+C stops trading (an open contract still settles), the
/// second exits immediately.
fn spawn_signal_handler(commands: mpsc::UnboundedSender<ControlCommand>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Shutdown signal received, stopping session");
        let _ = commands.send(ControlCommand::Stop);

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Second shutdown signal, exiting");
        let _ = commands.send(ControlCommand::Shutdown);
    });
}
