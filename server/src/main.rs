use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use keeper::{
    collaborators::{HttpLedger, HttpPriceOracle, HttpQuoteService},
    config::DEFAULT_CONFIG_PATH,
    millis_since_unix_epoch, AutomationService, Config, Result,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Runs recurring transfers, swaps and rebalances under delegated permissions.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, env = "KEEPER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll for due schedules until interrupted (the default).
    Run,
    /// Process one batch of due schedules and exit.
    Tick,
    /// Print the agent address users must delegate to.
    Keys,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log);
    info!("{}", config);

    match run(args.command.unwrap_or(Command::Run), &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|e| {
            eprintln!("Invalid log filter {default_filter:?}, falling back to info: {e}");
            EnvFilter::new("info")
        });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(command: Command, config: &Config) -> Result<()> {
    let service = service(config)?;

    match command {
        Command::Keys => {
            println!("{}", service.agent_address());
        }
        Command::Tick => {
            let report = service.scheduler().tick(millis_since_unix_epoch()).await?;
            println!("{report:?}");
        }
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Received Ctrl+C, finishing the current tick"),
                    Err(e) => error!("Could not listen for Ctrl+C: {}", e),
                }
                let _ = shutdown_tx.send(true);
            });
            service.scheduler().run(shutdown_rx).await?;
        }
    }
    Ok(())
}

fn service(config: &Config) -> Result<AutomationService> {
    let quotes = Arc::new(HttpQuoteService::new(config.quote_service_url.clone())?);
    let prices = Arc::new(HttpPriceOracle::new(config.price_oracle_url.clone())?);
    let ledger = Arc::new(HttpLedger::new(config.ledger_url.clone())?);

    #[cfg(feature = "sqlite")]
    let store = {
        let store = keeper::store::SqliteStore::open(&config.database_path)?;
        info!("Using schedule database {}", store.path().display());
        Arc::new(store)
    };
    #[cfg(not(feature = "sqlite"))]
    let store = {
        tracing::warn!("Built without sqlite, schedules will not survive a restart");
        Arc::new(keeper::store::MemoryStore::new())
    };

    AutomationService::from_config(config, store, quotes, prices, ledger)
}
