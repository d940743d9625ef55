mod commands;
mod config;
mod input;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::process;
use tracing_subscriber::EnvFilter;

use commands::allocation::AllocateArgs;
use commands::market_data::FetchArgs;
use commands::optimization::{BlackLittermanArgs, MaxSharpeArgs};
use commands::screening::RsiScreenArgs;
use config::FolioConfig;

const DEFAULT_LOG_FILTER: &str = "folio=info,folio_market_data=info";
const VERBOSE_LOG_FILTER: &str = "folio=debug,folio_market_data=debug";

/// Price history, RSI screening and portfolio allocation
#[derive(Parser)]
#[command(
    name = "folio",
    version,
    about = "Price history, RSI screening and portfolio allocation",
    long_about = "Downloads daily closes for a ticker universe, computes maximum-Sharpe \
                  and Black-Litterman weights with decimal precision, screens tickers \
                  on RSI, and turns weights into whole-share orders."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    output: OutputFormat,

    /// YAML settings file (risk-free rate, ranges, universes, ...)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Debug logging on stderr (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download daily closes into a prices CSV
    Fetch(FetchArgs),
    /// Maximum Sharpe ratio weights, written as a Stock,Weight CSV
    MaxSharpe(MaxSharpeArgs),
    /// Black-Litterman weights from market-implied priors and views
    BlackLitterman(BlackLittermanArgs),
    /// Screen tickers for overbought (or oversold) RSI
    RsiScreen(RsiScreenArgs),
    /// Whole-share allocation of a Stock,Weight CSV
    Allocate(AllocateArgs),
    /// List built-in and configured universes
    Universes,
    /// Print version information
    Version,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
    Minimal,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match FolioConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    };

    let result: Result<serde_json::Value, Box<dyn std::error::Error>> = match cli.command {
        Commands::Fetch(args) => commands::market_data::run_fetch(args, &config).await,
        Commands::MaxSharpe(args) => commands::optimization::run_max_sharpe(args, &config).await,
        Commands::BlackLitterman(args) => {
            commands::optimization::run_black_litterman(args, &config).await
        }
        Commands::RsiScreen(args) => commands::screening::run_rsi_screen(args, &config).await,
        Commands::Allocate(args) => commands::allocation::run_allocate(args, &config).await,
        Commands::Universes => commands::market_data::run_universes(&config),
        Commands::Version => {
            println!("folio {}", env!("CARGO_PKG_VERSION"));
            return;
        }
    };

    match result {
        Ok(value) => {
            output::format_output(&cli.output, &value);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}
