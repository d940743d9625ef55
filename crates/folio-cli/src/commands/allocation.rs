use std::collections::BTreeMap;

use clap::Args;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, info};

use folio_core::allocation::discrete::{greedy_portfolio, DiscreteAllocationInput};
use folio_core::types::Money;
use folio_core::weights::read_weights_csv;
use folio_market_data::yahoo::DEFAULT_INTERVAL;

use crate::commands::{load_prices, market_client, CmdResult};
use crate::config::FolioConfig;

/// Provider range used to look up the latest close
const LATEST_PRICE_RANGE: &str = "5d";

/// Arguments for whole-share allocation
#[derive(Args)]
pub struct AllocateArgs {
    /// Stock,Weight CSV written by max-sharpe or black-litterman
    #[arg(long)]
    pub weights: String,

    /// Local prices CSV; the last close per ticker is used
    #[arg(long)]
    pub prices: Option<String>,

    /// Cash to invest (default from config, 10000)
    #[arg(long)]
    pub portfolio_value: Option<Decimal>,
}

pub async fn run_allocate(args: AllocateArgs, config: &FolioConfig) -> CmdResult<Value> {
    let weights = read_weights_csv(&args.weights)
        .map_err(|e| format!("Failed to read weights '{}': {}", args.weights, e))?;
    let held: Vec<String> = weights
        .iter()
        .filter(|w| w.weight > Decimal::ZERO)
        .map(|w| w.ticker.clone())
        .collect();
    if held.is_empty() {
        return Err(format!("No positive weights in {}", args.weights).into());
    }

    let latest_prices = match &args.prices {
        Some(_) => load_prices(args.prices.as_deref(), &held, LATEST_PRICE_RANGE)
            .await?
            .latest_prices()?,
        None => fetch_latest_prices(&held).await?,
    };

    let input = DiscreteAllocationInput {
        weights,
        latest_prices,
        total_portfolio_value: Some(args.portfolio_value.unwrap_or(config.portfolio_value)),
    };
    let output = greedy_portfolio(&input)?;
    info!(
        "Allocated {} of {} across {} tickers",
        output.result.invested,
        output.result.invested + output.result.leftover,
        output.result.allocation.len()
    );
    Ok(serde_json::to_value(output)?)
}

async fn fetch_latest_prices(tickers: &[String]) -> CmdResult<BTreeMap<String, Money>> {
    let fetched = market_client()?
        .fetch_histories(tickers, LATEST_PRICE_RANGE, DEFAULT_INTERVAL)
        .await?;
    if !fetched.skipped.is_empty() {
        return Err(format!("No latest price for {}", fetched.skipped.join(", ")).into());
    }

    let mut prices = BTreeMap::new();
    for (ticker, history) in fetched.values {
        if let Some((date, close)) = history.closes.last() {
            debug!("{} last close {} on {}", ticker, close, date);
            prices.insert(ticker, *close);
        }
    }
    Ok(prices)
}
