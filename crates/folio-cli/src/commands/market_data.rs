use std::fs::File;

use clap::Args;
use serde_json::{json, Value};
use tracing::info;

use crate::commands::{load_prices, CmdResult, UniverseArgs};
use crate::config::FolioConfig;

/// Arguments for downloading close prices
#[derive(Args)]
pub struct FetchArgs {
    #[command(flatten)]
    pub universe: UniverseArgs,

    /// Provider history range (1mo, 6mo, 1y, 5y, max). Defaults to history_range from config
    #[arg(long)]
    pub range: Option<String>,

    /// Destination CSV (Date,<ticker>,...)
    #[arg(long, default_value = "prices.csv")]
    pub out: String,
}

pub async fn run_fetch(args: FetchArgs, config: &FolioConfig) -> CmdResult<Value> {
    let selection = args.universe.resolve(config)?;
    let range = args.range.as_deref().unwrap_or(config.history_range.as_str());
    info!("Fetching {} tickers over {}", selection.tickers.len(), range);

    let frame = load_prices(None, &selection.tickers, range).await?;
    let file = File::create(&args.out)
        .map_err(|e| format!("Failed to create '{}': {}", args.out, e))?;
    frame.write_csv(file)?;
    eprintln!("CSV file '{}' has been created.", args.out);

    let skipped: Vec<&String> = selection
        .tickers
        .iter()
        .filter(|t| frame.position(t).is_none())
        .collect();

    Ok(json!({
        "result": {
            "universe": selection.name,
            "tickers": frame.tickers,
            "skipped": skipped,
            "dates": frame.len(),
            "first_date": frame.dates.first(),
            "last_date": frame.dates.last(),
            "out": args.out,
        }
    }))
}

pub fn run_universes(config: &FolioConfig) -> CmdResult<Value> {
    let universes: Vec<Value> = config
        .all_universes()
        .into_iter()
        .map(|(name, tickers)| {
            json!({
                "name": name,
                "count": tickers.len(),
                "tickers": tickers.join(","),
            })
        })
        .collect();
    Ok(json!({ "result": universes }))
}
