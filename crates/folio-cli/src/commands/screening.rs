use clap::Args;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::info;

use folio_core::prices::PriceFrame;
use folio_core::screening::rsi::{screen_rsi, RsiScreenInput, Signal, TickerCloses};
use folio_market_data::yahoo::DEFAULT_INTERVAL;

use crate::commands::{market_client, CmdResult, UniverseArgs};
use crate::input;
use crate::config::FolioConfig;

/// Arguments for the RSI screen
#[derive(Args)]
pub struct RsiScreenArgs {
    #[command(flatten)]
    pub universe: UniverseArgs,

    /// RSI look-back in price changes (default from config, 14)
    #[arg(long)]
    pub window: Option<usize>,

    /// Trigger level (default 70, or 30 with --oversold)
    #[arg(long)]
    pub threshold: Option<Decimal>,

    /// Look for RSI below the threshold instead of above
    #[arg(long)]
    pub oversold: bool,

    /// Provider history range (default from config, 6mo)
    #[arg(long)]
    pub range: Option<String>,

    /// Local prices CSV (Date,<ticker>,...) instead of downloading
    #[arg(long)]
    pub prices: Option<String>,
}

pub async fn run_rsi_screen(args: RsiScreenArgs, config: &FolioConfig) -> CmdResult<Value> {
    let selection = args.universe.resolve(config)?;
    let signal = if args.oversold {
        Signal::Oversold
    } else {
        Signal::Overbought
    };
    let threshold = args.threshold.unwrap_or(match signal {
        Signal::Overbought => config.rsi_overbought,
        Signal::Oversold => config.rsi_oversold,
    });

    let series = match &args.prices {
        Some(path) => closes_from_csv(path, &selection.tickers)?,
        None => {
            let range = args.range.as_deref().unwrap_or(config.rsi_range.as_str());
            closes_from_provider(&selection.tickers, range).await?
        }
    };

    let input = RsiScreenInput {
        series,
        window: Some(args.window.unwrap_or(config.rsi_window)),
        threshold: Some(threshold),
        signal,
    };
    let output = screen_rsi(&input)?;
    info!(
        "RSI screen over {} tickers: {} hits",
        selection.tickers.len(),
        output.result.hits.len()
    );
    Ok(serde_json::to_value(output)?)
}

fn closes_from_csv(path: &str, tickers: &[String]) -> CmdResult<Vec<TickerCloses>> {
    let file = input::file::open(path)?;
    let frame = PriceFrame::read_csv(file)?;
    Ok(tickers
        .iter()
        .map(|t| TickerCloses {
            ticker: t.clone(),
            closes: frame.observed(t).unwrap_or_default(),
        })
        .collect())
}

/// Provider closes per ticker; tickers without data get no closes.
async fn closes_from_provider(tickers: &[String], range: &str) -> CmdResult<Vec<TickerCloses>> {
    let mut fetched = market_client()?
        .fetch_histories(tickers, range, DEFAULT_INTERVAL)
        .await?;
    Ok(tickers
        .iter()
        .map(|ticker| {
            let closes = fetched
                .values
                .iter_mut()
                .find(|(symbol, _)| symbol == ticker)
                .map(|(_, history)| std::mem::take(&mut history.closes))
                .unwrap_or_default();
            TickerCloses {
                ticker: ticker.clone(),
                closes: closes.into_iter().map(|(_, close)| close).collect(),
            }
        })
        .collect())
}
