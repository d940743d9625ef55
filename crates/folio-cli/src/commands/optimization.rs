use std::collections::BTreeMap;

use clap::Args;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use folio_core::optimization::black_litterman::{
    optimize_black_litterman, BlackLittermanInput, Prior, View,
};
use folio_core::optimization::efficient_frontier::{optimize_max_sharpe, MaxSharpeInput};
use folio_core::prices::PriceFrame;
use folio_core::returns::{
    estimate_risk_model, market_implied_risk_aversion, Compounding, EstimatorSettings,
    DEFAULT_RISK_AVERSION,
};
use folio_core::types::{ComputationOutput, Money, TickerWeight};
use folio_market_data::yahoo::DEFAULT_INTERVAL;

use crate::commands::{
    load_prices, market_client, prepend_warnings, write_weight_file, CmdResult, UniverseArgs,
};
use crate::config::FolioConfig;
use crate::input;

/// Arguments for maximum-Sharpe optimisation
#[derive(Args)]
pub struct MaxSharpeArgs {
    #[command(flatten)]
    pub universe: UniverseArgs,

    /// Local prices CSV (Date,<ticker>,...) instead of downloading
    #[arg(long)]
    pub prices: Option<String>,

    /// Weights file to write (default <Universe>.csv)
    #[arg(long)]
    pub csv_out: Option<String>,

    /// Annual risk-free rate (default from config)
    #[arg(long)]
    pub risk_free_rate: Option<Decimal>,

    /// Upper bound on any single weight (e.g. 0.25)
    #[arg(long)]
    pub max_weight: Option<Decimal>,

    /// Annualise the arithmetic mean instead of compounding
    #[arg(long)]
    pub simple_returns: bool,
}

/// Arguments for Black-Litterman allocation
#[derive(Args)]
pub struct BlackLittermanArgs {
    #[command(flatten)]
    pub universe: UniverseArgs,

    /// JSON views: an array of views or {"views": [...], "confidences": [...]}.
    /// Read from stdin when piped; no views means the market prior is used as is
    #[arg(long)]
    pub views: Option<String>,

    /// JSON object of ticker -> market cap (downloaded when omitted)
    #[arg(long)]
    pub market_caps: Option<String>,

    /// Market index used to imply risk aversion
    #[arg(long, default_value = "SPY")]
    pub market_proxy: String,

    /// Fixed risk aversion instead of implying it from the market proxy
    #[arg(long)]
    pub risk_aversion: Option<Decimal>,

    /// Prior uncertainty scalar (default 0.05)
    #[arg(long)]
    pub tau: Option<Decimal>,

    /// Annual risk-free rate (default from config)
    #[arg(long)]
    pub risk_free_rate: Option<Decimal>,

    /// Local prices CSV (Date,<ticker>,...) instead of downloading
    #[arg(long)]
    pub prices: Option<String>,

    /// Weights file to write (default <Universe>.csv)
    #[arg(long)]
    pub csv_out: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ViewsFile {
    Bare(Vec<View>),
    Full {
        views: Vec<View>,
        #[serde(default)]
        confidences: Option<Vec<Decimal>>,
    },
}

impl ViewsFile {
    fn into_parts(self) -> (Vec<View>, Option<Vec<Decimal>>) {
        match self {
            ViewsFile::Bare(views) => (views, None),
            ViewsFile::Full { views, confidences } => (views, confidences),
        }
    }
}

pub async fn run_max_sharpe(args: MaxSharpeArgs, config: &FolioConfig) -> CmdResult<Value> {
    let selection = args.universe.resolve(config)?;
    let frame = load_prices(
        args.prices.as_deref(),
        &selection.tickers,
        &config.history_range,
    )
    .await?;

    let settings = EstimatorSettings {
        trading_days: config.trading_days,
        compounding: if args.simple_returns {
            Compounding::Arithmetic
        } else {
            Compounding::Geometric
        },
    };
    let ComputationOutput {
        result: model,
        warnings: model_warnings,
        ..
    } = estimate_risk_model(&frame, &settings)?;

    let input = MaxSharpeInput {
        tickers: model.tickers,
        expected_returns: model.expected_returns,
        covariance_matrix: model.covariance_matrix,
        risk_free_rate: args.risk_free_rate.unwrap_or(config.risk_free_rate),
        min_weight: None,
        max_weight: args.max_weight,
        weight_cutoff: Some(config.weight_cutoff),
        weight_decimals: Some(config.weight_decimals),
    };
    let mut output = optimize_max_sharpe(&input)?;
    prepend_warnings(&mut output.warnings, model_warnings);

    let path = args
        .csv_out
        .unwrap_or_else(|| selection.default_csv_name());
    write_weight_file(&path, &output.result.weights)?;
    info!(
        "Max Sharpe for {}: {} holdings, Sharpe {:.3}",
        selection.name, output.result.holdings, output.result.performance.sharpe_ratio
    );

    Ok(serde_json::to_value(output)?)
}

pub async fn run_black_litterman(
    args: BlackLittermanArgs,
    config: &FolioConfig,
) -> CmdResult<Value> {
    let selection = args.universe.resolve(config)?;
    let rf = args.risk_free_rate.unwrap_or(config.risk_free_rate);
    let mut warnings: Vec<String> = Vec::new();

    let (views, view_confidences) = read_views(args.views.as_deref())?;

    let caps = match &args.market_caps {
        Some(path) => {
            let caps: BTreeMap<String, Money> = input::file::read_json(path)?;
            let caps: BTreeMap<String, Money> = caps
                .into_iter()
                .map(|(t, c)| (t.trim().to_uppercase(), c))
                .collect();
            if let Some(missing) = selection.tickers.iter().find(|t| !caps.contains_key(*t)) {
                return Err(format!("No market cap for {} in {}", missing, path).into());
            }
            caps
        }
        None => fetch_market_caps(&selection.tickers, &mut warnings).await?,
    };
    let tickers: Vec<String> = selection
        .tickers
        .iter()
        .filter(|t| caps.contains_key(*t))
        .cloned()
        .collect();

    let frame = load_prices(args.prices.as_deref(), &tickers, &config.history_range).await?;
    let settings = EstimatorSettings {
        trading_days: config.trading_days,
        ..EstimatorSettings::default()
    };
    let ComputationOutput {
        result: model,
        warnings: model_warnings,
        ..
    } = estimate_risk_model(&frame, &settings)?;
    warnings.extend(model_warnings);

    let risk_aversion = match args.risk_aversion {
        Some(delta) => delta,
        None => implied_risk_aversion(&args, config, rf, &mut warnings).await,
    };

    let market_caps = model
        .tickers
        .iter()
        .map(|t| caps.get(t).copied().ok_or_else(|| format!("No market cap for {}", t)))
        .collect::<Result<Vec<Money>, _>>()?;
    let input = BlackLittermanInput {
        tickers: model.tickers,
        covariance_matrix: model.covariance_matrix,
        prior: Prior::MarketImplied {
            market_caps,
            risk_aversion,
        },
        views,
        view_confidences,
        tau: args.tau,
        risk_free_rate: rf,
        weight_cutoff: Some(config.weight_cutoff),
        weight_decimals: Some(config.weight_decimals),
    };
    let mut output = optimize_black_litterman(&input)?;
    prepend_warnings(&mut output.warnings, warnings);

    let weights: Vec<TickerWeight> = output
        .result
        .weights
        .iter()
        .map(|tw| TickerWeight::new(tw.ticker.clone(), tw.weight))
        .collect();
    let path = args
        .csv_out
        .clone()
        .unwrap_or_else(|| selection.default_csv_name());
    write_weight_file(&path, &weights)?;
    info!(
        "Black-Litterman for {}: {} views, Sharpe {:.3}",
        selection.name,
        input.views.len(),
        output.result.performance.sharpe_ratio
    );

    Ok(serde_json::to_value(output)?)
}

fn read_views(path: Option<&str>) -> CmdResult<(Vec<View>, Option<Vec<Decimal>>)> {
    let file: Option<ViewsFile> = if let Some(path) = path {
        Some(input::file::read_json(path)?)
    } else {
        input::stdin::read_stdin()?
    };
    Ok(file.map(ViewsFile::into_parts).unwrap_or_default())
}

async fn fetch_market_caps(
    tickers: &[String],
    warnings: &mut Vec<String>,
) -> CmdResult<BTreeMap<String, Money>> {
    let fetched = market_client()?.fetch_market_caps(tickers).await?;
    for ticker in &fetched.skipped {
        warnings.push(format!("Dropped {}: no market cap", ticker));
    }
    if fetched.values.is_empty() {
        return Err("No market caps available for any ticker".into());
    }
    Ok(fetched.values.into_iter().collect())
}

/// Risk aversion implied by the market proxy, or the default with a warning.
async fn implied_risk_aversion(
    args: &BlackLittermanArgs,
    config: &FolioConfig,
    rf: Decimal,
    warnings: &mut Vec<String>,
) -> Decimal {
    let closes = match proxy_closes(args, config).await {
        Ok(closes) => closes,
        Err(e) => {
            warn!("Market proxy {} unavailable: {}", args.market_proxy, e);
            warnings.push(format!(
                "Market proxy {} unavailable; using risk aversion {}",
                args.market_proxy, DEFAULT_RISK_AVERSION
            ));
            return DEFAULT_RISK_AVERSION;
        }
    };
    match market_implied_risk_aversion(&closes, config.trading_days, rf) {
        Ok(delta) => delta,
        Err(e) => {
            warn!("Could not imply risk aversion from {}: {}", args.market_proxy, e);
            warnings.push(format!(
                "Risk aversion from {} failed ({}); using {}",
                args.market_proxy, e, DEFAULT_RISK_AVERSION
            ));
            DEFAULT_RISK_AVERSION
        }
    }
}

/// Proxy closes from the local prices file when one is given, else downloaded.
async fn proxy_closes(args: &BlackLittermanArgs, config: &FolioConfig) -> CmdResult<Vec<Money>> {
    match &args.prices {
        Some(path) => {
            let file = input::file::open(path)?;
            let frame = PriceFrame::read_csv(file)?;
            Ok(frame.observed(&args.market_proxy)?)
        }
        None => {
            let history = market_client()?
                .fetch_history(&args.market_proxy, &config.history_range, DEFAULT_INTERVAL)
                .await?;
            Ok(history.close_values())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_views_file_bare_array() {
        let json = r#"[{"type": "absolute", "ticker": "XOM", "expected_return": 0.08}]"#;
        let (views, conf) = serde_json::from_str::<ViewsFile>(json)
            .unwrap()
            .into_parts();
        assert_eq!(views.len(), 1);
        assert!(conf.is_none());
    }

    #[test]
    fn test_views_file_with_confidences() {
        let json = r#"{
            "views": [
                {"type": "relative", "long": "CVX", "short": "BP", "outperformance": 0.02}
            ],
            "confidences": [0.6]
        }"#;
        let (views, conf) = serde_json::from_str::<ViewsFile>(json)
            .unwrap()
            .into_parts();
        assert!(matches!(views[0], View::Relative { .. }));
        assert_eq!(conf, Some(vec![dec!(0.6)]));
    }
}
