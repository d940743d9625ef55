pub mod allocation;
pub mod market_data;
pub mod optimization;
pub mod screening;

use clap::Args;
use folio_core::prices::PriceFrame;
use folio_core::types::TickerWeight;
use folio_core::weights::write_weights_csv;
use folio_market_data::{ClientConfig, YahooClient};
use tracing::{info, warn};

use crate::config::{dedupe, pascal_case, FolioConfig};

pub type CmdResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Ticker selection shared by every data-driven command
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct UniverseArgs {
    /// Comma-separated tickers (e.g. "XOM,CVX,COP")
    #[arg(long, value_delimiter = ',')]
    pub tickers: Option<Vec<String>>,

    /// Named universe: energy, consumer, industrial-materials, tech or one from --config
    #[arg(long)]
    pub universe: Option<String>,
}

/// A resolved ticker list and the name used for output files.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub name: String,
    pub tickers: Vec<String>,
}

impl Selection {
    /// `<Universe>.csv`, mirroring the universe name.
    pub fn default_csv_name(&self) -> String {
        format!("{}.csv", self.name)
    }
}

impl UniverseArgs {
    pub fn resolve(&self, config: &FolioConfig) -> CmdResult<Selection> {
        if let Some(name) = &self.universe {
            let tickers = config.universe(name).ok_or_else(|| {
                let known: Vec<String> = config.all_universes().into_keys().collect();
                format!("Unknown universe '{}'. Known: {}", name, known.join(", "))
            })?;
            if tickers.is_empty() {
                return Err(format!("Universe '{}' has no tickers", name).into());
            }
            return Ok(Selection {
                name: pascal_case(name),
                tickers,
            });
        }
        let tickers = dedupe(self.tickers.iter().flatten().map(String::as_str));
        if tickers.is_empty() {
            return Err("--tickers or --universe required".into());
        }
        Ok(Selection {
            name: "Portfolio".into(),
            tickers,
        })
    }
}

pub fn market_client() -> CmdResult<YahooClient> {
    Ok(YahooClient::new(ClientConfig::default())?)
}

/// Closes for `tickers`, from a local CSV when given, otherwise downloaded.
///
/// Tickers missing from the CSV or without provider data are dropped with
/// a warning. The frame is forward-filled either way.
pub async fn load_prices(
    prices: Option<&str>,
    tickers: &[String],
    range: &str,
) -> CmdResult<PriceFrame> {
    let frame = match prices {
        Some(path) => {
            let file = crate::input::file::open(path)?;
            let all = PriceFrame::read_csv(file)?;
            let (present, missing): (Vec<String>, Vec<String>) = tickers
                .iter()
                .cloned()
                .partition(|t| all.position(t).is_some());
            if !missing.is_empty() {
                warn!("Not in {}: {}", path, missing.join(", "));
            }
            if present.is_empty() {
                return Err(format!("None of the requested tickers are in {}", path).into());
            }
            let mut frame = all.select(&present)?;
            frame.forward_fill();
            frame
        }
        None => {
            let fetched = market_client()?.fetch_price_frame(tickers, range).await?;
            if !fetched.skipped.is_empty() {
                warn!(
                    "Dropped {} ticker(s) without price history: {}",
                    fetched.skipped.len(),
                    fetched.skipped.join(", ")
                );
            }
            fetched.frame
        }
    };
    info!("Using {} tickers over {} dates", frame.tickers.len(), frame.len());
    Ok(frame)
}

/// Put warnings from earlier pipeline steps ahead of the final step's own.
pub fn prepend_warnings(warnings: &mut Vec<String>, earlier: Vec<String>) {
    let later = std::mem::replace(warnings, earlier);
    warnings.extend(later);
}

/// Write a `Stock,Weight` file and announce it on stderr.
pub fn write_weight_file(path: &str, weights: &[TickerWeight]) -> CmdResult<()> {
    write_weights_csv(path, weights)?;
    eprintln!("CSV file '{}' has been created.", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(tickers: Option<&[&str]>, universe: Option<&str>) -> UniverseArgs {
        UniverseArgs {
            tickers: tickers.map(|t| t.iter().map(|s| s.to_string()).collect()),
            universe: universe.map(str::to_string),
        }
    }

    #[test]
    fn test_resolve_universe() {
        let sel = args(None, Some("industrial-materials"))
            .resolve(&FolioConfig::default())
            .unwrap();
        assert_eq!(sel.default_csv_name(), "IndustrialMaterials.csv");
        assert_eq!(sel.tickers[0], "LIN");
    }

    #[test]
    fn test_resolve_tickers() {
        let sel = args(Some(&["xom", " cvx", "XOM"]), None)
            .resolve(&FolioConfig::default())
            .unwrap();
        assert_eq!(
            sel,
            Selection {
                name: "Portfolio".into(),
                tickers: vec!["XOM".into(), "CVX".into()],
            }
        );
    }

    #[test]
    fn test_unknown_universe() {
        let err = args(None, Some("crypto"))
            .resolve(&FolioConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("energy"));
    }
}
