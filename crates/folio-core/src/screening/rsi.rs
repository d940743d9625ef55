use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::FolioError;
use crate::types::*;
use crate::FolioResult;

pub const DEFAULT_RSI_WINDOW: usize = 14;
pub const DEFAULT_OVERBOUGHT: Decimal = dec!(70);
pub const DEFAULT_OVERSOLD: Decimal = dec!(30);

/// Which side of the oscillator the screen looks for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// RSI strictly above the threshold
    #[default]
    Overbought,
    /// RSI strictly below the threshold
    Oversold,
}

impl Signal {
    pub fn default_threshold(&self) -> Decimal {
        match self {
            Signal::Overbought => DEFAULT_OVERBOUGHT,
            Signal::Oversold => DEFAULT_OVERSOLD,
        }
    }

    fn triggers(&self, rsi: Decimal, threshold: Decimal) -> bool {
        match self {
            Signal::Overbought => rsi > threshold,
            Signal::Oversold => rsi < threshold,
        }
    }
}

/// Closing prices of one ticker, oldest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerCloses {
    pub ticker: String,
    pub closes: Vec<Money>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiScreenInput {
    pub series: Vec<TickerCloses>,
    #[serde(default)]
    pub window: Option<usize>,
    #[serde(default)]
    pub threshold: Option<Decimal>,
    #[serde(default)]
    pub signal: Signal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsiReading {
    pub ticker: String,
    pub rsi: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiScreenOutput {
    /// Tickers meeting the signal, in input order
    pub hits: Vec<RsiReading>,
    /// Latest RSI of every ticker that had one
    pub readings: Vec<RsiReading>,
    /// Tickers with no data or too little history
    pub skipped: Vec<String>,
}

/// Screen tickers on their latest RSI.
pub fn screen_rsi(input: &RsiScreenInput) -> FolioResult<ComputationOutput<RsiScreenOutput>> {
    let start = Instant::now();
    let mut warnings = Vec::new();

    let window = input.window.unwrap_or(DEFAULT_RSI_WINDOW);
    if window == 0 {
        return Err(FolioError::InvalidInput {
            field: "window".into(),
            reason: "RSI window must be at least 1".into(),
        });
    }
    let threshold = input
        .threshold
        .unwrap_or_else(|| input.signal.default_threshold());
    if threshold < Decimal::ZERO || threshold > dec!(100) {
        return Err(FolioError::InvalidInput {
            field: "threshold".into(),
            reason: format!("RSI threshold must be within [0, 100], got {}", threshold),
        });
    }

    let mut hits = Vec::new();
    let mut readings = Vec::new();
    let mut skipped = Vec::new();

    for series in &input.series {
        match latest_rsi(&series.closes, window) {
            Some(rsi) => {
                let reading = RsiReading {
                    ticker: series.ticker.clone(),
                    rsi,
                };
                if input.signal.triggers(rsi, threshold) {
                    hits.push(reading.clone());
                }
                readings.push(reading);
            }
            None => skipped.push(series.ticker.clone()),
        }
    }

    if !skipped.is_empty() {
        warnings.push(format!(
            "No RSI for {} ticker(s): {}",
            skipped.len(),
            skipped.join(", ")
        ));
    }

    let output = RsiScreenOutput {
        hits,
        readings,
        skipped,
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Relative Strength Index (simple moving average of gains and losses)",
        &serde_json::json!({
            "window": window,
            "threshold": threshold.to_string(),
            "signal": input.signal,
            "n_tickers": input.series.len(),
        }),
        warnings,
        elapsed,
        output,
    ))
}

/// RSI at every close; `None` for the first `window - 1` closes and
/// wherever the window saw no movement at all.
///
/// The first close has no predecessor and counts as a zero change, so
/// `window` closes are enough for a reading.
pub fn rsi_series(closes: &[Money], window: usize) -> Vec<Option<Decimal>> {
    let mut out = vec![None; closes.len()];
    if window == 0 || closes.len() < window {
        return out;
    }

    let deltas: Vec<Decimal> = std::iter::once(Decimal::ZERO)
        .chain(closes.windows(2).map(|w| w[1] - w[0]))
        .collect();
    let size = Decimal::from(window as i64);

    // out[i] averages deltas[i + 1 - window ..= i]
    for i in (window - 1)..closes.len() {
        let span = &deltas[i + 1 - window..=i];
        let gain: Decimal = span.iter().filter(|d| **d > Decimal::ZERO).copied().sum();
        let loss: Decimal = span.iter().filter(|d| **d < Decimal::ZERO).map(|d| -*d).sum();
        out[i] = rsi_from_averages(gain / size, loss / size);
    }
    out
}

/// Latest RSI, or `None` for empty or too-short histories.
pub fn latest_rsi(closes: &[Money], window: usize) -> Option<Decimal> {
    if closes.is_empty() {
        return None;
    }
    rsi_series(closes, window).last().copied().flatten()
}

fn rsi_from_averages(avg_gain: Decimal, avg_loss: Decimal) -> Option<Decimal> {
    if avg_loss.is_zero() {
        if avg_gain.is_zero() {
            return None;
        }
        return Some(dec!(100));
    }
    let rs = avg_gain / avg_loss;
    Some(dec!(100) - dec!(100) / (Decimal::ONE + rs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn prices(v: &[i64]) -> Vec<Decimal> {
        v.iter().map(|p| Decimal::from(*p)).collect()
    }

    #[test]
    fn test_too_short_history() {
        assert_eq!(latest_rsi(&prices(&[1, 2]), 3), None);
        assert!(latest_rsi(&prices(&[1, 2, 3]), 3).is_some());
    }

    #[test]
    fn test_exactly_window_closes() {
        // deltas: 0 (first close), +2, -1, +3 -> gains 5/4, losses 1/4, rs 5
        let closes = prices(&[10, 12, 11, 14]);
        let rsi = latest_rsi(&closes, 4).unwrap();
        assert_eq!(rsi.round_dp(6), dec!(83.333333));

        let fourteen: Vec<Decimal> = (0..14).map(|i| Decimal::from(100 + (i % 3))).collect();
        assert!(latest_rsi(&fourteen, DEFAULT_RSI_WINDOW).is_some());
    }

    #[test]
    fn test_empty_history() {
        assert_eq!(latest_rsi(&[], DEFAULT_RSI_WINDOW), None);
    }

    #[test]
    fn test_only_gains_is_100() {
        let closes = prices(&[10, 11, 12, 13, 14]);
        assert_eq!(latest_rsi(&closes, 4), Some(dec!(100)));
    }

    #[test]
    fn test_only_losses_is_0() {
        let closes = prices(&[14, 13, 12, 11, 10]);
        assert_eq!(latest_rsi(&closes, 4), Some(dec!(0)));
    }

    #[test]
    fn test_flat_window_is_undefined() {
        let closes = prices(&[10, 10, 10, 10]);
        assert_eq!(latest_rsi(&closes, 3), None);
    }

    #[test]
    fn test_known_value() {
        // deltas: +2, -1, +1, -2 -> gains 3/4, losses 3/4 -> RSI 50
        let closes = prices(&[10, 12, 11, 12, 10]);
        assert_eq!(latest_rsi(&closes, 4), Some(dec!(50)));

        // deltas: +3, -1 -> avg gain 1.5, avg loss 0.5, rs 3 -> 75
        let closes = prices(&[10, 13, 12]);
        assert_eq!(latest_rsi(&closes, 2), Some(dec!(75)));
    }

    #[test]
    fn test_series_uses_rolling_window() {
        let closes = prices(&[10, 11, 12, 11, 10, 9]);
        let s = rsi_series(&closes, 2);
        assert_eq!(s[0], None);
        // leading zero change plus +1
        assert_eq!(s[1], Some(dec!(100)));
        assert_eq!(s[2], Some(dec!(100)));
        assert_eq!(s[3], Some(dec!(50)));
        assert_eq!(s[5], Some(dec!(0)));
    }

    #[test]
    fn test_screen_overbought_and_skipped() {
        let input = RsiScreenInput {
            series: vec![
                TickerCloses {
                    ticker: "UP".into(),
                    closes: prices(&[10, 11, 12, 13, 14]),
                },
                TickerCloses {
                    ticker: "MIXED".into(),
                    closes: prices(&[10, 12, 11, 12, 10]),
                },
                TickerCloses {
                    ticker: "EMPTY".into(),
                    closes: vec![],
                },
            ],
            window: Some(4),
            threshold: None,
            signal: Signal::Overbought,
        };
        let out = screen_rsi(&input).unwrap();
        let r = &out.result;
        assert_eq!(r.hits.len(), 1);
        assert_eq!(r.hits[0].ticker, "UP");
        assert_eq!(r.readings.len(), 2);
        assert_eq!(r.skipped, vec!["EMPTY".to_string()]);
        assert!(out.warnings[0].contains("EMPTY"));
    }

    #[test]
    fn test_screen_oversold() {
        let input = RsiScreenInput {
            series: vec![TickerCloses {
                ticker: "DOWN".into(),
                closes: prices(&[14, 13, 12, 11, 10]),
            }],
            window: Some(4),
            threshold: None,
            signal: Signal::Oversold,
        };
        let out = screen_rsi(&input).unwrap();
        assert_eq!(out.result.hits[0].rsi, dec!(0));
    }

    #[test]
    fn test_threshold_is_strict() {
        let input = RsiScreenInput {
            series: vec![TickerCloses {
                ticker: "HALF".into(),
                closes: prices(&[10, 12, 11, 12, 10]),
            }],
            window: Some(4),
            threshold: Some(dec!(50)),
            signal: Signal::Overbought,
        };
        assert!(screen_rsi(&input).unwrap().result.hits.is_empty());
    }

    #[test]
    fn test_invalid_window_and_threshold() {
        let mut input = RsiScreenInput {
            series: vec![],
            window: Some(0),
            threshold: None,
            signal: Signal::Overbought,
        };
        assert!(screen_rsi(&input).is_err());
        input.window = None;
        input.threshold = Some(dec!(101));
        assert!(screen_rsi(&input).is_err());
    }
}
