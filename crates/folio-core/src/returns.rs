use rust_decimal::Decimal;
use rust_decimal::MathematicalOps;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::FolioError;
use crate::math::{mat_vec_multiply, validate_covariance_matrix};
use crate::prices::PriceFrame;
use crate::types::*;
use crate::FolioResult;

/// Daily returns: `returns[row][col]` for the move from row to row + 1.
pub type ReturnTable = Vec<Vec<Option<Decimal>>>;

/// How historical returns are annualised
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compounding {
    /// Geometric: (prod(1 + r))^(periods / n) - 1
    #[default]
    Geometric,
    /// Arithmetic: mean(r) * periods
    Arithmetic,
}

/// Settings for annualised return and covariance estimation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorSettings {
    /// Trading periods per year (252 for daily closes)
    pub trading_days: u32,
    pub compounding: Compounding,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            trading_days: 252,
            compounding: Compounding::Geometric,
        }
    }
}

/// Annualised expected returns and covariance for a ticker universe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskModel {
    pub tickers: Vec<String>,
    pub expected_returns: Vec<Rate>,
    pub covariance_matrix: Vec<Vec<Decimal>>,
    /// Number of return observations per ticker
    pub observations: Vec<usize>,
}

/// Estimate mean historical returns and the sample covariance from closes.
pub fn estimate_risk_model(
    frame: &PriceFrame,
    settings: &EstimatorSettings,
) -> FolioResult<ComputationOutput<RiskModel>> {
    let start = Instant::now();
    let mut warnings = Vec::new();

    let returns = daily_returns(frame)?;
    let expected_returns = annualise_returns(&returns, frame, settings)?;
    let covariance_matrix = covariance_from_returns(&returns, frame, settings.trading_days)?;
    let observations: Vec<usize> = (0..frame.tickers.len())
        .map(|c| returns.iter().filter(|row| row[c].is_some()).count())
        .collect();

    let longest = observations.iter().copied().max().unwrap_or(0);
    for (ticker, obs) in frame.tickers.iter().zip(observations.iter()) {
        if *obs * 2 < longest {
            warnings.push(format!(
                "Short history: {} has {} returns vs {} for the longest series",
                ticker, obs, longest
            ));
        }
    }

    let output = RiskModel {
        tickers: frame.tickers.clone(),
        expected_returns,
        covariance_matrix,
        observations,
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Mean historical return with pairwise sample covariance",
        &serde_json::json!({
            "n_tickers": frame.tickers.len(),
            "n_dates": frame.len(),
            "trading_days": settings.trading_days,
            "compounding": settings.compounding,
        }),
        warnings,
        elapsed,
        output,
    ))
}

/// Simple period returns. A return exists only when both closes exist.
pub fn daily_returns(frame: &PriceFrame) -> FolioResult<ReturnTable> {
    if frame.len() < 2 {
        return Err(FolioError::InsufficientData(
            "At least 2 price observations required".into(),
        ));
    }
    for (row, closes) in frame.closes.iter().enumerate() {
        for (col, close) in closes.iter().enumerate() {
            if let Some(p) = close {
                if *p <= Decimal::ZERO {
                    return Err(FolioError::InvalidInput {
                        field: format!("prices.{}", frame.tickers[col]),
                        reason: format!("Non-positive close {} on {}", p, frame.dates[row]),
                    });
                }
            }
        }
    }

    Ok(frame
        .closes
        .windows(2)
        .map(|pair| {
            pair[0]
                .iter()
                .zip(pair[1].iter())
                .map(|(prev, cur)| match (prev, cur) {
                    (Some(p), Some(c)) => Some(*c / *p - Decimal::ONE),
                    _ => None,
                })
                .collect()
        })
        .collect())
}

/// Annualised mean historical return per ticker.
pub fn mean_historical_return(
    frame: &PriceFrame,
    settings: &EstimatorSettings,
) -> FolioResult<Vec<Rate>> {
    let returns = daily_returns(frame)?;
    annualise_returns(&returns, frame, settings)
}

fn annualise_returns(
    returns: &ReturnTable,
    frame: &PriceFrame,
    settings: &EstimatorSettings,
) -> FolioResult<Vec<Rate>> {
    let periods = Decimal::from(settings.trading_days);
    (0..frame.tickers.len())
        .map(|col| {
            let series: Vec<Decimal> = returns.iter().filter_map(|row| row[col]).collect();
            if series.is_empty() {
                return Err(FolioError::InsufficientData(format!(
                    "No returns for {}",
                    frame.tickers[col]
                )));
            }
            let count = Decimal::from(series.len() as i64);
            match settings.compounding {
                Compounding::Arithmetic => {
                    Ok(series.iter().copied().sum::<Decimal>() / count * periods)
                }
                Compounding::Geometric => {
                    let growth: Decimal = series.iter().map(|r| Decimal::ONE + *r).product();
                    let annual = growth.checked_powd(periods / count).ok_or_else(|| {
                        FolioError::FinancialImpossibility(format!(
                            "Cannot annualise growth {} for {}",
                            growth, frame.tickers[col]
                        ))
                    })?;
                    Ok(annual - Decimal::ONE)
                }
            }
        })
        .collect()
}

/// Annualised sample covariance of daily returns (ddof = 1).
pub fn sample_cov(frame: &PriceFrame, trading_days: u32) -> FolioResult<Vec<Vec<Decimal>>> {
    let returns = daily_returns(frame)?;
    covariance_from_returns(&returns, frame, trading_days)
}

/// Pairwise-complete covariance: each pair uses the rows where both
/// tickers have a return.
fn covariance_from_returns(
    returns: &ReturnTable,
    frame: &PriceFrame,
    trading_days: u32,
) -> FolioResult<Vec<Vec<Decimal>>> {
    let n = frame.tickers.len();
    let periods = Decimal::from(trading_days);
    let mut cov = vec![vec![Decimal::ZERO; n]; n];

    for i in 0..n {
        for j in i..n {
            let pairs: Vec<(Decimal, Decimal)> = returns
                .iter()
                .filter_map(|row| Some((row[i]?, row[j]?)))
                .collect();
            if pairs.len() < 2 {
                return Err(FolioError::InsufficientData(format!(
                    "Fewer than 2 overlapping returns for {} and {}",
                    frame.tickers[i], frame.tickers[j]
                )));
            }
            let count = Decimal::from(pairs.len() as i64);
            let mean_i = pairs.iter().map(|(a, _)| *a).sum::<Decimal>() / count;
            let mean_j = pairs.iter().map(|(_, b)| *b).sum::<Decimal>() / count;
            let co: Decimal = pairs
                .iter()
                .map(|(a, b)| (*a - mean_i) * (*b - mean_j))
                .sum::<Decimal>()
                / (count - Decimal::ONE);
            cov[i][j] = co * periods;
            cov[j][i] = cov[i][j];
        }
    }
    Ok(cov)
}

/// Risk aversion implied by a market proxy: (E[r_m] - rf) / Var[r_m].
pub fn market_implied_risk_aversion(
    market_prices: &[Money],
    trading_days: u32,
    risk_free_rate: Rate,
) -> FolioResult<Decimal> {
    if market_prices.len() < 3 {
        return Err(FolioError::InsufficientData(
            "At least 3 market prices required for risk aversion".into(),
        ));
    }
    if market_prices.iter().any(|p| *p <= Decimal::ZERO) {
        return Err(FolioError::InvalidInput {
            field: "market_prices".into(),
            reason: "Prices must be positive".into(),
        });
    }

    let rets: Vec<Decimal> = market_prices
        .windows(2)
        .map(|w| w[1] / w[0] - Decimal::ONE)
        .collect();
    let n = Decimal::from(rets.len() as i64);
    let periods = Decimal::from(trading_days);
    let mean = rets.iter().copied().sum::<Decimal>() / n;
    let var = rets.iter().map(|r| (*r - mean) * (*r - mean)).sum::<Decimal>() / (n - Decimal::ONE);

    let annual_var = var * periods;
    if annual_var.is_zero() {
        return Err(FolioError::DivisionByZero {
            context: "market_implied_risk_aversion: market variance is zero".into(),
        });
    }
    Ok((mean * periods - risk_free_rate) / annual_var)
}

/// Equilibrium returns implied by market caps: pi = delta * Sigma * w_mkt + rf.
pub fn market_implied_prior_returns(
    market_caps: &[Money],
    risk_aversion: Decimal,
    covariance_matrix: &[Vec<Decimal>],
    risk_free_rate: Rate,
) -> FolioResult<Vec<Rate>> {
    let n = market_caps.len();
    validate_covariance_matrix(covariance_matrix, n)?;
    let w_mkt = market_weights(market_caps)?;
    Ok(mat_vec_multiply(covariance_matrix, &w_mkt)
        .into_iter()
        .map(|v| risk_aversion * v + risk_free_rate)
        .collect())
}

/// Normalise market caps into weights summing to one.
pub fn market_weights(market_caps: &[Money]) -> FolioResult<Vec<Decimal>> {
    if market_caps.is_empty() {
        return Err(FolioError::InsufficientData(
            "At least one market cap required".into(),
        ));
    }
    if let Some(i) = market_caps.iter().position(|c| *c < Decimal::ZERO) {
        return Err(FolioError::InvalidInput {
            field: format!("market_caps[{}]", i),
            reason: "Market cap cannot be negative".into(),
        });
    }
    let total: Decimal = market_caps.iter().copied().sum();
    if total.is_zero() {
        return Err(FolioError::DivisionByZero {
            context: "market_weights: total market cap is zero".into(),
        });
    }
    Ok(market_caps.iter().map(|c| *c / total).collect())
}

/// Default risk aversion when no market proxy is available.
pub const DEFAULT_RISK_AVERSION: Decimal = dec!(2.5);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn frame(series: Vec<(&str, Vec<Option<Decimal>>)>) -> PriceFrame {
        let len = series[0].1.len();
        let dates = (0..len)
            .map(|i| NaiveDate::from_ymd_opt(2024, 1, 1 + i as u32).unwrap())
            .collect();
        PriceFrame {
            dates,
            tickers: series.iter().map(|(t, _)| t.to_string()).collect(),
            closes: (0..len)
                .map(|row| series.iter().map(|(_, c)| c[row]).collect())
                .collect(),
        }
    }

    fn daily(trading_days: u32, compounding: Compounding) -> EstimatorSettings {
        EstimatorSettings {
            trading_days,
            compounding,
        }
    }

    // ------------------------------------------------------------------
    // 1. Returns need both closes
    // ------------------------------------------------------------------
    #[test]
    fn test_daily_returns_skip_gaps() {
        let f = frame(vec![
            ("A", vec![Some(dec!(100)), Some(dec!(110)), Some(dec!(99))]),
            ("B", vec![None, Some(dec!(50)), Some(dec!(55))]),
        ]);
        let r = daily_returns(&f).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r[0], vec![Some(dec!(0.1)), None]);
        assert_eq!(r[1], vec![Some(dec!(-0.1)), Some(dec!(0.1))]);
    }

    #[test]
    fn test_daily_returns_reject_non_positive_price() {
        let f = frame(vec![("A", vec![Some(dec!(100)), Some(dec!(0))])]);
        assert!(daily_returns(&f).is_err());
    }

    #[test]
    fn test_daily_returns_need_two_rows() {
        let f = frame(vec![("A", vec![Some(dec!(100))])]);
        assert!(matches!(
            daily_returns(&f),
            Err(FolioError::InsufficientData(_))
        ));
    }

    // ------------------------------------------------------------------
    // 2. Annualisation
    // ------------------------------------------------------------------
    #[test]
    fn test_geometric_return_one_period_per_year() {
        // Two annual observations: 100 -> 121 over two periods = 10% p.a.
        let f = frame(vec![("A", vec![Some(dec!(100)), Some(dec!(110)), Some(dec!(121))])]);
        let mu = mean_historical_return(&f, &daily(2, Compounding::Geometric)).unwrap();
        assert!((mu[0] - dec!(0.21)).abs() < dec!(0.000001), "got {}", mu[0]);

        let mu = mean_historical_return(&f, &daily(1, Compounding::Geometric)).unwrap();
        assert!((mu[0] - dec!(0.10)).abs() < dec!(0.000001), "got {}", mu[0]);
    }

    #[test]
    fn test_arithmetic_return() {
        let f = frame(vec![("A", vec![Some(dec!(100)), Some(dec!(110)), Some(dec!(99))])]);
        let mu = mean_historical_return(&f, &daily(252, Compounding::Arithmetic)).unwrap();
        assert_eq!(mu[0], Decimal::ZERO);
    }

    #[test]
    fn test_no_returns_is_insufficient_data() {
        let f = frame(vec![
            ("A", vec![Some(dec!(1)), Some(dec!(2))]),
            ("B", vec![None, Some(dec!(2))]),
        ]);
        assert!(mean_historical_return(&f, &EstimatorSettings::default()).is_err());
    }

    // ------------------------------------------------------------------
    // 3. Covariance
    // ------------------------------------------------------------------
    #[test]
    fn test_sample_cov_symmetric_and_annualised() {
        let f = frame(vec![
            (
                "A",
                vec![Some(dec!(100)), Some(dec!(101)), Some(dec!(99)), Some(dec!(102))],
            ),
            (
                "B",
                vec![Some(dec!(50)), Some(dec!(50.5)), Some(dec!(50)), Some(dec!(51))],
            ),
        ]);
        let one = sample_cov(&f, 1).unwrap();
        let annual = sample_cov(&f, 252).unwrap();
        assert_eq!(one[0][1], one[1][0]);
        assert!(one[0][1] > Decimal::ZERO, "co-moving assets should covary");
        assert!((annual[0][0] - one[0][0] * dec!(252)).abs() < dec!(0.0000001));
    }

    #[test]
    fn test_sample_cov_known_variance() {
        // returns 0.1, -0.1: mean 0, var = (0.01 + 0.01) / 1 = 0.02
        let f = frame(vec![("A", vec![Some(dec!(100)), Some(dec!(110)), Some(dec!(99))])]);
        let cov = sample_cov(&f, 1).unwrap();
        assert_eq!(cov[0][0], dec!(0.02));
    }

    #[test]
    fn test_estimate_risk_model_warns_on_short_history() {
        let f = frame(vec![
            (
                "LONG",
                vec![
                    Some(dec!(10)),
                    Some(dec!(11)),
                    Some(dec!(10.5)),
                    Some(dec!(11.5)),
                    Some(dec!(12)),
                    Some(dec!(11.8)),
                ],
            ),
            (
                "NEW",
                vec![None, None, None, Some(dec!(5)), Some(dec!(5.2)), Some(dec!(5.1))],
            ),
        ]);
        let out = estimate_risk_model(&f, &EstimatorSettings::default()).unwrap();
        assert_eq!(out.result.observations, vec![5, 2]);
        assert!(out.warnings.iter().any(|w| w.contains("NEW")));
    }

    // ------------------------------------------------------------------
    // 4. Market-implied quantities
    // ------------------------------------------------------------------
    #[test]
    fn test_market_weights_normalise() {
        let w = market_weights(&[dec!(300), dec!(100)]).unwrap();
        assert_eq!(w, vec![dec!(0.75), dec!(0.25)]);
        assert!(market_weights(&[dec!(0), dec!(0)]).is_err());
        assert!(market_weights(&[dec!(-1), dec!(2)]).is_err());
    }

    #[test]
    fn test_prior_returns_formula() {
        let cov = vec![vec![dec!(0.04), dec!(0.01)], vec![dec!(0.01), dec!(0.09)]];
        let pi = market_implied_prior_returns(&[dec!(1), dec!(1)], dec!(2), &cov, dec!(0.02))
            .unwrap();
        // Sigma * w = [0.025, 0.05]; * 2 + 0.02
        assert_eq!(pi, vec![dec!(0.07), dec!(0.12)]);
    }

    #[test]
    fn test_risk_aversion_positive_for_rising_market() {
        let prices: Vec<Decimal> = vec![
            dec!(100),
            dec!(101),
            dec!(100.5),
            dec!(102),
            dec!(103),
            dec!(102.5),
            dec!(104),
        ];
        let delta = market_implied_risk_aversion(&prices, 252, dec!(0.02)).unwrap();
        assert!(delta > Decimal::ZERO);
    }

    #[test]
    fn test_risk_aversion_flat_market_is_error() {
        let prices = vec![dec!(100), dec!(100), dec!(100)];
        assert!(market_implied_risk_aversion(&prices, 252, dec!(0.02)).is_err());
    }
}
