use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::FolioError;
use crate::math::{
    mat_add, mat_inverse, mat_multiply, mat_scale, mat_transpose, mat_vec_multiply,
    validate_covariance_matrix,
};
use crate::optimization::efficient_frontier::{
    clean_weights, max_sharpe_weights, portfolio_performance, WeightBounds,
    DEFAULT_WEIGHT_CUTOFF, DEFAULT_WEIGHT_DECIMALS,
};
use crate::returns::{market_implied_prior_returns, market_weights};
use crate::types::*;
use crate::FolioResult;

/// Default scalar uncertainty of the prior.
pub const DEFAULT_TAU: Decimal = dec!(0.05);

/// Floor for a view variance when the investor is fully confident.
const MIN_OMEGA: Decimal = dec!(0.0000000001);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An investor view, referencing tickers by symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum View {
    /// "Ticker will return X% per year."
    Absolute {
        ticker: String,
        expected_return: Rate,
    },
    /// "Long ticker will outperform short ticker by X% per year."
    Relative {
        long: String,
        short: String,
        outperformance: Rate,
    },
}

/// Source of the prior (equilibrium) returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Prior {
    /// pi = delta * Sigma * w_mkt + rf, with w_mkt from market caps.
    MarketImplied {
        market_caps: Vec<Money>,
        risk_aversion: Decimal,
    },
    /// Caller-supplied prior returns.
    Explicit { returns: Vec<Rate> },
}

/// Input to Black-Litterman allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackLittermanInput {
    /// Ticker identifiers.
    pub tickers: Vec<String>,
    /// N x N annualized covariance matrix.
    pub covariance_matrix: Vec<Vec<Decimal>>,
    pub prior: Prior,
    #[serde(default)]
    pub views: Vec<View>,
    /// Confidence in each view, in (0, 1]. Omitted: omega proportional to
    /// the prior variance of each view.
    #[serde(default)]
    pub view_confidences: Option<Vec<Decimal>>,
    /// Prior uncertainty scalar (default 0.05).
    #[serde(default)]
    pub tau: Option<Decimal>,
    /// Annual risk-free rate.
    pub risk_free_rate: Rate,
    #[serde(default)]
    pub weight_cutoff: Option<Decimal>,
    #[serde(default)]
    pub weight_decimals: Option<u32>,
}

/// Weight of one ticker against its market weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiltedWeight {
    pub ticker: String,
    pub weight: Weight,
    pub market_weight: Option<Weight>,
    pub tilt: Option<Decimal>,
    pub prior_return: Rate,
    pub posterior_return: Rate,
}

/// How a single view moved the posterior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewContribution {
    pub view_description: String,
    pub impact_on_return: Decimal,
    pub omega_ii: Decimal,
}

/// Output of Black-Litterman allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackLittermanOutput {
    pub prior_returns: Vec<Rate>,
    pub posterior_returns: Vec<Rate>,
    pub posterior_covariance: Vec<Vec<Decimal>>,
    /// Cleaned max-Sharpe weights on the posterior, with tilts.
    pub weights: Vec<TiltedWeight>,
    pub raw_weights: Vec<Weight>,
    /// Performance of the cleaned weights under the posterior estimates.
    pub performance: PortfolioPerformance,
    pub view_contributions: Vec<ViewContribution>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Blend the prior with investor views and allocate at maximum Sharpe.
pub fn optimize_black_litterman(
    input: &BlackLittermanInput,
) -> FolioResult<ComputationOutput<BlackLittermanOutput>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    let n = input.tickers.len();
    validate_input(input, n)?;

    let sigma = &input.covariance_matrix;
    let tau = input.tau.unwrap_or(DEFAULT_TAU);
    let rf = input.risk_free_rate;
    let k = input.views.len();

    let (prior, w_mkt) = match &input.prior {
        Prior::MarketImplied {
            market_caps,
            risk_aversion,
        } => (
            market_implied_prior_returns(market_caps, *risk_aversion, sigma, rf)?,
            Some(market_weights(market_caps)?),
        ),
        Prior::Explicit { returns } => (returns.clone(), None),
    };

    let posterior = posterior_estimate(
        sigma,
        &prior,
        &input.views,
        input.view_confidences.as_deref(),
        &input.tickers,
        tau,
    )?;

    let (raw_weights, _) = max_sharpe_weights(
        &posterior.returns,
        &posterior.covariance,
        rf,
        &WeightBounds::long_only(),
    )?;

    let cutoff = input.weight_cutoff.unwrap_or(DEFAULT_WEIGHT_CUTOFF);
    let decimals = input.weight_decimals.unwrap_or(DEFAULT_WEIGHT_DECIMALS);
    let cleaned = clean_weights(&raw_weights, cutoff, decimals);
    let performance =
        portfolio_performance(&cleaned, &posterior.returns, &posterior.covariance, rf)?;

    let weights: Vec<TiltedWeight> = (0..n)
        .map(|i| {
            let market_weight = w_mkt.as_ref().map(|w| w[i]);
            TiltedWeight {
                ticker: input.tickers[i].clone(),
                weight: cleaned[i],
                market_weight,
                tilt: market_weight.map(|m| cleaned[i] - m),
                prior_return: prior[i],
                posterior_return: posterior.returns[i],
            }
        })
        .collect();

    let view_contributions = compute_view_contributions(
        &input.views,
        &input.tickers,
        &posterior.omega,
        &prior,
        &posterior.returns,
    );

    for tw in &weights {
        if tw.weight > dec!(0.50) {
            warnings.push(format!(
                "Concentrated position: {} has weight {:.4}",
                tw.ticker, tw.weight
            ));
        }
        if let Some(tilt) = tw.tilt {
            if tilt.abs() > dec!(0.20) {
                warnings.push(format!(
                    "Large tilt from market: {} tilt = {:.4}",
                    tw.ticker, tilt
                ));
            }
        }
    }
    if k == 0 {
        warnings.push("No views supplied: posterior equals the prior".into());
    }

    let output = BlackLittermanOutput {
        prior_returns: prior,
        posterior_returns: posterior.returns,
        posterior_covariance: posterior.covariance,
        weights,
        raw_weights,
        performance,
        view_contributions,
    };

    let omega_method = if input.view_confidences.is_some() {
        "idzorek"
    } else {
        "prior_variance"
    };
    let prior_source = match &input.prior {
        Prior::MarketImplied { risk_aversion, .. } => {
            format!("market_implied(delta={})", risk_aversion)
        }
        Prior::Explicit { .. } => "explicit".to_string(),
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Black-Litterman posterior with maximum Sharpe allocation",
        &serde_json::json!({
            "n_tickers": n,
            "n_views": k,
            "tau": tau.to_string(),
            "risk_free_rate": rf.to_string(),
            "omega": omega_method,
            "prior": prior_source,
        }),
        warnings,
        elapsed,
        output,
    ))
}

/// Posterior returns and covariance.
#[derive(Debug, Clone)]
pub struct Posterior {
    pub returns: Vec<Rate>,
    pub covariance: Vec<Vec<Decimal>>,
    /// Diagonal view uncertainty used.
    pub omega: Vec<Decimal>,
}

/// Black-Litterman master formula.
///
/// `mu = pi + tS P' (P tS P' + O)^-1 (Q - P pi)`
/// `S_post = S + tS - tS P' (P tS P' + O)^-1 P tS`
pub fn posterior_estimate(
    sigma: &[Vec<Decimal>],
    prior: &[Rate],
    views: &[View],
    confidences: Option<&[Decimal]>,
    tickers: &[String],
    tau: Decimal,
) -> FolioResult<Posterior> {
    let tau_sigma = mat_scale(sigma, tau);

    if views.is_empty() {
        return Ok(Posterior {
            returns: prior.to_vec(),
            covariance: mat_add(sigma, &tau_sigma),
            omega: Vec::new(),
        });
    }

    let (p_mat, q_vec) = build_pick_matrix_and_q(views, tickers)?;
    let pt = mat_transpose(&p_mat);

    // P tS P' (K x K)
    let tau_sigma_pt = mat_multiply(&tau_sigma, &pt);
    let p_tau_sigma_pt = mat_multiply(&p_mat, &tau_sigma_pt);
    let omega = build_omega(&p_tau_sigma_pt, confidences)?;

    let mut middle = p_tau_sigma_pt.clone();
    for (i, o) in omega.iter().enumerate() {
        middle[i][i] += *o;
    }
    let middle_inv = mat_inverse(&middle)?;

    // Q - P pi
    let p_pi = mat_vec_multiply(&p_mat, prior);
    let surprise: Vec<Decimal> = q_vec.iter().zip(p_pi.iter()).map(|(q, p)| *q - *p).collect();

    // tS P' (P tS P' + O)^-1
    let gain = mat_multiply(&tau_sigma_pt, &middle_inv);
    let adjustment = mat_vec_multiply(&gain, &surprise);
    let returns: Vec<Decimal> = prior
        .iter()
        .zip(adjustment.iter())
        .map(|(pi, a)| *pi + *a)
        .collect();

    // M = tS - gain * P tS
    let p_tau_sigma = mat_transpose(&tau_sigma_pt);
    let reduction = mat_multiply(&gain, &p_tau_sigma);
    let m = mat_add(&tau_sigma, &mat_scale(&reduction, -Decimal::ONE));
    let mut covariance = mat_add(sigma, &m);
    symmetrize(&mut covariance);

    Ok(Posterior {
        returns,
        covariance,
        omega,
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_input(input: &BlackLittermanInput, n: usize) -> FolioResult<()> {
    if n == 0 {
        return Err(FolioError::InsufficientData(
            "At least one ticker required".into(),
        ));
    }

    validate_covariance_matrix(&input.covariance_matrix, n)?;

    match &input.prior {
        Prior::MarketImplied {
            market_caps,
            risk_aversion,
        } => {
            if market_caps.len() != n {
                return Err(FolioError::InvalidInput {
                    field: "prior.market_caps".into(),
                    reason: format!("Expected {} caps but got {}", n, market_caps.len()),
                });
            }
            if *risk_aversion <= Decimal::ZERO {
                return Err(FolioError::InvalidInput {
                    field: "prior.risk_aversion".into(),
                    reason: format!("Must be positive, got {}", risk_aversion),
                });
            }
        }
        Prior::Explicit { returns } => {
            if returns.len() != n {
                return Err(FolioError::InvalidInput {
                    field: "prior.returns".into(),
                    reason: format!("Expected {} returns but got {}", n, returns.len()),
                });
            }
        }
    }

    if let Some(confs) = &input.view_confidences {
        if confs.len() != input.views.len() {
            return Err(FolioError::InvalidInput {
                field: "view_confidences".into(),
                reason: format!(
                    "Number of views ({}) must match number of confidences ({})",
                    input.views.len(),
                    confs.len()
                ),
            });
        }
        for (i, conf) in confs.iter().enumerate() {
            if *conf <= Decimal::ZERO || *conf > Decimal::ONE {
                return Err(FolioError::InvalidInput {
                    field: format!("view_confidences[{}]", i),
                    reason: format!("Confidence must be in (0, 1], got {}", conf),
                });
            }
        }
    }

    if let Some(tau) = input.tau {
        if tau <= Decimal::ZERO {
            return Err(FolioError::InvalidInput {
                field: "tau".into(),
                reason: format!("Must be positive, got {}", tau),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Black-Litterman construction helpers
// ---------------------------------------------------------------------------

fn ticker_index(tickers: &[String], ticker: &str, view: usize) -> FolioResult<usize> {
    tickers
        .iter()
        .position(|t| t == ticker)
        .ok_or_else(|| FolioError::InvalidInput {
            field: format!("views[{}]", view),
            reason: format!("{} is not in the ticker universe", ticker),
        })
}

/// Build the K x N pick matrix P and K-vector Q from views.
fn build_pick_matrix_and_q(
    views: &[View],
    tickers: &[String],
) -> FolioResult<(Vec<Vec<Decimal>>, Vec<Decimal>)> {
    let n = tickers.len();
    let k = views.len();
    let mut p = vec![vec![Decimal::ZERO; n]; k];
    let mut q = vec![Decimal::ZERO; k];

    for (row, view) in views.iter().enumerate() {
        match view {
            View::Absolute {
                ticker,
                expected_return,
            } => {
                p[row][ticker_index(tickers, ticker, row)?] = Decimal::ONE;
                q[row] = *expected_return;
            }
            View::Relative {
                long,
                short,
                outperformance,
            } => {
                let li = ticker_index(tickers, long, row)?;
                let si = ticker_index(tickers, short, row)?;
                if li == si {
                    return Err(FolioError::InvalidInput {
                        field: format!("views[{}]", row),
                        reason: "Relative view must reference two different tickers".into(),
                    });
                }
                p[row][li] = Decimal::ONE;
                p[row][si] = -Decimal::ONE;
                q[row] = *outperformance;
            }
        }
    }

    Ok((p, q))
}

/// Diagonal of Omega.
///
/// Without confidences: omega_ii = (P tS P')_ii.
/// With confidences: omega_ii = (1/c_i - 1) * (P tS P')_ii.
fn build_omega(
    p_tau_sigma_pt: &[Vec<Decimal>],
    confidences: Option<&[Decimal]>,
) -> FolioResult<Vec<Decimal>> {
    let k = p_tau_sigma_pt.len();
    (0..k)
        .map(|i| {
            let variance_term = p_tau_sigma_pt[i][i];
            let omega_ii = match confidences {
                Some(c) => (Decimal::ONE / c[i] - Decimal::ONE) * variance_term,
                None => variance_term,
            };
            if omega_ii < Decimal::ZERO {
                return Err(FolioError::FinancialImpossibility(format!(
                    "Omega[{},{}] = {} is negative; check covariance/confidence",
                    i, i, omega_ii
                )));
            }
            Ok(omega_ii.max(MIN_OMEGA))
        })
        .collect()
}

fn compute_view_contributions(
    views: &[View],
    tickers: &[String],
    omega: &[Decimal],
    prior: &[Decimal],
    posterior: &[Decimal],
) -> Vec<ViewContribution> {
    let idx = |t: &str| tickers.iter().position(|x| x == t).unwrap_or(0);
    views
        .iter()
        .enumerate()
        .map(|(i, view)| {
            let (desc, impact) = match view {
                View::Absolute {
                    ticker,
                    expected_return,
                } => {
                    let j = idx(ticker);
                    (
                        format!("{} absolute return = {:.4}", ticker, expected_return),
                        posterior[j] - prior[j],
                    )
                }
                View::Relative {
                    long,
                    short,
                    outperformance,
                } => {
                    let (l, s) = (idx(long), idx(short));
                    (
                        format!("{} outperforms {} by {:.4}", long, short, outperformance),
                        (posterior[l] - prior[l]) - (posterior[s] - prior[s]),
                    )
                }
            };
            ViewContribution {
                view_description: desc,
                impact_on_return: impact,
                omega_ii: omega[i],
            }
        })
        .collect()
}

/// Average off-diagonal pairs to remove rounding asymmetry.
fn symmetrize(m: &mut [Vec<Decimal>]) {
    let n = m.len();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = (m[i][j] + m[j][i]) / dec!(2);
            m[i][j] = avg;
            m[j][i] = avg;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
