use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::FolioError;
use crate::math::{
    mat_inverse, mat_vec_multiply, portfolio_std, sub_matrix, validate_covariance_matrix, vec_dot,
};
use crate::types::*;
use crate::FolioResult;

/// Weights below this magnitude are zeroed by `clean_weights`.
pub const DEFAULT_WEIGHT_CUTOFF: Decimal = dec!(0.0001);
/// Decimal places kept by `clean_weights`.
pub const DEFAULT_WEIGHT_DECIMALS: u32 = 5;

const ACTIVE_SET_MAX_ITERATIONS: u32 = 500;
const GRADIENT_ITERATIONS: u32 = 2000;
const TOLERANCE: Decimal = dec!(0.000000001);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Input to maximum-Sharpe mean-variance optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxSharpeInput {
    /// Ticker identifiers.
    pub tickers: Vec<String>,
    /// Annualized expected returns per ticker.
    pub expected_returns: Vec<Rate>,
    /// N x N annualized covariance matrix.
    pub covariance_matrix: Vec<Vec<Decimal>>,
    /// Annual risk-free rate.
    pub risk_free_rate: Rate,
    /// Per-ticker lower weight bound (default 0, long only).
    #[serde(default)]
    pub min_weight: Option<Weight>,
    /// Per-ticker upper weight bound (default 1).
    #[serde(default)]
    pub max_weight: Option<Weight>,
    /// Cleaning cutoff (default 1e-4).
    #[serde(default)]
    pub weight_cutoff: Option<Decimal>,
    /// Cleaning rounding precision (default 5).
    #[serde(default)]
    pub weight_decimals: Option<u32>,
}

/// Which routine produced the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Solver {
    /// Closed-form tangency portfolio, bounds not binding.
    Analytic,
    /// Exact long-only solution of the convex reformulation.
    ActiveSet,
    /// Projected gradient ascent on the Sharpe ratio.
    ProjectedGradient,
}

/// Output of maximum-Sharpe optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxSharpeOutput {
    /// Cleaned weights in input ticker order.
    pub weights: Vec<TickerWeight>,
    /// Unrounded optimizer weights.
    pub raw_weights: Vec<Weight>,
    /// Performance of the cleaned weights.
    pub performance: PortfolioPerformance,
    /// Number of tickers with a non-zero cleaned weight.
    pub holdings: usize,
    pub solver: Solver,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Find the portfolio with the highest Sharpe ratio.
///
/// Long-only problems with an upper bound of 1 are solved exactly through
/// `min y'Sy s.t. (mu - rf)'y = 1, y >= 0` and `w = y / sum(y)`. Other
/// bounds fall back to projected gradient ascent.
pub fn optimize_max_sharpe(
    input: &MaxSharpeInput,
) -> FolioResult<ComputationOutput<MaxSharpeOutput>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    let n = input.tickers.len();
    validate_input(input, n)?;

    let bounds = WeightBounds {
        min: input.min_weight.unwrap_or(Decimal::ZERO),
        max: input.max_weight.unwrap_or(Decimal::ONE),
    };
    bounds.validate(n)?;

    let mu = &input.expected_returns;
    let sigma = &input.covariance_matrix;
    let rf = input.risk_free_rate;

    let (raw_weights, solver) = max_sharpe_weights(mu, sigma, rf, &bounds)?;

    let cutoff = input.weight_cutoff.unwrap_or(DEFAULT_WEIGHT_CUTOFF);
    let decimals = input.weight_decimals.unwrap_or(DEFAULT_WEIGHT_DECIMALS);
    let cleaned = clean_weights(&raw_weights, cutoff, decimals);
    let performance = portfolio_performance(&cleaned, mu, sigma, rf)?;

    let weights: Vec<TickerWeight> = input
        .tickers
        .iter()
        .zip(cleaned.iter())
        .map(|(t, w)| TickerWeight::new(t.clone(), *w))
        .collect();
    let holdings = cleaned.iter().filter(|w| !w.is_zero()).count();

    for tw in &weights {
        if tw.weight > dec!(0.40) {
            warnings.push(format!(
                "Concentrated position: {} has weight {:.4}",
                tw.ticker, tw.weight
            ));
        }
    }
    if holdings == 1 && n > 1 {
        warnings.push("Optimizer allocated everything to a single ticker".into());
    }
    let cleaned_total: Decimal = cleaned.iter().copied().sum();
    if (cleaned_total - Decimal::ONE).abs() > dec!(0.001) {
        warnings.push(format!(
            "Cleaned weights sum to {:.5}, not 1",
            cleaned_total
        ));
    }

    let output = MaxSharpeOutput {
        weights,
        raw_weights,
        performance,
        holdings,
        solver,
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Maximum Sharpe ratio mean-variance optimization",
        &serde_json::json!({
            "n_tickers": n,
            "risk_free_rate": rf.to_string(),
            "min_weight": bounds.min.to_string(),
            "max_weight": bounds.max.to_string(),
            "weight_cutoff": cutoff.to_string(),
            "weight_decimals": decimals,
        }),
        warnings,
        elapsed,
        output,
    ))
}

/// Zero out tiny weights and round the rest.
pub fn clean_weights(weights: &[Weight], cutoff: Decimal, decimals: u32) -> Vec<Weight> {
    weights
        .iter()
        .map(|w| {
            if w.abs() < cutoff {
                Decimal::ZERO
            } else {
                w.round_dp(decimals).normalize()
            }
        })
        .collect()
}

/// Expected return, volatility and Sharpe ratio of a weight vector.
pub fn portfolio_performance(
    weights: &[Weight],
    expected_returns: &[Rate],
    covariance_matrix: &[Vec<Decimal>],
    risk_free_rate: Rate,
) -> FolioResult<PortfolioPerformance> {
    let n = weights.len();
    if expected_returns.len() != n {
        return Err(FolioError::InvalidInput {
            field: "expected_returns".into(),
            reason: format!("Expected {} returns but got {}", n, expected_returns.len()),
        });
    }
    validate_covariance_matrix(covariance_matrix, n)?;

    let expected_return = vec_dot(weights, expected_returns);
    let volatility = portfolio_std(weights, covariance_matrix);
    Ok(PortfolioPerformance {
        expected_return,
        volatility,
        sharpe_ratio: compute_sharpe(expected_return, risk_free_rate, volatility),
    })
}

// ---------------------------------------------------------------------------
// Solver
// ---------------------------------------------------------------------------

/// Per-ticker weight bounds shared by every asset.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WeightBounds {
    pub min: Decimal,
    pub max: Decimal,
}

impl WeightBounds {
    pub(crate) fn long_only() -> Self {
        Self {
            min: Decimal::ZERO,
            max: Decimal::ONE,
        }
    }

    fn validate(&self, n: usize) -> FolioResult<()> {
        if self.min > self.max {
            return Err(FolioError::InvalidInput {
                field: "min_weight".into(),
                reason: format!("min_weight {} exceeds max_weight {}", self.min, self.max),
            });
        }
        let count = Decimal::from(n as i64);
        if self.min * count > Decimal::ONE || self.max * count < Decimal::ONE {
            return Err(FolioError::FinancialImpossibility(format!(
                "Bounds [{}, {}] cannot sum to 1 across {} tickers",
                self.min, self.max, n
            )));
        }
        Ok(())
    }

    fn is_long_only(&self) -> bool {
        self.min.is_zero() && self.max >= Decimal::ONE
    }

    fn contains(&self, w: &[Decimal]) -> bool {
        w.iter()
            .all(|wi| *wi >= self.min - dec!(0.000001) && *wi <= self.max + dec!(0.000001))
    }
}

/// Max-Sharpe weights and the routine that produced them.
pub(crate) fn max_sharpe_weights(
    mu: &[Decimal],
    sigma: &[Vec<Decimal>],
    rf: Decimal,
    bounds: &WeightBounds,
) -> FolioResult<(Vec<Decimal>, Solver)> {
    let excess: Vec<Decimal> = mu.iter().map(|r| *r - rf).collect();
    if excess.iter().all(|e| *e <= Decimal::ZERO) {
        return Err(FolioError::FinancialImpossibility(
            "At least one ticker must have an expected return above the risk-free rate".into(),
        ));
    }

    if let Some(w) = analytic_tangency(sigma, &excess)? {
        if bounds.contains(&w) {
            return Ok((w, Solver::Analytic));
        }
    }

    if bounds.is_long_only() {
        let w = active_set_long_only(sigma, &excess)?;
        return Ok((w, Solver::ActiveSet));
    }

    let start = if bounds.min >= Decimal::ZERO {
        // The long-only optimum is usually close; start from it clipped.
        let mut w = active_set_long_only(sigma, &excess)?;
        project_onto_bounds(&mut w, bounds);
        w
    } else {
        let mut w = equal_weights(mu.len());
        project_onto_bounds(&mut w, bounds);
        w
    };
    let w = projected_gradient_max_sharpe(sigma, mu, rf, bounds, start);
    Ok((w, Solver::ProjectedGradient))
}

/// Unconstrained tangency: w = S^-1 (mu - rf) / 1'S^-1 (mu - rf).
/// `None` when the normaliser vanishes or is negative.
fn analytic_tangency(
    sigma: &[Vec<Decimal>],
    excess: &[Decimal],
) -> FolioResult<Option<Vec<Decimal>>> {
    let sigma_inv = match mat_inverse(sigma) {
        Ok(inv) => inv,
        Err(FolioError::FinancialImpossibility(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let z = mat_vec_multiply(&sigma_inv, excess);
    let denom: Decimal = z.iter().copied().sum();
    if denom <= TOLERANCE {
        return Ok(None);
    }
    Ok(Some(z.iter().map(|v| *v / denom).collect()))
}

/// Primal active-set method for `min y'Sy s.t. a'y = 1, y >= 0`.
///
/// Starts at the vertex of the ticker with the largest excess return and
/// keeps `y` feasible throughout.
fn active_set_long_only(sigma: &[Vec<Decimal>], excess: &[Decimal]) -> FolioResult<Vec<Decimal>> {
    let n = excess.len();
    let best = (0..n)
        .max_by(|&i, &j| excess[i].cmp(&excess[j]))
        .ok_or_else(|| FolioError::InsufficientData("At least one ticker required".into()))?;

    let mut y = vec![Decimal::ZERO; n];
    y[best] = Decimal::ONE / excess[best];
    let mut free: Vec<usize> = vec![best];

    for _ in 0..ACTIVE_SET_MAX_ITERATIONS {
        let (target, lambda) = solve_on_free_set(sigma, excess, &free)?;

        let blocking = free
            .iter()
            .filter(|&&i| target[i] < Decimal::ZERO)
            .map(|&i| (i, y[i] / (y[i] - target[i])))
            .min_by(|a, b| a.1.cmp(&b.1));

        match blocking {
            Some((drop, alpha)) => {
                let alpha = alpha.max(Decimal::ZERO).min(Decimal::ONE);
                for &i in &free {
                    let yi = y[i];
                    y[i] = yi + alpha * (target[i] - yi);
                }
                y[drop] = Decimal::ZERO;
                free.retain(|&i| i != drop && y[i] > Decimal::ZERO);
                if free.is_empty() {
                    return Err(FolioError::ConvergenceFailure {
                        function: "active_set_long_only".into(),
                        iterations: ACTIVE_SET_MAX_ITERATIONS,
                    });
                }
            }
            None => {
                y = target;
                // Multipliers of the inactive bounds: nu = S y - lambda a
                let sigma_y = mat_vec_multiply(sigma, &y);
                let entering = (0..n)
                    .filter(|i| !free.contains(i))
                    .map(|i| (i, sigma_y[i] - lambda * excess[i]))
                    .filter(|(_, nu)| *nu < -TOLERANCE)
                    .min_by(|a, b| a.1.cmp(&b.1));
                match entering {
                    Some((i, _)) => free.push(i),
                    None => return Ok(normalize(&y)),
                }
            }
        }
    }

    Err(FolioError::ConvergenceFailure {
        function: "active_set_long_only".into(),
        iterations: ACTIVE_SET_MAX_ITERATIONS,
    })
}

/// Equality-constrained minimiser on the free set: y_F = lambda S_FF^-1 a_F,
/// lambda = 1 / a_F' S_FF^-1 a_F. Returns the full-length target and lambda.
fn solve_on_free_set(
    sigma: &[Vec<Decimal>],
    excess: &[Decimal],
    free: &[usize],
) -> FolioResult<(Vec<Decimal>, Decimal)> {
    let sigma_ff = sub_matrix(sigma, free);
    let a_f: Vec<Decimal> = free.iter().map(|&i| excess[i]).collect();
    let z = mat_vec_multiply(&mat_inverse(&sigma_ff)?, &a_f);
    let denom = vec_dot(&a_f, &z);
    if denom <= Decimal::ZERO {
        return Err(FolioError::FinancialImpossibility(
            "Covariance restricted to held tickers is not positive definite".into(),
        ));
    }
    let lambda = Decimal::ONE / denom;
    let mut target = vec![Decimal::ZERO; excess.len()];
    for (k, &i) in free.iter().enumerate() {
        target[i] = lambda * z[k];
    }
    Ok((target, lambda))
}

/// Gradient ascent on the Sharpe ratio with projection onto the bounded simplex.
fn projected_gradient_max_sharpe(
    sigma: &[Vec<Decimal>],
    mu: &[Decimal],
    rf: Decimal,
    bounds: &WeightBounds,
    start: Vec<Decimal>,
) -> Vec<Decimal> {
    let n = mu.len();
    let mut w = start;
    let mut step = dec!(0.01);
    let mut best_w = w.clone();
    let mut best_sharpe = Decimal::MIN;

    for _ in 0..GRADIENT_ITERATIONS {
        let port_ret = vec_dot(&w, mu);
        let port_risk = portfolio_std(&w, sigma);
        let sharpe = compute_sharpe(port_ret, rf, port_risk);

        if sharpe >= best_sharpe {
            best_sharpe = sharpe;
            best_w = w.clone();
        } else {
            step /= dec!(2);
            w = best_w.clone();
            if step < dec!(0.0000001) {
                break;
            }
            continue;
        }

        if port_risk.is_zero() {
            break;
        }

        // dS/dw_i = (mu_i - rf) / sigma_p - (ret - rf) (Sigma w)_i / sigma_p^3
        let sigma_w = mat_vec_multiply(sigma, &w);
        let excess = port_ret - rf;
        let risk_cubed = port_risk * port_risk * port_risk;
        let mut w_new: Vec<Decimal> = (0..n)
            .map(|i| {
                let grad = (mu[i] - rf) / port_risk - excess * sigma_w[i] / risk_cubed;
                w[i] + step * grad
            })
            .collect();
        project_onto_bounds(&mut w_new, bounds);
        w = w_new;
    }

    best_w
}

/// Euclidean projection onto `{w : sum w = 1, min <= w_i <= max}`.
///
/// Finds the shift `t` with `sum clamp(v_i - t) = 1` by bisection.
fn project_onto_bounds(w: &mut [Decimal], bounds: &WeightBounds) {
    let clamp = |v: Decimal| v.max(bounds.min).min(bounds.max);
    let total = |t: Decimal, w: &[Decimal]| -> Decimal { w.iter().map(|v| clamp(*v - t)).sum() };

    let lo_v = w.iter().copied().min().unwrap_or(Decimal::ZERO);
    let hi_v = w.iter().copied().max().unwrap_or(Decimal::ZERO);
    let mut lo = lo_v - bounds.max - Decimal::ONE;
    let mut hi = hi_v - bounds.min + Decimal::ONE;

    for _ in 0..100 {
        let mid = (lo + hi) / dec!(2);
        if total(mid, w) > Decimal::ONE {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < TOLERANCE {
            break;
        }
    }
    let t = (lo + hi) / dec!(2);
    for v in w.iter_mut() {
        *v = clamp(*v - t);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_input(input: &MaxSharpeInput, n: usize) -> FolioResult<()> {
    if n == 0 {
        return Err(FolioError::InsufficientData(
            "At least one ticker required".into(),
        ));
    }
    if input.expected_returns.len() != n {
        return Err(FolioError::InvalidInput {
            field: "expected_returns".into(),
            reason: format!(
                "Expected {} returns but got {}",
                n,
                input.expected_returns.len()
            ),
        });
    }
    validate_covariance_matrix(&input.covariance_matrix, n)
}

/// Sharpe ratio with division-by-zero guard.
pub(crate) fn compute_sharpe(ret: Decimal, rf: Decimal, risk: Decimal) -> Decimal {
    if risk.is_zero() {
        Decimal::ZERO
    } else {
        (ret - rf) / risk
    }
}

fn normalize(y: &[Decimal]) -> Vec<Decimal> {
    let total: Decimal = y.iter().copied().sum();
    if total.is_zero() {
        return y.to_vec();
    }
    y.iter().map(|v| *v / total).collect()
}

fn equal_weights(n: usize) -> Vec<Decimal> {
    let w = Decimal::ONE / Decimal::from(n as i64);
    vec![w; n]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
