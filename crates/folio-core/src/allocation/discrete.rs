use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::FolioError;
use crate::types::*;
use crate::FolioResult;

pub const DEFAULT_PORTFOLIO_VALUE: Decimal = dec!(10000);

/// Unaffordable candidates skipped per share before the second round stops.
const MAX_SKIPPED_CANDIDATES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscreteAllocationInput {
    pub weights: Vec<TickerWeight>,
    pub latest_prices: BTreeMap<String, Money>,
    /// Cash to invest (default 10,000).
    #[serde(default)]
    pub total_portfolio_value: Option<Money>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareLot {
    pub ticker: String,
    pub shares: u64,
    pub price: Money,
    pub value: Money,
    pub target_weight: Weight,
    pub actual_weight: Weight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscreteAllocationOutput {
    /// Lots with at least one share, largest target weight first
    pub allocation: Vec<ShareLot>,
    pub leftover: Money,
    pub invested: Money,
}

/// Turn continuous weights into whole-share counts.
///
/// Round one buys `floor(w * V / price)` shares of every ticker. Round two
/// spends what is left one share at a time on the ticker furthest below
/// its target weight that is still affordable.
pub fn greedy_portfolio(
    input: &DiscreteAllocationInput,
) -> FolioResult<ComputationOutput<DiscreteAllocationOutput>> {
    let start = Instant::now();
    let mut warnings = Vec::new();

    let total = input.total_portfolio_value.unwrap_or(DEFAULT_PORTFOLIO_VALUE);
    if total <= Decimal::ZERO {
        return Err(FolioError::InvalidInput {
            field: "total_portfolio_value".into(),
            reason: format!("Must be positive, got {}", total),
        });
    }

    let mut targets: Vec<(String, Weight, Money)> = Vec::new();
    for tw in input.weights.iter().filter(|tw| tw.weight > Decimal::ZERO) {
        let price = *input
            .latest_prices
            .get(&tw.ticker)
            .ok_or_else(|| FolioError::InvalidInput {
                field: "latest_prices".into(),
                reason: format!("No latest price for {}", tw.ticker),
            })?;
        if price <= Decimal::ZERO {
            return Err(FolioError::InvalidInput {
                field: format!("latest_prices.{}", tw.ticker),
                reason: format!("Price must be positive, got {}", price),
            });
        }
        targets.push((tw.ticker.clone(), tw.weight, price));
    }
    if targets.is_empty() {
        return Err(FolioError::InsufficientData(
            "No positive weights to allocate".into(),
        ));
    }
    targets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let weight_total: Decimal = targets.iter().map(|t| t.1).sum();
    if (weight_total - Decimal::ONE).abs() > dec!(0.01) {
        warnings.push(format!(
            "Weights sum to {:.4}; allocating against that total",
            weight_total
        ));
    }

    // Round one
    let mut available = total;
    let mut shares: Vec<u64> = Vec::with_capacity(targets.len());
    for (_, weight, price) in &targets {
        let count = (*weight * total / *price).floor().to_u64().unwrap_or(0);
        available -= Decimal::from(count) * *price;
        shares.push(count);
    }

    // Round two
    let ideal: Vec<Decimal> = targets.iter().map(|t| t.1).collect();
    while available > Decimal::ZERO {
        let current = current_weights(&targets, &shares);
        let mut deficit: Vec<Decimal> = ideal
            .iter()
            .zip(current.iter())
            .map(|(i, c)| *i - *c)
            .collect();

        let mut idx = argmax(&deficit);
        let mut skipped = 0;
        while targets[idx].2 > available {
            deficit[idx] = Decimal::MIN;
            idx = argmax(&deficit);
            skipped += 1;
            if deficit[idx] <= Decimal::ZERO || skipped == MAX_SKIPPED_CANDIDATES {
                break;
            }
        }
        if deficit[idx] <= Decimal::ZERO
            || skipped == MAX_SKIPPED_CANDIDATES
            || targets[idx].2 > available
        {
            break;
        }
        shares[idx] += 1;
        available -= targets[idx].2;
    }

    let invested = total - available;
    let allocation: Vec<ShareLot> = targets
        .iter()
        .zip(shares.iter())
        .filter(|(_, n)| **n > 0)
        .map(|((ticker, weight, price), n)| {
            let value = Decimal::from(*n) * *price;
            ShareLot {
                ticker: ticker.clone(),
                shares: *n,
                price: *price,
                value,
                target_weight: *weight,
                actual_weight: if invested.is_zero() {
                    Decimal::ZERO
                } else {
                    value / invested
                },
            }
        })
        .collect();

    let unfunded: Vec<&str> = targets
        .iter()
        .zip(shares.iter())
        .filter(|(_, n)| **n == 0)
        .map(|((t, _, _), _)| t.as_str())
        .collect();
    if !unfunded.is_empty() {
        warnings.push(format!(
            "Could not afford a single share of: {}",
            unfunded.join(", ")
        ));
    }

    let output = DiscreteAllocationOutput {
        allocation,
        leftover: available,
        invested,
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Greedy discrete allocation",
        &serde_json::json!({
            "total_portfolio_value": total.to_string(),
            "n_targets": targets.len(),
        }),
        warnings,
        elapsed,
        output,
    ))
}

fn current_weights(targets: &[(String, Weight, Money)], shares: &[u64]) -> Vec<Decimal> {
    let values: Vec<Decimal> = targets
        .iter()
        .zip(shares.iter())
        .map(|(t, n)| Decimal::from(*n) * t.2)
        .collect();
    let held: Decimal = values.iter().copied().sum();
    if held.is_zero() {
        return vec![Decimal::ZERO; values.len()];
    }
    values.iter().map(|v| *v / held).collect()
}

/// First index of the largest value.
fn argmax(v: &[Decimal]) -> usize {
    let mut best = 0;
    for (i, x) in v.iter().enumerate() {
        if *x > v[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn input(
        weights: &[(&str, Decimal)],
        prices: &[(&str, Decimal)],
        total: Decimal,
    ) -> DiscreteAllocationInput {
        DiscreteAllocationInput {
            weights: weights
                .iter()
                .map(|(t, w)| TickerWeight::new(*t, *w))
                .collect(),
            latest_prices: prices.iter().map(|(t, p)| (t.to_string(), *p)).collect(),
            total_portfolio_value: Some(total),
        }
    }

    #[test]
    fn test_exact_split() {
        let inp = input(
            &[("A", dec!(0.5)), ("B", dec!(0.5))],
            &[("A", dec!(100)), ("B", dec!(50))],
            dec!(1000),
        );
        let out = greedy_portfolio(&inp).unwrap().result;
        assert_eq!(out.leftover, dec!(0));
        assert_eq!(out.allocation[0].shares, 5);
        assert_eq!(out.allocation[1].shares, 10);
    }

    #[test]
    fn test_second_round_spends_remainder() {
        // Round one: A floor(500/30)=16 -> 480, B floor(500/70)=7 -> 490, left 30
        let inp = input(
            &[("A", dec!(0.5)), ("B", dec!(0.5))],
            &[("A", dec!(30)), ("B", dec!(70))],
            dec!(1000),
        );
        let out = greedy_portfolio(&inp).unwrap().result;
        let a = out.allocation.iter().find(|l| l.ticker == "A").unwrap();
        assert_eq!(a.shares, 17);
        assert_eq!(out.leftover, dec!(0));
        assert_eq!(out.invested, dec!(1000));
    }

    #[test]
    fn test_second_round_stops_when_top_deficit_unaffordable() {
        // Round one: A 8 x 70 = 560, B 13 x 30 = 390, left 50. A is most
        // underweight but costs 70; B is overweight, so nothing more is bought.
        let inp = input(
            &[("A", dec!(0.6)), ("B", dec!(0.4))],
            &[("A", dec!(70)), ("B", dec!(30))],
            dec!(1000),
        );
        let out = greedy_portfolio(&inp).unwrap().result;
        assert_eq!(out.leftover, dec!(50));
        assert_eq!(out.invested + out.leftover, dec!(1000));
    }

    #[test]
    fn test_zero_weights_ignored_and_order_by_weight() {
        let inp = input(
            &[("SMALL", dec!(0.2)), ("ZERO", dec!(0)), ("BIG", dec!(0.8))],
            &[("SMALL", dec!(10)), ("BIG", dec!(10))],
            dec!(1000),
        );
        let out = greedy_portfolio(&inp).unwrap().result;
        assert_eq!(out.allocation.len(), 2);
        assert_eq!(out.allocation[0].ticker, "BIG");
    }

    #[test]
    fn test_unaffordable_ticker_warns() {
        let inp = input(
            &[("CHEAP", dec!(0.5)), ("PRICEY", dec!(0.5))],
            &[("CHEAP", dec!(10)), ("PRICEY", dec!(5000))],
            dec!(1000),
        );
        let out = greedy_portfolio(&inp).unwrap();
        assert!(out.warnings.iter().any(|w| w.contains("PRICEY")));
        assert!(out.result.leftover < dec!(5000));
        assert!(out.result.leftover >= Decimal::ZERO);
    }

    #[test]
    fn test_missing_price_rejected() {
        let inp = input(&[("A", dec!(1))], &[], dec!(1000));
        assert!(greedy_portfolio(&inp).is_err());
    }

    #[test]
    fn test_no_positive_weights_rejected() {
        let inp = input(&[("A", dec!(0))], &[("A", dec!(1))], dec!(1000));
        assert!(matches!(
            greedy_portfolio(&inp),
            Err(FolioError::InsufficientData(_))
        ));
    }
}
