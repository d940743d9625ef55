//! Dense decimal linear algebra shared by the estimators and optimizers.
//!
//! Matrices are row-major `Vec<Vec<Decimal>>`; callers validate shapes
//! before handing data in.

use rust_decimal::Decimal;
use rust_decimal::MathematicalOps;
use rust_decimal_macros::dec;

use crate::error::FolioError;
use crate::FolioResult;

/// Pivots smaller than this are treated as zero during inversion.
const SINGULAR_PIVOT: Decimal = dec!(0.000000000001);

/// Dot product of two vectors.
pub fn vec_dot(a: &[Decimal], b: &[Decimal]) -> Decimal {
    a.iter().zip(b.iter()).map(|(x, y)| *x * *y).sum()
}

/// Matrix-vector multiplication: result_i = sum_j mat[i][j] * v[j].
pub fn mat_vec_multiply(mat: &[Vec<Decimal>], v: &[Decimal]) -> Vec<Decimal> {
    mat.iter().map(|row| vec_dot(row, v)).collect()
}

/// Matrix-matrix multiplication: C = A * B.
#[allow(clippy::needless_range_loop)]
pub fn mat_multiply(a: &[Vec<Decimal>], b: &[Vec<Decimal>]) -> Vec<Vec<Decimal>> {
    let m = a.len();
    let p = if m > 0 { a[0].len() } else { 0 };
    let n_cols = if !b.is_empty() { b[0].len() } else { 0 };
    let mut c = vec![vec![Decimal::ZERO; n_cols]; m];
    for i in 0..m {
        for j in 0..n_cols {
            let mut sum = Decimal::ZERO;
            for k in 0..p {
                sum += a[i][k] * b[k][j];
            }
            c[i][j] = sum;
        }
    }
    c
}

/// Matrix transpose.
pub fn mat_transpose(mat: &[Vec<Decimal>]) -> Vec<Vec<Decimal>> {
    if mat.is_empty() {
        return Vec::new();
    }
    let m = mat.len();
    let n = mat[0].len();
    let mut t = vec![vec![Decimal::ZERO; m]; n];
    for (i, row) in mat.iter().enumerate() {
        for (j, v) in row.iter().enumerate().take(n) {
            t[j][i] = *v;
        }
    }
    t
}

/// Element-wise matrix addition: C = A + B.
pub fn mat_add(a: &[Vec<Decimal>], b: &[Vec<Decimal>]) -> Vec<Vec<Decimal>> {
    a.iter()
        .zip(b.iter())
        .map(|(row_a, row_b)| {
            row_a
                .iter()
                .zip(row_b.iter())
                .map(|(x, y)| *x + *y)
                .collect()
        })
        .collect()
}

/// Scale every element of a matrix by a scalar.
pub fn mat_scale(mat: &[Vec<Decimal>], s: Decimal) -> Vec<Vec<Decimal>> {
    mat.iter()
        .map(|row| row.iter().map(|v| *v * s).collect())
        .collect()
}

/// Principal sub-matrix on the given row/column indices.
pub fn sub_matrix(mat: &[Vec<Decimal>], idx: &[usize]) -> Vec<Vec<Decimal>> {
    idx.iter()
        .map(|&i| idx.iter().map(|&j| mat[i][j]).collect())
        .collect()
}

/// Matrix inverse via Gauss-Jordan with partial pivoting.
#[allow(clippy::needless_range_loop)]
pub fn mat_inverse(mat: &[Vec<Decimal>]) -> FolioResult<Vec<Vec<Decimal>>> {
    let n = mat.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut aug: Vec<Vec<Decimal>> = Vec::with_capacity(n);
    for i in 0..n {
        let mut row = Vec::with_capacity(2 * n);
        row.extend_from_slice(&mat[i]);
        for j in 0..n {
            row.push(if i == j { Decimal::ONE } else { Decimal::ZERO });
        }
        aug.push(row);
    }

    for col in 0..n {
        let mut max_row = col;
        let mut max_val = aug[col][col].abs();
        for row in (col + 1)..n {
            let val = aug[row][col].abs();
            if val > max_val {
                max_val = val;
                max_row = row;
            }
        }

        if max_val < SINGULAR_PIVOT {
            return Err(FolioError::FinancialImpossibility(
                "Singular matrix cannot be inverted".into(),
            ));
        }

        if max_row != col {
            aug.swap(col, max_row);
        }

        let pivot = aug[col][col];
        for cell in aug[col].iter_mut() {
            *cell /= pivot;
        }

        let pivot_row = aug[col].clone();
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = aug[row][col];
            if factor.is_zero() {
                continue;
            }
            for (cell, &pv) in aug[row].iter_mut().zip(pivot_row.iter()) {
                *cell -= factor * pv;
            }
        }
    }

    Ok(aug.iter().map(|row| row[n..].to_vec()).collect())
}

/// Non-negative square root; negative or zero input yields zero.
pub fn sqrt_decimal(val: Decimal) -> Decimal {
    if val <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    val.sqrt().unwrap_or(Decimal::ZERO)
}

/// Portfolio variance: w' * Sigma * w.
pub fn portfolio_variance(w: &[Decimal], sigma: &[Vec<Decimal>]) -> Decimal {
    vec_dot(w, &mat_vec_multiply(sigma, w))
}

/// Portfolio standard deviation: sqrt(w' * Sigma * w).
pub fn portfolio_std(w: &[Decimal], sigma: &[Vec<Decimal>]) -> Decimal {
    sqrt_decimal(portfolio_variance(w, sigma))
}

/// Check an N x N covariance matrix is square and symmetric.
#[allow(clippy::needless_range_loop)]
pub fn validate_covariance_matrix(cov: &[Vec<Decimal>], n: usize) -> FolioResult<()> {
    if cov.len() != n {
        return Err(FolioError::InvalidInput {
            field: "covariance_matrix".into(),
            reason: format!("Expected {}x{} matrix but got {} rows", n, n, cov.len()),
        });
    }
    for (i, row) in cov.iter().enumerate() {
        if row.len() != n {
            return Err(FolioError::InvalidInput {
                field: "covariance_matrix".into(),
                reason: format!("Row {} has {} columns, expected {}", i, row.len(), n),
            });
        }
    }
    let tolerance = dec!(0.0000001);
    for i in 0..n {
        if cov[i][i] < Decimal::ZERO {
            return Err(FolioError::InvalidInput {
                field: "covariance_matrix".into(),
                reason: format!("Negative variance on diagonal [{},{}]", i, i),
            });
        }
        for j in (i + 1)..n {
            if (cov[i][j] - cov[j][i]).abs() > tolerance {
                return Err(FolioError::InvalidInput {
                    field: "covariance_matrix".into(),
                    reason: format!(
                        "Not symmetric: [{},{}]={} != [{},{}]={}",
                        i, j, cov[i][j], j, i, cov[j][i]
                    ),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_matrix_inverse_round_trip() {
        let m = vec![vec![dec!(4), dec!(7)], vec![dec!(2), dec!(6)]];
        let inv = mat_inverse(&m).unwrap();
        let id = mat_multiply(&m, &inv);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { Decimal::ONE } else { Decimal::ZERO };
                assert!((id[i][j] - expected).abs() < dec!(0.0000001));
            }
        }
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let m = vec![vec![dec!(1), dec!(2)], vec![dec!(2), dec!(4)]];
        assert!(matches!(
            mat_inverse(&m),
            Err(FolioError::FinancialImpossibility(_))
        ));
    }

    #[test]
    fn test_transpose_and_sub_matrix() {
        let m = vec![
            vec![dec!(1), dec!(2), dec!(3)],
            vec![dec!(4), dec!(5), dec!(6)],
        ];
        let t = mat_transpose(&m);
        assert_eq!(t.len(), 3);
        assert_eq!(t[2][1], dec!(6));

        let sq = vec![
            vec![dec!(1), dec!(2), dec!(3)],
            vec![dec!(4), dec!(5), dec!(6)],
            vec![dec!(7), dec!(8), dec!(9)],
        ];
        let sub = sub_matrix(&sq, &[0, 2]);
        assert_eq!(sub, vec![vec![dec!(1), dec!(3)], vec![dec!(7), dec!(9)]]);
    }

    #[test]
    fn test_sqrt_decimal() {
        assert_eq!(sqrt_decimal(dec!(-1)), Decimal::ZERO);
        assert!((sqrt_decimal(dec!(0.04)) - dec!(0.2)).abs() < dec!(0.0000001));
        assert!((sqrt_decimal(dec!(0.00000001)) - dec!(0.0001)).abs() < dec!(0.0000001));
    }

    #[test]
    fn test_portfolio_std_two_assets() {
        // 50/50 in two uncorrelated assets with 20% vol each
        let sigma = vec![vec![dec!(0.04), dec!(0)], vec![dec!(0), dec!(0.04)]];
        let w = vec![dec!(0.5), dec!(0.5)];
        assert_eq!(portfolio_variance(&w, &sigma), dec!(0.02));
    }

    #[test]
    fn test_validate_covariance_asymmetric() {
        let cov = vec![vec![dec!(0.04), dec!(0.01)], vec![dec!(0.02), dec!(0.09)]];
        assert!(validate_covariance_matrix(&cov, 2).is_err());
    }

    #[test]
    fn test_validate_covariance_wrong_rows() {
        let cov = vec![vec![dec!(0.04), dec!(0.01)]];
        assert!(validate_covariance_matrix(&cov, 2).is_err());
    }
}
