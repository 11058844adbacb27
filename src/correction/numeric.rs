//! Small numeric kernels used by the refractive-index inversion.

use crate::error::{AppResult, DaqError};

/// Polynomial in the standardized variable `(x - shift) / scale`.
#[derive(Clone, Debug, PartialEq)]
pub struct Polynomial {
    /// Highest power first.
    coefficients: Vec<f64>,
    shift: f64,
    scale: f64,
}

impl Polynomial {
    /// Value at `x` (Horner).
    pub fn eval(&self, x: f64) -> f64 {
        let u = (x - self.shift) / self.scale;
        self.coefficients.iter().fold(0.0, |acc, c| acc * u + c)
    }

    /// Degree of the fit.
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }
}

/// Least-squares polynomial fit of degree `degree`.
///
/// Abscissae are standardized before solving the normal equations, which
/// keeps clustered samples (e.g. indices between 1.42 and 1.64) well conditioned.
pub fn polyfit(x: &[f64], y: &[f64], degree: usize) -> AppResult<Polynomial> {
    let terms = degree + 1;
    if x.len() != y.len() || x.len() < terms {
        return Err(DaqError::Processing(format!(
            "polyfit of degree {} needs at least {} points, got {} x and {} y",
            degree,
            terms,
            x.len(),
            y.len()
        )));
    }
    let shift = x.iter().sum::<f64>() / x.len() as f64;
    let scale = x
        .iter()
        .map(|v| (v - shift).abs())
        .fold(0.0, f64::max);
    let scale = if scale > 0.0 { scale } else { 1.0 };

    // Normal equations A^T A c = A^T y, columns ordered u^0 .. u^degree
    let mut matrix = vec![vec![0.0; terms + 1]; terms];
    for (&xi, &yi) in x.iter().zip(y) {
        let u = (xi - shift) / scale;
        let powers: Vec<f64> = (0..terms).map(|p| u.powi(p as i32)).collect();
        for r in 0..terms {
            for c in 0..terms {
                matrix[r][c] += powers[r] * powers[c];
            }
            matrix[r][terms] += powers[r] * yi;
        }
    }

    // Gauss-Jordan with partial pivoting
    for col in 0..terms {
        let pivot = (col..terms)
            .max_by(|&a, &b| matrix[a][col].abs().total_cmp(&matrix[b][col].abs()))
            .unwrap_or(col);
        if matrix[pivot][col].abs() < 1e-12 {
            return Err(DaqError::Processing("polyfit system is singular".to_string()));
        }
        matrix.swap(col, pivot);
        let lead = matrix[col][col];
        for value in matrix[col].iter_mut() {
            *value /= lead;
        }
        for row in 0..terms {
            if row != col {
                let factor = matrix[row][col];
                for c in col..=terms {
                    matrix[row][c] -= factor * matrix[col][c];
                }
            }
        }
    }

    Ok(Polynomial {
        coefficients: (0..terms).rev().map(|p| matrix[p][terms]).collect(),
        shift,
        scale,
    })
}

/// Centered moving average with `reflect` boundaries (`d c b a | a b c d | d c b a`).
///
/// For an even `size` the window reaches one sample further to the left.
pub fn uniform_filter1d(input: &[f64], size: usize) -> Vec<f64> {
    let n = input.len();
    if n == 0 || size <= 1 {
        return input.to_vec();
    }
    let reflect = |j: isize| -> usize {
        let period = 2 * n as isize;
        let j = j.rem_euclid(period);
        if j < n as isize {
            j as usize
        } else {
            (period - 1 - j) as usize
        }
    };
    let left = (size / 2) as isize;
    (0..n as isize)
        .map(|i| {
            let start = i - left;
            (start..start + size as isize).map(|j| input[reflect(j)]).sum::<f64>() / size as f64
        })
        .collect()
}

/// Piecewise-linear interpolation with linear extrapolation past both ends.
#[derive(Clone, Debug)]
pub struct LinearInterpolator {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl LinearInterpolator {
    /// Build from samples in any order; they are sorted by `x` (stable).
    pub fn new(x: &[f64], y: &[f64]) -> AppResult<Self> {
        if x.len() != y.len() || x.len() < 2 {
            return Err(DaqError::Processing(format!(
                "interpolation needs at least two paired samples, got {} x and {} y",
                x.len(),
                y.len()
            )));
        }
        let mut pairs: Vec<(f64, f64)> = x.iter().copied().zip(y.iter().copied()).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (x, y) = pairs.into_iter().unzip();
        Ok(Self { x, y })
    }

    /// Interpolated value at `t`; linear extrapolation past either end.
    pub fn eval(&self, t: f64) -> f64 {
        let n = self.x.len();
        let hi = self.x.partition_point(|&v| v < t).clamp(1, n - 1);
        let lo = hi - 1;
        let dx = self.x[hi] - self.x[lo];
        if dx == 0.0 {
            return self.y[lo];
        }
        self.y[lo] + (t - self.x[lo]) * (self.y[hi] - self.y[lo]) / dx
    }
}
