use itertools::Itertools;
use ndarray::prelude::*;
use ndarray::*;
use num_traits::{Float, Zero};

pub trait Array1Float<T: Float> {
    /// Along a 1D array, return the maximum float value and its index
    ///
    /// If there are multiple equal maximum values, the one with the lowest index is returned.
    ///
    /// The behavior of this function is unspecified if the array contains NaNs.
    fn maxf(&self) -> Option<(usize, T)>;

    /// $\ln \sum_i e^{x_i}$, computed without leaving log space. An empty array, or one where
    /// every entry is $-∞$, yields $-∞$.
    fn log_sum_exp(&self) -> T;
}

impl<T, S> Array1Float<T> for ArrayBase<S, Ix1>
where
    T: Float,
    S: Data<Elem = T>,
{
    fn maxf(&self) -> Option<(usize, T)> {
        self.iter()
            .enumerate()
            .fold1(|(i0, v0), (i1, v1)| if v1 > v0 { (i1, v1) } else { (i0, v0) })
            .map(|(i, &v)| (i, v))
    }

    fn log_sum_exp(&self) -> T {
        let max = match self.maxf() {
            Some((_, max)) => max,
            None => return T::neg_infinity(),
        };
        if max.is_infinite() {
            // Either everything is impossible or something is certain
            return max;
        }
        let sum = self
            .iter()
            .fold(Zero::zero(), |acc: T, &x| acc + (x - max).exp());
        max + sum.ln()
    }
}

/// Check that `log_probs` are the logarithms of a probability distribution: no NaNs, no
/// probability above one, and probabilities summing to one within `tolerance`.
///
/// On failure, returns a description of what is wrong, prefixed with `label`.
pub fn check_log_distribution<S>(
    log_probs: &ArrayBase<S, Ix1>,
    tolerance: f64,
    label: &str,
) -> Result<(), String>
where
    S: Data<Elem = f64>,
{
    if log_probs.is_empty() {
        return Err(format!("{} is empty", label));
    }
    if let Some((i, v)) = log_probs
        .iter()
        .enumerate()
        .find(|(_, v)| v.is_nan() || **v > tolerance)
    {
        return Err(format!(
            "{} has an invalid log-probability {} at index {}",
            label, v, i
        ));
    }
    let sum = log_probs.log_sum_exp().exp();
    if (sum - 1.0).abs() > tolerance {
        return Err(format!("{} sums to {} (expected 1)", label, sum));
    }
    Ok(())
}

/// Element-wise natural log of a probability array. Negative entries become NaN, which
/// `check_log_distribution` rejects.
pub fn ln<S, D>(probs: &ArrayBase<S, D>) -> Array<f64, D>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    probs.mapv(f64::ln)
}

/// Stack equal-length rows into a matrix. No rows gives a $0 × 0$ matrix.
pub fn array2_from_rows(rows: Vec<Vec<f64>>) -> Result<Array2<f64>, String> {
    let n_cols = rows.first().map_or(0, Vec::len);
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != n_cols) {
        return Err(format!(
            "is not rectangular: row {} has {} values but row 0 has {}",
            i,
            row.len(),
            n_cols
        ));
    }
    let n_rows = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n_rows, n_cols), flat).map_err(|e| e.to_string())
}

pub fn rows_from_array2<S>(a: &ArrayBase<S, Ix2>) -> Vec<Vec<f64>>
where
    S: Data<Elem = f64>,
{
    a.outer_iter().map(|row| row.to_vec()).collect()
}
