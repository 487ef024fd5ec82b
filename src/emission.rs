//! Per-state emission distributions.
//!
//! The decoder only ever asks one question of an emission model: given state $i$ and
//! observation $y$, what is $\ln p(y | X=i)$? [`EmissionModel`] is that question.
//! [`Emission`] answers it for the three supported families:
//!
//! * [`Discrete`]: a categorical distribution over symbols $0, \ldots, K-1$
//! * [`Gaussian`]: a multivariate normal distribution
//! * [`GaussianMixture`]: a weighted sum of multivariate normal distributions
//!
//! Any slice of [`Density`] values is also an [`EmissionModel`], with one density per state.
use crate::error::{HmmError, Result};
use crate::ndarray_utils::*;
use crate::TOLERANCE;
use ndarray::array;
use ndarray::prelude::*;
#[cfg(feature = "serde-1")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::f64::consts::PI;

/// The distribution of observations for a single hidden state.
pub trait Density {
    /// $D$, the length of each observation vector
    fn dimensionality(&self) -> usize;

    /// $\ln p(y)$. Returns $-∞$ where the density is zero.
    fn log_density(&self, observation: ArrayView1<f64>) -> f64;
}

/// The distribution of observations for every hidden state of an HMM.
///
/// Implementations must be pure: the same `(state, observation)` always yields the same
/// value, and well-formed input never panics.
pub trait EmissionModel: Send + Sync {
    /// $N$, the number of states
    fn n_states(&self) -> usize;

    /// $D$, the length of each observation vector
    fn dimensionality(&self) -> usize;

    /// $\ln p(y | X=i)$ where `state` is $i$ and `observation` is $y$
    fn log_density(&self, state: usize, observation: ArrayView1<f64>) -> f64;
}

impl<D> EmissionModel for [D]
where
    D: Density + Send + Sync,
{
    fn n_states(&self) -> usize {
        self.len()
    }

    fn dimensionality(&self) -> usize {
        self.first().map_or(0, Density::dimensionality)
    }

    fn log_density(&self, state: usize, observation: ArrayView1<f64>) -> f64 {
        self[state].log_density(observation)
    }
}

/// Emission distributions for each state of an HMM, all from the same family.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-1",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum Emission {
    Discrete(Vec<Discrete>),
    Gaussian(Vec<Gaussian>),
    Mixture(Vec<GaussianMixture>),
}

impl Emission {
    /// Build discrete emissions from an $N × K$ matrix where element $(i, k)$ is the
    /// probability that state $i$ emits symbol $k$.
    pub fn discrete(b: Array2<f64>) -> Result<Self> {
        b.outer_iter()
            .enumerate()
            .map(|(i, row)| Discrete::labeled(row.to_owned(), &format!("row {} of B", i)))
            .collect::<Result<Vec<_>>>()
            .map(Emission::Discrete)
    }

    /// Check that there is at least one state and that every state emits observations of the
    /// same dimensionality.
    pub(crate) fn check_consistent(&self) -> Result<()> {
        match self {
            Emission::Discrete(states) => check_dimensionality(states),
            Emission::Gaussian(states) => check_dimensionality(states),
            Emission::Mixture(states) => check_dimensionality(states),
        }
    }
}

fn check_dimensionality<D: Density>(states: &[D]) -> Result<()> {
    let d = match states.first() {
        Some(first) => first.dimensionality(),
        None => {
            return Err(HmmError::InvalidModel(
                "emission has no states".to_string(),
            ))
        }
    };
    for (i, state) in states.iter().enumerate() {
        if state.dimensionality() != d {
            return Err(HmmError::InvalidModel(format!(
                "emission for state {} has dimensionality {} but state 0 has {}",
                i,
                state.dimensionality(),
                d
            )));
        }
    }
    Ok(())
}

impl EmissionModel for Emission {
    fn n_states(&self) -> usize {
        match self {
            Emission::Discrete(states) => states.n_states(),
            Emission::Gaussian(states) => states.n_states(),
            Emission::Mixture(states) => states.n_states(),
        }
    }

    fn dimensionality(&self) -> usize {
        match self {
            Emission::Discrete(states) => states.dimensionality(),
            Emission::Gaussian(states) => states.dimensionality(),
            Emission::Mixture(states) => states.dimensionality(),
        }
    }

    fn log_density(&self, state: usize, observation: ArrayView1<f64>) -> f64 {
        match self {
            Emission::Discrete(states) => states[state].log_density(observation),
            Emission::Gaussian(states) => states[state].log_density(observation),
            Emission::Mixture(states) => states[state].log_density(observation),
        }
    }
}

/// A categorical distribution over the symbols $0, \ldots, K-1$.
///
/// Observations are one-dimensional. An observation that is not one of the symbols (negative,
/// fractional, or $\ge K$) has zero probability.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-1",
    derive(Serialize, Deserialize),
    serde(try_from = "DiscreteParameters", into = "DiscreteParameters")
)]
pub struct Discrete {
    log_probs: Array1<f64>,
}

impl Discrete {
    /// `probabilities[k]` is the probability of emitting symbol $k$.
    pub fn new(probabilities: Array1<f64>) -> Result<Self> {
        Self::labeled(probabilities, "discrete emission")
    }

    fn labeled(probabilities: Array1<f64>, label: &str) -> Result<Self> {
        let log_probs = ln(&probabilities);
        check_log_distribution(&log_probs, TOLERANCE, label).map_err(HmmError::InvalidModel)?;
        Ok(Self { log_probs })
    }

    /// $K$, the number of possible symbols
    pub fn k(&self) -> usize {
        self.log_probs.len()
    }

    pub fn log_probs(&self) -> ArrayView1<f64> {
        self.log_probs.view()
    }
}

impl Density for Discrete {
    fn dimensionality(&self) -> usize {
        1
    }

    fn log_density(&self, observation: ArrayView1<f64>) -> f64 {
        match observation.get(0) {
            Some(&y) if y >= 0.0 && y.fract() == 0.0 && y < self.k() as f64 => {
                self.log_probs[y as usize]
            }
            _ => f64::NEG_INFINITY,
        }
    }
}

/// A multivariate normal distribution $\mathcal{N}(μ, Σ)$.
///
/// $$
/// \ln p(y) = -\frac{1}{2}\left(D \ln 2π + \ln |Σ| + (y - μ)^T Σ^{-1} (y - μ)\right)
/// $$
///
/// The Cholesky factor $L$ of $Σ$ is computed once, on construction. The quadratic form is then
/// $\lVert z \rVert^2$ where $Lz = y - μ$ is solved by forward substitution.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-1",
    derive(Serialize, Deserialize),
    serde(try_from = "GaussianParameters", into = "GaussianParameters")
)]
pub struct Gaussian {
    mean: Array1<f64>,
    covariance: Array2<f64>,
    cholesky: Array2<f64>,
    // -(D ln 2π + ln |Σ|) / 2
    log_normalizer: f64,
}

impl Gaussian {
    /// Fails if the covariance is not a symmetric positive definite $D × D$ matrix.
    pub fn new(mean: Array1<f64>, covariance: Array2<f64>) -> Result<Self> {
        let d = mean.len();
        if d == 0 {
            return Err(HmmError::InvalidModel(
                "Gaussian mean must have a positive length".to_string(),
            ));
        }
        if covariance.dim() != (d, d) {
            return Err(HmmError::InvalidModel(format!(
                "Gaussian covariance has shape {:?} but the mean has length {}",
                covariance.shape(),
                d
            )));
        }
        if mean.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
            return Err(HmmError::InvalidModel(
                "Gaussian parameters must be finite".to_string(),
            ));
        }
        for i in 0..d {
            for j in 0..i {
                let (c_ij, c_ji) = (covariance[(i, j)], covariance[(j, i)]);
                if (c_ij - c_ji).abs() > TOLERANCE * c_ij.abs().max(1.0) {
                    return Err(HmmError::InvalidModel(format!(
                        "Gaussian covariance is not symmetric at ({}, {})",
                        i, j
                    )));
                }
            }
        }
        let cholesky = cholesky(&covariance).ok_or_else(|| {
            HmmError::InvalidModel("Gaussian covariance is not positive definite".to_string())
        })?;
        let log_det: f64 = 2.0 * cholesky.diag().iter().map(|l| l.ln()).sum::<f64>();
        let log_normalizer = -0.5 * (d as f64 * (2.0 * PI).ln() + log_det);

        Ok(Self {
            mean,
            covariance,
            cholesky,
            log_normalizer,
        })
    }

    /// A one-dimensional normal distribution
    pub fn univariate(mean: f64, variance: f64) -> Result<Self> {
        Self::new(array![mean], array![[variance]])
    }

    pub fn mean(&self) -> ArrayView1<f64> {
        self.mean.view()
    }

    pub fn covariance(&self) -> ArrayView2<f64> {
        self.covariance.view()
    }
}

impl Density for Gaussian {
    fn dimensionality(&self) -> usize {
        self.mean.len()
    }

    fn log_density(&self, observation: ArrayView1<f64>) -> f64 {
        let d = self.mean.len();
        let mut z = Array1::zeros(d);
        for i in 0..d {
            let mut acc = observation[i] - self.mean[i];
            for k in 0..i {
                acc -= self.cholesky[(i, k)] * z[k];
            }
            z[i] = acc / self.cholesky[(i, i)];
        }
        self.log_normalizer - 0.5 * z.dot(&z)
    }
}

/// Lower-triangular $L$ with $LL^T = A$, or `None` if $A$ is not positive definite. Only the
/// lower triangle of $A$ is read.
fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let d = a.rows();
    let mut l = Array2::zeros((d, d));
    for j in 0..d {
        let mut diag = a[(j, j)];
        for k in 0..j {
            diag -= l[(j, k)] * l[(j, k)];
        }
        if diag <= 0.0 || !diag.is_finite() {
            return None;
        }
        let l_jj = diag.sqrt();
        l[(j, j)] = l_jj;
        for i in (j + 1)..d {
            let mut acc = a[(i, j)];
            for k in 0..j {
                acc -= l[(i, k)] * l[(j, k)];
            }
            l[(i, j)] = acc / l_jj;
        }
    }
    Some(l)
}

/// A mixture $p(y) = \sum_c w_c \mathcal{N}(y; μ_c, Σ_c)$, evaluated as a log-sum-exp over
/// components so that distant observations do not underflow to zero.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-1",
    derive(Serialize, Deserialize),
    serde(try_from = "MixtureParameters", into = "MixtureParameters")
)]
pub struct GaussianMixture {
    log_weights: Array1<f64>,
    components: Vec<Gaussian>,
}

impl GaussianMixture {
    /// `weights[c]` is the probability of component `c`. All components must share one
    /// dimensionality.
    pub fn new(weights: Array1<f64>, components: Vec<Gaussian>) -> Result<Self> {
        if weights.len() != components.len() {
            return Err(HmmError::InvalidModel(format!(
                "mixture has {} weights but {} components",
                weights.len(),
                components.len()
            )));
        }
        let log_weights = ln(&weights);
        check_log_distribution(&log_weights, TOLERANCE, "mixture weights")
            .map_err(HmmError::InvalidModel)?;
        check_dimensionality(&components)?;
        Ok(Self {
            log_weights,
            components,
        })
    }

    pub fn log_weights(&self) -> ArrayView1<f64> {
        self.log_weights.view()
    }

    pub fn components(&self) -> &[Gaussian] {
        &self.components
    }
}

impl Density for GaussianMixture {
    fn dimensionality(&self) -> usize {
        self.components[0].dimensionality()
    }

    fn log_density(&self, observation: ArrayView1<f64>) -> f64 {
        let terms: Array1<f64> = self
            .log_weights
            .iter()
            .zip(&self.components)
            .map(|(&log_w, component)| {
                if log_w == f64::NEG_INFINITY {
                    f64::NEG_INFINITY
                } else {
                    log_w + component.log_density(observation)
                }
            })
            .collect();
        terms.log_sum_exp()
    }
}

/// The serialized form of [`Discrete`], in probability space
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
pub struct DiscreteParameters {
    pub probabilities: Vec<f64>,
}

impl TryFrom<DiscreteParameters> for Discrete {
    type Error = HmmError;

    fn try_from(parameters: DiscreteParameters) -> Result<Self> {
        Discrete::new(Array1::from(parameters.probabilities))
    }
}

impl From<Discrete> for DiscreteParameters {
    fn from(discrete: Discrete) -> Self {
        Self {
            probabilities: discrete.log_probs.mapv(f64::exp).to_vec(),
        }
    }
}

/// The serialized form of [`Gaussian`]; the covariance is a list of rows
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
pub struct GaussianParameters {
    pub mean: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
}

impl TryFrom<GaussianParameters> for Gaussian {
    type Error = HmmError;

    fn try_from(parameters: GaussianParameters) -> Result<Self> {
        let covariance = array2_from_rows(parameters.covariance)
            .map_err(|e| HmmError::InvalidModel(format!("Gaussian covariance {}", e)))?;
        Gaussian::new(Array1::from(parameters.mean), covariance)
    }
}

impl From<Gaussian> for GaussianParameters {
    fn from(gaussian: Gaussian) -> Self {
        Self {
            mean: gaussian.mean.to_vec(),
            covariance: rows_from_array2(&gaussian.covariance),
        }
    }
}

/// The serialized form of [`GaussianMixture`], with weights in probability space
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
pub struct MixtureParameters {
    pub weights: Vec<f64>,
    pub components: Vec<Gaussian>,
}

impl TryFrom<MixtureParameters> for GaussianMixture {
    type Error = HmmError;

    fn try_from(parameters: MixtureParameters) -> Result<Self> {
        GaussianMixture::new(Array1::from(parameters.weights), parameters.components)
    }
}

impl From<GaussianMixture> for MixtureParameters {
    fn from(mixture: GaussianMixture) -> Self {
        Self {
            weights: mixture.log_weights.mapv(f64::exp).to_vec(),
            components: mixture.components,
        }
    }
}
