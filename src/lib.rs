#![cfg_attr(feature = "benchmark", feature(test))]
//! This library finds the most likely sequence of hidden states of a trained, time-invariant
//! Hidden Markov Model, given a sequence of observations. This is the Viterbi algorithm, run in
//! log space so that long sequences do not underflow.
//!
//! Observations are real-valued vectors of a fixed dimensionality $D$. Each hidden state emits
//! them from its own distribution, which may be discrete, Gaussian, or a Gaussian mixture; see
//! the [`emission`](emission/index.html) module.
//!
//! See [`hmmv::HMM`](struct.HMM.html) for detailed documentation on how to work with this library.
//!
//! Below, two states emit observations near 0 and near 3 respectively:
//!
//! ```
//! use hmmv::{Emission, Gaussian, HMM};
//! use ndarray::array;
//!
//! fn main() -> hmmv::Result<()> {
//!     let hmm = HMM::from_probabilities(
//!         array![0.6, 0.4],
//!         array![[0.7, 0.3], [0.4, 0.6]],
//!         Emission::Gaussian(vec![
//!             Gaussian::univariate(0.0, 1.0)?,
//!             Gaussian::univariate(3.0, 1.0)?,
//!         ]),
//!     )?;
//!
//!     // One row per time step, one column per dimension
//!     let ys = array![[0.2], [2.9], [-0.1]];
//!     assert_eq!(array![0, 1, 0], hmm.most_likely_sequence(ys.view())?);
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! * `parallel`: within each time step, update the states on the rayon thread pool
//! * `serde-1`: serialize models and load them from JSON
//! * `cli`: build the `hmm_viterbi` binary
//! * `benchmark`: a small amount of benchmarking functionality (requires nightly)
//!
//! ## Notes
//!
//! Section 17.4.4 of *Machine Learning a Probabilistic Perspective* by Kevin Murphy, 2012
//! describes the algorithm, as does section 13.2.5 of *Pattern Recognition and Machine
//! Learning* by Christopher Bishop, 2016.
#[cfg(feature = "benchmark")]
extern crate test;

pub mod emission;
mod error;
pub mod io;
mod ndarray_utils;
pub mod viterbi;

pub use crate::emission::{Density, Discrete, Emission, EmissionModel, Gaussian, GaussianMixture};
pub use crate::error::{HmmError, Result};
pub use crate::viterbi::{LogObserver, NoopObserver, ViterbiObserver, ViterbiPath};

use self::ndarray_utils::*;
use itertools::Itertools;
use ndarray::prelude::*;
#[cfg(feature = "serde-1")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

pub(crate) const TOLERANCE: f64 = 1e-5; // Chosen completely arbitrarily

/// This struct represents a trained HMM, including values for each parameter.
///
/// # Math
///
/// The HMM explains a sequence of observations:
///
/// $$Y=(Y_0=y_0, Y_1=y_1, \ldots, Y_{T-1}=y_{T-1})$$
///
/// ...where each $y_t \in \mathbb{R}^D$.
///
/// It accomplishes this with latent variables for hidden state $X=(X_0, \ldots, X_{T-1})$ where each
/// $x_t \in [0, N)$.
///
/// A trained HMM has three parameters, all stored as natural logarithms:
/// * $A$, the $N × N$ state transition matrix: $a_{ij}=P(X_t=j|X_{t-1}=i)$
/// * $B$, the emission distributions: $b_i(y)=p(Y_t=y|X_t=i)$
/// * $π$, the $N$-length initial state distribution: $π_i=P(X_0=i)$
///
/// An `HMM` can only be built from valid parameters, so decoding never re-validates them.
///
/// # Observations
///
/// A sequence of observations is always a $T × D$ matrix: row $t$ is $y_t$. Nothing is
/// transposed automatically; a matrix with the wrong number of columns is an
/// [`HmmError::DimensionMismatch`](enum.HmmError.html).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-1",
    derive(Serialize, Deserialize),
    serde(try_from = "HmmParameters", into = "HmmParameters")
)]
pub struct HMM {
    log_a: Array2<f64>,
    emission: Emission,
    log_pi: Array1<f64>,
}

impl HMM {
    /// Create a new HMM from log-probabilities. $-∞$ is allowed anywhere, for impossible
    /// initial states and transitions.
    ///
    /// This could be useful for loading a saved trained model.
    ///
    /// Fails with `HmmError::InvalidModel` if any of:
    /// - Dimensions are invalid
    /// - Probability distributions are invalid
    pub fn new(log_pi: Array1<f64>, log_a: Array2<f64>, emission: Emission) -> Result<Self> {
        // Check all dimensions
        {
            let n = log_pi.len();
            if n == 0 {
                return Err(HmmError::InvalidModel(
                    "π must have a positive length".to_string(),
                ));
            }
            if log_a.dim() != (n, n) {
                return Err(HmmError::InvalidModel(format!(
                    "A has shape {:?} but π has length {}",
                    log_a.shape(),
                    n
                )));
            }
            emission.check_consistent()?;
            if emission.n_states() != n {
                return Err(HmmError::InvalidModel(format!(
                    "B has {} states but π has length {}",
                    emission.n_states(),
                    n
                )));
            }
        }

        // Check that each row of A is a distribution
        for (i, row) in log_a.outer_iter().enumerate() {
            check_log_distribution(&row, TOLERANCE, &format!("row {} of A", i))
                .map_err(HmmError::InvalidModel)?;
        }

        // Check that π is a distribution
        check_log_distribution(&log_pi, TOLERANCE, "π").map_err(HmmError::InvalidModel)?;

        Ok(Self {
            log_a,
            emission,
            log_pi,
        })
    }

    /// Create a new HMM from probabilities rather than log-probabilities.
    pub fn from_probabilities(
        pi: Array1<f64>,
        a: Array2<f64>,
        emission: Emission,
    ) -> Result<Self> {
        Self::new(ln(&pi), ln(&a), emission)
    }

    /// $N$, the number of states in this HMM
    pub fn n(&self) -> usize {
        self.log_pi.len()
    }

    /// $D$, the length of each observation vector
    pub fn dimensionality(&self) -> usize {
        self.emission.dimensionality()
    }

    /// $\ln π$
    pub fn log_pi(&self) -> ArrayView1<f64> {
        self.log_pi.view()
    }

    /// $\ln A$
    pub fn log_a(&self) -> ArrayView2<f64> {
        self.log_a.view()
    }

    pub fn emission(&self) -> &Emission {
        &self.emission
    }

    /// This is the Viterbi algorithm. Given a $T × D$ matrix of observations, return the most
    /// likely sequence of states.
    ///
    /// If several sequences are equally likely, the one found by always preferring the lowest
    /// state index is returned.
    ///
    /// Fails if:
    /// - There are no observations
    /// - The number of columns is not $D$
    /// - An observation is NaN or infinite
    pub fn most_likely_sequence(&self, ys: ArrayView2<f64>) -> Result<Array1<usize>> {
        self.viterbi(ys).map(|path| path.states)
    }

    /// Like `most_likely_sequence`, but also return the joint log-probability of the sequence
    /// and the observations.
    pub fn viterbi(&self, ys: ArrayView2<f64>) -> Result<ViterbiPath> {
        self.viterbi_with(ys, &mut NoopObserver)
    }

    /// Like `viterbi`, reporting progress to `observer` along the way.
    pub fn viterbi_with(
        &self,
        ys: ArrayView2<f64>,
        observer: &mut dyn ViterbiObserver,
    ) -> Result<ViterbiPath> {
        viterbi::decode(
            self.log_pi.view(),
            self.log_a.view(),
            &self.emission,
            ys,
            observer,
        )
    }

    /// Return the log likelihood of a sequence of states and observations:
    ///
    /// $$
    /// \ln π_{x_0} + \ln b_{x_0}(y_0) + \sum_{t=1}^{T-1} \left(\ln a_{x_{t-1} x_t} + \ln b_{x_t}(y_t)\right)
    /// $$
    ///
    /// This is not a typical use case, because often the vector of hidden states is not
    /// available, but it is exactly what the Viterbi algorithm maximizes.
    ///
    /// Fails if:
    /// - The observations are empty or have the wrong dimensionality
    /// - The number of states and observations is not equal
    /// - A state is out of bounds
    pub fn ll_given_states(&self, xs: &[usize], ys: ArrayView2<f64>) -> Result<f64> {
        viterbi::check_observations(&ys, self.dimensionality())?;
        if xs.len() != ys.rows() {
            return Err(HmmError::InvalidInput(format!(
                "{} states given for {} observations",
                xs.len(),
                ys.rows()
            )));
        }
        if let Some(&x) = xs.iter().find(|&&x| x >= self.n()) {
            return Err(HmmError::InvalidInput(format!(
                "state {} is out of bounds for an HMM with {} states",
                x,
                self.n()
            )));
        }

        // When looping, we skip the initial observation
        let initial_state_log_prob = self.log_pi[xs[0]];
        let initial_observation_log_prob = self.emission.log_density(xs[0], ys.row(0));
        let the_rest: f64 = xs
            .iter()
            .zip(ys.outer_iter())
            .tuple_windows()
            .map(|((&state0, _observation0), (&state1, observation1))| {
                let transition_log_prob = self.log_a[(state0, state1)];
                let observation_log_prob = self.emission.log_density(state1, observation1);
                transition_log_prob + observation_log_prob
            })
            .sum();

        Ok(initial_state_log_prob + initial_observation_log_prob + the_rest)
    }

    /// The log-probability of a sequence of observations, summed over every sequence of hidden
    /// states. This is the forward algorithm:
    ///
    /// $$
    /// α_j(t) = \ln b_j(y_t) + \ln \sum_i e^{α_i(t-1) + \ln a_{ij}}
    /// $$
    ///
    /// ...with the sums computed by log-sum-exp.
    pub fn log_likelihood(&self, ys: ArrayView2<f64>) -> Result<f64> {
        viterbi::check_observations(&ys, self.dimensionality())?;

        let y_0 = ys.row(0);
        let mut alpha = Array1::from(viterbi::per_state(self.n(), |i| {
            self.log_pi[i] + self.emission.log_density(i, y_0)
        }));
        for y_t in ys.outer_iter().skip(1) {
            let prev = alpha.view();
            alpha = Array1::from(viterbi::per_state(self.n(), |j| {
                (&prev + &self.log_a.column(j)).log_sum_exp()
                    + self.emission.log_density(j, y_t)
            }));
        }
        Ok(alpha.log_sum_exp())
    }
}

/// The serialized form of an [`HMM`](struct.HMM.html), in probability space. The transition
/// matrix is a list of rows.
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
pub struct HmmParameters {
    pub initial: Vec<f64>,
    pub transition: Vec<Vec<f64>>,
    pub emission: Emission,
}

impl TryFrom<HmmParameters> for HMM {
    type Error = HmmError;

    fn try_from(parameters: HmmParameters) -> Result<Self> {
        let a = array2_from_rows(parameters.transition)
            .map_err(|e| HmmError::InvalidModel(format!("A {}", e)))?;
        HMM::from_probabilities(Array1::from(parameters.initial), a, parameters.emission)
    }
}

impl From<HMM> for HmmParameters {
    fn from(hmm: HMM) -> Self {
        Self {
            initial: hmm.log_pi.mapv(f64::exp).to_vec(),
            transition: rows_from_array2(&hmm.log_a.mapv(f64::exp)),
            emission: hmm.emission,
        }
    }
}


#[cfg(feature = "benchmark")]
mod benchmark {
    use crate::*;
    use ndarray::{array, Array2};
    use test::Bencher;

    #[bench]
    fn bench(b: &mut Bencher) {
        let hmm = HMM::from_probabilities(
            array![0.6, 0.4],
            array![[0.7, 0.3], [0.4, 0.6]],
            Emission::Gaussian(vec![
                Gaussian::univariate(0.0, 1.0).unwrap(),
                Gaussian::univariate(3.0, 1.0).unwrap(),
            ]),
        )
        .unwrap();
        let observations = Array2::from_shape_fn((1001, 1), |(t, _)| (t % 7) as f64 * 0.5);
        b.iter(|| hmm.most_likely_sequence(observations.view()));
    }
}
