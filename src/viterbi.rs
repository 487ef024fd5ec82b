//! The Viterbi algorithm, in log space.
//!
//! Let $δ_i(t)$ be the log-probability of the most likely sequence of states that ends in state
//! $i$ at time $t$, together with the observations up to and including $t$:
//!
//! $$
//! δ_i(0) = \ln π_i + \ln b_i(y_0)
//! $$
//!
//! $$
//! δ_j(t) = \max_i \left(δ_i(t-1) + \ln a_{ij}\right) + \ln b_j(y_t)
//! $$
//!
//! $ψ_j(t)$ records the maximizing $i$. The most likely final state is $\arg\max_i δ_i(T-1)$
//! and the rest of the sequence is recovered by following $ψ$ backwards.
//!
//! Every $\max$ is resolved toward the lowest state index, so equally likely sequences are
//! always decoded the same way.
use crate::emission::EmissionModel;
use crate::error::{HmmError, Result};
use crate::ndarray_utils::*;
use log::{debug, trace, warn};
use ndarray::prelude::*;

/// The most likely sequence of hidden states, as returned by `HMM::viterbi`.
#[derive(Clone, Debug, PartialEq)]
pub struct ViterbiPath {
    /// `states[t]` is the hidden state at time $t$
    pub states: Array1<usize>,
    /// The joint log-probability of `states` and the observations
    pub log_prob: f64,
}

/// Hooks called as the trellis is filled in. None of them can influence the result.
///
/// All methods do nothing by default.
pub trait ViterbiObserver {
    /// $δ(0)$ has been computed.
    fn initialized(&mut self, _delta: ArrayView1<f64>) {}

    /// $δ(t)$ and $ψ(t)$ have been computed, for $t \ge 1$.
    fn step(&mut self, _t: usize, _delta: ArrayView1<f64>, _psi: ArrayView1<usize>) {}

    /// The most likely final state has been chosen. The backtrace follows.
    fn terminated(&mut self, _final_state: usize, _log_prob: f64) {}
}

/// Observe nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl ViterbiObserver for NoopObserver {}

/// Forward every observation point to the `log` crate at `trace` level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver;

impl ViterbiObserver for LogObserver {
    fn initialized(&mut self, delta: ArrayView1<f64>) {
        trace!("viterbi t=0 delta={}", delta);
    }

    fn step(&mut self, t: usize, delta: ArrayView1<f64>, psi: ArrayView1<usize>) {
        trace!("viterbi t={} delta={} psi={}", t, delta, psi);
    }

    fn terminated(&mut self, final_state: usize, log_prob: f64) {
        trace!(
            "viterbi final state {} with log-probability {}",
            final_state,
            log_prob
        );
    }
}

/// Check that `observations` is a non-empty $T × D$ matrix of finite values.
///
/// The orientation is never guessed: a $1 × T$ matrix given to a model with $D = 1$ is a
/// dimension mismatch, not a transposed sequence.
pub(crate) fn check_observations(observations: &ArrayView2<f64>, d: usize) -> Result<()> {
    let (t_len, d_obs) = observations.dim();
    if t_len == 0 {
        return Err(HmmError::EmptyInput);
    }
    if d_obs != d {
        return Err(HmmError::DimensionMismatch {
            expected: d,
            actual: d_obs,
        });
    }
    // Densities are only defined for finite observations
    if let Some(((t, i), y)) = observations.indexed_iter().find(|(_, y)| !y.is_finite()) {
        return Err(HmmError::InvalidInput(format!(
            "observation {} has a non-finite value {} in column {}",
            t, y, i
        )));
    }
    Ok(())
}

/// Run `f` for every state and collect the results in state order. With the `parallel`
/// feature the states are spread over the rayon thread pool.
#[cfg(not(feature = "parallel"))]
pub(crate) fn per_state<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Send + Sync,
{
    (0..n).map(f).collect()
}

#[cfg(feature = "parallel")]
pub(crate) fn per_state<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Send + Sync,
{
    use rayon::prelude::*;
    (0..n).into_par_iter().map(f).collect()
}

/// $\arg\max_i δ_i(t-1) + \ln a_{ij}$ and the maximum itself, where `prev` is $δ(t-1)$ and
/// `j` is `to`. Ties go to the lowest $i$.
fn best_predecessor(prev: ArrayView1<f64>, log_a: ArrayView2<f64>, to: usize) -> (usize, f64) {
    let mut best = (0, prev[0] + log_a[(0, to)]);
    for from in 1..prev.len() {
        let candidate = prev[from] + log_a[(from, to)];
        if candidate > best.1 {
            best = (from, candidate);
        }
    }
    best
}

/// Decode `observations` given raw log-space parameters and any emission model.
///
/// Only the shapes of the parameters are checked. Unlike `HMM::new`, this trusts that `log_pi`
/// and the rows of `log_a` are log-probability distributions; if they are not, the result is the
/// highest-scoring path under whatever scores they define.
pub fn decode<E>(
    log_pi: ArrayView1<f64>,
    log_a: ArrayView2<f64>,
    emission: &E,
    observations: ArrayView2<f64>,
    observer: &mut dyn ViterbiObserver,
) -> Result<ViterbiPath>
where
    E: EmissionModel + ?Sized,
{
    let n = log_pi.len();
    if n == 0 || log_a.dim() != (n, n) || emission.n_states() != n {
        return Err(HmmError::InvalidModel(format!(
            "π has length {}, A has shape {:?} and B has {} states",
            n,
            log_a.shape(),
            emission.n_states()
        )));
    }
    check_observations(&observations, emission.dimensionality())?;
    let t_len = observations.rows();
    debug!("decoding {} observations with {} states", t_len, n);

    // delta is a T × N matrix where delta[t, i] is δ_i(t)
    let mut delta = Array2::from_elem((t_len, n), f64::NEG_INFINITY);

    // psi is a T × N matrix where psi[t, j] is ψ_j(t). Row 0 is unused.
    let mut psi: Array2<usize> = Array2::zeros((t_len, n));

    let y_0 = observations.row(0);
    let column = per_state(n, |i| log_pi[i] + emission.log_density(i, y_0));
    delta.row_mut(0).assign(&Array1::from(column));
    observer.initialized(delta.row(0));

    for t in 1..t_len {
        let y_t = observations.row(t);
        let column = {
            let prev = delta.row(t - 1);
            per_state(n, |j| {
                let (from, best) = best_predecessor(prev, log_a, j);
                (from, best + emission.log_density(j, y_t))
            })
        };
        for (j, (from, delta_j)) in column.into_iter().enumerate() {
            psi[(t, j)] = from;
            delta[(t, j)] = delta_j;
        }
        observer.step(t, delta.row(t), psi.row(t));
    }

    let (final_state, log_prob) = delta
        .row(t_len - 1)
        .maxf()
        .unwrap_or((0, f64::NEG_INFINITY));
    observer.terminated(final_state, log_prob);
    if log_prob == f64::NEG_INFINITY {
        warn!("every state sequence has probability zero; the decoded path is arbitrary");
    }

    let mut states = Array1::zeros(t_len);
    states[t_len - 1] = final_state;
    for t in (0..t_len - 1).rev() {
        states[t] = psi[(t + 1, states[t + 1])];
    }
    debug!("decoded path has log-probability {}", log_prob);

    Ok(ViterbiPath { states, log_prob })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emission::{Density, Gaussian};
    use crate::ndarray_utils::ln;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls to `log_density`
    struct Counting {
        states: Vec<Gaussian>,
        calls: AtomicUsize,
    }

    impl EmissionModel for Counting {
        fn n_states(&self) -> usize {
            self.states.len()
        }

        fn dimensionality(&self) -> usize {
            1
        }

        fn log_density(&self, state: usize, observation: ArrayView1<f64>) -> f64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.states[state].log_density(observation)
        }
    }

    #[derive(Default)]
    struct Recording {
        initialized: usize,
        steps: Vec<usize>,
        terminated: Option<(usize, f64)>,
    }

    impl ViterbiObserver for Recording {
        fn initialized(&mut self, delta: ArrayView1<f64>) {
            assert!(self.steps.is_empty());
            assert!(delta.iter().all(|d| d.is_finite()));
            self.initialized += 1;
        }

        fn step(&mut self, t: usize, _delta: ArrayView1<f64>, psi: ArrayView1<usize>) {
            assert!(psi.iter().all(|&i| i < 3));
            self.steps.push(t);
        }

        fn terminated(&mut self, final_state: usize, log_prob: f64) {
            self.terminated = Some((final_state, log_prob));
        }
    }

    fn three_gaussians() -> Vec<Gaussian> {
        vec![
            Gaussian::univariate(-2.0, 1.0).unwrap(),
            Gaussian::univariate(0.0, 1.0).unwrap(),
            Gaussian::univariate(2.0, 1.0).unwrap(),
        ]
    }

    fn uniform_log(n: usize) -> (Array1<f64>, Array2<f64>) {
        (
            Array1::from_elem(n, (1.0 / n as f64).ln()),
            Array2::from_elem((n, n), (1.0 / n as f64).ln()),
        )
    }

    #[test]
    fn emission_is_evaluated_once_per_state_and_step() {
        let emission = Counting {
            states: three_gaussians(),
            calls: AtomicUsize::new(0),
        };
        let (log_pi, log_a) = uniform_log(3);
        let ys = array![[-2.0], [0.1], [1.9], [2.2], [-0.3]];
        decode(
            log_pi.view(),
            log_a.view(),
            &emission,
            ys.view(),
            &mut NoopObserver,
        )
        .unwrap();
        assert_eq!(5 * 3, emission.calls.load(Ordering::SeqCst));
    }

    #[test]
    fn observer_sees_every_step() {
        let emission = three_gaussians();
        let (log_pi, log_a) = uniform_log(3);
        let ys = array![[-2.0], [0.1], [1.9], [2.2]];
        let mut recording = Recording::default();
        let path = decode(
            log_pi.view(),
            log_a.view(),
            emission.as_slice(),
            ys.view(),
            &mut recording,
        )
        .unwrap();
        assert_eq!(1, recording.initialized);
        assert_eq!(vec![1, 2, 3], recording.steps);
        assert_eq!(Some((2, path.log_prob)), recording.terminated);
        assert_eq!(array![0, 1, 2, 2], path.states);
    }

    #[test]
    fn observer_does_not_change_result() {
        let emission = three_gaussians();
        let (log_pi, log_a) = uniform_log(3);
        let ys = array![[0.5], [-1.5], [1.0]];
        let quiet = decode(
            log_pi.view(),
            log_a.view(),
            emission.as_slice(),
            ys.view(),
            &mut NoopObserver,
        )
        .unwrap();
        let logged = decode(
            log_pi.view(),
            log_a.view(),
            emission.as_slice(),
            ys.view(),
            &mut LogObserver,
        )
        .unwrap();
        assert_eq!(quiet, logged);
    }

    #[test]
    fn ties_prefer_lowest_index() {
        // Two identical states: every sequence is equally likely
        let emission = vec![
            Gaussian::univariate(0.0, 1.0).unwrap(),
            Gaussian::univariate(0.0, 1.0).unwrap(),
        ];
        let (log_pi, log_a) = uniform_log(2);
        let ys = array![[0.3], [-0.2], [1.0]];
        let path = decode(
            log_pi.view(),
            log_a.view(),
            emission.as_slice(),
            ys.view(),
            &mut NoopObserver,
        )
        .unwrap();
        assert_eq!(array![0, 0, 0], path.states);
    }

    #[test]
    fn zero_probability_transitions_are_respected() {
        // State 0 can only be followed by state 1, even though state 0 fits the data better
        let emission = vec![
            Gaussian::univariate(0.0, 1.0).unwrap(),
            Gaussian::univariate(5.0, 1.0).unwrap(),
        ];
        let log_pi = ln(&array![1.0, 0.0]);
        let log_a = ln(&array![[0.0, 1.0], [0.5, 0.5]]);
        let ys = array![[0.0], [0.0], [0.0]];
        let path = decode(
            log_pi.view(),
            log_a.view(),
            emission.as_slice(),
            ys.view(),
            &mut NoopObserver,
        )
        .unwrap();
        assert_eq!(array![0, 1, 0], path.states);
        assert!(path.log_prob.is_finite());
    }

    #[test]
    fn impossible_observations_still_decode() {
        let emission = vec![
            crate::emission::Discrete::new(array![1.0, 0.0]).unwrap(),
            crate::emission::Discrete::new(array![1.0, 0.0]).unwrap(),
        ];
        let (log_pi, log_a) = uniform_log(2);
        let ys = array![[0.0], [1.0], [0.0]];
        let path = decode(
            log_pi.view(),
            log_a.view(),
            emission.as_slice(),
            ys.view(),
            &mut NoopObserver,
        )
        .unwrap();
        assert_eq!(array![0, 0, 0], path.states);
        assert_eq!(f64::NEG_INFINITY, path.log_prob);
    }

    #[test]
    fn decode_checks_shapes() {
        let emission = three_gaussians();
        let (log_pi, log_a) = uniform_log(2);
        let ys = array![[0.0]];
        let result = decode(
            log_pi.view(),
            log_a.view(),
            emission.as_slice(),
            ys.view(),
            &mut NoopObserver,
        );
        assert!(matches!(result, Err(HmmError::InvalidModel(_))));
    }

    #[test]
    fn per_state_preserves_order() {
        assert_eq!(vec![0, 1, 4, 9, 16], per_state(5, |i| i * i));
    }

    /// The trellis filled in one state at a time, without `per_state`
    #[cfg(feature = "parallel")]
    fn sequential_decode(
        log_pi: ArrayView1<f64>,
        log_a: ArrayView2<f64>,
        emission: &[Gaussian],
        ys: ArrayView2<f64>,
    ) -> ViterbiPath {
        let n = log_pi.len();
        let mut delta: Array1<f64> = (0..n)
            .map(|i| log_pi[i] + emission.log_density(i, ys.row(0)))
            .collect();
        let mut psi = vec![];
        for y_t in ys.outer_iter().skip(1) {
            let (from, column): (Vec<usize>, Vec<f64>) = (0..n)
                .map(|j| {
                    let (from, best) = best_predecessor(delta.view(), log_a, j);
                    (from, best + emission.log_density(j, y_t))
                })
                .unzip();
            psi.push(from);
            delta = Array1::from(column);
        }
        let (last, log_prob) = delta.maxf().unwrap();
        let mut states = vec![last];
        for from in psi.iter().rev() {
            states.push(from[*states.last().unwrap()]);
        }
        states.reverse();
        ViterbiPath {
            states: Array1::from(states),
            log_prob,
        }
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn parallel_matches_sequential() {
        let n = 24;
        let emission: Vec<Gaussian> = (0..n)
            .map(|i| Gaussian::univariate(i as f64 * 0.5 - 6.0, 0.5 + (i % 5) as f64 * 0.3).unwrap())
            .collect();
        // Sticky transitions with some impossible jumps
        let a = Array2::from_shape_fn((n, n), |(i, j)| {
            if i == j {
                10.0
            } else if (i + j) % 7 == 0 {
                0.0
            } else {
                1.0 + ((i * j) % 3) as f64
            }
        });
        let a = &a / &a.sum_axis(Axis(1)).insert_axis(Axis(1));
        let log_a = ln(&a);
        let log_pi = Array1::from_elem(n, (1.0 / n as f64).ln());
        let ys = Array2::from_shape_fn((300, 1), |(t, _)| 6.0 * (t as f64 * 0.05).sin());

        for _ in 0..5 {
            let parallel = decode(
                log_pi.view(),
                log_a.view(),
                emission.as_slice(),
                ys.view(),
                &mut NoopObserver,
            )
            .unwrap();
            let sequential =
                sequential_decode(log_pi.view(), log_a.view(), &emission, ys.view());
            assert_eq!(sequential, parallel);
        }
    }

    #[test]
    fn check_observations_order_of_errors() {
        let empty = Array2::<f64>::zeros((0, 3));
        assert!(matches!(
            check_observations(&empty.view(), 1),
            Err(HmmError::EmptyInput)
        ));
        let row = array![[0.2, 2.9, -0.1]];
        assert!(matches!(
            check_observations(&row.view(), 1),
            Err(HmmError::DimensionMismatch {
                expected: 1,
                actual: 3
            })
        ));
        let column = array![[0.2], [2.9], [-0.1]];
        assert!(check_observations(&column.view(), 1).is_ok());
    }

    #[test]
    fn non_finite_observations_are_rejected() {
        let emission = three_gaussians();
        let (log_pi, log_a) = uniform_log(3);
        for &bad in &[f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let ys = array![[3.0], [bad], [3.1]];
            let result = decode(
                log_pi.view(),
                log_a.view(),
                emission.as_slice(),
                ys.view(),
                &mut NoopObserver,
            );
            match result {
                Err(HmmError::InvalidInput(message)) => {
                    assert!(message.starts_with("observation 1 "), "{}", message);
                    assert!(message.ends_with("column 0"), "{}", message);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn non_finite_check_comes_after_shape_checks() {
        let ys = array![[f64::NAN, 0.0]];
        assert!(matches!(
            check_observations(&ys.view(), 1),
            Err(HmmError::DimensionMismatch { .. })
        ));
        let ys = array![[0.0, 1.0], [2.0, f64::INFINITY]];
        match check_observations(&ys.view(), 2) {
            Err(HmmError::InvalidInput(message)) => {
                assert_eq!("observation 1 has a non-finite value inf in column 1", message)
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
