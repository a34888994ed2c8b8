//! Randomized-restart nonlinear least squares for the response model.
//!
//! Two independent minimization strategies run side by side: a trust-region
//! solver (argmin, Steihaug subproblem, Gauss-Newton curvature) and a
//! Levenberg-Marquardt solver (the `levenberg_marquardt` crate, analytic
//! Jacobian). Each strategy keeps the lowest-residual *valid* result across
//! its own restart pool; the final winner is the valid strategy with the
//! lower residual sum of squares.

use std::cmp::Ordering;

use argmin::core::{CostFunction, Executor, Gradient, Hessian, State};
use argmin::solver::brent::BrentOpt;
use argmin::solver::trustregion::{Steihaug, TrustRegion};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{Const, DVector, Dyn, Matrix, OMatrix, Vector6, U6};
use ndarray::{Array1, Array2};
use ndarray_rand::rand::Rng;

use crate::model::{Parameters, N_PARAMETERS};

/// Stand-in cost for parameter regions where the model overflows; large
/// enough to lose against any real residual, finite so the solvers can
/// keep comparing.
const NON_FINITE_COST: f64 = 1e300;

const TRUST_REGION_MAX_ITERS: u64 = 100;
const BRENT_MAX_ITERS: u64 = 100;

/// The two restart pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    TrustRegion,
    LevenbergMarquardt,
}

/// Winning restart of the search over both strategies.
#[derive(Clone, Copy, Debug)]
pub struct BestFit {
    pub params: Parameters,
    pub rss: f64,
    pub strategy: Strategy,
}

/// Derived response metrics of a winning parameter set.
#[derive(Clone, Copy, Debug)]
pub struct ResponseMetrics {
    /// Elapsed time from the zero crossing to 90% of the plateau.
    pub tau_90: f64,
    /// 90% of the plateau value.
    pub f_t90: f64,
}

/// Sum of squared residuals of `params` over `samples`.
pub(crate) fn residual_sum(params: &Parameters, samples: &[(f64, f64)]) -> f64 {
    samples
        .iter()
        .map(|&(t, y)| {
            let r = params.value(t) - y;
            r * r
        })
        .sum()
}

/// Fit the response model to `samples` with `n_iterations` random restarts
/// per strategy.
///
/// Restart draws come from `rng` in a fixed order, so a seeded generator
/// makes the search reproducible. A restart's result only counts when it
/// passes the validity predicate with bound `limit_factor * |y_extreme|`.
///
/// Returns `Ok(None)` when no restart of either strategy produced a valid
/// result, and `Err` only when every restart of both strategies failed with
/// a numerical error.
///
/// # Panics
/// When `samples` is empty; the caller filters such channels out.
pub(crate) fn fit_samples<R: Rng>(
    samples: &[(f64, f64)],
    n_iterations: usize,
    limit_factor: f64,
    rng: &mut R,
) -> ::std::result::Result<Option<BestFit>, String> {
    assert!(!samples.is_empty(), "cannot fit an empty sample set");

    let y_extreme = samples
        .iter()
        .map(|&(_, y)| y)
        .max_by(|a, b| {
            a.abs()
                .partial_cmp(&b.abs())
                .unwrap_or(Ordering::Equal)
        })
        .unwrap_or(0.0);
    let plateau_bound = limit_factor * y_extreme.abs();
    let t_first = samples[0].0;
    let t_last = samples[samples.len() - 1].0;

    let mut best_trust_region: Option<BestFit> = None;
    let mut best_levenberg: Option<BestFit> = None;
    let mut attempts = 0usize;
    let mut failures = 0usize;
    let mut last_error = String::new();

    for _ in 0..n_iterations {
        let init = Parameters::random(rng, y_extreme, t_first, t_last);
        attempts += 1;
        match solve_trust_region(samples, init) {
            Ok(params) => consider(
                &mut best_trust_region,
                params,
                Strategy::TrustRegion,
                samples,
                plateau_bound,
            ),
            Err(message) => {
                log::debug!("trust-region restart discarded: {message}");
                failures += 1;
                last_error = message;
            }
        }

        let init = Parameters::random(rng, y_extreme, t_first, t_last);
        attempts += 1;
        match solve_levenberg_marquardt(samples, init) {
            Ok(params) => consider(
                &mut best_levenberg,
                params,
                Strategy::LevenbergMarquardt,
                samples,
                plateau_bound,
            ),
            Err(message) => {
                log::debug!("levenberg-marquardt restart discarded: {message}");
                failures += 1;
                last_error = message;
            }
        }
    }

    if attempts > 0 && failures == attempts {
        return Err(last_error);
    }

    Ok(match (best_trust_region, best_levenberg) {
        (Some(a), Some(b)) => Some(if a.rss <= b.rss { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    })
}

fn consider(
    best: &mut Option<BestFit>,
    params: Parameters,
    strategy: Strategy,
    samples: &[(f64, f64)],
    plateau_bound: f64,
) {
    if !params.is_valid(plateau_bound) {
        return;
    }
    let rss = residual_sum(&params, samples);
    if !rss.is_finite() {
        return;
    }
    if best.as_ref().map_or(true, |b| rss < b.rss) {
        *best = Some(BestFit {
            params,
            rss,
            strategy,
        });
    }
}

/// Least-squares problem for the argmin trust-region strategy.
///
/// Cost is the residual sum of squares; gradient and Hessian use the
/// Gauss-Newton forms `2 J^T r` and `2 J^T J`.
struct TrustRegionProblem<'a> {
    samples: &'a [(f64, f64)],
}

impl CostFunction for TrustRegionProblem<'_> {
    type Param = Array1<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> ::std::result::Result<f64, argmin::core::Error> {
        let params = Parameters::from_array(p);
        let rss = residual_sum(&params, self.samples);
        Ok(if rss.is_finite() { rss } else { NON_FINITE_COST })
    }
}

impl Gradient for TrustRegionProblem<'_> {
    type Param = Array1<f64>;
    type Gradient = Array1<f64>;

    fn gradient(&self, p: &Self::Param) -> ::std::result::Result<Array1<f64>, argmin::core::Error> {
        let params = Parameters::from_array(p);
        let mut gradient = Array1::zeros(N_PARAMETERS);
        for &(t, y) in self.samples {
            let r = params.value(t) - y;
            let partials = params.gradient(t);
            for (gi, di) in gradient.iter_mut().zip(partials) {
                *gi += 2.0 * r * di;
            }
        }
        Ok(gradient)
    }
}

impl Hessian for TrustRegionProblem<'_> {
    type Param = Array1<f64>;
    type Hessian = Array2<f64>;

    fn hessian(&self, p: &Self::Param) -> ::std::result::Result<Array2<f64>, argmin::core::Error> {
        let params = Parameters::from_array(p);
        let mut hessian = Array2::zeros((N_PARAMETERS, N_PARAMETERS));
        for &(t, _) in self.samples {
            let partials = params.gradient(t);
            for ii in 0..N_PARAMETERS {
                for jj in 0..N_PARAMETERS {
                    hessian[[ii, jj]] += 2.0 * partials[ii] * partials[jj];
                }
            }
        }
        Ok(hessian)
    }
}

fn solve_trust_region(
    samples: &[(f64, f64)],
    init: Parameters,
) -> ::std::result::Result<Parameters, String> {
    let solver = TrustRegion::new(Steihaug::new());
    let res = Executor::new(TrustRegionProblem { samples }, solver)
        .configure(|state| {
            state
                .param(init.to_array())
                .max_iters(TRUST_REGION_MAX_ITERS)
        })
        .run()
        .map_err(|e| e.to_string())?;

    res.state()
        .get_best_param()
        .map(Parameters::from_array)
        .ok_or_else(|| "trust region terminated without parameters".to_owned())
}

/// Least-squares problem for the `levenberg_marquardt` strategy.
struct LevenbergProblem<'a> {
    samples: &'a [(f64, f64)],
    params: Parameters,
}

impl LeastSquaresProblem<f64, Dyn, U6> for LevenbergProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, x: &Vector6<f64>) {
        self.params = Parameters::from_vector(x);
    }

    fn params(&self) -> Vector6<f64> {
        self.params.to_vector()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let residuals = DVector::from_iterator(
            self.samples.len(),
            self.samples.iter().map(|&(t, y)| self.params.value(t) - y),
        );
        residuals.iter().all(|r| r.is_finite()).then_some(residuals)
    }

    fn jacobian(&self) -> Option<Matrix<f64, Dyn, U6, Self::JacobianStorage>> {
        let mut jacobian = OMatrix::<f64, Dyn, U6>::zeros_generic(Dyn(self.samples.len()), Const::<6>);
        for (ii, &(t, _)) in self.samples.iter().enumerate() {
            let partials = self.params.gradient(t);
            for (jj, partial) in partials.into_iter().enumerate() {
                jacobian[(ii, jj)] = partial;
            }
        }
        jacobian.iter().all(|v| v.is_finite()).then_some(jacobian)
    }
}

fn solve_levenberg_marquardt(
    samples: &[(f64, f64)],
    init: Parameters,
) -> ::std::result::Result<Parameters, String> {
    let problem = LevenbergProblem {
        samples,
        params: init,
    };
    let (problem, report) = LevenbergMarquardt::new().minimize(problem);
    if report.termination.was_successful() {
        Ok(problem.params)
    } else {
        Err(format!("levenberg-marquardt: {:?}", report.termination))
    }
}

/// 1-D objective |f(t) - target| for the Brent searches.
struct DistanceTo<'a> {
    params: &'a Parameters,
    target: f64,
}

impl CostFunction for DistanceTo<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, t: &Self::Param) -> ::std::result::Result<f64, argmin::core::Error> {
        let v = self.params.value(*t) - self.target;
        Ok(if v.is_finite() { v.abs() } else { NON_FINITE_COST })
    }
}

fn minimise_scalar(
    params: &Parameters,
    target: f64,
    lower: f64,
    upper: f64,
) -> ::std::result::Result<f64, String> {
    let res = Executor::new(DistanceTo { params, target }, BrentOpt::new(lower, upper))
        .configure(|state| state.max_iters(BRENT_MAX_ITERS))
        .run()
        .map_err(|e| e.to_string())?;

    res.state()
        .get_best_param()
        .copied()
        .ok_or_else(|| "brent search terminated without a minimum".to_owned())
}

/// Compute `tau_90` and `f_t90` from winning parameters.
///
/// `t_zero` minimizes |f(t)| and `t_90` minimizes |f(t) - 0.9 * plateau|,
/// both near the onset midpoint; `tau_90` is their difference. `t_first`
/// and `t_last` bound the fitted samples and size the search brackets.
pub(crate) fn response_metrics(
    params: &Parameters,
    t_first: f64,
    t_last: f64,
) -> ::std::result::Result<ResponseMetrics, String> {
    let mid = params.onset_midpoint();
    let span = (t_last - t_first).max(1.0);
    let f_t90 = 0.9 * params.plateau();

    let t_zero = minimise_scalar(params, 0.0, mid - span, mid + span)?;
    let t_90 = minimise_scalar(params, f_t90, mid - span, mid + 2.0 * span)?;

    Ok(ResponseMetrics {
        tau_90: t_90 - t_zero,
        f_t90,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray_rand::rand::SeedableRng;
    use rand_isaac::Isaac64Rng;

    use super::{fit_samples, residual_sum, response_metrics};
    use crate::model::Parameters;

    fn sample_curve(params: &Parameters, t_last: i64, step: i64) -> Vec<(f64, f64)> {
        (0..=t_last)
            .step_by(step as usize)
            .map(|t| (t as f64, params.value(t as f64)))
            .collect()
    }

    #[test]
    fn two_exponential_signal_is_recovered_within_tolerance() {
        let truth = Parameters {
            alpha_1: 1.5,
            beta_1: 0.08,
            t0_1: 0.0,
            alpha_2: 2.5,
            beta_2: 0.03,
            t0_2: 5.0,
        };
        let samples = sample_curve(&truth, 300, 2);

        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let best = fit_samples(&samples, 10, 10.0, &mut rng)
            .unwrap()
            .expect("a valid fit must exist for a clean synthetic signal");

        let sigma = (best.rss / samples.len() as f64).sqrt();
        assert!(sigma < 0.05, "per-sample residual too large: {sigma}");
        assert_relative_eq!(best.params.plateau(), truth.plateau(), max_relative = 0.02);

        for &(t, y) in &samples {
            assert!((best.params.value(t) - y).abs() < 0.2);
        }
    }

    #[test]
    fn metrics_match_analytic_values_for_coincident_components() {
        // With both components equal the model is 4 * (1 - e^(-0.1 t)), so
        // t_zero = 0 and tau_90 = ln(10) / 0.1.
        let params = Parameters {
            alpha_1: 2.0,
            beta_1: 0.1,
            t0_1: 0.0,
            alpha_2: 2.0,
            beta_2: 0.1,
            t0_2: 0.0,
        };

        let metrics = response_metrics(&params, 0.0, 100.0).unwrap();
        assert_relative_eq!(metrics.f_t90, 3.6, max_relative = 1e-12);
        assert_relative_eq!(
            metrics.tau_90,
            std::f64::consts::LN_10 / 0.1,
            max_relative = 1e-3
        );
    }

    #[test]
    fn flat_zero_samples_yield_no_valid_fit() {
        let samples: Vec<(f64, f64)> = (0..=50).map(|t| (t as f64, 0.0)).collect();

        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let best = fit_samples(&samples, 4, 10.0, &mut rng).unwrap();
        assert!(best.is_none());
    }

    #[test]
    fn residual_sum_is_zero_on_the_curve_itself() {
        let params = Parameters {
            alpha_1: 1.0,
            beta_1: 0.05,
            t0_1: 0.0,
            alpha_2: 1.0,
            beta_2: 0.1,
            t0_2: 2.0,
        };
        let samples = sample_curve(&params, 60, 1);
        assert_relative_eq!(residual_sum(&params, &samples), 0.0, epsilon = 1e-18);
    }
}
