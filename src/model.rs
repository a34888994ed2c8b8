use nalgebra::Vector6;
use ndarray::Array1;
use ndarray_rand::rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of free parameters of the response model.
pub const N_PARAMETERS: usize = 6;

/// Parameters of the two-exponential response model
///
/// ```text
/// f(t) = alpha_1 * (1 - e^(-beta_1 * (t - t0_1)))
///      + alpha_2 * (1 - e^(-beta_2 * (t - t0_2)))
/// ```
///
/// with `t` in seconds relative to the exposition start and amplitudes in
/// baseline-subtracted relative deviation (%).
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct Parameters {
    pub alpha_1: f64,
    pub beta_1: f64,
    pub t0_1: f64,
    pub alpha_2: f64,
    pub beta_2: f64,
    pub t0_2: f64,
}

impl Parameters {
    /// Model value at `t`.
    #[must_use]
    pub fn value(&self, t: f64) -> f64 {
        self.alpha_1.mul_add(
            1.0 - (-self.beta_1 * (t - self.t0_1)).exp(),
            self.alpha_2 * (1.0 - (-self.beta_2 * (t - self.t0_2)).exp()),
        )
    }

    /// Partial derivatives of [`Self::value`] in parameter order
    /// (alpha_1, beta_1, t0_1, alpha_2, beta_2, t0_2).
    #[must_use]
    pub fn gradient(&self, t: f64) -> [f64; N_PARAMETERS] {
        let e_1 = (-self.beta_1 * (t - self.t0_1)).exp();
        let e_2 = (-self.beta_2 * (t - self.t0_2)).exp();
        [
            1.0 - e_1,
            self.alpha_1 * (t - self.t0_1) * e_1,
            -self.alpha_1 * self.beta_1 * e_1,
            1.0 - e_2,
            self.alpha_2 * (t - self.t0_2) * e_2,
            -self.alpha_2 * self.beta_2 * e_2,
        ]
    }

    /// Steady-state response the curve approaches.
    #[must_use]
    pub fn plateau(&self) -> f64 {
        self.alpha_1 + self.alpha_2
    }

    /// Midpoint of the two onset times, the anchor for derived metrics.
    pub(crate) fn onset_midpoint(&self) -> f64 {
        0.5 * (self.t0_1 + self.t0_2)
    }

    /// Validity predicate for a fitted parameter set.
    ///
    /// `plateau_bound` is `limit_factor * |y_extreme|` over the fitted
    /// samples. Both rates must be non-negative, the amplitudes must share
    /// a sign, and the all-zero set is rejected.
    #[must_use]
    pub fn is_valid(&self, plateau_bound: f64) -> bool {
        let values = self.to_array();
        values.iter().all(|v| v.is_finite())
            && !values.iter().all(|v| *v == 0.0)
            && self.plateau().abs() < plateau_bound
            && self.alpha_1.signum() == self.alpha_2.signum()
            && self.beta_1 >= 0.0
            && self.beta_2 >= 0.0
    }

    /// Draw a random restart.
    ///
    /// Amplitudes scale `y_extreme` (the fitted sample of largest
    /// magnitude, signed, so downward reactions draw negative amplitudes),
    /// rates scale the heuristic `2 ln 10 / span`, and onsets scatter
    /// up to 20 s around the first sample time.
    pub(crate) fn random<R: Rng>(rng: &mut R, y_extreme: f64, t_first: f64, t_last: f64) -> Self {
        let span = (t_last - t_first).max(1.0);
        let beta_scale = 2.0 * std::f64::consts::LN_10 / span;
        Self {
            alpha_1: rng.gen::<f64>() * y_extreme,
            beta_1: rng.gen::<f64>() * beta_scale,
            t0_1: t_first + rng.gen_range(-20.0..20.0),
            alpha_2: rng.gen::<f64>() * y_extreme,
            beta_2: rng.gen::<f64>() * beta_scale,
            t0_2: t_first + rng.gen_range(-20.0..20.0),
        }
    }

    pub(crate) fn to_array(self) -> Array1<f64> {
        Array1::from(vec![
            self.alpha_1,
            self.beta_1,
            self.t0_1,
            self.alpha_2,
            self.beta_2,
            self.t0_2,
        ])
    }

    pub(crate) fn from_array(values: &Array1<f64>) -> Self {
        Self {
            alpha_1: values[0],
            beta_1: values[1],
            t0_1: values[2],
            alpha_2: values[3],
            beta_2: values[4],
            t0_2: values[5],
        }
    }

    pub(crate) fn to_vector(self) -> Vector6<f64> {
        Vector6::new(
            self.alpha_1,
            self.beta_1,
            self.t0_1,
            self.alpha_2,
            self.beta_2,
            self.t0_2,
        )
    }

    pub(crate) fn from_vector(values: &Vector6<f64>) -> Self {
        Self {
            alpha_1: values[0],
            beta_1: values[1],
            t0_1: values[2],
            alpha_2: values[3],
            beta_2: values[4],
            t0_2: values[5],
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::Isaac64Rng;

    use super::Parameters;

    fn random_parameters<R: Rng>(rng: &mut R) -> Parameters {
        Parameters {
            alpha_1: rng.gen_range(0.5..5.0),
            beta_1: rng.gen_range(0.01..0.5),
            t0_1: rng.gen_range(-10.0..10.0),
            alpha_2: rng.gen_range(0.5..5.0),
            beta_2: rng.gen_range(0.01..0.5),
            t0_2: rng.gen_range(-10.0..10.0),
        }
    }

    #[test]
    fn gradient_matches_central_finite_differences() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let delta = 1e-6;

        for _ in 0..10 {
            let params = random_parameters(&mut rng);
            let t = rng.gen_range(0.0..120.0);
            let analytic = params.gradient(t);

            let mut values = params.to_array();
            for (ii, gradient) in analytic.iter().enumerate() {
                let original = values[ii];
                values[ii] = original + delta;
                let plus = Parameters::from_array(&values).value(t);
                values[ii] = original - delta;
                let minus = Parameters::from_array(&values).value(t);
                values[ii] = original;

                let numeric = (plus - minus) / (2.0 * delta);
                assert_relative_eq!(*gradient, numeric, max_relative = 1e-4, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn value_approaches_the_plateau() {
        let params = Parameters {
            alpha_1: 2.0,
            beta_1: 0.1,
            t0_1: 0.0,
            alpha_2: 1.0,
            beta_2: 0.2,
            t0_2: 0.0,
        };
        assert_relative_eq!(params.value(params.t0_1), 0.0, epsilon = 1e-12);
        assert_relative_eq!(params.value(1e4), params.plateau(), max_relative = 1e-9);
    }

    #[test]
    fn validity_rejects_the_documented_degenerate_sets() {
        let valid = Parameters {
            alpha_1: 2.0,
            beta_1: 0.1,
            t0_1: 0.0,
            alpha_2: 1.0,
            beta_2: 0.2,
            t0_2: 1.0,
        };
        assert!(valid.is_valid(10.0));

        let all_zero = Parameters {
            alpha_1: 0.0,
            beta_1: 0.0,
            t0_1: 0.0,
            alpha_2: 0.0,
            beta_2: 0.0,
            t0_2: 0.0,
        };
        assert!(!all_zero.is_valid(10.0));

        let mixed_signs = Parameters {
            alpha_2: -1.0,
            ..valid
        };
        assert!(!mixed_signs.is_valid(10.0));

        let negative_rate = Parameters {
            beta_1: -0.1,
            ..valid
        };
        assert!(!negative_rate.is_valid(10.0));

        // Plateau at or above the bound.
        assert!(!valid.is_valid(3.0));
    }

    #[test]
    fn random_restarts_track_the_reaction_sign() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);

        for _ in 0..20 {
            let params = Parameters::random(&mut rng, -8.0, 0.0, 100.0);
            assert!(params.alpha_1 <= 0.0);
            assert!(params.alpha_2 <= 0.0);
            assert!(params.beta_1 >= 0.0);
            assert!(params.beta_2 >= 0.0);
            assert!((-20.0..20.0).contains(&params.t0_1));
        }
    }
}
