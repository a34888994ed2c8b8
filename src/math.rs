use num_traits::Float;

/// Result of a closed-form ordinary least-squares line fit.
#[derive(Clone, Copy, Debug)]
pub struct LinearFit<F> {
    pub slope: F,
    pub intercept: F,
    /// Population standard deviation of the residuals.
    pub sigma: F,
}

impl<F: Float> LinearFit<F> {
    /// Value of the fitted line at `x`.
    pub fn predict(&self, x: F) -> F {
        self.slope * x + self.intercept
    }
}

/// Fit `y = slope * x + intercept` minimizing the sum of squared residuals.
///
/// Uses the standard closed-form sums; no iteration. A degenerate abscissa
/// (all `x` equal) yields a horizontal line through the mean of `y` instead
/// of NaN.
///
/// # Panics
/// In debug builds when the sequences are empty or of unequal length. With
/// `n = 0` the fit is undefined and the caller must guard.
///
/// # Examples
///
/// ```
/// use response_fit::math::fit_line;
///
/// let x = [0.0_f64, 1.0, 2.0];
/// let y = [2.0, 5.0, 8.0];
/// let fit = fit_line(&x, &y);
///
/// assert!((fit.slope - 3.0).abs() < 1e-12);
/// assert!((fit.intercept - 2.0).abs() < 1e-12);
/// assert!(fit.sigma < 1e-12);
/// ```
pub fn fit_line<F: Float>(x: &[F], y: &[F]) -> LinearFit<F> {
    debug_assert!(!x.is_empty(), "line fit is undefined for n = 0");
    debug_assert_eq!(x.len(), y.len());

    let n = F::from(x.len()).expect("sample count must fit the float type");
    let sum_x = x.iter().fold(F::zero(), |acc, &v| acc + v);
    let sum_y = y.iter().fold(F::zero(), |acc, &v| acc + v);
    let sum_xx = x.iter().fold(F::zero(), |acc, &v| acc + v * v);
    let sum_xy = x
        .iter()
        .zip(y.iter())
        .fold(F::zero(), |acc, (&xi, &yi)| acc + xi * yi);

    let denominator = n * sum_xx - sum_x * sum_x;
    let (slope, intercept) = if denominator.abs() > F::epsilon() {
        let slope = (n * sum_xy - sum_x * sum_y) / denominator;
        (slope, (sum_y - slope * sum_x) / n)
    } else {
        (F::zero(), sum_y / n)
    };

    let residual_sum = x.iter().zip(y.iter()).fold(F::zero(), |acc, (&xi, &yi)| {
        let r = yi - (slope * xi + intercept);
        acc + r * r
    });

    LinearFit {
        slope,
        intercept,
        sigma: (residual_sum / n).sqrt(),
    }
}
