//! Integrals of fitted curves with propagated uncertainty.

use yf_core::FitResult;

use crate::model::CurveModel;

/// Integral of `model` at the fitted parameters over `[lo, hi]`, and its error.
///
/// The error is `sqrt(gᵀ C g)` with `g` the central-difference gradient of the
/// integral with respect to the parameters and `C` the fit covariance.
pub fn integrate(model: &dyn CurveModel, fit: &FitResult, lo: f64, hi: f64) -> (f64, f64) {
    let params = &fit.parameters;
    let value = model.integral(lo, hi, params);

    let n = params.len();
    let mut shifted = params.clone();
    let grad: Vec<f64> = (0..n)
        .map(|k| {
            let h = 1e-6 * params[k].abs().max(fit.uncertainties[k].abs()).max(1e-9);
            shifted[k] = params[k] + h;
            let up = model.integral(lo, hi, &shifted);
            shifted[k] = params[k] - h;
            let down = model.integral(lo, hi, &shifted);
            shifted[k] = params[k];
            (up - down) / (2.0 * h)
        })
        .collect();

    let mut variance = 0.0;
    for i in 0..n {
        for j in 0..n {
            variance += grad[i] * fit.covariance_at(i, j) * grad[j];
        }
    }
    (value, variance.max(0.0).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinearBackground;
    use approx::assert_relative_eq;

    #[test]
    fn line_integral_error_uses_covariance() {
        // b0 = 2 ± 0.1, b1 = 1 ± 0.2, uncorrelated, pivot 0.
        let fit = FitResult::new(vec![2.0, 1.0], vec![0.1, 0.2], 0.0, 5, true, 1)
            .with_covariance(vec![0.01, 0.0, 0.0, 0.04]);
        let (v, e) = integrate(&LinearBackground::new(0.0), &fit, 0.0, 2.0);
        assert_relative_eq!(v, 6.0, epsilon = 1e-12);
        // ∂I/∂b0 = 2, ∂I/∂b1 = 2.
        assert_relative_eq!(e, (4.0 * 0.01 + 4.0 * 0.04_f64).sqrt(), epsilon = 1e-7);
    }

    #[test]
    fn anticorrelated_parameters_reduce_error() {
        let cov = vec![0.01, -0.009, -0.009, 0.01];
        let fit = FitResult::new(vec![1.0, 1.0], vec![0.1, 0.1], 0.0, 5, true, 1).with_covariance(cov);
        let (_, e) = integrate(&LinearBackground::new(0.0), &fit, 0.0, 2.0);
        // g = (2, 2): 4·0.01 + 4·0.01 - 8·0.009
        assert_relative_eq!(e, (0.08_f64 - 0.072).sqrt(), epsilon = 1e-7);
    }
}
