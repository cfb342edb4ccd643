//! Weighted least squares on binned data.
//!
//! Models linear in their parameters are solved in closed form through the
//! normal equations. Everything else is minimized on the chi-square, by
//! default with projected Levenberg–Marquardt steps, with the covariance
//! taken from the Gauss–Newton approximation `(JᵀWJ)⁺` at the minimum.

use nalgebra::{DMatrix, DVector};
use yf_core::{Error, FitResult, Result};
use yf_hist::Histogram1D;

use crate::model::{CurveModel, InitialGuess};
use crate::optimizer::{BoundedLbfgs, FitAlgorithm, MinimizerConfig, Minimum, Objective};

/// Points `(x, y, σ)` entering a chi-square.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitData {
    x: Vec<f64>,
    y: Vec<f64>,
    sigma: Vec<f64>,
}

impl FitData {
    /// Bin centres, contents and errors. Bins with non-positive error are skipped.
    pub fn from_histogram(hist: &Histogram1D) -> Self {
        let mut data = Self::default();
        for (i, (&y, &e)) in hist.counts().iter().zip(hist.errors()).enumerate() {
            if e > 0.0 && e.is_finite() && y.is_finite() {
                data.x.push(hist.edges().center(i));
                data.y.push(y);
                data.sigma.push(e);
            }
        }
        data
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// True when there are no points.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// `Σ ((y - f(x)) / σ)²`.
    pub fn chi2(&self, model: &dyn CurveModel, params: &[f64]) -> f64 {
        self.iter()
            .map(|(x, y, s)| {
                let r = (y - model.value(x, params)) / s;
                r * r
            })
            .sum()
    }

    fn iter(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        self.x.iter().zip(&self.y).zip(&self.sigma).map(|((&x, &y), &s)| (x, y, s))
    }

    fn require(&self, n_params: usize) -> Result<()> {
        if self.len() < n_params {
            return Err(Error::Computation(format!(
                "{} usable points for {n_params} parameters",
                self.len()
            )));
        }
        Ok(())
    }
}

/// Closed-form fit of a model that is linear in its parameters.
pub fn fit_linear(model: &dyn CurveModel, data: &FitData) -> Result<FitResult> {
    let n = model.n_params();
    data.require(n)?;

    let zeros = vec![0.0; n];
    let mut row = vec![0.0; n];
    let mut a = DMatrix::<f64>::zeros(n, n);
    let mut b = DVector::<f64>::zeros(n);
    for (x, y, s) in data.iter() {
        model.gradient(x, &zeros, &mut row);
        let w = 1.0 / (s * s);
        for i in 0..n {
            b[i] += w * row[i] * y;
            for j in 0..n {
                a[(i, j)] += w * row[i] * row[j];
            }
        }
    }

    let chol = a
        .cholesky()
        .ok_or_else(|| Error::Computation("singular normal matrix in linear fit".into()))?;
    let params: Vec<f64> = chol.solve(&b).iter().copied().collect();
    let cov = chol.inverse();

    let chi2 = data.chi2(model, &params);
    let uncertainties = (0..n).map(|i| cov[(i, i)].max(0.0).sqrt()).collect();
    Ok(FitResult::new(params, uncertainties, chi2, data.len() as i64 - n as i64, true, 1)
        .with_covariance(row_major(&cov)))
}

/// Chi-square in rescaled coordinates `q = p / scale`.
struct ScaledChi2<'a> {
    model: &'a dyn CurveModel,
    data: &'a FitData,
    scales: &'a [f64],
}

impl ScaledChi2<'_> {
    fn unscale(&self, q: &[f64]) -> Vec<f64> {
        q.iter().zip(self.scales).map(|(q, s)| q * s).collect()
    }
}

impl Objective for ScaledChi2<'_> {
    fn value(&self, q: &[f64]) -> Result<f64> {
        let p = self.unscale(q);
        let chi2 = self.data.chi2(self.model, &p);
        if chi2.is_finite() {
            Ok(chi2)
        } else {
            Err(Error::Computation("non-finite chi2".into()))
        }
    }

    fn gradient(&self, q: &[f64]) -> Result<Vec<f64>> {
        let (_, jtr) = normal_equations(self.model, self.data, &self.unscale(q), self.scales);
        Ok(jtr.iter().map(|g| -2.0 * g).collect())
    }
}

/// `(JᵀJ, Jᵀr)` for the weighted residuals `r = (y - f) / σ`, with
/// `J = ∂f/∂p · diag(scales) / σ`.
fn normal_equations(
    model: &dyn CurveModel,
    data: &FitData,
    params: &[f64],
    scales: &[f64],
) -> (DMatrix<f64>, DVector<f64>) {
    let n = params.len();
    let mut df = vec![0.0; n];
    let mut normal = DMatrix::<f64>::zeros(n, n);
    let mut jtr = DVector::<f64>::zeros(n);
    for (x, y, s) in data.iter() {
        model.gradient(x, params, &mut df);
        let r = (y - model.value(x, params)) / s;
        for k in 0..n {
            df[k] *= scales[k] / s;
        }
        for i in 0..n {
            jtr[i] += df[i] * r;
            for j in 0..n {
                normal[(i, j)] += df[i] * df[j];
            }
        }
    }
    (normal, jtr)
}

const MIN_DAMPING: f64 = 1e-12;
const MAX_DAMPING: f64 = 1e12;
const STEP_TOL: f64 = 1e-5;

fn clamp_to(q: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    q.iter().zip(bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

/// Solve `(JᵀJ + λ·diag(JᵀJ)) δ = Jᵀr` over the free parameters; pinned ones get `δ = 0`.
fn damped_step(
    normal: &DMatrix<f64>,
    jtr: &DVector<f64>,
    free: &[bool],
    lambda: f64,
    floor: f64,
) -> Option<DVector<f64>> {
    let n = normal.nrows();
    let system = DMatrix::from_fn(n, n, |a, b| match (free[a], free[b]) {
        (true, true) if a == b => normal[(a, a)] + lambda * normal[(a, a)].max(floor),
        (true, true) => normal[(a, b)],
        _ if a == b => 1.0,
        _ => 0.0,
    });
    let rhs = DVector::from_fn(n, |k, _| if free[k] { jtr[k] } else { 0.0 });
    system.cholesky().map(|chol| chol.solve(&rhs))
}

/// Levenberg–Marquardt on `objective` in scaled coordinates, projected onto `bounds`.
///
/// Parameters sitting on a bound with the descent direction pointing outward
/// are held fixed for the step. Damping shrinks by 10 after every accepted
/// step and grows by 10 after every rejected one; running out of damping
/// means no step lowers the chi-square any more.
fn levenberg_marquardt(
    objective: &ScaledChi2<'_>,
    q0: &[f64],
    bounds: &[(f64, f64)],
    config: &MinimizerConfig,
) -> Result<Minimum> {
    let n = q0.len();
    let mut q = clamp_to(q0, bounds);
    let mut chi2 = objective.value(&q)?;
    let mut n_fev = 1;
    let mut n_iter = 0;
    let mut lambda = 1e-3;
    let mut converged = false;
    let mut message = String::from("maximum number of iterations reached");

    while n_iter < config.max_iter {
        n_iter += 1;
        let (normal, jtr) = normal_equations(objective.model, objective.data, &objective.unscale(&q), objective.scales);
        let free: Vec<bool> = (0..n)
            .map(|k| {
                let (lo, hi) = bounds[k];
                !((q[k] <= lo && jtr[k] < 0.0) || (q[k] >= hi && jtr[k] > 0.0))
            })
            .collect();
        let floor = (0..n).map(|k| normal[(k, k)]).fold(0.0_f64, f64::max).max(f64::MIN_POSITIVE) * 1e-12;

        let mut accepted = None;
        while lambda <= MAX_DAMPING {
            if let Some(delta) = damped_step(&normal, &jtr, &free, lambda, floor) {
                let moved: Vec<f64> = q.iter().zip(delta.iter()).map(|(a, d)| a + d).collect();
                let trial = clamp_to(&moved, bounds);
                n_fev += 1;
                if let Ok(trial_chi2) = objective.value(&trial)
                    && trial_chi2 < chi2
                {
                    accepted = Some((trial, trial_chi2));
                    break;
                }
            }
            lambda *= 10.0;
        }

        let Some((trial, trial_chi2)) = accepted else {
            converged = true;
            message = "no step lowers the chi-square".into();
            break;
        };
        let decrease = chi2 - trial_chi2;
        let step = q.iter().zip(&trial).map(|(a, b)| (a - b).abs()).fold(0.0_f64, f64::max);
        q = trial;
        chi2 = trial_chi2;
        lambda = (lambda / 10.0).max(MIN_DAMPING);
        if decrease <= config.tol * chi2.max(1.0) && step <= STEP_TOL {
            converged = true;
            message = "relative chi-square decrease below tolerance".into();
            break;
        }
    }

    Ok(Minimum { parameters: q, fval: chi2, n_iter, n_fev, converged, message })
}

/// Nonlinear weighted least squares with box constraints.
#[derive(Debug, Clone, Default)]
pub struct CurveFitter {
    config: MinimizerConfig,
}

impl CurveFitter {
    /// Fitter using the given minimizer settings.
    pub fn new(config: MinimizerConfig) -> Self {
        Self { config }
    }

    /// Fit `model` to `data` starting from `guess`.
    pub fn fit(&self, model: &dyn CurveModel, guess: &InitialGuess, data: &FitData) -> Result<FitResult> {
        let n = model.n_params();
        if guess.values.len() != n || guess.scales.len() != n || guess.bounds.len() != n {
            return Err(Error::Validation(format!(
                "initial guess does not match a {n}-parameter model"
            )));
        }
        data.require(n)?;
        if guess.scales.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(Error::Validation("parameter scales must be positive".into()));
        }

        let scales = &guess.scales;
        let q0: Vec<f64> = guess.values.iter().zip(scales).map(|(v, s)| v / s).collect();
        let q_bounds: Vec<(f64, f64)> =
            guess.bounds.iter().zip(scales).map(|(&(lo, hi), s)| (lo / s, hi / s)).collect();

        let objective = ScaledChi2 { model, data, scales };
        let minimum = match self.config.algorithm {
            FitAlgorithm::LevenbergMarquardt => levenberg_marquardt(&objective, &q0, &q_bounds, &self.config)?,
            FitAlgorithm::Lbfgs => BoundedLbfgs::new(self.config).minimize(&objective, &q0, &q_bounds)?,
        };
        let params = objective.unscale(&minimum.parameters);
        if !minimum.converged {
            log::debug!("curve fit stopped without convergence: {}", minimum.message);
        }

        let (normal, _) = normal_equations(model, data, &params, scales);
        let mut cov = pseudo_inverse(&normal)
            .ok_or_else(|| Error::Computation("normal matrix has no usable eigenvalues".into()))?;
        for i in 0..n {
            for j in 0..n {
                cov[(i, j)] *= scales[i] * scales[j];
            }
        }
        let uncertainties = (0..n).map(|i| cov[(i, i)].max(0.0).sqrt()).collect();

        Ok(FitResult::new(
            params,
            uncertainties,
            minimum.fval,
            data.len() as i64 - n as i64,
            minimum.converged,
            minimum.n_fev,
        )
        .with_covariance(row_major(&cov)))
    }
}

/// Eigenvalues below this fraction of the largest are treated as zero.
const EIGEN_RCOND: f64 = 1e-10;

/// Pseudo-inverse of a symmetric positive semi-definite matrix.
///
/// Directions the data do not constrain (the width under a zero amplitude,
/// two Gaussians with equal widths) are dropped instead of inverted, so they
/// get zero variance and leave well-defined combinations such as the peak
/// integral unaffected.
fn pseudo_inverse(normal: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = normal.nrows();
    let eigen = normal.clone().try_symmetric_eigen(f64::EPSILON, 1000)?;
    let largest = eigen.eigenvalues.iter().copied().fold(0.0_f64, f64::max);
    if !(largest > 0.0 && largest.is_finite()) {
        return None;
    }
    let q = &eigen.eigenvectors;
    let mut inverse = DMatrix::<f64>::zeros(n, n);
    for (k, &lambda) in eigen.eigenvalues.iter().enumerate() {
        if lambda > EIGEN_RCOND * largest {
            for i in 0..n {
                for j in 0..n {
                    inverse[(i, j)] += q[(i, k)] * q[(j, k)] / lambda;
                }
            }
        }
    }
    Some(inverse)
}

fn row_major(m: &DMatrix<f64>) -> Vec<f64> {
    let n = m.nrows();
    (0..n).flat_map(|i| (0..m.ncols()).map(move |j| m[(i, j)])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Component, LinearBackground, PeakModel};
    use approx::assert_relative_eq;
    use yf_core::BinEdges;

    fn line_hist(a0: f64, a1: f64, err: f64) -> Histogram1D {
        let edges = BinEdges::uniform(10, 0.0, 1.0).unwrap();
        let counts = edges.centers().iter().map(|x| a0 + a1 * x).collect();
        Histogram1D::new(edges, counts, vec![err; 10]).unwrap()
    }

    #[test]
    fn linear_fit_recovers_exact_line() {
        let hist = line_hist(3.0, -2.0, 0.5);
        let line = LinearBackground::new(0.5);
        let fit = fit_linear(&line, &FitData::from_histogram(&hist)).unwrap();
        let (a0, a1) = line.standard(&fit.parameters);
        assert_relative_eq!(a0, 3.0, epsilon = 1e-10);
        assert_relative_eq!(a1, -2.0, epsilon = 1e-10);
        assert_relative_eq!(fit.chi2, 0.0, epsilon = 1e-12);
        assert_eq!(fit.ndf, 8);
        // Centred pivot decorrelates the two parameters on a symmetric range.
        assert_relative_eq!(fit.covariance_at(0, 1), 0.0, epsilon = 1e-12);
        assert_relative_eq!(fit.uncertainties[0], 0.5 / 10f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn zero_error_bins_are_excluded() {
        let hist = line_hist(1.0, 0.0, 1.0).with_zeroed_bins(2..8);
        let data = FitData::from_histogram(&hist);
        assert_eq!(data.len(), 4);
        let fit = fit_linear(&LinearBackground::new(0.5), &data).unwrap();
        assert_eq!(fit.ndf, 2);
    }

    #[test]
    fn linear_fit_needs_two_points() {
        let hist = line_hist(1.0, 0.0, 1.0).with_zeroed_bins(1..10);
        let err = fit_linear(&LinearBackground::new(0.5), &FitData::from_histogram(&hist));
        assert!(matches!(err, Err(Error::Computation(_))));
    }

    fn noiseless_peak() -> (Histogram1D, [f64; 5]) {
        let edges = BinEdges::uniform(40, 0.44, 0.56).unwrap();
        let truth = [0.498, 80.0, 0.006, 4.0, 10.0];
        let curve = PeakModel::SingleGaussian.curve(0.5, Component::Full);
        let counts: Vec<f64> = edges.centers().iter().map(|&x| curve.value(x, &truth)).collect();
        let errors = counts.iter().map(|c: &f64| c.sqrt()).collect();
        (Histogram1D::new(edges, counts, errors).unwrap(), truth)
    }

    #[test]
    fn gaussian_fit_recovers_noiseless_peak() {
        let (hist, truth) = noiseless_peak();
        let curve = PeakModel::SingleGaussian.curve(0.5, Component::Full);
        let guess = PeakModel::SingleGaussian.initial_guesses(&hist, [4.0, 0.0]).remove(0);
        let fit = CurveFitter::default().fit(&curve, &guess, &FitData::from_histogram(&hist)).unwrap();
        assert!(fit.converged);
        assert!(fit.n_evaluations > 0);
        assert_relative_eq!(fit.parameters[0], truth[0], epsilon = 2e-4);
        assert_relative_eq!(fit.parameters[1], truth[1], max_relative = 1e-2);
        assert_relative_eq!(fit.parameters[2], truth[2], max_relative = 1e-2);
        assert!(fit.chi2 < 1e-3, "chi2 = {}", fit.chi2);
        assert!(fit.uncertainties.iter().all(|u| u.is_finite() && *u > 0.0));
    }

    #[test]
    fn lbfgs_is_selectable() {
        let (hist, truth) = noiseless_peak();
        let curve = PeakModel::SingleGaussian.curve(0.5, Component::Full);
        let guess = PeakModel::SingleGaussian.initial_guesses(&hist, [4.0, 0.0]).remove(0);
        let config = MinimizerConfig { algorithm: FitAlgorithm::Lbfgs, ..Default::default() };
        let fit = CurveFitter::new(config).fit(&curve, &guess, &FitData::from_histogram(&hist)).unwrap();
        assert!(fit.n_evaluations > 0);
        assert_relative_eq!(fit.parameters[1], truth[1], max_relative = 0.1);
        assert_relative_eq!(fit.parameters[2], truth[2], max_relative = 0.1);
    }

    #[test]
    fn pseudo_inverse_drops_null_directions() {
        // Two identical columns: only their sum is constrained.
        let normal = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let inv = pseudo_inverse(&normal).unwrap();
        for v in inv.iter() {
            assert_relative_eq!(*v, 0.25, epsilon = 1e-12);
        }
        // Full rank falls back to the ordinary inverse.
        let inv = pseudo_inverse(&DMatrix::from_row_slice(2, 2, &[4.0, 0.0, 0.0, 2.0])).unwrap();
        assert_relative_eq!(inv[(0, 0)], 0.25, epsilon = 1e-12);
        assert_relative_eq!(inv[(1, 1)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(inv[(0, 1)], 0.0, epsilon = 1e-12);
        assert!(pseudo_inverse(&DMatrix::zeros(2, 2)).is_none());
    }

    #[test]
    fn fitter_rejects_mismatched_guess() {
        let hist = line_hist(1.0, 0.0, 1.0);
        let curve = PeakModel::SingleGaussian.curve(0.5, Component::Full);
        let guess = InitialGuess { values: vec![0.5], bounds: vec![(0.0, 1.0)], scales: vec![1.0] };
        let err = CurveFitter::default().fit(&curve, &guess, &FitData::from_histogram(&hist));
        assert!(matches!(err, Err(Error::Validation(_))));
    }
}
